//! Persisted display preferences.
//!
//! The file is read once at startup and rewritten on every change. Reading
//! never fails: a missing or malformed file yields defaults, and missing keys
//! are filled from the defaults.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::SettingsError;

pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const MIN_FONT_SIZE: u8 = 12;
pub const MAX_FONT_SIZE: u8 = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Light,
    #[default]
    Dark,
}

impl Theme {
    pub fn toggled(self) -> Self {
        match self {
            Self::Light => Self::Dark,
            Self::Dark => Self::Light,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FontFamily {
    #[default]
    Iosevka,
    Argon,
    Krypton,
    Neon,
    Radon,
    Xenon,
}

impl FontFamily {
    pub const ALL: [FontFamily; 6] = [
        Self::Iosevka,
        Self::Argon,
        Self::Krypton,
        Self::Neon,
        Self::Radon,
        Self::Xenon,
    ];

    pub fn next(self) -> Self {
        let index = Self::ALL
            .iter()
            .position(|font| *font == self)
            .unwrap_or(0);
        Self::ALL[(index + 1) % Self::ALL.len()]
    }

    /// Name of the installed monospace face.
    pub fn css_family(self) -> String {
        match self {
            Self::Iosevka => "IosevkaMP".to_string(),
            other => format!("Monaspace {other:?}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub theme: Theme,
    pub font_family: FontFamily,
    pub font_size: u8,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            theme: Theme::Dark,
            font_family: FontFamily::Iosevka,
            font_size: 14,
        }
    }
}

pub fn clamp_font_size(size: i32) -> u8 {
    // Clamped into a u8 range, so the cast cannot truncate.
    size.clamp(MIN_FONT_SIZE.into(), MAX_FONT_SIZE.into()) as u8
}

pub struct SettingsStore {
    path: PathBuf,
    settings: Settings,
}

impl SettingsStore {
    /// `<config dir>/<app_name>/settings.json`.
    pub fn default_path(app_name: &str) -> Result<PathBuf, SettingsError> {
        let dir = dirs::config_dir().ok_or(SettingsError::NoConfigDir)?;
        Ok(dir.join(app_name).join(SETTINGS_FILE_NAME))
    }

    pub fn open_default(app_name: &str) -> Result<Self, SettingsError> {
        Ok(Self::open(Self::default_path(app_name)?))
    }

    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let settings = match read_settings(&path) {
            Ok(Some(settings)) => settings,
            Ok(None) => {
                debug!(path = %path.display(), "settings: no file, using defaults");
                Settings::default()
            }
            Err(err) => {
                warn!(%err, "settings: falling back to defaults");
                Settings::default()
            }
        };
        Self { path, settings }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn settings(&self) -> Settings {
        self.settings
    }

    pub fn save(&self) -> Result<(), SettingsError> {
        write_settings(&self.path, &self.settings)
    }

    pub fn set_theme(&mut self, theme: Theme) {
        self.settings.theme = theme;
        self.persist();
    }

    pub fn set_font_family(&mut self, font_family: FontFamily) {
        self.settings.font_family = font_family;
        self.persist();
    }

    pub fn set_font_size(&mut self, size: i32) {
        self.settings.font_size = clamp_font_size(size);
        self.persist();
    }

    pub fn cycle_font(&mut self) -> FontFamily {
        let next = self.settings.font_family.next();
        self.set_font_family(next);
        next
    }

    pub fn increase_font_size(&mut self) -> u8 {
        self.set_font_size(i32::from(self.settings.font_size) + 1);
        self.settings.font_size
    }

    pub fn decrease_font_size(&mut self) -> u8 {
        self.set_font_size(i32::from(self.settings.font_size) - 1);
        self.settings.font_size
    }

    fn persist(&self) {
        if let Err(err) = self.save() {
            warn!(%err, "settings: failed to save");
        }
    }
}

fn read_settings(path: &Path) -> Result<Option<Settings>, SettingsError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(SettingsError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let mut settings: Settings =
        serde_json::from_str(&raw).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    settings.font_size = clamp_font_size(settings.font_size.into());
    Ok(Some(settings))
}

fn write_settings(path: &Path, settings: &Settings) -> Result<(), SettingsError> {
    let io_err = |source| SettingsError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let raw = serde_json::to_string_pretty(settings).map_err(|source| SettingsError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    fs::write(path, raw).map_err(io_err)
}

#[cfg(test)]
#[path = "tests/settings_tests.rs"]
mod tests;
