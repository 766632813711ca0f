use std::{collections::HashMap, fs, path::Path};

use tracing::warn;

use crate::store::DEFAULT_PAGE_SIZE;

pub const DEFAULT_APP_NAME: &str = "tabview";
pub const CONFIG_FILE_NAME: &str = "viewer.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub page_size: usize,
    pub releases_url: Option<String>,
    pub app_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            releases_url: None,
            app_name: DEFAULT_APP_NAME.into(),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Defaults, then `viewer.toml` in `dir` when present, then the
    /// environment.
    pub fn load(dir: &Path) -> Self {
        let mut config = Self::default();
        let path = dir.join(CONFIG_FILE_NAME);
        if let Ok(raw) = fs::read_to_string(&path) {
            match toml::from_str::<HashMap<String, toml::Value>>(&raw) {
                Ok(file_cfg) => config.apply_file(&file_cfg),
                Err(err) => warn!(path = %path.display(), %err, "config: ignoring unreadable file"),
            }
        }
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    fn apply_file(&mut self, file_cfg: &HashMap<String, toml::Value>) {
        if let Some(size) = file_cfg.get("page_size").and_then(toml::Value::as_integer) {
            match usize::try_from(size) {
                Ok(size) if size > 0 => self.page_size = size,
                _ => warn!(page_size = size, "config: page_size must be positive"),
            }
        }
        if let Some(url) = file_cfg.get("releases_url").and_then(toml::Value::as_str) {
            self.releases_url = Some(url.to_string());
        }
        if let Some(name) = file_cfg.get("app_name").and_then(toml::Value::as_str) {
            self.app_name = name.to_string();
        }
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("VIEWER_PAGE_SIZE") {
            match v.trim().parse::<usize>() {
                Ok(size) if size > 0 => self.page_size = size,
                _ => warn!(value = %v, "config: ignoring invalid VIEWER_PAGE_SIZE"),
            }
        }
        if let Some(v) = lookup("VIEWER_RELEASES_URL") {
            let v = v.trim();
            self.releases_url = (!v.is_empty()).then(|| v.to_string());
        }
        if let Some(v) = lookup("VIEWER_APP_NAME") {
            if !v.trim().is_empty() {
                self.app_name = v.trim().to_string();
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
