use std::path::PathBuf;

use shared::domain::SessionId;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
    #[error("no active session")]
    NoActiveSession,
}

#[derive(Debug, Error)]
pub enum UpdateCheckError {
    #[error("no releases feed configured")]
    NoReleasesUrl,
    #[error("releases feed request failed: {0}")]
    Feed(#[from] reqwest::Error),
    #[error("releases feed is empty")]
    NoReleases,
    #[error("backend version request failed: {0}")]
    Backend(String),
    #[error("invalid version '{value}': {source}")]
    InvalidVersion {
        value: String,
        #[source]
        source: semver::Error,
    },
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("no config directory available")]
    NoConfigDir,
    #[error("failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid settings file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
