//! Backend version vs. newest published release.

use chrono::{DateTime, Utc};
use reqwest::Client;
use semver::Version;
use shared::protocol::Release;
use tracing::{info, warn};

use crate::{backend::DataBackend, error::UpdateCheckError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateStatus {
    Unknown,
    Checking,
    UpToDate,
    Available { latest: String },
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateReport {
    pub status: UpdateStatus,
    pub current: Option<String>,
    pub checked_at: DateTime<Utc>,
}

pub struct UpdateChecker {
    http: Client,
    releases_url: Option<String>,
}

impl UpdateChecker {
    pub fn new(releases_url: Option<String>) -> Self {
        Self::with_client(Client::new(), releases_url)
    }

    pub fn with_client(http: Client, releases_url: Option<String>) -> Self {
        Self { http, releases_url }
    }

    /// `tag_name` of the first (newest) entry of the releases feed.
    pub async fn latest_release(&self) -> Result<String, UpdateCheckError> {
        let url = self
            .releases_url
            .as_deref()
            .ok_or(UpdateCheckError::NoReleasesUrl)?;
        let releases: Vec<Release> = self
            .http
            .get(url)
            .header(reqwest::header::USER_AGENT, "tabview-update-check")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        releases
            .into_iter()
            .next()
            .map(|release| release.tag_name)
            .ok_or(UpdateCheckError::NoReleases)
    }

    /// Never fails: any error lands in the report's status.
    pub async fn check(&self, backend: &dyn DataBackend) -> UpdateReport {
        let current = match backend.get_version().await {
            Ok(version) => version,
            Err(err) => {
                let err = UpdateCheckError::Backend(format!("{err:#}"));
                warn!(%err, "update: version check failed");
                return UpdateReport {
                    status: UpdateStatus::Failed(err.to_string()),
                    current: None,
                    checked_at: Utc::now(),
                };
            }
        };

        let status = match self.latest_release().await {
            Ok(latest) => match compare_versions(&current, &latest) {
                Ok(status) => status,
                Err(err) => UpdateStatus::Failed(err.to_string()),
            },
            Err(err) => UpdateStatus::Failed(err.to_string()),
        };
        match &status {
            UpdateStatus::Available { latest } => {
                info!(current = %current, latest = %latest, "update: newer release available")
            }
            UpdateStatus::Failed(err) => warn!(%err, "update: version check failed"),
            _ => info!(current = %current, "update: up to date"),
        }
        UpdateReport {
            status,
            current: Some(current),
            checked_at: Utc::now(),
        }
    }
}

pub fn parse_version(raw: &str) -> Result<Version, UpdateCheckError> {
    let trimmed = raw.trim();
    let bare = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);
    Version::parse(bare).map_err(|source| UpdateCheckError::InvalidVersion {
        value: raw.to_string(),
        source,
    })
}

pub fn compare_versions(current: &str, latest: &str) -> Result<UpdateStatus, UpdateCheckError> {
    let current_version = parse_version(current)?;
    let latest_version = parse_version(latest)?;
    if latest_version > current_version {
        Ok(UpdateStatus::Available {
            latest: latest_version.to_string(),
        })
    } else {
        Ok(UpdateStatus::UpToDate)
    }
}

#[cfg(test)]
#[path = "tests/update_tests.rs"]
mod tests;
