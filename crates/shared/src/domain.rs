use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

const SUPPORTED_EXTENSIONS: &[&str] = &["parquet", "csv"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Which of the two views of a session a request or read refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewMode {
    Raw,
    Query,
}

impl ViewMode {
    pub fn from_query_flag(is_query: bool) -> Self {
        if is_query {
            Self::Query
        } else {
            Self::Raw
        }
    }

    pub fn is_query(self) -> bool {
        self == Self::Query
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableLayout {
    #[default]
    Auto,
    Fixed,
}

/// Derives the tab label for a dataset: directory and last extension removed.
///
/// Both `/` and `\` count as separators so Windows paths coming from the
/// backend produce the same label as POSIX ones. A name that would become
/// empty (`.env`, `dir/`) falls back to the file name or the raw path.
pub fn display_name_from_path(path: &str) -> String {
    let file_name = path
        .rsplit(['/', '\\'])
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or(path);

    match file_name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => file_name.to_string(),
    }
}

pub fn is_supported_path(path: &str) -> bool {
    path.rsplit_once('.').is_some_and(|(_, ext)| {
        SUPPORTED_EXTENSIONS
            .iter()
            .any(|supported| ext.eq_ignore_ascii_case(supported))
    })
}

/// Picks the first openable dataset out of a drag-and-drop payload.
pub fn first_supported_path<S: AsRef<str>>(paths: &[S]) -> Option<&str> {
    paths
        .iter()
        .map(AsRef::as_ref)
        .find(|path| is_supported_path(path))
}
