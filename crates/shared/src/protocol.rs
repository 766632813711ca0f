use serde::{Deserialize, Serialize};

/// Dtype prefixes whose parameters (time unit, inner type, categories) are
/// dropped before a column type is shown.
const PARAMETERIZED_DTYPES: &[&str] = &[
    "Categorical",
    "Datetime",
    "Duration",
    "List",
    "Struct",
    "Enum",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub dtype: String,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, dtype: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dtype: dtype.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataInfo {
    pub name: String,
    #[serde(default)]
    pub created: Option<String>,
    #[serde(default)]
    pub modified: Option<String>,
    pub size: u64,
    pub row_groups: u64,
    pub compression: String,
    pub total_nulls: u64,
}

/// A materialized page set of one dataset or query result.
///
/// `dimensions` is the full `(rows, columns)` size reported by the backend,
/// while `rows` holds only the pages fetched so far. Cells cross the
/// boundary already stringified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetView {
    #[serde(alias = "shape")]
    pub dimensions: (usize, usize),
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MetadataInfo>,
}

impl DatasetView {
    pub fn total_rows(&self) -> usize {
        self.dimensions.0
    }

    pub fn loaded_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn is_complete(&self) -> bool {
        self.rows.len() >= self.dimensions.0
    }

    pub fn clean_dtypes(&mut self) {
        for column in &mut self.columns {
            column.dtype = clean_dtype(&column.dtype).to_string();
        }
    }
}

pub fn clean_dtype(dtype: &str) -> &str {
    PARAMETERIZED_DTYPES
        .iter()
        .copied()
        .find(|prefix| dtype.starts_with(prefix))
        .unwrap_or(dtype)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sorting {
    pub column: String,
    pub ascending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Condition {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Neq,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "between")]
    Between,
    #[serde(rename = "equals")]
    Equals,
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "contains_case_insensitive")]
    ContainsCaseInsensitive,
    #[serde(rename = "different")]
    Different,
    #[serde(rename = "is_null")]
    IsNull,
    #[serde(rename = "is_not_null")]
    IsNotNull,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Number(f64),
    Text(String),
    Range(String, String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filtering {
    pub column: String,
    pub condition: Condition,
    pub value: FilterValue,
}

/// Sorting/filtering context forwarded verbatim to the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sorting: Option<Vec<Sorting>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filtering: Option<Vec<Filtering>>,
}

impl FetchOptions {
    pub fn is_empty(&self) -> bool {
        self.sorting.as_ref().map_or(true, Vec::is_empty)
            && self.filtering.as_ref().map_or(true, Vec::is_empty)
    }
}

/// One entry of the releases feed, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub tag_name: String,
}
