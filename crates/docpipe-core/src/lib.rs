//! Core domain model for docpipe: query windows, staging paths, API settings
//! and the fixed output column set.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{Datelike, Months, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

/// Columns of the output table, in header order.
pub const FIELDS_TO_KEEP: [&str; 18] = [
    "title",
    "publisher",
    "type",
    "DOI",
    "ISBN",
    "author",
    "page",
    "page-count",
    "references-count",
    "is-referenced-by-count",
    "published-date",
    "journal-issue.issue",
    "indexed-date",
    "subject",
    "editor",
    "event.name",
    "event.location",
    "publisher-location",
];

/// Date range plus search terms scoping a single pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub search_terms: String,
}

impl QueryWindow {
    pub fn new(start: NaiveDate, end: NaiveDate, search_terms: impl Into<String>) -> Self {
        Self {
            start,
            end,
            search_terms: search_terms.into(),
        }
    }

    /// The calendar month that ends on the first day of `today`'s month.
    pub fn previous_month(today: NaiveDate, search_terms: impl Into<String>) -> Self {
        let end = first_of_month(today);
        let start = end - Months::new(1);
        Self::new(start, end, search_terms)
    }

    /// `YYYYMMDD_YYYYMMDD`, used as the file stem for every artifact of the run.
    pub fn file_stem(&self) -> String {
        format!(
            "{}_{}",
            self.start.format("%Y%m%d"),
            self.end.format("%Y%m%d")
        )
    }

    /// Publication date filter understood by the search API.
    pub fn date_filter(&self, filter_fields: &str) -> String {
        let range = format!(
            "from-pub-date:{},until-pub-date:{}",
            self.start.format("%Y-%m-%d"),
            self.end.format("%Y-%m-%d")
        );
        let extra = filter_fields.trim();
        if extra.is_empty() {
            range
        } else {
            format!("{range},{extra}")
        }
    }

    pub fn raw_store_path(&self, data_dir: &Path) -> PathBuf {
        self.artifact_path(data_dir, "data_lake", "json")
    }

    pub fn output_table_path(&self, data_dir: &Path) -> PathBuf {
        self.artifact_path(data_dir, "data_warehouse", "csv")
    }

    pub fn report_path(&self, data_dir: &Path) -> PathBuf {
        self.artifact_path(data_dir, "runs", "json")
    }

    fn artifact_path(&self, data_dir: &Path, area: &str, extension: &str) -> PathBuf {
        data_dir
            .join(area)
            .join(search_terms_dir(&self.search_terms))
            .join(format!("{}.{extension}", self.file_stem()))
    }
}

impl std::fmt::Display for QueryWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{} .. {}]", self.search_terms, self.start, self.end)
    }
}

fn search_terms_dir(search_terms: &str) -> String {
    let cleaned = search_terms
        .trim()
        .chars()
        .map(|c| if matches!(c, '/' | '\\') { '_' } else { c })
        .collect::<String>();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "_".to_string()
    } else {
        cleaned
    }
}

pub fn first_of_month(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

/// Contiguous monthly windows from the month containing `first` up to the last
/// month that has fully elapsed on `today`.
pub fn monthly_windows(first: NaiveDate, today: NaiveDate, search_terms: &str) -> Vec<QueryWindow> {
    let mut windows = Vec::new();
    let mut start = first_of_month(first);
    while let Some(end) = start.checked_add_months(Months::new(1)) {
        if end > today {
            break;
        }
        windows.push(QueryWindow::new(start, end, search_terms));
        start = end;
    }
    windows
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("http_api_settings.params.{0} is missing")]
    MissingParam(&'static str),
    #[error("http_api_settings.params.{name} must be a non-negative integer, got {value}")]
    InvalidParam { name: &'static str, value: String },
    #[error("http_api_settings.params.rows must be greater than zero")]
    ZeroRows,
}

/// Connection settings for the search API, resolved once per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiSettings {
    pub base_url: String,
    #[serde(default)]
    pub params: Map<String, JsonValue>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub filter_fields: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub offset: u64,
    pub rows: u64,
}

impl ApiSettings {
    pub fn pagination(&self) -> Result<Pagination, SettingsError> {
        let offset = self.integer_param("offset")?;
        let rows = self.integer_param("rows")?;
        if rows == 0 {
            return Err(SettingsError::ZeroRows);
        }
        Ok(Pagination { offset, rows })
    }

    fn integer_param(&self, name: &'static str) -> Result<u64, SettingsError> {
        let value = self
            .params
            .get(name)
            .ok_or(SettingsError::MissingParam(name))?;
        let parsed = match value {
            JsonValue::Number(n) => n.as_u64(),
            JsonValue::String(s) => s.trim().parse().ok(),
            _ => None,
        };
        parsed.ok_or_else(|| SettingsError::InvalidParam {
            name,
            value: value.to_string(),
        })
    }

    /// Query string pairs for one page request: the configured params with
    /// `filter`, `query` and `offset` set for this window and page.
    pub fn query_pairs(&self, window: &QueryWindow, offset: u64) -> Vec<(String, String)> {
        let mut params = self.params.clone();
        params.insert(
            "filter".to_string(),
            JsonValue::String(window.date_filter(&self.filter_fields)),
        );
        params.insert(
            "query".to_string(),
            JsonValue::String(window.search_terms.clone()),
        );
        params.insert("offset".to_string(), JsonValue::from(offset));
        params
            .into_iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k, param_text(&v)))
            .collect()
    }
}

fn param_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}
