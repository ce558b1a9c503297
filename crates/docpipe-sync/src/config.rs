use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use docpipe_core::ApiSettings;
use serde::Deserialize;

/// The named values read from the settings file.
#[derive(Debug, Clone, Deserialize)]
pub struct SettingsFile {
    pub http_api_settings: ApiSettings,
    #[serde(default)]
    pub search_terms: Option<String>,
}

impl SettingsFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Everything a run needs, resolved once and passed to every step.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub api: ApiSettings,
    pub search_terms: String,
    pub scheduler_enabled: bool,
    pub cron: String,
    pub start_date: NaiveDate,
    pub catchup: bool,
    pub run_timeout: Duration,
    pub user_agent: String,
    pub http_timeout: Duration,
}

pub const DEFAULT_SETTINGS_PATH: &str = "docpipe.yaml";
pub const DEFAULT_CRON: &str = "0 0 0 1 * *";
pub const DEFAULT_START_DATE: &str = "2024-02-01";

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        let settings_path = std::env::var("DOCPIPE_SETTINGS")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_SETTINGS_PATH));
        let settings = SettingsFile::load(&settings_path)?;
        Self::from_settings(settings, |key| std::env::var(key).ok())
    }

    /// Combine the settings file with process settings looked up through `env`.
    pub fn from_settings(
        settings: SettingsFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let search_terms = env("DOCPIPE_SEARCH_TERMS")
            .or(settings.search_terms)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let Some(search_terms) = search_terms else {
            bail!("search_terms is not configured (settings file or DOCPIPE_SEARCH_TERMS)");
        };

        settings
            .http_api_settings
            .pagination()
            .context("validating http_api_settings")?;

        let start_date = env("DOCPIPE_START_DATE").unwrap_or_else(|| DEFAULT_START_DATE.to_string());
        let start_date = NaiveDate::parse_from_str(start_date.trim(), "%Y-%m-%d")
            .with_context(|| format!("parsing DOCPIPE_START_DATE {start_date:?}"))?;

        Ok(Self {
            data_dir: env("DOCPIPE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            api: settings.http_api_settings,
            search_terms,
            scheduler_enabled: env("DOCPIPE_SCHEDULER_ENABLED")
                .map(|v| is_truthy(&v))
                .unwrap_or(false),
            cron: env("DOCPIPE_CRON").unwrap_or_else(|| DEFAULT_CRON.to_string()),
            start_date,
            catchup: env("DOCPIPE_CATCHUP").map(|v| is_truthy(&v)).unwrap_or(true),
            run_timeout: Duration::from_secs(
                env("DOCPIPE_RUN_TIMEOUT_SECS")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(60 * 60),
            ),
            user_agent: env("DOCPIPE_USER_AGENT").unwrap_or_else(|| "docpipe/0.1".to_string()),
            http_timeout: Duration::from_secs(
                env("DOCPIPE_HTTP_TIMEOUT_SECS")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(30),
            ),
        })
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "True" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SETTINGS_YAML: &str = r#"
search_terms: test search terms
http_api_settings:
  base_url: https://example.com/api/v1
  params:
    query.author: test author
    rows: 10
    offset: 0
  headers:
    Authorization: Bearer abcdefg
  filter_fields: test filter fields
"#;

    fn settings() -> SettingsFile {
        serde_yaml::from_str(SETTINGS_YAML).expect("settings yaml")
    }

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_without_environment() {
        let config = PipelineConfig::from_settings(settings(), env_of(&[])).unwrap();

        assert_eq!(config.search_terms, "test search terms");
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.cron, DEFAULT_CRON);
        assert_eq!(config.start_date, NaiveDate::from_ymd_opt(2024, 2, 1).unwrap());
        assert!(config.catchup);
        assert!(!config.scheduler_enabled);
        assert_eq!(config.run_timeout, Duration::from_secs(3600));
        assert_eq!(config.api.headers["Authorization"], "Bearer abcdefg");
    }

    #[test]
    fn environment_overrides_file_values() {
        let config = PipelineConfig::from_settings(
            settings(),
            env_of(&[
                ("DOCPIPE_SEARCH_TERMS", "rust"),
                ("DOCPIPE_DATA_DIR", "/srv/docpipe"),
                ("DOCPIPE_SCHEDULER_ENABLED", "true"),
                ("DOCPIPE_CATCHUP", "0"),
                ("DOCPIPE_RUN_TIMEOUT_SECS", "90"),
            ]),
        )
        .unwrap();

        assert_eq!(config.search_terms, "rust");
        assert_eq!(config.data_dir, PathBuf::from("/srv/docpipe"));
        assert!(config.scheduler_enabled);
        assert!(!config.catchup);
        assert_eq!(config.run_timeout, Duration::from_secs(90));
    }

    #[test]
    fn missing_search_terms_is_an_error() {
        let mut file = settings();
        file.search_terms = None;
        assert!(PipelineConfig::from_settings(file, env_of(&[])).is_err());
    }

    #[test]
    fn invalid_pagination_is_rejected_up_front() {
        let mut file = settings();
        file.http_api_settings.params.remove("rows");
        let err = PipelineConfig::from_settings(file, env_of(&[])).unwrap_err();
        assert!(format!("{err:#}").contains("rows"));
    }
}
