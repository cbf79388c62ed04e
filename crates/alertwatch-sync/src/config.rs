use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use alertwatch_adapters::{PagingPolicy, RunDeadline, SearchParameters};
use alertwatch_storage::BackoffPolicy;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::merge::MergeConfig;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub data_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub options_path: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub cas_search_url: String,
    pub govuk_listing_url: String,
    pub daily_cron: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let workspace_root = std::env::var("ALERTWATCH_WORKSPACE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        Self {
            data_dir: std::env::var("ALERTWATCH_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join("data")),
            archive_dir: std::env::var("ALERTWATCH_ARCHIVE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join("archive")),
            options_path: std::env::var("ALERTWATCH_OPTIONS").map(PathBuf::from).ok(),
            user_agent: std::env::var("ALERTWATCH_USER_AGENT")
                .unwrap_or_else(|_| "CAS-Alert-Scraper/1.0".to_string()),
            http_timeout_secs: std::env::var("ALERTWATCH_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            cas_search_url: std::env::var("ALERTWATCH_CAS_URL")
                .unwrap_or_else(|_| "https://www.cas.mhra.gov.uk/SearchAlerts.aspx".to_string()),
            govuk_listing_url: std::env::var("ALERTWATCH_GOVUK_URL")
                .unwrap_or_else(|_| "https://www.gov.uk/drug-device-alerts".to_string()),
            daily_cron: std::env::var("ALERTWATCH_CRON")
                .unwrap_or_else(|_| "0 0 7 * * *".to_string()),
            workspace_root,
        }
    }

    pub fn reports_root(&self) -> PathBuf {
        self.workspace_root.join("reports")
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading options file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing options: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("option `{option}` out of range: {detail}")]
    OutOfRange { option: &'static str, detail: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DateRange {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

/// Per-run tunables. Unknown keys are rejected at parse time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RunOptions {
    pub search_date_range: Option<DateRange>,
    pub alert_category: Option<String>,
    pub fuzzy_match_threshold: f64,
    pub date_match_tolerance_days: u32,
    pub request_delay_seconds: f64,
    pub max_retries: u32,
    pub max_pages: u32,
    pub run_timeout_seconds: Option<u64>,
    pub archive_raw_pages: bool,
    pub fetch_detail_pages: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            search_date_range: None,
            alert_category: None,
            fuzzy_match_threshold: 0.85,
            date_match_tolerance_days: 1,
            request_delay_seconds: 2.0,
            max_retries: 3,
            max_pages: 200,
            run_timeout_seconds: None,
            archive_raw_pages: false,
            fetch_detail_pages: false,
        }
    }
}

impl RunOptions {
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let options: Self = if text.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(text)?
        };
        options.validate()?;
        Ok(options)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    /// Defaults when no file is configured.
    pub fn load_optional(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.fuzzy_match_threshold) {
            return Err(out_of_range(
                "fuzzy_match_threshold",
                format!("{} is not within 0.0..=1.0", self.fuzzy_match_threshold),
            ));
        }
        if self.date_match_tolerance_days > 30 {
            return Err(out_of_range(
                "date_match_tolerance_days",
                format!("{} is not within 0..=30", self.date_match_tolerance_days),
            ));
        }
        if !(0.0..=60.0).contains(&self.request_delay_seconds) {
            return Err(out_of_range(
                "request_delay_seconds",
                format!("{} is not within 0..=60", self.request_delay_seconds),
            ));
        }
        if self.max_retries > 10 {
            return Err(out_of_range(
                "max_retries",
                format!("{} is not within 0..=10", self.max_retries),
            ));
        }
        if !(1..=1000).contains(&self.max_pages) {
            return Err(out_of_range(
                "max_pages",
                format!("{} is not within 1..=1000", self.max_pages),
            ));
        }
        if self.run_timeout_seconds == Some(0) {
            return Err(out_of_range("run_timeout_seconds", "must be positive".to_string()));
        }
        if let Some(DateRange {
            from: Some(from),
            to: Some(to),
        }) = self.search_date_range
        {
            if from > to {
                return Err(out_of_range(
                    "search_date_range",
                    format!("from {from} is after to {to}"),
                ));
            }
        }
        Ok(())
    }

    pub fn merge_config(&self) -> MergeConfig {
        MergeConfig {
            fuzzy_threshold: self.fuzzy_match_threshold,
            date_tolerance_days: i64::from(self.date_match_tolerance_days),
        }
    }

    pub fn paging_policy(&self) -> PagingPolicy {
        PagingPolicy {
            request_delay: Duration::from_secs_f64(self.request_delay_seconds),
            max_pages: self.max_pages,
            backoff: self.backoff(),
            fetch_details: self.fetch_detail_pages,
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::with_max_retries(self.max_retries as usize)
    }

    /// Search filters in the navigator's option vocabulary.
    pub fn search_options(&self) -> BTreeMap<String, String> {
        let mut options = BTreeMap::new();
        if let Some(range) = self.search_date_range {
            if let Some(from) = range.from {
                options.insert("date_from".to_string(), from.format("%Y-%m-%d").to_string());
            }
            if let Some(to) = range.to {
                options.insert("date_to".to_string(), to.format("%Y-%m-%d").to_string());
            }
        }
        if let Some(category) = &self.alert_category {
            options.insert("category".to_string(), category.clone());
        }
        options
    }

    pub fn search_parameters(&self) -> Result<SearchParameters, ConfigError> {
        SearchParameters::from_options(&self.search_options())
            .map_err(|err| out_of_range("search_date_range", err.to_string()))
    }

    /// Must be called at the start of a run; the clock starts here.
    pub fn deadline(&self) -> RunDeadline {
        match self.run_timeout_seconds {
            Some(secs) => RunDeadline::after(Duration::from_secs(secs)),
            None => RunDeadline::unbounded(),
        }
    }
}

fn out_of_range(option: &'static str, detail: String) -> ConfigError {
    ConfigError::OutOfRange { option, detail }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_options_take_defaults() {
        let options = RunOptions::from_yaml_str("").unwrap();
        assert_eq!(options, RunOptions::default());
        assert_eq!(options.merge_config(), MergeConfig::default());
        assert_eq!(options.paging_policy().request_delay, Duration::from_secs(2));
        assert_eq!(options.paging_policy().backoff.max_retries, 3);
        assert!(!options.paging_policy().fetch_details);
    }

    #[test]
    fn recognized_options_are_applied() {
        let options = RunOptions::from_yaml_str(
            r#"
search_date_range:
  from: 2024-01-01
  to: 2024-06-30
alert_category: Medical Device Alert
fuzzy_match_threshold: 0.9
date_match_tolerance_days: 3
request_delay_seconds: 0.5
max_retries: 5
max_pages: 20
run_timeout_seconds: 600
archive_raw_pages: true
fetch_detail_pages: true
"#,
        )
        .unwrap();
        assert_eq!(options.max_pages, 20);
        assert!(options.archive_raw_pages);
        assert!(options.paging_policy().fetch_details);
        assert_eq!(options.merge_config().date_tolerance_days, 3);
        assert_eq!(options.paging_policy().request_delay, Duration::from_millis(500));

        let params = options.search_parameters().unwrap();
        assert_eq!(params.date_from(), NaiveDate::from_ymd_opt(2024, 1, 1));
        assert_eq!(params.category(), Some("Medical Device Alert"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = RunOptions::from_yaml_str("fuzzy_threshold: 0.9\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().contains("fuzzy_threshold"));
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        for (yaml, option) in [
            ("fuzzy_match_threshold: 1.5", "fuzzy_match_threshold"),
            ("date_match_tolerance_days: 31", "date_match_tolerance_days"),
            ("request_delay_seconds: -1", "request_delay_seconds"),
            ("max_retries: 11", "max_retries"),
            ("max_pages: 0", "max_pages"),
            ("run_timeout_seconds: 0", "run_timeout_seconds"),
            (
                "search_date_range: { from: 2024-05-01, to: 2024-04-01 }",
                "search_date_range",
            ),
        ] {
            match RunOptions::from_yaml_str(yaml) {
                Err(ConfigError::OutOfRange { option: got, .. }) => assert_eq!(got, option, "{yaml}"),
                other => panic!("{yaml}: expected OutOfRange, got {other:?}"),
            }
        }
    }

    #[test]
    fn missing_options_file_is_an_io_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = RunOptions::load(&dir.path().join("absent.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
        assert_eq!(RunOptions::load_optional(None).unwrap(), RunOptions::default());
    }
}
