use crate::{error::BackupError, report::ReportKind};
use chrono::{DateTime, Days, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "GSC_BACKUP_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "gsc-backup.toml";

/// Largest `rowLimit` the Search Analytics endpoint accepts.
const MAX_ROW_LIMIT: u32 = 25_000;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Site name (used in the workbook file name) -> property URL.
    #[serde(default)]
    pub sites: BTreeMap<String, String>,
    #[serde(default)]
    pub discover_verified_sites: bool,
    #[serde(default = "default_client_secret")]
    pub client_secret: PathBuf,
    #[serde(default = "default_credentials")]
    pub credentials: PathBuf,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_offset_days")]
    pub offset_days: u32,
    #[serde(default = "default_span_days")]
    pub span_days: u32,
    /// IANA zone in which "today" is taken, e.g. `US/Pacific`.
    #[serde(default = "default_timezone")]
    pub timezone: Tz,
    #[serde(default = "default_search_type")]
    pub search_type: String,
    #[serde(default = "default_row_limit")]
    pub row_limit: u32,
    #[serde(default = "default_reports")]
    pub reports: Vec<ReportKind>,
    #[serde(default = "default_true")]
    pub write_headers: bool,
}

fn default_client_secret() -> PathBuf {
    PathBuf::from("client_secret.json")
}

fn default_credentials() -> PathBuf {
    PathBuf::from("appengine/credentials.json")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_offset_days() -> u32 {
    4
}

fn default_span_days() -> u32 {
    1
}

fn default_timezone() -> Tz {
    chrono_tz::US::Pacific
}

fn default_search_type() -> String {
    "web".to_owned()
}

fn default_row_limit() -> u32 {
    5000
}

fn default_reports() -> Vec<ReportKind> {
    vec![
        ReportKind::ByDate,
        ReportKind::ByPageDate,
        ReportKind::ByQueryDate,
        ReportKind::ByQueryDatePage,
    ]
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sites: BTreeMap::new(),
            discover_verified_sites: false,
            client_secret: default_client_secret(),
            credentials: default_credentials(),
            output_dir: default_output_dir(),
            offset_days: default_offset_days(),
            span_days: default_span_days(),
            timezone: default_timezone(),
            search_type: default_search_type(),
            row_limit: default_row_limit(),
            reports: default_reports(),
            write_headers: true,
        }
    }
}

impl Config {
    /// Loads the file named by `GSC_BACKUP_CONFIG`, or `gsc-backup.toml` in the working directory.
    pub fn load_default() -> Result<Self, BackupError> {
        let path = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load(&path)
    }

    pub fn load(path: &Path) -> Result<Self, BackupError> {
        let raw = std::fs::read_to_string(path).map_err(|e| BackupError::Config {
            context: "read",
            detail: format!("{}: {e}", path.display()),
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, BackupError> {
        let config: Config = toml::from_str(raw).map_err(|e| BackupError::Config {
            context: "parse",
            detail: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), BackupError> {
        let invalid = |detail: String| BackupError::Config {
            context: "validate",
            detail,
        };

        if self.sites.is_empty() && !self.discover_verified_sites {
            return Err(invalid(
                "no sites configured and discover_verified_sites is off".into(),
            ));
        }
        for (name, url) in &self.sites {
            if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
                return Err(invalid(format!("site name `{name}` is not usable as a file name")));
            }
            if url.trim().is_empty() {
                return Err(invalid(format!("site `{name}` has an empty URL")));
            }
        }
        if self.span_days == 0 {
            return Err(invalid("span_days must be at least 1".into()));
        }
        if self.row_limit == 0 || self.row_limit > MAX_ROW_LIMIT {
            return Err(invalid(format!(
                "row_limit must be between 1 and {MAX_ROW_LIMIT}"
            )));
        }
        if self.reports.is_empty() {
            return Err(invalid("reports must name at least one report kind".into()));
        }
        Ok(())
    }

    /// `<output_dir>/<site>-gsc-data-backup.xlsx`
    pub fn workbook_path(&self, site_name: &str) -> PathBuf {
        self.output_dir
            .join(format!("{site_name}-gsc-data-backup.xlsx"))
    }
}

/// Inclusive range of report dates sent with every query of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    /// Window of `span_days` days ending `offset_days` before `today`.
    pub fn ending_before(
        today: NaiveDate,
        offset_days: u32,
        span_days: u32,
    ) -> Result<Self, BackupError> {
        let out_of_range = || BackupError::Config {
            context: "window",
            detail: format!(
                "offset_days {offset_days} / span_days {span_days} reach before the earliest date"
            ),
        };
        let end = today
            .checked_sub_days(Days::new(u64::from(offset_days)))
            .ok_or_else(out_of_range)?;
        let start = end
            .checked_sub_days(Days::new(u64::from(span_days.max(1) - 1)))
            .ok_or_else(out_of_range)?;
        Ok(Self { start, end })
    }

    /// Takes "today" in the configured time zone.
    pub fn from_clock(now: DateTime<Utc>, config: &Config) -> Result<Self, BackupError> {
        let today = now.with_timezone(&config.timezone).date_naive();
        Self::ending_before(today, config.offset_days, config.span_days)
    }
}
