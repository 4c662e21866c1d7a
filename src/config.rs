//! Run configuration.
//!
//! Everything has a default, so running without a config file reproduces the standard extract.
//! A TOML file can override any field, and the binaries let some fields be overridden again from
//! the command line.
use chrono::NaiveDate;
use qu::ick_use::*;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

/// Snapshot of the reference query as returned.
pub const RAW_REFERENCE_FILE: &str = "dmd_df.csv";
/// The mapping file, with identifier columns as integers.
pub const NORMALIZED_REFERENCE_FILE: &str = "bnf_to_dmd.csv";
/// Snapshot of the prescribing query.
pub const USAGE_FILE: &str = "rx_df.csv";
/// Longest allowed `timeout_secs`: one day.
pub const MAX_TIMEOUT_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Where snapshots are read from and written to.
    pub data_dir: PathBuf,
    /// If set, a snapshot made from the same query text is used instead of running the query.
    pub use_cache: bool,
    /// The BigQuery project that queries run in, and that unqualified datasets resolve against.
    pub project_id: String,
    /// BigQuery processing location, if not the default.
    pub location: Option<String>,
    /// Base URL of the BigQuery REST API.
    pub endpoint: String,
    /// How long to wait for a query, overall.
    pub timeout_secs: u64,
    pub usage_window: UsageWindow,
    pub report: ReportConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("../data"),
            use_cache: true,
            project_id: "ebmdatalab".into(),
            location: None,
            endpoint: "https://bigquery.googleapis.com/bigquery/v2".into(),
            timeout_secs: 600,
            usage_window: UsageWindow::default(),
            report: ReportConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        fn inner(path: &Path) -> Result<Config> {
            let text = fs::read_to_string(path)?;
            let config: Config = toml::from_str(&text)?;
            config.validate()?;
            Ok(config)
        }
        let path = path.as_ref();
        inner(path).with_context(|| format!("loading config from \"{}\"", path.display()))
    }

    /// Load from `path` if given, otherwise use the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result {
        ensure!(
            self.usage_window.from <= self.usage_window.to,
            "usage window starts ({}) after it ends ({})",
            self.usage_window.from,
            self.usage_window.to
        );
        ensure!(
            self.timeout_secs > 0 && self.timeout_secs <= MAX_TIMEOUT_SECS,
            "timeout_secs must be between 1 and {}, got {}",
            MAX_TIMEOUT_SECS,
            self.timeout_secs
        );
        ensure!(!self.project_id.is_empty(), "project_id must be set");
        Ok(())
    }

    pub fn raw_reference_path(&self) -> PathBuf {
        self.data_dir.join(RAW_REFERENCE_FILE)
    }

    pub fn normalized_reference_path(&self) -> PathBuf {
        self.data_dir.join(NORMALIZED_REFERENCE_FILE)
    }

    pub fn usage_path(&self) -> PathBuf {
        self.data_dir.join(USAGE_FILE)
    }
}

/// The months of prescribing data to sum over. Both ends are inclusive, and are compared against
/// the first day of each month.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UsageWindow {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl Default for UsageWindow {
    fn default() -> Self {
        Self {
            from: NaiveDate::from_ymd_opt(2022, 9, 1).unwrap(),
            to: NaiveDate::from_ymd_opt(2023, 8, 1).unwrap(),
        }
    }
}

/// How many rows each report shows. `0` shows everything.
#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReportConfig {
    pub preview_rows: usize,
    pub no_dmd_rows: usize,
    pub no_vtm_rows: usize,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            preview_rows: 5,
            no_dmd_rows: 5,
            no_vtm_rows: 30,
        }
    }
}

#[cfg(test)]
mod test {
    use super::Config;
    use chrono::NaiveDate;
    use std::{fs, path::Path};

    #[test]
    fn defaults() {
        let config = Config::default();
        config.validate().unwrap();
        assert!(config.use_cache);
        assert_eq!(
            config.normalized_reference_path(),
            Path::new("../data/bnf_to_dmd.csv")
        );
        assert_eq!(
            config.usage_window.from,
            NaiveDate::from_ymd_opt(2022, 9, 1).unwrap()
        );
    }

    #[test]
    fn partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "data_dir = \"out\"\nuse_cache = false\n\n[report]\nno_vtm_rows = 10\n",
        )
        .unwrap();
        let config = Config::load(&path).unwrap();
        assert!(!config.use_cache);
        assert_eq!(config.usage_path(), Path::new("out/rx_df.csv"));
        assert_eq!(config.report.no_vtm_rows, 10);
        assert_eq!(config.report.no_dmd_rows, 5);
        assert_eq!(config.project_id, "ebmdatalab");
    }

    #[test]
    fn rejects_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "use_cach = false\n").unwrap();
        assert!(Config::load(&path).is_err());

        fs::write(&path, "[report]\nno_vtm_row = 3\n").unwrap();
        assert!(Config::load(&path).is_err());

        fs::write(
            &path,
            "[usage_window]\nfrom = \"2022-09-01\"\nto = \"2023-08-01\"\nuntil = \"2023-09-01\"\n",
        )
        .unwrap();
        assert!(Config::load(&path).is_err());

        fs::write(&path, "timeout_secs = 1000000000\n").unwrap();
        assert!(Config::load(&path).is_err());

        fs::write(
            &path,
            "[usage_window]\nfrom = \"2023-08-01\"\nto = \"2022-09-01\"\n",
        )
        .unwrap();
        assert!(Config::load(&path).is_err());
    }
}
