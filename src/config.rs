use std::path::PathBuf;
use std::time::Duration;

/// Process configuration, read from `DRIVETIME_*` environment variables.
/// Unset or unparseable values fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    /// Appends since the last compaction before the WAL is rewritten.
    pub compact_threshold: u64,
    /// How often background maintenance tops up recurring lessons.
    pub topup_interval: Duration,
    /// Tenants to process. `None` means every `*.wal` in `data_dir`.
    pub tenants: Option<Vec<String>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            compact_threshold: 1000,
            topup_interval: Duration::from_secs(3600),
            tenants: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        let tenants = lookup("DRIVETIME_TENANTS").map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect::<Vec<_>>()
        });

        Self {
            data_dir: lookup("DRIVETIME_DATA_DIR")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            compact_threshold: parsed("DRIVETIME_COMPACT_THRESHOLD").unwrap_or(defaults.compact_threshold),
            topup_interval: parsed("DRIVETIME_TOPUP_INTERVAL_SECS")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.topup_interval),
            tenants: tenants.filter(|t| !t.is_empty()),
        }
    }
}
