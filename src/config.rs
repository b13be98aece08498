use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::model::{Ms, MINUTE_MS};
use crate::pricing::PricingConfig;

/// Daemon settings, read from `RIGBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub pricing: PricingConfig,
    pub sweep_interval: Duration,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            pricing: PricingConfig::default(),
            sweep_interval: Duration::from_secs(86_400),
            compact_threshold: 1000,
            metrics_port: None,
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.trim().parse().ok())
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unset or unparseable values keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let minutes = |key: &str| parsed::<u32>(&lookup, key).map(|m| Ms::from(m) * MINUTE_MS);

        let pricing = PricingConfig {
            hourly_rate_cents: parsed(&lookup, "RIGBOOK_HOURLY_RATE_CENTS")
                .filter(|r: &i64| *r >= 0)
                .unwrap_or(defaults.pricing.hourly_rate_cents),
            block_minutes: parsed(&lookup, "RIGBOOK_BLOCK_MINUTES")
                .filter(|m: &u32| *m > 0)
                .unwrap_or(defaults.pricing.block_minutes),
            min_duration_ms: minutes("RIGBOOK_MIN_BOOKING_MINUTES"),
            max_duration_ms: minutes("RIGBOOK_MAX_BOOKING_MINUTES"),
        };

        Self {
            data_dir: lookup("RIGBOOK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            pricing,
            sweep_interval: parsed(&lookup, "RIGBOOK_SWEEP_INTERVAL_SECS")
                .filter(|s: &u64| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            compact_threshold: parsed(&lookup, "RIGBOOK_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            metrics_port: parsed(&lookup, "RIGBOOK_METRICS_PORT"),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("bookings.wal")
    }
}
