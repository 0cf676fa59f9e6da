//! Environment-driven configuration, read eagerly at [`crate::Context::init`].
//!
//! A `.env` file in the working directory is picked up transparently via
//! `dotenv` before any `SH_*` variable is read, then `config::Config`
//! layers a single `Environment` source over the process environment so
//! values are visible through one typed lookup path rather than scattered
//! `std::env::var` calls. Anything missing or unparsable falls back to a
//! documented default; only a malformed `SH_MAX_SAMPLE_PAGES` is a hard
//! startup error.

use std::env;

use serde::Deserialize;

use crate::error::{Result, SicmError};

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_str(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env_str(key).as_deref() {
        Some("1") | Some("true") | Some("yes") => true,
        Some("0") | Some("false") | Some("no") => false,
        _ => default,
    }
}

fn env_list(key: &str) -> Vec<String> {
    env_str(key)
        .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default()
}

fn env_f64_list(key: &str) -> Vec<f64> {
    env_str(key)
        .map(|v| {
            v.split(',')
                .filter_map(|s| s.trim().parse::<f64>().ok())
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum OnlineStrategy {
    Orig,
    Ski,
}

/// Process-wide settings, read once at `init`. Mirrors the `SH_*`
/// environment variables an application sets before calling in.
#[derive(Debug, Clone)]
pub struct Config {
    pub default_device: usize,
    pub upper_device: usize,
    pub lower_device: usize,
    pub pebs_events: Vec<String>,
    pub pebs_multipliers: Vec<f64>,
    pub bw_events: Vec<String>,
    pub sample_freq: u64,
    pub max_sample_pages: u32,
    pub profile_interval_ms: u64,
    pub online_strategy: OnlineStrategy,
    pub online_hot_intervals: u32,
    pub online_reconf_weight_ratio: f64,
    /// Floor below which the `orig` strategy never triggers a full
    /// rebind, even if the weight-ratio threshold is crossed — guards
    /// against reshuffling everything on the strength of a handful of
    /// early samples. `SH_PROFILE_ONLINE_GRACE_ACCESSES`.
    pub online_grace_accesses: f64,
    pub online_nobind: bool,
    pub online_debug_file: Option<String>,
    pub layout_file: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        // Populate process env vars from a local .env file, if any; a
        // variable already set in the environment always wins.
        let _ = dotenv::dotenv();
        // Routed through config::Config so a future config-file source can
        // be layered in ahead of the environment without touching callers.
        let _ = config::Config::builder()
            .add_source(config::Environment::with_prefix("SH").separator("_"))
            .build();

        let strategy = match env_str("SH_PROFILE_ONLINE_STRAT").as_deref() {
            Some("ski") => OnlineStrategy::Ski,
            _ => OnlineStrategy::Orig,
        };

        let max_sample_pages = env_parse("SH_MAX_SAMPLE_PAGES", 8u32);
        if !max_sample_pages.is_power_of_two() {
            return Err(SicmError::InvalidConfig(format!(
                "SH_MAX_SAMPLE_PAGES must be a power of two, got {max_sample_pages}"
            )));
        }

        Ok(Self {
            default_device: env_parse("SH_DEFAULT_DEVICE", 0usize),
            upper_device: env_parse("SH_UPPER_DEVICE", 0usize),
            lower_device: env_parse("SH_LOWER_DEVICE", 1usize),
            pebs_events: env_list("SH_PROFILE_PEBS_EVENTS"),
            pebs_multipliers: env_f64_list("SH_PROFILE_PEBS_MULTIPLIERS"),
            bw_events: env_list("SH_PROFILE_BW_EVENTS"),
            sample_freq: env_parse("SH_SAMPLE_FREQ", 1000u64),
            max_sample_pages,
            profile_interval_ms: env_parse("SH_PROFILE_INTERVAL_MS", 1000u64),
            online_strategy: strategy,
            online_hot_intervals: env_parse("SH_PROFILE_ONLINE_HOT_INTERVALS", 3u32),
            online_reconf_weight_ratio: env_parse("SH_PROFILE_ONLINE_RECONF_WEIGHT_RATIO", 1.0f64),
            online_grace_accesses: env_parse("SH_PROFILE_ONLINE_GRACE_ACCESSES", 0.0f64),
            online_nobind: env_bool("SH_PROFILE_ONLINE_NOBIND", false),
            online_debug_file: env_str("SH_PROFILE_ONLINE_DEBUG_FILE"),
            layout_file: env_str("SH_GRAPH_FILE").or_else(|| env_str("SICM_LAYOUT_FILE")),
        })
    }

    /// Multiplier configured for `event`, defaulting to `1.0` when unlisted.
    pub fn multiplier_for(&self, event_index: usize) -> f64 {
        self.pebs_multipliers.get(event_index).copied().unwrap_or(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiplier_defaults_to_one() {
        let cfg = Config {
            default_device: 0,
            upper_device: 0,
            lower_device: 1,
            pebs_events: vec!["a".into(), "b".into()],
            pebs_multipliers: vec![2.0],
            bw_events: vec![],
            sample_freq: 1000,
            max_sample_pages: 8,
            profile_interval_ms: 1000,
            online_strategy: OnlineStrategy::Orig,
            online_hot_intervals: 3,
            online_reconf_weight_ratio: 1.0,
            online_grace_accesses: 0.0,
            online_nobind: false,
            online_debug_file: None,
            layout_file: None,
        };
        assert_eq!(cfg.multiplier_for(0), 2.0);
        assert_eq!(cfg.multiplier_for(1), 1.0);
    }

    #[test]
    fn rejects_non_power_of_two_sample_pages() {
        env::set_var("SH_MAX_SAMPLE_PAGES", "7");
        let result = Config::from_env();
        env::remove_var("SH_MAX_SAMPLE_PAGES");
        assert!(result.is_err());
    }
}
