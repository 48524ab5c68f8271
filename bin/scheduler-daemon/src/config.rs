// Copyright 2020 - developers of the `grammers` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Loads a [`scheduler_core::SchedulerConfig`] from a TOML file merged with the environment
//! variables named in spec §6, env overriding file per common ops practice. `scheduler-core`
//! itself never touches `std::env` — this is the ambient loading layer spec.md §1 explicitly
//! scopes out of the core and SPEC_FULL.md §6 assigns to this binary.

use scheduler_core::{ModeOverride, SchedulerConfig};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    pub enabled: Option<bool>,
    pub mode_override: Option<String>,
    pub tick_interval_sec: Option<u64>,
    pub max_concurrency: Option<usize>,
    pub retry_max: Option<u32>,
    pub retry_base_seconds: Option<u64>,
    pub retry_cap_seconds: Option<u64>,
    pub historical_hours: Option<i64>,
    pub lpa_stale_threshold_sec: Option<u64>,
    pub batch_size: Option<u32>,
    pub prioritize_oldest_lpa: Option<bool>,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
}

#[derive(Debug)]
pub struct DaemonConfigError(pub String);

impl fmt::Display for DaemonConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "daemon configuration error: {}", self.0)
    }
}

impl std::error::Error for DaemonConfigError {}

/// The daemon's full configuration: the scheduler's own immutable config plus the connection
/// strings the scheduler itself never sees.
pub struct DaemonConfig {
    pub scheduler: SchedulerConfig,
    pub database_url: String,
    pub redis_url: String,
}

/// Loads `path` (if it exists), then applies the `PARSER_*`/`FEATURE_*` environment variables
/// from spec §6 on top, env last so it always wins.
pub fn load(path: Option<&str>) -> Result<DaemonConfig, DaemonConfigError> {
    let mut file_config = match path {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .map_err(|error| DaemonConfigError(format!("reading {path}: {error}")))?;
            toml::from_str::<FileConfig>(&contents)
                .map_err(|error| DaemonConfigError(format!("parsing {path}: {error}")))?
        }
        None => FileConfig::default(),
    };

    apply_env_overrides(&mut file_config);

    let mut scheduler = SchedulerConfig::default();

    if let Some(enabled) = file_config.enabled {
        scheduler.enabled = enabled;
    }
    if let Some(mode) = &file_config.mode_override {
        scheduler.mode_override = parse_mode_override(mode)?;
    }
    if let Some(secs) = file_config.tick_interval_sec {
        scheduler.tick_interval = Duration::from_secs(secs);
    }
    if let Some(n) = file_config.max_concurrency {
        scheduler.max_concurrency = n;
    }
    if let Some(n) = file_config.retry_max {
        scheduler.retry_max = n;
    }
    if let Some(secs) = file_config.retry_base_seconds {
        scheduler.retry_base_seconds = secs;
    }
    if let Some(secs) = file_config.retry_cap_seconds {
        scheduler.retry_cap_seconds = secs;
    }
    if let Some(hours) = file_config.historical_hours {
        scheduler.historical_hours = hours;
    }
    if let Some(secs) = file_config.lpa_stale_threshold_sec {
        scheduler.lpa_stale_threshold = Duration::from_secs(secs);
    }
    if let Some(n) = file_config.batch_size {
        scheduler.batch_size = n;
    }
    if let Some(flag) = file_config.prioritize_oldest_lpa {
        scheduler.prioritize_oldest_lpa = flag;
    }

    scheduler
        .validate()
        .map_err(|error| DaemonConfigError(error.to_string()))?;

    let database_url = file_config
        .database_url
        .ok_or_else(|| DaemonConfigError("no database_url configured (set [database_url] or DATABASE_URL)".into()))?;
    let redis_url = file_config
        .redis_url
        .ok_or_else(|| DaemonConfigError("no redis_url configured (set [redis_url] or REDIS_URL)".into()))?;

    Ok(DaemonConfig {
        scheduler,
        database_url,
        redis_url,
    })
}

fn apply_env_overrides(config: &mut FileConfig) {
    if let Ok(value) = std::env::var("FEATURE_INCREMENTAL_PARSING_ENABLED") {
        config.enabled = value.parse().ok();
    }
    if let Ok(value) = std::env::var("PARSER_MODE_OVERRIDE") {
        config.mode_override = Some(value);
    }
    if let Ok(value) = std::env::var("PARSER_SCHEDULER_INTERVAL_SEC") {
        config.tick_interval_sec = value.parse().ok();
    }
    if let Ok(value) = std::env::var("PARSER_MAX_CONCURRENCY") {
        config.max_concurrency = value.parse().ok();
    }
    if let Ok(value) = std::env::var("PARSER_RETRY_MAX") {
        config.retry_max = value.parse().ok();
    }
    if let Ok(value) = std::env::var("PARSER_HISTORICAL_HOURS") {
        config.historical_hours = value.parse().ok();
    }
    if let Ok(value) = std::env::var("PARSER_LPA_STALE_THRESHOLD_SEC") {
        config.lpa_stale_threshold_sec = value.parse().ok();
    }
    if let Ok(value) = std::env::var("PARSER_BATCH_SIZE") {
        config.batch_size = value.parse().ok();
    }
    if let Ok(value) = std::env::var("PARSER_PRIORITIZE_OLDEST_LPA") {
        config.prioritize_oldest_lpa = value.parse().ok();
    }
    if let Ok(value) = std::env::var("DATABASE_URL") {
        config.database_url = Some(value);
    }
    if let Ok(value) = std::env::var("REDIS_URL") {
        config.redis_url = Some(value);
    }
}

fn parse_mode_override(value: &str) -> Result<ModeOverride, DaemonConfigError> {
    match value {
        "auto" => Ok(ModeOverride::Auto),
        "historical" => Ok(ModeOverride::Historical),
        "incremental" => Ok(ModeOverride::Incremental),
        other => Err(DaemonConfigError(format!(
            "invalid mode_override {other:?}, expected one of auto/historical/incremental"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_recognized_mode_overrides() {
        assert!(matches!(parse_mode_override("auto"), Ok(ModeOverride::Auto)));
        assert!(matches!(parse_mode_override("historical"), Ok(ModeOverride::Historical)));
        assert!(parse_mode_override("bogus").is_err());
    }
}
