// Copyright 2020 - developers of the `grammers` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! An immutable configuration value, per spec §6/§9: passed by value into constructors, never
//! read from process-global state inside the core.

use crate::error::ConfigError;
use std::time::Duration;

/// Forces the Channel Selector's decision for every channel in the tick, overriding its usual
/// per-channel logic. Corresponds to `PARSER_MODE_OVERRIDE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModeOverride {
    #[default]
    Auto,
    Historical,
    Incremental,
}

/// The enumerated recognized options of spec §6, plus the ambient knobs resolved for OQ2/OQ3
/// in SPEC_FULL.md.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Master switch; when `false` the core does not tick. Corresponds to
    /// `FEATURE_INCREMENTAL_PARSING_ENABLED`.
    pub enabled: bool,
    /// Corresponds to `PARSER_MODE_OVERRIDE`.
    pub mode_override: ModeOverride,
    /// Tick period. Corresponds to `PARSER_SCHEDULER_INTERVAL_SEC`.
    pub tick_interval: Duration,
    /// Dispatcher worker pool size. Corresponds to `PARSER_MAX_CONCURRENCY`.
    pub max_concurrency: usize,
    /// Max retry attempts per channel per tick, not counting rate-limit waits. Corresponds to
    /// `PARSER_RETRY_MAX`.
    pub retry_max: u32,
    /// Exponential backoff base, in seconds.
    pub retry_base_seconds: u64,
    /// Exponential backoff cap, in seconds.
    pub retry_cap_seconds: u64,
    /// Historical-mode bootstrap window. Corresponds to `PARSER_HISTORICAL_HOURS`.
    pub historical_hours: i64,
    /// Forced-historical safeguard threshold. Corresponds to `PARSER_LPA_STALE_THRESHOLD_SEC`.
    pub lpa_stale_threshold: Duration,
    /// Page size given to the Message Source. Corresponds to `PARSER_BATCH_SIZE`.
    pub batch_size: u32,
    /// Resolves OQ2: dispatch oldest-LPA-first when true, repository order otherwise.
    pub prioritize_oldest_lpa: bool,
    /// Per-parse timeout. When `None`, derived as
    /// `max_tick_duration() / max_concurrency` (rounded up), per spec §5.
    pub parse_timeout: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode_override: ModeOverride::Auto,
            tick_interval: Duration::from_secs(300),
            max_concurrency: 4,
            retry_max: 3,
            retry_base_seconds: 2,
            retry_cap_seconds: 60,
            historical_hours: 48,
            lpa_stale_threshold: Duration::from_secs(7 * 24 * 3600),
            batch_size: 100,
            prioritize_oldest_lpa: true,
            parse_timeout: None,
        }
    }
}

impl SchedulerConfig {
    /// TTL granted to the Tick Lock: `tick_interval * 1.5`, per spec §4.1.
    pub fn lock_ttl(&self) -> Duration {
        self.tick_interval.mul_f64(1.5)
    }

    /// The enforced upper bound on a single tick's body: `tick_interval * 1.5 * 0.9`, strictly
    /// smaller than `lock_ttl()` so a dead holder can never block the next tick indefinitely.
    pub fn max_tick_duration(&self) -> Duration {
        self.lock_ttl().mul_f64(0.9)
    }

    /// Per-parse deadline: the configured override, or `max_tick_duration() / max_concurrency`
    /// rounded up, ensuring a single slow channel cannot monopolize a tick.
    pub fn parse_timeout(&self) -> Duration {
        self.parse_timeout.unwrap_or_else(|| {
            let total_millis = self.max_tick_duration().as_millis() as u64;
            let concurrency = self.max_concurrency.max(1) as u64;
            let per_parse = total_millis.div_ceil(concurrency);
            Duration::from_millis(per_parse)
        })
    }

    /// Backoff for retry attempt `k` (1-indexed): `min(base * 2^(k-1), cap)` seconds.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let scaled = self.retry_base_seconds.saturating_mul(1u64 << exp);
        Duration::from_secs(scaled.min(self.retry_cap_seconds))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.retry_base_seconds > self.retry_cap_seconds {
            return Err(ConfigError(
                "retry_base_seconds must not exceed retry_cap_seconds".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(ConfigError("batch_size must be at least 1".to_string()));
        }
        if self.historical_hours <= 0 {
            return Err(ConfigError("historical_hours must be positive".to_string()));
        }
        if self.tick_interval.is_zero() {
            return Err(ConfigError("tick_interval must be positive".to_string()));
        }
        Ok(())
    }
}
