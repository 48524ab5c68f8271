// Copyright 2020 - developers of the `grammers` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The error taxonomy of spec §7, expressed as a tagged variant so retry logic can switch on
//! it directly rather than string-matching.

use std::fmt;
use std::time::Duration;

/// Raised by a `MessageSource` implementation; classified into a [`SchedulerError`] at the
/// Dispatcher boundary (spec §9's "classify upstream failures at the boundary" note).
#[derive(Debug, Clone)]
pub enum SourceError {
    /// The source demands a wait before the next call; carries the exact duration.
    RateLimited(Duration),
    /// Network timeout, connection reset, or a 5xx-equivalent upstream failure. Retried.
    Transient(String),
    /// Authorization revoked, channel inaccessible, or malformed channel configuration. Not
    /// retried.
    Permanent(String),
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited(wait) => write!(f, "rate limited, retry after {wait:?}"),
            Self::Transient(msg) => write!(f, "transient upstream error: {msg}"),
            Self::Permanent(msg) => write!(f, "permanent upstream error: {msg}"),
        }
    }
}

impl std::error::Error for SourceError {}

/// The six abstract error kinds of spec §7.
#[derive(Debug, Clone)]
pub enum SchedulerError {
    /// Another replica holds the Tick Lock. Not an error; logged at info level, counted.
    LockContention,
    /// Message Source network failure, connection reset, 5xx-equivalent. Retried with
    /// exponential backoff; exhausted attempts become `ParseFailed`.
    TransientUpstream(String),
    /// The Message Source demands a wait; honored without consuming the retry budget.
    RateLimited(Duration),
    /// Authorization revoked, channel deleted, malformed channel configuration. Not retried.
    PermanentUpstream(String),
    /// Fast store or relational store failure. Treated like `TransientUpstream`; if exhausted,
    /// the whole tick is abandoned rather than silently losing HWM/LPA updates.
    StorageError(String),
    /// An invariant was violated or an unexpected variant was observed. Fatal to the current
    /// tick only; the process stays alive.
    InternalBug(String),
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LockContention => write!(f, "another replica currently holds the tick lock"),
            Self::TransientUpstream(msg) => write!(f, "transient upstream error: {msg}"),
            Self::RateLimited(wait) => write!(f, "rate limited, retry after {wait:?}"),
            Self::PermanentUpstream(msg) => write!(f, "permanent upstream error: {msg}"),
            Self::StorageError(msg) => write!(f, "storage error: {msg}"),
            Self::InternalBug(msg) => write!(f, "internal bug (invariant violated): {msg}"),
        }
    }
}

impl std::error::Error for SchedulerError {}

impl From<SourceError> for SchedulerError {
    fn from(error: SourceError) -> Self {
        match error {
            SourceError::RateLimited(wait) => Self::RateLimited(wait),
            SourceError::Transient(msg) => Self::TransientUpstream(msg),
            SourceError::Permanent(msg) => Self::PermanentUpstream(msg),
        }
    }
}

impl SchedulerError {
    /// Whether the Dispatcher should retry a parse that failed with this error, per the
    /// classification in spec §7. `RateLimited` is handled separately (it does not count
    /// against the retry budget at all) so it is intentionally excluded here.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientUpstream(_) | Self::StorageError(_))
    }
}

/// Raised by `SchedulerConfig::validate` before the daemon installs anything.
#[derive(Debug, Clone)]
pub struct ConfigError(pub String);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid scheduler configuration: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}
