// Copyright 2020 - developers of the `grammers` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The shapes shared by every scheduler sub-component and external collaborator.

use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

/// A row from the `channels` table, as returned by `ChannelRepository::list_active_channels`.
///
/// The core only ever reads these fields and writes back `last_parsed_at`; `active` is owned
/// by the external admin flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSnapshot {
    pub id: Uuid,
    pub external_channel_id: i64,
    pub last_parsed_at: Option<DateTime<Utc>>,
}

/// The decision the Channel Selector makes for one channel in one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    /// No prior watermark, or the watermark is older than `lpa_stale_threshold`.
    Historical,
    /// A recent watermark exists; fetch only the delta.
    Incremental,
}

/// The per-channel volatile record held in the fast in-memory store.
///
/// Written after each successful batch; read at the start of each parse to pick the starting
/// point when the durable LPA is unavailable or lags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwmRecord {
    pub last_ok_timestamp: DateTime<Utc>,
    pub last_ok_message_id: i64,
    pub updated_at: DateTime<Utc>,
}

/// A page of messages as reported by the Message Source, always in ascending `posted_at` order.
#[derive(Debug, Clone)]
pub struct MessagePage {
    pub messages: Vec<RawMessage>,
    /// Whether the Message Source has more messages beyond this page for the same query.
    pub has_more: bool,
}

/// One message as handed back by the opaque Message Source.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub message_id: i64,
    pub posted_at: DateTime<Utc>,
    pub content: String,
    pub urls: Vec<String>,
    pub media: Vec<MediaDescriptor>,
}

/// A single piece of media attached to a message; intentionally opaque beyond what downstream
/// enrichment needs to decide whether to fetch it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDescriptor {
    pub kind: String,
    pub reference: String,
}

/// A parsed post ready to be handed to the storage collaborator, before publication.
#[derive(Debug, Clone)]
pub struct ParsedPost {
    pub telegram_message_id: i64,
    pub posted_at: DateTime<Utc>,
    pub content_hash: String,
    pub media: Vec<MediaDescriptor>,
}

/// Emitted once per message ingested. The natural dedup key is
/// `(channel_id, telegram_message_id)`; ownership passes to downstream consumers on publish.
#[derive(Debug, Clone)]
pub struct PostParsedEvent {
    pub channel_id: Uuid,
    pub telegram_message_id: i64,
    pub content_hash: String,
    pub posted_at: DateTime<Utc>,
    pub media: Vec<MediaDescriptor>,
    pub trace_id: Uuid,
}

/// The classified result of one channel's parse attempt, returned by the Parse Orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    /// The Message Source was drained; LPA was finalized.
    Ok,
    /// The deadline was exceeded partway through; HWM reflects whatever batches completed.
    Partial,
    /// A non-retryable error occurred; see the accompanying `SchedulerError`.
    Failed,
    /// The channel was abandoned this tick because honoring a rate-limit wait would have
    /// overrun the tick's remaining time.
    RateLimitedDeferred,
}

/// The result of one channel's parse, independent of whether it succeeded.
#[derive(Debug, Clone)]
pub struct ParseResult {
    pub channel_id: Uuid,
    pub message_count: u64,
    pub max_posted_at: Option<DateTime<Utc>>,
    pub outcome: ParseOutcome,
}

/// Per-channel, per-tick retry bookkeeping. Never persisted across ticks.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryState {
    pub attempt: u32,
    pub accumulated_backoff: Duration,
    pub accumulated_rate_limit_wait: Duration,
}

/// The outcome of one full tick, as returned by `Dispatcher::dispatch` and logged by the tick loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub parsed: u32,
    pub skipped: u32,
    pub failed: u32,
    pub rate_limited: u32,
}

impl TickSummary {
    pub fn record(&mut self, outcome: &ParseOutcome) {
        match outcome {
            ParseOutcome::Ok | ParseOutcome::Partial => self.parsed += 1,
            ParseOutcome::Failed => self.failed += 1,
            ParseOutcome::RateLimitedDeferred => self.rate_limited += 1,
        }
    }

    pub fn skip(&mut self) {
        self.skipped += 1;
    }
}

/// An opaque lease token handed back by `DistributedLock::acquire`. Its only valid use is to be
/// passed back to `release`; it carries no meaning beyond that.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseToken(pub String);
