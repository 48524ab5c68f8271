// Copyright 2020 - developers of the `grammers` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The narrow contracts spec §6 exposes to external collaborators. Concrete implementations
//! live in `scheduler-store` (relational + fast store), `scheduler-source` (Message Source)
//! and `scheduler-events` (Event Publisher); the core only ever depends on these traits.

use crate::error::{SchedulerError, SourceError};
use crate::model::{ChannelSnapshot, HwmRecord, LeaseToken, MessagePage, ParsedPost, PostParsedEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

/// The relational store's view of channels (spec §6 "Channel Repository").
#[async_trait]
pub trait ChannelRepository: Send + Sync {
    /// One snapshot of the active-channel set, taken at the start of a tick.
    async fn list_active_channels(&self) -> Result<Vec<ChannelSnapshot>, SchedulerError>;

    /// Writes `last_parsed_at` under the monotonic guard
    /// `WHERE last_parsed_at IS NULL OR last_parsed_at < :at`.
    ///
    /// Returns whether the guarded write actually applied (`false` means a later value was
    /// already stored, which is a no-op, not an error).
    async fn update_last_parsed_at(
        &self,
        channel_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, SchedulerError>;
}

/// A lease held on the Tick Lock. Dropping it without calling `release` still leaves the lock
/// to expire via its TTL, but `TickLoop` always calls `release` explicitly on every exit path
/// (including panics, per Invariant 5 / P8).
#[async_trait]
pub trait Lease: Send + Sync {
    fn token(&self) -> &LeaseToken;
    async fn release(&self) -> Result<(), SchedulerError>;
}

/// The fast in-memory store (spec §6): Tick Lock (string SET with TTL+NX), HWM (per-channel
/// hash), and the lock's atomic DEL.
#[async_trait]
pub trait FastStore: Send + Sync {
    /// `SET key value NX EX ttl`-shaped acquisition. Returns `None` if another replica already
    /// holds the key.
    async fn try_acquire_lock(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<Box<dyn Lease>>, SchedulerError>;

    /// Whether the lock is currently held by anyone (used to detect lock loss before an LPA
    /// finalize, per spec §7's propagation policy).
    async fn lock_holder(&self, key: &str) -> Result<Option<LeaseToken>, SchedulerError>;

    async fn read_hwm(&self, channel_id: Uuid) -> Result<Option<HwmRecord>, SchedulerError>;

    async fn write_hwm(&self, channel_id: Uuid, record: HwmRecord) -> Result<(), SchedulerError>;
}

/// The opaque Telegram-ingest client (spec §1/§6). Out of scope for this core beyond the
/// contract: authentication, connection lifecycle and session storage belong to the
/// implementation, not to the scheduler.
#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn fetch_messages(
        &self,
        external_channel_id: i64,
        since: DateTime<Utc>,
        page_size: u32,
    ) -> Result<MessagePage, SourceError>;
}

/// The downstream event transport (spec §6). At-least-once; carries the natural dedup key and
/// a trace id. Consumers own deduplication on `(channel_id, telegram_message_id)` — this is
/// documented on the contract, not implemented here (spec §9).
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: PostParsedEvent) -> Result<(), SchedulerError>;
}

/// The "external storage collaborator" spec §4.5 step 3b references without naming: persistence
/// of the parsed post itself, beyond the channel watermark, is explicitly out of scope for this
/// core (spec §1) but the orchestrator still needs something to call.
#[async_trait]
pub trait PostSink: Send + Sync {
    async fn persist(&self, channel_id: Uuid, post: ParsedPost) -> Result<(), SchedulerError>;
}
