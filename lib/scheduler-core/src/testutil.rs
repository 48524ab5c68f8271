// Copyright 2020 - developers of the `grammers` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! In-memory test doubles for every external collaborator trait, plus a deterministic
//! [`FakeClock`], gated behind the `test-util` feature (spec §9's "inject a clock abstraction
//! so tests can drive scenarios A-F deterministically"). Exercised by this crate's own tests and
//! reused by `scheduler-store`/`scheduler-source`/`scheduler-events`'s integration tests.

use crate::clock::Clock;
use crate::error::{SchedulerError, SourceError};
use crate::model::{ChannelSnapshot, HwmRecord, LeaseToken, MessagePage, ParsedPost, PostParsedEvent, RawMessage};
use crate::traits::{ChannelRepository, EventPublisher, FastStore, Lease, MessageSource, PostSink};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

/// A clock whose `now()` is set explicitly by the test, optionally advanced, never the wall
/// clock. Every scenario in spec §8 drives its timestamps through this.
pub struct FakeClock {
    now: Mutex<DateTime<Utc>>,
}

impl FakeClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut guard = self.now.lock().unwrap();
        *guard += by;
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// An in-memory `ChannelRepository`. `last_parsed_at` writes honor the same monotonic guard the
/// real `sqlx` implementation enforces with `WHERE last_parsed_at IS NULL OR last_parsed_at <
/// :at`.
#[derive(Default)]
pub struct FakeChannelRepository {
    channels: Mutex<HashMap<Uuid, ChannelSnapshot>>,
}

impl FakeChannelRepository {
    pub fn new(channels: Vec<ChannelSnapshot>) -> Self {
        let map = channels.into_iter().map(|c| (c.id, c)).collect();
        Self {
            channels: Mutex::new(map),
        }
    }

    pub fn last_parsed_at(&self, channel_id: Uuid) -> Option<DateTime<Utc>> {
        self.channels
            .lock()
            .unwrap()
            .get(&channel_id)
            .and_then(|c| c.last_parsed_at)
    }

    pub fn set_active_channels(&self, channels: Vec<ChannelSnapshot>) {
        let mut guard = self.channels.lock().unwrap();
        *guard = channels.into_iter().map(|c| (c.id, c)).collect();
    }
}

#[async_trait]
impl ChannelRepository for FakeChannelRepository {
    async fn list_active_channels(&self) -> Result<Vec<ChannelSnapshot>, SchedulerError> {
        Ok(self.channels.lock().unwrap().values().cloned().collect())
    }

    async fn update_last_parsed_at(&self, channel_id: Uuid, at: DateTime<Utc>) -> Result<bool, SchedulerError> {
        let mut guard = self.channels.lock().unwrap();
        let Some(channel) = guard.get_mut(&channel_id) else {
            return Ok(false);
        };
        match channel.last_parsed_at {
            Some(existing) if existing >= at => Ok(false),
            _ => {
                channel.last_parsed_at = Some(at);
                Ok(true)
            }
        }
    }
}

/// A `ChannelRepository` whose `list_active_channels` always panics, for exercising the tick
/// body's `catch_unwind` boundary (spec §8 P8: the Tick Lock must be released even when the tick
/// body panics).
#[derive(Default)]
pub struct PanickingChannelRepository;

#[async_trait]
impl ChannelRepository for PanickingChannelRepository {
    async fn list_active_channels(&self) -> Result<Vec<ChannelSnapshot>, SchedulerError> {
        panic!("PanickingChannelRepository::list_active_channels always panics");
    }

    async fn update_last_parsed_at(&self, _channel_id: Uuid, _at: DateTime<Utc>) -> Result<bool, SchedulerError> {
        Ok(true)
    }
}

struct FakeLease {
    key: String,
    token: LeaseToken,
    held: std::sync::Arc<Mutex<HashMap<String, LeaseToken>>>,
}

#[async_trait]
impl Lease for FakeLease {
    fn token(&self) -> &LeaseToken {
        &self.token
    }

    async fn release(&self) -> Result<(), SchedulerError> {
        let mut guard = self.held.lock().unwrap();
        if guard.get(&self.key) == Some(&self.token) {
            guard.remove(&self.key);
        }
        Ok(())
    }
}

/// An in-memory `FastStore`: Tick Lock + per-channel HWM. No TTL expiry simulation beyond what
/// tests drive explicitly via `expire_lock`.
#[derive(Default)]
pub struct FakeFastStore {
    locks: std::sync::Arc<Mutex<HashMap<String, LeaseToken>>>,
    hwm: Mutex<HashMap<Uuid, HwmRecord>>,
    /// Every `write_hwm` call, in order, per channel — lets tests assert HWM advances
    /// monotonically across multiple pages within one parse (spec §8 P3), not just its final
    /// value.
    hwm_history: Mutex<HashMap<Uuid, Vec<HwmRecord>>>,
    lease_counter: AtomicUsize,
}

impl FakeFastStore {
    pub async fn seed_hwm(&self, channel_id: Uuid, record: HwmRecord) {
        self.hwm.lock().unwrap().insert(channel_id, record);
    }

    /// Simulates TTL expiry or a store-side eviction of the lock, independent of `release`.
    pub fn expire_lock(&self, key: &str) {
        self.locks.lock().unwrap().remove(key);
    }

    /// Every `HwmRecord` ever written for `channel_id`, in write order.
    pub fn hwm_history(&self, channel_id: Uuid) -> Vec<HwmRecord> {
        self.hwm_history.lock().unwrap().get(&channel_id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl FastStore for FakeFastStore {
    async fn try_acquire_lock(&self, key: &str, _ttl: Duration) -> Result<Option<Box<dyn Lease>>, SchedulerError> {
        let mut guard = self.locks.lock().unwrap();
        if guard.contains_key(key) {
            return Ok(None);
        }
        let id = self.lease_counter.fetch_add(1, Ordering::SeqCst);
        let token = LeaseToken(format!("{key}:{id}"));
        guard.insert(key.to_string(), token.clone());
        drop(guard);
        Ok(Some(Box::new(FakeLease {
            key: key.to_string(),
            token,
            held: self.locks.clone(),
        })))
    }

    async fn lock_holder(&self, key: &str) -> Result<Option<LeaseToken>, SchedulerError> {
        Ok(self.locks.lock().unwrap().get(key).cloned())
    }

    async fn read_hwm(&self, channel_id: Uuid) -> Result<Option<HwmRecord>, SchedulerError> {
        Ok(self.hwm.lock().unwrap().get(&channel_id).copied())
    }

    async fn write_hwm(&self, channel_id: Uuid, record: HwmRecord) -> Result<(), SchedulerError> {
        self.hwm.lock().unwrap().insert(channel_id, record);
        self.hwm_history.lock().unwrap().entry(channel_id).or_default().push(record);
        Ok(())
    }
}

/// A `MessageSource` double whose pages and errors are scripted up front, in order, per channel.
/// Used to drive spec §8 Scenarios A-D deterministically without a real Telegram-backed client.
pub struct ScriptedSource {
    pages: Mutex<VecDeque<Result<MessagePage, SourceError>>>,
    calls: AtomicUsize,
    last_since: Mutex<Option<DateTime<Utc>>>,
}

impl ScriptedSource {
    pub fn new(script: Vec<Result<MessagePage, SourceError>>) -> Self {
        Self {
            pages: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
            last_since: Mutex::new(None),
        }
    }

    /// Convenience for the common case of "one page, then end of stream."
    pub fn single_page(messages: Vec<RawMessage>) -> Self {
        Self::new(vec![Ok(MessagePage {
            messages,
            has_more: false,
        })])
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_since(&self) -> Option<DateTime<Utc>> {
        *self.last_since.lock().unwrap()
    }
}

#[async_trait]
impl MessageSource for ScriptedSource {
    async fn fetch_messages(
        &self,
        _external_channel_id: i64,
        since: DateTime<Utc>,
        _page_size: u32,
    ) -> Result<MessagePage, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_since.lock().unwrap() = Some(since);
        match self.pages.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Ok(MessagePage {
                messages: vec![],
                has_more: false,
            }),
        }
    }
}

/// Tracks concurrent in-flight `fetch_messages` calls, for asserting the Dispatcher's
/// `Semaphore` actually bounds concurrency at `max_concurrency` (spec §8 P7).
pub struct ConcurrencyTrackingSource {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    hold: Duration,
}

impl ConcurrencyTrackingSource {
    pub fn new(hold: Duration) -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            hold,
        }
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageSource for ConcurrencyTrackingSource {
    async fn fetch_messages(
        &self,
        _external_channel_id: i64,
        _since: DateTime<Utc>,
        _page_size: u32,
    ) -> Result<MessagePage, SourceError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);
        tokio::time::sleep(self.hold).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(MessagePage {
            messages: vec![],
            has_more: false,
        })
    }
}

/// Records every distinct `external_channel_id` seen by `fetch_messages`, for asserting spec §8
/// P1/Scenario E: across N replicas racing for a single Tick Lock, every channel still gets
/// ticked somewhere.
#[derive(Default)]
pub struct RecordingSource {
    seen: Mutex<HashSet<i64>>,
}

impl RecordingSource {
    pub fn seen_channels(&self) -> HashSet<i64> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageSource for RecordingSource {
    async fn fetch_messages(
        &self,
        external_channel_id: i64,
        _since: DateTime<Utc>,
        _page_size: u32,
    ) -> Result<MessagePage, SourceError> {
        self.seen.lock().unwrap().insert(external_channel_id);
        Ok(MessagePage {
            messages: vec![],
            has_more: false,
        })
    }
}

/// Records every published event, in publish order, for assertion.
#[derive(Default)]
pub struct FakeEventPublisher {
    events: Mutex<Vec<PostParsedEvent>>,
}

impl FakeEventPublisher {
    pub fn events(&self) -> Vec<PostParsedEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventPublisher for FakeEventPublisher {
    async fn publish(&self, event: PostParsedEvent) -> Result<(), SchedulerError> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

/// Records every persisted post, in persist order.
#[derive(Default)]
pub struct FakePostSink {
    persisted: Mutex<Vec<(Uuid, ParsedPost)>>,
}

impl FakePostSink {
    pub fn persisted_count(&self) -> usize {
        self.persisted.lock().unwrap().len()
    }
}

#[async_trait]
impl PostSink for FakePostSink {
    async fn persist(&self, channel_id: Uuid, post: ParsedPost) -> Result<(), SchedulerError> {
        self.persisted.lock().unwrap().push((channel_id, post));
        Ok(())
    }
}

/// A counting `Metrics` implementation for assertions on P1/P6/P7-style properties.
#[derive(Default)]
pub struct FakeMetrics {
    pub tick_acquired: AtomicUsize,
    pub tick_lost: AtomicUsize,
    pub retries: AtomicUsize,
    pub rate_limit_waits: AtomicI64,
}

impl crate::metrics::Metrics for FakeMetrics {
    fn record_tick_attempt(&self, outcome: crate::metrics::TickAttempt) {
        match outcome {
            crate::metrics::TickAttempt::Acquired => {
                self.tick_acquired.fetch_add(1, Ordering::SeqCst);
            }
            crate::metrics::TickAttempt::Lost => {
                self.tick_lost.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn record_parse_attempt(&self, _mode: &str, _outcome: &str) {}

    fn record_retry(&self, _reason: crate::metrics::RetryReason) {
        self.retries.fetch_add(1, Ordering::SeqCst);
    }

    fn record_rate_limit_wait(&self, _channel_external_id: i64, wait: Duration) {
        self.rate_limit_waits.fetch_add(wait.as_secs() as i64, Ordering::SeqCst);
    }

    fn set_hwm_age(&self, _channel_external_id: i64, _age: Duration) {}
    fn set_lpa_age(&self, _channel_external_id: i64, _age: Duration) {}
    fn set_last_successful_tick(&self, _unix_timestamp: i64) {}
}
