// Copyright 2020 - developers of the `grammers` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! 4.4 Watermark Manager: authoritative owner of HWM (volatile, fast store) and LPA (durable,
//! relational store). Reconciles starting points across crashes per Invariant 2.

use crate::clock::SharedClock;
use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::model::{ChannelSnapshot, HwmRecord, ParseMode};
use crate::traits::{ChannelRepository, FastStore};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

pub struct WatermarkManager {
    repository: Arc<dyn ChannelRepository>,
    fast_store: Arc<dyn FastStore>,
    config: SchedulerConfig,
    clock: SharedClock,
}

impl WatermarkManager {
    pub fn new(
        repository: Arc<dyn ChannelRepository>,
        fast_store: Arc<dyn FastStore>,
        config: SchedulerConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            repository,
            fast_store,
            config,
            clock,
        }
    }

    /// Computes the moment from which messages must be fetched, per spec §4.4. `override` mode
    /// is not a distinct branch here: the Channel Selector already resolved it down to
    /// `Historical`/`Incremental` before calling this, per spec.md's "dictated by the operator's
    /// choice as in the two cases above."
    pub async fn starting_point(
        &self,
        channel: &ChannelSnapshot,
        mode: ParseMode,
    ) -> Result<DateTime<Utc>, SchedulerError> {
        if mode == ParseMode::Historical {
            let hours = chrono::Duration::hours(self.config.historical_hours);
            return Ok(self.clock.now() - hours);
        }

        let hwm = self.fast_store.read_hwm(channel.id).await?;
        Ok(Self::resolve_incremental_starting_point(
            hwm.as_ref(),
            channel.last_parsed_at,
            self.clock.now(),
            self.config.historical_hours,
        ))
    }

    /// Pure arithmetic, unit-testable without either collaborator, per SPEC_FULL.md §4.
    ///
    /// `max(HWM, LPA)` when both present; whichever is present alone; and the defensive
    /// historical fallback (`now - historical_hours`) when neither is available, per spec §4.4's
    /// "the Watermark Manager enforces this defensively."
    fn resolve_incremental_starting_point(
        hwm: Option<&HwmRecord>,
        lpa: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        historical_hours: i64,
    ) -> DateTime<Utc> {
        match (hwm, lpa) {
            (Some(hwm), Some(lpa)) => hwm.last_ok_timestamp.max(lpa),
            (Some(hwm), None) => hwm.last_ok_timestamp,
            (None, Some(lpa)) => lpa,
            (None, None) => now - chrono::Duration::hours(historical_hours),
        }
    }

    /// Updates HWM atomically in the fast store. "Last-writer-wins per channel" is safe because
    /// Invariant 1 guarantees only one replica ticks at a time (spec §4.4).
    pub async fn record_batch_progress(
        &self,
        channel_id: Uuid,
        max_posted_at: DateTime<Utc>,
        max_message_id: i64,
    ) -> Result<(), SchedulerError> {
        let record = HwmRecord {
            last_ok_timestamp: max_posted_at,
            last_ok_message_id: max_message_id,
            updated_at: self.clock.now(),
        };
        self.fast_store.write_hwm(channel_id, record).await
    }

    /// Whether a volatile HWM is currently on record for this channel. Used by the Parse
    /// Orchestrator to resolve OQ1 (see SPEC_FULL.md): an empty incremental parse only advances
    /// LPA to `now` when a prior HWM exists.
    pub async fn hwm_exists(&self, channel_id: Uuid) -> Result<bool, SchedulerError> {
        Ok(self.fast_store.read_hwm(channel_id).await?.is_some())
    }

    /// Writes LPA through the monotonic-guard UPDATE; idempotent when the stored LPA is already
    /// at least `max_posted_at` (spec §4.4).
    pub async fn finalize_parse(
        &self,
        channel_id: Uuid,
        max_posted_at: DateTime<Utc>,
    ) -> Result<bool, SchedulerError> {
        self.repository
            .update_last_parsed_at(channel_id, max_posted_at)
            .await
    }
}
