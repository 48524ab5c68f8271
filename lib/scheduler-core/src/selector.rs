// Copyright 2020 - developers of the `grammers` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! 4.2 Channel Selector: produces the `(channel, mode)` pairs to process in one tick.

use crate::clock::SharedClock;
use crate::config::{ModeOverride, SchedulerConfig};
use crate::error::SchedulerError;
use crate::model::{ChannelSnapshot, ParseMode};
use crate::traits::ChannelRepository;
use std::sync::Arc;

pub struct ChannelSelector {
    repository: Arc<dyn ChannelRepository>,
    config: SchedulerConfig,
    clock: SharedClock,
}

impl ChannelSelector {
    pub fn new(
        repository: Arc<dyn ChannelRepository>,
        config: SchedulerConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            repository,
            config,
            clock,
        }
    }

    /// Takes one snapshot of the active-channel set and decides a mode for each, per the
    /// ordered rule list in spec §4.2. When `prioritize_oldest_lpa` is set (OQ2, default
    /// `true`), the returned pairs are ordered oldest-LPA-first (nulls first) to reduce
    /// starvation.
    pub async fn select(&self) -> Result<Vec<(ChannelSnapshot, ParseMode)>, SchedulerError> {
        let mut channels = self.repository.list_active_channels().await?;

        if self.config.prioritize_oldest_lpa {
            channels.sort_by_key(|c| c.last_parsed_at.unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC));
        }

        let now = self.clock.now();
        Ok(channels
            .into_iter()
            .map(|channel| {
                let mode = self.decide_mode(&channel, now);
                (channel, mode)
            })
            .collect())
    }

    fn decide_mode(&self, channel: &ChannelSnapshot, now: chrono::DateTime<chrono::Utc>) -> ParseMode {
        match self.config.mode_override {
            ModeOverride::Historical => return ParseMode::Historical,
            ModeOverride::Incremental => return ParseMode::Incremental,
            ModeOverride::Auto => {}
        }

        let Some(lpa) = channel.last_parsed_at else {
            return ParseMode::Historical;
        };

        let stale_threshold =
            chrono::Duration::seconds(self.config.lpa_stale_threshold.as_secs() as i64);
        if now - lpa > stale_threshold {
            return ParseMode::Historical;
        }

        ParseMode::Incremental
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeChannelRepository, FakeClock};
    use chrono::Duration as ChronoDuration;
    use uuid::Uuid;

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            lpa_stale_threshold: std::time::Duration::from_secs(7 * 24 * 3600),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn null_lpa_is_historical() {
        let clock = Arc::new(FakeClock::new(chrono::Utc::now()));
        let repo = Arc::new(FakeChannelRepository::new(vec![ChannelSnapshot {
            id: Uuid::new_v4(),
            external_channel_id: 1,
            last_parsed_at: None,
        }]));
        let selector = ChannelSelector::new(repo, config(), clock);
        let pairs = selector.select().await.unwrap();
        assert_eq!(pairs[0].1, ParseMode::Historical);
    }

    #[tokio::test]
    async fn recent_lpa_is_incremental() {
        let now = chrono::Utc::now();
        let clock = Arc::new(FakeClock::new(now));
        let repo = Arc::new(FakeChannelRepository::new(vec![ChannelSnapshot {
            id: Uuid::new_v4(),
            external_channel_id: 1,
            last_parsed_at: Some(now - ChronoDuration::minutes(10)),
        }]));
        let selector = ChannelSelector::new(repo, config(), clock);
        let pairs = selector.select().await.unwrap();
        assert_eq!(pairs[0].1, ParseMode::Incremental);
    }

    #[tokio::test]
    async fn stale_lpa_forces_historical_p9() {
        let now = chrono::Utc::now();
        let clock = Arc::new(FakeClock::new(now));
        let repo = Arc::new(FakeChannelRepository::new(vec![ChannelSnapshot {
            id: Uuid::new_v4(),
            external_channel_id: 1,
            last_parsed_at: Some(now - ChronoDuration::days(30)),
        }]));
        let selector = ChannelSelector::new(
            repo,
            SchedulerConfig {
                lpa_stale_threshold: std::time::Duration::from_secs(7 * 24 * 3600),
                ..Default::default()
            },
            clock,
        );
        let pairs = selector.select().await.unwrap();
        assert_eq!(pairs[0].1, ParseMode::Historical);
    }

    #[tokio::test]
    async fn override_wins_regardless_of_lpa() {
        let now = chrono::Utc::now();
        let clock = Arc::new(FakeClock::new(now));
        let repo = Arc::new(FakeChannelRepository::new(vec![ChannelSnapshot {
            id: Uuid::new_v4(),
            external_channel_id: 1,
            last_parsed_at: Some(now - ChronoDuration::minutes(1)),
        }]));
        let selector = ChannelSelector::new(
            repo,
            SchedulerConfig {
                mode_override: ModeOverride::Historical,
                ..Default::default()
            },
            clock,
        );
        let pairs = selector.select().await.unwrap();
        assert_eq!(pairs[0].1, ParseMode::Historical);
    }

    #[tokio::test]
    async fn oldest_lpa_first_ordering() {
        let now = chrono::Utc::now();
        let clock = Arc::new(FakeClock::new(now));
        let newer = Uuid::new_v4();
        let older = Uuid::new_v4();
        let repo = Arc::new(FakeChannelRepository::new(vec![
            ChannelSnapshot {
                id: newer,
                external_channel_id: 1,
                last_parsed_at: Some(now - ChronoDuration::minutes(5)),
            },
            ChannelSnapshot {
                id: older,
                external_channel_id: 2,
                last_parsed_at: Some(now - ChronoDuration::days(1)),
            },
        ]));
        let selector = ChannelSelector::new(repo, config(), clock);
        let pairs = selector.select().await.unwrap();
        assert_eq!(pairs[0].0.id, older);
        assert_eq!(pairs[1].0.id, newer);
    }
}
