// Copyright 2020 - developers of the `grammers` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! 4.1 Tick Loop: fires a tick every `tick_interval`, guaranteeing single-writer semantics
//! across replicas via the Tick Lock held in the fast store.

use crate::config::SchedulerConfig;
use crate::dispatch::Dispatcher;
use crate::metrics::{Metrics, TickAttempt};
use crate::model::TickSummary;
use crate::selector::ChannelSelector;
use crate::traits::FastStore;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

const TICK_LOCK_KEY: &str = "scheduler:tick_lock";

pub struct TickLoop {
    selector: Arc<ChannelSelector>,
    dispatcher: Arc<Dispatcher>,
    fast_store: Arc<dyn FastStore>,
    metrics: Arc<dyn Metrics>,
    config: SchedulerConfig,
}

impl TickLoop {
    pub fn new(
        selector: Arc<ChannelSelector>,
        dispatcher: Arc<Dispatcher>,
        fast_store: Arc<dyn FastStore>,
        metrics: Arc<dyn Metrics>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            selector,
            dispatcher,
            fast_store,
            metrics,
            config,
        }
    }

    /// Cooperative loop: wait for the next tick instant, attempt lock acquisition, run the tick
    /// body under scoped acquisition (guaranteed release on every exit path, including panics),
    /// repeat until `cancel` fires. Errors inside a tick are logged, never propagated out of the
    /// loop (spec §4.1).
    pub async fn run_forever(&self, cancel: CancellationToken) {
        if !self.config.enabled {
            log::info!(
                "incremental parsing is disabled (FEATURE_INCREMENTAL_PARSING_ENABLED=false); not ticking"
            );
            return;
        }

        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("tick loop cancelled, shutting down");
                    return;
                }
                _ = interval.tick() => {}
            }

            self.attempt_tick(&cancel).await;
        }
    }

    async fn attempt_tick(&self, cancel: &CancellationToken) {
        let lease = match self
            .fast_store
            .try_acquire_lock(TICK_LOCK_KEY, self.config.lock_ttl())
            .await
        {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                log::info!("another replica currently holds the tick lock, skipping this tick");
                self.metrics.record_tick_attempt(TickAttempt::Lost);
                return;
            }
            Err(error) => {
                log::warn!("tick lock store unavailable, skipping this tick: {error}");
                self.metrics.record_tick_attempt(TickAttempt::Lost);
                return;
            }
        };

        self.metrics.record_tick_attempt(TickAttempt::Acquired);

        let tick_cancel = cancel.child_token();
        let deadline = Instant::now() + self.config.max_tick_duration();

        // The lease's own `Drop` impl would eventually let the lock expire via TTL even if we
        // never got here, but we always want an explicit release on every exit path (Invariant
        // 5 / P8), panics included — hence driving the tick body through `catch_unwind` instead
        // of letting a panic unwind straight out of this function.
        match AssertUnwindSafe(self.run_tick_body(deadline, tick_cancel))
            .catch_unwind()
            .await
        {
            Ok(summary) => {
                log::info!(
                    "tick complete: parsed={} skipped={} failed={} rate_limited={}",
                    summary.parsed,
                    summary.skipped,
                    summary.failed,
                    summary.rate_limited
                );
                self.metrics.set_last_successful_tick(chrono::Utc::now().timestamp());
            }
            Err(panic) => {
                log::error!("tick body panicked: {}", panic_message(&panic));
            }
        }

        if let Err(error) = lease.release().await {
            log::error!("failed to release tick lock: {error}");
        }
    }

    async fn run_tick_body(&self, deadline: Instant, tick_cancel: CancellationToken) -> TickSummary {
        let pairs = match self.selector.select().await {
            Ok(pairs) => pairs,
            Err(error) => {
                log::error!("channel selection failed, abandoning this tick: {error}");
                return TickSummary::default();
            }
        };

        if Instant::now() >= deadline {
            log::warn!(
                "tick budget exhausted before dispatch started; processing zero channels this tick"
            );
            return TickSummary::default();
        }

        self.dispatcher.dispatch(pairs, deadline, tick_cancel).await
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::dispatch::ExponentialRetryPolicy;
    use crate::metrics::NoopMetrics;
    use crate::model::ChannelSnapshot;
    use crate::parse::ParseOrchestrator;
    use crate::testutil::{
        FakeChannelRepository, FakeClock, FakeEventPublisher, FakeFastStore, FakeMetrics, FakePostSink,
        PanickingChannelRepository, RecordingSource, ScriptedSource,
    };
    use crate::traits::ChannelRepository;
    use crate::watermark::WatermarkManager;
    use std::collections::HashSet;
    use uuid::Uuid;

    fn build_tick_loop(
        config: SchedulerConfig,
        repo: Arc<dyn ChannelRepository>,
        fast_store: Arc<FakeFastStore>,
        clock: Arc<FakeClock>,
        metrics: Arc<dyn Metrics>,
    ) -> TickLoop {
        let selector = Arc::new(ChannelSelector::new(repo.clone(), config.clone(), clock.clone()));
        let watermark = Arc::new(WatermarkManager::new(
            repo,
            fast_store.clone(),
            config.clone(),
            clock.clone(),
        ));
        let source = Arc::new(ScriptedSource::single_page(vec![]));
        let orchestrator = Arc::new(ParseOrchestrator::new(
            source,
            Arc::new(FakePostSink::default()),
            Arc::new(FakeEventPublisher::default()),
            watermark,
            config.clone(),
            clock.clone() as Arc<dyn Clock>,
        ));
        let retry_policy = Arc::new(ExponentialRetryPolicy::new(config.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            orchestrator,
            retry_policy,
            metrics.clone(),
            config.clone(),
        ));
        TickLoop::new(selector, dispatcher, fast_store, metrics, config)
    }

    /// A tick loop whose channel selection always panics, paired with a `RecordingSource` so a
    /// test can build a TickLoop around any `MessageSource` while keeping the panic confined to
    /// the repository.
    fn build_panicking_tick_loop(config: SchedulerConfig, fast_store: Arc<FakeFastStore>, clock: Arc<FakeClock>) -> TickLoop {
        build_tick_loop(
            config,
            Arc::new(PanickingChannelRepository) as Arc<dyn ChannelRepository>,
            fast_store,
            clock,
            Arc::new(NoopMetrics),
        )
    }

    #[tokio::test]
    async fn single_tick_releases_the_lock_on_success() {
        let clock = Arc::new(FakeClock::new(chrono::Utc::now()));
        let repo = Arc::new(FakeChannelRepository::new(vec![ChannelSnapshot {
            id: Uuid::new_v4(),
            external_channel_id: 1,
            last_parsed_at: None,
        }]));
        let fast_store = Arc::new(FakeFastStore::default());
        let config = SchedulerConfig {
            tick_interval: std::time::Duration::from_millis(50),
            ..Default::default()
        };

        let tick_loop = build_tick_loop(config, repo, fast_store.clone(), clock, Arc::new(NoopMetrics));
        let cancel = CancellationToken::new();
        tick_loop.attempt_tick(&cancel).await;

        assert!(fast_store.lock_holder(TICK_LOCK_KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn second_tick_skips_while_lock_is_held() {
        let clock = Arc::new(FakeClock::new(chrono::Utc::now()));
        let repo = Arc::new(FakeChannelRepository::new(vec![]));
        let fast_store = Arc::new(FakeFastStore::default());
        let config = SchedulerConfig::default();

        // Hold the lock externally, as another replica would.
        let _held = fast_store
            .try_acquire_lock(TICK_LOCK_KEY, config.lock_ttl())
            .await
            .unwrap()
            .unwrap();

        let tick_loop = build_tick_loop(config, repo, fast_store.clone(), clock, Arc::new(NoopMetrics));
        let cancel = CancellationToken::new();
        tick_loop.attempt_tick(&cancel).await;

        // Our tick should not have torn down the other replica's lease.
        assert!(fast_store.lock_holder(TICK_LOCK_KEY).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn panic_inside_tick_body_still_releases_the_lock_p8() {
        let clock = Arc::new(FakeClock::new(chrono::Utc::now()));
        let fast_store = Arc::new(FakeFastStore::default());
        let config = SchedulerConfig::default();

        // Channel selection panics partway through the tick body; `attempt_tick` must still
        // release the lock via its `catch_unwind` boundary rather than leaving it held until
        // TTL expiry (Invariant 5 / P8).
        let tick_loop = build_panicking_tick_loop(config, fast_store.clone(), clock);
        let cancel = CancellationToken::new();
        tick_loop.attempt_tick(&cancel).await;

        assert!(fast_store.lock_holder(TICK_LOCK_KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn n_replicas_race_the_lock_and_every_channel_still_gets_ticked_p1_scenario_e() {
        let now = chrono::Utc::now();
        let clock = Arc::new(FakeClock::new(now));
        let fast_store = Arc::new(FakeFastStore::default());
        let channels: Vec<ChannelSnapshot> = (1..=3)
            .map(|external_channel_id| ChannelSnapshot {
                id: Uuid::new_v4(),
                external_channel_id,
                last_parsed_at: None,
            })
            .collect();
        let repo = Arc::new(FakeChannelRepository::new(channels.clone()));

        let config = SchedulerConfig {
            tick_interval: std::time::Duration::from_millis(50),
            ..Default::default()
        };

        let source = Arc::new(RecordingSource::default());
        let metrics_per_replica: Vec<Arc<FakeMetrics>> =
            (0..2).map(|_| Arc::new(FakeMetrics::default())).collect();

        let mut replicas = Vec::new();
        for metrics in &metrics_per_replica {
            let selector = Arc::new(ChannelSelector::new(
                repo.clone() as Arc<dyn ChannelRepository>,
                config.clone(),
                clock.clone(),
            ));
            let watermark = Arc::new(WatermarkManager::new(
                repo.clone() as Arc<dyn ChannelRepository>,
                fast_store.clone(),
                config.clone(),
                clock.clone(),
            ));
            let orchestrator = Arc::new(ParseOrchestrator::new(
                source.clone(),
                Arc::new(FakePostSink::default()),
                Arc::new(FakeEventPublisher::default()),
                watermark,
                config.clone(),
                clock.clone() as Arc<dyn Clock>,
            ));
            let retry_policy = Arc::new(ExponentialRetryPolicy::new(config.clone()));
            let dispatcher = Arc::new(Dispatcher::new(
                orchestrator,
                retry_policy,
                metrics.clone() as Arc<dyn Metrics>,
                config.clone(),
            ));
            replicas.push(Arc::new(TickLoop::new(
                selector,
                dispatcher,
                fast_store.clone(),
                metrics.clone() as Arc<dyn Metrics>,
                config.clone(),
            )));
        }

        // Drive several tick instants across both replicas, racing for the same lock key, as
        // `run_forever` would under `tokio::time::interval` — but calling `attempt_tick` directly
        // keeps this test from depending on a background task's scheduling order.
        let cancel = CancellationToken::new();
        for _ in 0..10 {
            for replica in &replicas {
                replica.attempt_tick(&cancel).await;
            }
        }

        // P1: every replica that acquired the lock did actually tick (no double-acquisition).
        let total_acquired: usize = metrics_per_replica
            .iter()
            .map(|m| m.tick_acquired.load(std::sync::atomic::Ordering::SeqCst))
            .sum();
        assert!(total_acquired >= 1, "at least one tick must have been acquired across replicas");

        // Scenario E: despite two replicas racing for a single shared lock, every channel was
        // visited by the winning replica at least once.
        let expected: HashSet<i64> = channels.iter().map(|c| c.external_channel_id).collect();
        assert_eq!(source.seen_channels(), expected);
    }
}
