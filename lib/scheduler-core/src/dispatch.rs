// Copyright 2020 - developers of the `grammers` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! 4.3 Dispatcher: bounded-concurrency fan-out over `(channel, mode)` pairs, with per-channel
//! retry/backoff and rate-limit honoring. The worker pool mirrors
//! `grammers-mtsender::SenderPoolRunner`'s one-task-per-unit-of-work shape: a `JoinSet` gated by
//! a `Semaphore` of size `max_concurrency`.

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::metrics::{Metrics, RetryReason};
use crate::model::{ChannelSnapshot, ParseMode, ParseOutcome, RetryState, TickSummary};
use crate::parse::ParseOrchestrator;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Ported from `grammers-mtsender::reconnection::ReconnectionPolicy`: tells the Dispatcher
/// whether a failed parse should be retried and, if so, after how long.
pub trait RetryPolicy: Send + Sync {
    fn should_retry(&self, attempts: u32) -> ControlFlow<(), Duration>;
}

/// The exponential-backoff policy of spec §4.3: `min(base * 2^(k-1), cap)`, capped at
/// `retry_max` attempts.
pub struct ExponentialRetryPolicy {
    config: SchedulerConfig,
}

impl ExponentialRetryPolicy {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }
}

impl RetryPolicy for ExponentialRetryPolicy {
    fn should_retry(&self, attempts: u32) -> ControlFlow<(), Duration> {
        if attempts >= self.config.retry_max {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(self.config.backoff_for_attempt(attempts + 1))
        }
    }
}

pub struct Dispatcher {
    orchestrator: Arc<ParseOrchestrator>,
    retry_policy: Arc<dyn RetryPolicy>,
    metrics: Arc<dyn Metrics>,
    config: SchedulerConfig,
}

impl Dispatcher {
    pub fn new(
        orchestrator: Arc<ParseOrchestrator>,
        retry_policy: Arc<dyn RetryPolicy>,
        metrics: Arc<dyn Metrics>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            orchestrator,
            retry_policy,
            metrics,
            config,
        }
    }

    /// Fans `pairs` out over a bounded worker pool, honoring `tick_deadline` and `tick_cancel`.
    /// Returns the tick's `{ parsed, skipped, failed, rate_limited }` summary (spec §4.3).
    pub async fn dispatch(
        &self,
        pairs: Vec<(ChannelSnapshot, ParseMode)>,
        tick_deadline: Instant,
        tick_cancel: CancellationToken,
    ) -> TickSummary {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
        let mut tasks: JoinSet<TickSummary> = JoinSet::new();

        for (channel, mode) in pairs {
            if tick_cancel.is_cancelled() || Instant::now() >= tick_deadline {
                let mut summary = TickSummary::default();
                summary.skip();
                tasks.spawn(async move { summary });
                continue;
            }

            let semaphore = semaphore.clone();
            let orchestrator = self.orchestrator.clone();
            let retry_policy = self.retry_policy.clone();
            let metrics = self.metrics.clone();
            let parse_timeout = self.config.parse_timeout();
            let tick_cancel = tick_cancel.clone();

            tasks.spawn(async move {
                let Ok(permit) = semaphore.acquire_owned().await else {
                    let mut summary = TickSummary::default();
                    summary.skip();
                    return summary;
                };

                let outcome = run_channel(
                    &channel,
                    mode,
                    orchestrator,
                    retry_policy,
                    metrics,
                    parse_timeout,
                    tick_deadline,
                    tick_cancel,
                )
                .await;

                drop(permit);

                let mut summary = TickSummary::default();
                summary.record(&outcome);
                summary
            });
        }

        let mut total = TickSummary::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(summary) => {
                    total.parsed += summary.parsed;
                    total.skipped += summary.skipped;
                    total.failed += summary.failed;
                    total.rate_limited += summary.rate_limited;
                }
                Err(_join_error) => {
                    // A worker task panicked; count it as a failed channel rather than
                    // propagating the panic out of the tick (spec §7: per-channel errors never
                    // cascade to sibling channels).
                    log::error!("dispatcher worker task panicked");
                    total.failed += 1;
                }
            }
        }

        total
    }
}

/// Drives one channel's retry loop: calls `ParseOrchestrator::parse`, classifies the error (if
/// any), and decides whether/how long to wait before the next attempt, per spec §4.3's retry
/// policy and §7's error taxonomy.
#[allow(clippy::too_many_arguments)]
async fn run_channel(
    channel: &ChannelSnapshot,
    mode: ParseMode,
    orchestrator: Arc<ParseOrchestrator>,
    retry_policy: Arc<dyn RetryPolicy>,
    metrics: Arc<dyn Metrics>,
    parse_timeout: Duration,
    tick_deadline: Instant,
    tick_cancel: CancellationToken,
) -> ParseOutcome {
    let mut retry_state = RetryState::default();

    loop {
        if tick_cancel.is_cancelled() {
            return ParseOutcome::Partial;
        }

        let remaining_in_tick = tick_deadline.saturating_duration_since(Instant::now());
        if remaining_in_tick.is_zero() {
            return ParseOutcome::Partial;
        }
        let parse_deadline = Instant::now() + parse_timeout.min(remaining_in_tick);

        let per_parse_cancel = tick_cancel.child_token();
        let timer_cancel = per_parse_cancel.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(parse_deadline.into()).await;
            timer_cancel.cancel();
        });

        let result = orchestrator.parse(channel, mode, &per_parse_cancel).await;
        timer.abort();

        match result {
            Ok(parse_result) => {
                metrics.record_parse_attempt(mode_label(mode), outcome_label(&parse_result.outcome));
                return parse_result.outcome;
            }
            Err(SchedulerError::RateLimited(wait)) => {
                retry_state.accumulated_rate_limit_wait += wait;
                metrics.record_rate_limit_wait(channel.external_channel_id, wait);

                let remaining = tick_deadline.saturating_duration_since(Instant::now());
                if wait > remaining {
                    log::debug!(
                        "channel {} deferred: rate-limit wait {wait:?} would overrun the tick",
                        channel.external_channel_id
                    );
                    metrics.record_parse_attempt(mode_label(mode), "rate_limited_deferred");
                    return ParseOutcome::RateLimitedDeferred;
                }

                log::debug!(
                    "channel {} rate limited, waiting {wait:?} (does not count against retry budget)",
                    channel.external_channel_id
                );
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = tick_cancel.cancelled() => return ParseOutcome::Partial,
                }
                // Rate-limit waits do not consume the retry budget; loop again without
                // incrementing `retry_state.attempt`.
            }
            Err(error) if error.is_retryable() => {
                let reason = match &error {
                    SchedulerError::TransientUpstream(_) => RetryReason::TransientUpstream,
                    SchedulerError::StorageError(_) => RetryReason::StorageError,
                    _ => unreachable!("is_retryable() only returns true for TransientUpstream/StorageError"),
                };
                log::warn!(
                    "channel {} transient error on attempt {}: {error}",
                    channel.external_channel_id,
                    retry_state.attempt + 1
                );
                match retry_policy.should_retry(retry_state.attempt) {
                    ControlFlow::Continue(backoff) => {
                        retry_state.attempt += 1;
                        retry_state.accumulated_backoff += backoff;
                        metrics.record_retry(reason);
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = tick_cancel.cancelled() => return ParseOutcome::Partial,
                        }
                    }
                    ControlFlow::Break(()) => {
                        log::error!(
                            "channel {} exhausted {} retries: {error}",
                            channel.external_channel_id,
                            retry_state.attempt
                        );
                        metrics.record_parse_attempt(mode_label(mode), "failed");
                        return ParseOutcome::Failed;
                    }
                }
            }
            Err(error @ SchedulerError::PermanentUpstream(_)) => {
                log::error!("channel {} permanent error: {error}", channel.external_channel_id);
                metrics.record_parse_attempt(mode_label(mode), "failed");
                return ParseOutcome::Failed;
            }
            Err(error @ SchedulerError::InternalBug(_)) => {
                log::error!(
                    "channel {} hit an internal bug (invariant violated): {error}",
                    channel.external_channel_id
                );
                metrics.record_parse_attempt(mode_label(mode), "failed");
                return ParseOutcome::Failed;
            }
            Err(SchedulerError::LockContention) => {
                // Unreachable from a Parse Orchestrator call; the Tick Lock is the Tick Loop's
                // concern. Treated as an internal bug if it ever happens.
                log::error!(
                    "channel {} parse reported LockContention, which should never originate here",
                    channel.external_channel_id
                );
                return ParseOutcome::Failed;
            }
        }
    }
}

fn mode_label(mode: ParseMode) -> &'static str {
    match mode {
        ParseMode::Historical => "historical",
        ParseMode::Incremental => "incremental",
    }
}

fn outcome_label(outcome: &ParseOutcome) -> &'static str {
    match outcome {
        ParseOutcome::Ok => "ok",
        ParseOutcome::Partial => "partial",
        ParseOutcome::Failed => "failed",
        ParseOutcome::RateLimitedDeferred => "rate_limited_deferred",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::error::SourceError;
    use crate::traits::FastStore;
    use crate::testutil::{
        ConcurrencyTrackingSource, FakeChannelRepository, FakeClock, FakeEventPublisher, FakeFastStore, FakeMetrics,
        FakePostSink, ScriptedSource,
    };
    use crate::watermark::WatermarkManager;
    use uuid::Uuid;

    #[test]
    fn exponential_policy_caps_at_retry_max() {
        let config = SchedulerConfig {
            retry_max: 3,
            retry_base_seconds: 2,
            retry_cap_seconds: 60,
            ..Default::default()
        };
        let policy = ExponentialRetryPolicy::new(config);
        assert_eq!(policy.should_retry(0), ControlFlow::Continue(Duration::from_secs(2)));
        assert_eq!(policy.should_retry(1), ControlFlow::Continue(Duration::from_secs(4)));
        assert_eq!(policy.should_retry(2), ControlFlow::Continue(Duration::from_secs(8)));
        assert_eq!(policy.should_retry(3), ControlFlow::Break(()));
    }

    fn channel(external_channel_id: i64) -> ChannelSnapshot {
        ChannelSnapshot {
            id: Uuid::new_v4(),
            external_channel_id,
            last_parsed_at: None,
        }
    }

    fn dispatcher_with_source(
        source: Arc<dyn crate::traits::MessageSource>,
        config: SchedulerConfig,
        metrics: Arc<dyn Metrics>,
    ) -> Dispatcher {
        let (dispatcher, _repo, _fast_store) = dispatcher_with_source_and_stores(source, config, metrics);
        dispatcher
    }

    fn dispatcher_with_source_and_stores(
        source: Arc<dyn crate::traits::MessageSource>,
        config: SchedulerConfig,
        metrics: Arc<dyn Metrics>,
    ) -> (Dispatcher, Arc<FakeChannelRepository>, Arc<FakeFastStore>) {
        let clock = Arc::new(FakeClock::new(chrono::Utc::now()));
        let repo = Arc::new(FakeChannelRepository::default());
        let fast_store = Arc::new(FakeFastStore::default());
        let watermark = Arc::new(WatermarkManager::new(
            repo.clone(),
            fast_store.clone(),
            config.clone(),
            clock.clone(),
        ));
        let orchestrator = Arc::new(ParseOrchestrator::new(
            source,
            Arc::new(FakePostSink::default()),
            Arc::new(FakeEventPublisher::default()),
            watermark,
            config.clone(),
            clock as Arc<dyn Clock>,
        ));
        let retry_policy = Arc::new(ExponentialRetryPolicy::new(config.clone()));
        let dispatcher = Dispatcher::new(orchestrator, retry_policy, metrics, config);
        (dispatcher, repo, fast_store)
    }

    fn raw(id: i64, posted_at: chrono::DateTime<chrono::Utc>) -> crate::model::RawMessage {
        crate::model::RawMessage {
            message_id: id,
            posted_at,
            content: format!("msg {id}"),
            urls: vec![],
            media: vec![],
        }
    }

    #[tokio::test]
    async fn no_more_than_max_concurrency_parses_run_at_once_p7() {
        let config = SchedulerConfig {
            max_concurrency: 2,
            ..Default::default()
        };
        let source = Arc::new(ConcurrencyTrackingSource::new(Duration::from_millis(30)));
        let dispatcher = dispatcher_with_source(source.clone(), config.clone(), Arc::new(FakeMetrics::default()));

        let pairs: Vec<_> = (1..=6).map(|id| (channel(id), ParseMode::Historical)).collect();
        let deadline = Instant::now() + Duration::from_secs(10);
        let cancel = CancellationToken::new();

        let summary = dispatcher.dispatch(pairs, deadline, cancel).await;

        assert_eq!(summary.parsed, 6);
        assert!(
            source.peak_concurrency() <= config.max_concurrency,
            "observed peak concurrency {} exceeds max_concurrency {}",
            source.peak_concurrency(),
            config.max_concurrency
        );
        // With 6 channels and a concurrency of 2 each holding the source for 30ms, some
        // contention must actually have been observed — otherwise this test would pass
        // vacuously even with no bound enforced at all.
        assert!(source.peak_concurrency() >= 2, "test never exercised real concurrency");
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_mid_parse_waits_then_resumes_without_spending_retry_budget_p6_scenario_c() {
        let now = chrono::Utc::now();
        let retry_after = Duration::from_secs(20);
        let config = SchedulerConfig {
            historical_hours: 1,
            ..Default::default()
        };

        // First parse attempt: one page of messages, then the source raises a rate limit before
        // the next page. The whole `parse()` call aborts on that error, so the retry loop in
        // `run_channel` calls `orchestrator.parse` again after waiting; that second attempt
        // resumes from the HWM the first page already committed and finds the rest of the
        // messages.
        let t_minus_40 = now - chrono::Duration::minutes(40);
        let t_minus_30 = now - chrono::Duration::minutes(30);
        let t_minus_10 = now - chrono::Duration::minutes(10);
        let source = Arc::new(ScriptedSource::new(vec![
            Ok(crate::model::MessagePage {
                messages: vec![raw(1, t_minus_40), raw(2, t_minus_30)],
                has_more: true,
            }),
            Err(SourceError::RateLimited(retry_after)),
            Ok(crate::model::MessagePage {
                messages: vec![raw(3, t_minus_10)],
                has_more: false,
            }),
        ]));
        let metrics = Arc::new(FakeMetrics::default());
        let (dispatcher, repo, fast_store) =
            dispatcher_with_source_and_stores(source, config, metrics.clone());

        let deadline = Instant::now() + Duration::from_secs(300);
        let cancel = CancellationToken::new();
        let chan = channel(1);
        let channel_id = chan.id;

        let started = tokio::time::Instant::now();
        let summary = dispatcher
            .dispatch(vec![(chan, ParseMode::Historical)], deadline, cancel)
            .await;
        let elapsed = started.elapsed();

        assert_eq!(summary.parsed, 1);
        assert!(
            elapsed >= retry_after,
            "actual wait {elapsed:?} must be at least the rate limit's retry_after {retry_after:?}"
        );
        assert_eq!(
            metrics.retries.load(std::sync::atomic::Ordering::SeqCst),
            0,
            "a rate-limit wait must not consume the retry budget"
        );

        let hwm = fast_store.read_hwm(channel_id).await.unwrap().unwrap();
        assert_eq!(hwm.last_ok_timestamp, t_minus_10);
        assert_eq!(hwm.last_ok_message_id, 3);
        assert_eq!(repo.last_parsed_at(channel_id), Some(t_minus_10));
    }
}
