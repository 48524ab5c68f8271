// Copyright 2020 - developers of the `grammers` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The incremental parsing scheduler's core: the Tick Loop, Channel Selector, Dispatcher,
//! Watermark Manager and Parse Orchestrator described by this repository's design document.
//!
//! This crate owns no I/O of its own. It is driven entirely through the narrow collaborator
//! traits in [`traits`]; concrete backends live in `scheduler-store` (relational + fast store),
//! `scheduler-source` (Message Source) and `scheduler-events` (Event Publisher). Enable the
//! `test-util` feature to pull in [`testutil`]'s in-memory doubles for every collaborator.

pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod model;
pub mod parse;
pub mod selector;
pub mod tick;
pub mod traits;
pub mod watermark;

#[cfg(any(test, feature = "test-util"))]
pub mod testutil;

pub use clock::{Clock, SharedClock, SystemClock};
pub use config::{ModeOverride, SchedulerConfig};
pub use dispatch::{Dispatcher, ExponentialRetryPolicy, RetryPolicy};
pub use error::{ConfigError, SchedulerError, SourceError};
pub use metrics::{Metrics, NoopMetrics, RetryReason, TickAttempt};
pub use model::{
    ChannelSnapshot, HwmRecord, LeaseToken, MediaDescriptor, MessagePage, ParseMode, ParseOutcome,
    ParseResult, ParsedPost, PostParsedEvent, RawMessage, RetryState, TickSummary,
};
pub use parse::ParseOrchestrator;
pub use selector::ChannelSelector;
pub use tick::TickLoop;
pub use traits::{ChannelRepository, EventPublisher, FastStore, Lease, MessageSource, PostSink};
pub use watermark::WatermarkManager;

/// Wires a `Scheduler`'s five collaborators together and exposes the single entry point
/// `scheduler-daemon` drives: `run_forever`. This is the "single logical component" spec §2
/// describes; everything above is its internals, assembled here.
pub struct Scheduler {
    tick_loop: std::sync::Arc<TickLoop>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        channel_repository: std::sync::Arc<dyn ChannelRepository>,
        fast_store: std::sync::Arc<dyn FastStore>,
        message_source: std::sync::Arc<dyn MessageSource>,
        post_sink: std::sync::Arc<dyn PostSink>,
        event_publisher: std::sync::Arc<dyn EventPublisher>,
        metrics: std::sync::Arc<dyn Metrics>,
        clock: SharedClock,
        config: SchedulerConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let selector = std::sync::Arc::new(ChannelSelector::new(
            channel_repository.clone(),
            config.clone(),
            clock.clone(),
        ));
        let watermark = std::sync::Arc::new(WatermarkManager::new(
            channel_repository,
            fast_store.clone(),
            config.clone(),
            clock.clone(),
        ));
        let orchestrator = std::sync::Arc::new(ParseOrchestrator::new(
            message_source,
            post_sink,
            event_publisher,
            watermark,
            config.clone(),
            clock,
        ));
        let retry_policy = std::sync::Arc::new(ExponentialRetryPolicy::new(config.clone()));
        let dispatcher = std::sync::Arc::new(Dispatcher::new(
            orchestrator,
            retry_policy,
            metrics.clone(),
            config.clone(),
        ));
        let tick_loop = std::sync::Arc::new(TickLoop::new(selector, dispatcher, fast_store, metrics, config));

        Ok(Self { tick_loop })
    }

    /// Runs the scheduler until `cancel` fires. Never returns an error: failures inside a tick
    /// are logged and metered, never propagated here (spec §4.1).
    pub async fn run_forever(&self, cancel: tokio_util::sync::CancellationToken) {
        self.tick_loop.run_forever(cancel).await
    }
}
