// Copyright 2020 - developers of the `grammers` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

mod config;
mod sink;

use scheduler_core::{Scheduler, SystemClock};
use scheduler_events::LoggingEventPublisher;
use scheduler_source::InMemoryMessageSource;
use scheduler_store::{PostgresChannelRepository, RedisFastStore};
use simple_logger::SimpleLogger;
use sink::NoopPostSink;
use std::error::Error;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    SimpleLogger::new().with_level(log::LevelFilter::Info).init()?;

    let config_path = std::env::args().nth(1);
    let daemon_config = config::load(config_path.as_deref())?;

    log::info!(
        "starting scheduler-daemon: tick_interval={:?} max_concurrency={}",
        daemon_config.scheduler.tick_interval,
        daemon_config.scheduler.max_concurrency
    );

    let channel_repository = Arc::new(PostgresChannelRepository::connect(&daemon_config.database_url).await?);
    let fast_store = Arc::new(RedisFastStore::connect(&daemon_config.redis_url).await?);

    // No real Telegram-backed MessageSource ships with this repository (spec §1 scopes the
    // Telegram client itself out); the in-memory double stands in until one is wired up.
    // Likewise, parsed-post persistence beyond the channel watermark is out of scope, so posts
    // are discarded rather than stored.
    let message_source = Arc::new(InMemoryMessageSource::new());
    let post_sink = Arc::new(NoopPostSink);
    let event_publisher = Arc::new(LoggingEventPublisher);
    let metrics = Arc::new(scheduler_core::NoopMetrics);
    let clock = Arc::new(SystemClock) as scheduler_core::SharedClock;

    let scheduler = Scheduler::new(
        channel_repository,
        fast_store,
        message_source,
        post_sink,
        event_publisher,
        metrics,
        clock,
        daemon_config.scheduler,
    )?;

    let cancel = CancellationToken::new();
    let shutdown_cancel = cancel.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        log::info!("shutdown signal received, cancelling the tick loop");
        shutdown_cancel.cancel();
    });

    scheduler.run_forever(cancel).await;
    log::info!("scheduler-daemon stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
