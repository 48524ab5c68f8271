// Copyright 2020 - developers of the `grammers` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The downstream `EventPublisher` collaborator (spec §6): at-least-once, carrying the natural
//! dedup key `(channel_id, telegram_message_id)` and a trace id. Deduplication is the
//! consumer's job, not this scheduler's — documented here on the contract, not implemented
//! against it (spec §9).

use async_trait::async_trait;
use scheduler_core::{EventPublisher, PostParsedEvent, SchedulerError};
use serde::Serialize;
use std::sync::Mutex;

/// A serializable mirror of `PostParsedEvent`, used by [`LoggingEventPublisher`] and any
/// transport that needs to hand the event to `serde_json` (the core's own type intentionally
/// carries no `serde` dependency, since publication transport is this crate's concern, not
/// `scheduler-core`'s).
#[derive(Serialize)]
struct EventPayload<'a> {
    channel_id: uuid::Uuid,
    telegram_message_id: i64,
    content_hash: &'a str,
    posted_at: chrono::DateTime<chrono::Utc>,
    media_count: usize,
    trace_id: uuid::Uuid,
}

impl<'a> From<&'a PostParsedEvent> for EventPayload<'a> {
    fn from(event: &'a PostParsedEvent) -> Self {
        Self {
            channel_id: event.channel_id,
            telegram_message_id: event.telegram_message_id,
            content_hash: &event.content_hash,
            posted_at: event.posted_at,
            media_count: event.media.len(),
            trace_id: event.trace_id,
        }
    }
}

/// Logs every event at `info` level as JSON instead of handing it to a real transport. Useful as
/// a default when no downstream message bus is wired up yet, and in development.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingEventPublisher;

#[async_trait]
impl EventPublisher for LoggingEventPublisher {
    async fn publish(&self, event: PostParsedEvent) -> Result<(), SchedulerError> {
        let payload = EventPayload::from(&event);
        match serde_json::to_string(&payload) {
            Ok(json) => log::info!("post-parsed event: {json}"),
            Err(error) => log::warn!("post-parsed event (failed to serialize for logging): {error}"),
        }
        Ok(())
    }
}

/// Records every published event in memory, in publish order. Used by integration tests that
/// need to assert on what the scheduler actually published (spec §8's P4 at-least-once
/// property).
#[derive(Default)]
pub struct InMemoryEventPublisher {
    events: Mutex<Vec<PostParsedEvent>>,
}

impl InMemoryEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PostParsedEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Whether `(channel_id, telegram_message_id)` was published at least once — the natural
    /// dedup key consumers would use.
    pub fn contains(&self, channel_id: uuid::Uuid, telegram_message_id: i64) -> bool {
        self.events
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.channel_id == channel_id && e.telegram_message_id == telegram_message_id)
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventPublisher {
    async fn publish(&self, event: PostParsedEvent) -> Result<(), SchedulerError> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn event(channel_id: uuid::Uuid, message_id: i64) -> PostParsedEvent {
        PostParsedEvent {
            channel_id,
            telegram_message_id: message_id,
            content_hash: "deadbeef".to_string(),
            posted_at: Utc::now(),
            media: vec![],
            trace_id: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn in_memory_publisher_dedup_lookup() {
        let publisher = InMemoryEventPublisher::new();
        let channel_id = Uuid::new_v4();
        publisher.publish(event(channel_id, 42)).await.unwrap();

        assert!(publisher.contains(channel_id, 42));
        assert!(!publisher.contains(channel_id, 43));
        assert_eq!(publisher.events().len(), 1);
    }

    #[tokio::test]
    async fn logging_publisher_never_errors() {
        let publisher = LoggingEventPublisher;
        let channel_id = Uuid::new_v4();
        assert!(publisher.publish(event(channel_id, 1)).await.is_ok());
    }
}
