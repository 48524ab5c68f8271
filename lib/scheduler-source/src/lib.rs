// Copyright 2020 - developers of the `grammers` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The opaque Telegram-ingest client the scheduler drives (spec §1/§6) is out of scope for this
//! repository: authentication, connection lifecycle and session storage belong to that
//! implementation, not here. What lives in this crate is the `MessageSource` contract itself
//! (re-exported from `scheduler-core`) and [`InMemoryMessageSource`], an in-memory double used
//! to exercise the scheduler end-to-end without a live Telegram connection.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_core::{MessageSource, MessagePage, RawMessage, SourceError};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

pub use scheduler_core::MessageSource as MessageSourceContract;

/// Per-channel state for the in-memory double: its full message history (ascending `posted_at`),
/// an optional permanent failure, and an optional one-shot rate-limit to raise on the first
/// call.
#[derive(Default)]
struct ChannelScript {
    messages: Vec<RawMessage>,
    permanent_error: Option<String>,
    pending_rate_limit: Option<Duration>,
}

/// An in-memory `MessageSource`. Messages are returned in pages honoring the `since`/`page_size`
/// contract (ascending `posted_at`, a message with `posted_at == since` is included per spec
/// §4.5's "duplicate fetch window" edge case).
#[derive(Default)]
pub struct InMemoryMessageSource {
    channels: Mutex<HashMap<i64, ChannelScript>>,
}

impl InMemoryMessageSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds (or replaces) the message history for one channel.
    pub fn set_messages(&self, external_channel_id: i64, mut messages: Vec<RawMessage>) {
        messages.sort_by_key(|m| m.posted_at);
        let mut guard = self.channels.lock().unwrap();
        guard.entry(external_channel_id).or_default().messages = messages;
    }

    /// The next call to `fetch_messages` for this channel raises `SourceError::Permanent(reason)`
    /// instead of returning a page.
    pub fn fail_permanently(&self, external_channel_id: i64, reason: impl Into<String>) {
        let mut guard = self.channels.lock().unwrap();
        guard.entry(external_channel_id).or_default().permanent_error = Some(reason.into());
    }

    /// The next call to `fetch_messages` for this channel raises
    /// `SourceError::RateLimited(retry_after)` once, then resumes serving pages normally —
    /// models spec §8 Scenario C.
    pub fn rate_limit_once(&self, external_channel_id: i64, retry_after: Duration) {
        let mut guard = self.channels.lock().unwrap();
        guard.entry(external_channel_id).or_default().pending_rate_limit = Some(retry_after);
    }
}

#[async_trait]
impl MessageSource for InMemoryMessageSource {
    async fn fetch_messages(
        &self,
        external_channel_id: i64,
        since: DateTime<Utc>,
        page_size: u32,
    ) -> Result<MessagePage, SourceError> {
        let mut guard = self.channels.lock().unwrap();
        let Some(script) = guard.get_mut(&external_channel_id) else {
            return Ok(MessagePage {
                messages: vec![],
                has_more: false,
            });
        };

        if let Some(reason) = script.permanent_error.take() {
            return Err(SourceError::Permanent(reason));
        }

        if let Some(retry_after) = script.pending_rate_limit.take() {
            return Err(SourceError::RateLimited(retry_after));
        }

        let matching: Vec<RawMessage> = script
            .messages
            .iter()
            .filter(|m| m.posted_at >= since)
            .cloned()
            .collect();

        let page_size = page_size.max(1) as usize;
        let has_more = matching.len() > page_size;
        let page = matching.into_iter().take(page_size).collect();

        Ok(MessagePage {
            messages: page,
            has_more,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: i64, posted_at: DateTime<Utc>) -> RawMessage {
        RawMessage {
            message_id: id,
            posted_at,
            content: format!("message {id}"),
            urls: vec![],
            media: vec![],
        }
    }

    #[tokio::test]
    async fn paginates_with_overlap_at_the_boundary() {
        let now = Utc::now();
        let source = InMemoryMessageSource::new();
        let messages: Vec<_> = (0..5)
            .map(|i| msg(i, now + chrono::Duration::minutes(i)))
            .collect();
        source.set_messages(1, messages.clone());

        let page1 = source.fetch_messages(1, now, 2).await.unwrap();
        assert_eq!(page1.messages.len(), 2);
        assert!(page1.has_more);

        let last = page1.messages.last().unwrap().posted_at;
        let page2 = source.fetch_messages(1, last, 2).await.unwrap();
        // The boundary message reappears, per the duplicate-fetch-window edge case.
        assert_eq!(page2.messages[0].posted_at, last);
    }

    #[tokio::test]
    async fn rate_limit_once_then_recovers() {
        let now = Utc::now();
        let source = InMemoryMessageSource::new();
        source.set_messages(1, vec![msg(1, now)]);
        source.rate_limit_once(1, Duration::from_secs(20));

        let first = source.fetch_messages(1, now, 10).await;
        assert!(matches!(first, Err(SourceError::RateLimited(d)) if d == Duration::from_secs(20)));

        let second = source.fetch_messages(1, now, 10).await.unwrap();
        assert_eq!(second.messages.len(), 1);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried_by_the_double_itself() {
        let source = InMemoryMessageSource::new();
        source.set_messages(1, vec![]);
        source.fail_permanently(1, "channel deleted");

        let result = source.fetch_messages(1, Utc::now(), 10).await;
        assert!(matches!(result, Err(SourceError::Permanent(reason)) if reason == "channel deleted"));
    }
}
