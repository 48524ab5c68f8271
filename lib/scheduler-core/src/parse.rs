// Copyright 2020 - developers of the `grammers` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! 4.5 Parse Orchestrator: drives one channel's parse from its starting point to "end of
//! stream," emitting per-message events and advancing watermarks as it goes.

use crate::clock::SharedClock;
use crate::config::SchedulerConfig;
use crate::error::{SchedulerError, SourceError};
use crate::model::{
    ChannelSnapshot, ParseMode, ParseOutcome, ParseResult, ParsedPost, PostParsedEvent, RawMessage,
};
use crate::traits::{EventPublisher, MessageSource, PostSink};
use crate::watermark::WatermarkManager;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub struct ParseOrchestrator {
    source: Arc<dyn MessageSource>,
    sink: Arc<dyn PostSink>,
    publisher: Arc<dyn EventPublisher>,
    watermark: Arc<WatermarkManager>,
    config: SchedulerConfig,
    clock: SharedClock,
}

impl ParseOrchestrator {
    pub fn new(
        source: Arc<dyn MessageSource>,
        sink: Arc<dyn PostSink>,
        publisher: Arc<dyn EventPublisher>,
        watermark: Arc<WatermarkManager>,
        config: SchedulerConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            source,
            sink,
            publisher,
            watermark,
            config,
            clock,
        }
    }

    /// Runs one channel's parse per spec §4.5's five-step protocol. `cancel` is checked at page
    /// boundaries (spec §5's "each parse honors cancellation at page boundaries").
    pub async fn parse(
        &self,
        channel: &ChannelSnapshot,
        mode: ParseMode,
        cancel: &CancellationToken,
    ) -> Result<ParseResult, SchedulerError> {
        let starting_point = self.watermark.starting_point(channel, mode).await?;
        let had_hwm_before = self.watermark.hwm_exists(channel.id).await?;
        let mut since = starting_point;

        let mut message_count: u64 = 0;
        let mut overall_max: Option<(DateTime<Utc>, i64)> = None;

        loop {
            if cancel.is_cancelled() {
                return Ok(ParseResult {
                    channel_id: channel.id,
                    message_count,
                    max_posted_at: overall_max.map(|(at, _)| at),
                    outcome: ParseOutcome::Partial,
                });
            }

            let page = self
                .source
                .fetch_messages(channel.external_channel_id, since, self.config.batch_size)
                .await
                .map_err(SchedulerError::from)?;

            if page.messages.is_empty() {
                break;
            }

            debug_assert!(
                is_ascending(&page.messages),
                "Message Source violated the ascending posted_at contract"
            );

            let batch_max = self.ingest_page(channel.id, &page.messages).await?;
            message_count += page.messages.len() as u64;

            overall_max = Some(match overall_max {
                Some((at, id)) => tie_break_pair(at, id, batch_max.0, batch_max.1),
                None => batch_max,
            });

            self.watermark
                .record_batch_progress(channel.id, batch_max.0, batch_max.1)
                .await?;

            since = batch_max.0;

            if !page.has_more {
                break;
            }
        }

        match overall_max {
            Some((max_posted_at, _)) => {
                self.watermark.finalize_parse(channel.id, max_posted_at).await?;
            }
            // OQ1 (see SPEC_FULL.md): an empty incremental parse advances LPA to `now` only when
            // a prior HWM already exists for this channel, keeping the staleness safeguard (P9)
            // from misfiring on a channel that is simply quiet. A genuinely empty channel from
            // cold start (no HWM yet) leaves LPA untouched.
            None if mode == ParseMode::Incremental && had_hwm_before => {
                self.watermark.finalize_parse(channel.id, self.clock.now()).await?;
            }
            None => {}
        }

        Ok(ParseResult {
            channel_id: channel.id,
            message_count,
            max_posted_at: overall_max.map(|(at, _)| at),
            outcome: ParseOutcome::Ok,
        })
    }

    /// Persists + publishes each message of one page, in order, then returns the page's
    /// `(max_posted_at, max_message_id)` tie-broken per spec §4.5 ("prefer the message with the
    /// higher telegram_message_id").
    async fn ingest_page(
        &self,
        channel_id: Uuid,
        messages: &[RawMessage],
    ) -> Result<(DateTime<Utc>, i64), SchedulerError> {
        let mut batch_max: Option<(DateTime<Utc>, i64)> = None;

        for message in messages {
            let content_hash = content_hash(&message.content, &message.urls);

            let post = ParsedPost {
                telegram_message_id: message.message_id,
                posted_at: message.posted_at,
                content_hash: content_hash.clone(),
                media: message.media.clone(),
            };
            self.sink.persist(channel_id, post).await?;

            let event = PostParsedEvent {
                channel_id,
                telegram_message_id: message.message_id,
                content_hash,
                posted_at: message.posted_at,
                media: message.media.clone(),
                trace_id: Uuid::new_v4(),
            };
            self.publisher.publish(event).await?;

            batch_max = Some(match batch_max {
                Some((at, id)) => tie_break_pair(at, id, message.posted_at, message.message_id),
                None => (message.posted_at, message.message_id),
            });
        }

        // Only called with a non-empty page (the caller breaks out before this on empty pages).
        Ok(batch_max.expect("ingest_page called with an empty page"))
    }
}

fn tie_break_pair(
    prev_at: DateTime<Utc>,
    prev_id: i64,
    candidate_at: DateTime<Utc>,
    candidate_id: i64,
) -> (DateTime<Utc>, i64) {
    match candidate_at.cmp(&prev_at) {
        std::cmp::Ordering::Greater => (candidate_at, candidate_id),
        std::cmp::Ordering::Less => (prev_at, prev_id),
        std::cmp::Ordering::Equal => {
            if candidate_id > prev_id {
                (candidate_at, candidate_id)
            } else {
                (prev_at, prev_id)
            }
        }
    }
}

fn is_ascending(messages: &[RawMessage]) -> bool {
    messages.windows(2).all(|pair| pair[0].posted_at <= pair[1].posted_at)
}

/// Stable hash over a post's text+urls, per spec §4.5's `content_hash` field.
fn content_hash(content: &str, urls: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    for url in urls {
        hasher.update(b"\0");
        hasher.update(url.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}
