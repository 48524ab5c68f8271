// Copyright 2020 - developers of the `grammers` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Persistence of the parsed post itself, beyond the channel watermark, is explicitly out of
//! scope for this repository's core (spec §1) — the `PostSink` this binary wires in is a stub
//! until a real storage collaborator is plugged in.

use async_trait::async_trait;
use scheduler_core::{ParsedPost, PostSink, SchedulerError};
use uuid::Uuid;

pub struct NoopPostSink;

#[async_trait]
impl PostSink for NoopPostSink {
    async fn persist(&self, channel_id: Uuid, post: ParsedPost) -> Result<(), SchedulerError> {
        log::debug!(
            "discarding parsed post (no storage collaborator configured): channel={channel_id} message_id={}",
            post.telegram_message_id
        );
        Ok(())
    }
}
