// Copyright 2020 - developers of the `grammers` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The `FastStore` collaborator (spec §6), backed by Redis: the Tick Lock (`SET key value NX
//! EX ttl`) and per-channel HWM (hash SET/GET). Must survive a single-replica crash; cluster-wide
//! eviction degrades the scheduler to LPA-only starting points per spec §6, not a correctness
//! failure.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use scheduler_core::{HwmRecord, Lease, LeaseToken, SchedulerError};
use std::time::Duration;
use uuid::Uuid;

fn hwm_key(channel_id: Uuid) -> String {
    format!("hwm:{channel_id}")
}

pub struct RedisFastStore {
    conn: ConnectionManager,
}

impl RedisFastStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    pub async fn connect(redis_url: &str) -> Result<Self, SchedulerError> {
        let client = redis::Client::open(redis_url)
            .map_err(|error| SchedulerError::StorageError(format!("invalid redis URL: {error}")))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|error| SchedulerError::StorageError(format!("connecting to redis: {error}")))?;
        Ok(Self::new(conn))
    }
}

struct RedisLease {
    key: String,
    token: LeaseToken,
    conn: ConnectionManager,
}

#[async_trait]
impl Lease for RedisLease {
    fn token(&self) -> &LeaseToken {
        &self.token
    }

    /// Releases with a compare-and-delete Lua script so we never delete a lease some other
    /// replica acquired after ours expired — the textbook Redis distributed-lock release
    /// pattern.
    async fn release(&self) -> Result<(), SchedulerError> {
        const RELEASE_SCRIPT: &str = r#"
            if redis.call("get", KEYS[1]) == ARGV[1] then
                return redis.call("del", KEYS[1])
            else
                return 0
            end
        "#;

        let mut conn = self.conn.clone();
        redis::Script::new(RELEASE_SCRIPT)
            .key(&self.key)
            .arg(&self.token.0)
            .invoke_async::<_, i64>(&mut conn)
            .await
            .map(|_| ())
            .map_err(|error| SchedulerError::StorageError(format!("releasing lock {}: {error}", self.key)))
    }
}

#[async_trait]
impl scheduler_core::FastStore for RedisFastStore {
    async fn try_acquire_lock(&self, key: &str, ttl: Duration) -> Result<Option<Box<dyn Lease>>, SchedulerError> {
        let token = LeaseToken(Uuid::new_v4().to_string());
        let mut conn = self.conn.clone();

        let acquired: bool = redis::cmd("SET")
            .arg(key)
            .arg(&token.0)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map(|reply: Option<String>| reply.is_some())
            .map_err(|error| SchedulerError::StorageError(format!("acquiring lock {key}: {error}")))?;

        if !acquired {
            return Ok(None);
        }

        Ok(Some(Box::new(RedisLease {
            key: key.to_string(),
            token,
            conn: self.conn.clone(),
        })))
    }

    async fn lock_holder(&self, key: &str) -> Result<Option<LeaseToken>, SchedulerError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn
            .get(key)
            .await
            .map_err(|error| SchedulerError::StorageError(format!("reading lock holder {key}: {error}")))?;
        Ok(value.map(LeaseToken))
    }

    async fn read_hwm(&self, channel_id: Uuid) -> Result<Option<HwmRecord>, SchedulerError> {
        let mut conn = self.conn.clone();
        let key = hwm_key(channel_id);
        let fields: Vec<(String, String)> = conn
            .hgetall(&key)
            .await
            .map_err(|error| SchedulerError::StorageError(format!("reading hwm {key}: {error}")))?;

        if fields.is_empty() {
            return Ok(None);
        }

        let mut last_ok_timestamp = None;
        let mut last_ok_message_id = None;
        let mut updated_at = None;

        for (field, value) in fields {
            match field.as_str() {
                "last_ok_timestamp" => last_ok_timestamp = parse_timestamp(&value),
                "last_ok_message_id" => last_ok_message_id = value.parse::<i64>().ok(),
                "updated_at" => updated_at = parse_timestamp(&value),
                _ => {}
            }
        }

        match (last_ok_timestamp, last_ok_message_id, updated_at) {
            (Some(last_ok_timestamp), Some(last_ok_message_id), Some(updated_at)) => Ok(Some(HwmRecord {
                last_ok_timestamp,
                last_ok_message_id,
                updated_at,
            })),
            _ => Err(SchedulerError::StorageError(format!(
                "malformed hwm hash for {key}"
            ))),
        }
    }

    async fn write_hwm(&self, channel_id: Uuid, record: HwmRecord) -> Result<(), SchedulerError> {
        let mut conn = self.conn.clone();
        let key = hwm_key(channel_id);
        let fields = [
            ("last_ok_timestamp", record.last_ok_timestamp.timestamp_millis().to_string()),
            ("last_ok_message_id", record.last_ok_message_id.to_string()),
            ("updated_at", record.updated_at.timestamp_millis().to_string()),
        ];
        conn.hset_multiple(&key, &fields)
            .await
            .map_err(|error| SchedulerError::StorageError(format!("writing hwm {key}: {error}")))
    }
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let millis: i64 = value.parse().ok()?;
    Utc.timestamp_millis_opt(millis).single()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hwm_key_is_namespaced_per_channel() {
        let id = Uuid::new_v4();
        assert_eq!(hwm_key(id), format!("hwm:{id}"));
    }

    #[test]
    fn parse_timestamp_round_trips_millis() {
        let now = Utc::now();
        let millis = now.timestamp_millis();
        let parsed = parse_timestamp(&millis.to_string()).expect("valid millis");
        assert_eq!(parsed.timestamp_millis(), millis);
    }

    #[test]
    fn parse_timestamp_rejects_garbage() {
        assert!(parse_timestamp("not-a-number").is_none());
    }
}
