// Copyright 2020 - developers of the `grammers` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The `ChannelRepository` collaborator (spec §6), backed by PostgreSQL via `sqlx`. The core
//! only ever reads the active-channel set and writes `last_parsed_at`; everything else about a
//! channel row is owned by the external admin flow.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_core::{ChannelRepository, ChannelSnapshot, SchedulerError};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// Schema this repository expects; run once as a migration before pointing a scheduler at a
/// fresh database. Required indexes per spec §6: one to serve active-channel listing ordered by
/// staleness, one to serve LPA-based diagnostics.
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS channels (
    id UUID PRIMARY KEY,
    external_channel_id BIGINT NOT NULL UNIQUE,
    active BOOLEAN NOT NULL DEFAULT true,
    last_parsed_at TIMESTAMPTZ
);

CREATE INDEX IF NOT EXISTS channels_active_last_parsed_at_idx
    ON channels (active, last_parsed_at ASC NULLS FIRST);

CREATE INDEX IF NOT EXISTS channels_last_parsed_at_idx
    ON channels (last_parsed_at);
"#;

pub struct PostgresChannelRepository {
    pool: PgPool,
}

impl PostgresChannelRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, SchedulerError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .map_err(|error| SchedulerError::StorageError(format!("connecting to postgres: {error}")))?;
        Ok(Self::new(pool))
    }
}

#[async_trait]
impl ChannelRepository for PostgresChannelRepository {
    async fn list_active_channels(&self) -> Result<Vec<ChannelSnapshot>, SchedulerError> {
        let rows = sqlx::query(
            "SELECT id, external_channel_id, last_parsed_at \
             FROM channels WHERE active = true \
             ORDER BY last_parsed_at ASC NULLS FIRST",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|error| SchedulerError::StorageError(format!("listing active channels: {error}")))?;

        rows.into_iter()
            .map(|row| {
                Ok(ChannelSnapshot {
                    id: row
                        .try_get::<Uuid, _>("id")
                        .map_err(|error| SchedulerError::StorageError(error.to_string()))?,
                    external_channel_id: row
                        .try_get::<i64, _>("external_channel_id")
                        .map_err(|error| SchedulerError::StorageError(error.to_string()))?,
                    last_parsed_at: row
                        .try_get::<Option<DateTime<Utc>>, _>("last_parsed_at")
                        .map_err(|error| SchedulerError::StorageError(error.to_string()))?,
                })
            })
            .collect()
    }

    /// Monotonic-guard UPDATE per spec §4.4/§6: `WHERE last_parsed_at IS NULL OR
    /// last_parsed_at < :at`. Returns whether the guarded write actually applied.
    async fn update_last_parsed_at(&self, channel_id: Uuid, at: DateTime<Utc>) -> Result<bool, SchedulerError> {
        let result = sqlx::query(
            "UPDATE channels SET last_parsed_at = $1 \
             WHERE id = $2 AND (last_parsed_at IS NULL OR last_parsed_at < $1)",
        )
        .bind(at)
        .bind(channel_id)
        .execute(&self.pool)
        .await
        .map_err(|error| SchedulerError::StorageError(format!("updating last_parsed_at: {error}")))?;

        Ok(result.rows_affected() > 0)
    }
}
