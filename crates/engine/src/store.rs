// SPDX-FileCopyrightText: © 2025 Medbridge Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Durable message store.
//!
//! Backed by SQLite. Every channel gets its own table family keyed by a
//! local channel id N: `d_m{N}` (messages), `d_mm{N}` (connector messages),
//! `d_mc{N}` (typed content), `d_ms{N}` (statistics), `d_mcm{N}` (custom
//! metadata), `d_ma{N}` (attachments). Two global tables map channel ids to
//! local ids and hold the message-id sequences.
//!
//! Pipeline phases group their writes into one [`sqlx::Transaction`] each
//! (T1-T4); the pipeline wraps every call so a store failure logs and the
//! in-memory flow continues.

use medbridge_core::{
    message::{from_epoch_millis, to_epoch_millis},
    stats::expand_ops,
    Attachment, ChannelCounts, ConnectorMessage, ContentType, EngineError, Message,
    MessageContent, MetaDataColumn, MetaDataColumnType, Result, StatsOp, Status, StatusCounts,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use std::str::FromStr;

/// One channel's transaction handle. Everything written through it commits
/// or rolls back atomically.
pub type StoreTransaction = sqlx::Transaction<'static, sqlx::Sqlite>;

/// SQLite-backed message store shared by every channel in the process.
///
/// Writes targeting the same row serialize in the database; channels never
/// touch each other's table family.
#[derive(Debug, Clone)]
pub struct MessageStore {
    pool: SqlitePool,
}

impl MessageStore {
    /// Opens (and migrates) a store at the given SQLite URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(store_err)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(store_err)?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory store for tests and table-less deployments.
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS d_channels (
                channel_id TEXT PRIMARY KEY,
                local_channel_id INTEGER NOT NULL UNIQUE
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS d_message_sequences (
                local_channel_id INTEGER PRIMARY KEY,
                next_id INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    /// Registers a channel, creating its table family when missing. Returns
    /// the local channel id.
    pub async fn register_channel(&self, channel_id: &str) -> Result<i64> {
        if let Some(local_id) = self.local_channel_id(channel_id).await? {
            return Ok(local_id);
        }

        let mut tx = self.begin().await?;
        let next: i64 =
            sqlx::query("SELECT COALESCE(MAX(local_channel_id), 0) + 1 AS next FROM d_channels")
                .fetch_one(&mut *tx)
                .await
                .map_err(store_err)?
                .get("next");
        sqlx::query("INSERT INTO d_channels (channel_id, local_channel_id) VALUES (?, ?)")
            .bind(channel_id)
            .bind(next)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        sqlx::query("INSERT INTO d_message_sequences (local_channel_id, next_id) VALUES (?, 1)")
            .bind(next)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;

        for ddl in channel_table_ddl(next) {
            sqlx::query(&ddl).execute(&mut *tx).await.map_err(store_err)?;
        }
        tx.commit().await.map_err(store_err)?;

        tracing::info!(channel_id, local_channel_id = next, "registered channel tables");
        Ok(next)
    }

    /// Looks up a channel's local id without creating anything.
    pub async fn local_channel_id(&self, channel_id: &str) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT local_channel_id FROM d_channels WHERE channel_id = ?")
            .bind(channel_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(row.map(|r| r.get("local_channel_id")))
    }

    /// Lazy probe used once per channel instance: when false, persistence is
    /// skipped silently and the pipeline continues in-memory.
    pub async fn channel_tables_exist(&self, channel_id: &str) -> Result<bool> {
        Ok(self.local_channel_id(channel_id).await?.is_some())
    }

    pub async fn begin(&self) -> Result<StoreTransaction> {
        self.pool.begin().await.map_err(store_err)
    }

    // ---- message rows -----------------------------------------------------

    pub async fn insert_message(
        &self,
        tx: &mut StoreTransaction,
        local_id: i64,
        message: &Message,
    ) -> Result<()> {
        sqlx::query(&format!(
            "INSERT OR REPLACE INTO d_m{local_id} (id, server_id, received_date, processed)
             VALUES (?, ?, ?, ?)"
        ))
        .bind(message.message_id)
        .bind(&message.server_id)
        .bind(to_epoch_millis(message.received_date))
        .bind(i32::from(message.processed))
        .execute(&mut **tx)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    pub async fn insert_connector_message(
        &self,
        tx: &mut StoreTransaction,
        local_id: i64,
        cm: &ConnectorMessage,
    ) -> Result<()> {
        sqlx::query(&format!(
            "INSERT OR REPLACE INTO d_mm{local_id}
             (id, message_id, server_id, connector_name, received_date, status,
              send_attempts, send_date, response_date, error_code)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(i64::from(cm.metadata_id))
        .bind(cm.message_id)
        .bind(&cm.server_id)
        .bind(&cm.connector_name)
        .bind(to_epoch_millis(cm.received_date))
        .bind(cm.status.as_char().to_string())
        .bind(i64::from(cm.send_attempts))
        .bind(cm.send_date.map(to_epoch_millis))
        .bind(cm.response_date.map(to_epoch_millis))
        .bind(i64::from(cm.error_code))
        .execute(&mut **tx)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    /// Updates status, attempts, dates, and error code for one connector
    /// message.
    pub async fn update_status(
        &self,
        tx: &mut StoreTransaction,
        local_id: i64,
        cm: &ConnectorMessage,
    ) -> Result<()> {
        sqlx::query(&format!(
            "UPDATE d_mm{local_id}
             SET status = ?, send_attempts = ?, send_date = ?, response_date = ?, error_code = ?
             WHERE message_id = ? AND id = ?"
        ))
        .bind(cm.status.as_char().to_string())
        .bind(i64::from(cm.send_attempts))
        .bind(cm.send_date.map(to_epoch_millis))
        .bind(cm.response_date.map(to_epoch_millis))
        .bind(i64::from(cm.error_code))
        .bind(cm.message_id)
        .bind(i64::from(cm.metadata_id))
        .execute(&mut **tx)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    // ---- content rows -----------------------------------------------------

    pub async fn insert_content(
        &self,
        tx: &mut StoreTransaction,
        local_id: i64,
        message_id: i64,
        metadata_id: u32,
        content: &MessageContent,
    ) -> Result<()> {
        sqlx::query(&format!(
            "INSERT OR REPLACE INTO d_mc{local_id}
             (message_id, metadata_id, content_type, content, data_type, encrypted)
             VALUES (?, ?, ?, ?, ?, ?)"
        ))
        .bind(message_id)
        .bind(i64::from(metadata_id))
        .bind(content.content_type.code())
        .bind(&content.content)
        .bind(content.data_type.as_deref())
        .bind(i32::from(content.encrypted))
        .execute(&mut **tx)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    /// Persists the error slots that are set on the connector message.
    pub async fn update_errors(
        &self,
        tx: &mut StoreTransaction,
        local_id: i64,
        cm: &ConnectorMessage,
    ) -> Result<()> {
        let slots = [
            (ContentType::ProcessingError, cm.processing_error.as_deref()),
            (ContentType::PostprocessorError, cm.postprocessor_error.as_deref()),
            (ContentType::ResponseError, cm.response_error.as_deref()),
        ];
        for (content_type, text) in slots {
            if let Some(text) = text {
                let content = MessageContent::new(content_type, text.to_string(), None);
                self.insert_content(tx, local_id, cm.message_id, cm.metadata_id, &content).await?;
            }
        }
        Ok(())
    }

    /// Persists the connector/channel/response maps as JSON content rows.
    pub async fn update_maps(
        &self,
        tx: &mut StoreTransaction,
        local_id: i64,
        cm: &ConnectorMessage,
    ) -> Result<()> {
        let maps = [
            (ContentType::ConnectorMap, &cm.connector_map),
            (ContentType::ChannelMap, &cm.channel_map),
            (ContentType::ResponseMap, &cm.response_map),
        ];
        for (content_type, map) in maps {
            if map.is_empty() {
                continue;
            }
            let json = serde_json::to_string(map).unwrap_or_else(|_| "{}".to_string());
            let content = MessageContent::new(content_type, json, None);
            self.insert_content(tx, local_id, cm.message_id, cm.metadata_id, &content).await?;
        }
        Ok(())
    }

    /// Persists the source map JSON blob (written unconditionally at
    /// pipeline end; trace tooling reads it).
    pub async fn update_source_map(
        &self,
        tx: &mut StoreTransaction,
        local_id: i64,
        cm: &ConnectorMessage,
    ) -> Result<()> {
        let json = serde_json::to_string(&cm.source_map).unwrap_or_else(|_| "{}".to_string());
        let content = MessageContent::new(ContentType::SourceMap, json, None);
        self.insert_content(tx, local_id, cm.message_id, cm.metadata_id, &content).await
    }

    pub async fn mark_processed(
        &self,
        tx: &mut StoreTransaction,
        local_id: i64,
        message_id: i64,
    ) -> Result<()> {
        sqlx::query(&format!("UPDATE d_m{local_id} SET processed = 1 WHERE id = ?"))
            .bind(message_id)
            .execute(&mut **tx)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    // ---- custom metadata and attachments ----------------------------------

    /// Extracts configured metadata columns from the connector maps and
    /// writes them to the custom-metadata table.
    pub async fn insert_custom_metadata(
        &self,
        tx: &mut StoreTransaction,
        local_id: i64,
        cm: &ConnectorMessage,
        columns: &[MetaDataColumn],
    ) -> Result<()> {
        for column in columns {
            let value = cm
                .connector_map
                .get(&column.mapping)
                .or_else(|| cm.channel_map.get(&column.mapping))
                .or_else(|| cm.source_map.get(&column.mapping));
            let Some(value) = value else { continue };
            let rendered = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let column_type = match column.column_type {
                MetaDataColumnType::String => "STRING",
                MetaDataColumnType::Number => "NUMBER",
                MetaDataColumnType::Boolean => "BOOLEAN",
                MetaDataColumnType::Timestamp => "TIMESTAMP",
            };
            sqlx::query(&format!(
                "INSERT OR REPLACE INTO d_mcm{local_id}
                 (message_id, metadata_id, name, column_type, value)
                 VALUES (?, ?, ?, ?, ?)"
            ))
            .bind(cm.message_id)
            .bind(i64::from(cm.metadata_id))
            .bind(&column.name)
            .bind(column_type)
            .bind(rendered)
            .execute(&mut **tx)
            .await
            .map_err(store_err)?;
        }
        Ok(())
    }

    pub async fn insert_attachments(
        &self,
        tx: &mut StoreTransaction,
        local_id: i64,
        message_id: i64,
        attachments: &[Attachment],
    ) -> Result<()> {
        for attachment in attachments {
            sqlx::query(&format!(
                "INSERT OR REPLACE INTO d_ma{local_id} (id, message_id, mime_type, content)
                 VALUES (?, ?, ?, ?)"
            ))
            .bind(&attachment.id)
            .bind(message_id)
            .bind(&attachment.mime_type)
            .bind(&attachment.content)
            .execute(&mut **tx)
            .await
            .map_err(store_err)?;
        }
        Ok(())
    }

    // ---- completion pruning -----------------------------------------------

    /// Whether every non-source connector message has reached a terminal
    /// status. Content pruning is gated on this, verified from the store.
    pub async fn all_destinations_terminal(&self, local_id: i64, message_id: i64) -> Result<bool> {
        let row = sqlx::query(&format!(
            "SELECT COUNT(*) AS open FROM d_mm{local_id}
             WHERE message_id = ? AND id > 0 AND status NOT IN ('S', 'F', 'E')"
        ))
        .bind(message_id)
        .fetch_one(&self.pool)
        .await
        .map_err(store_err)?;
        let open: i64 = row.get("open");
        Ok(open == 0)
    }

    /// Deletes content rows for a completed message. With `only_filtered`,
    /// restricts the delete to connector messages whose status is FILTERED.
    pub async fn prune_content(
        &self,
        tx: &mut StoreTransaction,
        local_id: i64,
        message_id: i64,
        only_filtered: bool,
    ) -> Result<()> {
        if only_filtered {
            sqlx::query(&format!(
                "DELETE FROM d_mc{local_id} WHERE message_id = ? AND metadata_id IN
                 (SELECT id FROM d_mm{local_id} WHERE message_id = ? AND status = 'F')"
            ))
            .bind(message_id)
            .bind(message_id)
            .execute(&mut **tx)
            .await
            .map_err(store_err)?;
        } else {
            sqlx::query(&format!("DELETE FROM d_mc{local_id} WHERE message_id = ?"))
                .bind(message_id)
                .execute(&mut **tx)
                .await
                .map_err(store_err)?;
        }
        Ok(())
    }

    pub async fn prune_attachments(
        &self,
        tx: &mut StoreTransaction,
        local_id: i64,
        message_id: i64,
    ) -> Result<()> {
        sqlx::query(&format!("DELETE FROM d_ma{local_id} WHERE message_id = ?"))
            .bind(message_id)
            .execute(&mut **tx)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    // ---- sequences --------------------------------------------------------

    /// Draws a block of message ids from the channel's durable sequence.
    /// Returns `(first, last)` inclusive.
    pub async fn next_sequence_block(&self, local_id: i64, block_size: i64) -> Result<(i64, i64)> {
        let mut tx = self.begin().await?;
        let row = sqlx::query(
            "SELECT next_id FROM d_message_sequences WHERE local_channel_id = ?",
        )
        .bind(local_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(store_err)?;
        let first: i64 = row.get("next_id");
        sqlx::query("UPDATE d_message_sequences SET next_id = ? WHERE local_channel_id = ?")
            .bind(first + block_size)
            .bind(local_id)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        tx.commit().await.map_err(store_err)?;
        Ok((first, first + block_size - 1))
    }

    // ---- statistics -------------------------------------------------------

    /// Applies a batch of statistics ops inside the caller's transaction.
    /// Decrements clamp at zero in SQL, matching the in-memory accumulator.
    pub async fn update_statistics(
        &self,
        tx: &mut StoreTransaction,
        local_id: i64,
        server_id: &str,
        ops: &[StatsOp],
    ) -> Result<()> {
        for (metadata_id, delta) in expand_ops(ops) {
            let bound_metadata = metadata_id.map(i64::from);
            let updated = sqlx::query(&format!(
                "UPDATE d_ms{local_id} SET
                    received = MAX(0, received + ?),
                    filtered = MAX(0, filtered + ?),
                    sent = MAX(0, sent + ?),
                    error = MAX(0, error + ?),
                    queued = MAX(0, queued + ?),
                    pending = MAX(0, pending + ?)
                 WHERE metadata_id IS ? AND server_id = ?"
            ))
            .bind(delta.received)
            .bind(delta.filtered)
            .bind(delta.sent)
            .bind(delta.error)
            .bind(delta.queued)
            .bind(delta.pending)
            .bind(bound_metadata)
            .bind(server_id)
            .execute(&mut **tx)
            .await
            .map_err(store_err)?
            .rows_affected();

            if updated == 0 {
                sqlx::query(&format!(
                    "INSERT INTO d_ms{local_id}
                     (metadata_id, server_id, received, filtered, sent, error, queued, pending)
                     VALUES (?, ?, MAX(0, ?), MAX(0, ?), MAX(0, ?), MAX(0, ?), MAX(0, ?), MAX(0, ?))"
                ))
                .bind(bound_metadata)
                .bind(server_id)
                .bind(delta.received)
                .bind(delta.filtered)
                .bind(delta.sent)
                .bind(delta.error)
                .bind(delta.queued)
                .bind(delta.pending)
                .execute(&mut **tx)
                .await
                .map_err(store_err)?;
            }
        }
        Ok(())
    }

    /// Loads a channel's accumulated statistics (all server rows summed).
    pub async fn load_statistics(&self, local_id: i64) -> Result<ChannelCounts> {
        let rows = sqlx::query(&format!(
            "SELECT metadata_id,
                    SUM(received) AS received, SUM(filtered) AS filtered, SUM(sent) AS sent,
                    SUM(error) AS error, SUM(queued) AS queued, SUM(pending) AS pending
             FROM d_ms{local_id} GROUP BY metadata_id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        let mut counts = ChannelCounts::new();
        for row in rows {
            let metadata_id: Option<i64> = row.get("metadata_id");
            counts.insert(
                metadata_id.and_then(|id| u32::try_from(id).ok()),
                StatusCounts {
                    received: row.get("received"),
                    filtered: row.get("filtered"),
                    sent: row.get("sent"),
                    error: row.get("error"),
                    queued: row.get("queued"),
                    pending: row.get("pending"),
                },
            );
        }
        Ok(counts)
    }

    // ---- recovery and queue rehydration -----------------------------------

    /// Loads every unprocessed message (with connector messages and content)
    /// for the recovery task.
    pub async fn unprocessed_messages(
        &self,
        local_id: i64,
        channel_id: &str,
        channel_name: &str,
    ) -> Result<Vec<Message>> {
        let message_rows = sqlx::query(&format!(
            "SELECT id, server_id, received_date FROM d_m{local_id} WHERE processed = 0 ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        let mut messages = Vec::with_capacity(message_rows.len());
        for row in message_rows {
            let message_id: i64 = row.get("id");
            let server_id: String = row.get("server_id");
            let mut message = Message::new(message_id, channel_id.to_string(), server_id);
            message.received_date = from_epoch_millis(row.get("received_date"));
            message.connector_messages =
                self.load_connector_messages(local_id, message_id, channel_id, channel_name).await?;
            messages.push(message);
        }
        Ok(messages)
    }

    /// Loads QUEUED connector messages for one destination, oldest first,
    /// used to rehydrate the destination queue at channel start.
    pub async fn queued_connector_messages(
        &self,
        local_id: i64,
        metadata_id: u32,
        channel_id: &str,
        channel_name: &str,
    ) -> Result<Vec<ConnectorMessage>> {
        let rows = sqlx::query(&format!(
            "SELECT message_id FROM d_mm{local_id}
             WHERE id = ? AND status = 'Q' ORDER BY message_id"
        ))
        .bind(i64::from(metadata_id))
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        let mut result = Vec::with_capacity(rows.len());
        for row in rows {
            let message_id: i64 = row.get("message_id");
            let loaded =
                self.load_connector_messages(local_id, message_id, channel_id, channel_name).await?;
            if let Some(cm) = loaded.get(&metadata_id) {
                result.push(cm.clone());
            }
        }
        Ok(result)
    }

    async fn load_connector_messages(
        &self,
        local_id: i64,
        message_id: i64,
        channel_id: &str,
        channel_name: &str,
    ) -> Result<BTreeMap<u32, ConnectorMessage>> {
        let rows = sqlx::query(&format!(
            "SELECT id, server_id, connector_name, received_date, status, send_attempts,
                    send_date, response_date, error_code
             FROM d_mm{local_id} WHERE message_id = ? ORDER BY id"
        ))
        .bind(message_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        let mut map = BTreeMap::new();
        for row in rows {
            let metadata_id = u32::try_from(row.get::<i64, _>("id")).unwrap_or(0);
            let mut cm = ConnectorMessage::new(
                message_id,
                metadata_id,
                channel_id.to_string(),
                channel_name.to_string(),
                row.get("connector_name"),
                row.get("server_id"),
                from_epoch_millis(row.get("received_date")),
            );
            let status: String = row.get("status");
            cm.status = status
                .chars()
                .next()
                .and_then(Status::from_char)
                .unwrap_or(Status::Received);
            cm.send_attempts = u32::try_from(row.get::<i64, _>("send_attempts")).unwrap_or(0);
            cm.send_date = row.get::<Option<i64>, _>("send_date").map(from_epoch_millis);
            cm.response_date = row.get::<Option<i64>, _>("response_date").map(from_epoch_millis);
            cm.error_code = i32::try_from(row.get::<i64, _>("error_code")).unwrap_or(0);
            self.load_contents(local_id, &mut cm).await?;
            map.insert(metadata_id, cm);
        }
        Ok(map)
    }

    async fn load_contents(&self, local_id: i64, cm: &mut ConnectorMessage) -> Result<()> {
        let rows = sqlx::query(&format!(
            "SELECT content_type, content, data_type, encrypted FROM d_mc{local_id}
             WHERE message_id = ? AND metadata_id = ?"
        ))
        .bind(cm.message_id)
        .bind(i64::from(cm.metadata_id))
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        for row in rows {
            let Some(content_type) = ContentType::from_code(row.get("content_type")) else {
                continue;
            };
            let content: String = row.get("content");
            match content_type {
                ContentType::SourceMap => {
                    cm.source_map = serde_json::from_str(&content).unwrap_or_default();
                }
                ContentType::ChannelMap => {
                    cm.channel_map = serde_json::from_str(&content).unwrap_or_default();
                }
                ContentType::ConnectorMap => {
                    cm.connector_map = serde_json::from_str(&content).unwrap_or_default();
                }
                ContentType::ResponseMap => {
                    cm.response_map = serde_json::from_str(&content).unwrap_or_default();
                }
                ContentType::ProcessingError => cm.processing_error = Some(content),
                ContentType::PostprocessorError => cm.postprocessor_error = Some(content),
                ContentType::ResponseError => cm.response_error = Some(content),
                _ => {
                    cm.set_content(MessageContent {
                        content_type,
                        content,
                        data_type: row.get("data_type"),
                        encrypted: row.get::<i64, _>("encrypted") != 0,
                    });
                }
            }
        }
        Ok(())
    }
}

fn channel_table_ddl(local_id: i64) -> Vec<String> {
    vec![
        format!(
            "CREATE TABLE IF NOT EXISTS d_m{local_id} (
                id INTEGER PRIMARY KEY,
                server_id TEXT NOT NULL,
                received_date INTEGER NOT NULL,
                processed INTEGER NOT NULL DEFAULT 0
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS d_mm{local_id} (
                id INTEGER NOT NULL,
                message_id INTEGER NOT NULL,
                server_id TEXT NOT NULL,
                connector_name TEXT NOT NULL,
                received_date INTEGER NOT NULL,
                status TEXT NOT NULL,
                send_attempts INTEGER NOT NULL DEFAULT 0,
                send_date INTEGER,
                response_date INTEGER,
                error_code INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (message_id, id)
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS d_mc{local_id} (
                message_id INTEGER NOT NULL,
                metadata_id INTEGER NOT NULL,
                content_type INTEGER NOT NULL,
                content TEXT NOT NULL,
                data_type TEXT,
                encrypted INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (message_id, metadata_id, content_type)
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS d_ms{local_id} (
                metadata_id INTEGER,
                server_id TEXT NOT NULL,
                received INTEGER NOT NULL DEFAULT 0,
                filtered INTEGER NOT NULL DEFAULT 0,
                sent INTEGER NOT NULL DEFAULT 0,
                error INTEGER NOT NULL DEFAULT 0,
                queued INTEGER NOT NULL DEFAULT 0,
                pending INTEGER NOT NULL DEFAULT 0
            )"
        ),
        format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS d_ms{local_id}_key
             ON d_ms{local_id} (COALESCE(metadata_id, -1), server_id)"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS d_mcm{local_id} (
                message_id INTEGER NOT NULL,
                metadata_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                column_type TEXT NOT NULL,
                value TEXT,
                PRIMARY KEY (message_id, metadata_id, name)
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS d_ma{local_id} (
                id TEXT NOT NULL,
                message_id INTEGER NOT NULL,
                mime_type TEXT NOT NULL,
                content BLOB NOT NULL,
                PRIMARY KEY (message_id, id)
            )"
        ),
    ]
}

fn store_err(e: sqlx::Error) -> EngineError {
    EngineError::Store(e.to_string())
}
