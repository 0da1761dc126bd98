// SPDX-FileCopyrightText: © 2025 Medbridge Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Destination base: connector plus channel-side policy.
//!
//! A [`Destination`] wraps the transport connector with everything the
//! channel manages for it — filter/transformer/response-transformer
//! scripts, the retry-queue policy, and the queue worker that drains
//! QUEUED entries in the background.

use crate::queue::{DestinationQueue, Release};
use crate::store::MessageStore;
use medbridge_core::{
    ConnectorMessage, ContentType, DestinationConnector, EventBus, MessageContent, QueueSettings,
    Statistics, StatsOp, Status,
};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;

/// One destination slot of a channel, in declaration order. Metadata id 1+.
pub struct Destination {
    pub metadata_id: u32,
    pub name: String,
    pub connector: Arc<dyn DestinationConnector>,
    pub filter_script: Option<String>,
    pub transformer_script: Option<String>,
    pub response_transformer_script: Option<String>,
    pub queue_settings: QueueSettings,
    /// Present when the queue policy is enabled.
    pub queue: Option<Arc<DestinationQueue>>,
}

impl Destination {
    #[must_use]
    pub fn new(metadata_id: u32, connector: Arc<dyn DestinationConnector>) -> Self {
        let name = connector.name().to_string();
        Self {
            metadata_id,
            name,
            connector,
            filter_script: None,
            transformer_script: None,
            response_transformer_script: None,
            queue_settings: QueueSettings::default(),
            queue: None,
        }
    }

    #[must_use]
    pub fn with_filter(mut self, script: impl Into<String>) -> Self {
        self.filter_script = Some(script.into());
        self
    }

    #[must_use]
    pub fn with_transformer(mut self, script: impl Into<String>) -> Self {
        self.transformer_script = Some(script.into());
        self
    }

    #[must_use]
    pub fn with_response_transformer(mut self, script: impl Into<String>) -> Self {
        self.response_transformer_script = Some(script.into());
        self
    }

    /// Enables the retry queue with the given policy.
    #[must_use]
    pub fn with_queue(mut self, settings: QueueSettings) -> Self {
        self.queue_settings = QueueSettings { enabled: true, ..settings };
        self.queue = Some(Arc::new(DestinationQueue::new()));
        self
    }
}

/// Everything the queue worker needs besides the destination itself.
#[derive(Clone)]
pub struct QueueWorkerContext {
    pub channel_id: String,
    pub server_id: String,
    pub store: MessageStore,
    /// `None` when the channel has no durable tables.
    pub local_channel_id: Option<i64>,
    pub stats: Arc<Statistics>,
    pub events: EventBus,
    pub cancellation: CancellationToken,
}

/// Background retry loop for one queue-enabled destination.
///
/// FIFO over the queue; retries re-insert at the tail. Inter-attempt
/// backoff is the retry interval, observed as a cancellable sleep. The
/// worker exits only on cancellation, finishing any in-flight store write
/// first.
pub async fn run_queue_worker(destination: Arc<Destination>, ctx: QueueWorkerContext) {
    let Some(queue) = destination.queue.clone() else {
        return;
    };
    let retry_interval = Duration::from_millis(destination.queue_settings.retry_interval_ms);

    tracing::debug!(
        channel_id = %ctx.channel_id,
        destination = %destination.name,
        "queue worker started"
    );

    loop {
        if ctx.cancellation.is_cancelled() {
            break;
        }

        let Some(mut entry) = queue.acquire() else {
            // Empty queue: poll again after the retry interval, waking
            // early on enqueue or cancellation.
            tokio::select! {
                () = ctx.cancellation.cancelled() => break,
                () = queue.notified() => {}
                () = tokio::time::sleep(retry_interval) => {}
            }
            continue;
        };

        // Inter-attempt backoff for entries that already failed once.
        if entry.send_attempts > 0 {
            tokio::select! {
                () = ctx.cancellation.cancelled() => {
                    queue.release(entry, Release::Retry);
                    break;
                }
                () = tokio::time::sleep(retry_interval) => {}
            }
        }

        entry.send_attempts += 1;
        entry.send_date = Some(SystemTime::now());

        match destination.connector.send(&entry).await {
            Ok(response) => {
                entry.response_date = Some(SystemTime::now());
                let rejected = destination.queue_settings.validate_response
                    && response.status == Status::Error;
                let transient = response.status == Status::Queued;

                if rejected || transient {
                    let error = response
                        .error
                        .unwrap_or_else(|| "response validation failed".to_string());
                    handle_failure(&destination, &ctx, &queue, entry, &error).await;
                } else {
                    entry.status = Status::Sent;
                    if !response.message.is_empty() {
                        entry.set_content(MessageContent::new(
                            ContentType::Response,
                            response.message,
                            None,
                        ));
                    }
                    persist_terminal(
                        &destination,
                        &ctx,
                        &entry,
                        StatsOp {
                            metadata_id: destination.metadata_id,
                            increment: Status::Sent,
                            decrement: Some(Status::Queued),
                        },
                    )
                    .await;
                    tracing::debug!(
                        channel_id = %ctx.channel_id,
                        destination = %destination.name,
                        message_id = entry.message_id,
                        attempts = entry.send_attempts,
                        "queued message sent"
                    );
                    queue.release(entry, Release::Completed);
                }
            }
            Err(e) => {
                handle_failure(&destination, &ctx, &queue, entry, &e.to_string()).await;
            }
        }
    }

    tracing::debug!(
        channel_id = %ctx.channel_id,
        destination = %destination.name,
        "queue worker stopped"
    );

    // retry_count == 0 retries forever.
    async fn handle_failure(
        destination: &Destination,
        ctx: &QueueWorkerContext,
        queue: &DestinationQueue,
        mut entry: ConnectorMessage,
        error: &str,
    ) {
        let retry_count = destination.queue_settings.retry_count;
        let exhausted = retry_count > 0 && entry.send_attempts >= retry_count;

        if exhausted {
            entry.status = Status::Error;
            entry.error_code = 1;
            entry.processing_error = Some(error.to_string());
            persist_terminal(
                destination,
                ctx,
                &entry,
                StatsOp {
                    metadata_id: destination.metadata_id,
                    increment: Status::Error,
                    decrement: Some(Status::Queued),
                },
            )
            .await;
            tracing::warn!(
                channel_id = %ctx.channel_id,
                destination = %destination.name,
                message_id = entry.message_id,
                attempts = entry.send_attempts,
                error,
                "retries exhausted, releasing as failed"
            );
            queue.release(entry, Release::Completed);
        } else {
            tracing::debug!(
                channel_id = %ctx.channel_id,
                destination = %destination.name,
                message_id = entry.message_id,
                attempts = entry.send_attempts,
                error,
                "send failed, releasing for retry"
            );
            persist_attempts(destination, ctx, &entry).await;
            queue.release(entry, Release::Retry);
        }
    }

    /// Terminal release: status, attempts, response content, and statistics
    /// in one transaction. Store failures log and never interrupt the
    /// worker.
    async fn persist_terminal(
        destination: &Destination,
        ctx: &QueueWorkerContext,
        entry: &ConnectorMessage,
        stats_op: StatsOp,
    ) {
        if let Some(local_id) = ctx.local_channel_id {
            let result = async {
                let mut tx = ctx.store.begin().await?;
                ctx.store.update_status(&mut tx, local_id, entry).await?;
                if let Some(response) = entry.content(ContentType::Response) {
                    ctx.store
                        .insert_content(&mut tx, local_id, entry.message_id, entry.metadata_id, response)
                        .await?;
                }
                ctx.store.update_errors(&mut tx, local_id, entry).await?;
                ctx.store
                    .update_statistics(&mut tx, local_id, &ctx.server_id, &[stats_op])
                    .await?;
                tx.commit().await.map_err(|e| medbridge_core::EngineError::Store(e.to_string()))
            }
            .await;
            if let Err(e) = result {
                tracing::error!(
                    channel_id = %ctx.channel_id,
                    destination = %destination.name,
                    message_id = entry.message_id,
                    error = %e,
                    "failed to persist queue release"
                );
            }
        }
        ctx.stats.apply_ops(&ctx.channel_id, &[stats_op]);
    }

    async fn persist_attempts(
        destination: &Destination,
        ctx: &QueueWorkerContext,
        entry: &ConnectorMessage,
    ) {
        if let Some(local_id) = ctx.local_channel_id {
            let result = async {
                let mut tx = ctx.store.begin().await?;
                ctx.store.update_status(&mut tx, local_id, entry).await?;
                tx.commit().await.map_err(|e| medbridge_core::EngineError::Store(e.to_string()))
            }
            .await;
            if let Err(e) = result {
                tracing::error!(
                    channel_id = %ctx.channel_id,
                    destination = %destination.name,
                    message_id = entry.message_id,
                    error = %e,
                    "failed to persist send attempts"
                );
            }
        }
    }
}
