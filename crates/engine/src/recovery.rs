// SPDX-FileCopyrightText: © 2025 Medbridge Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Crash recovery.
//!
//! At channel start, every message whose `processed` flag is still false is
//! re-entered at the correct point:
//! - destinations checkpointed PENDING replay the response transformer from
//!   their stored RESPONSE and finalize as SENT — the network send is never
//!   replayed
//! - pre-send unfinished destinations (RECEIVED/TRANSFORMED, or QUEUED from
//!   a previous run) are marked QUEUED so the queue worker picks them up
//!   when the buffer rehydrates
//! - ERROR sources stay ERROR; they are not retried
//!
//! Recovery failures are logged; the channel starts regardless.

use crate::channel::Channel;
use medbridge_core::{Message, Status};
use std::sync::Arc;

pub(crate) async fn run(channel: &Arc<Channel>, local_id: i64) {
    let messages = match channel
        .store
        .unprocessed_messages(local_id, channel.id(), channel.name())
        .await
    {
        Ok(messages) => messages,
        Err(e) => {
            tracing::error!(channel_id = %channel.id(), error = %e, "recovery scan failed");
            return;
        }
    };
    if messages.is_empty() {
        return;
    }

    tracing::info!(
        channel_id = %channel.id(),
        count = messages.len(),
        "recovering unfinished messages"
    );
    for mut message in messages {
        recover_message(channel, local_id, &mut message).await;
    }
}

async fn recover_message(channel: &Arc<Channel>, local_id: i64, message: &mut Message) {
    let message_id = message.message_id;

    for destination in &channel.destinations {
        let Some(cm) = message.connector_messages.get_mut(&destination.metadata_id) else {
            continue;
        };
        match cm.status {
            Status::Pending => {
                tracing::info!(
                    channel_id = %channel.id(),
                    message_id,
                    destination = %destination.name,
                    "replaying response transformer for pending destination"
                );
                channel.run_response_transformer(destination, cm, Some(local_id)).await;
                finalize_recovered(channel, local_id, cm).await;
            }
            Status::Received | Status::Transformed | Status::Queued => {
                if destination.queue.is_some() {
                    if cm.status != Status::Queued {
                        cm.status = Status::Queued;
                        let cm = &*cm;
                        channel
                            .try_phase("recovery requeue", message_id, |store, mut tx| async move {
                                store.update_status(&mut tx, local_id, cm).await?;
                                Ok(tx)
                            })
                            .await;
                    }
                    // The queue buffer itself rehydrates from QUEUED rows
                    // right after recovery.
                } else {
                    tracing::warn!(
                        channel_id = %channel.id(),
                        message_id,
                        destination = %destination.name,
                        status = %cm.status,
                        "unfinished destination has no queue, leaving as-is"
                    );
                }
            }
            _ => {}
        }
    }

    // The source row is left untouched (an ERROR source stays ERROR); the
    // message closes once every destination is terminal.
    match channel.store.all_destinations_terminal(local_id, message_id).await {
        Ok(true) => {
            channel
                .try_phase("recovery finish", message_id, |store, mut tx| async move {
                    store.mark_processed(&mut tx, local_id, message_id).await?;
                    Ok(tx)
                })
                .await;
        }
        Ok(false) => {}
        Err(e) => {
            tracing::error!(
                channel_id = %channel.id(),
                message_id,
                error = %e,
                "recovery completion check failed"
            );
        }
    }
}

async fn finalize_recovered(
    channel: &Arc<Channel>,
    local_id: i64,
    cm: &medbridge_core::ConnectorMessage,
) {
    let message_id = cm.message_id;
    let storage = &channel.storage;
    channel
        .try_phase("recovery finalize", message_id, |store, mut tx| async move {
            store.update_status(&mut tx, local_id, cm).await?;
            for (content_type, enabled) in [
                (
                    medbridge_core::ContentType::ResponseTransformed,
                    storage.store_response_transformed,
                ),
                (
                    medbridge_core::ContentType::ProcessedResponse,
                    storage.store_processed_response,
                ),
            ] {
                if enabled {
                    if let Some(content) = cm.content(content_type) {
                        store
                            .insert_content(&mut tx, local_id, message_id, cm.metadata_id, content)
                            .await?;
                    }
                }
            }
            store.update_errors(&mut tx, local_id, cm).await?;
            Ok(tx)
        })
        .await;
}
