// SPDX-FileCopyrightText: © 2025 Medbridge Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The dispatch pipeline.
//!
//! One message's journey: raw intake → attachment extraction → T1 (message,
//! source row, raw content, statistics) → preprocessor → source filter →
//! source transformer (T2) → per-destination filter/transform/send (T3 each)
//! → postprocessor and finish (T4). Each T groups one phase's store writes
//! into a single transaction; the in-memory message always reflects the
//! intended state, and a failed write logs and lets the pipeline continue.
//!
//! Destination send errors never fail the dispatch: queue-enabled
//! destinations convert them to QUEUED, everything else becomes a
//! per-destination ERROR. Source-side script errors abort the dispatch and
//! leave the source ERROR.

use crate::channel::Channel;
use crate::destination::Destination;
use crate::store::StoreTransaction;
use medbridge_core::{
    message::{destination_set, DESTINATION_SET_KEY, QUEUED_RAW_KEY},
    ConnectorMessage, ContentType, DispatchResult, EngineError, Message, MessageContent,
    RawMessage, Response, Result, ScriptBindings, ScriptError, ScriptMaps, ScriptOutcome,
    ServerEvent, StatsOp, Status,
};
use serde_json::json;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

impl Channel {
    /// Entry point for source connectors (synchronous intake) and the
    /// intake worker's producer side.
    pub(crate) async fn dispatch_raw(self: &Arc<Self>, raw: RawMessage) -> Result<DispatchResult> {
        if !self.dispatch_allowed() {
            return Err(EngineError::Runtime(format!(
                "channel '{}' is not accepting messages",
                self.settings.name
            )));
        }

        // 1. Allocate the message id (durable / cluster-safe when tables
        //    exist).
        let message_id = self.next_message_id().await?;

        // 2. Message umbrella plus the source connector message at RECEIVED.
        let mut message =
            Message::new(message_id, self.settings.id.clone(), self.server_id.clone());
        let mut source = ConnectorMessage::new(
            message_id,
            0,
            self.settings.id.clone(),
            self.settings.name.clone(),
            self.source.name().to_string(),
            self.server_id.clone(),
            message.received_date,
        );
        source.source_map = raw.source_map;
        let inbound_data_type = self.source.inbound_data_type().to_string();
        source.set_content(MessageContent::new(
            ContentType::Raw,
            raw.raw,
            Some(inbound_data_type.clone()),
        ));

        // 3. Attachment extraction; the returned modified content replaces
        //    RAW.
        let mut attachments = Vec::new();
        if let Some(raw_content) = source.content_str(ContentType::Raw).map(ToString::to_string) {
            match self.attachment_handler.extract(&self.settings.id, &raw_content).await {
                Ok(extraction) => {
                    if let Some(modified) = extraction.modified_content {
                        if modified != raw_content {
                            source.set_content(MessageContent::new(
                                ContentType::Raw,
                                modified,
                                Some(inbound_data_type),
                            ));
                        }
                    }
                    attachments = extraction.attachments;
                }
                Err(e) => {
                    tracing::warn!(
                        channel_id = %self.settings.id,
                        message_id,
                        error = %e,
                        "attachment extraction failed"
                    );
                }
            }
        }
        message.insert_connector_message(source);

        // 4. Transaction T1: source intake.
        let local_id = self.ensure_tables_probed().await;
        let t1_ops = vec![StatsOp { metadata_id: 0, increment: Status::Received, decrement: None }];
        if let Some(local_id) = local_id {
            let persisted: Result<()> = async {
                let mut tx = self.store.begin().await?;
                self.store.insert_message(&mut tx, local_id, &message).await?;
                if let Some(source) = message.source() {
                    self.store.insert_connector_message(&mut tx, local_id, source).await?;
                    if self.storage.store_raw {
                        if let Some(content) = source.content(ContentType::Raw) {
                            self.store
                                .insert_content(&mut tx, local_id, message_id, 0, content)
                                .await?;
                        }
                    }
                }
                if !attachments.is_empty() {
                    self.store.insert_attachments(&mut tx, local_id, message_id, &attachments).await?;
                }
                self.store.update_statistics(&mut tx, local_id, &self.server_id, &t1_ops).await?;
                tx.commit().await.map_err(|e| EngineError::Store(e.to_string()))
            }
            .await;
            if let Err(e) = persisted {
                tracing::error!(
                    channel_id = %self.settings.id,
                    message_id,
                    error = %e,
                    "source intake transaction failed"
                );
            }
        }
        // The received counter increments after commit.
        self.stats.apply_ops(&self.settings.id, &t1_ops);

        // 5. Asynchronous intake: stash the raw payload and hand the message
        //    to the intake worker.
        if let Some(intake_tx) = self.intake_sender() {
            if let Some(source) = message.source_mut() {
                let stashed = source.content_str(ContentType::Raw).unwrap_or_default().to_string();
                source.source_map.insert(QUEUED_RAW_KEY.to_string(), json!(stashed));
            }
            match intake_tx.send(message.clone()).await {
                Ok(()) => {
                    return Ok(DispatchResult { message, selected_response: None });
                }
                Err(e) => {
                    // Worker already gone (channel stopping); fall through
                    // to synchronous processing so the message is not lost.
                    tracing::warn!(
                        channel_id = %self.settings.id,
                        message_id,
                        error = %e,
                        "source queue unavailable, processing inline"
                    );
                }
            }
        }

        // 6..15 synchronously.
        Ok(self.process_source(message).await)
    }

    /// Background consumer for asynchronous intake (steps 6..15 per
    /// message). Exits on cancellation or when the producer side closes.
    pub(crate) async fn run_intake_worker(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<Message>,
        cancellation: CancellationToken,
    ) {
        tracing::debug!(channel_id = %self.settings.id, "source queue worker started");
        loop {
            let mut message = tokio::select! {
                () = cancellation.cancelled() => break,
                received = rx.recv() => match received {
                    Some(message) => message,
                    None => break,
                },
            };
            if let Some(source) = message.source_mut() {
                source.source_map.shift_remove(QUEUED_RAW_KEY);
            }
            let message_id = message.message_id;
            let result = self.process_source(message).await;
            tracing::trace!(
                channel_id = %self.settings.id,
                message_id,
                processed = result.message.processed,
                "source queue message processed"
            );
        }
        tracing::debug!(channel_id = %self.settings.id, "source queue worker stopped");
    }

    /// Steps 6..15. Infallible from the caller's perspective: an error on
    /// the source side marks the source ERROR and returns the partially
    /// complete message.
    pub(crate) async fn process_source(&self, mut message: Message) -> DispatchResult {
        let local_id = self.ensure_tables_probed().await;
        match self.process_source_inner(&mut message, local_id).await {
            Ok(selected_response) => DispatchResult { message, selected_response },
            Err(e) => {
                tracing::error!(
                    channel_id = %self.settings.id,
                    message_id = message.message_id,
                    error = %e,
                    "source processing failed"
                );
                if let Some(source) = message.source_mut() {
                    source.status = Status::Error;
                    source.error_code = 1;
                    source.processing_error = Some(e.to_string());
                }
                let ops =
                    vec![StatsOp { metadata_id: 0, increment: Status::Error, decrement: None }];
                if let (Some(local_id), Some(source)) = (local_id, message.source()) {
                    let persisted: Result<()> = async {
                        let mut tx = self.store.begin().await?;
                        self.store.update_status(&mut tx, local_id, source).await?;
                        self.store.update_errors(&mut tx, local_id, source).await?;
                        self.store
                            .update_statistics(&mut tx, local_id, &self.server_id, &ops)
                            .await?;
                        tx.commit().await.map_err(|e| EngineError::Store(e.to_string()))
                    }
                    .await;
                    if let Err(e) = persisted {
                        tracing::error!(
                            channel_id = %self.settings.id,
                            message_id = message.message_id,
                            error = %e,
                            "error persistence failed"
                        );
                    }
                }
                self.stats.apply_ops(&self.settings.id, &ops);
                DispatchResult { message, selected_response: None }
            }
        }
    }

    #[allow(clippy::too_many_lines)] // The pipeline's phases read best in order.
    async fn process_source_inner(
        &self,
        message: &mut Message,
        local_id: Option<i64>,
    ) -> Result<Option<Response>> {
        let message_id = message.message_id;

        // 6. Preprocessor.
        if let Some(script) = self.settings.preprocessor_script.clone() {
            let source = source_mut(message)?;
            let content = source.processed_raw_or_raw().unwrap_or_default().to_string();
            let outcome = self
                .execute_script(&script, source, content, false)
                .await
                .map_err(|e| EngineError::Script(format!("preprocessor failed: {e}")))?;
            source.set_content(MessageContent::new(
                ContentType::ProcessedRaw,
                outcome.message,
                Some(self.source.inbound_data_type().to_string()),
            ));
        }

        // 7. Seed the destination set so the source filter/transformer can
        //    exclude destinations.
        let pairs: Vec<(u32, String)> =
            self.destinations.iter().map(|d| (d.metadata_id, d.name.clone())).collect();
        destination_set::initialize(&mut source_mut(message)?.source_map, &pairs);

        // 8. Source filter.
        if let Some(script) = self.source_filter.clone() {
            let source = source_mut(message)?;
            let content = source.processed_raw_or_raw().unwrap_or_default().to_string();
            let outcome = self
                .execute_script(&script, source, content, true)
                .await
                .map_err(|e| EngineError::Script(format!("source filter failed: {e}")))?;
            if !outcome.accepted() {
                source.status = Status::Filtered;
                let ops = vec![StatsOp {
                    metadata_id: 0,
                    increment: Status::Filtered,
                    decrement: None,
                }];
                if let Some(local_id) = local_id {
                    let source = &*source;
                    let ops = &ops;
                    self.try_phase("source filter", message_id, |store, mut tx| async move {
                        store.update_status(&mut tx, local_id, source).await?;
                        store.update_source_map(&mut tx, local_id, source).await?;
                        store.update_statistics(&mut tx, local_id, &self.server_id, ops).await?;
                        store.mark_processed(&mut tx, local_id, message_id).await?;
                        Ok(tx)
                    })
                    .await;
                }
                self.stats.apply_ops(&self.settings.id, &ops);
                message.processed = true;
                self.emit_message_complete(message_id);
                return Ok(None);
            }
        }

        // 9. Source transformer, then transaction T2 (source processing).
        if let Some(script) = self.source_transformer.clone() {
            let source = source_mut(message)?;
            let content = source.processed_raw_or_raw().unwrap_or_default().to_string();
            let outcome = self
                .execute_script(&script, source, content, true)
                .await
                .map_err(|e| EngineError::Script(format!("source transformer failed: {e}")))?;
            let data_type = Some(self.source.inbound_data_type().to_string());
            source.set_content(MessageContent::new(
                ContentType::Transformed,
                outcome.message.clone(),
                data_type.clone(),
            ));
            source.set_content(MessageContent::new(
                ContentType::Encoded,
                outcome.message,
                data_type,
            ));
        }
        source_mut(message)?.status = Status::Transformed;

        if let Some(local_id) = local_id {
            let source = &*source_mut(message)?;
            let storage = &self.storage;
            let columns = &self.settings.metadata_columns;
            self.try_phase("source processing", message_id, |store, mut tx| async move {
                store.update_status(&mut tx, local_id, source).await?;
                for (content_type, enabled) in [
                    (ContentType::ProcessedRaw, storage.store_processed_raw),
                    (ContentType::Transformed, storage.store_transformed),
                    (ContentType::Encoded, storage.store_encoded),
                ] {
                    if enabled {
                        if let Some(content) = source.content(content_type) {
                            store.insert_content(&mut tx, local_id, message_id, 0, content).await?;
                        }
                    }
                }
                if storage.store_custom_metadata {
                    store.insert_custom_metadata(&mut tx, local_id, source, columns).await?;
                }
                Ok(tx)
            })
            .await;
        }

        // 10. The destination RAW input: ENCODED, else TRANSFORMED, else RAW.
        let source_snapshot = message
            .source()
            .ok_or_else(|| EngineError::Runtime("message lost its source".to_string()))?
            .clone();
        let destination_input = source_snapshot.encoded_or_raw().unwrap_or_default().to_string();

        // 11. Read back the (possibly script-mutated) destination set and
        //     dispatch in declaration order.
        let eligible = destination_set::read(&source_snapshot.source_map)
            .unwrap_or_else(|| self.destinations.iter().map(|d| d.metadata_id).collect());
        let mut channel_map = source_snapshot.channel_map.clone();
        let mut selected_response: Option<Response> = None;
        let mut excluded: Vec<Arc<Destination>> = Vec::new();

        for destination in &self.destinations {
            if !eligible.contains(&destination.metadata_id) {
                excluded.push(Arc::clone(destination));
                continue;
            }
            let mut cm = source_snapshot
                .clone_for_destination(destination.metadata_id, destination.name.clone());
            cm.channel_map = channel_map.clone();
            cm.set_content(MessageContent::new(
                ContentType::Raw,
                destination_input.clone(),
                source_snapshot
                    .content(ContentType::Raw)
                    .and_then(|c| c.data_type.clone()),
            ));

            self.process_destination(destination, &mut cm, local_id, &mut selected_response)
                .await;

            // The channel map is shared across destinations within one
            // message: later destinations observe earlier mutations.
            channel_map = cm.channel_map.clone();
            message.insert_connector_message(cm);
        }

        // 12. Excluded destinations still get a FILTERED row so the
        //     accounting ends at N+1 connector messages.
        for destination in excluded {
            let mut cm = source_snapshot
                .clone_for_destination(destination.metadata_id, destination.name.clone());
            cm.status = Status::Filtered;
            let ops = vec![StatsOp {
                metadata_id: destination.metadata_id,
                increment: Status::Filtered,
                decrement: None,
            }];
            if let Some(local_id) = local_id {
                let cm = &cm;
                let ops = &ops;
                self.try_phase("destination exclusion", message_id, |store, mut tx| async move {
                    store.insert_connector_message(&mut tx, local_id, cm).await?;
                    store.update_statistics(&mut tx, local_id, &self.server_id, ops).await?;
                    Ok(tx)
                })
                .await;
            }
            self.stats.apply_ops(&self.settings.id, &ops);
            message.insert_connector_message(cm);
        }

        // 13. Transaction T4: finish.
        let merged_response_maps: Vec<_> = message
            .connector_messages
            .values()
            .filter(|cm| cm.metadata_id > 0)
            .map(|cm| cm.response_map.clone())
            .collect();
        let first_sent_response = selected_response.clone();

        {
            let source = source_mut(message)?;
            source.channel_map = channel_map;
            source.send_attempts = 1;
            let now = SystemTime::now();
            source.send_date = Some(now);
            source.response_date = Some(now);
            if self.storage.store_response {
                if let Some(response) = &first_sent_response {
                    source.set_content(MessageContent::new(
                        ContentType::Response,
                        response.message.clone(),
                        None,
                    ));
                }
            }
            if self.storage.store_response_map {
                for map in merged_response_maps {
                    for (key, value) in map {
                        source.response_map.insert(key, value);
                    }
                }
            }
        }

        // Postprocessor runs outside the transaction; its error lands in a
        // separate row.
        if let Some(script) = self.settings.postprocessor_script.clone() {
            let source = source_mut(message)?;
            let content = source.encoded_or_raw().unwrap_or_default().to_string();
            if let Err(e) = self.execute_script(&script, source, content, false).await {
                tracing::error!(
                    channel_id = %self.settings.id,
                    message_id,
                    error = %e,
                    "postprocessor failed"
                );
                source.postprocessor_error = Some(e.to_string());
                if let Some(local_id) = local_id {
                    let source = &*source;
                    self.try_phase("postprocessor error", message_id, |store, mut tx| async move {
                        store.update_errors(&mut tx, local_id, source).await?;
                        Ok(tx)
                    })
                    .await;
                }
            }
        }

        if let Some(local_id) = local_id {
            let source = &*source_mut(message)?;
            let storage = &self.storage;
            // Content pruning only once every non-source connector reached a
            // terminal status, verified from the store.
            let prunable = if storage.remove_content_on_completion
                || storage.remove_attachments_on_completion
            {
                self.store
                    .all_destinations_terminal(local_id, message_id)
                    .await
                    .unwrap_or(false)
            } else {
                false
            };
            self.try_phase("finish", message_id, |store, mut tx| async move {
                store.update_status(&mut tx, local_id, source).await?;
                if storage.store_response {
                    if let Some(content) = source.content(ContentType::Response) {
                        store.insert_content(&mut tx, local_id, message_id, 0, content).await?;
                    }
                }
                store.update_errors(&mut tx, local_id, source).await?;
                if storage.store_maps {
                    store.update_maps(&mut tx, local_id, source).await?;
                }
                // 14. The SOURCE_MAP slot is persisted unconditionally.
                store.update_source_map(&mut tx, local_id, source).await?;
                store.mark_processed(&mut tx, local_id, message_id).await?;
                if prunable {
                    if storage.remove_content_on_completion {
                        store
                            .prune_content(
                                &mut tx,
                                local_id,
                                message_id,
                                storage.remove_only_filtered_on_completion,
                            )
                            .await?;
                    }
                    if storage.remove_attachments_on_completion {
                        store.prune_attachments(&mut tx, local_id, message_id).await?;
                    }
                }
                Ok(tx)
            })
            .await;
        }

        message.processed = true;

        // 15. Completion event.
        self.emit_message_complete(message_id);
        Ok(selected_response)
    }

    /// One destination's filter → transform → send → response phases.
    /// Errors are contained: this function never fails the dispatch.
    async fn process_destination(
        &self,
        destination: &Arc<Destination>,
        cm: &mut ConnectorMessage,
        local_id: Option<i64>,
        selected_response: &mut Option<Response>,
    ) {
        let message_id = cm.message_id;

        // Row insert so recovery can see the destination was reached.
        if let Some(local_id) = local_id {
            let cm = &*cm;
            let store_raw = self.storage.store_raw;
            self.try_phase("destination intake", message_id, |store, mut tx| async move {
                store.insert_connector_message(&mut tx, local_id, cm).await?;
                if store_raw {
                    if let Some(content) = cm.content(ContentType::Raw) {
                        store
                            .insert_content(&mut tx, local_id, message_id, cm.metadata_id, content)
                            .await?;
                    }
                }
                Ok(tx)
            })
            .await;
        }

        // Destination filter.
        if let Some(script) = destination.filter_script.clone() {
            let content = cm.content_str(ContentType::Raw).unwrap_or_default().to_string();
            match self.execute_script(&script, cm, content, false).await {
                Ok(outcome) if !outcome.accepted() => {
                    cm.status = Status::Filtered;
                    self.persist_destination_terminal(cm, local_id, Status::Filtered, None).await;
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    cm.status = Status::Error;
                    cm.error_code = 1;
                    cm.processing_error = Some(format!("destination filter failed: {e}"));
                    self.persist_destination_terminal(cm, local_id, Status::Error, None).await;
                    return;
                }
            }
        }

        // Destination transformer; ENCODED falls back to the raw input.
        let encoded = if let Some(script) = destination.transformer_script.clone() {
            let content = cm.content_str(ContentType::Raw).unwrap_or_default().to_string();
            match self.execute_script(&script, cm, content, false).await {
                Ok(outcome) => outcome.message,
                Err(e) => {
                    cm.status = Status::Error;
                    cm.error_code = 1;
                    cm.processing_error = Some(format!("destination transformer failed: {e}"));
                    self.persist_destination_terminal(cm, local_id, Status::Error, None).await;
                    return;
                }
            }
        } else {
            cm.content_str(ContentType::Raw).unwrap_or_default().to_string()
        };
        cm.status = Status::Transformed;
        cm.set_content(MessageContent::new(ContentType::Encoded, encoded, None));

        if let Some(local_id) = local_id {
            let cm = &*cm;
            let store_encoded = self.storage.store_encoded;
            self.try_phase("destination processing", message_id, |store, mut tx| async move {
                store.update_status(&mut tx, local_id, cm).await?;
                if store_encoded {
                    if let Some(content) = cm.content(ContentType::Encoded) {
                        store
                            .insert_content(&mut tx, local_id, message_id, cm.metadata_id, content)
                            .await?;
                    }
                }
                Ok(tx)
            })
            .await;
        }

        // Send.
        cm.send_attempts += 1;
        cm.send_date = Some(SystemTime::now());
        match destination.connector.send(cm).await {
            Ok(response) if response.status == Status::Queued => {
                let error = response
                    .error
                    .clone()
                    .unwrap_or_else(|| "queued by connector".to_string());
                self.queue_or_error_destination(destination, cm, local_id, &error).await;
            }
            Ok(response) if response.status == Status::Error => {
                cm.response_date = Some(SystemTime::now());
                cm.status = Status::Error;
                cm.error_code = 1;
                cm.processing_error = response.error.clone();
                if self.storage.store_response && !response.message.is_empty() {
                    cm.set_content(MessageContent::new(
                        ContentType::Response,
                        response.message.clone(),
                        None,
                    ));
                }
                self.persist_destination_terminal(cm, local_id, Status::Error, None).await;
            }
            Ok(response) => {
                cm.response_date = Some(SystemTime::now());
                cm.status = Status::Sent;

                if selected_response.is_none() {
                    *selected_response = Some(response.clone());
                }

                // Response transformer behind the PENDING checkpoint.
                if !response.message.is_empty() {
                    cm.set_content(MessageContent::new(
                        ContentType::Response,
                        response.message.clone(),
                        None,
                    ));
                    if destination.response_transformer_script.is_some() {
                        self.run_response_transformer(destination, cm, local_id).await;
                    }
                }

                // Transaction T3: per-destination finalization.
                let ops = vec![StatsOp {
                    metadata_id: destination.metadata_id,
                    increment: Status::Sent,
                    decrement: None,
                }];
                if let Some(local_id) = local_id {
                    let cm = &*cm;
                    let ops = &ops;
                    let storage = &self.storage;
                    let columns = &self.settings.metadata_columns;
                    self.try_phase("destination finalization", message_id, |store, mut tx| async move {
                        store.update_status(&mut tx, local_id, cm).await?;
                        if let Some(content) = cm.content(ContentType::Encoded) {
                            let sent = MessageContent::new(
                                ContentType::Sent,
                                content.content.clone(),
                                content.data_type.clone(),
                            );
                            store
                                .insert_content(&mut tx, local_id, message_id, cm.metadata_id, &sent)
                                .await?;
                        }
                        for (content_type, enabled) in [
                            (ContentType::Response, storage.store_response),
                            (
                                ContentType::ResponseTransformed,
                                storage.store_response_transformed,
                            ),
                            (ContentType::ProcessedResponse, storage.store_processed_response),
                        ] {
                            if enabled {
                                if let Some(content) = cm.content(content_type) {
                                    store
                                        .insert_content(
                                            &mut tx,
                                            local_id,
                                            message_id,
                                            cm.metadata_id,
                                            content,
                                        )
                                        .await?;
                                }
                            }
                        }
                        if storage.store_maps {
                            store.update_maps(&mut tx, local_id, cm).await?;
                        }
                        if storage.store_custom_metadata {
                            store.insert_custom_metadata(&mut tx, local_id, cm, columns).await?;
                        }
                        store.update_statistics(&mut tx, local_id, &self.server_id, ops).await?;
                        Ok(tx)
                    })
                    .await;
                }
                self.stats.apply_ops(&self.settings.id, &ops);
            }
            Err(e) => {
                self.queue_or_error_destination(destination, cm, local_id, &e.to_string()).await;
            }
        }
    }

    /// PENDING checkpoint around the response transformer: status PENDING is
    /// persisted before the script runs so crash recovery can replay it
    /// from the stored RESPONSE, then SENT is restored.
    pub(crate) async fn run_response_transformer(
        &self,
        destination: &Arc<Destination>,
        cm: &mut ConnectorMessage,
        local_id: Option<i64>,
    ) {
        let Some(script) = destination.response_transformer_script.clone() else {
            return;
        };
        let message_id = cm.message_id;

        cm.status = Status::Pending;
        if let Some(local_id) = local_id {
            let cm = &*cm;
            self.try_phase("response checkpoint", message_id, |store, mut tx| async move {
                store.update_status(&mut tx, local_id, cm).await?;
                if let Some(content) = cm.content(ContentType::Response) {
                    store.insert_content(&mut tx, local_id, message_id, cm.metadata_id, content).await?;
                }
                Ok(tx)
            })
            .await;
        }

        let content = cm.content_str(ContentType::Response).unwrap_or_default().to_string();
        match self.execute_script(&script, cm, content, false).await {
            Ok(outcome) => {
                cm.set_content(MessageContent::new(
                    ContentType::ResponseTransformed,
                    outcome.message.clone(),
                    None,
                ));
                cm.set_content(MessageContent::new(
                    ContentType::ProcessedResponse,
                    outcome.message,
                    None,
                ));
            }
            Err(e) => {
                tracing::error!(
                    channel_id = %self.settings.id,
                    message_id,
                    destination = %destination.name,
                    error = %e,
                    "response transformer failed"
                );
                cm.response_error = Some(e.to_string());
            }
        }
        cm.status = Status::Sent;
    }

    /// Send-error containment: queue-enabled destinations go QUEUED,
    /// everything else ERROR.
    async fn queue_or_error_destination(
        &self,
        destination: &Arc<Destination>,
        cm: &mut ConnectorMessage,
        local_id: Option<i64>,
        error: &str,
    ) {
        if let Some(queue) = &destination.queue {
            cm.status = Status::Queued;
            cm.processing_error = Some(error.to_string());
            let ops = vec![StatsOp {
                metadata_id: destination.metadata_id,
                increment: Status::Queued,
                decrement: None,
            }];
            let message_id = cm.message_id;
            if let Some(local_id) = local_id {
                let cm = &*cm;
                let ops = &ops;
                self.try_phase("destination queue", message_id, |store, mut tx| async move {
                    store.update_status(&mut tx, local_id, cm).await?;
                    // The queue worker resends from ENCODED; persist it
                    // regardless of the storage flags so rehydration works.
                    if let Some(content) = cm.content(ContentType::Encoded) {
                        store
                            .insert_content(&mut tx, local_id, message_id, cm.metadata_id, content)
                            .await?;
                    }
                    store.update_errors(&mut tx, local_id, cm).await?;
                    store.update_statistics(&mut tx, local_id, &self.server_id, ops).await?;
                    Ok(tx)
                })
                .await;
            }
            self.stats.apply_ops(&self.settings.id, &ops);
            tracing::info!(
                channel_id = %self.settings.id,
                message_id = cm.message_id,
                destination = %destination.name,
                error,
                "send failed, message queued"
            );
            queue.enqueue(cm.clone());
        } else {
            cm.status = Status::Error;
            cm.error_code = 1;
            cm.processing_error = Some(error.to_string());
            self.persist_destination_terminal(cm, local_id, Status::Error, None).await;
            tracing::warn!(
                channel_id = %self.settings.id,
                message_id = cm.message_id,
                destination = %destination.name,
                error,
                "destination send failed"
            );
        }
    }

    /// FILTERED/ERROR terminal persistence for one destination: status,
    /// error rows, maps, and statistics in one transaction.
    async fn persist_destination_terminal(
        &self,
        cm: &ConnectorMessage,
        local_id: Option<i64>,
        status: Status,
        decrement: Option<Status>,
    ) {
        let ops = vec![StatsOp { metadata_id: cm.metadata_id, increment: status, decrement }];
        let message_id = cm.message_id;
        if let Some(local_id) = local_id {
            let ops = &ops;
            let storage = &self.storage;
            self.try_phase("destination terminal", message_id, |store, mut tx| async move {
                store.update_status(&mut tx, local_id, cm).await?;
                store.update_errors(&mut tx, local_id, cm).await?;
                if storage.store_response {
                    if let Some(content) = cm.content(ContentType::Response) {
                        store
                            .insert_content(&mut tx, local_id, message_id, cm.metadata_id, content)
                            .await?;
                    }
                }
                if storage.store_maps {
                    store.update_maps(&mut tx, local_id, cm).await?;
                }
                store.update_statistics(&mut tx, local_id, &self.server_id, ops).await?;
                Ok(tx)
            })
            .await;
        }
        self.stats.apply_ops(&self.settings.id, &ops);
    }

    /// Runs one phase's store writes in a transaction; failures log and are
    /// swallowed so the in-memory pipeline continues. The closure receives
    /// the transaction by value and hands it back for the commit.
    pub(crate) async fn try_phase<F, Fut>(&self, phase: &str, message_id: i64, writes: F)
    where
        F: FnOnce(crate::store::MessageStore, StoreTransaction) -> Fut,
        Fut: std::future::Future<Output = Result<StoreTransaction>>,
    {
        let result: Result<()> = async {
            let tx = self.store.begin().await?;
            let tx = writes(self.store.clone(), tx).await?;
            tx.commit().await.map_err(|e| EngineError::Store(e.to_string()))
        }
        .await;
        if let Err(e) = result {
            tracing::error!(
                channel_id = %self.settings.id,
                message_id,
                phase,
                error = %e,
                "store transaction failed"
            );
        }
    }

    fn emit_message_complete(&self, message_id: i64) {
        self.events.emit(ServerEvent::MessageComplete {
            channel_id: self.settings.id.clone(),
            channel_name: self.settings.name.clone(),
            message_id,
        });
    }

    /// Executes an operator script against a connector message and writes
    /// the mutable outcome (maps, destination set) back.
    async fn execute_script(
        &self,
        script: &str,
        cm: &mut ConnectorMessage,
        content: String,
        with_destination_set: bool,
    ) -> std::result::Result<ScriptOutcome, ScriptError> {
        let bindings = ScriptBindings {
            channel_id: self.settings.id.clone(),
            channel_name: self.settings.name.clone(),
            connector_name: cm.connector_name.clone(),
            message_id: cm.message_id,
            metadata_id: cm.metadata_id,
            message: content,
            maps: ScriptMaps {
                source_map: cm.source_map.clone(),
                channel_map: cm.channel_map.clone(),
                connector_map: cm.connector_map.clone(),
                response_map: cm.response_map.clone(),
            },
            destination_set: if with_destination_set {
                destination_set::read(&cm.source_map)
            } else {
                None
            },
        };
        let outcome = self.script_executor.execute(script, bindings).await?;

        cm.channel_map = outcome.maps.channel_map.clone();
        cm.connector_map = outcome.maps.connector_map.clone();
        cm.response_map = outcome.maps.response_map.clone();
        if let Some(set) = &outcome.destination_set {
            cm.source_map.insert(DESTINATION_SET_KEY.to_string(), json!(set));
        }
        Ok(outcome)
    }
}

fn source_mut(message: &mut Message) -> Result<&mut ConnectorMessage> {
    message
        .source_mut()
        .ok_or_else(|| EngineError::Runtime("message has no source connector message".to_string()))
}
