// SPDX-FileCopyrightText: © 2025 Medbridge Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Channel lifecycle and state machine.
//!
//! A [`Channel`] owns one source connector, zero or more destinations, the
//! script and attachment handlers, and the storage policy. Lifecycle:
//!
//! ```text
//!   STOPPED → STARTING → STARTED
//!   STARTED → PAUSING → PAUSED → STARTING → STARTED
//!   STARTED|PAUSED → STOPPING → STOPPED
//! ```
//!
//! `pause` on STOPPED fails; `pause` on PAUSED is idempotent; `resume` on
//! STARTED fails. A failed start rolls back every connector that had been
//! started (best effort) and ends STOPPED with the original error. Every
//! transition emits a state-change event.

use crate::destination::{run_queue_worker, Destination, QueueWorkerContext};
use crate::ids::MessageIdAllocator;
use crate::recovery;
use crate::store::MessageStore;
use medbridge_core::{
    AttachmentHandler, ChannelSettings, DestinationContext, EngineError, EventBus, Message,
    MessageDispatcher, NoopScriptExecutor, PassthroughAttachmentHandler, RawMessage, Result,
    ScriptBindings, ScriptExecutor, ServerEvent, SourceConnector, SourceContext,
    SourceQueueSettings, Statistics, StorageSettings,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Channel lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Stopped,
    Starting,
    Started,
    Pausing,
    Paused,
    Stopping,
    Deploying,
    Undeploying,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Stopped => "STOPPED",
            Self::Starting => "STARTING",
            Self::Started => "STARTED",
            Self::Pausing => "PAUSING",
            Self::Paused => "PAUSED",
            Self::Stopping => "STOPPING",
            Self::Deploying => "DEPLOYING",
            Self::Undeploying => "UNDEPLOYING",
        };
        f.write_str(name)
    }
}

pub(crate) struct ChannelRuntime {
    pub(crate) cancellation: CancellationToken,
    pub(crate) workers: Vec<JoinHandle<()>>,
    pub(crate) intake_tx: Option<mpsc::Sender<Message>>,
}

/// A running (or stopped) channel instance.
pub struct Channel {
    pub(crate) settings: ChannelSettings,
    pub(crate) server_id: String,
    pub(crate) storage: StorageSettings,
    pub(crate) source: Arc<dyn SourceConnector>,
    pub(crate) source_filter: Option<String>,
    pub(crate) source_transformer: Option<String>,
    pub(crate) source_queue: SourceQueueSettings,
    pub(crate) destinations: Vec<Arc<Destination>>,
    pub(crate) script_executor: Arc<dyn ScriptExecutor>,
    pub(crate) attachment_handler: Arc<dyn AttachmentHandler>,
    pub(crate) store: MessageStore,
    pub(crate) stats: Arc<Statistics>,
    pub(crate) events: EventBus,
    pub(crate) cluster_mode: bool,
    state: StdMutex<ChannelState>,
    local_channel_id: StdMutex<Option<i64>>,
    tables_probed: AtomicBool,
    id_allocator: StdMutex<Option<Arc<MessageIdAllocator>>>,
    runtime: StdMutex<Option<ChannelRuntime>>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.settings.id)
            .field("name", &self.settings.name)
            .finish_non_exhaustive()
    }
}

/// Step-by-step construction for [`Channel`]; everything not supplied gets
/// a sensible default (no-op script executor, passthrough attachments,
/// fresh event bus and statistics).
pub struct ChannelBuilder {
    settings: ChannelSettings,
    server_id: String,
    storage: Option<StorageSettings>,
    source: Arc<dyn SourceConnector>,
    source_filter: Option<String>,
    source_transformer: Option<String>,
    source_queue: SourceQueueSettings,
    destinations: Vec<Arc<Destination>>,
    script_executor: Arc<dyn ScriptExecutor>,
    attachment_handler: Arc<dyn AttachmentHandler>,
    store: MessageStore,
    stats: Option<Arc<Statistics>>,
    events: Option<EventBus>,
    cluster_mode: bool,
}

impl ChannelBuilder {
    #[must_use]
    pub fn server_id(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = server_id.into();
        self
    }

    /// Overrides the flags derived from the channel's storage mode.
    #[must_use]
    pub fn storage(mut self, storage: StorageSettings) -> Self {
        self.storage = Some(storage);
        self
    }

    #[must_use]
    pub fn source_filter(mut self, script: impl Into<String>) -> Self {
        self.source_filter = Some(script.into());
        self
    }

    #[must_use]
    pub fn source_transformer(mut self, script: impl Into<String>) -> Self {
        self.source_transformer = Some(script.into());
        self
    }

    #[must_use]
    pub fn source_queue(mut self, settings: SourceQueueSettings) -> Self {
        self.source_queue = settings;
        self
    }

    #[must_use]
    pub fn destination(mut self, destination: Destination) -> Self {
        self.destinations.push(Arc::new(destination));
        self
    }

    #[must_use]
    pub fn script_executor(mut self, executor: Arc<dyn ScriptExecutor>) -> Self {
        self.script_executor = executor;
        self
    }

    #[must_use]
    pub fn attachment_handler(mut self, handler: Arc<dyn AttachmentHandler>) -> Self {
        self.attachment_handler = handler;
        self
    }

    #[must_use]
    pub fn stats(mut self, stats: Arc<Statistics>) -> Self {
        self.stats = Some(stats);
        self
    }

    #[must_use]
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    #[must_use]
    pub fn cluster_mode(mut self, enabled: bool) -> Self {
        self.cluster_mode = enabled;
        self
    }

    #[must_use]
    pub fn build(self) -> Arc<Channel> {
        let storage = self
            .storage
            .unwrap_or_else(|| StorageSettings::from_mode(self.settings.message_storage_mode));
        Arc::new(Channel {
            settings: self.settings,
            server_id: self.server_id,
            storage,
            source: self.source,
            source_filter: self.source_filter,
            source_transformer: self.source_transformer,
            source_queue: self.source_queue,
            destinations: self.destinations,
            script_executor: self.script_executor,
            attachment_handler: self.attachment_handler,
            store: self.store,
            stats: self.stats.unwrap_or_default(),
            events: self.events.unwrap_or_default(),
            cluster_mode: self.cluster_mode,
            state: StdMutex::new(ChannelState::Stopped),
            local_channel_id: StdMutex::new(None),
            tables_probed: AtomicBool::new(false),
            id_allocator: StdMutex::new(None),
            runtime: StdMutex::new(None),
        })
    }
}

struct ChannelDispatcher {
    channel: Arc<Channel>,
}

#[async_trait::async_trait]
impl MessageDispatcher for ChannelDispatcher {
    async fn dispatch(&self, raw: RawMessage) -> Result<medbridge_core::DispatchResult> {
        self.channel.dispatch_raw(raw).await
    }
}

impl Channel {
    #[must_use]
    pub fn builder(
        settings: ChannelSettings,
        source: Arc<dyn SourceConnector>,
        store: MessageStore,
    ) -> ChannelBuilder {
        ChannelBuilder {
            settings,
            server_id: "server-1".to_string(),
            storage: None,
            source,
            source_filter: None,
            source_transformer: None,
            source_queue: SourceQueueSettings::default(),
            destinations: Vec::new(),
            script_executor: Arc::new(NoopScriptExecutor),
            attachment_handler: Arc::new(PassthroughAttachmentHandler),
            store,
            stats: None,
            events: None,
            cluster_mode: false,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.settings.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.settings.name
    }

    #[must_use]
    pub fn state(&self) -> ChannelState {
        *self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    #[must_use]
    pub fn settings(&self) -> &ChannelSettings {
        &self.settings
    }

    fn set_state(&self, next: ChannelState) {
        let previous = {
            let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            std::mem::replace(&mut *state, next)
        };
        if previous != next {
            tracing::info!(
                channel_id = %self.settings.id,
                channel = %self.settings.name,
                previous = %previous,
                state = %next,
                "channel state changed"
            );
            self.events.emit(ServerEvent::StateChange {
                channel_id: self.settings.id.clone(),
                channel_name: self.settings.name.clone(),
                previous_state: previous.to_string(),
                state: next.to_string(),
            });
        }
    }

    fn transition(&self, expected: &[ChannelState], next: ChannelState) -> Result<ChannelState> {
        let current = self.state();
        if !expected.contains(&current) {
            return Err(EngineError::Runtime(format!(
                "illegal channel state transition: {current} -> {next}"
            )));
        }
        self.set_state(next);
        Ok(current)
    }

    /// Dispatching is legal whenever the channel is not in (or on its way
    /// to) STOPPED.
    pub(crate) fn dispatch_allowed(&self) -> bool {
        matches!(
            self.state(),
            ChannelState::Starting
                | ChannelState::Started
                | ChannelState::Pausing
                | ChannelState::Paused
        )
    }

    pub(crate) fn local_channel_id(&self) -> Option<i64> {
        *self.local_channel_id.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub(crate) fn intake_sender(&self) -> Option<mpsc::Sender<Message>> {
        self.runtime
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
            .and_then(|r| r.intake_tx.clone())
    }

    /// Lazily probes whether this channel's tables exist; the result is
    /// cached for the lifetime of the instance. When the probe itself
    /// fails, persistence is skipped for this message and the probe
    /// retried next time.
    pub(crate) async fn ensure_tables_probed(&self) -> Option<i64> {
        if !self.storage.enabled {
            return None;
        }
        if self.tables_probed.load(Ordering::SeqCst) {
            return self.local_channel_id();
        }
        match self.store.local_channel_id(&self.settings.id).await {
            Ok(local_id) => {
                *self
                    .local_channel_id
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner) = local_id;
                self.tables_probed.store(true, Ordering::SeqCst);
                if local_id.is_none() {
                    tracing::debug!(
                        channel_id = %self.settings.id,
                        "channel tables missing, persistence disabled"
                    );
                }
                local_id
            }
            Err(e) => {
                tracing::error!(channel_id = %self.settings.id, error = %e, "table probe failed");
                None
            }
        }
    }

    pub(crate) async fn next_message_id(&self) -> Result<i64> {
        let existing = self
            .id_allocator
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        let allocator = match existing {
            Some(allocator) => allocator,
            None => {
                let local_id = self.ensure_tables_probed().await;
                let allocator = Arc::new(match local_id {
                    Some(local_id) => {
                        MessageIdAllocator::durable(self.store.clone(), local_id, self.cluster_mode)
                    }
                    None => MessageIdAllocator::local(),
                });
                *self
                    .id_allocator
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(allocator.clone());
                allocator
            }
        };
        allocator.next().await
    }

    async fn run_lifecycle_script(&self, script: Option<&String>, phase: &str) -> Result<()> {
        let Some(script) = script else { return Ok(()) };
        let bindings = ScriptBindings::lifecycle(&self.settings.id, &self.settings.name);
        self.script_executor
            .execute(script, bindings)
            .await
            .map(|_| ())
            .map_err(|e| EngineError::Script(format!("{phase} script failed: {e}")))
    }

    /// Registers the channel's table family and switches the channel to
    /// durable operation. STOPPED → DEPLOYING → STOPPED.
    pub async fn deploy(&self) -> Result<()> {
        self.transition(&[ChannelState::Stopped], ChannelState::Deploying)?;
        let result = async {
            if self.storage.enabled {
                let local_id = self.store.register_channel(&self.settings.id).await?;
                *self
                    .local_channel_id
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(local_id);
                self.tables_probed.store(true, Ordering::SeqCst);
                *self
                    .id_allocator
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner) =
                    Some(Arc::new(MessageIdAllocator::durable(
                        self.store.clone(),
                        local_id,
                        self.cluster_mode,
                    )));
            }
            Ok(())
        }
        .await;
        self.set_state(ChannelState::Stopped);
        result
    }

    /// Stops the channel when needed and drops its in-memory statistics.
    /// → UNDEPLOYING → STOPPED.
    pub async fn undeploy(&self) -> Result<()> {
        if matches!(self.state(), ChannelState::Started | ChannelState::Paused) {
            self.stop().await?;
        }
        self.transition(&[ChannelState::Stopped], ChannelState::Undeploying)?;
        self.stats.remove_channel(&self.settings.id);
        self.set_state(ChannelState::Stopped);
        Ok(())
    }

    /// Starts the channel: deploy script, statistics load, recovery,
    /// connector deploy hooks (destinations then source), destination
    /// start, queue workers, source last. Any failure rolls back started
    /// connectors in reverse order and leaves the channel STOPPED.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.transition(&[ChannelState::Stopped], ChannelState::Starting)?;

        let cancellation = CancellationToken::new();
        let mut started: Vec<Arc<Destination>> = Vec::new();
        let mut workers: Vec<JoinHandle<()>> = Vec::new();

        match self.try_start(&cancellation, &mut started, &mut workers).await {
            Ok(intake_tx) => {
                *self.runtime.lock().unwrap_or_else(std::sync::PoisonError::into_inner) =
                    Some(ChannelRuntime { cancellation, workers, intake_tx });
                self.set_state(ChannelState::Started);
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    channel_id = %self.settings.id,
                    error = %e,
                    "channel start failed, rolling back"
                );
                self.rollback_start(&cancellation, &started, workers).await;
                self.set_state(ChannelState::Stopped);
                Err(e)
            }
        }
    }

    async fn try_start(
        self: &Arc<Self>,
        cancellation: &CancellationToken,
        started: &mut Vec<Arc<Destination>>,
        workers: &mut Vec<JoinHandle<()>>,
    ) -> Result<Option<mpsc::Sender<Message>>> {
        self.run_lifecycle_script(self.settings.deploy_script.as_ref(), "deploy").await?;

        // Store problems never block start; the channel degrades to
        // in-memory operation.
        let local_id = self.ensure_tables_probed().await;
        if let Some(local_id) = local_id {
            match self.store.load_statistics(local_id).await {
                Ok(counts) => self.stats.load_channel(&self.settings.id, counts),
                Err(e) => {
                    tracing::error!(channel_id = %self.settings.id, error = %e, "statistics load failed");
                }
            }
            if self.storage.message_recovery_enabled {
                recovery::run(self, local_id).await;
            }
        }

        for destination in &self.destinations {
            destination.connector.on_deploy().await?;
        }
        self.source.on_deploy().await?;

        for destination in &self.destinations {
            destination
                .connector
                .start(DestinationContext {
                    channel_id: self.settings.id.clone(),
                    channel_name: self.settings.name.clone(),
                    metadata_id: destination.metadata_id,
                    events: self.events.clone(),
                    cancellation: cancellation.clone(),
                })
                .await?;
            started.push(Arc::clone(destination));
        }

        for destination in &self.destinations {
            let Some(queue) = &destination.queue else { continue };
            if let Some(local_id) = local_id {
                match self
                    .store
                    .queued_connector_messages(
                        local_id,
                        destination.metadata_id,
                        &self.settings.id,
                        &self.settings.name,
                    )
                    .await
                {
                    Ok(entries) if !entries.is_empty() => {
                        tracing::info!(
                            channel_id = %self.settings.id,
                            destination = %destination.name,
                            count = entries.len(),
                            "rehydrated destination queue"
                        );
                        queue.rehydrate(entries);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!(
                            channel_id = %self.settings.id,
                            destination = %destination.name,
                            error = %e,
                            "queue rehydration failed"
                        );
                    }
                }
            }
            workers.push(tokio::spawn(run_queue_worker(
                Arc::clone(destination),
                QueueWorkerContext {
                    channel_id: self.settings.id.clone(),
                    server_id: self.server_id.clone(),
                    store: self.store.clone(),
                    local_channel_id: local_id,
                    stats: Arc::clone(&self.stats),
                    events: self.events.clone(),
                    cancellation: cancellation.clone(),
                },
            )));
        }

        let intake_tx = if self.source_queue.respond_after_processing {
            None
        } else {
            let (tx, rx) = mpsc::channel(self.source_queue.buffer_capacity.max(1));
            let channel = Arc::clone(self);
            let cancel = cancellation.clone();
            workers.push(tokio::spawn(async move {
                channel.run_intake_worker(rx, cancel).await;
            }));
            Some(tx)
        };

        self.source
            .start(SourceContext {
                channel_id: self.settings.id.clone(),
                channel_name: self.settings.name.clone(),
                dispatcher: Arc::new(ChannelDispatcher { channel: Arc::clone(self) }),
                events: self.events.clone(),
                cancellation: cancellation.clone(),
            })
            .await?;

        Ok(intake_tx)
    }

    /// Best-effort teardown after a failed start; rollback errors are
    /// logged and swallowed.
    async fn rollback_start(
        &self,
        cancellation: &CancellationToken,
        started: &[Arc<Destination>],
        workers: Vec<JoinHandle<()>>,
    ) {
        cancellation.cancel();
        if let Err(e) = self.source.stop().await {
            tracing::warn!(channel_id = %self.settings.id, error = %e, "source rollback failed");
        }
        for destination in started.iter().rev() {
            if let Err(e) = destination.connector.stop().await {
                tracing::warn!(
                    channel_id = %self.settings.id,
                    destination = %destination.name,
                    error = %e,
                    "destination rollback failed"
                );
            }
        }
        for worker in workers {
            let _ = worker.await;
        }
    }

    /// Graceful stop: undeploy script runs.
    pub async fn stop(&self) -> Result<()> {
        self.stop_inner(true).await
    }

    /// Process-teardown variant: skips the undeploy script.
    pub async fn halt(&self) -> Result<()> {
        self.stop_inner(false).await
    }

    async fn stop_inner(&self, run_undeploy_script: bool) -> Result<()> {
        if self.state() == ChannelState::Stopped {
            return Ok(());
        }
        self.transition(
            &[ChannelState::Started, ChannelState::Paused],
            ChannelState::Stopping,
        )?;

        let mut first_error: Option<EngineError> = None;
        let mut record = |result: Result<()>, what: &str, channel_id: &str| {
            if let Err(e) = result {
                tracing::error!(channel_id, error = %e, "{what} failed during stop");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        };

        let runtime = {
            let mut guard = self.runtime.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            guard.take()
        };
        // Cancelling first stops the source-queue worker and every
        // destination queue worker between units of work.
        if let Some(runtime) = &runtime {
            runtime.cancellation.cancel();
        }

        record(self.source.stop().await, "source stop", &self.settings.id);
        for destination in &self.destinations {
            record(
                destination.connector.stop().await,
                "destination stop",
                &self.settings.id,
            );
        }
        if let Some(runtime) = runtime {
            for worker in runtime.workers {
                let _ = worker.await;
            }
        }

        if run_undeploy_script {
            record(
                self.run_lifecycle_script(self.settings.undeploy_script.as_ref(), "undeploy")
                    .await,
                "undeploy script",
                &self.settings.id,
            );
        }

        // The state ends STOPPED even when a step failed.
        self.set_state(ChannelState::Stopped);
        first_error.map_or(Ok(()), Err)
    }

    /// STARTED → PAUSING → PAUSED. Stops the source; queue workers and
    /// in-flight messages continue.
    pub async fn pause(&self) -> Result<()> {
        match self.state() {
            ChannelState::Paused => {
                tracing::warn!(channel_id = %self.settings.id, "channel already paused");
                return Ok(());
            }
            ChannelState::Started => {}
            other => {
                return Err(EngineError::Runtime(format!(
                    "cannot pause channel in state {other}"
                )));
            }
        }
        self.transition(&[ChannelState::Started], ChannelState::Pausing)?;
        let result = self.source.stop().await;
        self.set_state(ChannelState::Paused);
        result
    }

    /// PAUSED → STARTING → STARTED. Restarts the source against the
    /// existing runtime.
    pub async fn resume(self: &Arc<Self>) -> Result<()> {
        if self.state() == ChannelState::Started {
            return Err(EngineError::Runtime("channel is already started".to_string()));
        }
        self.transition(&[ChannelState::Paused], ChannelState::Starting)?;

        let cancellation = self
            .runtime
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
            .map(|r| r.cancellation.clone())
            .unwrap_or_default();

        let result = self
            .source
            .start(SourceContext {
                channel_id: self.settings.id.clone(),
                channel_name: self.settings.name.clone(),
                dispatcher: Arc::new(ChannelDispatcher { channel: Arc::clone(self) }),
                events: self.events.clone(),
                cancellation,
            })
            .await;

        match result {
            Ok(()) => {
                self.set_state(ChannelState::Started);
                Ok(())
            }
            Err(e) => {
                self.set_state(ChannelState::Paused);
                Err(e)
            }
        }
    }
}
