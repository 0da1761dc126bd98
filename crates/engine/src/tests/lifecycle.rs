// SPDX-FileCopyrightText: © 2025 Medbridge Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Channel state-machine and lifecycle tests.

use super::support::{ScriptedDestination, StubSource, SAMPLE_HL7};
use crate::channel::{Channel, ChannelState};
use crate::destination::Destination;
use crate::store::MessageStore;
use async_trait::async_trait;
use medbridge_core::{
    ChannelSettings, DataType, DestinationConnector, DestinationContext, EngineError, RawMessage,
    Response, Result, ServerEvent, SourceConnector, SourceContext,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct FailingSource;

#[async_trait]
impl SourceConnector for FailingSource {
    fn name(&self) -> &str {
        "Broken Source"
    }

    fn inbound_data_type(&self) -> DataType {
        DataType::Hl7v2
    }

    async fn start(&self, _ctx: SourceContext) -> Result<()> {
        Err(EngineError::Network("bind failed".to_string()))
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct TrackingDestination {
    started: AtomicBool,
    stopped: AtomicBool,
}

#[async_trait]
impl DestinationConnector for TrackingDestination {
    fn name(&self) -> &str {
        "Tracking"
    }

    async fn start(&self, _ctx: DestinationContext) -> Result<()> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, _message: &medbridge_core::ConnectorMessage) -> Result<Response> {
        Ok(Response::sent(String::new()))
    }
}

async fn test_channel(id: &str) -> Arc<Channel> {
    let store = MessageStore::in_memory().await.unwrap();
    Channel::builder(ChannelSettings::new(id, "Lifecycle"), Arc::new(StubSource), store)
        .destination(Destination::new(1, Arc::new(ScriptedDestination::always_ok("Dst1"))))
        .build()
}

#[tokio::test]
async fn test_start_stop_cycle() {
    let channel = test_channel("ch-cycle").await;
    assert_eq!(channel.state(), ChannelState::Stopped);

    channel.start().await.unwrap();
    assert_eq!(channel.state(), ChannelState::Started);

    channel.stop().await.unwrap();
    assert_eq!(channel.state(), ChannelState::Stopped);

    // Start, stop, start again: same observable state.
    channel.start().await.unwrap();
    assert_eq!(channel.state(), ChannelState::Started);
    channel.stop().await.unwrap();
    assert_eq!(channel.state(), ChannelState::Stopped);
}

#[tokio::test]
async fn test_stop_on_stopped_is_a_no_op() {
    let channel = test_channel("ch-noop").await;
    channel.stop().await.unwrap();
    assert_eq!(channel.state(), ChannelState::Stopped);
}

#[tokio::test]
async fn test_double_start_is_illegal() {
    let channel = test_channel("ch-double").await;
    channel.start().await.unwrap();
    match channel.start().await {
        Err(EngineError::Runtime(msg)) => assert!(msg.contains("illegal")),
        other => panic!("expected illegal transition, got {other:?}"),
    }
    channel.stop().await.unwrap();
}

#[tokio::test]
async fn test_pause_and_resume() {
    let channel = test_channel("ch-pause").await;

    // pause on STOPPED fails
    assert!(channel.pause().await.is_err());

    channel.start().await.unwrap();
    channel.pause().await.unwrap();
    assert_eq!(channel.state(), ChannelState::Paused);

    // pause on PAUSED is idempotent
    channel.pause().await.unwrap();
    assert_eq!(channel.state(), ChannelState::Paused);

    channel.resume().await.unwrap();
    assert_eq!(channel.state(), ChannelState::Started);

    // resume on STARTED fails
    assert!(channel.resume().await.is_err());

    channel.stop().await.unwrap();
}

#[tokio::test]
async fn test_paused_channel_still_drains_in_flight_work() {
    let channel = test_channel("ch-drain").await;
    channel.start().await.unwrap();
    channel.pause().await.unwrap();

    // Dispatch is still legal while paused (the source is stopped, but
    // queue workers and in-flight messages continue).
    let result = channel.dispatch_raw(RawMessage::new(SAMPLE_HL7)).await.unwrap();
    assert!(result.message.processed);

    channel.stop().await.unwrap();
}

#[tokio::test]
async fn test_failed_start_rolls_back_and_ends_stopped() {
    let store = MessageStore::in_memory().await.unwrap();
    let destination = Arc::new(TrackingDestination::default());
    let channel = Channel::builder(
        ChannelSettings::new("ch-rollback", "Rollback"),
        Arc::new(FailingSource),
        store,
    )
    .destination(Destination::new(1, destination.clone()))
    .build();

    match channel.start().await {
        Err(EngineError::Network(msg)) => assert_eq!(msg, "bind failed"),
        other => panic!("expected the source bind failure, got {other:?}"),
    }
    assert_eq!(channel.state(), ChannelState::Stopped);
    assert!(destination.started.load(Ordering::SeqCst));
    assert!(destination.stopped.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_state_change_events_are_emitted() {
    let channel = test_channel("ch-events").await;
    let mut rx = channel.events.subscribe();

    channel.start().await.unwrap();
    channel.stop().await.unwrap();

    let mut transitions = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let ServerEvent::StateChange { previous_state, state, channel_id, .. } = event {
            assert_eq!(channel_id, "ch-events");
            transitions.push((previous_state, state));
        }
    }
    assert_eq!(
        transitions,
        vec![
            ("STOPPED".to_string(), "STARTING".to_string()),
            ("STARTING".to_string(), "STARTED".to_string()),
            ("STARTED".to_string(), "STOPPING".to_string()),
            ("STOPPING".to_string(), "STOPPED".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_halt_skips_undeploy_script() {
    use super::support::{pass, StubExecutor};

    let store = MessageStore::in_memory().await.unwrap();
    let executor = Arc::new(StubExecutor::new(Box::new(|_, bindings| Ok(pass(bindings)))));
    let settings = ChannelSettings {
        undeploy_script: Some("undeploy".to_string()),
        ..ChannelSettings::new("ch-halt", "Halt")
    };
    let channel = Channel::builder(settings, Arc::new(StubSource), store)
        .script_executor(executor.clone())
        .build();

    channel.start().await.unwrap();
    channel.halt().await.unwrap();
    assert_eq!(channel.state(), ChannelState::Stopped);
    assert!(executor.calls.lock().unwrap().is_empty());

    // A graceful stop runs it.
    channel.start().await.unwrap();
    channel.stop().await.unwrap();
    let calls = executor.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "undeploy");
}

#[tokio::test]
async fn test_dispatch_refused_when_stopped() {
    let channel = test_channel("ch-refuse").await;
    match channel.dispatch_raw(RawMessage::new(SAMPLE_HL7)).await {
        Err(EngineError::Runtime(msg)) => assert!(msg.contains("not accepting")),
        other => panic!("expected dispatch refusal, got {other:?}"),
    }
}

#[tokio::test]
async fn test_undeploy_clears_statistics() {
    let channel = test_channel("ch-undeploy").await;
    channel.deploy().await.unwrap();
    channel.start().await.unwrap();
    channel.dispatch_raw(RawMessage::new(SAMPLE_HL7)).await.unwrap();
    assert_eq!(channel.stats.connector_counts("ch-undeploy", None).received, 1);

    channel.undeploy().await.unwrap();
    assert_eq!(channel.state(), ChannelState::Stopped);
    assert_eq!(channel.stats.connector_counts("ch-undeploy", None).received, 0);
}
