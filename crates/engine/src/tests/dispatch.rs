// SPDX-FileCopyrightText: © 2025 Medbridge Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Pipeline dispatch tests over an in-memory store.

use super::support::{
    pass, wait_until, ScriptedDestination, SendBehavior, StubExecutor, StubSource, SAMPLE_HL7,
};
use crate::channel::Channel;
use crate::destination::Destination;
use crate::store::MessageStore;
use medbridge_core::{
    ChannelSettings, QueueSettings, RawMessage, SourceQueueSettings, Status, StorageMode,
    StorageSettings,
};
use std::sync::Arc;

fn settings(id: &str) -> ChannelSettings {
    ChannelSettings::new(id, format!("Channel {id}"))
}

#[tokio::test]
async fn test_dispatch_reaches_all_destinations() {
    let store = MessageStore::in_memory().await.unwrap();
    let dst1 = Arc::new(ScriptedDestination::always_ok("Dst1"));
    let dst2 = Arc::new(ScriptedDestination::always_ok("Dst2"));

    let channel = Channel::builder(settings("ch-1"), Arc::new(StubSource), store)
        .destination(Destination::new(1, dst1.clone()))
        .destination(Destination::new(2, dst2.clone()))
        .build();
    channel.deploy().await.unwrap();
    channel.start().await.unwrap();

    let result = channel.dispatch_raw(RawMessage::new(SAMPLE_HL7)).await.unwrap();
    let message = &result.message;

    // Source plus one row per destination.
    assert!(message.processed);
    assert_eq!(message.connector_messages.len(), 3);
    assert_eq!(message.connector_message(1).unwrap().status, Status::Sent);
    assert_eq!(message.connector_message(2).unwrap().status, Status::Sent);
    assert_eq!(dst1.sent_count(), 1);
    assert_eq!(dst2.sent_count(), 1);

    // First SENT destination's response is selected for the source.
    assert_eq!(result.selected_response.unwrap().message, "MSA|AA|1");

    let counts = channel.stats.channel_counts("ch-1");
    assert_eq!(counts[&None].received, 1);
    assert_eq!(counts[&None].sent, 2);
    assert_eq!(counts[&Some(1)].sent, 1);

    channel.stop().await.unwrap();
}

#[tokio::test]
async fn test_destination_error_is_contained() {
    let store = MessageStore::in_memory().await.unwrap();
    let failing = Arc::new(ScriptedDestination::new(
        "Dst1",
        vec![SendBehavior::Fail("connection refused".to_string())],
    ));
    let healthy = Arc::new(ScriptedDestination::always_ok("Dst2"));

    let channel = Channel::builder(settings("ch-err"), Arc::new(StubSource), store)
        .destination(Destination::new(1, failing))
        .destination(Destination::new(2, healthy.clone()))
        .build();
    channel.deploy().await.unwrap();
    channel.start().await.unwrap();

    let result = channel.dispatch_raw(RawMessage::new(SAMPLE_HL7)).await.unwrap();
    let message = &result.message;

    // The failed destination never blocks the next one.
    assert_eq!(message.connector_message(1).unwrap().status, Status::Error);
    assert!(message
        .connector_message(1)
        .unwrap()
        .processing_error
        .as_deref()
        .unwrap()
        .contains("connection refused"));
    assert_eq!(message.connector_message(2).unwrap().status, Status::Sent);
    assert_eq!(healthy.sent_count(), 1);
    assert!(message.processed);

    let counts = channel.stats.channel_counts("ch-err");
    assert_eq!(counts[&None].error, 1);
    assert_eq!(counts[&None].sent, 1);

    channel.stop().await.unwrap();
}

#[tokio::test]
async fn test_queue_retry_until_sent() {
    // S2: two refusals, then success; SENT on the third attempt with
    // sendAttempts = 3 and no ERROR accounted.
    let store = MessageStore::in_memory().await.unwrap();
    let destination = Arc::new(ScriptedDestination::new(
        "Dst1",
        vec![
            SendBehavior::Fail("connection refused".to_string()),
            SendBehavior::Fail("connection refused".to_string()),
            SendBehavior::Succeed("MSA|AA|42".to_string()),
        ],
    ));

    let channel = Channel::builder(settings("ch-queue"), Arc::new(StubSource), store.clone())
        .destination(Destination::new(1, destination.clone()).with_queue(QueueSettings {
            enabled: true,
            retry_count: 3,
            retry_interval_ms: 20,
            validate_response: false,
        }))
        .build();
    channel.deploy().await.unwrap();
    channel.start().await.unwrap();

    let result = channel.dispatch_raw(RawMessage::new(SAMPLE_HL7)).await.unwrap();
    assert_eq!(result.message.connector_message(1).unwrap().status, Status::Queued);

    let stats = Arc::clone(&channel.stats);
    assert!(
        wait_until(|| stats.connector_counts("ch-queue", Some(1)).sent == 1).await,
        "queued message should eventually send"
    );

    let counts = channel.stats.connector_counts("ch-queue", Some(1));
    assert_eq!(counts.sent, 1);
    assert_eq!(counts.error, 0);
    assert_eq!(counts.queued, 0);
    assert_eq!(destination.sent_count(), 1);

    channel.stop().await.unwrap();
}

#[tokio::test]
async fn test_queue_exhaustion_releases_as_error() {
    let store = MessageStore::in_memory().await.unwrap();
    let destination = Arc::new(ScriptedDestination::new(
        "Dst1",
        vec![
            SendBehavior::Fail("refused".to_string()),
            SendBehavior::Fail("refused".to_string()),
        ],
    ));

    let channel = Channel::builder(settings("ch-exhaust"), Arc::new(StubSource), store)
        .destination(Destination::new(1, destination).with_queue(QueueSettings {
            enabled: true,
            retry_count: 2,
            retry_interval_ms: 10,
            validate_response: false,
        }))
        .build();
    channel.deploy().await.unwrap();
    channel.start().await.unwrap();

    channel.dispatch_raw(RawMessage::new(SAMPLE_HL7)).await.unwrap();

    let stats = Arc::clone(&channel.stats);
    assert!(
        wait_until(|| stats.connector_counts("ch-exhaust", Some(1)).error == 1).await,
        "exhausted retries should settle as ERROR"
    );
    assert_eq!(channel.stats.connector_counts("ch-exhaust", Some(1)).queued, 0);

    channel.stop().await.unwrap();
}

#[tokio::test]
async fn test_destination_set_exclusion() {
    // S3: the source transformer removes id 2; Dst2 ends FILTERED and its
    // send is never invoked, but the accounting still shows all three
    // connector messages.
    let store = MessageStore::in_memory().await.unwrap();
    let dst1 = Arc::new(ScriptedDestination::always_ok("Dst1"));
    let dst2 = Arc::new(ScriptedDestination::always_ok("Dst2"));

    let executor = StubExecutor::new(Box::new(|script, bindings| {
        let mut outcome = pass(bindings);
        if script.contains("remove-dst2") {
            outcome.destination_set = Some(vec![1]);
        }
        Ok(outcome)
    }));

    let channel = Channel::builder(settings("ch-set"), Arc::new(StubSource), store)
        .script_executor(Arc::new(executor))
        .source_transformer("remove-dst2")
        .destination(Destination::new(1, dst1.clone()))
        .destination(Destination::new(2, dst2.clone()))
        .build();
    channel.deploy().await.unwrap();
    channel.start().await.unwrap();

    let result = channel.dispatch_raw(RawMessage::new(SAMPLE_HL7)).await.unwrap();
    let message = &result.message;

    assert_eq!(message.connector_messages.len(), 3);
    assert_eq!(message.connector_message(1).unwrap().status, Status::Sent);
    assert_eq!(message.connector_message(2).unwrap().status, Status::Filtered);
    assert_eq!(dst1.sent_count(), 1);
    assert_eq!(dst2.sent_count(), 0);

    channel.stop().await.unwrap();
}

#[tokio::test]
async fn test_source_filter_short_circuits() {
    let store = MessageStore::in_memory().await.unwrap();
    let destination = Arc::new(ScriptedDestination::always_ok("Dst1"));

    let executor = StubExecutor::new(Box::new(|script, bindings| {
        let mut outcome = pass(bindings);
        if script.contains("reject") {
            outcome.value = serde_json::Value::Bool(false);
        }
        Ok(outcome)
    }));

    let channel = Channel::builder(settings("ch-filter"), Arc::new(StubSource), store)
        .script_executor(Arc::new(executor))
        .source_filter("reject")
        .destination(Destination::new(1, destination.clone()))
        .build();
    channel.deploy().await.unwrap();
    channel.start().await.unwrap();

    let result = channel.dispatch_raw(RawMessage::new(SAMPLE_HL7)).await.unwrap();
    let message = &result.message;

    assert!(message.processed);
    assert_eq!(message.source().unwrap().status, Status::Filtered);
    assert_eq!(destination.sent_count(), 0);

    let counts = channel.stats.channel_counts("ch-filter");
    assert_eq!(counts[&None].filtered, 1);
    assert_eq!(counts[&None].received, 1);

    channel.stop().await.unwrap();
}

#[tokio::test]
async fn test_source_script_error_marks_source_error() {
    let store = MessageStore::in_memory().await.unwrap();
    let destination = Arc::new(ScriptedDestination::always_ok("Dst1"));

    let executor = StubExecutor::new(Box::new(|_script, _bindings| {
        Err(medbridge_core::ScriptError::Execution("boom".to_string()))
    }));

    let channel = Channel::builder(settings("ch-crash"), Arc::new(StubSource), store)
        .script_executor(Arc::new(executor))
        .source_transformer("explode")
        .destination(Destination::new(1, destination.clone()))
        .build();
    channel.deploy().await.unwrap();
    channel.start().await.unwrap();

    // The dispatch itself succeeds; the message comes back partially
    // complete with the source in ERROR.
    let result = channel.dispatch_raw(RawMessage::new(SAMPLE_HL7)).await.unwrap();
    let source = result.message.source().unwrap();
    assert_eq!(source.status, Status::Error);
    assert!(source.processing_error.as_deref().unwrap().contains("boom"));
    assert_eq!(destination.sent_count(), 0);
    assert_eq!(channel.stats.connector_counts("ch-crash", Some(0)).error, 1);

    channel.stop().await.unwrap();
}

#[tokio::test]
async fn test_transformer_output_feeds_destinations() {
    let store = MessageStore::in_memory().await.unwrap();
    let destination = Arc::new(ScriptedDestination::always_ok("Dst1"));

    let executor = StubExecutor::new(Box::new(|script, bindings| {
        let mut outcome = pass(bindings);
        if script.contains("uppercase") {
            outcome.message = bindings.message.to_uppercase();
        }
        Ok(outcome)
    }));

    let channel = Channel::builder(settings("ch-xfm"), Arc::new(StubSource), store)
        .script_executor(Arc::new(executor))
        .source_transformer("uppercase")
        .destination(Destination::new(1, destination.clone()))
        .build();
    channel.deploy().await.unwrap();
    channel.start().await.unwrap();

    channel.dispatch_raw(RawMessage::new("msh|lower")).await.unwrap();
    assert_eq!(destination.sent.lock().unwrap().as_slice(), ["MSH|LOWER".to_string()]);

    channel.stop().await.unwrap();
}

#[tokio::test]
async fn test_disabled_storage_runs_in_memory() {
    let store = MessageStore::in_memory().await.unwrap();
    let destination = Arc::new(ScriptedDestination::always_ok("Dst1"));

    let channel = Channel::builder(
        ChannelSettings {
            message_storage_mode: StorageMode::Disabled,
            ..settings("ch-mem")
        },
        Arc::new(StubSource),
        store.clone(),
    )
    .storage(StorageSettings::from_mode(StorageMode::Disabled))
    .destination(Destination::new(1, destination.clone()))
    .build();
    channel.deploy().await.unwrap();
    channel.start().await.unwrap();

    let result = channel.dispatch_raw(RawMessage::new(SAMPLE_HL7)).await.unwrap();
    assert!(result.message.processed);
    assert_eq!(destination.sent_count(), 1);

    // Nothing was registered or persisted.
    assert!(!store.channel_tables_exist("ch-mem").await.unwrap());

    channel.stop().await.unwrap();
}

#[tokio::test]
async fn test_async_intake_processes_in_background() {
    let store = MessageStore::in_memory().await.unwrap();
    let destination = Arc::new(ScriptedDestination::always_ok("Dst1"));

    let channel = Channel::builder(settings("ch-async"), Arc::new(StubSource), store)
        .source_queue(SourceQueueSettings {
            respond_after_processing: false,
            buffer_capacity: 16,
        })
        .destination(Destination::new(1, destination.clone()))
        .build();
    channel.deploy().await.unwrap();
    channel.start().await.unwrap();

    // The dispatch acknowledges before processing.
    let result = channel.dispatch_raw(RawMessage::new(SAMPLE_HL7)).await.unwrap();
    assert!(!result.message.processed);
    assert!(result.selected_response.is_none());

    let stats = Arc::clone(&channel.stats);
    assert!(
        wait_until(|| stats.connector_counts("ch-async", Some(1)).sent == 1).await,
        "intake worker should process the message"
    );
    assert_eq!(destination.sent_count(), 1);

    channel.stop().await.unwrap();
}

#[tokio::test]
async fn test_channel_map_flows_across_destinations() {
    let store = MessageStore::in_memory().await.unwrap();
    let dst1 = Arc::new(ScriptedDestination::always_ok("Dst1"));
    let dst2 = Arc::new(ScriptedDestination::always_ok("Dst2"));

    let executor = StubExecutor::new(Box::new(|script, bindings| {
        let mut outcome = pass(bindings);
        if script.contains("stamp") {
            outcome
                .maps
                .channel_map
                .insert("stamped".to_string(), serde_json::json!(true));
        }
        if script.contains("check") {
            let stamped = bindings.maps.channel_map.contains_key("stamped");
            outcome.value = serde_json::Value::Bool(stamped);
        }
        Ok(outcome)
    }));

    // Dst1's transformer writes to the channel map; Dst2's filter reads it.
    let channel = Channel::builder(settings("ch-map"), Arc::new(StubSource), store)
        .script_executor(Arc::new(executor))
        .destination(Destination::new(1, dst1).with_transformer("stamp"))
        .destination(Destination::new(2, dst2.clone()).with_filter("check"))
        .build();
    channel.deploy().await.unwrap();
    channel.start().await.unwrap();

    let result = channel.dispatch_raw(RawMessage::new(SAMPLE_HL7)).await.unwrap();
    // Dst2's filter accepted because the stamp was visible.
    assert_eq!(result.message.connector_message(2).unwrap().status, Status::Sent);
    assert_eq!(dst2.sent_count(), 1);

    channel.stop().await.unwrap();
}

#[tokio::test]
async fn test_message_ids_are_monotonic() {
    let store = MessageStore::in_memory().await.unwrap();
    let channel = Channel::builder(settings("ch-ids"), Arc::new(StubSource), store)
        .destination(Destination::new(1, Arc::new(ScriptedDestination::always_ok("Dst1"))))
        .build();
    channel.deploy().await.unwrap();
    channel.start().await.unwrap();

    let mut last = 0;
    for _ in 0..3 {
        let result = channel.dispatch_raw(RawMessage::new(SAMPLE_HL7)).await.unwrap();
        assert!(result.message.message_id > last);
        last = result.message.message_id;
    }

    // Restart: the durable sequence keeps ids increasing.
    channel.stop().await.unwrap();
    channel.start().await.unwrap();
    let result = channel.dispatch_raw(RawMessage::new(SAMPLE_HL7)).await.unwrap();
    assert!(result.message.message_id > last);

    channel.stop().await.unwrap();
}
