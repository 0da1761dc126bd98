// SPDX-FileCopyrightText: © 2025 Medbridge Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Crash-recovery tests: PENDING replay and queue rehydration.

use super::support::{
    pass, wait_until, ScriptedDestination, SendBehavior, StubExecutor, StubSource,
};
use crate::channel::Channel;
use crate::destination::Destination;
use crate::store::MessageStore;
use medbridge_core::{
    ChannelSettings, ConnectorMessage, ContentType, Message, MessageContent, QueueSettings,
    Status,
};
use std::sync::Arc;
use std::time::SystemTime;

/// Writes a crashed message directly into the store: source processed up to
/// TRANSFORMED, destination in the given status with the given content.
async fn seed_crashed_message(
    store: &MessageStore,
    channel_id: &str,
    destination_status: Status,
    destination_content: Vec<MessageContent>,
) {
    let local_id = store.register_channel(channel_id).await.unwrap();

    let mut message = Message::new(1, channel_id.to_string(), "server-1".to_string());
    let mut source = ConnectorMessage::new(
        1,
        0,
        channel_id.to_string(),
        "Recovery".to_string(),
        "Test Source".to_string(),
        "server-1".to_string(),
        SystemTime::now(),
    );
    source.status = Status::Transformed;
    message.insert_connector_message(source);

    let mut destination = ConnectorMessage::new(
        1,
        1,
        channel_id.to_string(),
        "Recovery".to_string(),
        "Dst1".to_string(),
        "server-1".to_string(),
        SystemTime::now(),
    );
    destination.status = destination_status;
    for content in destination_content {
        destination.set_content(content);
    }
    message.insert_connector_message(destination);

    let mut tx = store.begin().await.unwrap();
    store.insert_message(&mut tx, local_id, &message).await.unwrap();
    for cm in message.connector_messages.values() {
        store.insert_connector_message(&mut tx, local_id, cm).await.unwrap();
        for content in cm.contents() {
            store
                .insert_content(&mut tx, local_id, cm.message_id, cm.metadata_id, content)
                .await
                .unwrap();
        }
    }
    tx.commit().await.unwrap();
}

#[tokio::test]
async fn test_pending_destination_replays_response_transformer() {
    // S4: the process died after the RESPONSE was stored and PENDING was
    // checkpointed but before the response transformer finished. On start,
    // the transformer replays from the stored RESPONSE and the destination
    // finalizes SENT. The send itself is never replayed.
    let store = MessageStore::in_memory().await.unwrap();
    seed_crashed_message(
        &store,
        "ch-s4",
        Status::Pending,
        vec![MessageContent::new(
            ContentType::Response,
            "MSA|AA|42".to_string(),
            None,
        )],
    )
    .await;

    let executor = Arc::new(StubExecutor::new(Box::new(|_script, bindings| Ok(pass(bindings)))));
    let connector = Arc::new(ScriptedDestination::always_ok("Dst1"));

    let channel = Channel::builder(
        ChannelSettings::new("ch-s4", "Recovery"),
        Arc::new(StubSource),
        store.clone(),
    )
    .script_executor(executor.clone())
    .destination(Destination::new(1, connector.clone()).with_response_transformer("resp-xfm"))
    .build();
    channel.start().await.unwrap();

    // The transformer ran against the stored response.
    let calls = executor.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0], ("resp-xfm".to_string(), "MSA|AA|42".to_string()));

    // No network send happened during recovery.
    assert_eq!(connector.sent_count(), 0);

    // The message closed: nothing left for the next recovery pass.
    let local_id = store.local_channel_id("ch-s4").await.unwrap().unwrap();
    let unprocessed = store.unprocessed_messages(local_id, "ch-s4", "Recovery").await.unwrap();
    assert!(unprocessed.is_empty());

    channel.stop().await.unwrap();
}

#[tokio::test]
async fn test_queued_rows_rehydrate_and_send() {
    let store = MessageStore::in_memory().await.unwrap();
    seed_crashed_message(
        &store,
        "ch-rehydrate",
        Status::Queued,
        vec![MessageContent::new(ContentType::Encoded, "MSH|payload".to_string(), None)],
    )
    .await;

    let connector = Arc::new(ScriptedDestination::new(
        "Dst1",
        vec![SendBehavior::Succeed("MSA|AA|1".to_string())],
    ));
    let channel = Channel::builder(
        ChannelSettings::new("ch-rehydrate", "Recovery"),
        Arc::new(StubSource),
        store.clone(),
    )
    .destination(Destination::new(1, connector.clone()).with_queue(QueueSettings {
        enabled: true,
        retry_count: 3,
        retry_interval_ms: 10,
        validate_response: false,
    }))
    .build();
    channel.start().await.unwrap();

    let connector_probe = Arc::clone(&connector);
    assert!(
        wait_until(move || connector_probe.sent_count() == 1).await,
        "rehydrated entry should be resent"
    );
    assert_eq!(connector.sent.lock().unwrap().as_slice(), ["MSH|payload".to_string()]);

    channel.stop().await.unwrap();
}

#[tokio::test]
async fn test_pre_send_unfinished_destination_is_requeued() {
    // Crashed between the destination row insert and the send: the row is
    // still RECEIVED. Recovery marks it QUEUED so the worker resends it.
    let store = MessageStore::in_memory().await.unwrap();
    seed_crashed_message(
        &store,
        "ch-presend",
        Status::Received,
        vec![MessageContent::new(ContentType::Encoded, "MSH|payload".to_string(), None)],
    )
    .await;

    let connector = Arc::new(ScriptedDestination::always_ok("Dst1"));
    let channel = Channel::builder(
        ChannelSettings::new("ch-presend", "Recovery"),
        Arc::new(StubSource),
        store.clone(),
    )
    .destination(Destination::new(1, connector.clone()).with_queue(QueueSettings {
        enabled: true,
        retry_count: 0,
        retry_interval_ms: 10,
        validate_response: false,
    }))
    .build();
    channel.start().await.unwrap();

    let connector_probe = Arc::clone(&connector);
    assert!(
        wait_until(move || connector_probe.sent_count() == 1).await,
        "requeued entry should be resent"
    );

    channel.stop().await.unwrap();
}

#[tokio::test]
async fn test_error_source_is_left_alone() {
    let store = MessageStore::in_memory().await.unwrap();
    let local_id = store.register_channel("ch-error-src").await.unwrap();

    let mut message = Message::new(1, "ch-error-src".to_string(), "server-1".to_string());
    let mut source = ConnectorMessage::new(
        1,
        0,
        "ch-error-src".to_string(),
        "Recovery".to_string(),
        "Test Source".to_string(),
        "server-1".to_string(),
        SystemTime::now(),
    );
    source.status = Status::Error;
    message.insert_connector_message(source);

    let mut tx = store.begin().await.unwrap();
    store.insert_message(&mut tx, local_id, &message).await.unwrap();
    store
        .insert_connector_message(&mut tx, local_id, message.source().unwrap())
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let channel = Channel::builder(
        ChannelSettings::new("ch-error-src", "Recovery"),
        Arc::new(StubSource),
        store.clone(),
    )
    .build();
    channel.start().await.unwrap();

    // Recovery closed the message (no destinations outstanding) without
    // retrying the errored source.
    let loaded = store.unprocessed_messages(local_id, "ch-error-src", "Recovery").await.unwrap();
    assert!(loaded.is_empty());

    channel.stop().await.unwrap();
}
