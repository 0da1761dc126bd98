// SPDX-FileCopyrightText: © 2025 Medbridge Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Medbridge server: process lifecycle around the channel runtime.
//!
//! Wires the shared singletons (store, statistics, event bus, script
//! executor, session store), loads channel definitions, and runs deployed
//! channels until shutdown. The dashboard aggregator consumes runtime
//! events; the promotion module plans cross-environment channel moves.

pub mod auth;
pub mod channels;
pub mod cli;
pub mod config;
pub mod dashboard;
pub mod logging;
pub mod promotion;
pub mod session;

use crate::channels::ChannelRuntimeDeps;
use crate::config::Config;
use crate::dashboard::DashboardAggregator;
use crate::session::build_session_store;
use medbridge_core::{EventBus, InitialState, ScriptExecutor, Statistics};
use medbridge_engine::{Channel, JsScriptExecutor, MessageStore};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Runs the engine until SIGINT.
pub async fn run(config: Config) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.server.data_dir)?;

    let store = MessageStore::connect(&config.server.resolved_database_url()).await?;
    let stats = Arc::new(Statistics::new(config.server.allow_negative_statistics));
    let events = EventBus::default();
    let script_executor: Arc<dyn ScriptExecutor> = Arc::new(JsScriptExecutor::new(
        config.script.timeout_ms,
        config.script.memory_limit_mb,
    ));

    let shutdown = CancellationToken::new();

    let session_store = build_session_store(&config.cluster, &config.session);
    let session_cleaner = session_store.spawn_cleaner(
        Duration::from_secs(config.session.cleanup_interval_mins * 60),
        shutdown.clone(),
    );
    let (dashboard, dashboard_task) = DashboardAggregator::spawn(&events, shutdown.clone());

    let deps = ChannelRuntimeDeps {
        server_id: config.server.server_id.clone(),
        store,
        stats,
        events,
        script_executor,
        cluster_mode: config.cluster.enabled,
    };

    let definitions = channels::load_definitions(Path::new(&config.server.channels_dir))?;
    let mut running: Vec<Arc<Channel>> = Vec::new();
    for definition in &definitions {
        if !definition.channel.enabled {
            tracing::info!(channel = %definition.channel.name, "channel disabled, skipping");
            continue;
        }
        let channel = match channels::build_channel(definition, &deps) {
            Ok(channel) => channel,
            Err(e) => {
                tracing::error!(channel = %definition.channel.name, error = %e, "cannot build channel");
                continue;
            }
        };
        if let Err(e) = channel.deploy().await {
            tracing::error!(channel = %channel.name(), error = %e, "deploy failed");
            continue;
        }
        match definition.channel.initial_state {
            InitialState::Started => {
                if let Err(e) = channel.start().await {
                    tracing::error!(channel = %channel.name(), error = %e, "start failed");
                }
            }
            InitialState::Paused => {
                if let Err(e) = channel.start().await {
                    tracing::error!(channel = %channel.name(), error = %e, "start failed");
                } else if let Err(e) = channel.pause().await {
                    tracing::error!(channel = %channel.name(), error = %e, "pause failed");
                }
            }
            InitialState::Stopped => {}
        }
        running.push(channel);
    }
    tracing::info!(count = running.len(), "channels deployed");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");

    for channel in &running {
        if let Err(e) = channel.stop().await {
            tracing::error!(channel = %channel.name(), error = %e, "stop failed");
        }
    }

    shutdown.cancel();
    let _ = dashboard_task.await;
    let _ = session_cleaner.await;

    for (channel_id, status) in dashboard.snapshot() {
        tracing::info!(
            channel_id,
            channel = %status.channel_name,
            messages_completed = status.messages_completed,
            "final channel status"
        );
    }
    Ok(())
}
