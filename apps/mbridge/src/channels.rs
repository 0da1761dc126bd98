// SPDX-FileCopyrightText: © 2025 Medbridge Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Channel definition loading.
//!
//! Operators describe channels as one YAML document per file in the
//! configured channels directory: the channel block (identity, scripts,
//! storage mode), one source connector, and any number of destinations in
//! declaration order. This module deserializes those documents and
//! assembles running [`Channel`] instances from them.

use medbridge_connectors::{TcpDispatcher, TcpDispatcherSettings, TcpReceiver, TcpReceiverSettings};
use medbridge_core::{
    ChannelSettings, EngineError, EventBus, QueueSettings, Result, ScriptExecutor,
    SourceQueueSettings, Statistics,
};
use medbridge_engine::{Channel, Destination, MessageStore};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;

/// Connector implementations selectable from a definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectorKind {
    Tcp,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceDefinition {
    #[serde(rename = "type")]
    pub kind: ConnectorKind,
    #[serde(default)]
    pub tcp: Option<TcpReceiverSettings>,
    #[serde(default)]
    pub filter_script: Option<String>,
    #[serde(default)]
    pub transformer_script: Option<String>,
    #[serde(default)]
    pub queue: SourceQueueSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DestinationDefinition {
    #[serde(rename = "type")]
    pub kind: ConnectorKind,
    pub name: String,
    #[serde(default)]
    pub tcp: Option<TcpDispatcherSettings>,
    #[serde(default)]
    pub filter_script: Option<String>,
    #[serde(default)]
    pub transformer_script: Option<String>,
    #[serde(default)]
    pub response_transformer_script: Option<String>,
    #[serde(default)]
    pub queue: QueueSettings,
}

/// One operator-authored channel document.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelDefinition {
    pub channel: ChannelSettings,
    pub source: SourceDefinition,
    #[serde(default)]
    pub destinations: Vec<DestinationDefinition>,
}

/// Shared singletons a channel is assembled against. Constructed once at
/// process start and passed explicitly.
#[derive(Clone)]
pub struct ChannelRuntimeDeps {
    pub server_id: String,
    pub store: MessageStore,
    pub stats: Arc<Statistics>,
    pub events: EventBus,
    pub script_executor: Arc<dyn ScriptExecutor>,
    pub cluster_mode: bool,
}

/// Parses one YAML channel document.
pub fn parse_definition(yaml: &str) -> Result<ChannelDefinition> {
    serde_saphyr::from_str(yaml)
        .map_err(|e| EngineError::Configuration(format!("invalid channel definition: {e}")))
}

/// Loads every `*.yml`/`*.yaml` under the channels directory, sorted by
/// file name. A missing directory is an empty deployment, not an error.
pub fn load_definitions(dir: &Path) -> Result<Vec<ChannelDefinition>> {
    if !dir.exists() {
        tracing::warn!(dir = %dir.display(), "channels directory does not exist");
        return Ok(Vec::new());
    }
    let mut paths: Vec<_> = std::fs::read_dir(dir)
        .map_err(EngineError::Io)?
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension().and_then(|ext| ext.to_str()).is_some_and(|ext| {
                ext.eq_ignore_ascii_case("yml") || ext.eq_ignore_ascii_case("yaml")
            })
        })
        .collect();
    paths.sort();

    let mut definitions = Vec::with_capacity(paths.len());
    for path in paths {
        let text = std::fs::read_to_string(&path).map_err(EngineError::Io)?;
        match parse_definition(&text) {
            Ok(definition) => {
                tracing::info!(
                    file = %path.display(),
                    channel_id = %definition.channel.id,
                    channel = %definition.channel.name,
                    "loaded channel definition"
                );
                definitions.push(definition);
            }
            Err(e) => {
                tracing::error!(file = %path.display(), error = %e, "skipping channel definition");
            }
        }
    }
    Ok(definitions)
}

/// Assembles a channel instance from its definition.
pub fn build_channel(
    definition: &ChannelDefinition,
    deps: &ChannelRuntimeDeps,
) -> Result<Arc<Channel>> {
    let source = match definition.source.kind {
        ConnectorKind::Tcp => {
            let settings = definition.source.tcp.clone().ok_or_else(|| {
                EngineError::Configuration(format!(
                    "channel '{}': TCP source requires a tcp block",
                    definition.channel.name
                ))
            })?;
            settings.validate()?;
            Arc::new(TcpReceiver::new("Source", settings))
        }
    };

    let mut builder =
        Channel::builder(definition.channel.clone(), source, deps.store.clone())
            .server_id(deps.server_id.clone())
            .stats(Arc::clone(&deps.stats))
            .events(deps.events.clone())
            .script_executor(Arc::clone(&deps.script_executor))
            .cluster_mode(deps.cluster_mode)
            .source_queue(definition.source.queue.clone());
    if let Some(script) = &definition.source.filter_script {
        builder = builder.source_filter(script.clone());
    }
    if let Some(script) = &definition.source.transformer_script {
        builder = builder.source_transformer(script.clone());
    }

    for (index, dest_def) in definition.destinations.iter().enumerate() {
        let metadata_id = u32::try_from(index).unwrap_or(u32::MAX - 1) + 1;
        let connector = match dest_def.kind {
            ConnectorKind::Tcp => {
                let settings = dest_def.tcp.clone().ok_or_else(|| {
                    EngineError::Configuration(format!(
                        "destination '{}': TCP destination requires a tcp block",
                        dest_def.name
                    ))
                })?;
                Arc::new(TcpDispatcher::new(dest_def.name.clone(), settings))
            }
        };
        let mut destination = Destination::new(metadata_id, connector);
        if let Some(script) = &dest_def.filter_script {
            destination = destination.with_filter(script.clone());
        }
        if let Some(script) = &dest_def.transformer_script {
            destination = destination.with_transformer(script.clone());
        }
        if let Some(script) = &dest_def.response_transformer_script {
            destination = destination.with_response_transformer(script.clone());
        }
        if dest_def.queue.enabled {
            destination = destination.with_queue(dest_def.queue.clone());
        }
        builder = builder.destination(destination);
    }

    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use medbridge_core::NoopScriptExecutor;

    const SAMPLE_DEFINITION: &str = r"
channel:
  id: adt-inbound
  name: ADT Inbound
  description: Inbound ADT feed from the lab
  message_storage_mode: PRODUCTION
source:
  type: TCP
  tcp:
    host: 127.0.0.1
    port: 6661
    response_mode: AUTO
destinations:
  - type: TCP
    name: Downstream EHR
    tcp:
      host: 10.0.0.5
      port: 6670
      keep_connection_open: true
    queue:
      enabled: true
      retry_count: 5
      retry_interval_ms: 5000
";

    async fn deps() -> ChannelRuntimeDeps {
        ChannelRuntimeDeps {
            server_id: "mbridge-1".to_string(),
            store: MessageStore::in_memory().await.expect("store"),
            stats: Arc::new(Statistics::default()),
            events: EventBus::default(),
            script_executor: Arc::new(NoopScriptExecutor),
            cluster_mode: false,
        }
    }

    #[tokio::test]
    async fn test_parse_and_build() {
        let definition = parse_definition(SAMPLE_DEFINITION).expect("parse");
        assert_eq!(definition.channel.id, "adt-inbound");
        assert_eq!(definition.destinations.len(), 1);
        assert!(definition.destinations[0].queue.enabled);

        let channel = build_channel(&definition, &deps().await).expect("build");
        assert_eq!(channel.id(), "adt-inbound");
        assert_eq!(channel.name(), "ADT Inbound");
    }

    #[tokio::test]
    async fn test_missing_tcp_block_is_a_configuration_error() {
        let yaml = r"
channel:
  id: broken
  name: Broken
source:
  type: TCP
";
        let definition = parse_definition(yaml).expect("parse");
        match build_channel(&definition, &deps().await) {
            Err(EngineError::Configuration(msg)) => assert!(msg.contains("tcp block")),
            other => panic!("expected configuration error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_load_definitions_from_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("10-adt.yml"), SAMPLE_DEFINITION).expect("write");
        std::fs::write(dir.path().join("ignore.txt"), "not yaml").expect("write");

        let definitions = load_definitions(dir.path()).expect("load");
        assert_eq!(definitions.len(), 1);
        assert_eq!(definitions[0].channel.id, "adt-inbound");
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let definitions =
            load_definitions(Path::new("/nonexistent/channels")).expect("missing dir ok");
        assert!(definitions.is_empty());
    }
}
