// SPDX-FileCopyrightText: © 2025 Medbridge Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Shared stubs for engine tests: an inert source, a scriptable
//! destination connector, and a closure-backed script executor.

use async_trait::async_trait;
use medbridge_core::{
    ConnectorMessage, ContentType, DataType, DestinationConnector, DestinationContext,
    EngineError, Response, Result, ScriptBindings, ScriptError, ScriptExecutor, ScriptOutcome,
    SourceConnector, SourceContext,
};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// Source connector that never produces anything; tests dispatch directly.
pub struct StubSource;

#[async_trait]
impl SourceConnector for StubSource {
    fn name(&self) -> &str {
        "Test Source"
    }

    fn inbound_data_type(&self) -> DataType {
        DataType::Hl7v2
    }

    async fn start(&self, _ctx: SourceContext) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

/// What one `send` call should do.
#[derive(Debug, Clone)]
pub enum SendBehavior {
    Succeed(String),
    Fail(String),
}

/// Destination connector whose send outcomes are scripted per call.
/// Records every payload it was asked to deliver.
pub struct ScriptedDestination {
    name: String,
    behaviors: Mutex<VecDeque<SendBehavior>>,
    pub sent: Mutex<Vec<String>>,
}

impl ScriptedDestination {
    pub fn new(name: &str, behaviors: Vec<SendBehavior>) -> Self {
        Self {
            name: name.to_string(),
            behaviors: Mutex::new(behaviors.into()),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Destination that acknowledges everything.
    pub fn always_ok(name: &str) -> Self {
        Self::new(name, Vec::new())
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl DestinationConnector for ScriptedDestination {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self, _ctx: DestinationContext) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn send(&self, message: &ConnectorMessage) -> Result<Response> {
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| SendBehavior::Succeed("MSA|AA|1".to_string()));
        match behavior {
            SendBehavior::Succeed(response) => {
                let payload =
                    message.content_str(ContentType::Encoded).unwrap_or_default().to_string();
                self.sent.lock().unwrap().push(payload);
                Ok(Response::sent(response))
            }
            SendBehavior::Fail(error) => Err(EngineError::Network(error)),
        }
    }
}

type Handler =
    Box<dyn Fn(&str, &ScriptBindings) -> std::result::Result<ScriptOutcome, ScriptError> + Send + Sync>;

/// Script executor backed by a closure; records `(script, msg)` per call.
pub struct StubExecutor {
    handler: Handler,
    pub calls: Mutex<Vec<(String, String)>>,
}

impl StubExecutor {
    pub fn new(handler: Handler) -> Self {
        Self { handler, calls: Mutex::new(Vec::new()) }
    }
}

#[async_trait]
impl ScriptExecutor for StubExecutor {
    async fn execute(
        &self,
        script: &str,
        bindings: ScriptBindings,
    ) -> std::result::Result<ScriptOutcome, ScriptError> {
        self.calls.lock().unwrap().push((script.to_string(), bindings.message.clone()));
        (self.handler)(script, &bindings)
    }
}

/// A pass-through outcome for a set of bindings.
pub fn pass(bindings: &ScriptBindings) -> ScriptOutcome {
    ScriptOutcome {
        value: serde_json::Value::Bool(true),
        message: bindings.message.clone(),
        maps: bindings.maps.clone(),
        destination_set: bindings.destination_set.clone(),
    }
}

/// Polls until `predicate` holds or two seconds elapse.
pub async fn wait_until(predicate: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    predicate()
}

pub const SAMPLE_HL7: &str = "MSH|^~\\&|A|B|C|D|20260101||ADT^A01|42|P|2.5";
