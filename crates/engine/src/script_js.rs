// SPDX-FileCopyrightText: © 2025 Medbridge Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Embedded QuickJS script executor.
//!
//! Implements [`ScriptExecutor`] for operator-authored filter/transformer
//! code. Each execution gets a fresh runtime with a memory limit and an
//! interrupt-based deadline, so a runaway script cannot wedge a pipeline
//! worker. Binding conventions are documented on `medbridge_core::script`:
//! the script sees `msg`, the four maps, and (for source scripts)
//! `destinationSet`; its completion value decides filters.

use async_trait::async_trait;
use medbridge_core::{
    ConnectorMap, ScriptBindings, ScriptError, ScriptExecutor, ScriptMaps, ScriptOutcome,
};
use rquickjs::IntoJs;
use serde_json::Value as JsonValue;
use std::time::{Duration, Instant};

/// QuickJS-backed executor shared by every channel in the process.
#[derive(Debug, Clone)]
pub struct JsScriptExecutor {
    timeout: Duration,
    memory_limit_bytes: usize,
}

impl Default for JsScriptExecutor {
    fn default() -> Self {
        Self::new(medbridge_core::script::DEFAULT_SCRIPT_TIMEOUT_MS, 64)
    }
}

/// Plain-data result assembled inside the JS context so nothing with a JS
/// lifetime escapes `with`.
struct RawOutcome {
    value: JsonValue,
    message: String,
    channel_map: ConnectorMap,
    connector_map: ConnectorMap,
    response_map: ConnectorMap,
    destination_set: Option<Vec<u32>>,
}

impl JsScriptExecutor {
    #[must_use]
    pub fn new(timeout_ms: u64, memory_limit_mb: usize) -> Self {
        Self {
            timeout: Duration::from_millis(timeout_ms),
            memory_limit_bytes: memory_limit_mb * 1024 * 1024,
        }
    }

    fn json_to_js<'js>(
        ctx: &rquickjs::Ctx<'js>,
        value: &JsonValue,
    ) -> Result<rquickjs::Value<'js>, rquickjs::Error> {
        match value {
            JsonValue::Null => Ok(rquickjs::Value::new_null(ctx.clone())),
            JsonValue::Bool(b) => b.into_js(ctx),
            JsonValue::Number(n) => n.as_f64().unwrap_or(0.0).into_js(ctx),
            JsonValue::String(s) => s.as_str().into_js(ctx),
            JsonValue::Array(items) => {
                let array = rquickjs::Array::new(ctx.clone())?;
                for (i, item) in items.iter().enumerate() {
                    array.set(i, Self::json_to_js(ctx, item)?)?;
                }
                Ok(array.into_value())
            }
            JsonValue::Object(fields) => {
                let object = rquickjs::Object::new(ctx.clone())?;
                for (key, item) in fields {
                    object.set(key.as_str(), Self::json_to_js(ctx, item)?)?;
                }
                Ok(object.into_value())
            }
        }
    }

    fn js_to_json(value: &rquickjs::Value<'_>) -> JsonValue {
        if value.is_null() || value.is_undefined() {
            return JsonValue::Null;
        }
        if let Some(b) = value.as_bool() {
            return JsonValue::Bool(b);
        }
        if let Some(i) = value.as_int() {
            return JsonValue::from(i);
        }
        if let Some(f) = value.as_float() {
            return serde_json::Number::from_f64(f).map_or(JsonValue::Null, JsonValue::Number);
        }
        if let Some(s) = value.as_string() {
            return s.to_string().map_or(JsonValue::Null, JsonValue::String);
        }
        if let Some(array) = value.as_array() {
            let items = array
                .iter::<rquickjs::Value>()
                .filter_map(std::result::Result::ok)
                .map(|item| Self::js_to_json(&item))
                .collect();
            return JsonValue::Array(items);
        }
        if let Some(object) = value.as_object() {
            let mut fields = serde_json::Map::new();
            for prop in object.props::<String, rquickjs::Value>() {
                if let Ok((key, item)) = prop {
                    fields.insert(key, Self::js_to_json(&item));
                }
            }
            return JsonValue::Object(fields);
        }
        JsonValue::Null
    }

    fn map_to_js<'js>(
        ctx: &rquickjs::Ctx<'js>,
        map: &ConnectorMap,
    ) -> Result<rquickjs::Object<'js>, rquickjs::Error> {
        let object = rquickjs::Object::new(ctx.clone())?;
        for (key, value) in map {
            object.set(key.as_str(), Self::json_to_js(ctx, value)?)?;
        }
        Ok(object)
    }

    fn js_to_map(object: &rquickjs::Object<'_>) -> ConnectorMap {
        let mut map = ConnectorMap::new();
        for prop in object.props::<String, rquickjs::Value>() {
            if let Ok((key, value)) = prop {
                map.insert(key, Self::js_to_json(&value));
            }
        }
        map
    }

    /// Prefers the thrown exception's message over the generic error text.
    fn error_text(ctx: &rquickjs::Ctx<'_>, error: &rquickjs::Error) -> String {
        if error.is_exception() {
            let caught = ctx.catch();
            if let Some(exception) = caught.as_exception() {
                if let Some(message) = exception.message() {
                    return message;
                }
            }
            let rendered = Self::js_to_json(&caught);
            if !rendered.is_null() {
                return rendered.to_string();
            }
        }
        error.to_string()
    }

    fn classify(text: String) -> ScriptError {
        if text.contains("SyntaxError") {
            ScriptError::Syntax(text)
        } else {
            ScriptError::Execution(text)
        }
    }
}

#[async_trait]
impl ScriptExecutor for JsScriptExecutor {
    async fn execute(
        &self,
        script: &str,
        bindings: ScriptBindings,
    ) -> Result<ScriptOutcome, ScriptError> {
        let runtime = rquickjs::AsyncRuntime::new()
            .map_err(|e| ScriptError::Execution(format!("failed to create JS runtime: {e}")))?;
        runtime.set_memory_limit(self.memory_limit_bytes).await;

        // Interrupt long-running scripts at the deadline; the outer timeout
        // is a second line of defense.
        let deadline = Instant::now() + self.timeout;
        runtime.set_interrupt_handler(Some(Box::new(move || Instant::now() > deadline))).await;

        let context = rquickjs::AsyncContext::full(&runtime)
            .await
            .map_err(|e| ScriptError::Execution(format!("failed to create JS context: {e}")))?;

        let script = script.to_string();
        let source_map = bindings.maps.source_map.clone();
        let seeded_destination_set = bindings.destination_set.is_some();

        let with_future = context
            .with(move |ctx| -> Result<RawOutcome, String> {
                let globals = ctx.globals();
                let seed = || -> Result<(), rquickjs::Error> {
                    globals.set("messageId", bindings.message_id)?;
                    globals.set("metaDataId", bindings.metadata_id)?;
                    globals.set("channelId", bindings.channel_id.as_str())?;
                    globals.set("channelName", bindings.channel_name.as_str())?;
                    globals.set("connectorName", bindings.connector_name.as_str())?;
                    globals.set("msg", bindings.message.as_str())?;
                    globals.set("sourceMap", Self::map_to_js(&ctx, &bindings.maps.source_map)?)?;
                    globals
                        .set("channelMap", Self::map_to_js(&ctx, &bindings.maps.channel_map)?)?;
                    globals.set(
                        "connectorMap",
                        Self::map_to_js(&ctx, &bindings.maps.connector_map)?,
                    )?;
                    globals
                        .set("responseMap", Self::map_to_js(&ctx, &bindings.maps.response_map)?)?;
                    if let Some(set) = &bindings.destination_set {
                        let array = rquickjs::Array::new(ctx.clone())?;
                        for (i, id) in set.iter().enumerate() {
                            array.set(i, *id)?;
                        }
                        globals.set("destinationSet", array)?;
                    }
                    Ok(())
                };
                seed().map_err(|e| Self::error_text(&ctx, &e))?;

                let value: rquickjs::Value = ctx
                    .eval(script.as_str())
                    .map_err(|e| Self::error_text(&ctx, &e))?;
                // Async scripts resolve through the job queue.
                let value = match value.as_promise() {
                    Some(promise) => promise
                        .finish::<rquickjs::Value>()
                        .map_err(|e| Self::error_text(&ctx, &e))?,
                    None => value,
                };

                let read_back = || -> Result<RawOutcome, rquickjs::Error> {
                    let message: String = globals.get("msg")?;
                    let channel_map: rquickjs::Object = globals.get("channelMap")?;
                    let connector_map: rquickjs::Object = globals.get("connectorMap")?;
                    let response_map: rquickjs::Object = globals.get("responseMap")?;
                    let destination_set = if seeded_destination_set {
                        let array: rquickjs::Value = globals.get("destinationSet")?;
                        array.as_array().map(|array| {
                            array
                                .iter::<rquickjs::Value>()
                                .filter_map(std::result::Result::ok)
                                .filter_map(|v| {
                                    v.as_int().and_then(|id| u32::try_from(id).ok()).or_else(
                                        || {
                                            v.as_float()
                                                .map(|f| f as i64)
                                                .and_then(|id| u32::try_from(id).ok())
                                        },
                                    )
                                })
                                .collect::<Vec<u32>>()
                        })
                    } else {
                        None
                    };
                    Ok(RawOutcome {
                        value: Self::js_to_json(&value),
                        message,
                        channel_map: Self::js_to_map(&channel_map),
                        connector_map: Self::js_to_map(&connector_map),
                        response_map: Self::js_to_map(&response_map),
                        destination_set,
                    })
                };
                read_back().map_err(|e| Self::error_text(&ctx, &e))
            });

        // All JS work happens inside `with`; the interrupt handler breaks
        // busy loops so this timeout can actually fire.
        let raw = match tokio::time::timeout(self.timeout, with_future).await {
            Ok(evaluated) => evaluated.map_err(Self::classify)?,
            Err(_) => {
                return Err(ScriptError::Timeout(
                    u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                ))
            }
        };

        Ok(ScriptOutcome {
            value: raw.value,
            message: raw.message,
            maps: ScriptMaps {
                source_map,
                channel_map: raw.channel_map,
                connector_map: raw.connector_map,
                response_map: raw.response_map,
            },
            destination_set: raw.destination_set,
        })
    }
}
