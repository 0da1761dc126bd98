// SPDX-FileCopyrightText: © 2025 Medbridge Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! TCP/MLLP destination connector.
//!
//! `send` resolves `${var}` tokens against the connector message, takes a
//! pooled socket (or opens one), writes the framed payload, and reads one
//! framed response within the response timeout. With `keep_connection_open`
//! the socket returns to a per-(host, port, local) pool; a reaper timer
//! closes sockets idle longer than `send_timeout_ms`.

use crate::framing::TransmissionMode;
use crate::hl7;
use crate::settings::TcpDispatcherSettings;
use crate::tcp::BoxedStream;
use crate::template;
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use medbridge_core::{
    ConnectionStatus, ConnectorMessage, DataType, DestinationConnector, DestinationContext,
    EngineError, Response, Result,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    host: String,
    port: u16,
    local: Option<(String, u16)>,
}

struct PooledConnection {
    stream: BoxedStream,
    last_used: Instant,
}

#[derive(Clone)]
struct DispatcherRuntime {
    ctx: DestinationContext,
    mode: TransmissionMode,
    tls: Option<TlsConnector>,
}

/// TCP destination connector (MLLP/FRAME/RAW, plain or TLS).
pub struct TcpDispatcher {
    name: String,
    settings: TcpDispatcherSettings,
    pool: Arc<Mutex<HashMap<PoolKey, PooledConnection>>>,
    runtime: StdMutex<Option<DispatcherRuntime>>,
    reaper: StdMutex<Option<JoinHandle<()>>>,
}

impl TcpDispatcher {
    #[must_use]
    pub fn new(name: impl Into<String>, settings: TcpDispatcherSettings) -> Self {
        Self {
            name: name.into(),
            settings,
            pool: Arc::new(Mutex::new(HashMap::new())),
            runtime: StdMutex::new(None),
            reaper: StdMutex::new(None),
        }
    }

    fn runtime(&self) -> Result<DispatcherRuntime> {
        self.runtime
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
            .ok_or_else(|| EngineError::Runtime(format!("connector '{}' is not started", self.name)))
    }

    /// Resolves remote endpoint and payload from the message. The original
    /// settings are never mutated.
    fn resolve_properties(&self, message: &ConnectorMessage) -> (String, u16, String) {
        let host = template::resolve(&self.settings.host, message);
        let payload = template::resolve(&self.settings.template, message);
        (host, self.settings.port, payload)
    }

    async fn open_stream(
        &self,
        runtime: &DispatcherRuntime,
        host: &str,
        port: u16,
    ) -> Result<BoxedStream> {
        let connect_timeout = Duration::from_millis(self.settings.socket_timeout_ms);

        let mut addrs = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| EngineError::Network(format!("cannot resolve '{host}': {e}")))?;
        let remote = addrs
            .next()
            .ok_or_else(|| EngineError::Network(format!("cannot resolve '{host}'")))?;

        let connect = async {
            match (&self.settings.local_address, self.settings.local_port) {
                (Some(local_address), local_port) => {
                    let socket = if remote.is_ipv4() {
                        TcpSocket::new_v4()
                    } else {
                        TcpSocket::new_v6()
                    }
                    .map_err(EngineError::Io)?;
                    let local: SocketAddr =
                        format!("{}:{}", local_address, local_port.unwrap_or(0))
                            .parse()
                            .map_err(|e| {
                                EngineError::Configuration(format!(
                                    "invalid local address '{local_address}': {e}"
                                ))
                            })?;
                    socket.bind(local).map_err(EngineError::Io)?;
                    socket.connect(remote).await.map_err(|e| {
                        EngineError::Network(format!("connect to {remote} failed: {e}"))
                    })
                }
                (None, _) => TcpStream::connect(remote).await.map_err(|e| {
                    EngineError::Network(format!("connect to {remote} failed: {e}"))
                }),
            }
        };

        let tcp = tokio::time::timeout(connect_timeout, connect)
            .await
            .map_err(|_| EngineError::Network(format!("connect to {host}:{port} timed out")))??;

        match (&runtime.tls, &self.settings.tls) {
            (Some(connector), Some(tls)) => {
                let server_name = tls.server_name(host)?;
                let stream = connector
                    .connect(server_name, tcp)
                    .await
                    .map_err(|e| EngineError::Network(format!("TLS handshake failed: {e}")))?;
                Ok(Box::new(stream))
            }
            _ => Ok(Box::new(tcp)),
        }
    }

    /// Reads one complete framed response, or times out.
    async fn read_response(
        &self,
        runtime: &DispatcherRuntime,
        stream: &mut BoxedStream,
    ) -> Result<Option<String>> {
        let deadline = Duration::from_millis(self.settings.response_timeout_ms);
        let mode = runtime.mode.clone();
        let charset = self.settings.charset_encoding;
        let buffer_size = self.settings.buffer_size;

        let read = async move {
            let mut buf = BytesMut::with_capacity(buffer_size);
            loop {
                if let Some(frame) = mode.scan(&buf) {
                    let payload = charset.decode(&buf[frame.payload.clone()]);
                    buf.advance(frame.consumed);
                    return Ok(payload);
                }
                let n = stream
                    .read_buf(&mut buf)
                    .await
                    .map_err(|e| EngineError::Network(format!("response read failed: {e}")))?;
                if n == 0 {
                    return Err(EngineError::Network(
                        "connection closed before response".to_string(),
                    ));
                }
            }
        };

        match tokio::time::timeout(deadline, read).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    async fn destroy_stream(&self, runtime: &DispatcherRuntime, mut stream: BoxedStream) {
        let _ = stream.shutdown().await;
        runtime.ctx.events.emit_connector_count(
            &runtime.ctx.channel_id,
            runtime.ctx.metadata_id,
            false,
        );
        runtime.ctx.events.emit_connection_status(
            &runtime.ctx.channel_id,
            runtime.ctx.metadata_id,
            &self.name,
            ConnectionStatus::Disconnected,
            None,
        );
    }

    async fn reaper_loop(
        pool: Arc<Mutex<HashMap<PoolKey, PooledConnection>>>,
        ctx: DestinationContext,
        name: String,
        idle_after: Duration,
    ) {
        loop {
            tokio::select! {
                () = ctx.cancellation.cancelled() => break,
                () = tokio::time::sleep(idle_after) => {}
            }
            let mut pool = pool.lock().await;
            let before = pool.len();
            let mut expired = Vec::new();
            pool.retain(|key, conn| {
                if conn.last_used.elapsed() >= idle_after {
                    expired.push(key.clone());
                    false
                } else {
                    true
                }
            });
            drop(pool);
            if before > 0 && !expired.is_empty() {
                tracing::debug!(connector = %name, count = expired.len(), "closed idle sockets");
                for _ in expired {
                    ctx.events.emit_connector_count(&ctx.channel_id, ctx.metadata_id, false);
                    ctx.events.emit_connection_status(
                        &ctx.channel_id,
                        ctx.metadata_id,
                        &name,
                        ConnectionStatus::Disconnected,
                        Some("idle timeout".to_string()),
                    );
                }
            }
        }
    }

    /// Maps a read response onto a `Response`, applying HL7 acknowledgment
    /// validation for HL7 payloads.
    fn response_from_payload(&self, payload: String) -> Response {
        if self.settings.data_type == DataType::Hl7v2 && !hl7::response_accepted(&payload) {
            let code = hl7::ack_code_of_response(&payload).unwrap_or("??").to_string();
            return Response {
                status: medbridge_core::Status::Error,
                message: payload,
                status_message: None,
                error: Some(format!("message rejected by remote system (MSA {code})")),
            };
        }
        Response::sent(payload)
    }
}

#[async_trait]
impl DestinationConnector for TcpDispatcher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self, ctx: DestinationContext) -> Result<()> {
        let mode = self.settings.resolved_transmission_mode()?;
        let tls = match &self.settings.tls {
            Some(tls) => Some(TlsConnector::from(tls.client_config()?)),
            None => None,
        };

        if self.settings.keep_connection_open {
            let reaper = tokio::spawn(Self::reaper_loop(
                Arc::clone(&self.pool),
                ctx.clone(),
                self.name.clone(),
                Duration::from_millis(self.settings.send_timeout_ms),
            ));
            *self.reaper.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(reaper);
        }

        let mut runtime = self.runtime.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *runtime = Some(DispatcherRuntime { ctx, mode, tls });
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let runtime = {
            let mut guard =
                self.runtime.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            guard.take()
        };
        let reaper = {
            let mut guard = self.reaper.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            guard.take()
        };
        if let Some(reaper) = reaper {
            reaper.abort();
        }
        if let Some(runtime) = runtime {
            let mut pool = self.pool.lock().await;
            let drained: Vec<PooledConnection> = pool.drain().map(|(_, conn)| conn).collect();
            drop(pool);
            for conn in drained {
                self.destroy_stream(&runtime, conn.stream).await;
            }
        }
        Ok(())
    }

    async fn send(&self, message: &ConnectorMessage) -> Result<Response> {
        let runtime = self.runtime()?;
        let events = &runtime.ctx.events;
        let channel_id = &runtime.ctx.channel_id;
        let metadata_id = runtime.ctx.metadata_id;

        let (host, port, payload) = self.resolve_properties(message);
        if self.settings.check_remote_host {
            tokio::net::lookup_host((host.as_str(), port))
                .await
                .map_err(|e| EngineError::Network(format!("remote host check failed: {e}")))?;
        }

        let key = PoolKey {
            host: host.clone(),
            port,
            local: self
                .settings
                .local_address
                .clone()
                .map(|addr| (addr, self.settings.local_port.unwrap_or(0))),
        };

        // Take a pooled socket or open a fresh one.
        let pooled = if self.settings.keep_connection_open {
            self.pool.lock().await.remove(&key).map(|conn| conn.stream)
        } else {
            None
        };
        let mut stream = match pooled {
            Some(stream) => stream,
            None => {
                events.emit_connection_status(
                    channel_id,
                    metadata_id,
                    &self.name,
                    ConnectionStatus::Connecting,
                    Some(format!("{host}:{port}")),
                );
                match self.open_stream(&runtime, &host, port).await {
                    Ok(stream) => {
                        events.emit_connector_count(channel_id, metadata_id, true);
                        events.emit_connection_status(
                            channel_id,
                            metadata_id,
                            &self.name,
                            ConnectionStatus::Connected,
                            None,
                        );
                        stream
                    }
                    Err(e) => {
                        events.emit_connection_status(
                            channel_id,
                            metadata_id,
                            &self.name,
                            ConnectionStatus::Failure,
                            Some(e.to_string()),
                        );
                        return Err(e);
                    }
                }
            }
        };

        // Write the framed payload.
        events.emit_connection_status(
            channel_id,
            metadata_id,
            &self.name,
            ConnectionStatus::Sending,
            None,
        );
        let framed = runtime.mode.frame(&self.settings.charset_encoding.encode(&payload));
        if let Err(e) = stream.write_all(&framed).await {
            events.emit_connection_status(
                channel_id,
                metadata_id,
                &self.name,
                ConnectionStatus::Failure,
                Some(e.to_string()),
            );
            self.destroy_stream(&runtime, stream).await;
            return Err(EngineError::Network(format!("send failed: {e}")));
        }
        let _ = stream.flush().await;

        if self.settings.ignore_response {
            if self.settings.keep_connection_open {
                self.pool
                    .lock()
                    .await
                    .insert(key, PooledConnection { stream, last_used: Instant::now() });
            } else {
                self.destroy_stream(&runtime, stream).await;
            }
            events.emit_connection_status(
                channel_id,
                metadata_id,
                &self.name,
                ConnectionStatus::Idle,
                None,
            );
            return Ok(Response::sent(String::new()));
        }

        // Read one framed response.
        events.emit_connection_status(
            channel_id,
            metadata_id,
            &self.name,
            ConnectionStatus::WaitingForResponse,
            None,
        );
        let response = match self.read_response(&runtime, &mut stream).await {
            Ok(Some(payload)) => {
                if self.settings.keep_connection_open {
                    self.pool
                        .lock()
                        .await
                        .insert(key, PooledConnection { stream, last_used: Instant::now() });
                } else {
                    self.destroy_stream(&runtime, stream).await;
                }
                self.response_from_payload(payload)
            }
            Ok(None) => {
                // Read timeout: the socket is in an unknown state, destroy it.
                self.destroy_stream(&runtime, stream).await;
                let error = "Timeout waiting for response".to_string();
                if self.settings.queue_on_response_timeout {
                    Response::queued(String::new(), error)
                } else {
                    Response::error(String::new(), error)
                }
            }
            Err(e) => {
                events.emit_connection_status(
                    channel_id,
                    metadata_id,
                    &self.name,
                    ConnectionStatus::Failure,
                    Some(e.to_string()),
                );
                self.destroy_stream(&runtime, stream).await;
                return Err(e);
            }
        };

        events.emit_connection_status(
            channel_id,
            metadata_id,
            &self.name,
            ConnectionStatus::Idle,
            None,
        );
        Ok(response)
    }
}
