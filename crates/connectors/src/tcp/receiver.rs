// SPDX-FileCopyrightText: © 2025 Medbridge Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! TCP/MLLP source connector.
//!
//! Two modes: SERVER (bind-and-listen, with bind retries on an occupied
//! port) and CLIENT (connect-out with auto-reconnect). Each accepted socket
//! runs its own read task: bytes accumulate in a buffer, complete frames
//! are unframed and dispatched to the channel (optionally through the batch
//! adaptor), and a response is written back according to the configured
//! response mode.

use crate::framing::TransmissionMode;
use crate::hl7;
use crate::settings::{
    RespondOnNewConnection, ResponseMode, ServerMode, TcpReceiverSettings,
};
use crate::tcp::BoxedStream;
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use medbridge_core::{
    ConnectionStatus, DataType, DispatchResult, EngineError, RawMessage, Result, SourceConnector,
    SourceContext,
};
use serde_json::json;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;

/// TCP source connector (MLLP/FRAME/RAW, plain or TLS).
pub struct TcpReceiver {
    name: String,
    settings: TcpReceiverSettings,
    runtime: Mutex<Option<ReceiverRuntime>>,
}

struct ReceiverRuntime {
    cancellation: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// State shared by the accept loop and every socket task.
struct Shared {
    name: String,
    settings: TcpReceiverSettings,
    mode: TransmissionMode,
    ctx: SourceContext,
    active_connections: AtomicUsize,
    tls_acceptor: Option<TlsAcceptor>,
    tls_connector: Option<TlsConnector>,
}

impl TcpReceiver {
    #[must_use]
    pub fn new(name: impl Into<String>, settings: TcpReceiverSettings) -> Self {
        Self { name: name.into(), settings, runtime: Mutex::new(None) }
    }

    async fn bind_with_retries(shared: &Shared) -> Result<TcpListener> {
        let addr = format!("{}:{}", shared.settings.host, shared.settings.port);
        let mut attempt = 0;
        loop {
            match TcpListener::bind(&addr).await {
                Ok(listener) => {
                    tracing::info!(connector = %shared.name, %addr, "listening");
                    return Ok(listener);
                }
                Err(e)
                    if e.kind() == ErrorKind::AddrInUse
                        && attempt < shared.settings.bind_retry_attempts =>
                {
                    attempt += 1;
                    tracing::warn!(
                        connector = %shared.name,
                        %addr,
                        attempt,
                        max_attempts = shared.settings.bind_retry_attempts,
                        "address in use, retrying bind"
                    );
                    cancellable_sleep(
                        &shared.ctx.cancellation,
                        Duration::from_millis(shared.settings.bind_retry_interval_ms),
                    )
                    .await;
                    if shared.ctx.cancellation.is_cancelled() {
                        return Err(EngineError::Runtime("receiver start cancelled".to_string()));
                    }
                }
                Err(e) => return Err(EngineError::Io(e)),
            }
        }
    }

    async fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
        loop {
            tokio::select! {
                () = shared.ctx.cancellation.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        // maxConnections: excess inbound sockets are destroyed
                        // immediately.
                        if shared.active_connections.load(Ordering::SeqCst)
                            >= shared.settings.max_connections
                        {
                            tracing::warn!(
                                connector = %shared.name,
                                %peer,
                                max = shared.settings.max_connections,
                                "refusing connection over limit"
                            );
                            drop(socket);
                            continue;
                        }
                        let shared = Arc::clone(&shared);
                        tokio::spawn(async move {
                            Self::run_socket(shared, socket, peer).await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!(connector = %shared.name, error = %e, "accept failed");
                        cancellable_sleep(&shared.ctx.cancellation, Duration::from_millis(100))
                            .await;
                    }
                },
            }
        }
        tracing::debug!(connector = %shared.name, "accept loop exited");
    }

    async fn connect_loop(shared: Arc<Shared>) {
        let addr = format!("{}:{}", shared.settings.host, shared.settings.port);
        loop {
            if shared.ctx.cancellation.is_cancelled() {
                break;
            }
            shared.ctx.events.emit_connection_status(
                &shared.ctx.channel_id,
                0,
                &shared.name,
                ConnectionStatus::Connecting,
                Some(addr.clone()),
            );
            match TcpStream::connect(&addr).await {
                Ok(socket) => {
                    let peer = socket.peer_addr().unwrap_or_else(|_| {
                        SocketAddr::from(([0, 0, 0, 0], shared.settings.port))
                    });
                    let local = socket.local_addr().ok();
                    match Self::wrap_outbound(&shared, socket).await {
                        Ok(stream) => {
                            Self::run_stream(&shared, stream, peer, local).await;
                        }
                        Err(e) => {
                            tracing::warn!(connector = %shared.name, error = %e, "TLS handshake failed");
                        }
                    }
                }
                Err(e) => {
                    shared.ctx.events.emit_connection_status(
                        &shared.ctx.channel_id,
                        0,
                        &shared.name,
                        ConnectionStatus::Failure,
                        Some(e.to_string()),
                    );
                    tracing::warn!(connector = %shared.name, %addr, error = %e, "connect failed");
                }
            }
            cancellable_sleep(
                &shared.ctx.cancellation,
                Duration::from_millis(shared.settings.reconnect_interval_ms),
            )
            .await;
        }
    }

    /// Wraps an outbound (CLIENT mode) socket in TLS when configured.
    async fn wrap_outbound(shared: &Shared, socket: TcpStream) -> Result<BoxedStream> {
        match (&shared.tls_connector, &shared.settings.tls) {
            (Some(connector), Some(tls)) => {
                let server_name = tls.server_name(&shared.settings.host)?;
                let stream = connector
                    .connect(server_name, socket)
                    .await
                    .map_err(|e| EngineError::Network(format!("TLS handshake failed: {e}")))?;
                Ok(Box::new(stream))
            }
            _ => Ok(Box::new(socket)),
        }
    }

    /// Wraps an accepted (SERVER mode) socket, then runs it. One task per
    /// socket.
    async fn run_socket(shared: Arc<Shared>, socket: TcpStream, peer: SocketAddr) {
        let local = socket.local_addr().ok();
        let stream: BoxedStream = if let Some(acceptor) = shared.tls_acceptor.clone() {
            match acceptor.accept(socket).await {
                Ok(tls) => Box::new(tls),
                Err(e) => {
                    tracing::warn!(connector = %shared.name, %peer, error = %e, "TLS handshake failed");
                    shared.ctx.events.emit_connection_status(
                        &shared.ctx.channel_id,
                        0,
                        &shared.name,
                        ConnectionStatus::Failure,
                        Some(format!("TLS handshake failed: {e}")),
                    );
                    return;
                }
            }
        } else {
            Box::new(socket)
        };
        Self::run_stream(&shared, stream, peer, local).await;
    }

    async fn run_stream(
        shared: &Shared,
        mut stream: BoxedStream,
        peer: SocketAddr,
        local: Option<SocketAddr>,
    ) {
        shared.active_connections.fetch_add(1, Ordering::SeqCst);
        shared.ctx.events.emit_connector_count(&shared.ctx.channel_id, 0, true);
        shared.ctx.events.emit_connection_status(
            &shared.ctx.channel_id,
            0,
            &shared.name,
            ConnectionStatus::Connected,
            Some(peer.to_string()),
        );
        tracing::debug!(connector = %shared.name, %peer, "connection established");

        Self::read_loop(shared, &mut stream, peer, local).await;

        // A closed socket mid-frame discards its buffer; nothing else to do.
        shared.active_connections.fetch_sub(1, Ordering::SeqCst);
        shared.ctx.events.emit_connector_count(&shared.ctx.channel_id, 0, false);
        shared.ctx.events.emit_connection_status(
            &shared.ctx.channel_id,
            0,
            &shared.name,
            ConnectionStatus::Disconnected,
            Some(peer.to_string()),
        );
        tracing::debug!(connector = %shared.name, %peer, "connection closed");
    }

    async fn read_loop(
        shared: &Shared,
        stream: &mut BoxedStream,
        peer: SocketAddr,
        local: Option<SocketAddr>,
    ) {
        enum ReadEvent {
            Cancelled,
            TimedOut,
            Io(std::io::Result<usize>),
        }

        let receive_timeout = shared.settings.receive_timeout_ms;
        let mut buf = BytesMut::with_capacity(shared.settings.buffer_size);

        loop {
            let event = if receive_timeout > 0 {
                tokio::select! {
                    () = shared.ctx.cancellation.cancelled() => ReadEvent::Cancelled,
                    result = tokio::time::timeout(
                        Duration::from_millis(receive_timeout),
                        stream.read_buf(&mut buf),
                    ) => match result {
                        Ok(io) => ReadEvent::Io(io),
                        Err(_) => ReadEvent::TimedOut,
                    },
                }
            } else {
                tokio::select! {
                    () = shared.ctx.cancellation.cancelled() => ReadEvent::Cancelled,
                    io = stream.read_buf(&mut buf) => ReadEvent::Io(io),
                }
            };

            match event {
                ReadEvent::Cancelled => break,
                ReadEvent::TimedOut => {
                    if shared.settings.keep_connection_open {
                        shared.ctx.events.emit_connection_status(
                            &shared.ctx.channel_id,
                            0,
                            &shared.name,
                            ConnectionStatus::Info,
                            Some("receive timeout".to_string()),
                        );
                        continue;
                    }
                    tracing::debug!(connector = %shared.name, %peer, "receive timeout, destroying socket");
                    break;
                }
                ReadEvent::Io(Ok(0)) => break,
                ReadEvent::Io(Ok(_)) => {
                    while let Some(frame) = shared.mode.scan(&buf) {
                        let payload = shared.settings.charset_encoding.decode(&buf[frame.payload.clone()]);
                        buf.advance(frame.consumed);
                        Self::handle_payload(shared, stream, payload, peer, local).await;
                        shared.ctx.events.emit_connection_status(
                            &shared.ctx.channel_id,
                            0,
                            &shared.name,
                            ConnectionStatus::Idle,
                            None,
                        );
                    }
                }
                ReadEvent::Io(Err(e)) => {
                    tracing::debug!(connector = %shared.name, %peer, error = %e, "read error");
                    break;
                }
            }
        }
    }

    async fn handle_payload(
        shared: &Shared,
        stream: &mut BoxedStream,
        payload: String,
        peer: SocketAddr,
        local: Option<SocketAddr>,
    ) {
        let messages = if shared.settings.process_batch {
            hl7::split_batch(&payload)
        } else {
            vec![payload]
        };

        for raw in messages {
            let mut raw_message = RawMessage::new(raw.clone());
            raw_message.source_map.insert("remoteAddress".to_string(), json!(peer.ip().to_string()));
            raw_message.source_map.insert("remotePort".to_string(), json!(peer.port()));
            if let Some(local) = local {
                raw_message
                    .source_map
                    .insert("localAddress".to_string(), json!(local.ip().to_string()));
                raw_message.source_map.insert("localPort".to_string(), json!(local.port()));
            }

            let response = match shared.ctx.dispatcher.dispatch(raw_message).await {
                Ok(result) => Self::select_response(shared, &raw, &result),
                Err(e) => {
                    tracing::error!(connector = %shared.name, error = %e, "dispatch failed");
                    shared.ctx.events.emit_connection_status(
                        &shared.ctx.channel_id,
                        0,
                        &shared.name,
                        ConnectionStatus::Failure,
                        Some(e.to_string()),
                    );
                    match shared.settings.response_mode {
                        ResponseMode::Auto => {
                            let control_id = hl7::message_control_id(&raw).unwrap_or_default();
                            Some(hl7::generate_ack(hl7::AckCode::Error, control_id))
                        }
                        _ => None,
                    }
                }
            };

            if let Some(response) = response {
                Self::write_response(shared, stream, &response).await;
            }
        }
    }

    fn select_response(shared: &Shared, raw: &str, result: &DispatchResult) -> Option<String> {
        match shared.settings.response_mode {
            ResponseMode::None => None,
            ResponseMode::Auto => {
                let code = hl7::AckCode::from_message(&result.message);
                let control_id = hl7::message_control_id(raw).unwrap_or_default();
                Some(hl7::generate_ack(code, control_id))
            }
            ResponseMode::Destination => {
                result.selected_response.as_ref().map(|r| r.message.clone())
            }
        }
    }

    async fn write_response(shared: &Shared, stream: &mut BoxedStream, response: &str) {
        let framed = shared.mode.frame(&shared.settings.charset_encoding.encode(response));

        if shared.settings.respond_on_new_connection == RespondOnNewConnection::NewConnection {
            // Validated at start: address and port are present.
            let address = shared.settings.response_address.clone().unwrap_or_default();
            let port = shared.settings.response_port.unwrap_or_default();
            match TcpStream::connect((address.as_str(), port)).await {
                Ok(mut response_socket) => {
                    if let Err(e) = response_socket.write_all(&framed).await {
                        tracing::warn!(connector = %shared.name, error = %e, "response write failed");
                    }
                    let _ = response_socket.shutdown().await;
                }
                Err(e) => {
                    tracing::warn!(
                        connector = %shared.name,
                        %address,
                        port,
                        error = %e,
                        "cannot open response connection"
                    );
                    shared.ctx.events.emit_connection_status(
                        &shared.ctx.channel_id,
                        0,
                        &shared.name,
                        ConnectionStatus::Failure,
                        Some(format!("response connection failed: {e}")),
                    );
                }
            }
            return;
        }

        if let Err(e) = stream.write_all(&framed).await {
            tracing::warn!(connector = %shared.name, error = %e, "response write failed");
        } else {
            let _ = stream.flush().await;
        }
    }
}

#[async_trait]
impl SourceConnector for TcpReceiver {
    fn name(&self) -> &str {
        &self.name
    }

    fn inbound_data_type(&self) -> DataType {
        self.settings.data_type
    }

    async fn start(&self, ctx: SourceContext) -> Result<()> {
        self.settings.validate()?;
        let mode = self.settings.resolved_transmission_mode()?;
        let (tls_acceptor, tls_connector) = match (&self.settings.tls, self.settings.server_mode) {
            (Some(tls), ServerMode::Server) => (Some(TlsAcceptor::from(tls.server_config()?)), None),
            (Some(tls), ServerMode::Client) => {
                (None, Some(TlsConnector::from(tls.client_config()?)))
            }
            (None, _) => (None, None),
        };

        // A child token lets stop() (e.g. channel pause) tear down this
        // connector without cancelling the rest of the channel.
        let mut ctx = ctx;
        let cancellation = ctx.cancellation.child_token();
        ctx.cancellation = cancellation.clone();
        let shared = Arc::new(Shared {
            name: self.name.clone(),
            settings: self.settings.clone(),
            mode,
            ctx,
            active_connections: AtomicUsize::new(0),
            tls_acceptor,
            tls_connector,
        });

        let task = match self.settings.server_mode {
            ServerMode::Server => {
                let listener = Self::bind_with_retries(&shared).await?;
                tokio::spawn(Self::accept_loop(shared, listener))
            }
            ServerMode::Client => tokio::spawn(Self::connect_loop(shared)),
        };

        let mut runtime = self.runtime.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *runtime = Some(ReceiverRuntime { cancellation, tasks: vec![task] });
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let runtime = {
            let mut guard =
                self.runtime.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            guard.take()
        };
        if let Some(runtime) = runtime {
            runtime.cancellation.cancel();
            for task in runtime.tasks {
                let _ = task.await;
            }
        }
        Ok(())
    }
}

async fn cancellable_sleep(cancellation: &CancellationToken, duration: Duration) {
    tokio::select! {
        () = cancellation.cancelled() => {}
        () = tokio::time::sleep(duration) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medbridge_core::{EventBus, Message, MessageDispatcher, Response, Status};
    use std::sync::Mutex as StdMutex;

    /// Dispatcher stub that records raw payloads and reports every
    /// destination SENT.
    struct RecordingDispatcher {
        raws: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl MessageDispatcher for RecordingDispatcher {
        async fn dispatch(&self, raw: RawMessage) -> Result<DispatchResult> {
            self.raws.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push(raw.raw);
            let mut message = Message::new(1, "ch".to_string(), "server".to_string());
            let mut source = medbridge_core::ConnectorMessage::new(
                1,
                0,
                "ch".to_string(),
                "Channel".to_string(),
                "Source".to_string(),
                "server".to_string(),
                std::time::SystemTime::now(),
            );
            source.status = Status::Sent;
            message.insert_connector_message(source);
            message.processed = true;
            Ok(DispatchResult { message, selected_response: Some(Response::sent(String::new())) })
        }
    }

    fn test_context(dispatcher: Arc<RecordingDispatcher>) -> SourceContext {
        SourceContext {
            channel_id: "ch".to_string(),
            channel_name: "Channel".to_string(),
            dispatcher,
            events: EventBus::default(),
            cancellation: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_mllp_echo_round_trip() {
        // S1: frame in, ACK AA back on the same socket.
        let dispatcher = Arc::new(RecordingDispatcher { raws: StdMutex::new(Vec::new()) });
        let settings = TcpReceiverSettings {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..TcpReceiverSettings::default()
        };

        // Bind on an ephemeral port manually so the test knows the address.
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let ctx = test_context(Arc::clone(&dispatcher));
        let cancellation = ctx.cancellation.clone();
        let shared = Arc::new(Shared {
            name: "Source".to_string(),
            settings,
            mode: TransmissionMode::Mllp,
            ctx,
            active_connections: AtomicUsize::new(0),
            tls_acceptor: None,
            tls_connector: None,
        });
        let accept_task = tokio::spawn(TcpReceiver::accept_loop(Arc::clone(&shared), listener));

        let mut client = TcpStream::connect(addr).await.expect("connect");
        let payload = b"MSH|^~\\&|A|B|C|D|20260101||ADT^A01|42|P|2.5";
        client.write_all(&TransmissionMode::Mllp.frame(payload)).await.expect("write");

        // Read the framed ACK back.
        let mut response = vec![0_u8; 1024];
        let n = client.read(&mut response).await.expect("read ack");
        let ack = TransmissionMode::Mllp.unframe(&response[..n]).expect("framed ack");
        let ack = String::from_utf8_lossy(ack);
        assert!(ack.contains("|ACK|42|P|2.5\r"));
        assert!(ack.contains("MSA|AA|42|"));

        let raws = dispatcher.raws.lock().expect("raws");
        assert_eq!(raws.len(), 1);
        assert!(raws[0].starts_with("MSH|"));
        drop(raws);

        cancellation.cancel();
        let _ = accept_task.await;
    }

    #[tokio::test]
    async fn test_bind_retries_then_surfaces_error() {
        // Occupy a port, then start a receiver on it with a short retry
        // budget: the bind error surfaces from start after the retries.
        let occupier = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = occupier.local_addr().expect("addr");

        let dispatcher = Arc::new(RecordingDispatcher { raws: StdMutex::new(Vec::new()) });
        let receiver = TcpReceiver::new(
            "Source",
            TcpReceiverSettings {
                host: addr.ip().to_string(),
                port: addr.port(),
                bind_retry_attempts: 2,
                bind_retry_interval_ms: 10,
                ..TcpReceiverSettings::default()
            },
        );

        let started = std::time::Instant::now();
        match receiver.start(test_context(dispatcher)).await {
            Err(EngineError::Io(e)) => assert_eq!(e.kind(), ErrorKind::AddrInUse),
            other => panic!("expected bind failure, got {other:?}"),
        }
        // Two retries at 10ms each happened before giving up.
        assert!(started.elapsed() >= Duration::from_millis(20));
        receiver.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn test_partial_frame_discarded_on_close() {
        // S6: complete frame dispatched, trailing partial frame dropped.
        let dispatcher = Arc::new(RecordingDispatcher { raws: StdMutex::new(Vec::new()) });
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let settings =
            TcpReceiverSettings { response_mode: ResponseMode::None, ..TcpReceiverSettings::default() };
        let ctx = test_context(Arc::clone(&dispatcher));
        let cancellation = ctx.cancellation.clone();
        let shared = Arc::new(Shared {
            name: "Source".to_string(),
            settings,
            mode: TransmissionMode::Mllp,
            ctx,
            active_connections: AtomicUsize::new(0),
            tls_acceptor: None,
            tls_connector: None,
        });
        let accept_task = tokio::spawn(TcpReceiver::accept_loop(Arc::clone(&shared), listener));

        let mut client = TcpStream::connect(addr).await.expect("connect");
        let mut bytes = TransmissionMode::Mllp.frame(b"AAA");
        bytes.extend_from_slice(&[crate::framing::VT, b'B', b'B']);
        client.write_all(&bytes).await.expect("write");
        client.shutdown().await.expect("shutdown");
        drop(client);

        // Give the socket task time to drain.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let raws = dispatcher.raws.lock().expect("raws");
        assert_eq!(raws.as_slice(), ["AAA".to_string()]);
        drop(raws);

        cancellation.cancel();
        let _ = accept_task.await;
    }
}
