// SPDX-FileCopyrightText: © 2025 Medbridge Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! TCP source and destination connectors.

mod dispatcher;
mod receiver;

pub use dispatcher::TcpDispatcher;
pub use receiver::TcpReceiver;

use tokio::io::{AsyncRead, AsyncWrite};

/// Object-safe alias for a plain or TLS-wrapped socket.
pub trait IoStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> IoStream for T {}

/// The connectors pass sockets around type-erased so MLLP and MLLPS share
/// every code path past the handshake.
pub type BoxedStream = Box<dyn IoStream>;
