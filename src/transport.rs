//! The byte-carrier abstraction the multiplexor runs over.
//!
//! The core never opens a socket, performs a WebSocket upgrade, or
//! terminates TLS: it is handed an already-open `Transport` and drives it.
//! This mirrors the teacher crate's own genericity over any type satisfying
//! its `WebSocketStream` bound, except here the bound is spelled out as a
//! dedicated trait rather than re-exporting a `tokio-tungstenite` type.
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::frame::Frame;
use bytes::Bytes;
use futures_util::{Sink, Stream};
use std::fmt;

/// A single message read from or written to the underlying connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// One complete binary frame.
    Binary(Bytes),
    /// The peer (or we) asked to close the connection, with the given close
    /// code.
    Close(u16),
}

/// Errors a [`Transport`] implementation may report.
pub trait TransportError: std::error::Error + Send + Sync + 'static {}
impl<T: std::error::Error + Send + Sync + 'static> TransportError for T {}

/// An already-open, ordered, reliable, message-framed duplex connection.
///
/// A `tokio-tungstenite` `WebSocketStream` is the canonical implementation
/// (see [`ws::WsTransport`](crate::ws::WsTransport) behind the `ws-transport`
/// feature), but any `Sink`/`Stream` pair with this shape works, which is
/// what lets the crate's tests drive a `MuxedSocket` over an in-memory
/// loopback instead of a real socket.
pub trait Transport:
    Sink<Message, Error = Self::Err> + Stream<Item = Result<Message, Self::Err>> + Unpin + Send
{
    /// The error type of both halves of this transport.
    type Err: TransportError;
}

impl<T, E> Transport for T
where
    T: Sink<Message, Error = E> + Stream<Item = Result<Message, E>> + Unpin + Send,
    E: TransportError,
{
    type Err = E;
}

/// Items queued on the internal outgoing channel shared by every `Stream`
/// and the owning `MuxedSocket`. Ordering on this single queue is what lets
/// `error_socket` emit its `Goaway` and then close the transport without a
/// race against in-flight data frames.
#[derive(Debug)]
pub(crate) enum Outbound {
    Frame(Frame),
    Close(u16),
}

impl fmt::Display for Outbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Frame(frame) => write!(f, "frame {frame:?}"),
            Self::Close(code) => write!(f, "close({code})"),
        }
    }
}
