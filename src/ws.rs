//! Concrete [`Transport`] adapter over `tokio-tungstenite`.
//!
//! Gated behind the `ws-transport` feature: the core crate does not need
//! this to multiplex streams or replicate tables, but almost every real
//! deployment hands it a `WebSocketStream`, so the adapter ships alongside
//! the transport-generic core the way the teacher crate ships its WebSocket
//! glue alongside a transport-generic `mux` library.
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::transport::Message as MuxMessage;
use futures_util::{Sink, Stream};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

/// Wraps a `tokio-tungstenite` [`WebSocketStream`] so it satisfies
/// [`crate::transport::Transport`].
#[derive(Debug)]
pub struct WsTransport<S>(WebSocketStream<S>);

impl<S> WsTransport<S> {
    /// Wrap an already-handshaken `WebSocketStream`. The crate does not
    /// perform the HTTP upgrade itself; callers do that with whatever HTTP
    /// client/server stack they already depend on and hand the resulting
    /// stream here.
    #[must_use]
    pub fn new(ws: WebSocketStream<S>) -> Self {
        Self(ws)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Stream for WsTransport<S> {
    type Item = Result<MuxMessage, WsError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            return match Pin::new(&mut self.0).poll_next(cx) {
                Poll::Ready(Some(Ok(WsMessage::Binary(data)))) => {
                    Poll::Ready(Some(Ok(MuxMessage::Binary(data))))
                }
                Poll::Ready(Some(Ok(WsMessage::Close(frame)))) => Poll::Ready(Some(Ok(
                    MuxMessage::Close(frame.map_or(1000, |f| f.code.into())),
                ))),
                // Ping/Pong/Frame are handled transparently by tokio-tungstenite
                // or carry no payload we care about; keep polling.
                Poll::Ready(Some(Ok(
                    WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_),
                ))) => {
                    continue;
                }
                Poll::Ready(Some(Ok(WsMessage::Text(_)))) => {
                    Poll::Ready(Some(Err(WsError::Protocol(
                        tokio_tungstenite::tungstenite::error::ProtocolError::InvalidOpcode(0),
                    ))))
                }
                Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
                Poll::Ready(None) => Poll::Ready(None),
                Poll::Pending => Poll::Pending,
            };
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Sink<MuxMessage> for WsTransport<S> {
    type Error = WsError;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.0).poll_ready(cx)
    }

    fn start_send(mut self: Pin<&mut Self>, item: MuxMessage) -> Result<(), Self::Error> {
        let msg = match item {
            MuxMessage::Binary(data) => WsMessage::Binary(data),
            MuxMessage::Close(code) => {
                WsMessage::Close(Some(tokio_tungstenite::tungstenite::protocol::CloseFrame {
                    code: code.into(),
                    reason: "".into(),
                }))
            }
        };
        Pin::new(&mut self.0).start_send(msg)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.0).poll_close(cx)
    }
}
