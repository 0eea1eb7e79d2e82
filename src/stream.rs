//! Per-stream state machine.
//!
//! `StreamState` transitions are total, pure functions: every arm either
//! names the next state or is `unreachable!()`'d as genuinely impossible, so
//! they can be unit-tested without a dispatcher or a transport.
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::config::STREAM_EVENT_BUFFER;
use crate::frame::Frame;
use crate::transport::Outbound;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;

/// Errors returned synchronously by [`Stream`] operations. These never
/// poison the parent socket.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("stream is closed")]
    Closed,
}

/// Observable state of one logical stream, mirroring the four states named
/// in the spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    Closing,
    CloseWait,
    Closed,
}

/// A notification delivered to the stream's owner, in enqueue order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Data(Bytes),
    Closed,
    Error(u32, String),
}

/// What the caller of a transition must do as a result of it.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Action {
    /// Emit a stream-close frame.
    EmitClose,
    /// Emit a stream-reset frame with this code/message.
    EmitReset(u32, String),
    /// Emit nothing.
    None,
}

impl StreamState {
    /// `send()`: valid in `Open`/`CloseWait`; no-op otherwise.
    pub(crate) fn on_send(self) -> bool {
        matches!(self, Self::Open | Self::CloseWait)
    }

    /// `close()`: user-initiated half/full close.
    pub(crate) fn on_close(self) -> (Self, Action) {
        match self {
            Self::Open => (Self::Closing, Action::EmitClose),
            Self::CloseWait => (Self::Closed, Action::EmitClose),
            Self::Closing | Self::Closed => (self, Action::None),
        }
    }

    /// `error()`: user-initiated abrupt reset.
    pub(crate) fn on_error(self, code: u32, msg: String) -> (Self, Action) {
        match self {
            Self::Open | Self::CloseWait => (Self::Closed, Action::EmitReset(code, msg)),
            Self::Closing => (Self::Closed, Action::None),
            Self::Closed => (self, Action::None),
        }
    }

    /// Ingress: peer sent a stream-close frame. Returns the new state and
    /// whether the entry is now removable from the socket's stream table.
    pub(crate) fn on_stream_close(self) -> (Self, bool) {
        match self {
            Self::Open => (Self::CloseWait, false),
            Self::Closing => (Self::Closed, true),
            Self::CloseWait => (Self::CloseWait, false),
            Self::Closed => (Self::Closed, true),
        }
    }

    /// Ingress: peer sent a stream-reset, or the socket is tearing every
    /// stream down. Always removable afterwards.
    pub(crate) fn on_stream_error(self) -> Self {
        Self::Closed
    }

    pub(crate) fn accepts_data(self) -> bool {
        matches!(self, Self::Open | Self::Closing)
    }
}

/// Shared between the `Stream` handle the user holds and the slot kept in
/// the socket's stream table, so both sides observe the same transitions.
#[derive(Debug)]
pub(crate) struct StreamShared {
    pub state: Mutex<StreamState>,
    pub events: mpsc::Sender<StreamEvent>,
}

impl StreamShared {
    pub(crate) fn new() -> (Arc<Self>, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(STREAM_EVENT_BUFFER);
        (
            Arc::new(Self {
                state: Mutex::new(StreamState::Open),
                events: tx,
            }),
            rx,
        )
    }

    /// Deliver an incoming data payload, if the state accepts it.
    pub(crate) async fn on_stream_data(&self, payload: Bytes) {
        let accepts = self.state.lock().accepts_data();
        if accepts {
            self.events.send(StreamEvent::Data(payload)).await.ok();
        }
    }

    /// Deliver an incoming stream-close. Returns whether the slot is now
    /// removable from the socket's table.
    pub(crate) async fn on_stream_close(&self) -> bool {
        let (next, removable) = {
            let mut state = self.state.lock();
            let (next, removable) = state.on_stream_close();
            *state = next;
            (next, removable)
        };
        if matches!(next, StreamState::CloseWait | StreamState::Closed) {
            self.events.send(StreamEvent::Closed).await.ok();
        }
        removable
    }

    /// Deliver an incoming stream-reset, or an abrupt socket-wide teardown.
    pub(crate) async fn on_stream_error(&self, code: u32, msg: String) {
        let was_closed = {
            let mut state = self.state.lock();
            let was_closed = *state == StreamState::Closed;
            *state = state.on_stream_error();
            was_closed
        };
        if !was_closed {
            self.events.send(StreamEvent::Error(code, msg)).await.ok();
        }
    }
}

/// A user-facing handle to one multiplexed, bidirectional logical stream.
#[derive(Debug)]
pub struct Stream {
    stream_id: u32,
    shared: Arc<StreamShared>,
    events: mpsc::Receiver<StreamEvent>,
    frame_tx: mpsc::UnboundedSender<Outbound>,
}

impl Stream {
    pub(crate) fn new(
        stream_id: u32,
        shared: Arc<StreamShared>,
        events: mpsc::Receiver<StreamEvent>,
        frame_tx: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        Self {
            stream_id,
            shared,
            events,
            frame_tx,
        }
    }

    /// The id this stream was assigned: odd if we opened it, even if the
    /// peer did.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.stream_id
    }

    /// Current state, as last observed by this handle.
    #[must_use]
    pub fn state(&self) -> StreamState {
        *self.shared.state.lock()
    }

    /// Enqueue a stream-data frame. A no-op once the stream is closing or
    /// closed, matching the at-most-once write-side-close semantics.
    pub fn send(&self, payload: Bytes) {
        if self.shared.state.lock().on_send() {
            self.frame_tx
                .send(Outbound::Frame(Frame::Data {
                    stream_id: self.stream_id,
                    payload,
                }))
                .ok();
        }
    }

    /// Await the next data/close/error notification. Returns `None` once the
    /// event channel is drained and the dispatcher has dropped its sender.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Half- or fully-close our send side, per §4.2.
    pub fn close(&self) {
        let (next, action) = {
            let mut state = self.shared.state.lock();
            let (next, action) = state.on_close();
            *state = next;
            (next, action)
        };
        trace!(stream_id = self.stream_id, ?next, "local close");
        if action == Action::EmitClose {
            self.frame_tx
                .send(Outbound::Frame(Frame::Close {
                    stream_id: self.stream_id,
                }))
                .ok();
        }
    }

    /// Abort the stream with a stream-reset frame, per §4.2.
    pub fn error(&self, code: u32, msg: impl Into<String>) {
        let msg = msg.into();
        let (next, action) = {
            let mut state = self.shared.state.lock();
            let (next, action) = state.on_error(code, msg.clone());
            *state = next;
            (next, action)
        };
        trace!(stream_id = self.stream_id, ?next, "local error");
        if let Action::EmitReset(code, msg) = action {
            self.frame_tx
                .send(Outbound::Frame(Frame::Reset {
                    stream_id: self.stream_id,
                    error_code: code,
                    message: msg,
                }))
                .ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dupe::Dupe;

    #[test]
    fn send_allowed_in_open_and_closewait_only() {
        assert!(StreamState::Open.on_send());
        assert!(StreamState::CloseWait.on_send());
        assert!(!StreamState::Closing.on_send());
        assert!(!StreamState::Closed.on_send());
    }

    #[test]
    fn close_from_open_emits_close_and_goes_closing() {
        assert_eq!(
            StreamState::Open.on_close(),
            (StreamState::Closing, Action::EmitClose)
        );
    }

    #[test]
    fn close_from_closewait_emits_close_and_goes_closed() {
        assert_eq!(
            StreamState::CloseWait.on_close(),
            (StreamState::Closed, Action::EmitClose)
        );
    }

    #[test]
    fn close_idempotent_in_closing_and_closed() {
        assert_eq!(
            StreamState::Closing.on_close(),
            (StreamState::Closing, Action::None)
        );
        assert_eq!(
            StreamState::Closed.on_close(),
            (StreamState::Closed, Action::None)
        );
    }

    #[test]
    fn error_from_open_or_closewait_emits_reset() {
        assert_eq!(
            StreamState::Open.on_error(42, "bye".into()),
            (StreamState::Closed, Action::EmitReset(42, "bye".into()))
        );
        assert_eq!(
            StreamState::CloseWait.on_error(1, "x".into()),
            (StreamState::Closed, Action::EmitReset(1, "x".into()))
        );
    }

    #[test]
    fn error_from_closing_is_silent() {
        assert_eq!(
            StreamState::Closing.on_error(1, "x".into()),
            (StreamState::Closed, Action::None)
        );
    }

    #[test]
    fn error_from_closed_is_noop() {
        assert_eq!(
            StreamState::Closed.on_error(1, "x".into()),
            (StreamState::Closed, Action::None)
        );
    }

    #[test]
    fn on_stream_close_half_closes_then_fully_closes() {
        assert_eq!(
            StreamState::Open.on_stream_close(),
            (StreamState::CloseWait, false)
        );
        assert_eq!(
            StreamState::Closing.on_stream_close(),
            (StreamState::Closed, true)
        );
        assert_eq!(
            StreamState::CloseWait.on_stream_close(),
            (StreamState::CloseWait, false)
        );
        assert_eq!(
            StreamState::Closed.on_stream_close(),
            (StreamState::Closed, true)
        );
    }

    #[test]
    fn accepts_data_only_open_and_closing() {
        assert!(StreamState::Open.accepts_data());
        assert!(StreamState::Closing.accepts_data());
        assert!(!StreamState::CloseWait.accepts_data());
        assert!(!StreamState::Closed.accepts_data());
    }

    #[tokio::test]
    async fn half_close_scenario() {
        let (shared, events) = StreamShared::new();
        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel();
        let mut stream = Stream::new(3, shared.dupe(), events, frame_tx);
        // Peer closes their send side.
        assert!(!shared.on_stream_close().await);
        assert_eq!(stream.recv().await, Some(StreamEvent::Closed));
        assert_eq!(stream.state(), StreamState::CloseWait);
        // We can still send.
        stream.send(Bytes::from_static(b"x"));
        assert!(matches!(
            frame_rx.recv().await,
            Some(Outbound::Frame(Frame::Data { .. }))
        ));
        // Our close finishes the handshake and is removable.
        stream.close();
        assert!(matches!(
            frame_rx.recv().await,
            Some(Outbound::Frame(Frame::Close { .. }))
        ));
        assert_eq!(stream.state(), StreamState::Closed);
    }
}
