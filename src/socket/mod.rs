//! `MuxedSocket`: the connection state machine, stream table, auth, goaway
//! and dispatch described in §4.3.
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

mod inner;

use crate::auth::Credentials;
use crate::config::{ACCEPTED_STREAM_BUFFER, MAX_STREAM_ID};
use crate::dupe::Dupe;
use crate::stream::{Stream, StreamShared};
use crate::transport::{Outbound, Transport};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Connection-level state, per §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Idle,
    AuthSent,
    Closing,
    CloseWait,
    Closed,
}

/// A notification delivered to the socket's owner.
#[derive(Debug)]
pub enum SocketEvent {
    /// A new server-initiated stream was accepted.
    Stream(Stream),
    /// The peer (or we) closed the connection gracefully.
    Closed,
    /// The connection failed abruptly.
    Error(u32, String),
}

/// Errors returned synchronously by [`MuxedSocket`] operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("connection not established")]
    NotEstablished,
    #[error("connection closing")]
    Closing,
}

/// Whether an unknown, odd, or otherwise unrecognized incoming stream id
/// should be silently dropped (the spec's stated default) or answered with
/// a `Reset`. Left as a constructor option per the open question in §9.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownStreamPolicy {
    #[default]
    Drop,
    Reset,
}

/// Shared, lock-protected bookkeeping the dispatcher task and the
/// `MuxedSocket` handle both need to see consistently.
pub(crate) struct Shared {
    pub state: Mutex<SocketState>,
    pub active_streams: RwLock<HashMap<u32, Arc<StreamShared>>>,
    pub next_stream: AtomicU32,
    pub server_stream_watermark: AtomicU32,
    pub unknown_stream_policy: UnknownStreamPolicy,
}

impl Shared {
    /// Streams the table should hold, per the invariant in §3: exactly those
    /// in `Open ∪ Closing ∪ CloseWait`.
    #[cfg(test)]
    pub(crate) fn active_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.active_streams.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

/// A multiplexed connection to one remote endpoint.
pub struct MuxedSocket {
    shared: Arc<Shared>,
    frame_tx: mpsc::UnboundedSender<Outbound>,
    events: mpsc::Receiver<SocketEvent>,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for MuxedSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxedSocket")
            .field("state", &*self.shared.state.lock())
            .finish_non_exhaustive()
    }
}

impl MuxedSocket {
    /// Build a `MuxedSocket` over an already-open `transport`, sending the
    /// binary auth frame built from `creds` and transitioning
    /// `Idle` -> `AuthSent`.
    ///
    /// The crate does not drive any transport-level handshake (WebSocket
    /// upgrade, TLS): `transport` must already be ready to carry
    /// [`Message`](crate::transport::Message)s when this is called.
    pub fn connect<T>(transport: T, creds: &Credentials) -> Result<Self, crate::auth::Error>
    where
        T: Transport + 'static,
    {
        Self::connect_with_policy(transport, creds, UnknownStreamPolicy::default())
    }

    /// Like [`Self::connect`], but configuring how unknown incoming stream
    /// ids are handled (§9 open question).
    pub fn connect_with_policy<T>(
        transport: T,
        creds: &Credentials,
        unknown_stream_policy: UnknownStreamPolicy,
    ) -> Result<Self, crate::auth::Error>
    where
        T: Transport + 'static,
    {
        let auth_frame = crate::auth::build_auth_frame(creds, chrono::Utc::now())?;

        let shared = Arc::new(Shared {
            state: Mutex::new(SocketState::Idle),
            active_streams: RwLock::new(HashMap::new()),
            next_stream: AtomicU32::new(1),
            server_stream_watermark: AtomicU32::new(0),
            unknown_stream_policy,
        });
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(ACCEPTED_STREAM_BUFFER);

        frame_tx.send(Outbound::Frame(auth_frame)).ok();
        *shared.state.lock() = SocketState::AuthSent;

        let task = tokio::spawn(inner::run(
            shared.dupe(),
            transport,
            frame_rx,
            frame_tx.dupe(),
            event_tx,
        ));

        Ok(Self {
            shared,
            frame_tx,
            events: event_rx,
            task: Some(task),
        })
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> SocketState {
        *self.shared.state.lock()
    }

    /// Open a new, client-initiated stream.
    pub fn open_stream(&self) -> Result<Stream, Error> {
        match *self.shared.state.lock() {
            SocketState::AuthSent => {}
            SocketState::Closing | SocketState::CloseWait => return Err(Error::Closing),
            SocketState::Idle | SocketState::Closed => return Err(Error::NotEstablished),
        }
        let id = self.shared.next_stream.fetch_add(2, Ordering::AcqRel);
        assert!(id <= MAX_STREAM_ID, "exhausted the client stream id space");
        let (stream_shared, events) = StreamShared::new();
        self.shared
            .active_streams
            .write()
            .insert(id, stream_shared.dupe());
        debug!(stream_id = id, "opened client stream");
        Ok(Stream::new(id, stream_shared, events, self.frame_tx.dupe()))
    }

    /// Await the next socket-level notification (new server stream, close,
    /// error).
    pub async fn recv(&mut self) -> Option<SocketEvent> {
        self.events.recv().await
    }

    /// Graceful local shutdown, per §4.3.
    pub async fn close_socket(&self) {
        inner::close_socket(&self.shared, &self.frame_tx).await;
    }

    /// Abrupt local shutdown with a `Goaway`, per §4.3.
    pub async fn error_socket(&self, code: u32, msg: impl Into<String>) {
        inner::error_socket(&self.shared, &self.frame_tx, code, msg.into()).await;
    }

    /// Wait for the dispatcher task to finish (the transport closed and all
    /// wind-down bookkeeping completed). Mostly useful in tests.
    pub async fn join(&mut self) {
        if let Some(task) = self.task.take() {
            task.await.ok();
        }
    }

    /// A cheap, cloneable handle that can open new client streams without
    /// borrowing the socket itself. Lets callers that need to open streams
    /// from several concurrent tasks (the replication coordinator, one per
    /// mirrored table) do so without fighting over `&mut self` for
    /// [`Self::recv`].
    #[must_use]
    pub fn opener(&self) -> StreamOpener {
        StreamOpener {
            shared: self.shared.dupe(),
            frame_tx: self.frame_tx.dupe(),
        }
    }
}

/// See [`MuxedSocket::opener`].
#[derive(Clone)]
pub struct StreamOpener {
    shared: Arc<Shared>,
    frame_tx: mpsc::UnboundedSender<Outbound>,
}

impl std::fmt::Debug for StreamOpener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamOpener")
            .field("state", &*self.shared.state.lock())
            .finish_non_exhaustive()
    }
}

impl StreamOpener {
    /// Open a new, client-initiated stream. Identical to
    /// [`MuxedSocket::open_stream`].
    pub fn open_stream(&self) -> Result<Stream, Error> {
        match *self.shared.state.lock() {
            SocketState::AuthSent => {}
            SocketState::Closing | SocketState::CloseWait => return Err(Error::Closing),
            SocketState::Idle | SocketState::Closed => return Err(Error::NotEstablished),
        }
        let id = self.shared.next_stream.fetch_add(2, Ordering::AcqRel);
        assert!(id <= MAX_STREAM_ID, "exhausted the client stream id space");
        let (stream_shared, events) = StreamShared::new();
        self.shared
            .active_streams
            .write()
            .insert(id, stream_shared.dupe());
        debug!(stream_id = id, "opened client stream");
        Ok(Stream::new(id, stream_shared, events, self.frame_tx.dupe()))
    }
}
