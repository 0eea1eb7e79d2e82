//! Dispatcher task: splits the transport into a sink/stream pair and
//! concurrently drains the outgoing frame queue while processing incoming
//! frames, mirroring the teacher's `MultiplexorInner::task` shape (a
//! priority-ordered `poll_fn` join rather than a flat `tokio::select!`, so
//! that wind-down always checks "did the peer hang up" before "do we still
//! have frames queued").
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use super::{Shared, SocketEvent, SocketState, UnknownStreamPolicy};
use crate::config::GOAWAY_CLOSE_CODE;
use crate::dupe::Dupe;
use crate::frame::Frame;
use crate::stream::{Stream, StreamShared};
use crate::transport::{Message, Outbound, Transport};
use futures_util::future::poll_fn;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::pin::pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::Poll;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Run the dispatcher for one `MuxedSocket` until the transport closes or
/// fails, then wind everything down.
#[tracing::instrument(skip_all, level = "debug")]
pub(super) async fn run<T: Transport + 'static>(
    shared: Arc<Shared>,
    transport: T,
    mut frame_rx: mpsc::UnboundedReceiver<Outbound>,
    frame_tx: mpsc::UnboundedSender<Outbound>,
    event_tx: mpsc::Sender<SocketEvent>,
) {
    let (mut sink, mut stream) = transport.split();

    let outcome = {
        let mut send_fut = pin!(process_outgoing(&mut frame_rx, &mut sink));
        let mut recv_fut = pin!(process_incoming(&shared, &mut stream, &frame_tx, &event_tx));
        poll_fn(|cx| {
            // Prefer noticing the peer hung up/erred over draining more
            // frames, so that wind-down sees an accurate picture.
            if let Poll::Ready(r) = recv_fut.as_mut().poll(cx) {
                return Poll::Ready(Outcome::Incoming(r));
            }
            if let Poll::Ready(r) = send_fut.as_mut().poll(cx) {
                return Poll::Ready(Outcome::Outgoing(r));
            }
            Poll::Pending
        })
        .await
    };

    wind_down(&shared, &event_tx, outcome).await;
}

enum Outcome {
    Incoming(IncomingOutcome),
    Outgoing(OutgoingOutcome),
}

enum IncomingOutcome {
    PeerClosed,
    TransportError(String),
}

enum OutgoingOutcome {
    /// The outgoing channel can never legitimately close: the socket handle
    /// holds a sender for its own lifetime, and every `Stream` holds a
    /// clone.
    ChannelClosed,
    SinkError(String),
    /// `close_socket`/`error_socket` already performed their state
    /// transitions before queuing this; wind-down has nothing left to do.
    LocalClose,
}

/// Drain `frame_rx`, encoding `Frame`s and forwarding `Close` as a transport
/// close, until the sink errors, we are asked to close locally, or the
/// channel is (unexpectedly) closed.
#[tracing::instrument(skip_all, level = "debug")]
async fn process_outgoing<T: Transport>(
    frame_rx: &mut mpsc::UnboundedReceiver<Outbound>,
    sink: &mut SplitSink<T, Message>,
) -> OutgoingOutcome {
    loop {
        match frame_rx.recv().await {
            Some(Outbound::Frame(frame)) => {
                trace!("sending frame: {frame:?}");
                if let Err(e) = sink.send(Message::Binary(frame.encode())).await {
                    return OutgoingOutcome::SinkError(e.to_string());
                }
            }
            Some(Outbound::Close(code)) => {
                debug!("closing transport with code {code}");
                sink.send(Message::Close(code)).await.ok();
                sink.close().await.ok();
                return OutgoingOutcome::LocalClose;
            }
            None => return OutgoingOutcome::ChannelClosed,
        }
    }
}

/// Process incoming transport messages until the peer closes or the
/// transport errors.
#[tracing::instrument(skip_all, level = "debug")]
async fn process_incoming<T: Transport>(
    shared: &Arc<Shared>,
    stream: &mut SplitStream<T>,
    frame_tx: &mpsc::UnboundedSender<Outbound>,
    event_tx: &mpsc::Sender<SocketEvent>,
) -> IncomingOutcome {
    loop {
        match stream.next().await {
            Some(Ok(Message::Binary(data))) => {
                process_message(shared, data, frame_tx, event_tx).await;
            }
            Some(Ok(Message::Close(_))) => return IncomingOutcome::PeerClosed,
            Some(Err(e)) => return IncomingOutcome::TransportError(e.to_string()),
            None => return IncomingOutcome::PeerClosed,
        }
    }
}

#[tracing::instrument(skip_all, level = "debug")]
async fn process_message(
    shared: &Arc<Shared>,
    data: bytes::Bytes,
    frame_tx: &mpsc::UnboundedSender<Outbound>,
    event_tx: &mpsc::Sender<SocketEvent>,
) {
    // Dispatch is only meaningful once auth has been sent.
    if !matches!(
        *shared.state.lock(),
        SocketState::AuthSent | SocketState::Closing
    ) {
        return;
    }
    let frame = match Frame::decode(data) {
        Ok(Some(frame)) => frame,
        Ok(None) => {
            trace!("dropping unrecognized frame type");
            return;
        }
        Err(e) => {
            warn!("malformed frame, treating as protocol violation: {e}");
            error_socket(shared, frame_tx, 1002, format!("malformed frame: {e}")).await;
            return;
        }
    };
    match frame {
        Frame::Auth { .. } => {
            warn!("server sent an auth frame, fatal protocol violation");
            error_socket(shared, frame_tx, 1002, "unexpected auth frame".into()).await;
        }
        Frame::Goaway {
            error_code,
            message,
            ..
        } => {
            on_socket_error(shared, event_tx, error_code, message).await;
        }
        Frame::Data { stream_id, payload } => {
            dispatch_data(shared, frame_tx, event_tx, stream_id, payload).await;
        }
        Frame::Close { stream_id } => {
            let removable = {
                let table = shared.active_streams.read();
                table.get(&stream_id).map(|slot| slot.dupe())
            };
            if let Some(slot) = removable {
                if slot.on_stream_close().await {
                    shared.active_streams.write().remove(&stream_id);
                }
            }
        }
        Frame::Reset {
            stream_id,
            error_code,
            message,
        } => {
            let slot = shared.active_streams.write().remove(&stream_id);
            if let Some(slot) = slot {
                slot.on_stream_error(error_code, message).await;
            }
        }
    }
}

async fn dispatch_data(
    shared: &Arc<Shared>,
    frame_tx: &mpsc::UnboundedSender<Outbound>,
    event_tx: &mpsc::Sender<SocketEvent>,
    stream_id: u32,
    payload: bytes::Bytes,
) {
    let existing = shared.active_streams.read().get(&stream_id).map(Dupe::dupe);
    if let Some(slot) = existing {
        slot.on_stream_data(payload).await;
        return;
    }

    let is_even = stream_id % 2 == 0;
    let watermark = shared.server_stream_watermark.load(Ordering::Acquire);
    let is_new_server_stream =
        is_even && stream_id > watermark && matches!(*shared.state.lock(), SocketState::AuthSent);

    if is_new_server_stream {
        shared
            .server_stream_watermark
            .store(stream_id, Ordering::Release);
        let (stream_shared, events) = StreamShared::new();
        shared
            .active_streams
            .write()
            .insert(stream_id, stream_shared.dupe());
        stream_shared.on_stream_data(payload).await;
        let handle = Stream::new(stream_id, stream_shared, events, frame_tx.dupe());
        debug!(stream_id, "accepted new server stream");
        event_tx.send(SocketEvent::Stream(handle)).await.ok();
        return;
    }

    if matches!(*shared.state.lock(), SocketState::Closing) {
        trace!(stream_id, "dropping data for unknown stream while closing");
        return;
    }

    match shared.unknown_stream_policy {
        UnknownStreamPolicy::Drop => {
            trace!(stream_id, "dropping data for unknown stream");
        }
        UnknownStreamPolicy::Reset => {
            trace!(stream_id, "resetting unknown stream");
            frame_tx
                .send(Outbound::Frame(Frame::Reset {
                    stream_id,
                    error_code: 0,
                    message: "unknown stream".into(),
                }))
                .ok();
        }
    }
}

/// Ingress `Goaway`, or a transport-level error: propagate to every stream,
/// clear the table, transition `Closed`. Never emits a frame.
async fn on_socket_error(
    shared: &Arc<Shared>,
    event_tx: &mpsc::Sender<SocketEvent>,
    code: u32,
    msg: String,
) {
    if matches!(*shared.state.lock(), SocketState::Closed) {
        return;
    }
    let streams: Vec<Arc<StreamShared>> = shared
        .active_streams
        .write()
        .drain()
        .map(|(_, s)| s)
        .collect();
    for s in streams {
        s.on_stream_error(code, msg.clone()).await;
    }
    *shared.state.lock() = SocketState::Closed;
    event_tx.send(SocketEvent::Error(code, msg)).await.ok();
}

/// Graceful local shutdown, per §4.3.
pub(super) async fn close_socket(shared: &Arc<Shared>, frame_tx: &mpsc::UnboundedSender<Outbound>) {
    let prev = *shared.state.lock();
    match prev {
        SocketState::Idle => {
            shared.active_streams.write().clear();
            *shared.state.lock() = SocketState::Closed;
            frame_tx.send(Outbound::Close(1000)).ok();
        }
        SocketState::AuthSent => {
            close_every_stream(shared, frame_tx).await;
            *shared.state.lock() = SocketState::Closing;
            frame_tx.send(Outbound::Close(1000)).ok();
        }
        SocketState::CloseWait => {
            close_every_stream(shared, frame_tx).await;
            shared.active_streams.write().clear();
            *shared.state.lock() = SocketState::Closed;
            frame_tx.send(Outbound::Close(1000)).ok();
        }
        SocketState::Closing | SocketState::Closed => {}
    }
}

async fn close_every_stream(shared: &Arc<Shared>, frame_tx: &mpsc::UnboundedSender<Outbound>) {
    let streams: Vec<(u32, Arc<StreamShared>)> = shared
        .active_streams
        .read()
        .iter()
        .map(|(id, s)| (*id, s.dupe()))
        .collect();
    for (id, s) in streams {
        // Emulate `Stream::close()`'s OPEN/CLOSEWAIT transitions directly on
        // the shared state, since we don't hold a `Stream` handle here.
        let action = {
            let mut state = s.state.lock();
            let (next, action) = state.on_close();
            *state = next;
            action
        };
        if action == crate::stream::Action::EmitClose {
            frame_tx
                .send(Outbound::Frame(Frame::Close { stream_id: id }))
                .ok();
        }
    }
}

/// Abrupt local shutdown, per §4.3: propagate errors, emit `Goaway`, close
/// the transport with 1002.
pub(super) async fn error_socket(
    shared: &Arc<Shared>,
    frame_tx: &mpsc::UnboundedSender<Outbound>,
    code: u32,
    msg: String,
) {
    let prev = *shared.state.lock();
    match prev {
        SocketState::Idle | SocketState::Closing | SocketState::Closed => {
            shared.active_streams.write().clear();
            *shared.state.lock() = SocketState::Closed;
        }
        SocketState::AuthSent | SocketState::CloseWait => {
            let streams: Vec<Arc<StreamShared>> = shared
                .active_streams
                .write()
                .drain()
                .map(|(_, s)| s)
                .collect();
            for s in streams {
                s.on_stream_error(code, msg.clone()).await;
            }
            *shared.state.lock() = SocketState::Closed;
            let next_stream = shared.next_stream.load(Ordering::Acquire);
            let watermark = shared.server_stream_watermark.load(Ordering::Acquire);
            let last_stream = next_stream.saturating_sub(2).max(watermark);
            frame_tx
                .send(Outbound::Frame(Frame::Goaway {
                    last_stream,
                    error_code: code,
                    message: msg,
                }))
                .ok();
            frame_tx.send(Outbound::Close(GOAWAY_CLOSE_CODE)).ok();
        }
    }
}

/// Transport-level close/error wind-down once the dispatcher's concurrent
/// send/receive loop above has finished.
async fn wind_down(shared: &Arc<Shared>, event_tx: &mpsc::Sender<SocketEvent>, outcome: Outcome) {
    match outcome {
        Outcome::Incoming(IncomingOutcome::PeerClosed) => {
            on_transport_close(shared, event_tx).await
        }
        Outcome::Incoming(IncomingOutcome::TransportError(msg)) => {
            on_transport_error(shared, event_tx, msg).await;
        }
        Outcome::Outgoing(OutgoingOutcome::SinkError(msg)) => {
            on_transport_error(shared, event_tx, msg).await;
        }
        Outcome::Outgoing(OutgoingOutcome::LocalClose) => {
            // `close_socket`/`error_socket` already transitioned state and
            // notified every stream before queuing the close.
        }
        Outcome::Outgoing(OutgoingOutcome::ChannelClosed) => {
            unreachable!("the outgoing channel sender is held by the socket and every stream for its lifetime")
        }
    }
}

async fn on_transport_close(shared: &Arc<Shared>, event_tx: &mpsc::Sender<SocketEvent>) {
    let prev = *shared.state.lock();
    match prev {
        SocketState::Idle | SocketState::AuthSent => {
            close_peer_side(shared).await;
            *shared.state.lock() = SocketState::CloseWait;
            event_tx.send(SocketEvent::Closed).await.ok();
        }
        SocketState::Closing => {
            close_peer_side(shared).await;
            shared.active_streams.write().clear();
            *shared.state.lock() = SocketState::Closed;
            event_tx.send(SocketEvent::Closed).await.ok();
        }
        SocketState::CloseWait | SocketState::Closed => {}
    }
}

async fn close_peer_side(shared: &Arc<Shared>) {
    let streams: Vec<Arc<StreamShared>> = shared
        .active_streams
        .read()
        .values()
        .map(Dupe::dupe)
        .collect();
    for s in streams {
        // `Closing`'s caller clears the whole table right after this, and
        // `Idle`/`AuthSent` leave surviving streams in `CloseWait` in the
        // table either way, so the per-stream removable flag is moot here.
        s.on_stream_close().await;
    }
}

async fn on_transport_error(
    shared: &Arc<Shared>,
    event_tx: &mpsc::Sender<SocketEvent>,
    msg: String,
) {
    if matches!(*shared.state.lock(), SocketState::Closed) {
        return;
    }
    let streams: Vec<Arc<StreamShared>> = shared
        .active_streams
        .write()
        .drain()
        .map(|(_, s)| s)
        .collect();
    for s in streams {
        s.on_stream_error(0, msg.clone()).await;
    }
    *shared.state.lock() = SocketState::Closed;
    event_tx.send(SocketEvent::Error(0, msg)).await.ok();
}
