//! Stream multiplexing and table replication over a single framed
//! connection: a binary frame codec and connection/stream state machines
//! (§3-4), a replication coordinator that mirrors tables through an
//! application-supplied engine (§4.5-6.4), and the ambient auth, resilient
//! reconnection, and transport abstractions they depend on.
#![warn(missing_debug_implementations)]
#![forbid(unsafe_code)]
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

pub mod auth;
pub mod config;
pub mod dupe;
pub mod engine;
pub mod envelope;
pub mod frame;
pub mod replication;
pub mod resilient;
pub mod socket;
pub mod stream;
pub mod transport;

#[cfg(feature = "ws-transport")]
pub mod ws;

pub use dupe::Dupe;
pub use socket::{MuxedSocket, SocketEvent, SocketState, StreamOpener, UnknownStreamPolicy};
pub use stream::{Stream, StreamEvent, StreamState};

/// The crate's top-level error type, composing every module boundary's own
/// `Error` enum.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Frame(#[from] frame::Error),
    #[error(transparent)]
    Stream(#[from] stream::Error),
    #[error(transparent)]
    Socket(#[from] socket::Error),
    #[error(transparent)]
    Auth(#[from] auth::Error),
    #[error(transparent)]
    Engine(#[from] engine::Error),
    #[error(transparent)]
    Replication(#[from] replication::Error),
}
