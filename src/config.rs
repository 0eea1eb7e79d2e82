//! Protocol and tuning constants.
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

/// Stream ids are transmitted in the low 24 bits of the first frame word.
pub const MAX_STREAM_ID: u32 = (1 << 24) - 1;

/// The only auth-frame wire version this crate speaks.
pub const AUTH_VERSION: u8 = 0;

/// Close code sent to the transport after an abrupt `error_socket`.
pub const GOAWAY_CLOSE_CODE: u16 = 1002;

/// Accepted lengths for the ISO-8601 timestamp carried in an auth frame.
pub const ISO_DATE_SHORT_LEN: usize = 24;
pub const ISO_DATE_LONG_LEN: usize = 27;

/// `access_key` must encode to exactly this many bytes.
pub const ACCESS_KEY_LEN: usize = 20;

/// Size of the random nonce signed into the auth frame.
pub const NONCE_LEN: usize = 8;

/// Size of an HMAC-SHA256 signature.
pub const SIGNATURE_LEN: usize = 32;

/// Default deadline after which a [`ResilientConnection`](crate::resilient::ResilientConnection)
/// that is `expecting_data` treats the silence as a stall.
pub const DEFAULT_FAILURE_DEADLINE: std::time::Duration = std::time::Duration::from_secs(60);

/// Fixed component of the reconnect backoff.
pub const RECONNECT_BACKOFF_BASE: std::time::Duration = std::time::Duration::from_millis(500);

/// Upper bound of the random jitter added on top of [`RECONNECT_BACKOFF_BASE`].
pub const RECONNECT_BACKOFF_JITTER_MAX: std::time::Duration =
    std::time::Duration::from_millis(1000);

/// Depth of the per-stream event channel (data/close/error notifications).
pub const STREAM_EVENT_BUFFER: usize = 64;

/// Depth of the channel used to hand newly-accepted server streams to the user.
pub const ACCEPTED_STREAM_BUFFER: usize = 16;
