//! Binary frame codec.
//!
//! All multi-byte integers are big-endian. The first 32-bit word of every
//! frame packs the type tag into the high 8 bits and, for stream-scoped
//! frames, the stream id into the low 24 bits.
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::config::MAX_STREAM_ID;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Errors produced while decoding a frame off the wire.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("frame shorter than the minimum length for its type")]
    Truncated,
    #[error("goaway/reset message is not valid UTF-8")]
    InvalidUtf8,
    #[error("auth frame carries an ISO date of invalid length {0}")]
    InvalidDateLength(usize),
}

/// The five wire message types. Unknown tags are not represented here: the
/// dispatcher treats any tag outside this set as unrecognized and drops it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Auth = 0,
    Goaway = 1,
    Data = 2,
    Close = 3,
    Reset = 4,
}

impl OpCode {
    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Auth),
            1 => Some(Self::Goaway),
            2 => Some(Self::Data),
            3 => Some(Self::Close),
            4 => Some(Self::Reset),
            _ => None,
        }
    }
}

/// A decoded frame. `Auth` is only ever produced by the client and only ever
/// *rejected* when received by the client (the server never sends one); it is
/// still represented here because the codec is agnostic to who is decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Auth {
        version: u8,
        access_key: Bytes,
        nonce: [u8; crate::config::NONCE_LEN],
        signature: [u8; crate::config::SIGNATURE_LEN],
        iso_date: String,
    },
    Goaway {
        last_stream: u32,
        error_code: u32,
        message: String,
    },
    Data {
        stream_id: u32,
        payload: Bytes,
    },
    Close {
        stream_id: u32,
    },
    Reset {
        stream_id: u32,
        error_code: u32,
        message: String,
    },
}

impl Frame {
    /// Encode this frame to its wire representation.
    ///
    /// # Panics
    /// Panics if a stream-scoped frame carries a `stream_id >= 2^24`: callers
    /// never construct such an id, so this is a programmer error rather than
    /// a recoverable condition.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        match self {
            Self::Auth {
                version,
                access_key,
                nonce,
                signature,
                iso_date,
            } => encode_auth(*version, access_key, nonce, signature, iso_date),
            Self::Goaway {
                last_stream,
                error_code,
                message,
            } => {
                assert!(*last_stream <= MAX_STREAM_ID, "stream id out of range");
                let mut buf = BytesMut::with_capacity(16 + message.len());
                buf.put_u32(u32::from(OpCode::Goaway as u8) << 24);
                buf.put_u32(*last_stream);
                buf.put_u32(*error_code);
                buf.put_u32(message.len() as u32);
                buf.put_slice(message.as_bytes());
                buf.freeze()
            }
            Self::Data { stream_id, payload } => {
                assert!(*stream_id <= MAX_STREAM_ID, "stream id out of range");
                let mut buf = BytesMut::with_capacity(4 + payload.len());
                buf.put_u32((u32::from(OpCode::Data as u8) << 24) | stream_id);
                buf.put_slice(payload);
                buf.freeze()
            }
            Self::Close { stream_id } => {
                assert!(*stream_id <= MAX_STREAM_ID, "stream id out of range");
                let mut buf = BytesMut::with_capacity(4);
                buf.put_u32((u32::from(OpCode::Close as u8) << 24) | stream_id);
                buf.freeze()
            }
            Self::Reset {
                stream_id,
                error_code,
                message,
            } => {
                assert!(*stream_id <= MAX_STREAM_ID, "stream id out of range");
                let mut buf = BytesMut::with_capacity(12 + message.len());
                buf.put_u32((u32::from(OpCode::Reset as u8) << 24) | stream_id);
                buf.put_u32(*error_code);
                buf.put_u32(message.len() as u32);
                buf.put_slice(message.as_bytes());
                buf.freeze()
            }
        }
    }

    /// Decode a single frame from a full wire message.
    ///
    /// Returns `Ok(None)` for an unrecognized type tag: per the decode
    /// policy, these are silently discarded by the caller rather than
    /// surfaced as an error.
    pub fn decode(mut data: Bytes) -> Result<Option<Self>, Error> {
        if data.len() < 4 {
            return Err(Error::Truncated);
        }
        let head = (&data[..4]).get_u32();
        let tag = (head >> 24) as u8;
        let Some(opcode) = OpCode::from_tag(tag) else {
            return Ok(None);
        };
        let stream_id = head & MAX_STREAM_ID;
        data.advance(4);
        let frame = match opcode {
            OpCode::Auth => decode_auth(data)?,
            OpCode::Goaway => {
                if data.len() < 12 {
                    return Err(Error::Truncated);
                }
                let last_stream = data.get_u32();
                let error_code = data.get_u32();
                let msg_len = data.get_u32() as usize;
                if data.len() < msg_len {
                    return Err(Error::Truncated);
                }
                let message = String::from_utf8(data.split_to(msg_len).to_vec())
                    .map_err(|_| Error::InvalidUtf8)?;
                Self::Goaway {
                    last_stream,
                    error_code,
                    message,
                }
            }
            OpCode::Data => Self::Data {
                stream_id,
                payload: data,
            },
            OpCode::Close => Self::Close { stream_id },
            OpCode::Reset => {
                if data.len() < 8 {
                    return Err(Error::Truncated);
                }
                let error_code = data.get_u32();
                let msg_len = data.get_u32() as usize;
                if data.len() < msg_len {
                    return Err(Error::Truncated);
                }
                let message = String::from_utf8(data.split_to(msg_len).to_vec())
                    .map_err(|_| Error::InvalidUtf8)?;
                Self::Reset {
                    stream_id,
                    error_code,
                    message,
                }
            }
        };
        Ok(Some(frame))
    }
}

/// Offset of the "27-char date used" flag byte within an auth frame.
const AUTH_LONG_DATE_FLAG_OFFSET: usize = 68;
/// Offset at which the ISO date begins.
const AUTH_DATE_OFFSET: usize = 69;
/// Total length of an auth frame carrying the 24-char date form.
const AUTH_SHORT_FRAME_LEN: usize = 93;

fn encode_auth(
    version: u8,
    access_key: &Bytes,
    nonce: &[u8; crate::config::NONCE_LEN],
    signature: &[u8; crate::config::SIGNATURE_LEN],
    iso_date: &str,
) -> Bytes {
    let is_long = iso_date.len() == crate::config::ISO_DATE_LONG_LEN;
    let total_len = AUTH_DATE_OFFSET + iso_date.len();
    let mut buf = BytesMut::with_capacity(total_len.max(AUTH_SHORT_FRAME_LEN));
    buf.put_u32(u32::from(OpCode::Auth as u8) << 24);
    buf.put_u8(version);
    buf.put_bytes(0, 3); // pad offsets 5..8
    buf.put_slice(access_key);
    buf.put_slice(nonce);
    buf.put_slice(signature);
    buf.put_u8(u8::from(is_long));
    buf.put_slice(iso_date.as_bytes());
    buf.freeze()
}

fn decode_auth(data: Bytes) -> Result<Frame, Error> {
    if data.len() < AUTH_SHORT_FRAME_LEN - 4 {
        return Err(Error::Truncated);
    }
    // `data` starts right after the first 4-byte word, so offsets below are
    // shifted by -4 relative to the wire layout documented on `Frame::Auth`.
    let version = data[0];
    let access_key = data.slice(4..4 + crate::config::ACCESS_KEY_LEN);
    let mut nonce = [0u8; crate::config::NONCE_LEN];
    nonce.copy_from_slice(&data[24..24 + crate::config::NONCE_LEN]);
    let sig_start = 24 + crate::config::NONCE_LEN;
    let mut signature = [0u8; crate::config::SIGNATURE_LEN];
    signature.copy_from_slice(&data[sig_start..sig_start + crate::config::SIGNATURE_LEN]);
    let flag_offset = AUTH_LONG_DATE_FLAG_OFFSET - 4;
    let date_offset = AUTH_DATE_OFFSET - 4;
    let is_long = data[flag_offset] == 1;
    let date_len = if is_long {
        crate::config::ISO_DATE_LONG_LEN
    } else {
        crate::config::ISO_DATE_SHORT_LEN
    };
    if data.len() < date_offset + date_len {
        return Err(Error::Truncated);
    }
    let iso_date = String::from_utf8(data[date_offset..date_offset + date_len].to_vec())
        .map_err(|_| Error::InvalidUtf8)?;
    Ok(Frame::Auth {
        version,
        access_key,
        nonce,
        signature,
        iso_date,
    })
}

impl Frame {
    #[cfg(test)]
    fn iso_date_len(&self) -> usize {
        match self {
            Self::Auth { iso_date, .. } => iso_date.len(),
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) {
        let encoded = frame.encode();
        let decoded = Frame::decode(encoded).unwrap().expect("known type tag");
        assert_eq!(frame, decoded);
    }

    #[test]
    fn data_frame_roundtrips() {
        roundtrip(Frame::Data {
            stream_id: 5,
            payload: Bytes::from_static(b"hello"),
        });
    }

    #[test]
    fn close_frame_roundtrips() {
        roundtrip(Frame::Close { stream_id: 3 });
    }

    #[test]
    fn reset_frame_roundtrips() {
        roundtrip(Frame::Reset {
            stream_id: 9,
            error_code: 42,
            message: "bye".to_string(),
        });
    }

    #[test]
    fn goaway_frame_roundtrips() {
        roundtrip(Frame::Goaway {
            last_stream: 5,
            error_code: 42,
            message: "bye".to_string(),
        });
    }

    #[test]
    fn max_stream_id_encodes() {
        roundtrip(Frame::Close {
            stream_id: MAX_STREAM_ID,
        });
    }

    #[test]
    #[should_panic(expected = "stream id out of range")]
    fn over_max_stream_id_panics() {
        let _ = Frame::Close {
            stream_id: MAX_STREAM_ID + 1,
        }
        .encode();
    }

    #[test]
    fn auth_frame_roundtrips_short_date() {
        roundtrip(Frame::Auth {
            version: 0,
            access_key: Bytes::from_static(b"ABCDEFGHIJKLMNOPQRST"),
            nonce: [0, 1, 2, 3, 4, 5, 6, 7],
            signature: [7u8; 32],
            iso_date: "2024-01-02T03:04:05.678Z".to_string(), // 24 chars
        });
    }

    #[test]
    fn auth_frame_exact_bytes() {
        let frame = Frame::Auth {
            version: 0,
            access_key: Bytes::from_static(b"ABCDEFGHIJKLMNOPQRST"),
            nonce: [0, 1, 2, 3, 4, 5, 6, 7],
            signature: [9u8; 32],
            iso_date: "2024-01-02T03:04:05.678Z".to_string(),
        };
        assert_eq!(frame.iso_date_len(), 24);
        let encoded = frame.encode();
        assert_eq!(encoded.len(), AUTH_SHORT_FRAME_LEN);
        assert_eq!(encoded[0], 0);
        assert_eq!(encoded[4], 0);
        assert_eq!(&encoded[8..28], &b"ABCDEFGHIJKLMNOPQRST"[..]);
        assert_eq!(&encoded[28..36], &[0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(&encoded[36..68], &[9u8; 32][..]);
        assert_eq!(encoded[68], 0);
        assert_eq!(&encoded[69..93], b"2024-01-02T03:04:05.678Z".as_slice());
    }

    #[test]
    fn auth_frame_long_date_sets_flag() {
        let frame = Frame::Auth {
            version: 0,
            access_key: Bytes::from_static(b"ABCDEFGHIJKLMNOPQRST"),
            nonce: [0u8; 8],
            signature: [0u8; 32],
            iso_date: "2024-01-02T03:04:05.678000Z".to_string(), // 27 chars
        };
        let encoded = frame.encode();
        assert_eq!(encoded.len(), 96);
        assert_eq!(encoded[68], 1);
    }

    #[test]
    fn unknown_tag_decodes_to_none() {
        let mut buf = BytesMut::new();
        buf.put_u32(0xFF << 24);
        assert_eq!(Frame::decode(buf.freeze()).unwrap(), None);
    }
}
