//! Auth frame construction, per §4.6: an HMAC-SHA256 signature over
//! `"auth" || accessKey || isoDate || base64(nonce)`, carried either as the
//! binary [`Frame::Auth`] used to open a `MuxedSocket`, or as a JSON
//! credentials envelope for callers that speak the JSON protocol directly.
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::config::{
    ACCESS_KEY_LEN, AUTH_VERSION, ISO_DATE_LONG_LEN, ISO_DATE_SHORT_LEN, NONCE_LEN,
};
use crate::frame::Frame;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Errors building an auth frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("access key must be exactly {ACCESS_KEY_LEN} bytes, got {0}")]
    AccessKeyLength(usize),
    #[error("private key is not valid for HMAC-SHA256")]
    InvalidPrivateKey,
}

/// Credentials used to authenticate a `MuxedSocket`.
#[derive(Clone)]
pub struct Credentials {
    pub access_key: String,
    pub private_key: Vec<u8>,
    pub device_uuid: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("private_key", &"<redacted>")
            .field("device_uuid", &self.device_uuid)
            .finish()
    }
}

/// ISO-8601 timestamp formatted the way the auth signature expects: either
/// the 24-char millisecond form or the 27-char microsecond form, both ending
/// in `Z`. Picks whichever `chrono`'s default sub-second precision yields.
fn format_iso_date(now: DateTime<Utc>) -> String {
    let s = now.to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
    debug_assert_eq!(s.len(), ISO_DATE_SHORT_LEN);
    s
}

/// Build the binary `Auth` frame signed for `creds` at time `now`.
pub fn build_auth_frame(creds: &Credentials, now: DateTime<Utc>) -> Result<Frame, Error> {
    let access_key = creds.access_key.as_bytes();
    let (nonce, iso_date, signature) = sign_now(creds, now)?;

    Ok(Frame::Auth {
        version: AUTH_VERSION,
        access_key: bytes::Bytes::copy_from_slice(access_key),
        nonce,
        signature,
        iso_date,
    })
}

/// JSON form of an auth request for the legacy request/response path
/// (§6.2), carrying the same signed fields as [`Frame::Auth`] plus
/// `device_uuid`, which the binary frame has no room for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthEnvelope {
    pub request: String,
    pub access_key: String,
    pub date: String,
    pub nonce: String,
    pub signature: String,
    pub device_uuid: String,
}

/// Build the JSON-envelope form of an auth request, signed the same way as
/// [`build_auth_frame`], for callers that speak the JSON protocol directly.
pub fn build_auth_envelope(
    creds: &Credentials,
    now: DateTime<Utc>,
) -> Result<serde_json::Value, Error> {
    let (nonce, iso_date, signature) = sign_now(creds, now)?;

    let envelope = AuthEnvelope {
        request: "auth".to_string(),
        access_key: creds.access_key.clone(),
        date: iso_date,
        nonce: BASE64.encode(nonce),
        signature: BASE64.encode(signature),
        device_uuid: creds.device_uuid.clone(),
    };
    Ok(serde_json::to_value(envelope).expect("AuthEnvelope always serializes"))
}

/// Validate `creds`, draw a fresh nonce, format `now`, and sign them all
/// together: the common prelude shared by the binary and JSON auth forms.
fn sign_now(
    creds: &Credentials,
    now: DateTime<Utc>,
) -> Result<([u8; NONCE_LEN], String, [u8; 32]), Error> {
    let access_key = creds.access_key.as_bytes();
    if access_key.len() != ACCESS_KEY_LEN {
        return Err(Error::AccessKeyLength(access_key.len()));
    }

    let mut nonce = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut nonce);

    let iso_date = format_iso_date(now);
    if !matches!(iso_date.len(), ISO_DATE_SHORT_LEN | ISO_DATE_LONG_LEN) {
        unreachable!("format_iso_date always produces a 24- or 27-char timestamp");
    }

    let signature = sign(&creds.private_key, access_key, &iso_date, &nonce)?;
    Ok((nonce, iso_date, signature))
}

fn sign(
    private_key: &[u8],
    access_key: &[u8],
    iso_date: &str,
    nonce: &[u8; NONCE_LEN],
) -> Result<[u8; 32], Error> {
    let mut mac = HmacSha256::new_from_slice(private_key).map_err(|_| Error::InvalidPrivateKey)?;
    mac.update(b"auth");
    mac.update(access_key);
    mac.update(iso_date.as_bytes());
    mac.update(BASE64.encode(nonce).as_bytes());
    let tag = mac.finalize().into_bytes();
    let mut out = [0u8; 32];
    out.copy_from_slice(&tag);
    Ok(out)
}

/// Verify an incoming auth frame's signature against `private_key`. Used by
/// test fakes and any server-role peer; the client role only ever builds and
/// sends, never verifies.
pub fn verify(private_key: &[u8], frame: &Frame) -> Result<bool, Error> {
    let Frame::Auth {
        access_key,
        nonce,
        signature,
        iso_date,
        ..
    } = frame
    else {
        return Ok(false);
    };
    let expected = sign(private_key, access_key, iso_date, nonce)?;
    Ok(expected == *signature)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> Credentials {
        Credentials {
            access_key: "ABCDEFGHIJKLMNOPQRST".to_string(),
            private_key: b"super-secret-key".to_vec(),
            device_uuid: "device-1".to_string(),
        }
    }

    #[test]
    fn rejects_wrong_length_access_key() {
        let mut c = creds();
        c.access_key = "short".to_string();
        assert_eq!(
            build_auth_frame(&c, Utc::now()),
            Err(Error::AccessKeyLength(5))
        );
    }

    #[test]
    fn builds_and_verifies() {
        let c = creds();
        let frame = build_auth_frame(&c, Utc::now()).unwrap();
        assert!(verify(&c.private_key, &frame).unwrap());
    }

    #[test]
    fn tampered_signature_fails_verification() {
        let c = creds();
        let mut frame = build_auth_frame(&c, Utc::now()).unwrap();
        if let Frame::Auth { signature, .. } = &mut frame {
            signature[0] ^= 0xFF;
        }
        assert!(!verify(&c.private_key, &frame).unwrap());
    }

    #[test]
    fn wrong_key_fails_verification() {
        let c = creds();
        let frame = build_auth_frame(&c, Utc::now()).unwrap();
        assert!(!verify(b"wrong-key", &frame).unwrap());
    }

    #[test]
    fn iso_date_is_24_chars() {
        let c = creds();
        let frame = build_auth_frame(&c, Utc::now()).unwrap();
        let Frame::Auth { iso_date, .. } = frame else {
            panic!("expected auth frame")
        };
        assert_eq!(iso_date.len(), ISO_DATE_SHORT_LEN);
    }

    #[test]
    fn envelope_carries_camel_case_fields_and_device_uuid() {
        let c = creds();
        let value = build_auth_envelope(&c, Utc::now()).unwrap();
        assert_eq!(value["request"], "auth");
        assert_eq!(value["accessKey"], c.access_key);
        assert_eq!(value["deviceUuid"], c.device_uuid);
        assert!(value["nonce"].is_string());
        assert!(value["signature"].is_string());
        assert!(value["date"].is_string());
    }

    #[test]
    fn envelope_rejects_wrong_length_access_key() {
        let mut c = creds();
        c.access_key = "short".to_string();
        assert_eq!(
            build_auth_envelope(&c, Utc::now()),
            Err(Error::AccessKeyLength(5))
        );
    }
}
