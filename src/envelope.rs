//! JSON request/response envelope carried over stream data frames for
//! callers that speak the higher-level protocol directly instead of raw
//! binary frames, per §6.2.
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use serde::{Deserialize, Serialize};

/// A request sent on a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "camelCase")]
pub enum Request {
    Query {
        query: String,
        format: Option<String>,
    },
    Schema {
        table: Option<String>,
        view: Option<String>,
        suffix: Option<String>,
    },
    Tail {
        table: String,
        since: u64,
    },
    Write {
        table: String,
    },
    Pipe {
        data: String,
    },
    CreateDatabase {
        name: String,
    },
    CreateUser {},
}

/// A response received on a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "response", rename_all = "camelCase")]
pub enum Response {
    Pipe {
        data: String,
    },
    Error {
        msg: String,
    },
    Credentials {
        access_key: String,
        private_key: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_request_roundtrips_through_json() {
        let req = Request::Query {
            query: "select 1".to_string(),
            format: Some("csv".to_string()),
        };
        let json = serde_json::to_string(&req).unwrap();
        let back: Request = serde_json::from_str(&json).unwrap();
        assert_eq!(req, back);
    }

    #[test]
    fn error_response_roundtrips() {
        let resp = Response::Error {
            msg: "nope".to_string(),
        };
        let json = serde_json::to_string(&resp).unwrap();
        let back: Response = serde_json::from_str(&json).unwrap();
        assert_eq!(resp, back);
    }
}
