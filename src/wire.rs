// Copyright 2019 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! The JSON-object envelope used on the multicast socket. `data` is kept
//! opaque (`serde_json::Value`) here: parsing it into something meaningful
//! is the job of the (out-of-scope) per-command helpers, not the transport.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The only object ever sent or received on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub msg_type: String,
    pub seq: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Envelope {
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        msg_type: impl Into<String>,
        seq: u32,
        data: Option<serde_json::Value>,
    ) -> Self {
        Envelope {
            from: from.into(),
            to: to.into(),
            msg_type: msg_type.into(),
            seq,
            data,
        }
    }

    /// Kinds beginning with `!` are control messages (`!whois`, `!assign`,
    /// `!reset`); everything else is an application command or reply.
    pub fn is_control(&self) -> bool {
        is_control_type(&self.msg_type)
    }
}

/// Same predicate as [`Envelope::is_control`], usable before a message is
/// constructed (e.g. to decide which seq generator to use).
pub fn is_control_type(msg_type: &str) -> bool {
    msg_type.starts_with('!')
}

/// Failure to decode an inbound datagram, or a datagram too large to encode.
/// Never escapes [`crate::transport::Transport`]/[`crate::host::Host`]: it is
/// logged and the datagram is dropped.
#[derive(Debug)]
pub enum CodecError {
    Malformed(serde_json::Error),
    TooLarge { len: usize, max: usize },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Malformed(e) => write!(f, "malformed envelope: {}", e),
            CodecError::TooLarge { len, max } => {
                write!(f, "envelope too large: {} bytes (max {})", len, max)
            }
        }
    }
}

impl std::error::Error for CodecError {}

/// Encode an envelope as compact JSON, rejecting output larger than `max_datagram`.
pub fn encode(envelope: &Envelope, max_datagram: usize) -> Result<Vec<u8>, CodecError> {
    let bytes = serde_json::to_vec(envelope).map_err(CodecError::Malformed)?;
    if bytes.len() > max_datagram {
        return Err(CodecError::TooLarge {
            len: bytes.len(),
            max: max_datagram,
        });
    }
    Ok(bytes)
}

/// Decode a datagram into an [`Envelope`]. Datagrams above `max_datagram` are
/// dropped per `spec.md` invariant 4, without ever being parsed. Unknown
/// top-level keys are tolerated (serde ignores them by default).
pub fn decode(bytes: &[u8], max_datagram: usize) -> Result<Envelope, CodecError> {
    if bytes.len() > max_datagram {
        return Err(CodecError::TooLarge {
            len: bytes.len(),
            max: max_datagram,
        });
    }
    serde_json::from_slice(bytes).map_err(CodecError::Malformed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_full_envelope() {
        let e = Envelope::new("host_abc", "host_abc_g1", "status", 42, Some(json!({"code": 0})));
        let bytes = encode(&e, 1024).unwrap();
        let back = decode(&bytes, 1024).unwrap();
        assert_eq!(e, back);
    }

    #[test]
    fn omits_data_key_when_none() {
        let e = Envelope::new("h", "g", "!whois", 1, None);
        let bytes = encode(&e, 1024).unwrap();
        let s = String::from_utf8(bytes).unwrap();
        assert!(!s.contains("\"data\""));
    }

    #[test]
    fn rejects_missing_required_keys() {
        let bad = br#"{"from":"h","to":"g","type":"status"}"#; // missing seq
        assert!(decode(bad, 1024).is_err());
    }

    #[test]
    fn tolerates_unknown_top_level_keys() {
        let extra = br#"{"from":"h","to":"g","type":"status","seq":1,"extra":true}"#;
        let env = decode(extra, 1024).unwrap();
        assert_eq!(env.seq, 1);
    }

    #[test]
    fn rejects_oversize_datagrams() {
        let e = Envelope::new("h", "g", "status", 1, Some(json!({"pad": "x".repeat(100)})));
        let bytes = serde_json::to_vec(&e).unwrap();
        assert!(decode(&bytes, 10).is_err());
        assert!(encode(&e, 10).is_err());
    }

    #[test]
    fn control_type_prefix() {
        assert!(is_control_type("!whois"));
        assert!(!is_control_type("ubus"));
    }
}
