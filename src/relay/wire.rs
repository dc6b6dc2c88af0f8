//! Tunnel wire format
//!
//! Every websocket text frame exchanged with a node is a JSON envelope:
//!
//! ```json
//! { "type": "node_request",
//!   "uuid": "0d7f3a5c-5a0e-4f53-9b0a-7f6f2d6c9a11",
//!   "seq": 7,
//!   "message": { "length": 11, "code": 0, "data": "hello world" } }
//! ```
//!
//! The relay sends `node_request` envelopes; nodes answer with
//! `service_response`. `length` must match the byte length of `data`.
//! `seq` numbers each request on a tunnel; a node should copy it into its
//! response. Responses without one are accepted and go to whichever request
//! is waiting.

use serde::{Deserialize, Serialize};

use super::error::WireError;
use crate::registry::Token;

/// Envelope type for requests sent from the relay to a node
pub const NODE_REQUEST: &str = "node_request";

/// Envelope type for responses sent from a node back to the relay
pub const SERVICE_RESPONSE: &str = "service_response";

/// A frame carried over the tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,

    /// Correlation token of the peer's mapping entry
    pub uuid: Token,

    /// Request number within the tunnel
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,

    pub message: Message,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub length: usize,

    /// Status reported by the node; absent means 0
    #[serde(default)]
    pub code: i32,

    pub data: String,
}

impl Envelope {
    pub fn request(token: Token, data: impl Into<String>) -> Self {
        Self::new(NODE_REQUEST, token, 0, data.into())
    }

    pub fn response(token: Token, code: i32, data: impl Into<String>) -> Self {
        Self::new(SERVICE_RESPONSE, token, code, data.into())
    }

    /// Answer `request`, echoing its token and sequence number
    pub fn reply(request: &Envelope, code: i32, data: impl Into<String>) -> Self {
        Self::response(request.uuid, code, data).with_seq(request.seq)
    }

    pub fn with_seq(mut self, seq: Option<u64>) -> Self {
        self.seq = seq;
        self
    }

    fn new(kind: &str, token: Token, code: i32, data: String) -> Self {
        Self {
            kind: kind.to_string(),
            uuid: token,
            seq: None,
            message: Message {
                length: data.len(),
                code,
                data,
            },
        }
    }

    pub fn encode(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a frame and check its declared length
    pub fn decode(text: &str) -> Result<Self, WireError> {
        let envelope: Envelope = serde_json::from_str(text)?;

        let actual = envelope.message.data.len();
        if envelope.message.length != actual {
            return Err(WireError::LengthMismatch {
                declared: envelope.message.length,
                actual,
            });
        }

        Ok(envelope)
    }

    pub fn is_response(&self) -> bool {
        self.kind == SERVICE_RESPONSE
    }
}
