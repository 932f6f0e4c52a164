//! DHT RPC datagrams: JSON messages exchanged over a single UDP socket.
//!
//! Requests and responses are matched by a random [`RpcId`]. Every
//! message carries the sender's peer id so the receiving side can
//! refresh its routing table from traffic alone.

use std::fmt;
use std::net::SocketAddr;

use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{ProtoError, Result};
use crate::identity::PeerId;
use crate::limits::{MAX_CONTACTS_PER_RESPONSE, MAX_DHT_VALUE_SIZE, MAX_RPC_PACKET_SIZE};
use crate::PROTOCOL_VERSION;

/// Opaque value bytes rendered as hex inside the JSON datagram.
mod hex_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(
        bytes: &[u8],
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Random 128-bit request/response correlation id.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RpcId([u8; 16]);

impl RpcId {
    /// Generates a fresh random id.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        RpcId(bytes)
    }

    /// Lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses a 32-character hex id.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| ProtoError::InvalidPeerId(e.to_string()))?;
        let arr: [u8; 16] = bytes
            .try_into()
            .map_err(|_| ProtoError::InvalidPeerId("rpc id must be 16 bytes".into()))?;
        Ok(RpcId(arr))
    }
}

impl fmt::Debug for RpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RpcId({}..)", &self.to_hex()[..8])
    }
}

impl Serialize for RpcId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for RpcId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        RpcId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// A peer as carried in RPC responses: id plus dialable address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    /// The peer's id.
    pub peer_id: PeerId,
    /// The address its RPC endpoint answered from.
    pub addr: SocketAddr,
}

/// RPC request kinds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RpcRequest {
    /// Liveness probe.
    Ping,
    /// Return the `k` contacts closest to `target`.
    FindNode {
        /// Lookup target.
        target: PeerId,
    },
    /// Return the value stored under `key`, or the closest contacts.
    FindValue {
        /// Value key.
        key: PeerId,
    },
    /// Store `value` under `key`.
    Store {
        /// Value key.
        key: PeerId,
        /// Opaque value, hex in transit.
        #[serde(with = "hex_bytes")]
        value: Vec<u8>,
    },
    /// Report the address this request arrived from.
    Observe,
}

/// RPC response kinds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RpcResponse {
    /// Ping reply.
    Pong,
    /// Closest contacts known to the responder.
    Nodes {
        /// Closest-first contact list.
        contacts: Vec<Contact>,
    },
    /// The stored value.
    Value {
        /// Opaque value, hex in transit.
        #[serde(with = "hex_bytes")]
        value: Vec<u8>,
    },
    /// Store accepted.
    Stored,
    /// The reflexive address the request arrived from.
    Observed {
        /// Sender's address as seen by the responder.
        addr: SocketAddr,
    },
    /// Request refused.
    Denied {
        /// Human-readable refusal.
        reason: String,
    },
}

/// Either half of an exchange.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcPayload {
    /// A request awaiting a response.
    Request(RpcRequest),
    /// A response to an earlier request.
    Response(RpcResponse),
}

/// One UDP datagram.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcMessage {
    /// Protocol version; mismatches are rejected at decode.
    pub version: u16,
    /// Correlation id.
    pub rpc_id: RpcId,
    /// Sending node.
    pub sender: PeerId,
    /// Request or response.
    pub payload: RpcPayload,
}

impl RpcMessage {
    /// Builds a request datagram with a fresh correlation id.
    pub fn request(sender: PeerId, request: RpcRequest) -> Self {
        RpcMessage {
            version: PROTOCOL_VERSION,
            rpc_id: RpcId::generate(),
            sender,
            payload: RpcPayload::Request(request),
        }
    }

    /// Builds the response datagram for a received request.
    pub fn response(rpc_id: RpcId, sender: PeerId, response: RpcResponse) -> Self {
        RpcMessage {
            version: PROTOCOL_VERSION,
            rpc_id,
            sender,
            payload: RpcPayload::Response(response),
        }
    }

    /// Payload-specific bounds, applied in both directions.
    pub fn validate(&self) -> Result<()> {
        match &self.payload {
            RpcPayload::Request(RpcRequest::Store { value, .. })
            | RpcPayload::Response(RpcResponse::Value { value }) => {
                if value.len() > MAX_DHT_VALUE_SIZE {
                    return Err(ProtoError::PayloadTooLarge {
                        max: MAX_DHT_VALUE_SIZE,
                        actual: value.len(),
                    });
                }
            }
            RpcPayload::Response(RpcResponse::Nodes { contacts }) => {
                if contacts.len() > MAX_CONTACTS_PER_RESPONSE {
                    return Err(ProtoError::PayloadTooLarge {
                        max: MAX_CONTACTS_PER_RESPONSE,
                        actual: contacts.len(),
                    });
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Serializes to a bounded JSON datagram.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.validate()?;
        let bytes = serde_json::to_vec(self)?;
        if bytes.len() > MAX_RPC_PACKET_SIZE {
            return Err(ProtoError::PayloadTooLarge {
                max: MAX_RPC_PACKET_SIZE,
                actual: bytes.len(),
            });
        }
        Ok(bytes)
    }

    /// Parses and validates an inbound datagram.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_RPC_PACKET_SIZE {
            return Err(ProtoError::InputTooLarge {
                max: MAX_RPC_PACKET_SIZE,
                actual: bytes.len(),
            });
        }
        let message: RpcMessage = serde_json::from_slice(bytes)?;
        if message.version != PROTOCOL_VERSION {
            return Err(ProtoError::UnsupportedVersion(message.version));
        }
        message.validate()?;
        Ok(message)
    }
}
