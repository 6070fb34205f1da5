//! Call message types
//!
//! Wire format: one [`Frame`](super::frame::Frame) per direction per stream.
//! - Request frames carry a MessagePack [`RequestEnvelope`]: method name plus
//!   the method's own MessagePack payload as raw bytes
//! - Response frames carry the method's MessagePack response
//! - Error frames carry a UTF-8 message
//!
//! Payloads use named (string-keyed) MessagePack maps, so they are
//! self-describing and need no external schema.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// MessagePack `nil`, what an empty request payload decodes as.
const MSGPACK_NIL: &[u8] = &[0xc0];

// ═══════════════════════════════════════════════════════════════════════════
// Envelope
// ═══════════════════════════════════════════════════════════════════════════

/// Request envelope sent as the single request frame of a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub method: String,
    #[serde(default)]
    pub payload: Bytes,
}

impl RequestEnvelope {
    pub fn new(method: impl Into<String>, payload: Bytes) -> Self {
        Self {
            method: method.into(),
            payload,
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(rmp_serde::to_vec_named(self)?))
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(data)?)
    }
}

/// Encode a method request or response.
pub fn encode_payload<T: Serialize + ?Sized>(value: &T) -> Result<Bytes> {
    Ok(Bytes::from(rmp_serde::to_vec_named(value)?))
}

/// Decode a method request or response. An empty payload decodes as `nil`,
/// so methods whose request is `()` accept both forms.
pub fn decode_payload<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    let data = if data.is_empty() { MSGPACK_NIL } else { data };
    Ok(rmp_serde::from_slice(data)?)
}

// ═══════════════════════════════════════════════════════════════════════════
// Methods
// ═══════════════════════════════════════════════════════════════════════════

/// A typed RPC method: its wire name and the request/response shapes.
pub trait Method {
    const NAME: &'static str;
    type Request: Serialize + DeserializeOwned + Send + Sync + 'static;
    type Response: Serialize + DeserializeOwned + Send + 'static;
}

/// Liveness and version check.
pub struct Ping;

/// ping result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

impl PingResponse {
    /// Response describing this process.
    pub fn local() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            hostname: hostname::get()
                .ok()
                .map(|h| h.to_string_lossy().into_owned()),
        }
    }
}

impl Method for Ping {
    const NAME: &'static str = "ping";
    type Request = ();
    type Response = PingResponse;
}

// ═══════════════════════════════════════════════════════════════════════════
// Filesystem listing payload (opaque to the fabric)
// ═══════════════════════════════════════════════════════════════════════════

/// One directory entry as produced by the remote read-only filesystem view.
///
/// The fabric never builds or inspects these; listings cross a session as
/// opaque bytes via `call_raw`. The type exists so producers and consumers
/// agree on one encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub mode: u32,
    /// Stable identifier of the file across snapshots
    pub stable_id: u64,
    pub nlink: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntryListing {
    pub entries: Vec<DirEntry>,
}

impl DirEntryListing {
    pub fn to_bytes(&self) -> Result<Bytes> {
        encode_payload(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        decode_payload(data)
    }
}
