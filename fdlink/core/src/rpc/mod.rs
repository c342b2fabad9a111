//! RPC Host Layer
//!
//! A small request/response protocol over Unix sockets that hosts the
//! credential adapters. Requests and responses are CRC-checked JSON frames
//! (see [`frame`]); descriptors ride underneath them when the connection
//! was wrapped by [`FdTransportCredentials`](crate::credentials::FdTransportCredentials).
//!
//! # Discovery
//!
//! Code running inside a call finds the connection's transceiver through
//! [`transceiver_from_context`] or [`transceiver_from_peer`]. Code issuing a
//! call before any connection exists uses
//! [`FdPerCallCredentials`](crate::credentials::FdPerCallCredentials).

pub mod client;
pub mod frame;
pub mod server;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::conn::Transceiver;
use crate::credentials::{FdTransportCredentials, PerCallCredentials, TransportCredentials};

pub use client::RpcClient;
pub use frame::{FrameDecoder, MAX_FRAME_SIZE};
pub use server::{Handler, RpcServer};

/// Per-call key/value metadata
pub type Metadata = BTreeMap<String, String>;

/// Errors from the RPC host layer
#[derive(Debug, Error)]
pub enum TransportError {
    /// Could not establish a connection
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The peer closed the connection
    #[error("connection closed")]
    ConnectionClosed,

    /// A request or response could not be written
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Underlying socket error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Handshake or per-call credential check rejected the peer
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// A frame could not be encoded or decoded
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// A frame failed its integrity check
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum carried in the frame header
        expected: u32,
        /// Checksum computed over the payload
        actual: u32,
    },

    /// Operation not valid in the current state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A dial or call deadline passed
    #[error("timed out: {0}")]
    Timeout(String),

    /// The handler returned an error
    #[error("remote error: {0}")]
    Remote(String),
}

/// One call from client to server
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Correlates the response
    pub id: u64,
    /// Method name
    pub method: String,
    /// Metadata produced by per-call credentials
    #[serde(default)]
    pub metadata: Metadata,
    /// Method arguments
    pub body: serde_json::Value,
}

/// Reply to one [`Request`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Id of the request this answers
    pub id: u64,
    /// Handler result, or its error message
    pub outcome: Result<serde_json::Value, String>,
}

/// What a transport credential learned about the peer during handshake
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthInfo {
    /// Credential type that produced this
    pub auth_type: String,
    /// Peer user id, if known
    pub peer_uid: Option<u32>,
    /// Peer process id, if known
    pub peer_pid: Option<i32>,
}

/// Static description of a transport credential
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolInfo {
    /// Security protocol name (empty for none)
    pub security_protocol: String,
    /// Server name used in handshakes
    pub server_name: Option<String>,
}

/// The other end of a connection
#[derive(Clone, Debug)]
pub struct Peer {
    /// Socket path or other address
    pub addr: String,
    /// Handshake result
    pub auth_info: Option<AuthInfo>,
    /// Descriptor transfer handle, if the connection carries one
    pub transceiver: Option<Transceiver>,
}

/// Everything known about the call in progress
#[derive(Clone, Debug)]
pub struct CallContext {
    /// Peer of the connection carrying the call
    pub peer: Option<Peer>,
    /// Method being invoked
    pub method: String,
    /// Request metadata
    pub metadata: Metadata,
}

impl CallContext {
    /// Context for a call on a connection to `peer`
    pub fn new(peer: Peer, method: impl Into<String>) -> Self {
        Self {
            peer: Some(peer),
            method: method.into(),
            metadata: Metadata::new(),
        }
    }
}

/// Transceiver of the connection to `peer`
pub fn transceiver_from_peer(peer: &Peer) -> Option<Transceiver> {
    peer.transceiver.clone()
}

/// Transceiver of the connection carrying the call
pub fn transceiver_from_context(ctx: &CallContext) -> Option<Transceiver> {
    ctx.peer.as_ref().and_then(transceiver_from_peer)
}

/// Options applied when dialing
#[derive(Clone)]
pub enum DialOption {
    /// Handshake with these credentials
    TransportCredentials(Box<dyn TransportCredentials>),
    /// Handshake with descriptor transfer installed
    FdTransportCredentials(FdTransportCredentials),
    /// Per-call credentials applied to every call
    PerCallCredentials(Arc<dyn PerCallCredentials>),
    /// Deadline for connecting and handshaking
    ConnectTimeout(Duration),
}

impl std::fmt::Debug for DialOption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TransportCredentials(c) => f
                .debug_tuple("TransportCredentials")
                .field(&c.info())
                .finish(),
            Self::FdTransportCredentials(c) => {
                f.debug_tuple("FdTransportCredentials").field(c).finish()
            }
            Self::PerCallCredentials(_) => f.write_str("PerCallCredentials(..)"),
            Self::ConnectTimeout(d) => f.debug_tuple("ConnectTimeout").field(d).finish(),
        }
    }
}

/// Options applied to one call
#[derive(Clone)]
pub enum CallOption {
    /// Attach metadata from these credentials
    PerCallCredentials(Arc<dyn PerCallCredentials>),
    /// Deadline for the whole call
    Timeout(Duration),
}

impl std::fmt::Debug for CallOption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PerCallCredentials(_) => f.write_str("PerCallCredentials(..)"),
            Self::Timeout(d) => f.debug_tuple("Timeout").field(d).finish(),
        }
    }
}
