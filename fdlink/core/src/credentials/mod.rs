//! Credentials
//!
//! Two seams where the RPC layer lets callers hook into a connection:
//!
//! - [`TransportCredentials`] run once per connection, at handshake
//! - [`PerCallCredentials`] run once per call, to produce request metadata
//!
//! The fd adapters implement both seams so descriptor transfer can be
//! layered over any other credentials without the RPC layer knowing.

mod peer;
mod per_call;
mod transport;

use std::sync::Arc;

use async_trait::async_trait;

use crate::conn::{BoxConn, Transceiver};
use crate::rpc::{AuthInfo, CallContext, Metadata, ProtocolInfo, TransportError};
use crate::transceiver::FdTransceiver;

pub use peer::PeerCredCredentials;
pub use per_call::{
    merge_call_options, per_call_credentials_from_options, transceiver_from_per_call,
    CombinedPerCallCredentials, FdPerCallCredentials,
};
pub use transport::{capture_sender, with_transport_credentials, Capturer, FdTransportCredentials};

/// Outcome of a successful handshake
pub struct Handshake {
    /// Connection to use from now on
    pub conn: BoxConn,
    /// What the handshake learned about the peer
    pub auth_info: Option<AuthInfo>,
    /// Descriptor transfer handle, if installed
    pub transceiver: Option<Transceiver>,
}

impl Handshake {
    /// A handshake that changed nothing
    pub fn plain(conn: BoxConn) -> Self {
        Self {
            conn,
            auth_info: None,
            transceiver: None,
        }
    }
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("auth_info", &self.auth_info)
            .field("transceiver", &self.transceiver)
            .finish_non_exhaustive()
    }
}

/// Connection-level credentials
#[async_trait]
pub trait TransportCredentials: Send + Sync {
    /// Authenticate the server on a freshly dialed connection
    async fn client_handshake(
        &self,
        authority: &str,
        conn: BoxConn,
    ) -> Result<Handshake, TransportError>;

    /// Authenticate a freshly accepted client connection
    async fn server_handshake(&self, conn: BoxConn) -> Result<Handshake, TransportError>;

    /// Protocol description
    fn info(&self) -> ProtocolInfo;

    /// Independent copy
    fn box_clone(&self) -> Box<dyn TransportCredentials>;

    /// Name to present and verify during client handshakes
    fn override_server_name(&mut self, name: &str);

    /// Whether these credentials already install descriptor transfer
    fn transfers_fds(&self) -> bool {
        false
    }
}

impl Clone for Box<dyn TransportCredentials> {
    fn clone(&self) -> Self {
        self.box_clone()
    }
}

/// Call-level credentials
#[async_trait]
pub trait PerCallCredentials: Send + Sync {
    /// Metadata to attach to the call described by `ctx`
    async fn request_metadata(
        &self,
        ctx: &CallContext,
        uri: &str,
    ) -> Result<Metadata, TransportError>;

    /// Whether these credentials may only be sent over an authenticated connection
    fn require_transport_security(&self) -> bool;

    /// Descriptor transfer handle these credentials expose, if any
    fn transceiver(&self) -> Option<Arc<dyn FdTransceiver>> {
        None
    }
}

/// Transport credentials that do nothing
#[derive(Clone, Debug, Default)]
pub struct Insecure {
    server_name: Option<String>,
}

#[async_trait]
impl TransportCredentials for Insecure {
    async fn client_handshake(
        &self,
        _authority: &str,
        conn: BoxConn,
    ) -> Result<Handshake, TransportError> {
        Ok(Handshake::plain(conn))
    }

    async fn server_handshake(&self, conn: BoxConn) -> Result<Handshake, TransportError> {
        Ok(Handshake::plain(conn))
    }

    fn info(&self) -> ProtocolInfo {
        ProtocolInfo {
            security_protocol: "insecure".into(),
            server_name: self.server_name.clone(),
        }
    }

    fn box_clone(&self) -> Box<dyn TransportCredentials> {
        Box::new(self.clone())
    }

    fn override_server_name(&mut self, name: &str) {
        self.server_name = Some(name.to_string());
    }
}
