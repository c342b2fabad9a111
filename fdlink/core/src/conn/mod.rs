//! Connection Wrapper
//!
//! Connections handed between the RPC layer and credentials are boxed
//! [`Conn`] trait objects. A connection can take part in descriptor
//! transfer only if it is a Unix domain socket; [`wrap_conn`] checks that
//! through [`Conn::into_unix_stream`] and reports the outcome explicitly:
//!
//! ```text
//! wrap_conn(UnixStream) -> (FdConn,     Some(Transceiver))
//! wrap_conn(FdConn)     -> (same conn,  Some(same Transceiver))
//! wrap_conn(TcpStream)  -> (same conn,  None)
//! ```

pub mod ancillary;
mod fd_conn;
mod state;

use std::io;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::unix::UCred;
use tokio::net::{TcpStream, UnixStream};

use crate::config::TransceiverConfig;

pub use fd_conn::{FdConn, Transceiver};

/// Unique identifier for a connection
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Generate a new random connection ID
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Boxed connection
pub type BoxConn = Box<dyn Conn>;

/// A duplex byte stream plus the capability checks descriptor transfer needs
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Recover the Unix socket behind this connection
    ///
    /// Returns the connection unchanged if it is not a bare Unix socket.
    fn into_unix_stream(self: Box<Self>) -> Result<UnixStream, BoxConn>;

    /// Descriptor transfer handle, if this connection already carries one
    fn transceiver(&self) -> Option<Transceiver> {
        None
    }

    /// Credentials of the peer process, if the transport knows them
    fn peer_cred(&self) -> Option<io::Result<UCred>> {
        None
    }
}

impl Conn for UnixStream {
    fn into_unix_stream(self: Box<Self>) -> Result<UnixStream, BoxConn> {
        Ok(*self)
    }

    fn peer_cred(&self) -> Option<io::Result<UCred>> {
        Some(UnixStream::peer_cred(self))
    }
}

impl Conn for FdConn {
    fn into_unix_stream(self: Box<Self>) -> Result<UnixStream, BoxConn> {
        Err(self)
    }

    fn transceiver(&self) -> Option<Transceiver> {
        (!self.is_closed()).then(|| FdConn::transceiver(self))
    }

    fn peer_cred(&self) -> Option<io::Result<UCred>> {
        self.get_ref().map(UnixStream::peer_cred)
    }
}

impl Conn for TcpStream {
    fn into_unix_stream(self: Box<Self>) -> Result<UnixStream, BoxConn> {
        Err(self)
    }
}

impl Conn for DuplexStream {
    fn into_unix_stream(self: Box<Self>) -> Result<UnixStream, BoxConn> {
        Err(self)
    }
}

/// Install descriptor transfer on a connection if it is a Unix socket
///
/// Wrapping an already wrapped connection returns it unchanged with its
/// existing transceiver.
///
/// # Panics
///
/// Must be called from within a tokio runtime.
pub fn wrap_conn(conn: BoxConn, config: &TransceiverConfig) -> (BoxConn, Option<Transceiver>) {
    if let Some(existing) = conn.transceiver() {
        return (conn, Some(existing));
    }

    match conn.into_unix_stream() {
        Ok(stream) => {
            let conn = FdConn::with_config(stream, config);
            let transceiver = conn.transceiver();
            (Box::new(conn), Some(transceiver))
        }
        Err(conn) => {
            tracing::debug!("Connection is not a Unix socket; descriptor transfer unavailable");
            (conn, None)
        }
    }
}
