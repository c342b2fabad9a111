//! fdlink Core - File Descriptor Transfer Beneath an RPC Transport
//!
//! Lets two processes connected over a Unix domain socket exchange open
//! file descriptors alongside their RPC traffic. Descriptors are matched
//! between sender and receiver by the `(device, inode)` identity of the
//! object they refer to, so a receiver can ask for a descriptor before it
//! has arrived.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         Callers                                  │
//! │   send_path / send_file / send_fd        recv_fd / recv_file     │
//! └───────────────┬──────────────────────────────────┬───────────────┘
//!                 │                                  │
//! ┌───────────────┴──────────┐        ┌──────────────┴───────────────┐
//! │  FdPerCallCredentials    │        │  Peer / CallContext          │
//! │  (before the connection) │        │  (after the handshake)       │
//! └───────────────┬──────────┘        └──────────────┬───────────────┘
//!                 └────────────────┬─────────────────┘
//!                                  │ Transceiver
//! ┌────────────────────────────────┴─────────────────────────────────┐
//! │  FdConn: send executor ─► sendmsg(SCM_RIGHTS) ─► Unix socket     │
//! │          recv executor ◄─ recvmsg(SCM_RIGHTS) ◄─                 │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`Identity`]: `(device, inode)` and its `inode://dev/ino` locator
//! - [`FdSender`] / [`FdReceiver`]: the two capability facets
//! - [`Transceiver`]: both facets for one connection
//! - [`Receipt`]: one-shot result of every send or receive
//! - [`FdTransportCredentials`]: installs descriptor transfer at handshake
//! - [`FdPerCallCredentials`]: descriptor transfer for code issuing a call
//!
//! # Module Overview
//!
//! - [`identity`]: identities and locators
//! - [`error`]: descriptor transfer errors
//! - [`receipt`]: one-shot result channels
//! - [`executor`]: serialized single-worker executor
//! - [`transceiver`]: capability traits
//! - [`conn`]: connection wrapper and ancillary socket I/O
//! - [`credentials`]: transport and per-call credential adapters
//! - [`rpc`]: framed request/response host layer
//! - [`config`]: limits and socket location

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

#[cfg(not(unix))]
compile_error!("fdlink-core requires a Unix platform");

pub mod config;
pub mod conn;
pub mod credentials;
pub mod error;
pub mod executor;
pub mod identity;
pub mod receipt;
pub mod rpc;
pub mod transceiver;

pub use config::{default_socket_path, ConfigError, TransceiverConfig};
pub use conn::{wrap_conn, BoxConn, Conn, ConnectionId, FdConn, Transceiver};
pub use credentials::{
    capture_sender, merge_call_options, per_call_credentials_from_options,
    transceiver_from_per_call, with_transport_credentials, Capturer, CombinedPerCallCredentials,
    FdPerCallCredentials, FdTransportCredentials, Handshake, Insecure, PeerCredCredentials,
    PerCallCredentials, TransportCredentials,
};
pub use error::FdError;
pub use executor::{Completion, ExecutorClosed, SerialExecutor};
pub use identity::{locator_of_fd, locator_of_path, Identity, LOCATOR_SCHEME};
pub use receipt::{FdReceipt, FileReceipt, Receipt, Resolver, SendReceipt};
pub use rpc::{
    transceiver_from_context, transceiver_from_peer, AuthInfo, CallContext, CallOption,
    DialOption, Handler, Metadata, Peer, ProtocolInfo, RpcClient, RpcServer, TransportError,
};
pub use transceiver::{open_path, FdReceiver, FdSender, FdTransceiver};
