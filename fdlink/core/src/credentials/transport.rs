//! Transport-credential adapter
//!
//! Installs descriptor transfer on every connection that passes through a
//! handshake, then delegates to the wrapped credentials (if any). Capture
//! callbacks receive the send facet as soon as a handshake succeeds on a
//! Unix socket, before any call has been made.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::TransceiverConfig;
use crate::conn::{wrap_conn, BoxConn, Transceiver};
use crate::rpc::{DialOption, ProtocolInfo, TransportError};
use crate::transceiver::FdSender;

use super::{Handshake, TransportCredentials};

/// Callback that receives the send facet of a new connection
pub type Capturer = Arc<dyn Fn(Arc<dyn FdSender>) + Send + Sync>;

/// Transport credentials that add descriptor transfer to a connection
///
/// `inner` may be `None`, meaning no transport security: the handshake then
/// only installs descriptor transfer.
#[derive(Clone)]
pub struct FdTransportCredentials {
    inner: Option<Box<dyn TransportCredentials>>,
    capturers: Vec<Capturer>,
    config: TransceiverConfig,
}

enum Side<'a> {
    Client { authority: &'a str },
    Server,
}

impl FdTransportCredentials {
    /// Wrap `inner` without capture callbacks
    pub fn new(inner: Option<Box<dyn TransportCredentials>>) -> Self {
        Self {
            inner,
            capturers: Vec::new(),
            config: TransceiverConfig::default(),
        }
    }

    /// Wrap `creds` unless they already install descriptor transfer
    ///
    /// Already-wrapped credentials are returned unchanged, including their
    /// capture callbacks.
    pub fn wrap(
        creds: Box<dyn TransportCredentials>,
        capturers: Vec<Capturer>,
    ) -> Box<dyn TransportCredentials> {
        if creds.transfers_fds() {
            return creds;
        }
        Box::new(Self::new(Some(creds)).with_capturers(capturers))
    }

    /// Add capture callbacks
    #[must_use]
    pub fn with_capturers(mut self, capturers: impl IntoIterator<Item = Capturer>) -> Self {
        self.capturers.extend(capturers);
        self
    }

    /// Add one capture callback
    #[must_use]
    pub fn with_capturer(mut self, capturer: Capturer) -> Self {
        self.capturers.push(capturer);
        self
    }

    /// Limits for connections wrapped by these credentials
    #[must_use]
    pub fn with_config(mut self, config: TransceiverConfig) -> Self {
        self.config = config;
        self
    }

    /// Number of registered capture callbacks
    pub fn capturer_count(&self) -> usize {
        self.capturers.len()
    }

    async fn handshake(&self, conn: BoxConn, side: Side<'_>) -> Result<Handshake, TransportError> {
        let (conn, transceiver) = wrap_conn(conn, &self.config);

        let mut handshake = match (&self.inner, side) {
            (Some(inner), Side::Client { authority }) => {
                inner.client_handshake(authority, conn).await?
            }
            (Some(inner), Side::Server) => inner.server_handshake(conn).await?,
            (None, _) => Handshake::plain(conn),
        };

        if let Some(transceiver) = transceiver {
            self.capture(&transceiver);
            handshake.transceiver = Some(transceiver);
        }
        Ok(handshake)
    }

    fn capture(&self, transceiver: &Transceiver) {
        if self.capturers.is_empty() {
            return;
        }
        let sender: Arc<dyn FdSender> = Arc::new(transceiver.clone());
        for capturer in &self.capturers {
            capturer(Arc::clone(&sender));
        }
        tracing::debug!(
            conn_id = %transceiver.conn_id(),
            capturers = self.capturers.len(),
            "Send facet captured"
        );
    }
}

impl std::fmt::Debug for FdTransportCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FdTransportCredentials")
            .field("inner", &self.inner.as_ref().map(|c| c.info()))
            .field("capturers", &self.capturers.len())
            .field("config", &self.config)
            .finish()
    }
}

#[async_trait]
impl TransportCredentials for FdTransportCredentials {
    async fn client_handshake(
        &self,
        authority: &str,
        conn: BoxConn,
    ) -> Result<Handshake, TransportError> {
        self.handshake(conn, Side::Client { authority }).await
    }

    async fn server_handshake(&self, conn: BoxConn) -> Result<Handshake, TransportError> {
        self.handshake(conn, Side::Server).await
    }

    fn info(&self) -> ProtocolInfo {
        self.inner
            .as_ref()
            .map(|inner| inner.info())
            .unwrap_or_default()
    }

    fn box_clone(&self) -> Box<dyn TransportCredentials> {
        Box::new(self.clone())
    }

    fn override_server_name(&mut self, name: &str) {
        if let Some(inner) = self.inner.as_mut() {
            inner.override_server_name(name);
        }
    }

    fn transfers_fds(&self) -> bool {
        true
    }
}

/// Dial option installing descriptor transfer over `creds`
pub fn with_transport_credentials(
    creds: Option<Box<dyn TransportCredentials>>,
    capturers: Vec<Capturer>,
) -> DialOption {
    DialOption::FdTransportCredentials(FdTransportCredentials::new(creds).with_capturers(capturers))
}

/// Register `capturer` on every descriptor-transfer credential in `options`
///
/// Returns the rewritten options and whether any were found. Matching
/// credentials are copied, so `options` itself is unchanged.
pub fn capture_sender(capturer: Capturer, options: &[DialOption]) -> (Vec<DialOption>, bool) {
    let mut found = false;
    let rewritten = options
        .iter()
        .map(|option| match option {
            DialOption::FdTransportCredentials(creds) => {
                found = true;
                DialOption::FdTransportCredentials(
                    creds.clone().with_capturer(Arc::clone(&capturer)),
                )
            }
            other => other.clone(),
        })
        .collect();
    (rewritten, found)
}
