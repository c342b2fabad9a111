//! Same-user transport credentials
//!
//! Uses `SO_PEERCRED` to verify the process on the other end of a Unix
//! socket runs as the same user.

use async_trait::async_trait;

use crate::conn::BoxConn;
use crate::rpc::{AuthInfo, ProtocolInfo, TransportError};

use super::{Handshake, TransportCredentials};

const AUTH_TYPE: &str = "peercred";

/// Accepts only peers running under this process's UID
#[derive(Clone, Debug, Default)]
pub struct PeerCredCredentials {
    server_name: Option<String>,
}

impl PeerCredCredentials {
    /// Create same-user credentials
    pub fn new() -> Self {
        Self::default()
    }

    fn validate(conn: BoxConn) -> Result<Handshake, TransportError> {
        let cred = match conn.peer_cred() {
            Some(Ok(cred)) => cred,
            Some(Err(e)) => {
                return Err(TransportError::AuthenticationFailed(format!(
                    "failed to get peer credentials: {e}"
                )))
            }
            None => {
                return Err(TransportError::AuthenticationFailed(
                    "connection does not report peer credentials".to_string(),
                ))
            }
        };

        // SAFETY: getuid has no preconditions and cannot fail.
        let my_uid = unsafe { libc::getuid() };
        if cred.uid() != my_uid {
            tracing::warn!(
                peer_uid = cred.uid(),
                my_uid,
                "Rejecting connection from different user"
            );
            return Err(TransportError::AuthenticationFailed(format!(
                "peer UID {} does not match UID {my_uid}",
                cred.uid()
            )));
        }

        tracing::debug!(peer_uid = cred.uid(), peer_pid = ?cred.pid(), "Peer validated");
        Ok(Handshake {
            conn,
            auth_info: Some(AuthInfo {
                auth_type: AUTH_TYPE.to_string(),
                peer_uid: Some(cred.uid()),
                peer_pid: cred.pid(),
            }),
            transceiver: None,
        })
    }
}

#[async_trait]
impl TransportCredentials for PeerCredCredentials {
    async fn client_handshake(
        &self,
        _authority: &str,
        conn: BoxConn,
    ) -> Result<Handshake, TransportError> {
        Self::validate(conn)
    }

    async fn server_handshake(&self, conn: BoxConn) -> Result<Handshake, TransportError> {
        Self::validate(conn)
    }

    fn info(&self) -> ProtocolInfo {
        ProtocolInfo {
            security_protocol: AUTH_TYPE.to_string(),
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
