//! RPC Client
//!
//! Dials a Unix socket, runs the configured transport handshake, and issues
//! calls one at a time over the resulting connection.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use tokio::net::UnixStream;
use tokio::sync::Mutex;

use crate::conn::{BoxConn, Transceiver};
use crate::credentials::{
    merge_call_options, per_call_credentials_from_options, Handshake, TransportCredentials,
};

use super::frame::{read_frame, write_frame, FrameDecoder};
use super::{CallContext, CallOption, DialOption, Peer, Request, Response, TransportError};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(5000);

struct ClientConn {
    conn: BoxConn,
    decoder: FrameDecoder,
}

/// Client end of one RPC connection
pub struct RpcClient {
    conn: Mutex<ClientConn>,
    peer: Peer,
    default_call_options: Vec<CallOption>,
    next_id: AtomicU64,
}

impl RpcClient {
    /// Connect to `path` and handshake
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Timeout`] if connecting and handshaking
    /// take longer than the connect timeout, otherwise the connect or
    /// handshake error.
    pub async fn dial(
        path: impl AsRef<Path>,
        options: Vec<DialOption>,
    ) -> Result<Self, TransportError> {
        let path = path.as_ref();
        let mut credentials: Option<Box<dyn TransportCredentials>> = None;
        let mut connect_timeout = DEFAULT_CONNECT_TIMEOUT;
        let mut default_call_options = Vec::new();

        for option in options {
            match option {
                DialOption::TransportCredentials(c) => credentials = Some(c),
                DialOption::FdTransportCredentials(c) => credentials = Some(Box::new(c)),
                DialOption::PerCallCredentials(c) => {
                    default_call_options.push(CallOption::PerCallCredentials(c));
                }
                DialOption::ConnectTimeout(d) => connect_timeout = d,
            }
        }

        let authority = path.display().to_string();
        let handshake = tokio::time::timeout(
            connect_timeout,
            Self::connect(path, &authority, credentials.as_deref()),
        )
        .await
        .map_err(|_| {
            TransportError::Timeout(format!("connecting to {authority} after {connect_timeout:?}"))
        })??;

        tracing::info!(
            path = %authority,
            fd_transfer = handshake.transceiver.is_some(),
            "Connected"
        );

        Ok(Self {
            conn: Mutex::new(ClientConn {
                conn: handshake.conn,
                decoder: FrameDecoder::new(),
            }),
            peer: Peer {
                addr: authority,
                auth_info: handshake.auth_info,
                transceiver: handshake.transceiver,
            },
            default_call_options,
            next_id: AtomicU64::new(1),
        })
    }

    async fn connect(
        path: &Path,
        authority: &str,
        credentials: Option<&dyn TransportCredentials>,
    ) -> Result<Handshake, TransportError> {
        let stream = UnixStream::connect(path).await.map_err(|e| {
            TransportError::ConnectionFailed(format!("failed to connect to {authority}: {e}"))
        })?;
        match credentials {
            Some(creds) => creds.client_handshake(authority, Box::new(stream)).await,
            None => Ok(Handshake::plain(Box::new(stream))),
        }
    }

    /// The server this client is connected to
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Descriptor transfer handle for this connection, if installed
    pub fn transceiver(&self) -> Option<&Transceiver> {
        self.peer.transceiver.as_ref()
    }

    /// Invoke `method` and decode its result
    ///
    /// Per-call credentials from the dial options and from `options` are
    /// combined and asked for metadata before the request is written.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Remote`] if the handler failed, or the
    /// credential, I/O, serialization, or timeout error.
    pub async fn call<Req, Resp>(
        &self,
        method: &str,
        body: &Req,
        options: &[CallOption],
    ) -> Result<Resp, TransportError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let mut all = self.default_call_options.clone();
        all.extend_from_slice(options);
        let options = merge_call_options(all);

        let timeout = options.iter().rev().find_map(|o| match o {
            CallOption::Timeout(d) => Some(*d),
            CallOption::PerCallCredentials(_) => None,
        });

        let mut ctx = CallContext::new(self.peer.clone(), method);
        if let Some(creds) = per_call_credentials_from_options(&options) {
            if creds.require_transport_security() && self.peer.auth_info.is_none() {
                return Err(TransportError::AuthenticationFailed(
                    "per-call credentials require an authenticated connection".to_string(),
                ));
            }
            let uri = format!("{}/{method}", self.peer.addr);
            ctx.metadata = creds.request_metadata(&ctx, &uri).await?;
        }

        let request = Request {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method: method.to_string(),
            metadata: ctx.metadata,
            body: serde_json::to_value(body)
                .map_err(|e| TransportError::SerializationError(e.to_string()))?,
        };

        let response = self.round_trip(request, timeout).await?;

        match response.outcome {
            Ok(value) => serde_json::from_value(value)
                .map_err(|e| TransportError::SerializationError(e.to_string())),
            Err(message) => Err(TransportError::Remote(message)),
        }
    }

    /// Write `request` and wait for the response with its id
    ///
    /// `timeout` covers only the wait for the response. The request frame
    /// is always written whole, so an expired call leaves nothing but a
    /// stale response behind, which the next call skips.
    async fn round_trip(
        &self,
        request: Request,
        timeout: Option<Duration>,
    ) -> Result<Response, TransportError> {
        let mut guard = self.conn.lock().await;
        let ClientConn { conn, decoder } = &mut *guard;

        write_frame(conn.as_mut(), &request)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        tracing::debug!(id = request.id, method = %request.method, "Request sent");

        let id = request.id;
        let wait = async {
            loop {
                let response: Response = read_frame(conn.as_mut(), decoder)
                    .await?
                    .ok_or(TransportError::ConnectionClosed)?;
                if response.id == id {
                    return Ok::<_, TransportError>(response);
                }
                // Left over from a call that timed out.
                tracing::debug!(id = response.id, "Discarding stale response");
            }
        };

        match timeout {
            Some(d) => tokio::time::timeout(d, wait).await.map_err(|_| {
                TransportError::Timeout(format!("{} after {d:?}", request.method))
            })?,
            None => wait.await,
        }
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}
