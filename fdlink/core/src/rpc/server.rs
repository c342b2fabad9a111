//! RPC Server
//!
//! Accepts connections on a Unix socket, handshakes each one with the
//! configured transport credentials, and dispatches requests to a
//! [`Handler`]. Each connection runs on its own task; requests on one
//! connection are handled in order.
//!
//! # Descriptors in Responses
//!
//! A handler that sends a descriptor through the call's transceiver must
//! not wait for the send receipt before returning: the descriptor goes out
//! with the response frame.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::conn::ConnectionId;
use crate::credentials::{Handshake, TransportCredentials};

use super::frame::{read_frame, write_frame, FrameDecoder};
use super::{CallContext, Peer, Request, Response, TransportError};

/// Request handler
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Handle one request; an `Err` is returned to the caller as a remote error
    async fn handle(
        &self,
        ctx: CallContext,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, String>;
}

/// Server end of the RPC layer
pub struct RpcServer {
    socket_path: PathBuf,
    listener: UnixListener,
    credentials: Option<Arc<dyn TransportCredentials>>,
    /// Active connections: ConnectionId -> serving task
    connections: Arc<DashMap<ConnectionId, JoinHandle<()>>>,
}

impl RpcServer {
    /// Bind a socket at `path` with owner-only permissions
    ///
    /// A stale socket file at `path` is replaced.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::IoError`] if the directory cannot be
    /// created or the socket cannot be bound.
    pub fn bind(
        path: impl AsRef<Path>,
        credentials: Option<Box<dyn TransportCredentials>>,
    ) -> Result<Self, TransportError> {
        let socket_path = path.as_ref().to_path_buf();

        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                TransportError::IoError(std::io::Error::new(
                    e.kind(),
                    format!("Failed to create directory {parent:?}: {e}"),
                ))
            })?;
        }

        if socket_path.exists() {
            std::fs::remove_file(&socket_path).map_err(|e| {
                TransportError::IoError(std::io::Error::new(
                    e.kind(),
                    format!("Failed to remove old socket {socket_path:?}: {e}"),
                ))
            })?;
        }

        let listener = UnixListener::bind(&socket_path)?;
        std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))?;

        tracing::info!(path = ?socket_path, "Listening on Unix socket");
        Ok(Self {
            socket_path,
            listener,
            credentials: credentials.map(Arc::from),
            connections: Arc::new(DashMap::new()),
        })
    }

    /// Path of the bound socket
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Number of connections currently being served
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Accept and serve connections until `shutdown` resolves
    ///
    /// Connections still open at shutdown are aborted, which closes them
    /// and fails their outstanding descriptor operations.
    pub async fn serve<H, F>(&self, handler: Arc<H>, shutdown: F)
    where
        H: Handler,
        F: std::future::Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _addr)) => self.spawn_connection(stream, Arc::clone(&handler)),
                    Err(e) => tracing::warn!(error = %e, "Accept failed"),
                },
            }
        }

        let open = self.connections.len();
        let ids: Vec<ConnectionId> = self.connections.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, task)) = self.connections.remove(&id) {
                task.abort();
            }
        }
        tracing::info!(path = ?self.socket_path, aborted = open, "Server stopped");
    }

    fn spawn_connection<H: Handler>(&self, stream: UnixStream, handler: Arc<H>) {
        let conn_id = ConnectionId::new();
        let credentials = self.credentials.clone();
        let connections = Arc::clone(&self.connections);
        let addr = self.socket_path.display().to_string();

        // The task must not remove itself before it has been inserted.
        let (registered_tx, registered_rx) = oneshot::channel::<()>();
        let task_id = conn_id.clone();
        let task = tokio::spawn(async move {
            let _ = registered_rx.await;
            let result = serve_connection(&task_id, stream, addr, credentials, handler).await;
            match result {
                Ok(()) => tracing::debug!(conn_id = %task_id, "Connection closed by peer"),
                Err(e) => tracing::warn!(conn_id = %task_id, error = %e, "Connection failed"),
            }
            connections.remove(&task_id);
        });

        self.connections.insert(conn_id, task);
        let _ = registered_tx.send(());
    }
}

async fn serve_connection<H: Handler>(
    conn_id: &ConnectionId,
    stream: UnixStream,
    addr: String,
    credentials: Option<Arc<dyn TransportCredentials>>,
    handler: Arc<H>,
) -> Result<(), TransportError> {
    let Handshake {
        mut conn,
        auth_info,
        transceiver,
    } = match credentials {
        Some(creds) => creds.server_handshake(Box::new(stream)).await?,
        None => Handshake::plain(Box::new(stream)),
    };

    tracing::info!(conn_id = %conn_id, fd_transfer = transceiver.is_some(), "Client connected");
    let peer = Peer {
        addr,
        auth_info,
        transceiver,
    };

    let mut decoder = FrameDecoder::new();
    loop {
        let request: Request = match read_frame(conn.as_mut(), &mut decoder).await {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(()),
            Err(TransportError::ChecksumMismatch { expected, actual }) => {
                tracing::warn!(conn_id = %conn_id, expected, actual, "Dropping corrupt frame");
                continue;
            }
            Err(e) => return Err(e),
        };

        tracing::debug!(conn_id = %conn_id, id = request.id, method = %request.method, "Request received");
        let ctx = CallContext {
            peer: Some(peer.clone()),
            method: request.method,
            metadata: request.metadata,
        };
        let outcome = handler.handle(ctx, request.body).await;

        write_frame(
            conn.as_mut(),
            &Response {
                id: request.id,
                outcome,
            },
        )
        .await?;
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        for entry in self.connections.iter() {
            entry.value().abort();
        }
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                tracing::warn!(path = ?self.socket_path, error = %e, "Failed to remove socket");
            }
        }
    }
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("socket_path", &self.socket_path)
            .field("connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::RpcClient;
    use tempfile::TempDir;

    struct Echo;

    #[async_trait]
    impl Handler for Echo {
        async fn handle(
            &self,
            ctx: CallContext,
            body: serde_json::Value,
        ) -> Result<serde_json::Value, String> {
            match ctx.method.as_str() {
                "echo" => Ok(body),
                other => Err(format!("unknown method {other}")),
            }
        }
    }

    #[tokio::test]
    async fn test_bind_sets_owner_only_permissions() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("rpc.sock");
        let server = RpcServer::bind(&path, None).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        drop(server);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rpc.sock");
        std::fs::write(&path, b"stale").unwrap();
        assert!(RpcServer::bind(&path, None).is_ok());
    }

    #[tokio::test]
    async fn test_call_and_remote_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rpc.sock");
        let server = Arc::new(RpcServer::bind(&path, None).unwrap());
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

        let serving = {
            let server = Arc::clone(&server);
            tokio::spawn(async move {
                server
                    .serve(Arc::new(Echo), async {
                        let _ = stop_rx.await;
                    })
                    .await;
            })
        };

        let client = RpcClient::dial(&path, Vec::new()).await.unwrap();
        assert!(client.transceiver().is_none());

        let echoed: serde_json::Value = client
            .call("echo", &serde_json::json!({"n": 1}), &[])
            .await
            .unwrap();
        assert_eq!(echoed, serde_json::json!({"n": 1}));

        let err = client
            .call::<_, serde_json::Value>("missing", &(), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Remote(ref m) if m.contains("missing")));

        stop_tx.send(()).unwrap();
        serving.await.unwrap();
        assert_eq!(server.connection_count(), 0);
    }
}
