//! Descriptor Service
//!
//! RPC methods served by the daemon:
//!
//! | method     | body               | result                 |
//! |------------|--------------------|------------------------|
//! | `open`     | `{ "path": ... }`  | `{ "locator": ... }`   |
//! | `identity` | `{ "path": ... }`  | `{ "locator": ... }`   |
//!
//! `open` also sends the file's descriptor over the caller's connection;
//! it arrives with the response.

use std::os::fd::AsFd;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use fdlink_core::{
    locator_of_path, open_path, transceiver_from_context, CallContext, FdSender, Handler, Identity,
};

/// Arguments to `open` and `identity`
#[derive(Debug, Serialize, Deserialize)]
pub struct PathRequest {
    /// File to describe
    pub path: PathBuf,
}

/// Result of `open` and `identity`
#[derive(Debug, Serialize, Deserialize)]
pub struct LocatorReply {
    /// `inode://{device}/{inode}` of the file
    pub locator: String,
}

/// Handler for the daemon's methods
#[derive(Debug, Default)]
pub struct DescriptorService;

impl DescriptorService {
    fn open(ctx: &CallContext, path: &Path) -> Result<LocatorReply, String> {
        let transceiver = transceiver_from_context(ctx)
            .ok_or_else(|| "connection cannot carry descriptors".to_string())?;

        let file = open_path(path).map_err(|e| e.to_string())?;
        let identity = Identity::of_fd(file.as_fd()).map_err(|e| e.to_string())?;

        // Awaiting here would deadlock: the descriptor leaves with the response.
        let sent = transceiver.send_file(&file);
        let locator = identity.to_locator();
        let logged = locator.clone();
        tokio::spawn(async move {
            match sent.await {
                Ok(()) => debug!(locator = %logged, "Descriptor delivered"),
                Err(e) => warn!(locator = %logged, error = %e, "Descriptor not delivered"),
            }
        });

        Ok(LocatorReply { locator })
    }

    fn identity(path: &Path) -> Result<LocatorReply, String> {
        locator_of_path(path)
            .map(|locator| LocatorReply { locator })
            .map_err(|e| e.to_string())
    }
}

#[async_trait]
impl Handler for DescriptorService {
    async fn handle(
        &self,
        ctx: CallContext,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, String> {
        let request: PathRequest =
            serde_json::from_value(body).map_err(|e| format!("invalid request: {e}"))?;
        debug!(method = %ctx.method, path = ?request.path, "Handling request");

        let reply = match ctx.method.as_str() {
            "open" => Self::open(&ctx, &request.path)?,
            "identity" => Self::identity(&request.path)?,
            other => return Err(format!("unknown method {other:?}")),
        };
        serde_json::to_value(reply).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use fdlink_core::{
        with_transport_credentials, FdReceiver, FdTransportCredentials, RpcClient, RpcServer,
        TransportError,
    };
    use tempfile::TempDir;

    async fn start(dir: &TempDir) -> (Arc<RpcServer>, tokio::sync::oneshot::Sender<()>) {
        let path = dir.path().join("fdlink.sock");
        let server = Arc::new(
            RpcServer::bind(&path, Some(Box::new(FdTransportCredentials::new(None)))).unwrap(),
        );
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let serving = Arc::clone(&server);
        tokio::spawn(async move {
            serving
                .serve(Arc::new(DescriptorService), async {
                    let _ = stop_rx.await;
                })
                .await;
        });
        (server, stop_tx)
    }

    #[tokio::test]
    async fn test_open_delivers_descriptor() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("payload.txt");
        std::fs::write(&target, b"payload").unwrap();
        let (server, _stop) = start(&dir).await;

        let client = RpcClient::dial(
            server.socket_path(),
            vec![with_transport_credentials(None, Vec::new())],
        )
        .await
        .unwrap();

        let reply: LocatorReply = client
            .call("open", &PathRequest { path: target.clone() }, &[])
            .await
            .unwrap();
        assert_eq!(reply.locator, locator_of_path(&target).unwrap());

        let transceiver = client.transceiver().unwrap();
        let file = tokio::time::timeout(
            Duration::from_secs(5),
            transceiver.recv_file_by_locator(&reply.locator).unwrap(),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(
            Identity::of_fd(file.as_fd()).unwrap().to_locator(),
            reply.locator
        );
    }

    #[tokio::test]
    async fn test_identity_and_errors() {
        let dir = TempDir::new().unwrap();
        let (server, _stop) = start(&dir).await;
        let client = RpcClient::dial(server.socket_path(), Vec::new()).await.unwrap();

        let reply: LocatorReply = client
            .call("identity", &PathRequest { path: dir.path().to_path_buf() }, &[])
            .await
            .unwrap();
        assert_eq!(reply.locator, locator_of_path(dir.path()).unwrap());

        let missing = client
            .call::<_, LocatorReply>(
                "identity",
                &PathRequest {
                    path: dir.path().join("missing"),
                },
                &[],
            )
            .await;
        assert!(matches!(missing, Err(TransportError::Remote(_))));

        let unknown = client
            .call::<_, LocatorReply>("delete", &PathRequest { path: "/".into() }, &[])
            .await;
        assert!(matches!(unknown, Err(TransportError::Remote(m)) if m.contains("delete")));
    }
}
