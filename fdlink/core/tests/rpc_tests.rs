//! End-to-end tests: descriptors carried by RPC calls
//!
//! A server with descriptor-transfer credentials answers two methods:
//! `check` receives a descriptor named in the request, `give` opens a path
//! and sends its descriptor back with the response. `slow` answers after
//! the requested delay.

use std::os::fd::AsFd;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::oneshot;

use fdlink_core::{
    open_path, transceiver_from_context, with_transport_credentials, CallContext, CallOption,
    Capturer, DialOption, FdPerCallCredentials, FdReceiver, FdSender, FdTransportCredentials,
    Handler, Identity, RpcClient, RpcServer, TransportError,
};

const WAIT: Duration = Duration::from_secs(5);

struct Files;

#[async_trait]
impl Handler for Files {
    async fn handle(&self, ctx: CallContext, body: Value) -> Result<Value, String> {
        let transceiver =
            transceiver_from_context(&ctx).ok_or_else(|| "no transceiver".to_string())?;

        match ctx.method.as_str() {
            "check" => {
                let locator = body["locator"].as_str().ok_or("missing locator")?;
                let receipt = transceiver
                    .recv_fd_by_locator(locator)
                    .map_err(|e| e.to_string())?;
                let fd = tokio::time::timeout(WAIT, receipt)
                    .await
                    .map_err(|_| "descriptor never arrived".to_string())?
                    .map_err(|e| e.to_string())?;
                let got = Identity::of_fd(fd.as_fd()).map_err(|e| e.to_string())?;
                Ok(json!({ "locator": got.to_locator() }))
            }
            "give" => {
                let path: PathBuf = serde_json::from_value(body["path"].clone())
                    .map_err(|e| e.to_string())?;
                let file = open_path(&path).map_err(|e| e.to_string())?;
                // Not awaited: the descriptor leaves with this response.
                drop(transceiver.send_file(&file));
                Ok(json!({}))
            }
            "slow" => {
                let ms = body["ms"].as_u64().ok_or("missing ms")?;
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!({ "ms": ms }))
            }
            other => Err(format!("unknown method {other}")),
        }
    }
}

struct Harness {
    dir: TempDir,
    server: Arc<RpcServer>,
    _stop: oneshot::Sender<()>,
}

impl Harness {
    async fn start() -> Self {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rpc.sock");
        let server = Arc::new(
            RpcServer::bind(&path, Some(Box::new(FdTransportCredentials::new(None)))).unwrap(),
        );

        let (stop, stopped) = oneshot::channel::<()>();
        let serving = Arc::clone(&server);
        tokio::spawn(async move {
            serving
                .serve(Arc::new(Files), async {
                    let _ = stopped.await;
                })
                .await;
        });

        Self {
            dir,
            server,
            _stop: stop,
        }
    }

    fn file(&self, name: &str) -> (PathBuf, Identity) {
        let path = self.dir.path().join(name);
        std::fs::write(&path, name).unwrap();
        let id = Identity::of_path(&path).unwrap();
        (path, id)
    }
}

#[tokio::test]
async fn test_per_call_send_is_deferred_until_the_call() {
    let harness = Harness::start().await;
    let (path, id) = harness.file("early");
    let creds = FdPerCallCredentials::new();

    // Queued before any connection exists.
    let sent = creds.send_path(&path);
    assert_eq!(creds.deferred_count().await.unwrap(), 1);
    assert!(!creds.is_resolved().await.unwrap());

    let client = RpcClient::dial(
        harness.server.socket_path(),
        vec![with_transport_credentials(None, Vec::new())],
    )
    .await
    .unwrap();

    let reply: Value = client
        .call(
            "check",
            &json!({ "locator": id.to_locator() }),
            &[CallOption::PerCallCredentials(Arc::new(creds.clone()))],
        )
        .await
        .unwrap();
    assert_eq!(reply["locator"], id.to_locator());

    tokio::time::timeout(WAIT, sent).await.unwrap().unwrap();
    assert!(creds.is_resolved().await.unwrap());
    assert_eq!(creds.deferred_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_server_sends_descriptor_with_response() {
    let harness = Harness::start().await;
    let (path, id) = harness.file("reply");
    let creds = FdPerCallCredentials::new();

    // Requested before the call, resolved by it.
    let wanted = creds.recv_file(id);

    let client = RpcClient::dial(
        harness.server.socket_path(),
        vec![
            with_transport_credentials(None, Vec::new()),
            DialOption::PerCallCredentials(Arc::new(creds.clone())),
        ],
    )
    .await
    .unwrap();

    let _: Value = client
        .call("give", &json!({ "path": path }), &[])
        .await
        .unwrap();

    let file = tokio::time::timeout(WAIT, wanted).await.unwrap().unwrap();
    assert_eq!(Identity::of_fd(file.as_fd()).unwrap(), id);

    // The same descriptor is also reachable through the client's connection.
    let again = client.transceiver().unwrap().recv_fd(id).await.unwrap();
    assert_eq!(Identity::of_fd(again.as_fd()).unwrap(), id);
}

#[tokio::test]
async fn test_capturer_receives_connection_sender() {
    let harness = Harness::start().await;
    let (path, id) = harness.file("captured");

    let captured: Arc<Mutex<Option<Arc<dyn FdSender>>>> = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&captured);
    let capturer: Capturer = Arc::new(move |sender| {
        *slot.lock().unwrap() = Some(sender);
    });

    let client = RpcClient::dial(
        harness.server.socket_path(),
        vec![with_transport_credentials(None, vec![capturer])],
    )
    .await
    .unwrap();

    let sender = captured.lock().unwrap().clone().unwrap();
    let sent = sender.send_path(&path);

    let reply: Value = client
        .call("check", &json!({ "locator": id.to_locator() }), &[])
        .await
        .unwrap();
    assert_eq!(reply["locator"], id.to_locator());
    sent.await.unwrap();
}

#[tokio::test]
async fn test_plain_client_still_gets_responses() {
    let harness = Harness::start().await;
    let (path, _) = harness.file("plain");

    let client = RpcClient::dial(harness.server.socket_path(), Vec::new())
        .await
        .unwrap();
    assert!(client.transceiver().is_none());

    // The descriptor sent with the response is discarded by a plain reader.
    let result: Result<Value, TransportError> =
        client.call("give", &json!({ "path": path }), &[]).await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_timed_out_call_leaves_client_usable() {
    let harness = Harness::start().await;
    let client = RpcClient::dial(
        harness.server.socket_path(),
        vec![with_transport_credentials(None, Vec::new())],
    )
    .await
    .unwrap();

    let err = client
        .call::<_, Value>(
            "slow",
            &json!({ "ms": 300 }),
            &[CallOption::Timeout(Duration::from_millis(50))],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Timeout(_)));

    // The late response to the first call is skipped, not mistaken for this one.
    let reply: Value = client
        .call("slow", &json!({ "ms": 0 }), &[])
        .await
        .unwrap();
    assert_eq!(reply["ms"], 0);
}

#[tokio::test]
async fn test_dial_missing_socket_fails() {
    let dir = TempDir::new().unwrap();
    let err = RpcClient::dial(
        dir.path().join("absent.sock"),
        vec![DialOption::ConnectTimeout(Duration::from_millis(200))],
    )
    .await
    .unwrap_err();
    assert!(matches!(err, TransportError::ConnectionFailed(_)));
}
