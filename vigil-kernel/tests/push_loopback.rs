//! Push client against a real push server over loopback TCP.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use vigil_core::Node;
use vigil_devkit::keys::{test_authority_material, TEST_CERT_PEM};
use vigil_devkit::{init_tracing, node_with_probes, wait_until};
use vigil_kernel::authority::Authority;
use vigil_kernel::mesh::Mesh;
use vigil_kernel::push_client::{PushClient, PushClientOptions};
use vigil_kernel::push_server::PushServer;

const WAIT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn client_registers_gets_approved_and_pushes() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();

    let (server_mesh, _server_events) = Mesh::new(Node::new("parent-uuid", "parent", "infra"), 60);
    let authority = Arc::new(
        Authority::from_pem(
            TEST_CERT_PEM.to_string(),
            &test_authority_material(),
            dir.path().join("allowed"),
            10,
        )
        .unwrap()
        .with_mesh(server_mesh.clone()),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server_cancel = CancellationToken::new();
    let server = Arc::new(PushServer::new(authority.clone(), server_mesh.clone(), false));
    tokio::spawn(server.listen(listener, None, server_cancel.clone()));

    let client_root = node_with_probes("edge-uuid", "edge", &[("disk", 250)]);
    let (client_mesh, _client_events) = Mesh::new(client_root, 60);
    let options = PushClientOptions {
        address: "127.0.0.1".into(),
        port,
        ssl_enabled: false,
        cert_path: dir.path().join("server.pem"),
        signature_path: dir.path().join("uuid.sig"),
        timeout: Duration::from_secs(2),
        push_interval: Duration::from_millis(50),
    };
    let client_cancel = CancellationToken::new();
    let client = tokio::spawn(PushClient::new(options, client_mesh.clone()).run(client_cancel.clone()));

    let auth = authority.clone();
    assert!(wait_until(WAIT, || { let auth = auth.clone(); async move { auth.is_waiting("edge-uuid") } }).await);
    assert!(server_mesh.read(|root| root.children.is_empty()));

    authority.allow_client("edge-uuid").unwrap();
    let mesh = server_mesh.clone();
    assert!(
        wait_until(WAIT, || {
            let mesh = mesh.clone();
            async move { mesh.read(|root| root.children.contains_key("edge-uuid")) }
        })
        .await
    );
    assert!(dir.path().join("uuid.sig").exists());
    assert_eq!(server_mesh.read(|root| root.global_status), 250);
    assert_eq!(authority.token_count(), 1);

    // later probe results reach the parent on the next push
    client_mesh.submit_probe_result(vigil_core::ProbeResult::new("disk", 330, 0, "almost full"));
    let mesh = server_mesh.clone();
    assert!(
        wait_until(WAIT, || {
            let mesh = mesh.clone();
            async move { mesh.read(|root| root.global_status) == 330 }
        })
        .await
    );

    // shutdown says goodbye, which revokes the session token
    client_cancel.cancel();
    tokio::time::timeout(WAIT, client).await.unwrap().unwrap();
    assert_eq!(authority.token_count(), 0);
    server_cancel.cancel();
}

#[tokio::test]
async fn stale_signature_is_dropped_and_client_registers_again() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("uuid.sig"), b"forged").unwrap();

    let (server_mesh, _server_events) = Mesh::new(Node::new("parent-uuid", "parent", "infra"), 60);
    let authority = Arc::new(
        Authority::from_pem(
            TEST_CERT_PEM.to_string(),
            &test_authority_material(),
            dir.path().join("allowed"),
            10,
        )
        .unwrap(),
    );
    // allowed, but the stored signature is not ours
    authority.add_client_to_waiting_list("edge-uuid", "edge").unwrap();
    authority.allow_client("edge-uuid").unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let cancel = CancellationToken::new();
    let server = Arc::new(PushServer::new(authority.clone(), server_mesh.clone(), false));
    tokio::spawn(server.listen(listener, None, cancel.clone()));

    let (client_mesh, _client_events) = Mesh::new(Node::new("edge-uuid", "edge", "g"), 60);
    let options = PushClientOptions {
        address: "127.0.0.1".into(),
        port,
        ssl_enabled: false,
        cert_path: dir.path().join("server.pem"),
        signature_path: dir.path().join("uuid.sig"),
        timeout: Duration::from_secs(2),
        push_interval: Duration::from_millis(50),
    };
    let client = tokio::spawn(PushClient::new(options, client_mesh).run(cancel.clone()));

    // refused Hello, fresh signature from the allowed registration, then a session
    let mesh = server_mesh.clone();
    assert!(
        wait_until(WAIT, || {
            let mesh = mesh.clone();
            async move { mesh.read(|root| root.children.contains_key("edge-uuid")) }
        })
        .await
    );
    assert_ne!(std::fs::read(dir.path().join("uuid.sig")).unwrap(), b"forged");

    cancel.cancel();
    tokio::time::timeout(WAIT, client).await.unwrap().unwrap();
}
