//! Push channel over TLS: first-contact certificate bootstrap and pinning.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rcgen::CertifiedKey;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use vigil_core::Node;
use vigil_devkit::keys::test_authority_material;
use vigil_devkit::{init_tracing, wait_until};
use vigil_kernel::authority::Authority;
use vigil_kernel::mesh::{EventReceiver, Mesh};
use vigil_kernel::push_client::{PushClient, PushClientOptions};
use vigil_kernel::push_server::PushServer;
use vigil_kernel::tls;

const WAIT: Duration = Duration::from_secs(10);

fn self_signed() -> CertifiedKey {
    rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap()
}

/// Auto-accepting TLS push server presenting `identity`.
async fn start_server(
    identity: &CertifiedKey,
    dir: &Path,
    cancel: &CancellationToken,
) -> (u16, Mesh, Arc<Authority>, EventReceiver) {
    let cert_pem = identity.cert.pem();
    let key_pem = identity.key_pair.serialize_pem();

    let (mesh, events) = Mesh::new(Node::new("parent-uuid", "parent", "infra"), 60);
    let authority = Arc::new(
        Authority::from_pem(cert_pem.clone(), &test_authority_material(), dir.join("allowed"), 10)
            .unwrap()
            .with_mesh(mesh.clone()),
    );
    let acceptor = tls::acceptor(cert_pem.as_bytes(), key_pem.as_bytes()).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = Arc::new(PushServer::new(authority.clone(), mesh.clone(), true));
    tokio::spawn(server.listen(listener, Some(acceptor), cancel.clone()));
    (port, mesh, authority, events)
}

fn client_options(port: u16, dir: &Path) -> PushClientOptions {
    PushClientOptions {
        address: "127.0.0.1".into(),
        port,
        ssl_enabled: true,
        cert_path: dir.join("server.pem"),
        signature_path: dir.join("uuid.sig"),
        timeout: Duration::from_secs(2),
        push_interval: Duration::from_millis(50),
    }
}

#[tokio::test]
async fn first_contact_stores_certificate_then_pushes_pinned() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let identity = self_signed();
    let cancel = CancellationToken::new();
    let (port, server_mesh, authority, _events) = start_server(&identity, dir.path(), &cancel).await;

    let (client_mesh, _client_events) = Mesh::new(Node::new("edge-uuid", "edge", "g"), 60);
    let client_cancel = CancellationToken::new();
    let client = PushClient::new(client_options(port, dir.path()), client_mesh);
    let client = tokio::spawn(client.run(client_cancel.clone()));

    let mesh = server_mesh.clone();
    assert!(
        wait_until(WAIT, || {
            let mesh = mesh.clone();
            async move { mesh.read(|root| root.children.contains_key("edge-uuid")) }
        })
        .await
    );
    let stored = std::fs::read_to_string(dir.path().join("server.pem")).unwrap();
    assert_eq!(stored, identity.cert.pem());
    assert!(authority.is_allowed("edge-uuid"));

    client_cancel.cancel();
    tokio::time::timeout(WAIT, client).await.unwrap().unwrap();
    assert_eq!(authority.token_count(), 0);
    cancel.cancel();
}

#[tokio::test]
async fn client_pinned_to_another_certificate_never_reports() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let identity = self_signed();
    let cancel = CancellationToken::new();
    let (port, server_mesh, authority, _events) = start_server(&identity, dir.path(), &cancel).await;

    // a certificate from some other server, pinned earlier
    let foreign = self_signed().cert.pem();
    std::fs::write(dir.path().join("server.pem"), &foreign).unwrap();

    let (client_mesh, _client_events) = Mesh::new(Node::new("edge-uuid", "edge", "g"), 60);
    let client = PushClient::new(client_options(port, dir.path()), client_mesh);
    let client = tokio::spawn(client.run(cancel.clone()));

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(server_mesh.read(|root| root.children.is_empty()));
    assert!(!authority.is_allowed("edge-uuid"));
    assert!(!authority.is_waiting("edge-uuid"));
    assert_eq!(std::fs::read_to_string(dir.path().join("server.pem")).unwrap(), foreign);

    cancel.cancel();
    tokio::time::timeout(WAIT, client).await.unwrap().unwrap();
}
