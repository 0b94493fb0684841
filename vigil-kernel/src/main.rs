/**
 * VIGIL - Node daemon entry point
 *
 * ROLE: Wires every component around one shared tree: identity, probe
 * runner, pollers, push server/client, notifier, liveness sweep, HTTP API.
 *
 * ARCHITECTURE: one task per concern, one `Mesh` cloned into all of them,
 * one cancellation token for shutdown (ctrl-c).
 */

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vigil_core::Node;
use vigil_kernel::authority::Authority;
use vigil_kernel::config::load_config;
use vigil_kernel::http::{build_router, AppState};
use vigil_kernel::mesh::Mesh;
use vigil_kernel::notifier::Notifier;
use vigil_kernel::poller::Poller;
use vigil_kernel::probes::ProbeRunner;
use vigil_kernel::push_client::{PushClient, PushClientOptions};
use vigil_kernel::push_server::PushServer;
use vigil_kernel::{identity, tls};

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("vigil_kernel=info,vigil_core=info,vigil=info")),
        )
        .init();

    let config = load_config().await;

    let uuid = identity::load_or_create(&config.global.uuid_file).context("loading node identity")?;
    let hostname = config.resolved_hostname();
    info!(uuid = %uuid, hostname = %hostname, version = env!("CARGO_PKG_VERSION"), "starting vigil node");

    let root = Node::new(uuid, hostname, config.global.group.clone());
    let (mesh, events) = Mesh::new(root, config.global.alive_timeout);
    let cancel = CancellationToken::new();

    Notifier::new(config.notifications.clone()).spawn(events);
    mesh.spawn_liveness_sweep(cancel.clone());

    // local probes
    let runner = ProbeRunner::new(
        config.global.probes_directory.clone(),
        Duration::from_secs(config.global.probe_timeout.max(1)),
        mesh.clone(),
    );
    if let Err(e) = runner.spawn(cancel.clone()).await {
        warn!(dir = %config.global.probes_directory.display(), error = %e, "probe runner disabled");
    }

    // pull path
    for target in config.remote_nodes.targets(config.global.listen_port) {
        Poller::new(mesh.clone())
            .context("building HTTP client")?
            .spawn(target, cancel.clone());
    }

    // push server + authority
    let mut authority = None;
    if config.push_server.enabled {
        let server_cfg = &config.push_server;
        let loaded = Authority::load(
            &server_cfg.ssl_cert,
            &server_cfg.ssl_key,
            server_cfg.allowed_clients_file.clone(),
            server_cfg.max_waiting_clients,
        )
        .context("loading push authority material")?
        .with_mesh(mesh.clone());
        let loaded = Arc::new(loaded);

        let acceptor = if server_cfg.ssl_enabled {
            let cert = std::fs::read(&server_cfg.ssl_cert).context("reading push server certificate")?;
            let key = std::fs::read(&server_cfg.ssl_key).context("reading push server key")?;
            Some(tls::acceptor(&cert, &key).context("building TLS acceptor")?)
        } else {
            None
        };

        let listener = TcpListener::bind((server_cfg.address.as_str(), server_cfg.port))
            .await
            .with_context(|| format!("binding push server on {}:{}", server_cfg.address, server_cfg.port))?;
        let server = Arc::new(PushServer::new(loaded.clone(), mesh.clone(), server_cfg.auto_accept_clients));
        tokio::spawn(server.listen(listener, acceptor, cancel.clone()));
        authority = Some(loaded);
    }

    // push client
    let push_client = config.push_client.enabled.then(|| {
        let client = PushClient::new(PushClientOptions::from(&config.push_client), mesh.clone());
        tokio::spawn(client.run(cancel.clone()))
    });

    // shutdown on ctrl-c
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "cannot listen for ctrl-c");
                return;
            }
            info!("shutdown requested");
            cancel.cancel();
        });
    }

    // HTTP
    let app_state = AppState {
        mesh,
        authority,
        api_key: std::env::var("VIGIL_API_KEY").ok(),
    };
    let app = build_router(app_state);
    let listener = TcpListener::bind((config.global.listen_address.as_str(), config.global.listen_port))
        .await
        .with_context(|| format!("binding HTTP API on port {}", config.global.listen_port))?;
    info!(address = %config.global.listen_address, port = config.global.listen_port, "HTTP API listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.clone().cancelled_owned())
        .await
        .context("HTTP server failed")?;

    // let the push client say goodbye
    if let Some(handle) = push_client {
        if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
            warn!("push client did not stop in time");
        }
    }
    info!("vigil stopped");
    Ok(())
}
