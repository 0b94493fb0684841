/**
 * PUSH SERVER - Receives authenticated snapshots from push clients
 *
 * ROLE: Server side of the Register -> GetUuidSignature -> Hello -> Update /
 * Goodbye handshake, on top of the `Authority`.
 *
 * CLIENT STATES: unknown -> waiting -> allowed -> session
 * - Register: unknown becomes waiting (allowed at once with auto accept)
 * - GetUuidSignature: only for allowed clients
 * - Hello: a valid signature opens a session (token)
 * - Update: token checked, then the snapshot is merged into the tree
 * - Goodbye: token revoked, client back to allowed
 *
 * A session expires once neither the token nor the client's last merge is
 * younger than `SESSION_TTL`.
 */

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vigil_core::{unix_now, MergeOutcome, Node};

use crate::authority::{Authority, AuthorityError};
use crate::mesh::Mesh;
use crate::protocol::{
    framed, read_frame, write_frame, Call, HelloRequest, PushError, Reply, Request, RpcRequest,
    RpcResponse, UpdateRequest,
};

/// Seconds a session survives without activity.
pub const SESSION_TTL: i64 = 300;

/// Silence after which a connection is dropped.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(SESSION_TTL as u64);

pub struct PushServer {
    authority: Arc<Authority>,
    mesh: Mesh,
    auto_accept: bool,
    idle_timeout: Duration,
}

impl PushServer {
    pub fn new(authority: Arc<Authority>, mesh: Mesh, auto_accept: bool) -> Self {
        Self {
            authority,
            mesh,
            auto_accept,
            idle_timeout: IDLE_TIMEOUT,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn authority(&self) -> &Arc<Authority> {
        &self.authority
    }

    pub fn handle(&self, call: Call) -> Result<Reply, PushError> {
        self.handle_at(call, unix_now())
    }

    /// Validates then dispatches one call as if received at `now`.
    pub fn handle_at(&self, call: Call, now: i64) -> Result<Reply, PushError> {
        call.validate()?;
        match call {
            Call::GetServerCertificate => Ok(Reply::Certificate(self.authority.certificate().to_string())),
            Call::Register(hello) => self.register(&hello),
            Call::GetUuidSignature(hello) => self.uuid_signature(&hello),
            Call::Hello(hello) => self.hello(&hello),
            Call::Update(update) => self.update(update, now),
            Call::Goodbye(request) => self.goodbye(&request),
        }
    }

    fn register(&self, hello: &HelloRequest) -> Result<Reply, PushError> {
        if self.authority.is_allowed(&hello.uuid) {
            return Ok(Reply::Ack);
        }
        match self.authority.add_client_to_waiting_list(&hello.uuid, &hello.hostname) {
            Ok(()) => {}
            Err(AuthorityError::CapacityExceeded(max)) => {
                warn!(uuid = %hello.uuid, hostname = %hello.hostname, max, "waiting list full, registration refused");
                return Err(PushError::CapacityExceeded(max));
            }
            Err(e) => return Err(internal(e)),
        }
        if self.auto_accept {
            self.authority.allow_client(&hello.uuid).map_err(internal)?;
        }
        Ok(Reply::Ack)
    }

    fn uuid_signature(&self, hello: &HelloRequest) -> Result<Reply, PushError> {
        match self.authority.get_uuid_signature(&hello.uuid) {
            Ok(signature) => Ok(Reply::Signature(signature)),
            Err(AuthorityError::NotAllowed(_)) if self.authority.is_waiting(&hello.uuid) => Err(PushError::Waiting),
            Err(AuthorityError::NotAllowed(_)) => Err(PushError::NotAllowed),
            Err(e) => Err(internal(e)),
        }
    }

    fn hello(&self, hello: &HelloRequest) -> Result<Reply, PushError> {
        if !self.authority.is_allowed(&hello.uuid) {
            info!(uuid = %hello.uuid, hostname = %hello.hostname, "hello from a client that is not allowed");
            return Err(PushError::NotAllowed);
        }
        if let Err(e) = self.authority.verify_uuid_signature(&hello.uuid, &hello.uuid_signature) {
            info!(uuid = %hello.uuid, hostname = %hello.hostname, error = %e, "hello refused");
            return Err(PushError::NotAllowed);
        }
        let token = self.authority.get_token(&hello.uuid);
        info!(uuid = %hello.uuid, hostname = %hello.hostname, "push session opened");
        Ok(Reply::Token(token))
    }

    /// Checks the token and the session age.
    fn auth(&self, uuid: &str, token: &str, now: i64) -> Result<(), PushError> {
        let entry = self.authority.verify_token(uuid, token).map_err(|_| {
            info!(uuid, "rejected invalid token");
            PushError::NotAllowed
        })?;

        let last_seen = self
            .mesh
            .child_last_update(uuid)
            .unwrap_or(entry.issued_at)
            .max(entry.issued_at);
        if now - last_seen > SESSION_TTL {
            self.authority.revoke_token(token);
            info!(uuid, idle = now - last_seen, "push session expired");
            return Err(PushError::NotAllowed);
        }
        Ok(())
    }

    fn update(&self, update: UpdateRequest, now: i64) -> Result<Reply, PushError> {
        self.auth(&update.uuid, &update.token, now)?;

        let node = Node::from_json(update.node.as_bytes(), 0)
            .map_err(|e| PushError::CannotDecode(e.to_string()))?;
        if node.uuid != update.uuid {
            return Err(PushError::InvalidRequest("snapshot uuid does not match the session".into()));
        }

        match self.mesh.merge(node) {
            MergeOutcome::Merged { pruned, .. } => {
                if !pruned.is_empty() {
                    debug!(uuid = %update.uuid, pruned = pruned.len(), "duplicates pruned from pushed snapshot");
                }
                Ok(Reply::Ack)
            }
            MergeOutcome::Rejected(reason) => {
                Err(PushError::InvalidRequest(format!("snapshot rejected: {reason:?}")))
            }
        }
    }

    fn goodbye(&self, request: &Request) -> Result<Reply, PushError> {
        self.authority
            .verify_token(&request.uuid, &request.token)
            .map_err(|_| PushError::NotAllowed)?;
        self.authority.revoke_token(&request.token);
        info!(uuid = %request.uuid, "push session closed");
        Ok(Reply::Ack)
    }

    /// Answers requests on one connection until the peer leaves.
    pub async fn serve<S>(&self, io: S, peer: SocketAddr, cancel: CancellationToken)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut transport = framed(io);
        loop {
            let request = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = tokio::time::timeout(self.idle_timeout, read_frame::<_, RpcRequest>(&mut transport)) => frame,
            };
            let request = match request {
                Err(_) => {
                    info!(%peer, idle = ?self.idle_timeout, "closing idle push connection");
                    break;
                }
                Ok(Ok(Some(request))) => request,
                Ok(Ok(None)) => break,
                // TLS peers that hang up without close_notify
                Ok(Err(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                    debug!(%peer, "push client hung up");
                    break;
                }
                Ok(Err(e)) => {
                    warn!(%peer, error = %e, "dropping push connection");
                    break;
                }
            };

            let method = request.call.name();
            let result = self.handle(request.call);
            if let Err(e) = &result {
                debug!(%peer, method, error = %e, "push call failed");
            }
            let response = RpcResponse {
                id: request.id,
                result,
            };
            if let Err(e) = write_frame(&mut transport, &response).await {
                warn!(%peer, error = %e, "cannot answer push client");
                break;
            }
        }
        debug!(%peer, "push connection closed");
    }

    /// Accept loop. Each connection gets its own task.
    pub async fn listen(self: Arc<Self>, listener: TcpListener, tls: Option<TlsAcceptor>, cancel: CancellationToken) {
        match listener.local_addr() {
            Ok(addr) => info!(%addr, tls = tls.is_some(), "push server listening"),
            Err(e) => warn!(error = %e, "push server listening on unknown address"),
        }

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };

            let server = self.clone();
            let tls = tls.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                match tls {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(stream) => server.serve(stream, peer, cancel).await,
                        Err(e) => warn!(%peer, error = %e, "TLS handshake failed"),
                    },
                    None => server.serve(stream, peer, cancel).await,
                }
            });
        }
        info!("push server stopped");
    }
}

fn internal(e: AuthorityError) -> PushError {
    warn!(error = %e, "authority failure");
    PushError::Internal(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_devkit::keys::{test_authority_material, TEST_CERT_PEM};

    fn server(dir: &tempfile::TempDir, max_waiting: usize) -> PushServer {
        let (mesh, _events) = Mesh::new(Node::new("root", "gw", "g"), 60);
        let authority = Authority::from_pem(
            TEST_CERT_PEM.to_string(),
            &test_authority_material(),
            dir.path().join("allowed"),
            max_waiting,
        )
        .unwrap();
        PushServer::new(Arc::new(authority), mesh, false)
    }

    fn register(uuid: &str) -> Call {
        Call::Register(HelloRequest {
            hostname: format!("{uuid}-host"),
            uuid: uuid.into(),
            uuid_signature: Vec::new(),
        })
    }

    #[test]
    fn test_full_waiting_list_is_reported_as_such() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(&dir, 1);
        assert_eq!(server.handle(register("u-1")), Ok(Reply::Ack));
        assert_eq!(server.handle(register("u-2")), Err(PushError::CapacityExceeded(1)));
        // already queued clients are not affected
        assert_eq!(server.handle(register("u-1")), Ok(Reply::Ack));
    }

    #[tokio::test]
    async fn test_silent_connection_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(&dir, 10).with_idle_timeout(Duration::from_millis(100));
        let (client, io) = tokio::io::duplex(1024);
        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();

        let served = tokio::time::timeout(
            Duration::from_secs(5),
            server.serve(io, peer, CancellationToken::new()),
        )
        .await;
        assert!(served.is_ok());

        let mut client = framed(client);
        assert!(read_frame::<_, RpcResponse>(&mut client).await.unwrap().is_none());
    }
}
