/**
 * PUSH CLIENT - Reports the local tree to a parent node
 *
 * ROLE: Client side of the push handshake over one long-lived connection.
 *
 * LOOP:
 * - No local copy of the server certificate: fetch it over an unverified
 *   connection, store it, reconnect pinned to it
 * - No stored uuid signature: Register, poll GetUuidSignature every push
 *   interval until allowed, store it, reconnect
 * - Hello for a session token, then Update every push interval
 * - Any error drops the connection and starts over; cancellation says Goodbye
 */

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PushClientConfig;
use crate::mesh::Mesh;
use crate::protocol::{
    framed, read_frame, write_frame, Call, HelloRequest, PushError, Reply, Request, RpcRequest,
    RpcResponse, Transport, UpdateRequest,
};
use crate::tls::{self, TlsError};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("no answer within {0:?}")]
    Timeout(Duration),
    #[error("tls: {0}")]
    Tls(#[from] TlsError),
    #[error("server refused: {0}")]
    Rpc(#[from] PushError),
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// Bootstrap step done, open a fresh connection.
    #[error("reconnect requested")]
    Reconnect,
    #[error("connection closed by server")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct PushClientOptions {
    pub address: String,
    pub port: u16,
    pub ssl_enabled: bool,
    pub cert_path: PathBuf,
    pub signature_path: PathBuf,
    pub timeout: Duration,
    pub push_interval: Duration,
}

impl From<&PushClientConfig> for PushClientOptions {
    fn from(config: &PushClientConfig) -> Self {
        Self {
            address: config.address.clone(),
            port: config.port,
            ssl_enabled: config.ssl_enabled,
            cert_path: config.ssl_cert.clone(),
            signature_path: config.uuid_sig.clone(),
            timeout: Duration::from_secs(config.timeout.max(1)),
            push_interval: Duration::from_secs(config.push_interval.max(1)),
        }
    }
}

/// Request/response exchange over one framed stream.
struct Connection<S> {
    transport: Transport<S>,
    next_id: u64,
    timeout: Duration,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    fn new(io: S, timeout: Duration) -> Self {
        Self {
            transport: framed(io),
            next_id: 0,
            timeout,
        }
    }

    async fn call(&mut self, call: Call) -> Result<Reply, ClientError> {
        self.next_id += 1;
        let id = self.next_id;
        let request = RpcRequest { id, call };

        let timeout = self.timeout;
        let transport = &mut self.transport;
        let exchange = async {
            write_frame(transport, &request).await?;
            read_frame::<_, RpcResponse>(transport).await
        };
        let response = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| ClientError::Timeout(timeout))??
            .ok_or(ClientError::Closed)?;

        if response.id != id {
            return Err(ClientError::Protocol(format!("expected response {id}, got {}", response.id)));
        }
        Ok(response.result?)
    }

    /// Orderly close, so a TLS server sees close_notify instead of a truncated stream.
    async fn close(&mut self) {
        match tokio::time::timeout(self.timeout, self.transport.get_mut().shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "push connection did not close cleanly"),
            Err(_) => debug!("push connection close timed out"),
        }
    }
}

fn unexpected(reply: Reply) -> ClientError {
    ClientError::Protocol(format!("unexpected reply {reply:?}"))
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, ClientError> {
    match tokio::fs::read(path).await {
        Ok(bytes) if !bytes.is_empty() => Ok(Some(bytes)),
        Ok(_) => Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn write_private(path: &Path, bytes: &[u8]) -> Result<(), ClientError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, bytes).await?;
    Ok(())
}

pub struct PushClient {
    options: PushClientOptions,
    mesh: Mesh,
}

impl PushClient {
    pub fn new(options: PushClientOptions, mesh: Mesh) -> Self {
        Self { options, mesh }
    }

    /// Runs until `cancel` fires, reconnecting after every failure.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            address = %self.options.address,
            port = self.options.port,
            tls = self.options.ssl_enabled,
            "starting push client"
        );
        while !cancel.is_cancelled() {
            match self.session(&cancel).await {
                Ok(()) => break,
                Err(ClientError::Reconnect) => debug!("reconnecting to push server"),
                Err(e) => {
                    warn!(error = %e, "push session failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.options.push_interval) => {}
                    }
                }
            }
        }
        info!("push client stopped");
    }

    async fn session(&self, cancel: &CancellationToken) -> Result<(), ClientError> {
        let address = (self.options.address.as_str(), self.options.port);
        let tcp = tokio::time::timeout(self.options.timeout, TcpStream::connect(address))
            .await
            .map_err(|_| ClientError::Timeout(self.options.timeout))??;

        if !self.options.ssl_enabled {
            let mut conn = Connection::new(tcp, self.options.timeout);
            let result = self.converse(&mut conn, cancel).await;
            conn.close().await;
            return result;
        }

        let pinned = read_optional(&self.options.cert_path).await?;
        let connector = tls::connector(pinned.as_deref())?;
        let name = tls::server_name(&self.options.address)?;
        let stream = tokio::time::timeout(self.options.timeout, connector.connect(name, tcp))
            .await
            .map_err(|_| ClientError::Timeout(self.options.timeout))??;
        let mut conn = Connection::new(stream, self.options.timeout);

        let result = match pinned {
            None => self.fetch_certificate(&mut conn).await,
            Some(_) => self.converse(&mut conn, cancel).await,
        };
        conn.close().await;
        result
    }

    async fn fetch_certificate<S>(&self, conn: &mut Connection<S>) -> Result<(), ClientError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match conn.call(Call::GetServerCertificate).await? {
            Reply::Certificate(pem) => {
                tls::connector(Some(pem.as_bytes()))?;
                write_private(&self.options.cert_path, pem.as_bytes()).await?;
                info!(path = %self.options.cert_path.display(), "stored push server certificate");
                Err(ClientError::Reconnect)
            }
            other => Err(unexpected(other)),
        }
    }

    fn hello_request(&self, uuid_signature: Vec<u8>) -> HelloRequest {
        HelloRequest {
            hostname: self.mesh.hostname(),
            uuid: self.mesh.uuid(),
            uuid_signature,
        }
    }

    /// Register then wait for the operator's approval.
    async fn acquire_signature<S>(
        &self,
        conn: &mut Connection<S>,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match conn.call(Call::Register(self.hello_request(Vec::new()))).await? {
            Reply::Ack => {}
            other => return Err(unexpected(other)),
        }

        loop {
            match conn.call(Call::GetUuidSignature(self.hello_request(Vec::new()))).await {
                Ok(Reply::Signature(signature)) => {
                    write_private(&self.options.signature_path, &signature).await?;
                    info!("uuid signature received, client allowed");
                    return Err(ClientError::Reconnect);
                }
                Ok(other) => return Err(unexpected(other)),
                Err(ClientError::Rpc(PushError::Waiting)) => {
                    debug!("waiting for approval by the push server");
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(self.options.push_interval) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn converse<S>(&self, conn: &mut Connection<S>, cancel: &CancellationToken) -> Result<(), ClientError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let Some(signature) = read_optional(&self.options.signature_path).await? else {
            return self.acquire_signature(conn, cancel).await;
        };

        let token = match conn.call(Call::Hello(self.hello_request(signature))).await {
            Ok(Reply::Token(token)) => token,
            Ok(other) => return Err(unexpected(other)),
            Err(ClientError::Rpc(PushError::NotAllowed)) => {
                warn!("stored uuid signature refused, registering again");
                if let Err(e) = tokio::fs::remove_file(&self.options.signature_path).await {
                    warn!(error = %e, "cannot remove stale uuid signature");
                }
                return Err(ClientError::Reconnect);
            }
            Err(e) => return Err(e),
        };
        info!("push session established");

        let uuid = self.mesh.uuid();
        let mut interval = tokio::time::interval(self.options.push_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let goodbye = Call::Goodbye(Request { uuid: uuid.clone(), token: token.clone() });
                    if let Err(e) = conn.call(goodbye).await {
                        debug!(error = %e, "goodbye failed");
                    }
                    return Ok(());
                }
                _ = interval.tick() => {
                    let node = self
                        .mesh
                        .serialize(1)
                        .to_json()
                        .map_err(|e| ClientError::Protocol(e.to_string()))?;
                    let update = Call::Update(UpdateRequest { uuid: uuid.clone(), token: token.clone(), node });
                    match conn.call(update).await? {
                        Reply::Ack => debug!("snapshot pushed"),
                        other => return Err(unexpected(other)),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_close_ends_the_peer_stream() {
        let (client, server) = tokio::io::duplex(1024);
        let mut conn = Connection::new(client, Duration::from_secs(1));
        let mut peer = framed(server);

        conn.close().await;
        assert!(read_frame::<_, RpcRequest>(&mut peer).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_call_matches_response_id() {
        let (client, server) = tokio::io::duplex(4096);
        let mut conn = Connection::new(client, Duration::from_secs(1));
        let mut peer = framed(server);

        let answer = tokio::spawn(async move {
            let request: RpcRequest = read_frame(&mut peer).await.unwrap().unwrap();
            let response = RpcResponse {
                id: request.id,
                result: Err(PushError::CapacityExceeded(3)),
            };
            write_frame(&mut peer, &response).await.unwrap();
        });

        let result = conn.call(Call::GetServerCertificate).await;
        assert!(matches!(result, Err(ClientError::Rpc(PushError::CapacityExceeded(3)))));
        answer.await.unwrap();
    }
}
