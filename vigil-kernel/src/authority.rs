/**
 * AUTHORITY - Identity registrar of the push server
 *
 * ROLE: Decides which push clients may report to this node and hands out the
 * credentials they use.
 *
 * OPERATION:
 * - New clients land in a bounded waiting list until an operator allows them
 * - Allowed clients are persisted as `uuid hostname` lines
 * - An allowed uuid gets an RSA PKCS#1 v1.5 signature of SHA-256(uuid)
 * - Presenting that signature yields a session token (one live token per uuid)
 *
 * INVARIANTS: a uuid is never waiting and allowed at the same time; tokens
 * live in memory only and die with the process.
 */

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::CertificateDer;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};
use vigil_core::{unix_now, Event};

use crate::mesh::Mesh;

#[derive(Debug, Error)]
pub enum AuthorityError {
    #[error("waiting list is full ({0} clients)")]
    CapacityExceeded(usize),
    #[error("unknown client {0}")]
    UnknownUuid(String),
    #[error("client {0} is not allowed")]
    NotAllowed(String),
    #[error("uuid signature does not verify")]
    InvalidSignature,
    #[error("invalid or expired token")]
    InvalidToken,
    #[error("private key: {0}")]
    Key(String),
    #[error("certificate: {0}")]
    Certificate(String),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenEntry {
    pub uuid: String,
    pub issued_at: i64,
}

/// Read-only view for the admin API.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Clients {
    pub waiting: BTreeMap<String, String>,
    pub allowed: BTreeMap<String, String>,
}

#[derive(Default)]
struct Registry {
    waiting: BTreeMap<String, String>,
    allowed: BTreeMap<String, String>,
    tokens: HashMap<String, TokenEntry>,
}

impl Registry {
    fn drop_tokens_of(&mut self, uuid: &str) {
        self.tokens.retain(|_, entry| entry.uuid != uuid);
    }
}

pub struct Authority {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
    certificate: String,
    allowed_file: PathBuf,
    max_waiting_clients: usize,
    registry: Mutex<Registry>,
    mesh: Option<Mesh>,
}

fn io_err(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> AuthorityError {
    let context = context.into();
    move |source| AuthorityError::Io { context, source }
}

fn parse_private_key(pem: &str) -> Result<RsaPrivateKey, AuthorityError> {
    RsaPrivateKey::from_pkcs1_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs8_pem(pem))
        .map_err(|e| AuthorityError::Key(e.to_string()))
}

/// Parses `uuid hostname` lines, skipping anything else.
fn parse_allowed(text: &str) -> BTreeMap<String, String> {
    let mut allowed = BTreeMap::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.split_once(char::is_whitespace) {
            Some((uuid, hostname)) if !hostname.trim().is_empty() => {
                allowed.insert(uuid.to_string(), hostname.trim().to_string());
            }
            _ => warn!(line = index + 1, "skipping malformed allowed client entry"),
        }
    }
    allowed
}

impl Authority {
    /// Loads the key pair and certificate from PEM files and the allowed list
    /// from `allowed_file` (a missing file is an empty list).
    pub fn load(
        cert_path: &Path,
        key_path: &Path,
        allowed_file: impl Into<PathBuf>,
        max_waiting_clients: usize,
    ) -> Result<Self, AuthorityError> {
        let certificate = std::fs::read_to_string(cert_path)
            .map_err(io_err(format!("reading certificate {}", cert_path.display())))?;
        let key = std::fs::read_to_string(key_path)
            .map_err(io_err(format!("reading private key {}", key_path.display())))?;
        Self::from_pem(certificate, &key, allowed_file, max_waiting_clients)
    }

    pub fn from_pem(
        certificate: String,
        key_pem: &str,
        allowed_file: impl Into<PathBuf>,
        max_waiting_clients: usize,
    ) -> Result<Self, AuthorityError> {
        CertificateDer::from_pem_slice(certificate.as_bytes())
            .map_err(|e| AuthorityError::Certificate(e.to_string()))?;
        let private_key = parse_private_key(key_pem)?;
        let public_key = private_key.to_public_key();

        let allowed_file = allowed_file.into();
        let allowed = match std::fs::read_to_string(&allowed_file) {
            Ok(text) => parse_allowed(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(io_err(format!("reading {}", allowed_file.display()))(e)),
        };
        info!(allowed = allowed.len(), "authority ready");

        Ok(Self {
            private_key,
            public_key,
            certificate,
            allowed_file,
            max_waiting_clients,
            registry: Mutex::new(Registry {
                allowed,
                ..Registry::default()
            }),
            mesh: None,
        })
    }

    /// Attaches the tree so revocations drop the client and new clients are notified.
    pub fn with_mesh(mut self, mesh: Mesh) -> Self {
        self.mesh = Some(mesh);
        self
    }

    pub fn certificate(&self) -> &str {
        &self.certificate
    }

    /// Writes `allowed` to disk. Callers swap it into the registry only once
    /// this succeeds, so memory never runs ahead of the file.
    fn persist(&self, allowed: &BTreeMap<String, String>) -> Result<(), AuthorityError> {
        let mut text = String::new();
        for (uuid, hostname) in allowed {
            text.push_str(uuid);
            text.push(' ');
            text.push_str(hostname);
            text.push('\n');
        }
        if let Some(parent) = self.allowed_file.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(io_err(format!("creating {}", parent.display())))?;
        }
        std::fs::write(&self.allowed_file, text)
            .map_err(io_err(format!("writing {}", self.allowed_file.display())))
    }

    pub fn is_allowed(&self, uuid: &str) -> bool {
        self.registry.lock().allowed.contains_key(uuid)
    }

    pub fn is_waiting(&self, uuid: &str) -> bool {
        self.registry.lock().waiting.contains_key(uuid)
    }

    pub fn clients(&self) -> Clients {
        let registry = self.registry.lock();
        Clients {
            waiting: registry.waiting.clone(),
            allowed: registry.allowed.clone(),
        }
    }

    /// Queues a client for approval. Known clients are left untouched.
    pub fn add_client_to_waiting_list(&self, uuid: &str, hostname: &str) -> Result<(), AuthorityError> {
        {
            let mut registry = self.registry.lock();
            if registry.allowed.contains_key(uuid) || registry.waiting.contains_key(uuid) {
                return Ok(());
            }
            if registry.waiting.len() >= self.max_waiting_clients {
                return Err(AuthorityError::CapacityExceeded(self.max_waiting_clients));
            }
            registry.waiting.insert(uuid.to_string(), hostname.to_string());
        }

        info!(uuid, hostname, "new client waiting for approval");
        if let Some(mesh) = &self.mesh {
            mesh.notify(Event::info(format!("New client {hostname} ({uuid}) is waiting for approval")));
        }
        Ok(())
    }

    pub fn allow_client(&self, uuid: &str) -> Result<(), AuthorityError> {
        let mut registry = self.registry.lock();
        let hostname = registry
            .waiting
            .get(uuid)
            .cloned()
            .ok_or_else(|| AuthorityError::UnknownUuid(uuid.to_string()))?;

        let mut allowed = registry.allowed.clone();
        allowed.insert(uuid.to_string(), hostname.clone());
        self.persist(&allowed)?;

        registry.allowed = allowed;
        registry.waiting.remove(uuid);
        info!(uuid, hostname = %hostname, "client allowed");
        Ok(())
    }

    /// Forgets a client: lists, tokens and its subtree in the live tree.
    ///
    /// Tokens and the subtree are dropped even when the allowed list cannot
    /// be written; the client then stays allowed, matching the file.
    pub fn revoke_client(&self, uuid: &str) -> Result<(), AuthorityError> {
        let persisted = {
            let mut registry = self.registry.lock();
            let waiting = registry.waiting.remove(uuid).is_some();
            let allowed = registry.allowed.contains_key(uuid);
            if !waiting && !allowed {
                return Err(AuthorityError::UnknownUuid(uuid.to_string()));
            }
            registry.drop_tokens_of(uuid);

            if allowed {
                let mut remaining = registry.allowed.clone();
                remaining.remove(uuid);
                let persisted = self.persist(&remaining);
                if persisted.is_ok() {
                    registry.allowed = remaining;
                }
                persisted
            } else {
                Ok(())
            }
        };

        if let Some(mesh) = &self.mesh {
            mesh.remove_child(uuid);
        }
        match &persisted {
            Ok(()) => info!(uuid, "client revoked"),
            Err(e) => warn!(uuid, error = %e, "client sessions dropped but allowed list not updated"),
        }
        persisted
    }

    fn digest(uuid: &str) -> Vec<u8> {
        Sha256::digest(uuid.as_bytes()).to_vec()
    }

    pub fn get_uuid_signature(&self, uuid: &str) -> Result<Vec<u8>, AuthorityError> {
        if !self.is_allowed(uuid) {
            return Err(AuthorityError::NotAllowed(uuid.to_string()));
        }
        self.private_key
            .sign(Pkcs1v15Sign::new::<Sha256>(), &Self::digest(uuid))
            .map_err(|e| AuthorityError::Key(e.to_string()))
    }

    pub fn verify_uuid_signature(&self, uuid: &str, signature: &[u8]) -> Result<(), AuthorityError> {
        self.public_key
            .verify(Pkcs1v15Sign::new::<Sha256>(), &Self::digest(uuid), signature)
            .map_err(|_| AuthorityError::InvalidSignature)
    }

    /// Issues a fresh token for `uuid`, replacing any previous one.
    pub fn get_token(&self, uuid: &str) -> String {
        let token = uuid::Uuid::new_v4().to_string();
        let mut registry = self.registry.lock();
        registry.drop_tokens_of(uuid);
        registry.tokens.insert(
            token.clone(),
            TokenEntry {
                uuid: uuid.to_string(),
                issued_at: unix_now(),
            },
        );
        token
    }

    pub fn verify_token(&self, uuid: &str, token: &str) -> Result<TokenEntry, AuthorityError> {
        match self.registry.lock().tokens.get(token) {
            Some(entry) if entry.uuid == uuid => Ok(entry.clone()),
            _ => Err(AuthorityError::InvalidToken),
        }
    }

    pub fn revoke_token(&self, token: &str) -> bool {
        self.registry.lock().tokens.remove(token).is_some()
    }

    pub fn token_count(&self) -> usize {
        self.registry.lock().tokens.len()
    }
}
