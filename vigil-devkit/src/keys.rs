//! Key material for authority tests.
//!
//! The certificate is an opaque PEM blob: nothing in the push protocol parses
//! it as X.509, clients only pin its bytes.

use std::sync::OnceLock;

use rsa::pkcs1::{EncodeRsaPrivateKey, LineEnding};
use rsa::RsaPrivateKey;

pub const TEST_CERT_PEM: &str = "-----BEGIN CERTIFICATE-----\nAAECAwQFBgcICQ==\n-----END CERTIFICATE-----\n";

/// PKCS#1 PEM of a small RSA key, generated once per test binary.
pub fn test_authority_material() -> String {
    static KEY: OnceLock<String> = OnceLock::new();
    KEY.get_or_init(|| {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).expect("generate test RSA key");
        key.to_pkcs1_pem(LineEnding::LF)
            .expect("encode test RSA key")
            .to_string()
    })
    .clone()
}
