//! Authentication plugins.
//!
//! # mysql_native_password
//!
//! ```text
//! SHA1(password) XOR SHA1(salt + SHA1(SHA1(password)))
//! ```
//!
//! # caching_sha2_password
//!
//! Fast path, when the server has the account cached:
//! ```text
//! SHA256(password) XOR SHA256(SHA256(SHA256(password)) + salt)
//! ```
//!
//! A cache miss asks for full authentication: the cleartext password over
//! TLS, or the password encrypted with the server's RSA key otherwise.

use rand::rngs::OsRng;
use rsa::RsaPublicKey;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tidewire_core::Error;
use tidewire_core::error::{ConnectionError, ConnectionErrorKind};

/// Length of the native-password scramble and of the salt it uses.
pub const SCRAMBLE_LENGTH: usize = 20;

pub mod plugins {
    pub const MYSQL_NATIVE_PASSWORD: &str = "mysql_native_password";
    pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";
}

/// Second byte of an AuthMoreData (0x01) packet during caching_sha2 auth.
pub mod caching_sha2 {
    /// Client asks for the server's RSA public key
    pub const REQUEST_PUBLIC_KEY: u8 = 0x02;
    pub const FAST_AUTH_SUCCESS: u8 = 0x03;
    pub const PERFORM_FULL_AUTH: u8 = 0x04;
}

/// Whether this client can answer for `plugin`.
pub fn is_supported(plugin: &str) -> bool {
    plugin.is_empty()
        || plugin == plugins::MYSQL_NATIVE_PASSWORD
        || plugin == plugins::CACHING_SHA2_PASSWORD
}

/// First auth response for `plugin`, or `None` if the plugin is unknown.
pub fn auth_response(plugin: &str, password: &str, salt: &[u8]) -> Option<Vec<u8>> {
    match plugin {
        "" | plugins::MYSQL_NATIVE_PASSWORD => Some(scramble(password, salt)),
        plugins::CACHING_SHA2_PASSWORD => Some(scramble_sha256(password, salt)),
        _ => None,
    }
}

/// mysql_native_password scramble; empty for an empty password.
pub fn scramble(password: &str, salt: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let salt = &salt[..salt.len().min(SCRAMBLE_LENGTH)];

    let stage1 = Sha1::digest(password.as_bytes());
    let stage2 = Sha1::digest(stage1);
    let mut hasher = Sha1::new();
    hasher.update(salt);
    hasher.update(stage2);
    let stage3 = hasher.finalize();

    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

/// caching_sha2_password fast-path scramble; empty for an empty password.
pub fn scramble_sha256(password: &str, salt: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let salt = salt.strip_suffix(&[0]).unwrap_or(salt);

    let digest1 = Sha256::digest(password.as_bytes());
    let digest2 = Sha256::digest(digest1);
    let mut hasher = Sha256::new();
    hasher.update(digest2);
    hasher.update(salt);
    let digest3 = hasher.finalize();

    digest1.iter().zip(digest3.iter()).map(|(a, b)| a ^ b).collect()
}

/// Full-auth payload over TLS: the password, NUL terminated.
pub fn cleartext_password(password: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(password.len() + 1);
    out.extend_from_slice(password.as_bytes());
    out.push(0);
    out
}

/// Full-auth payload without TLS: `(password + NUL) XOR salt`, encrypted
/// with the server's public key using OAEP padding.
pub fn encrypt_password(password: &str, salt: &[u8], public_key_pem: &[u8]) -> Result<Vec<u8>, Error> {
    let salt = salt.strip_suffix(&[0]).unwrap_or(salt);
    if salt.is_empty() {
        return Err(auth_error("Server sent an empty authentication salt"));
    }
    let mut message = cleartext_password(password);
    for (i, b) in message.iter_mut().enumerate() {
        *b ^= salt[i % salt.len()];
    }

    let pem = std::str::from_utf8(public_key_pem)
        .map_err(|e| auth_error(format!("Public key is not valid PEM: {}", e)))?;
    let key = RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| auth_error(format!("Failed to parse RSA public key: {}", e)))?;
    key.encrypt(&mut OsRng, rsa::Oaep::new::<Sha1>(), &message)
        .map_err(|e| auth_error(format!("RSA encryption failed: {}", e)))
}

pub(crate) fn auth_error(message: impl Into<String>) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Authentication,
        message: message.into(),
        source: None,
    })
}
