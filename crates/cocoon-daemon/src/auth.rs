//! Sessions and password hashing.
//!
//! Tokens are 256-bit random values handed to the client once; the
//! platform keeps only their SHA-256 digests, both in the in-memory
//! session table and on the identity record. Sessions do not survive a
//! daemon restart; the persisted digests exist so a stale record never
//! reveals a usable credential.

// Mutex poisoning indicates a panic in another thread, which is
// unrecoverable.
#![allow(clippy::missing_panics_doc)]

use std::collections::HashMap;
use std::sync::Mutex;

use cocoon_core::error::{ApiError, ApiResult, ErrorCode};
use cocoon_core::identity::Identity;
use cocoon_core::ledger::sha256_hex;
use rand::RngCore;

/// Hashes and verifies passwords.
///
/// The registry stores only the produced digest string; swapping the
/// scheme means swapping this collaborator.
pub trait PasswordHasher: Send + Sync {
    /// Produces a self-describing digest for a password.
    fn hash(&self, password: &str) -> String;

    /// Verifies a password against a stored digest.
    fn verify(&self, password: &str, digest: &str) -> bool;
}

/// Salted SHA-256 password hashing.
///
/// Digest format: `sha256$<salt_hex>$<digest_hex>` with
/// `digest = sha256(salt_hex . password)`.
#[derive(Debug, Default)]
pub struct Sha256PasswordHasher;

impl PasswordHasher for Sha256PasswordHasher {
    fn hash(&self, password: &str) -> String {
        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        let salt_hex = hex::encode(salt);
        let digest = sha256_hex(&[&salt_hex, password]);
        format!("sha256${salt_hex}${digest}")
    }

    fn verify(&self, password: &str, digest: &str) -> bool {
        let mut parts = digest.split('$');
        let (Some("sha256"), Some(salt_hex), Some(expected)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return false;
        };
        sha256_hex(&[salt_hex, password]) == expected
    }
}

/// In-memory session table keyed by token digest.
#[derive(Debug, Default)]
pub struct SessionAuth {
    sessions: Mutex<HashMap<String, String>>,
}

impl SessionAuth {
    /// Creates an empty session table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mints a session token for an identity.
    ///
    /// Returns the plaintext token for the client and the digest to
    /// persist on the identity record.
    #[must_use]
    pub fn mint(&self, email: &str) -> (String, String) {
        let mut raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        let token = hex::encode(raw);
        let digest = sha256_hex(&[&token]);
        self.sessions
            .lock()
            .unwrap()
            .insert(digest.clone(), email.to_string());
        (token, digest)
    }

    /// Resolves a token to the identity email it was minted for.
    ///
    /// The identity record is the authority on revocation: a token
    /// whose digest was removed from `client_sessions` fails here even
    /// if the in-memory table still knows it.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::NoActiveSession`] for an empty token,
    /// [`ErrorCode::InvalidOrExpiredToken`] otherwise.
    pub fn verify(&self, token: &str, identity_of: impl FnOnce(&str) -> Option<Identity>) -> ApiResult<Identity> {
        if token.is_empty() {
            return Err(ApiError::new(
                ErrorCode::NoActiveSession,
                "this method requires a session token",
            ));
        }
        let digest = sha256_hex(&[token]);
        let email = self
            .sessions
            .lock()
            .unwrap()
            .get(&digest)
            .cloned()
            .ok_or_else(invalid_token)?;
        let identity = identity_of(&email).ok_or_else(invalid_token)?;
        if identity.client_sessions.iter().any(|d| d == &digest) {
            Ok(identity)
        } else {
            self.sessions.lock().unwrap().remove(&digest);
            Err(invalid_token())
        }
    }

    /// Drops the session for a token. Returns the digest that was
    /// removed, for the caller to strip from the identity record.
    #[must_use]
    pub fn revoke(&self, token: &str) -> String {
        let digest = sha256_hex(&[token]);
        self.sessions.lock().unwrap().remove(&digest);
        digest
    }

    /// Drops every session of an identity.
    pub fn revoke_all(&self, email: &str) {
        self.sessions.lock().unwrap().retain(|_, e| e != email);
    }
}

fn invalid_token() -> ApiError {
    ApiError::new(
        ErrorCode::InvalidOrExpiredToken,
        "session token is invalid or expired",
    )
}
