//! Identity entity and stable ID derivation.
//!
//! An identity is a human or agent actor. Its ID is derived from the
//! email (`sha256(email)`), giving signatory references a stable handle
//! that survives record rewrites.

use serde::{Deserialize, Serialize};

use crate::ledger::sha256_hex;

/// Derives the stable identity ID for an email address.
#[must_use]
pub fn identity_id(email: &str) -> String {
    sha256_hex(&[email])
}

/// A human or agent actor registered with the platform.
///
/// The record stores only the password digest produced by the hashing
/// collaborator, never the password, and only session-token digests,
/// never tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Unique email address.
    pub email: String,
    /// Digest produced by the password-hashing collaborator.
    pub password_hash: String,
    /// IDs of cocoons this identity owns or co-signs.
    #[serde(default)]
    pub cocoons: Vec<String>,
    /// SHA-256 digests of active session tokens.
    #[serde(default)]
    pub client_sessions: Vec<String>,
}

impl Identity {
    /// Creates an identity with no cocoons and no sessions.
    pub fn new(email: impl Into<String>, password_hash: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password_hash: password_hash.into(),
            cocoons: Vec::new(),
            client_sessions: Vec::new(),
        }
    }

    /// The stable derived ID used as a signatory reference.
    #[must_use]
    pub fn id(&self) -> String {
        identity_id(&self.email)
    }

    /// Links a cocoon, ignoring duplicates. Returns `true` if added.
    pub fn add_cocoon(&mut self, cocoon_id: &str) -> bool {
        if self.cocoons.iter().any(|c| c == cocoon_id) {
            return false;
        }
        self.cocoons.push(cocoon_id.to_string());
        true
    }
}

/// Client-facing view of an identity.
///
/// Strips the password digest and session digests before anything
/// leaves the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityView {
    /// Stable derived ID.
    pub id: String,
    /// Email address.
    pub email: String,
    /// Linked cocoon IDs.
    pub cocoons: Vec<String>,
}

impl From<&Identity> for IdentityView {
    fn from(identity: &Identity) -> Self {
        Self {
            id: identity.id(),
            email: identity.email.clone(),
            cocoons: identity.cocoons.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_is_stable_and_email_sensitive() {
        let a = identity_id("alice@example.com");
        assert_eq!(a, identity_id("alice@example.com"));
        assert_ne!(a, identity_id("bob@example.com"));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn add_cocoon_deduplicates() {
        let mut identity = Identity::new("alice@example.com", "digest");
        assert!(identity.add_cocoon("c1"));
        assert!(!identity.add_cocoon("c1"));
        assert!(identity.add_cocoon("c2"));
        assert_eq!(identity.cocoons, vec!["c1", "c2"]);
    }

    #[test]
    fn view_strips_secrets() {
        let mut identity = Identity::new("alice@example.com", "digest");
        identity.client_sessions.push("session-digest".to_string());
        let view = IdentityView::from(&identity);
        let json = serde_json::to_string(&view).unwrap();
        assert!(!json.contains("digest"));
        assert_eq!(view.id, identity.id());
    }
}
