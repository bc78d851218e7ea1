//! Ledger and transaction entities with their hash derivations.
//!
//! A ledger is a named, append-only namespace of transactions. A
//! transaction is an immutable keyed record; in a *chained* ledger every
//! transaction links to its predecessor by hash, and the predecessor's
//! `next_tx_hash` back-link is filled in exactly once when the successor
//! is appended. The storage backend owns linearization; this module owns
//! the data model and the deterministic derivations:
//!
//! - ledger hash: `sha256(name . public . created_at)`
//! - transaction hash: `sha256(id . b64(key) . b64(value) . prev . created_at)`
//! - derived ledger name: `sha256(namespace . logical_name)`
//!
//! Fields are joined with `.` before hashing; key and value are base64
//! encoded first so the separator cannot be forged from inside a field.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Name of the reserved global ledger.
///
/// The global ledger is created at store initialization and its name is
/// namespace-independent: [`make_ledger_name`] returns it unchanged for
/// any namespace.
pub const GLOBAL_LEDGER: &str = "global";

/// Reserved system ledger holding identity records.
pub const IDENTITY_LEDGER: &str = "identity";

/// Reserved system ledger holding cocoon records.
pub const COCOON_LEDGER: &str = "cocoon";

/// Reserved system ledger holding release records.
pub const RELEASE_LEDGER: &str = "release";

/// Hex-encoded SHA-256 of `.`-joined parts.
#[must_use]
pub fn sha256_hex(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update(b".");
        }
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Derives the stable storage name of a ledger from a namespace and a
/// logical name.
///
/// Reserved ledger names (the global ledger and the system ledgers) are
/// returned unchanged regardless of namespace, so platform components
/// and user code resolve them identically. All other names hash to
/// `sha256(namespace . logical_name)`, which isolates tenants sharing a
/// logical name.
#[must_use]
pub fn make_ledger_name(namespace: &str, logical_name: &str) -> String {
    if is_reserved_ledger(logical_name) {
        return logical_name.to_string();
    }
    sha256_hex(&[namespace, logical_name])
}

/// Returns `true` for ledger names reserved by the platform.
#[must_use]
pub fn is_reserved_ledger(name: &str) -> bool {
    matches!(
        name,
        GLOBAL_LEDGER | IDENTITY_LEDGER | COCOON_LEDGER | RELEASE_LEDGER
    )
}

/// Computes a ledger's hash from its identity fields.
#[must_use]
pub fn ledger_hash(name: &str, public: bool, created_at: i64) -> String {
    sha256_hex(&[name, if public { "true" } else { "false" }, &created_at.to_string()])
}

/// Computes a transaction's hash from its content and chain position.
///
/// `prev_tx_hash` is empty for the first transaction of a chained
/// ledger and for every transaction of an unchained ledger.
#[must_use]
pub fn transaction_hash(
    id: &str,
    key: &str,
    value: &str,
    prev_tx_hash: &str,
    created_at: i64,
) -> String {
    sha256_hex(&[
        id,
        &BASE64.encode(key.as_bytes()),
        &BASE64.encode(value.as_bytes()),
        prev_tx_hash,
        &created_at.to_string(),
    ])
}

/// An isolated namespace for transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ledger {
    /// Monotonic row number assigned by the store.
    pub number: i64,
    /// Globally unique storage name (derived; see [`make_ledger_name`]).
    pub name: String,
    /// Hash over the ledger's identity fields.
    pub hash: String,
    /// Advisory cross-cocoon read permission hint. Enforcement belongs
    /// to the external ACL interpreter, not the core.
    pub public: bool,
    /// If `true`, transactions in this ledger form a hash chain.
    pub chained: bool,
    /// Creation time, unix seconds.
    pub created_at: i64,
}

/// An immutable record in a ledger.
///
/// `next_tx_hash` is the only field ever mutated after insert: it is
/// filled in exactly once when the next transaction of the same chained
/// ledger is appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Monotonic row number assigned by the store. Tie-breaks for
    /// "latest" and "tail" use this, never `created_at`.
    pub number: i64,
    /// Caller-supplied ID, unique across all transactions.
    pub id: String,
    /// Storage name of the owning ledger.
    pub ledger: String,
    /// Opaque key; latest-write-wins reads are keyed on this.
    pub key: String,
    /// Opaque value; may be large.
    pub value: String,
    /// Hash over content and chain position; see [`transaction_hash`].
    pub hash: String,
    /// Hash of the predecessor in a chained ledger, empty otherwise.
    pub prev_tx_hash: String,
    /// Back-link to the successor; empty until one is appended.
    pub next_tx_hash: String,
    /// Creation time, unix seconds. Advisory only.
    pub created_at: i64,
}

impl Transaction {
    /// Recomputes this transaction's hash from its fields.
    #[must_use]
    pub fn computed_hash(&self) -> String {
        transaction_hash(
            &self.id,
            &self.key,
            &self.value,
            &self.prev_tx_hash,
            self.created_at,
        )
    }

    /// Returns `true` if the stored hash matches the recomputation.
    #[must_use]
    pub fn hash_is_valid(&self) -> bool {
        self.hash == self.computed_hash()
    }
}

/// Verifies the chain invariant over transactions of one chained
/// ledger, ordered by row number.
///
/// Checks, for every adjacent pair, that the back-link and forward
/// link agree, and that every stored hash recomputes. Returns the row
/// number of the first offending transaction.
pub fn verify_chain(transactions: &[Transaction]) -> Result<(), i64> {
    let mut prev: Option<&Transaction> = None;
    for tx in transactions {
        if !tx.hash_is_valid() {
            return Err(tx.number);
        }
        match prev {
            None => {
                if !tx.prev_tx_hash.is_empty() {
                    return Err(tx.number);
                }
            },
            Some(p) => {
                if tx.prev_tx_hash != p.hash || p.next_tx_hash != tx.hash {
                    return Err(tx.number);
                }
            },
        }
        prev = Some(tx);
    }
    if let Some(tail) = prev {
        if !tail.next_tx_hash.is_empty() {
            return Err(tail.number);
        }
    }
    Ok(())
}
