//! Typed registry views over the store.
//!
//! The store is the sole source of truth; registries keep no caches.
//! Every domain entity is serialized as JSON into its reserved system
//! ledger under the key `{type}.{id}`; an update is a fresh transaction
//! with the same key, and reads take the latest write.

use cocoon_core::ledger::Transaction;
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::store::{StoreError, StoreTxn};

mod cocoon;
mod identity;
mod release;

pub use cocoon::CocoonRegistry;
pub use identity::IdentityRegistry;
pub use release::{ReleaseRegistry, VoteOutcome};

/// Storage key for an entity of the given kind.
pub(crate) fn entity_key(kind: &str, id: &str) -> String {
    format!("{kind}.{id}")
}

/// Reads the latest version of an entity, if any.
pub(crate) fn read_entity<T: DeserializeOwned>(
    txn: &StoreTxn<'_>,
    ledger: &str,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match txn.latest(ledger, key)? {
        Some(tx) => Ok(Some(serde_json::from_str(&tx.value)?)),
        None => Ok(None),
    }
}

/// Persists an entity as a fresh transaction under its key.
///
/// With `insert_once` the append fails if any transaction for the key
/// exists; the guard read shares the caller's transaction.
pub(crate) fn write_entity<T: Serialize>(
    txn: &StoreTxn<'_>,
    ledger: &str,
    key: &str,
    entity: &T,
    insert_once: bool,
) -> Result<Transaction, StoreError> {
    let value = serde_json::to_string(entity)?;
    let id = Uuid::new_v4().to_string();
    if insert_once {
        txn.put_new(ledger, &id, key, &value)
    } else {
        txn.put(ledger, &id, key, &value)
    }
}
