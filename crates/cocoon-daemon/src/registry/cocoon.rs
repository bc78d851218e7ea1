//! Cocoon registry.
//!
//! Authoritative validation lives here: the control API mirrors the
//! cheap checks for early rejection, but cross-entity rules (signatory
//! existence, link targets) are enforced inside the registry's store
//! transaction.

use cocoon_core::cocoon::{Cocoon, CocoonStatus};
use cocoon_core::error::{ApiError, ApiResult, ErrorCode};
use cocoon_core::ledger::COCOON_LEDGER;

use super::identity::IdentityRegistry;
use super::{entity_key, read_entity, write_entity};
use crate::store::{SqliteStore, StoreError, StoreTxn};

/// Typed view over cocoon records in the cocoon ledger.
#[derive(Debug, Clone)]
pub struct CocoonRegistry {
    store: SqliteStore,
}

impl CocoonRegistry {
    /// Creates a registry over the given store.
    #[must_use]
    pub const fn new(store: SqliteStore) -> Self {
        Self { store }
    }

    /// Registers a cocoon after full validation, failing if the ID is
    /// taken.
    ///
    /// # Errors
    ///
    /// Returns a validation error or [`ErrorCode::CocoonAlreadyExists`].
    pub fn create(&self, cocoon: Cocoon) -> ApiResult<Cocoon> {
        self.persist(cocoon, true)
    }

    /// Registers or replaces a cocoon after full validation.
    ///
    /// # Errors
    ///
    /// Returns a validation or store error.
    pub fn upsert(&self, cocoon: Cocoon) -> ApiResult<Cocoon> {
        self.persist(cocoon, false)
    }

    /// Unknown signatories and a dangling link target are rejected;
    /// duplicate signatories are dropped before the capacity check, per
    /// the additive-set semantics of the signatory list.
    fn persist(&self, mut cocoon: Cocoon, insert_once: bool) -> ApiResult<Cocoon> {
        let mut seen = std::collections::BTreeSet::new();
        cocoon.signatories.retain(|s| seen.insert(s.clone()));
        cocoon.validate()?;

        let key = entity_key("cocoon", &cocoon.id);
        let result = self.store.with_txn(|txn| {
            for signatory in &cocoon.signatories {
                if !IdentityRegistry::exists_in(txn, signatory)? {
                    return Err(ApiError::new(
                        ErrorCode::IdentityNotFound,
                        format!("signatory '{signatory}' is not a registered identity"),
                    )
                    .into());
                }
            }
            if !cocoon.repo.link.is_empty() && load(txn, &cocoon.repo.link)?.is_none() {
                return Err(ApiError::invalid_field(
                    "repo.link",
                    format!("linked cocoon '{}' does not exist", cocoon.repo.link),
                )
                .into());
            }
            write_entity(txn, COCOON_LEDGER, &key, &cocoon, insert_once)
        });
        match result {
            Ok(_) => Ok(cocoon),
            Err(StoreError::KeyExists { .. }) => Err(ApiError::new(
                ErrorCode::CocoonAlreadyExists,
                format!("cocoon '{}' already exists", cocoon.id),
            )),
            Err(err) => Err(err.into()),
        }
    }

    /// Reads a cocoon by ID.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::CocoonNotFound`] if absent.
    pub fn get(&self, id: &str) -> ApiResult<Cocoon> {
        let cocoon = self
            .store
            .with_txn(|txn| load(txn, id))
            .map_err(ApiError::from)?;
        cocoon.ok_or_else(|| ApiError::cocoon_not_found(id))
    }

    /// Read-modify-write of a cocoon inside one store transaction.
    ///
    /// The mutated record is re-validated before persisting.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::CocoonNotFound`] if absent, the closure's
    /// error, or a validation error.
    pub fn update(
        &self,
        id: &str,
        mutate: impl Fn(&mut Cocoon) -> ApiResult<()>,
    ) -> ApiResult<Cocoon> {
        self.store
            .with_txn(|txn| {
                let mut cocoon = load(txn, id)?.ok_or_else(|| ApiError::cocoon_not_found(id))?;
                mutate(&mut cocoon)?;
                cocoon.validate()?;
                write_entity(txn, COCOON_LEDGER, &entity_key("cocoon", id), &cocoon, false)?;
                Ok(cocoon)
            })
            .map_err(ApiError::from)
    }

    /// Extends the signatory set with the union of `identities`.
    ///
    /// Additive and idempotent: unknown identities are skipped with a
    /// warning, already-present ones are skipped silently. Returns the
    /// number actually added.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::CocoonNotFound`] if absent, or a capacity
    /// validation error when the union exceeds `num_signatories`.
    pub fn add_signatories(&self, id: &str, identities: &[String]) -> ApiResult<u32> {
        self.store
            .with_txn(|txn| {
                let mut cocoon = load(txn, id)?.ok_or_else(|| ApiError::cocoon_not_found(id))?;
                let mut added = 0u32;
                for identity in identities {
                    if cocoon.is_signatory(identity) {
                        continue;
                    }
                    if !IdentityRegistry::exists_in(txn, identity)? {
                        tracing::warn!(cocoon = %id, signatory = %identity, "skipping unknown signatory");
                        continue;
                    }
                    cocoon.signatories.push(identity.clone());
                    added += 1;
                }
                if added == 0 {
                    return Ok(0);
                }
                cocoon.validate()?;
                write_entity(txn, COCOON_LEDGER, &entity_key("cocoon", id), &cocoon, false)?;
                Ok(added)
            })
            .map_err(ApiError::from)
    }

    /// Transitions a cocoon to `stopped`.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::CocoonNotFound`] if absent.
    pub fn stop(&self, id: &str) -> ApiResult<Cocoon> {
        self.update(id, |cocoon| {
            cocoon.status = CocoonStatus::Stopped;
            Ok(())
        })
    }

    /// Loads a cocoon inside the caller's transaction.
    pub(crate) fn load_in(txn: &StoreTxn<'_>, id: &str) -> Result<Option<Cocoon>, StoreError> {
        load(txn, id)
    }
}

fn load(txn: &StoreTxn<'_>, id: &str) -> Result<Option<Cocoon>, StoreError> {
    read_entity(txn, COCOON_LEDGER, &entity_key("cocoon", id))
}
