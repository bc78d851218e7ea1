//! Identity registry.

use cocoon_core::error::{ApiError, ApiResult, ErrorCode};
use cocoon_core::identity::{Identity, identity_id};
use cocoon_core::ledger::IDENTITY_LEDGER;

use super::{entity_key, read_entity, write_entity};
use crate::store::{SqliteStore, StoreError, StoreTxn};

/// Typed view over identity records in the identity ledger.
#[derive(Debug, Clone)]
pub struct IdentityRegistry {
    store: SqliteStore,
}

impl IdentityRegistry {
    /// Creates a registry over the given store.
    #[must_use]
    pub const fn new(store: SqliteStore) -> Self {
        Self { store }
    }

    /// Registers an identity, failing if the email is taken.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::IdentityAlreadyExists`] when the email is
    /// taken.
    pub fn create(&self, email: &str, password_hash: &str) -> ApiResult<Identity> {
        self.persist(email, password_hash, true)
    }

    /// Registers or replaces an identity.
    ///
    /// # Errors
    ///
    /// Returns a validation or store error.
    pub fn upsert(&self, email: &str, password_hash: &str) -> ApiResult<Identity> {
        self.persist(email, password_hash, false)
    }

    fn persist(&self, email: &str, password_hash: &str, insert_once: bool) -> ApiResult<Identity> {
        if email.is_empty() || !email.contains('@') {
            return Err(ApiError::invalid_field("email", "must be an email address"));
        }
        let identity = Identity::new(email, password_hash);
        let key = entity_key("identity", &identity.id());
        let result = self.store.with_txn(|txn| {
            write_entity(txn, IDENTITY_LEDGER, &key, &identity, insert_once)
        });
        match result {
            Ok(_) => Ok(identity),
            Err(StoreError::KeyExists { .. }) => Err(ApiError::new(
                ErrorCode::IdentityAlreadyExists,
                format!("identity '{email}' already exists"),
            )),
            Err(err) => Err(err.into()),
        }
    }

    /// Reads an identity by email or derived ID.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::IdentityNotFound`] if absent.
    pub fn get(&self, who: &str) -> ApiResult<Identity> {
        let id = resolve_id(who);
        let identity = self
            .store
            .with_txn(|txn| load(txn, &id))
            .map_err(ApiError::from)?;
        identity.ok_or_else(|| ApiError::identity_not_found(who))
    }

    /// Read-modify-write of an identity inside one store transaction.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::IdentityNotFound`] if absent, or the
    /// closure's error.
    pub fn update(
        &self,
        who: &str,
        mutate: impl Fn(&mut Identity) -> ApiResult<()>,
    ) -> ApiResult<Identity> {
        let id = resolve_id(who);
        let key = entity_key("identity", &id);
        self.store
            .with_txn(|txn| {
                let mut identity =
                    load(txn, &id)?.ok_or_else(|| ApiError::identity_not_found(who))?;
                mutate(&mut identity)?;
                write_entity(txn, IDENTITY_LEDGER, &key, &identity, false)?;
                Ok(identity)
            })
            .map_err(ApiError::from)
    }

    /// Links a cocoon to an identity; re-linking is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::IdentityNotFound`] if absent.
    pub fn add_cocoon(&self, email: &str, cocoon_id: &str) -> ApiResult<Identity> {
        self.update(email, |identity| {
            identity.add_cocoon(cocoon_id);
            Ok(())
        })
    }

    /// Returns `true` if an identity with this ID exists. Shares the
    /// caller's transaction.
    pub(crate) fn exists_in(txn: &StoreTxn<'_>, id: &str) -> Result<bool, StoreError> {
        Ok(load(txn, id)?.is_some())
    }
}

fn resolve_id(who: &str) -> String {
    if who.contains('@') {
        identity_id(who)
    } else {
        who.to_string()
    }
}

fn load(txn: &StoreTxn<'_>, id: &str) -> Result<Option<Identity>, StoreError> {
    read_entity(txn, IDENTITY_LEDGER, &entity_key("identity", id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> IdentityRegistry {
        IdentityRegistry::new(SqliteStore::in_memory().unwrap())
    }

    #[test]
    fn create_then_get_by_email_and_id() {
        let reg = registry();
        let created = reg.create("alice@x.test", "digest").unwrap();
        assert_eq!(reg.get("alice@x.test").unwrap(), created);
        assert_eq!(reg.get(&created.id()).unwrap(), created);
    }

    #[test]
    fn duplicate_email_is_rejected_on_create_only() {
        let reg = registry();
        reg.create("alice@x.test", "d1").unwrap();
        let err = reg.create("alice@x.test", "d2").unwrap_err();
        assert_eq!(err.code, ErrorCode::IdentityAlreadyExists);

        // Upsert replaces the record.
        reg.upsert("alice@x.test", "d3").unwrap();
        assert_eq!(reg.get("alice@x.test").unwrap().password_hash, "d3");
    }

    #[test]
    fn malformed_email_is_rejected() {
        let err = registry().create("not-an-email", "d").unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidField);
    }

    #[test]
    fn missing_identity_reports_not_found() {
        let err = registry().get("ghost@x.test").unwrap_err();
        assert_eq!(err.code, ErrorCode::IdentityNotFound);
    }

    #[test]
    fn add_cocoon_is_idempotent() {
        let reg = registry();
        reg.create("alice@x.test", "d").unwrap();
        reg.add_cocoon("alice@x.test", "c1").unwrap();
        let identity = reg.add_cocoon("alice@x.test", "c1").unwrap();
        assert_eq!(identity.cocoons, vec!["c1"]);
    }
}
