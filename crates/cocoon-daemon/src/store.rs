//! `SQLite`-backed store for ledgers and transactions.
//!
//! The store is the platform's sole source of durable truth. It uses
//! `SQLite` with WAL mode; every mutation runs inside a `BEGIN
//! IMMEDIATE` transaction, which serializes writers and gives the
//! per-ledger linearization the chain invariant needs. Busy/locked
//! failures are retried a bounded number of times with jittered delay.

// SQLite returns i64 for row IDs; values are always non-negative here.
// Mutex poisoning indicates a panic in another thread, which is
// unrecoverable.
#![allow(clippy::missing_panics_doc)]

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cocoon_core::config::StoreConfig;
use cocoon_core::error::{ApiError, ErrorCode};
use cocoon_core::ledger::{
    self, GLOBAL_LEDGER, Ledger, Transaction, ledger_hash, transaction_hash,
};
use rand::Rng;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use thiserror::Error;

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Retries exhausted against a busy database.
    #[error("database busy after {attempts} attempts")]
    Busy {
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// A ledger with this name already exists.
    #[error("ledger name '{name}' is taken")]
    NameTaken {
        /// The conflicting name.
        name: String,
    },

    /// A ledger or transaction hash collided with an existing row.
    #[error("hash collision on '{hash}'")]
    HashCollision {
        /// The colliding hash.
        hash: String,
    },

    /// A transaction with this ID already exists.
    #[error("transaction id '{id}' already exists")]
    DuplicateTxId {
        /// The conflicting transaction ID.
        id: String,
    },

    /// Insert-once guard found an existing transaction for the key.
    #[error("key '{key}' already has a transaction in ledger '{ledger}'")]
    KeyExists {
        /// Storage name of the ledger.
        ledger: String,
        /// The guarded key.
        key: String,
    },

    /// The named ledger does not exist.
    #[error("ledger '{name}' does not exist")]
    LedgerMissing {
        /// The missing ledger name.
        name: String,
    },

    /// Entity (de)serialization failed.
    #[error("entity encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    /// Domain error raised inside a transaction closure; rolls the
    /// transaction back and is surfaced unchanged.
    #[error(transparent)]
    Api(#[from] ApiError),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Api(api) => api,
            StoreError::NameTaken { .. } => Self::new(ErrorCode::NameTaken, err.to_string()),
            StoreError::DuplicateTxId { .. } => {
                Self::new(ErrorCode::DuplicateTxId, err.to_string())
            },
            StoreError::LedgerMissing { .. } | StoreError::KeyExists { .. } => {
                Self::new(ErrorCode::TxNotFound, err.to_string())
            },
            StoreError::Database(_)
            | StoreError::Busy { .. }
            | StoreError::HashCollision { .. }
            | StoreError::Encode(_) => Self::new(ErrorCode::StoreUnavailable, err.to_string()),
        }
    }
}

/// Retry tuning for write transactions.
#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    attempts: u32,
    backoff_min_ms: u64,
    backoff_max_ms: u64,
}

impl RetryPolicy {
    fn from_config(config: &StoreConfig) -> Self {
        Self {
            attempts: config.write_retries,
            backoff_min_ms: config.retry_backoff_min_ms,
            backoff_max_ms: config.retry_backoff_max_ms,
        }
    }

    fn backoff(&self) -> Duration {
        let ms = rand::thread_rng().gen_range(self.backoff_min_ms..=self.backoff_max_ms);
        Duration::from_millis(ms)
    }
}

/// The ledger/transaction store.
///
/// Cheap to clone; clones share one connection behind a mutex.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    retry: RetryPolicy,
}

impl SqliteStore {
    /// Opens or creates a store at the specified path.
    ///
    /// The schema is applied and the reserved system ledgers are
    /// created if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>, config: &StoreConfig) -> Result<Self, StoreError> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Self::from_connection(conn, config)
    }

    /// Creates an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, &StoreConfig::default())
    }

    fn from_connection(conn: Connection, config: &StoreConfig) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA_SQL)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            retry: RetryPolicy::from_config(config),
        };
        store.ensure_system_ledgers()?;
        Ok(store)
    }

    /// Creates the reserved ledgers if this is a fresh database.
    fn ensure_system_ledgers(&self) -> Result<(), StoreError> {
        self.with_txn(|txn| {
            for name in [
                GLOBAL_LEDGER,
                ledger::IDENTITY_LEDGER,
                ledger::COCOON_LEDGER,
                ledger::RELEASE_LEDGER,
            ] {
                if txn.get_ledger(name)?.is_none() {
                    txn.create_ledger(name, name == GLOBAL_LEDGER, true)?;
                }
            }
            Ok(())
        })
    }

    /// Runs `op` inside one serializable write transaction.
    ///
    /// The closure may be invoked more than once: busy/locked failures
    /// roll the transaction back and retry with jittered delay, up to
    /// the configured attempt count. Side effects must stay inside the
    /// transaction.
    ///
    /// # Errors
    ///
    /// Returns the closure's error, or [`StoreError::Busy`] once
    /// retries are exhausted.
    pub fn with_txn<T>(
        &self,
        mut op: impl FnMut(&StoreTxn<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_txn(&mut op) {
                Err(err) if is_busy(&err) => {
                    if attempt >= self.retry.attempts {
                        return Err(StoreError::Busy { attempts: attempt });
                    }
                    std::thread::sleep(self.retry.backoff());
                },
                other => return other,
            }
        }
    }

    fn try_txn<T>(
        &self,
        op: &mut impl FnMut(&StoreTxn<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("BEGIN IMMEDIATE;")?;
        let txn = StoreTxn { conn: &conn };
        match op(&txn) {
            Ok(value) => {
                conn.execute_batch("COMMIT;")?;
                Ok(value)
            },
            Err(err) => {
                let _ = conn.execute_batch("ROLLBACK;");
                Err(err)
            },
        }
    }

    /// Creates a ledger.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NameTaken`] if the name is in use.
    pub fn create_ledger(
        &self,
        name: &str,
        public: bool,
        chained: bool,
    ) -> Result<Ledger, StoreError> {
        self.with_txn(|txn| txn.create_ledger(name, public, chained))
    }

    /// Creates a ledger and runs `on_commit` in the same transaction.
    ///
    /// If `on_commit` fails the ledger creation is rolled back. This is
    /// the primitive for atomically staging a ledger together with its
    /// first payload.
    ///
    /// # Errors
    ///
    /// Returns the creation error or the closure's error.
    pub fn create_ledger_then<T>(
        &self,
        name: &str,
        public: bool,
        chained: bool,
        mut on_commit: impl FnMut(&StoreTxn<'_>, &Ledger) -> Result<T, StoreError>,
    ) -> Result<(Ledger, T), StoreError> {
        self.with_txn(|txn| {
            let ledger = txn.create_ledger(name, public, chained)?;
            let value = on_commit(txn, &ledger)?;
            Ok((ledger, value))
        })
    }

    /// Reads a ledger by storage name.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_ledger(&self, name: &str) -> Result<Option<Ledger>, StoreError> {
        self.with_txn(|txn| txn.get_ledger(name))
    }

    /// Appends a transaction to a ledger.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::LedgerMissing`] or
    /// [`StoreError::DuplicateTxId`].
    pub fn put(
        &self,
        ledger: &str,
        id: &str,
        key: &str,
        value: &str,
    ) -> Result<Transaction, StoreError> {
        self.with_txn(|txn| txn.put(ledger, id, key, value))
    }

    /// Appends a transaction, failing if the key already has one.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::KeyExists`] if any transaction with this
    /// key exists in the ledger.
    pub fn put_new(
        &self,
        ledger: &str,
        id: &str,
        key: &str,
        value: &str,
    ) -> Result<Transaction, StoreError> {
        self.with_txn(|txn| txn.put_new(ledger, id, key, value))
    }

    /// Appends a batch of transactions atomically.
    ///
    /// All appends share one write transaction; any failure rolls the
    /// whole batch back.
    ///
    /// # Errors
    ///
    /// Returns the first append's error.
    pub fn put_batch(
        &self,
        ledger: &str,
        entries: &[(String, String, String)],
    ) -> Result<Vec<Transaction>, StoreError> {
        self.with_txn(|txn| {
            entries
                .iter()
                .map(|(id, key, value)| txn.put(ledger, id, key, value))
                .collect()
        })
    }

    /// Latest-write-wins read of a key.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get(&self, ledger: &str, key: &str) -> Result<Option<Transaction>, StoreError> {
        self.with_txn(|txn| txn.latest(ledger, key))
    }

    /// Reads a transaction by its unique ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_by_id(&self, id: &str) -> Result<Option<Transaction>, StoreError> {
        self.with_txn(|txn| txn.by_id(id))
    }

    /// Reads all transactions of a ledger in row order.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn read_ledger(&self, ledger: &str) -> Result<Vec<Transaction>, StoreError> {
        self.with_txn(|txn| txn.ledger_transactions(ledger))
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

/// One open write transaction against the store.
///
/// Handed to [`SqliteStore::with_txn`] closures; everything done
/// through it commits or rolls back atomically.
pub struct StoreTxn<'a> {
    conn: &'a Connection,
}

impl StoreTxn<'_> {
    /// Creates a ledger inside this transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NameTaken`] if the name is in use.
    pub fn create_ledger(
        &self,
        name: &str,
        public: bool,
        chained: bool,
    ) -> Result<Ledger, StoreError> {
        let created_at = now_unix();
        let hash = ledger_hash(name, public, created_at);
        self.conn
            .execute(
                "INSERT INTO ledgers (name, hash, public, chained, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![name, hash, public, chained, created_at],
            )
            .map_err(|e| map_constraint(e, name, "", &hash))?;
        Ok(Ledger {
            number: self.conn.last_insert_rowid(),
            name: name.to_string(),
            hash,
            public,
            chained,
            created_at,
        })
    }

    /// Reads a ledger by storage name.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_ledger(&self, name: &str) -> Result<Option<Ledger>, StoreError> {
        let ledger = self
            .conn
            .query_row(
                "SELECT number, name, hash, public, chained, created_at
                 FROM ledgers WHERE name = ?1",
                params![name],
                |row| {
                    Ok(Ledger {
                        number: row.get(0)?,
                        name: row.get(1)?,
                        hash: row.get(2)?,
                        public: row.get(3)?,
                        chained: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(ledger)
    }

    /// Appends a transaction inside this transaction.
    ///
    /// For a chained ledger the current tail is looked up, the new hash
    /// is computed over the predecessor's hash, and the tail's
    /// back-link is filled in the same transaction as the insert.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::LedgerMissing`] or
    /// [`StoreError::DuplicateTxId`].
    pub fn put(
        &self,
        ledger: &str,
        id: &str,
        key: &str,
        value: &str,
    ) -> Result<Transaction, StoreError> {
        let meta = self
            .get_ledger(ledger)?
            .ok_or_else(|| StoreError::LedgerMissing {
                name: ledger.to_string(),
            })?;

        let prev_tx_hash = if meta.chained {
            self.tail_hash(ledger)?.unwrap_or_default()
        } else {
            String::new()
        };

        let created_at = now_unix();
        let hash = transaction_hash(id, key, value, &prev_tx_hash, created_at);

        if !prev_tx_hash.is_empty() {
            let updated = self.conn.execute(
                "UPDATE transactions SET next_tx_hash = ?1
                 WHERE hash = ?2 AND next_tx_hash IS NULL",
                params![hash, prev_tx_hash],
            )?;
            if updated != 1 {
                // The tail moved under us, which BEGIN IMMEDIATE rules
                // out for committed writers. Treat as a busy conflict.
                return Err(StoreError::Database(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
                    Some("chained ledger tail moved mid-transaction".to_string()),
                )));
            }
        }

        self.conn
            .execute(
                "INSERT INTO transactions
                     (ledger, id, key, value, hash, prev_tx_hash, next_tx_hash, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7)",
                params![ledger, id, key, value, hash, prev_tx_hash, created_at],
            )
            .map_err(|e| map_constraint(e, "", id, &hash))?;

        Ok(Transaction {
            number: self.conn.last_insert_rowid(),
            id: id.to_string(),
            ledger: ledger.to_string(),
            key: key.to_string(),
            value: value.to_string(),
            hash,
            prev_tx_hash,
            next_tx_hash: String::new(),
            created_at,
        })
    }

    /// Insert-once variant of [`StoreTxn::put`]: the guard read and the
    /// append share this transaction, so no concurrent writer can slip
    /// a transaction for the key in between.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::KeyExists`] if the key already has any
    /// transaction in the ledger.
    pub fn put_new(
        &self,
        ledger: &str,
        id: &str,
        key: &str,
        value: &str,
    ) -> Result<Transaction, StoreError> {
        if self.latest(ledger, key)?.is_some() {
            return Err(StoreError::KeyExists {
                ledger: ledger.to_string(),
                key: key.to_string(),
            });
        }
        self.put(ledger, id, key, value)
    }

    /// Latest transaction for a key, by row number.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn latest(&self, ledger: &str, key: &str) -> Result<Option<Transaction>, StoreError> {
        let tx = self
            .conn
            .query_row(
                &format!(
                    "{SELECT_TX} WHERE ledger = ?1 AND key = ?2
                     ORDER BY number DESC LIMIT 1"
                ),
                params![ledger, key],
                row_to_tx,
            )
            .optional()?;
        Ok(tx)
    }

    /// Transaction lookup by unique ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn by_id(&self, id: &str) -> Result<Option<Transaction>, StoreError> {
        let tx = self
            .conn
            .query_row(
                &format!("{SELECT_TX} WHERE id = ?1"),
                params![id],
                row_to_tx,
            )
            .optional()?;
        Ok(tx)
    }

    /// All transactions of a ledger in row order.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn ledger_transactions(&self, ledger: &str) -> Result<Vec<Transaction>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(&format!("{SELECT_TX} WHERE ledger = ?1 ORDER BY number ASC"))?;
        let txs = stmt
            .query_map(params![ledger], row_to_tx)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(txs)
    }

    /// Hash of the current chain tail, if the ledger has entries.
    fn tail_hash(&self, ledger: &str) -> Result<Option<String>, StoreError> {
        let hash = self
            .conn
            .query_row(
                "SELECT hash FROM transactions
                 WHERE ledger = ?1 AND next_tx_hash IS NULL
                 ORDER BY number DESC LIMIT 1",
                params![ledger],
                |row| row.get(0),
            )
            .optional()?;
        Ok(hash)
    }
}

const SELECT_TX: &str = "SELECT number, id, ledger, key, value, hash, prev_tx_hash, \
                         next_tx_hash, created_at FROM transactions";

fn row_to_tx(row: &rusqlite::Row<'_>) -> rusqlite::Result<Transaction> {
    Ok(Transaction {
        number: row.get(0)?,
        id: row.get(1)?,
        ledger: row.get(2)?,
        key: row.get(3)?,
        value: row.get(4)?,
        hash: row.get(5)?,
        prev_tx_hash: row.get(6)?,
        next_tx_hash: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
        created_at: row.get(8)?,
    })
}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

fn is_busy(err: &StoreError) -> bool {
    match err {
        StoreError::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
            e.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ),
        _ => false,
    }
}

/// Maps unique-constraint violations onto typed errors. The violated
/// column is identified from the SQLite message.
fn map_constraint(err: rusqlite::Error, name: &str, id: &str, hash: &str) -> StoreError {
    if let rusqlite::Error::SqliteFailure(e, Some(msg)) = &err {
        if e.code == rusqlite::ErrorCode::ConstraintViolation {
            if msg.contains("ledgers.name") {
                return StoreError::NameTaken {
                    name: name.to_string(),
                };
            }
            if msg.contains("transactions.id") {
                return StoreError::DuplicateTxId { id: id.to_string() };
            }
            if msg.contains(".hash") {
                return StoreError::HashCollision {
                    hash: hash.to_string(),
                };
            }
        }
    }
    StoreError::Database(err)
}
