//! cocoon-daemon - cocoon platform daemon library
//!
//! The daemon persists cocoon, release, identity, and user-ledger state
//! in a `SQLite`-backed transaction store, runs the release signatory
//! quorum, archives release sources, and serves the control API over a
//! Unix socket.
//!
//! # Modules
//!
//! - [`store`]: ledgers and the hash-chained transaction log
//! - [`registry`]: typed identity/cocoon/release views over the store
//! - [`auth`]: sessions and password hashing
//! - [`archive`]: release source archiving
//! - [`launcher`]: container launcher contract
//! - [`dispatch`]: request handling over the assembled [`dispatch::Platform`]
//! - [`server`]: the Unix-socket accept loop

pub mod archive;
pub mod auth;
pub mod dispatch;
pub mod launcher;
pub mod registry;
pub mod server;
pub mod store;

pub use dispatch::Platform;
pub use store::{SqliteStore, StoreError};
