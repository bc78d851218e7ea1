//! cocoon-core - Cocoon Platform Domain Library
//!
//! This library holds the domain model shared by the cocoon platform
//! daemon and its clients. A *cocoon* is a registered contract unit: a
//! pointer to a source repository, a resource quota, a signatory policy,
//! and an ordered release history. Releases are version-tagged updates
//! subject to multi-signatory approval before deployment.
//!
//! # Modules
//!
//! - [`cocoon`]: Cocoon entity, repository pointer, and validation
//! - [`config`]: Platform configuration (TOML) with defaults
//! - [`error`]: Platform error taxonomy ([`ErrorCode`], [`ApiError`])
//! - [`identity`]: Identity entity and stable ID derivation
//! - [`ipc`]: Control-plane request/response unions and wire framing
//! - [`ledger`]: Ledger/Transaction entities and hash derivations
//! - [`release`]: Release entity, votes, and quorum state derivation
//! - [`resource`]: Closed resource sets and repository host validation
//!
//! The library is deliberately free of storage and I/O concerns; those
//! live in the `cocoon-daemon` crate. Everything here is pure data and
//! deterministic derivation, which keeps the hash and quorum rules
//! independently testable.

pub mod cocoon;
pub mod config;
pub mod error;
pub mod identity;
pub mod ipc;
pub mod ledger;
pub mod release;
pub mod resource;

pub use cocoon::{Cocoon, CocoonStatus, DeploymentSpec, Repo};
pub use error::{ApiError, ApiResult, ErrorCode};
pub use identity::Identity;
pub use ledger::{
    GLOBAL_LEDGER, Ledger, Transaction, make_ledger_name, sha256_hex, transaction_hash,
};
pub use release::{Release, ReleaseState, Vote};
pub use resource::{CpuShare, Language, Memory, ResourceSet};
