//! Platform error taxonomy.
//!
//! Every error surfaced to a client carries a short stable machine code
//! ([`ErrorCode`]) and a human-readable message ([`ApiError`]). The codes
//! are the contract: clients branch on the code, render the message.
//!
//! # Error Classification
//!
//! - **Validation**: malformed or unsupported request payloads
//! - **Authorization**: missing, invalid, or insufficient credentials
//! - **Lookup**: the referenced entity does not exist
//! - **Conflict**: the entity already exists or an ID was reused
//! - **State**: the operation is not legal in the entity's current state
//! - **Infrastructure**: the platform itself failed; retry may help

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable machine codes for every error the control plane can return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    // Validation
    /// A request field is missing or malformed.
    InvalidField,
    /// The requested toolchain language is not supported.
    UnsupportedLanguage,
    /// The memory/CPU combination maps to no known resource set.
    BadResourceSet,
    /// The repository URL is not an accepted source host.
    BadUrl,
    /// A payload that must be JSON failed to parse.
    BadJson,

    // Authorization
    /// No session token was supplied on a method that requires one.
    NoActiveSession,
    /// The supplied session token is unknown or has been revoked.
    InvalidOrExpiredToken,
    /// The caller is authenticated but not allowed to do this.
    PermissionDenied,

    // Lookup
    /// No cocoon with the given ID.
    CocoonNotFound,
    /// No release with the given ID.
    ReleaseNotFound,
    /// No identity with the given email or ID.
    IdentityNotFound,
    /// No transaction with the given ID or key.
    TxNotFound,

    // Conflict
    /// A cocoon with this ID already exists.
    CocoonAlreadyExists,
    /// An identity with this email already exists.
    IdentityAlreadyExists,
    /// A release with this ID already exists.
    DuplicateRelease,
    /// A transaction with this ID already exists.
    DuplicateTxId,
    /// A ledger with this name already exists.
    NameTaken,

    // State
    /// The voter has already cast a vote on this release.
    AlreadyVoted,
    /// The voter is not a signatory of the release's cocoon.
    NotSignatory,
    /// The release has reached a terminal voting state.
    ReleaseClosed,

    // Infrastructure
    /// The backing store could not complete the operation.
    StoreUnavailable,
    /// The request deadline expired before the operation finished.
    DeadlineExceeded,
    /// Sealing the release archive failed.
    ArchiveFailed,
    /// The container launcher could not be reached.
    LauncherUnavailable,
}

impl ErrorCode {
    /// Wire status for the response envelope carrying this code.
    ///
    /// 200 is reserved for success; codes map onto the conventional
    /// HTTP-style ranges so front-ends can reuse their renderers.
    #[must_use]
    pub const fn status(self) -> u32 {
        match self {
            Self::InvalidField
            | Self::UnsupportedLanguage
            | Self::BadResourceSet
            | Self::BadUrl
            | Self::BadJson => 400,

            Self::NoActiveSession | Self::InvalidOrExpiredToken => 401,
            Self::PermissionDenied => 403,

            Self::CocoonNotFound
            | Self::ReleaseNotFound
            | Self::IdentityNotFound
            | Self::TxNotFound => 404,

            Self::CocoonAlreadyExists
            | Self::IdentityAlreadyExists
            | Self::DuplicateRelease
            | Self::DuplicateTxId
            | Self::NameTaken
            | Self::AlreadyVoted
            | Self::NotSignatory
            | Self::ReleaseClosed => 409,

            Self::DeadlineExceeded => 504,

            Self::StoreUnavailable | Self::ArchiveFailed | Self::LauncherUnavailable => 500,
        }
    }

    /// Returns `true` if retrying the same request may succeed.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable | Self::DeadlineExceeded | Self::LauncherUnavailable
        )
    }

    /// Returns `true` for conflict-class codes that the upsert form of
    /// a registration request suppresses.
    #[must_use]
    pub const fn is_conflict(self) -> bool {
        matches!(
            self,
            Self::CocoonAlreadyExists
                | Self::IdentityAlreadyExists
                | Self::DuplicateRelease
                | Self::DuplicateTxId
                | Self::NameTaken
        )
    }
}

/// An error surfaced to the control-plane caller.
///
/// Pairs a stable [`ErrorCode`] with a human-readable message. The code
/// is the contract; the message is advisory and may change.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[error("{code:?}: {message}")]
pub struct ApiError {
    /// Stable machine code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
}

impl ApiError {
    /// Creates an error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Validation failure for a named field.
    pub fn invalid_field(field: &str, reason: impl AsRef<str>) -> Self {
        Self::new(
            ErrorCode::InvalidField,
            format!("invalid field '{field}': {}", reason.as_ref()),
        )
    }

    /// Lookup failure for a cocoon ID.
    pub fn cocoon_not_found(id: &str) -> Self {
        Self::new(ErrorCode::CocoonNotFound, format!("cocoon '{id}' not found"))
    }

    /// Lookup failure for a release ID.
    pub fn release_not_found(id: &str) -> Self {
        Self::new(
            ErrorCode::ReleaseNotFound,
            format!("release '{id}' not found"),
        )
    }

    /// Lookup failure for an identity.
    pub fn identity_not_found(who: &str) -> Self {
        Self::new(
            ErrorCode::IdentityNotFound,
            format!("identity '{who}' not found"),
        )
    }

    /// Wire status for the envelope carrying this error.
    #[must_use]
    pub const fn status(&self) -> u32 {
        self.code.status()
    }
}

/// Result alias for operations that surface [`ApiError`] to callers.
pub type ApiResult<T> = Result<T, ApiError>;
