//! Control-plane wire protocol.
//!
//! Clients talk to the daemon over a Unix socket. Each message is a
//! 4-byte big-endian length prefix followed by a JSON payload. Requests
//! are a [`RequestFrame`] (session token plus method); responses are an
//! [`Envelope`] carrying a status and a JSON body.

use serde::{Deserialize, Serialize};

use crate::cocoon::{Cocoon, FirewallRule, Repo};
use crate::error::ApiError;
use crate::identity::IdentityView;
use crate::ledger::{Ledger, Transaction};
use crate::release::{Release, ReleaseState};

/// Upper bound on a framed payload. Frames claiming more are rejected
/// before any allocation happens.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// A request as it travels over the socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    /// Session token; empty for the auth-exempt methods.
    #[serde(default)]
    pub token: String,
    /// The method being invoked.
    pub request: ApiRequest,
}

/// Control-plane methods.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApiRequest {
    /// Authenticate and open a session.
    Login {
        /// Identity email.
        email: String,
        /// Plaintext password, verified against the stored digest.
        password: String,
    },

    /// Close the current session, or all of the caller's sessions.
    Logout {
        /// Revoke every session of this identity, not just this one.
        #[serde(default)]
        all_sessions: bool,
    },

    /// Register an identity.
    CreateIdentity {
        /// Unique email address.
        email: String,
        /// Plaintext password, hashed before storage.
        password: String,
        /// Replace an existing identity instead of failing.
        #[serde(default)]
        allow_duplicate: bool,
    },

    /// Read an identity by email or derived ID.
    GetIdentity {
        /// Email or identity ID.
        who: String,
    },

    /// Link a cocoon to an identity.
    AddCocoonToIdentity {
        /// Identity email.
        email: String,
        /// Cocoon ID to link.
        cocoon_id: String,
    },

    /// Register a cocoon.
    CreateCocoon {
        /// The cocoon to register.
        spec: CocoonSpec,
        /// Replace an existing cocoon instead of failing.
        #[serde(default)]
        allow_duplicate: bool,
    },

    /// Read a cocoon by ID.
    GetCocoon {
        /// Cocoon ID.
        id: String,
    },

    /// Transition a cocoon to `stopped`.
    StopCocoon {
        /// Cocoon ID.
        id: String,
    },

    /// Extend a cocoon's signatory set, within its capacity.
    AddSignatories {
        /// Cocoon ID.
        cocoon_id: String,
        /// Identity IDs to add.
        signatories: Vec<String>,
    },

    /// Propose a release.
    CreateRelease {
        /// Release ID (UUID4).
        id: String,
        /// Cocoon being released.
        cocoon_id: String,
        /// Source pointer for this version.
        repo: Repo,
        /// Build manifest, JSON text.
        #[serde(default)]
        build: String,
        /// Source tarball to archive, base64. Empty skips archiving.
        #[serde(default)]
        source: String,
        /// Replace an existing release instead of failing.
        #[serde(default)]
        allow_duplicate: bool,
    },

    /// Read a release by ID.
    GetRelease {
        /// Release ID.
        id: String,
    },

    /// Cast a vote on a release.
    AddVote {
        /// Release ID.
        release_id: String,
        /// Wire vote value, `"1"` approve or `"0"` deny.
        vote: String,
    },

    /// Dispatch an approved release to the launcher.
    Deploy {
        /// Cocoon ID.
        cocoon_id: String,
        /// Release ID; empty deploys the latest approved release.
        #[serde(default)]
        release_id: String,
    },

    /// Create a user ledger in the caller's namespace.
    CreateLedger {
        /// Logical ledger name; the storage name is derived.
        name: String,
        /// Advisory cross-cocoon read permission.
        #[serde(default)]
        public: bool,
        /// Chain transactions by hash.
        #[serde(default)]
        chained: bool,
    },

    /// Append a transaction to a ledger.
    Put {
        /// Logical ledger name.
        ledger: String,
        /// Transaction ID (UUID4).
        id: String,
        /// Opaque key.
        key: String,
        /// Opaque value.
        value: String,
    },

    /// Read the latest transaction for a key.
    Get {
        /// Logical ledger name.
        ledger: String,
        /// Opaque key.
        key: String,
    },

    /// Read a transaction by its ID.
    GetById {
        /// Transaction ID.
        id: String,
    },
}

impl ApiRequest {
    /// Returns `true` for methods that do not require a session.
    #[must_use]
    pub const fn is_auth_exempt(&self) -> bool {
        matches!(self, Self::Login { .. } | Self::CreateIdentity { .. })
    }
}

/// Cocoon registration payload.
///
/// Grades and the language travel as their wire labels; unknown labels
/// fail decoding with the matching validation error downstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CocoonSpec {
    /// Cocoon ID (UUID4).
    pub id: String,
    /// Source pointer.
    pub repo: Repo,
    /// Build manifest, JSON text.
    #[serde(default)]
    pub build: String,
    /// Memory grade label.
    pub memory: String,
    /// CPU share grade label.
    pub cpu_share: String,
    /// Signatory capacity.
    pub num_signatories: u32,
    /// Approval threshold.
    pub sig_threshold: u32,
    /// Initial signatory identity IDs.
    #[serde(default)]
    pub signatories: Vec<String>,
    /// Environment variables.
    #[serde(default)]
    pub env: std::collections::BTreeMap<String, String>,
    /// Advisory firewall rules.
    #[serde(default)]
    pub firewall: Vec<FirewallRule>,
    /// Advisory ACL record.
    #[serde(default)]
    pub acl: std::collections::BTreeMap<String, String>,
}

/// Successful method results.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApiResponse {
    /// The operation completed with nothing to return.
    Ok,

    /// A fresh session token.
    Session {
        /// Bearer token for subsequent requests.
        token: String,
    },

    /// An identity record.
    Identity {
        /// Secret-stripped view.
        identity: IdentityView,
    },

    /// A cocoon record.
    Cocoon {
        /// The cocoon.
        cocoon: Box<Cocoon>,
    },

    /// A release record with its derived state.
    Release {
        /// The release.
        release: Box<Release>,
        /// Outcome derived under the owning cocoon's policy.
        state: ReleaseState,
    },

    /// A ledger record.
    Ledger {
        /// The ledger.
        ledger: Ledger,
    },

    /// A transaction record.
    Tx {
        /// The transaction.
        tx: Box<Transaction>,
    },
}

/// The wire response envelope.
///
/// `status` is 200 on success; otherwise the error code's status, with
/// `body` holding the JSON-encoded [`ApiError`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Status code; 200 on success.
    pub status: u32,
    /// JSON-encoded [`ApiResponse`] or [`ApiError`].
    pub body: String,
}

impl Envelope {
    /// Wraps a successful response.
    ///
    /// # Errors
    ///
    /// Returns an error if the response fails to serialize.
    pub fn ok(response: &ApiResponse) -> Result<Self, IpcError> {
        Ok(Self {
            status: 200,
            body: serde_json::to_string(response)?,
        })
    }

    /// Wraps an error response.
    #[must_use]
    pub fn error(err: &ApiError) -> Self {
        Self {
            status: err.status(),
            body: serde_json::to_string(err)
                .unwrap_or_else(|_| format!("{{\"code\":\"store_unavailable\",\"message\":{:?}}}", err.message)),
        }
    }

    /// Returns `true` for a success envelope.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.status == 200
    }

    /// Decodes the body as the success payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the body is not a valid [`ApiResponse`].
    pub fn decode(&self) -> Result<ApiResponse, IpcError> {
        Ok(serde_json::from_str(&self.body)?)
    }

    /// Decodes the body as an error payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the body is not a valid [`ApiError`].
    pub fn decode_error(&self) -> Result<ApiError, IpcError> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// Frame a message for socket transport.
///
/// Format: 4-byte big-endian length prefix + JSON payload.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // bounded by MAX_FRAME_SIZE
pub fn frame_message(message: &[u8]) -> Vec<u8> {
    let len = message.len() as u32;
    let mut framed = Vec::with_capacity(4 + message.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(message);
    framed
}

/// Parse a framed message length.
///
/// Returns the payload length if a complete length prefix is present.
///
/// # Errors
///
/// Returns [`IpcError::FrameTooLarge`] if the prefix claims more than
/// [`MAX_FRAME_SIZE`] bytes.
pub fn parse_frame_length(buffer: &[u8]) -> Result<Option<usize>, IpcError> {
    if buffer.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(IpcError::FrameTooLarge(len));
    }
    Ok(Some(len))
}

/// Wire protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// Connection failed.
    #[error("failed to connect to daemon: {0}")]
    ConnectionFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Frame length prefix exceeds the protocol maximum.
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_SIZE}-byte maximum")]
    FrameTooLarge(usize),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn frame_prepends_big_endian_length() {
        let framed = frame_message(b"hello");
        assert_eq!(framed.len(), 4 + 5);
        assert_eq!(&framed[0..4], &[0, 0, 0, 5]);
        assert_eq!(&framed[4..], b"hello");
    }

    #[test]
    fn frame_length_requires_full_prefix() {
        assert!(parse_frame_length(&[0, 0, 1]).unwrap().is_none());
        assert_eq!(parse_frame_length(&[0, 0, 1, 0]).unwrap(), Some(256));
    }

    #[test]
    fn oversized_frame_is_rejected_before_allocation() {
        let mut prefix = [0u8; 4];
        prefix.copy_from_slice(&(MAX_FRAME_SIZE as u32 + 1).to_be_bytes());
        assert!(matches!(
            parse_frame_length(&prefix),
            Err(IpcError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn requests_tag_by_snake_case_type() {
        let frame = RequestFrame {
            token: String::new(),
            request: ApiRequest::GetCocoon {
                id: "c1".to_string(),
            },
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains(r#""type":"get_cocoon""#));
        let back: RequestFrame = serde_json::from_str(&json).unwrap();
        assert!(matches!(back.request, ApiRequest::GetCocoon { .. }));
    }

    #[test]
    fn auth_exemptions_cover_bootstrap_methods() {
        assert!(ApiRequest::Login {
            email: String::new(),
            password: String::new()
        }
        .is_auth_exempt());
        assert!(ApiRequest::CreateIdentity {
            email: String::new(),
            password: String::new(),
            allow_duplicate: false
        }
        .is_auth_exempt());
        assert!(!ApiRequest::GetCocoon { id: String::new() }.is_auth_exempt());
        assert!(!ApiRequest::Logout {
            all_sessions: false
        }
        .is_auth_exempt());
    }

    #[test]
    fn error_envelope_carries_the_code_status() {
        let err = ApiError::cocoon_not_found("c9");
        let envelope = Envelope::error(&err);
        assert_eq!(envelope.status, 404);
        assert!(!envelope.is_ok());
        let back = envelope.decode_error().unwrap();
        assert_eq!(back.code, ErrorCode::CocoonNotFound);
    }

    #[test]
    fn ok_envelope_round_trips() {
        let envelope = Envelope::ok(&ApiResponse::Session {
            token: "t".to_string(),
        })
        .unwrap();
        assert_eq!(envelope.status, 200);
        assert!(matches!(
            envelope.decode().unwrap(),
            ApiResponse::Session { .. }
        ));
    }
}
