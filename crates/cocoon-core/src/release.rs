//! Release entity and the signatory-quorum state machine.
//!
//! A release is a proposed version of a cocoon. Signatories vote to
//! approve or deny it; the voting outcome is *derived* from the tallies
//! and the cocoon's policy, never persisted. Supersession is likewise
//! derived at read time from the cocoon's release order.

use serde::{Deserialize, Serialize};

use crate::cocoon::Repo;
use crate::error::{ApiError, ApiResult, ErrorCode};

/// A signatory's vote on a release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    /// Count toward approval.
    Approve,
    /// Count toward denial.
    Deny,
}

impl Vote {
    /// Parses the wire value (`"1"` approve, `"0"` deny).
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::InvalidField`] for any other value.
    pub fn parse(wire: &str) -> ApiResult<Self> {
        match wire {
            "1" => Ok(Self::Approve),
            "0" => Ok(Self::Deny),
            other => Err(ApiError::invalid_field(
                "vote",
                format!("expected \"1\" or \"0\", got {other:?}"),
            )),
        }
    }

    /// The wire value for this vote.
    #[must_use]
    pub const fn wire(self) -> &'static str {
        match self {
            Self::Approve => "1",
            Self::Deny => "0",
        }
    }
}

/// Derived voting outcome of a release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseState {
    /// Neither quorum condition holds yet.
    Pending,
    /// Approvals reached the cocoon's threshold.
    Approved,
    /// Enough denials that the threshold can no longer be reached.
    Denied,
    /// Approved, but a later release of the same cocoon is also
    /// approved.
    Superseded,
}

/// A proposed version of a cocoon.
///
/// Tallies and the voter list are the persisted voting record; the
/// outcome is recomputed from them on every read via [`Release::state`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    /// Unique ID (UUID4).
    pub id: String,
    /// Cocoon this release belongs to.
    pub cocoon_id: String,
    /// Source pointer frozen at proposal time.
    pub repo: Repo,
    /// Build manifest frozen at proposal time.
    #[serde(default)]
    pub build: String,
    /// Identity IDs that have voted, in voting order.
    #[serde(default)]
    pub voters_id: Vec<String>,
    /// Number of approval votes.
    pub sig_approved: u32,
    /// Number of denial votes.
    pub sig_denied: u32,
    /// Creation time, RFC3339.
    pub created_at: String,
}

impl Release {
    /// Returns `true` if the identity has already voted on this release.
    #[must_use]
    pub fn has_voted(&self, identity_id: &str) -> bool {
        self.voters_id.iter().any(|v| v == identity_id)
    }

    /// Records a vote, updating the tallies.
    ///
    /// The caller is responsible for signatory and terminal-state checks
    /// against the owning cocoon; this method only guards the
    /// one-vote-per-voter invariant.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::AlreadyVoted`] if the identity appears in
    /// the voter list.
    pub fn record_vote(&mut self, identity_id: &str, vote: Vote) -> ApiResult<()> {
        if self.has_voted(identity_id) {
            return Err(ApiError::new(
                ErrorCode::AlreadyVoted,
                format!("identity '{identity_id}' already voted on release '{}'", self.id),
            ));
        }
        self.voters_id.push(identity_id.to_string());
        match vote {
            Vote::Approve => self.sig_approved += 1,
            Vote::Deny => self.sig_denied += 1,
        }
        Ok(())
    }

    /// Derives the voting outcome under the cocoon's policy.
    ///
    /// Approved once approvals reach `sig_threshold`; denied once the
    /// denials make the threshold unreachable, that is when
    /// `sig_denied > num_signatories - sig_threshold`; pending
    /// otherwise. Supersession is a property of the cocoon's release
    /// order and is applied by the caller on top of this.
    #[must_use]
    pub const fn state(&self, num_signatories: u32, sig_threshold: u32) -> ReleaseState {
        if self.sig_approved >= sig_threshold {
            ReleaseState::Approved
        } else if self.sig_denied > num_signatories.saturating_sub(sig_threshold) {
            ReleaseState::Denied
        } else {
            ReleaseState::Pending
        }
    }

    /// Returns `true` once the outcome can no longer change.
    #[must_use]
    pub const fn is_closed(&self, num_signatories: u32, sig_threshold: u32) -> bool {
        !matches!(
            self.state(num_signatories, sig_threshold),
            ReleaseState::Pending
        )
    }

    /// Checks the tally invariant: every voter contributed exactly one
    /// tally mark.
    #[must_use]
    pub fn tallies_consistent(&self) -> bool {
        self.voters_id.len() as u64 == u64::from(self.sig_approved) + u64::from(self.sig_denied)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::resource::Language;

    pub(crate) fn sample_release(cocoon_id: &str) -> Release {
        Release {
            id: "0c9f7c2e-51f2-4b52-8f5e-6a3d2d9a1b00".to_string(),
            cocoon_id: cocoon_id.to_string(),
            repo: Repo {
                url: "https://github.com/owner/repo".to_string(),
                version: "v2".to_string(),
                language: Language::Go,
                link: String::new(),
            },
            build: String::new(),
            voters_id: Vec::new(),
            sig_approved: 0,
            sig_denied: 0,
            created_at: "2024-01-02T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn vote_wire_values() {
        assert_eq!(Vote::parse("1").unwrap(), Vote::Approve);
        assert_eq!(Vote::parse("0").unwrap(), Vote::Deny);
        assert_eq!(Vote::Approve.wire(), "1");
        assert!(Vote::parse("yes").is_err());
        assert!(Vote::parse("").is_err());
    }

    #[test]
    fn approval_at_threshold() {
        let mut release = sample_release("c1");
        // Policy: 3 signatories, threshold 2.
        assert_eq!(release.state(3, 2), ReleaseState::Pending);
        release.record_vote("a", Vote::Approve).unwrap();
        assert_eq!(release.state(3, 2), ReleaseState::Pending);
        release.record_vote("b", Vote::Approve).unwrap();
        assert_eq!(release.state(3, 2), ReleaseState::Approved);
        assert!(release.is_closed(3, 2));
    }

    #[test]
    fn denial_when_threshold_unreachable() {
        let mut release = sample_release("c1");
        // Policy: 3 signatories, threshold 2. Two denials leave only one
        // possible approval, so the threshold is unreachable.
        release.record_vote("a", Vote::Deny).unwrap();
        assert_eq!(release.state(3, 2), ReleaseState::Pending);
        release.record_vote("b", Vote::Deny).unwrap();
        assert_eq!(release.state(3, 2), ReleaseState::Denied);
    }

    #[test]
    fn unanimous_policy_denies_on_first_denial() {
        let mut release = sample_release("c1");
        release.record_vote("a", Vote::Deny).unwrap();
        assert_eq!(release.state(3, 3), ReleaseState::Denied);
    }

    #[test]
    fn double_vote_is_rejected() {
        let mut release = sample_release("c1");
        release.record_vote("a", Vote::Approve).unwrap();
        let err = release.record_vote("a", Vote::Deny).unwrap_err();
        assert_eq!(err.code, ErrorCode::AlreadyVoted);
        assert_eq!(release.sig_approved, 1);
        assert_eq!(release.sig_denied, 0);
        assert!(release.tallies_consistent());
    }

    #[test]
    fn tallies_track_voter_list() {
        let mut release = sample_release("c1");
        release.record_vote("a", Vote::Approve).unwrap();
        release.record_vote("b", Vote::Deny).unwrap();
        release.record_vote("c", Vote::Approve).unwrap();
        assert_eq!(release.voters_id, vec!["a", "b", "c"]);
        assert!(release.tallies_consistent());
    }
}
