//! Release registry and vote application.
//!
//! Vote effects are linearized by running the whole
//! load-validate-tally-persist sequence inside one store transaction.
//! `BEGIN IMMEDIATE` serializes concurrent voters; the loser of the
//! race re-reads the updated release and either succeeds or fails a
//! precondition.

use cocoon_core::cocoon::Cocoon;
use cocoon_core::error::{ApiError, ApiResult, ErrorCode};
use cocoon_core::ledger::RELEASE_LEDGER;
use cocoon_core::release::{Release, ReleaseState, Vote};
use cocoon_core::resource::{validate_build_json, validate_repo_url};

use super::cocoon::CocoonRegistry;
use super::{entity_key, read_entity, write_entity};
use crate::store::{SqliteStore, StoreError, StoreTxn};

/// Result of applying a vote.
#[derive(Debug, Clone)]
pub struct VoteOutcome {
    /// The release after the vote.
    pub release: Release,
    /// The owning cocoon at vote time.
    pub cocoon: Cocoon,
    /// Outcome derived under the cocoon's policy.
    pub state: ReleaseState,
    /// `true` when this vote transitioned the release to approved.
    pub newly_approved: bool,
}

/// Typed view over release records in the release ledger.
#[derive(Debug, Clone)]
pub struct ReleaseRegistry {
    store: SqliteStore,
}

impl ReleaseRegistry {
    /// Creates a registry over the given store.
    #[must_use]
    pub const fn new(store: SqliteStore) -> Self {
        Self { store }
    }

    /// Proposes a release and appends it to the cocoon's history, in
    /// one transaction. Fails if the ID is taken.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::CocoonNotFound`] for an unknown cocoon, a
    /// validation error, or [`ErrorCode::DuplicateRelease`].
    pub fn create(&self, release: Release) -> ApiResult<Release> {
        self.persist(release, true)
    }

    /// Proposes or replaces a release.
    ///
    /// The cocoon binding is immutable: a replacement may not move the
    /// release to another cocoon, since every ID in a cocoon's history
    /// must resolve to a release pointing back at it.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::CocoonNotFound`] for an unknown cocoon or a
    /// validation error.
    pub fn upsert(&self, release: Release) -> ApiResult<Release> {
        self.persist(release, false)
    }

    fn persist(&self, release: Release, insert_once: bool) -> ApiResult<Release> {
        if release.id.is_empty() {
            return Err(ApiError::invalid_field("id", "must not be empty"));
        }
        validate_repo_url(&release.repo.url)?;
        validate_build_json(&release.build)?;

        let key = entity_key("release", &release.id);
        let result = self.store.with_txn(|txn| {
            let mut cocoon = CocoonRegistry::load_in(txn, &release.cocoon_id)?
                .ok_or_else(|| ApiError::cocoon_not_found(&release.cocoon_id))?;
            if !insert_once {
                if let Some(prior) = load(txn, &release.id)? {
                    if prior.cocoon_id != release.cocoon_id {
                        return Err(ApiError::invalid_field(
                            "cocoon_id",
                            format!(
                                "release '{}' already belongs to cocoon '{}'",
                                release.id, prior.cocoon_id
                            ),
                        )
                        .into());
                    }
                }
            }
            write_entity(txn, RELEASE_LEDGER, &key, &release, insert_once)?;
            if !cocoon.releases.iter().any(|r| r == &release.id) {
                cocoon.releases.push(release.id.clone());
                write_entity(
                    txn,
                    cocoon_core::ledger::COCOON_LEDGER,
                    &entity_key("cocoon", &cocoon.id),
                    &cocoon,
                    false,
                )?;
            }
            Ok(())
        });
        match result {
            Ok(()) => Ok(release),
            Err(StoreError::KeyExists { .. }) => Err(ApiError::new(
                ErrorCode::DuplicateRelease,
                format!("release '{}' already exists", release.id),
            )),
            Err(err) => Err(err.into()),
        }
    }

    /// Reads a release with its derived state.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::ReleaseNotFound`] if absent, or
    /// [`ErrorCode::CocoonNotFound`] if the owning cocoon vanished.
    pub fn get(&self, id: &str) -> ApiResult<(Release, ReleaseState)> {
        self.store
            .with_txn(|txn| {
                let release = load(txn, id)?.ok_or_else(|| ApiError::release_not_found(id))?;
                let cocoon = CocoonRegistry::load_in(txn, &release.cocoon_id)?
                    .ok_or_else(|| ApiError::cocoon_not_found(&release.cocoon_id))?;
                let state = derived_state(txn, &release, &cocoon)?;
                Ok((release, state))
            })
            .map_err(ApiError::from)
    }

    /// Applies a vote.
    ///
    /// Preconditions, checked in order inside the transaction: the
    /// release exists; the voter is a signatory of the owning cocoon;
    /// the voter has not voted before; voting is still open.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::ReleaseNotFound`], [`ErrorCode::NotSignatory`],
    /// [`ErrorCode::AlreadyVoted`], or [`ErrorCode::ReleaseClosed`].
    pub fn add_vote(&self, release_id: &str, voter_id: &str, vote: Vote) -> ApiResult<VoteOutcome> {
        self.store
            .with_txn(|txn| {
                let mut release =
                    load(txn, release_id)?.ok_or_else(|| ApiError::release_not_found(release_id))?;
                let cocoon = CocoonRegistry::load_in(txn, &release.cocoon_id)?
                    .ok_or_else(|| ApiError::cocoon_not_found(&release.cocoon_id))?;

                if !cocoon.is_signatory(voter_id) {
                    return Err(ApiError::new(
                        ErrorCode::NotSignatory,
                        format!(
                            "identity '{voter_id}' is not a signatory of cocoon '{}'",
                            cocoon.id
                        ),
                    )
                    .into());
                }
                if release.has_voted(voter_id) {
                    return Err(ApiError::new(
                        ErrorCode::AlreadyVoted,
                        format!("identity '{voter_id}' already voted on release '{release_id}'"),
                    )
                    .into());
                }
                let before = derived_state(txn, &release, &cocoon)?;
                if before != ReleaseState::Pending {
                    return Err(ApiError::new(
                        ErrorCode::ReleaseClosed,
                        format!("release '{release_id}' is {before:?} and no longer accepts votes"),
                    )
                    .into());
                }
                release.record_vote(voter_id, vote)?;
                write_entity(
                    txn,
                    RELEASE_LEDGER,
                    &entity_key("release", release_id),
                    &release,
                    false,
                )?;

                let state = release.state(cocoon.num_signatories, cocoon.sig_threshold);
                Ok(VoteOutcome {
                    newly_approved: state == ReleaseState::Approved,
                    release,
                    cocoon,
                    state,
                })
            })
            .map_err(ApiError::from)
    }
}

/// Derives the full state including supersession: an approved release
/// is superseded when a later release of the same cocoon is also
/// approved. Never persisted; always recomputed against
/// `Cocoon.releases`.
fn derived_state(
    txn: &StoreTxn<'_>,
    release: &Release,
    cocoon: &Cocoon,
) -> Result<ReleaseState, StoreError> {
    let base = release.state(cocoon.num_signatories, cocoon.sig_threshold);
    if base != ReleaseState::Approved {
        return Ok(base);
    }
    let Some(pos) = cocoon.releases.iter().position(|r| r == &release.id) else {
        return Ok(base);
    };
    for later_id in &cocoon.releases[pos + 1..] {
        if let Some(later) = load(txn, later_id)? {
            if later.state(cocoon.num_signatories, cocoon.sig_threshold) == ReleaseState::Approved {
                return Ok(ReleaseState::Superseded);
            }
        }
    }
    Ok(base)
}

fn load(txn: &StoreTxn<'_>, id: &str) -> Result<Option<Release>, StoreError> {
    read_entity(txn, RELEASE_LEDGER, &entity_key("release", id))
}

#[cfg(test)]
mod tests {
    use cocoon_core::cocoon::{CocoonStatus, Repo};
    use cocoon_core::resource::{CpuShare, Language, Memory};

    use super::*;
    use crate::registry::IdentityRegistry;

    struct Fixture {
        releases: ReleaseRegistry,
        cocoons: CocoonRegistry,
        signers: Vec<String>,
    }

    fn fixture(num_signatories: u32, sig_threshold: u32) -> Fixture {
        let store = SqliteStore::in_memory().unwrap();
        let identities = IdentityRegistry::new(store.clone());
        let signers: Vec<String> = ["alice", "bob", "carol"]
            .iter()
            .take(num_signatories as usize)
            .map(|name| {
                identities
                    .create(&format!("{name}@x.test"), "d")
                    .unwrap()
                    .id()
            })
            .collect();

        let cocoons = CocoonRegistry::new(store.clone());
        cocoons
            .create(Cocoon {
                id: "c1".to_string(),
                repo: Repo {
                    url: "https://github.com/o/r".to_string(),
                    version: "v1".to_string(),
                    language: Language::Go,
                    link: String::new(),
                },
                build: String::new(),
                memory: Memory::M512,
                cpu_share: CpuShare::X1,
                num_signatories,
                sig_threshold,
                signatories: signers.clone(),
                releases: Vec::new(),
                status: CocoonStatus::Created,
                acl: std::collections::BTreeMap::new(),
                firewall: Vec::new(),
                env: std::collections::BTreeMap::new(),
                created_at: "2024-01-01T00:00:00Z".to_string(),
            })
            .unwrap();

        Fixture {
            releases: ReleaseRegistry::new(store),
            cocoons,
            signers,
        }
    }

    fn release(id: &str) -> Release {
        Release {
            id: id.to_string(),
            cocoon_id: "c1".to_string(),
            repo: Repo {
                url: "https://github.com/o/r".to_string(),
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
    fn create_appends_to_cocoon_history() {
        let fx = fixture(1, 1);
        fx.releases.create(release("r1")).unwrap();
        fx.releases.create(release("r2")).unwrap();
        let cocoon = fx.cocoons.get("c1").unwrap();
        assert_eq!(cocoon.releases, vec!["r1", "r2"]);
    }

    #[test]
    fn duplicate_release_id_is_rejected_unless_allowed() {
        let fx = fixture(1, 1);
        fx.releases.create(release("r1")).unwrap();
        let err = fx.releases.create(release("r1")).unwrap_err();
        assert_eq!(err.code, ErrorCode::DuplicateRelease);

        fx.releases.upsert(release("r1")).unwrap();
        // Re-upserting must not duplicate the history entry.
        assert_eq!(fx.cocoons.get("c1").unwrap().releases, vec!["r1"]);
    }

    #[test]
    fn upsert_keeps_release_bound_to_its_cocoon() {
        let fx = fixture(1, 1);
        fx.releases.create(release("r1")).unwrap();

        let mut other = fx.cocoons.get("c1").unwrap();
        other.id = "c2".to_string();
        other.releases = Vec::new();
        fx.cocoons.create(other).unwrap();

        let mut moved = release("r1");
        moved.cocoon_id = "c2".to_string();
        let err = fx.releases.upsert(moved).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidField);

        // Both histories and the release binding are untouched.
        assert_eq!(fx.cocoons.get("c1").unwrap().releases, vec!["r1"]);
        assert!(fx.cocoons.get("c2").unwrap().releases.is_empty());
        assert_eq!(fx.releases.get("r1").unwrap().0.cocoon_id, "c1");
    }

    #[test]
    fn release_for_unknown_cocoon_fails() {
        let fx = fixture(1, 1);
        let mut bad = release("r1");
        bad.cocoon_id = "ghost".to_string();
        let err = fx.releases.create(bad).unwrap_err();
        assert_eq!(err.code, ErrorCode::CocoonNotFound);
    }

    #[test]
    fn single_signer_approval() {
        let fx = fixture(1, 1);
        fx.releases.create(release("r1")).unwrap();
        let outcome = fx
            .releases
            .add_vote("r1", &fx.signers[0], Vote::Approve)
            .unwrap();
        assert_eq!(outcome.state, ReleaseState::Approved);
        assert!(outcome.newly_approved);
        assert_eq!(outcome.release.sig_approved, 1);
    }

    #[test]
    fn double_vote_rejected_with_tally_unchanged() {
        let fx = fixture(3, 2);
        fx.releases.create(release("r1")).unwrap();
        fx.releases
            .add_vote("r1", &fx.signers[0], Vote::Approve)
            .unwrap();
        let err = fx
            .releases
            .add_vote("r1", &fx.signers[0], Vote::Approve)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::AlreadyVoted);
        let (r, state) = fx.releases.get("r1").unwrap();
        assert_eq!(r.sig_approved, 1);
        assert_eq!(state, ReleaseState::Pending);
    }

    #[test]
    fn non_signatory_cannot_vote() {
        let fx = fixture(1, 1);
        fx.releases.create(release("r1")).unwrap();
        let err = fx
            .releases
            .add_vote("r1", "stranger", Vote::Approve)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NotSignatory);
    }

    #[test]
    fn denial_quorum_closes_voting() {
        let fx = fixture(3, 2);
        fx.releases.create(release("r1")).unwrap();
        fx.releases
            .add_vote("r1", &fx.signers[0], Vote::Deny)
            .unwrap();
        let outcome = fx
            .releases
            .add_vote("r1", &fx.signers[1], Vote::Deny)
            .unwrap();
        assert_eq!(outcome.state, ReleaseState::Denied);

        let err = fx
            .releases
            .add_vote("r1", &fx.signers[2], Vote::Approve)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ReleaseClosed);
    }

    #[test]
    fn later_approval_supersedes_earlier() {
        let fx = fixture(1, 1);
        fx.releases.create(release("r1")).unwrap();
        fx.releases.create(release("r2")).unwrap();
        fx.releases
            .add_vote("r1", &fx.signers[0], Vote::Approve)
            .unwrap();
        assert_eq!(fx.releases.get("r1").unwrap().1, ReleaseState::Approved);

        fx.releases
            .add_vote("r2", &fx.signers[0], Vote::Approve)
            .unwrap();
        assert_eq!(fx.releases.get("r1").unwrap().1, ReleaseState::Superseded);
        assert_eq!(fx.releases.get("r2").unwrap().1, ReleaseState::Approved);
    }

    #[test]
    fn votes_on_superseded_release_are_rejected() {
        let fx = fixture(3, 1);
        fx.releases.create(release("r1")).unwrap();
        fx.releases.create(release("r2")).unwrap();
        fx.releases
            .add_vote("r1", &fx.signers[0], Vote::Approve)
            .unwrap();
        fx.releases
            .add_vote("r2", &fx.signers[1], Vote::Approve)
            .unwrap();
        let err = fx
            .releases
            .add_vote("r1", &fx.signers[2], Vote::Approve)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ReleaseClosed);
    }
}
