//! Control API request dispatch.
//!
//! [`Platform`] is the explicit composition root: it owns the store,
//! the registries, the session table, the archiver, the launcher, and
//! the configuration, and is passed to every request handler. It is
//! the only component that knows the ordering between registries.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use cocoon_core::cocoon::{Cocoon, CocoonStatus, DeploymentSpec, Repo};
use cocoon_core::config::PlatformConfig;
use cocoon_core::error::{ApiError, ApiResult, ErrorCode};
use cocoon_core::identity::{Identity, IdentityView};
use cocoon_core::ipc::{ApiRequest, ApiResponse, CocoonSpec, Envelope, RequestFrame};
use cocoon_core::ledger::{GLOBAL_LEDGER, is_reserved_ledger, make_ledger_name};
use cocoon_core::release::{Release, ReleaseState, Vote};
use cocoon_core::resource::{CpuShare, Memory};

use crate::archive::{ObjectStore, archive_object_name, archive_payload};
use crate::auth::{PasswordHasher, SessionAuth, Sha256PasswordHasher};
use crate::launcher::Launcher;
use crate::registry::{CocoonRegistry, IdentityRegistry, ReleaseRegistry};
use crate::store::SqliteStore;

/// The assembled platform.
pub struct Platform {
    store: SqliteStore,
    identities: IdentityRegistry,
    cocoons: CocoonRegistry,
    releases: ReleaseRegistry,
    auth: SessionAuth,
    hasher: Box<dyn PasswordHasher>,
    archive: Box<dyn ObjectStore>,
    launcher: Box<dyn Launcher>,
    config: PlatformConfig,
}

impl Platform {
    /// Assembles a platform over the given collaborators.
    #[must_use]
    pub fn new(
        store: SqliteStore,
        archive: Box<dyn ObjectStore>,
        launcher: Box<dyn Launcher>,
        config: PlatformConfig,
    ) -> Self {
        Self {
            identities: IdentityRegistry::new(store.clone()),
            cocoons: CocoonRegistry::new(store.clone()),
            releases: ReleaseRegistry::new(store.clone()),
            store,
            auth: SessionAuth::new(),
            hasher: Box::new(Sha256PasswordHasher),
            archive,
            launcher,
            config,
        }
    }

    /// Handles one request frame, producing the wire envelope.
    pub fn handle(&self, frame: &RequestFrame) -> Envelope {
        match self.dispatch(frame) {
            Ok(response) => Envelope::ok(&response).unwrap_or_else(|err| {
                tracing::error!(%err, "response serialization failed");
                Envelope::error(&ApiError::new(
                    ErrorCode::StoreUnavailable,
                    "response serialization failed",
                ))
            }),
            Err(err) => {
                tracing::debug!(code = ?err.code, message = %err.message, "request failed");
                Envelope::error(&err)
            },
        }
    }

    fn dispatch(&self, frame: &RequestFrame) -> ApiResult<ApiResponse> {
        let caller = if frame.request.is_auth_exempt() {
            None
        } else {
            Some(self.auth.verify(&frame.token, |email| {
                self.identities.get(email).ok()
            })?)
        };

        match &frame.request {
            ApiRequest::Login { email, password } => self.login(email, password),
            ApiRequest::Logout { all_sessions } => {
                self.logout(&caller_of(caller)?, &frame.token, *all_sessions)
            },
            ApiRequest::CreateIdentity {
                email,
                password,
                allow_duplicate,
            } => {
                let digest = self.hasher.hash(password);
                let identity = if *allow_duplicate {
                    self.identities.upsert(email, &digest)?
                } else {
                    self.identities.create(email, &digest)?
                };
                Ok(ApiResponse::Identity {
                    identity: IdentityView::from(&identity),
                })
            },
            ApiRequest::GetIdentity { who } => {
                let identity = self.identities.get(who)?;
                Ok(ApiResponse::Identity {
                    identity: IdentityView::from(&identity),
                })
            },
            ApiRequest::AddCocoonToIdentity { email, cocoon_id } => {
                self.cocoons.get(cocoon_id)?;
                let identity = self.identities.add_cocoon(email, cocoon_id)?;
                Ok(ApiResponse::Identity {
                    identity: IdentityView::from(&identity),
                })
            },
            ApiRequest::CreateCocoon {
                spec,
                allow_duplicate,
            } => self.create_cocoon(&caller_of(caller)?, spec, *allow_duplicate),
            ApiRequest::GetCocoon { id } => Ok(ApiResponse::Cocoon {
                cocoon: Box::new(self.cocoons.get(id)?),
            }),
            ApiRequest::StopCocoon { id } => Ok(ApiResponse::Cocoon {
                cocoon: Box::new(self.cocoons.stop(id)?),
            }),
            ApiRequest::AddSignatories {
                cocoon_id,
                signatories,
            } => {
                self.cocoons.add_signatories(cocoon_id, signatories)?;
                Ok(ApiResponse::Cocoon {
                    cocoon: Box::new(self.cocoons.get(cocoon_id)?),
                })
            },
            ApiRequest::CreateRelease {
                id,
                cocoon_id,
                repo,
                build,
                source,
                allow_duplicate,
            } => self.create_release(id, cocoon_id, repo, build, source, *allow_duplicate),
            ApiRequest::GetRelease { id } => {
                let (release, state) = self.releases.get(id)?;
                Ok(ApiResponse::Release {
                    release: Box::new(release),
                    state,
                })
            },
            ApiRequest::AddVote { release_id, vote } => {
                self.add_vote(&caller_of(caller)?, release_id, vote)
            },
            ApiRequest::Deploy {
                cocoon_id,
                release_id,
            } => self.deploy(cocoon_id, release_id),
            ApiRequest::CreateLedger {
                name,
                public,
                chained,
            } => self.create_ledger(&caller_of(caller)?, name, *public, *chained),
            ApiRequest::Put {
                ledger,
                id,
                key,
                value,
            } => {
                let name = self.resolve_ledger(&caller_of(caller)?, ledger, true)?;
                let tx = self.store.put(&name, id, key, value)?;
                Ok(ApiResponse::Tx { tx: Box::new(tx) })
            },
            ApiRequest::Get { ledger, key } => {
                let name = self.resolve_ledger(&caller_of(caller)?, ledger, false)?;
                let tx = self.store.get(&name, key)?.ok_or_else(|| {
                    ApiError::new(
                        ErrorCode::TxNotFound,
                        format!("no transaction for key '{key}' in ledger '{ledger}'"),
                    )
                })?;
                Ok(ApiResponse::Tx { tx: Box::new(tx) })
            },
            ApiRequest::GetById { id } => {
                let tx = self.store.get_by_id(id)?.ok_or_else(|| {
                    ApiError::new(ErrorCode::TxNotFound, format!("no transaction '{id}'"))
                })?;
                if is_reserved_ledger(&tx.ledger) && tx.ledger != GLOBAL_LEDGER {
                    return Err(ApiError::new(
                        ErrorCode::PermissionDenied,
                        "system ledgers are not readable through the transaction API",
                    ));
                }
                Ok(ApiResponse::Tx { tx: Box::new(tx) })
            },
        }
    }

    fn login(&self, email: &str, password: &str) -> ApiResult<ApiResponse> {
        let identity = self
            .identities
            .get(email)
            .map_err(|_| bad_credentials())?;
        if !self.hasher.verify(password, &identity.password_hash) {
            return Err(bad_credentials());
        }
        let (token, digest) = self.auth.mint(email);
        self.identities.update(email, |identity| {
            if !identity.client_sessions.iter().any(|d| d == &digest) {
                identity.client_sessions.push(digest.clone());
            }
            Ok(())
        })?;
        Ok(ApiResponse::Session { token })
    }

    fn logout(&self, caller: &Identity, token: &str, all_sessions: bool) -> ApiResult<ApiResponse> {
        if all_sessions {
            self.auth.revoke_all(&caller.email);
            self.identities.update(&caller.email, |identity| {
                identity.client_sessions.clear();
                Ok(())
            })?;
        } else {
            let digest = self.auth.revoke(token);
            self.identities.update(&caller.email, |identity| {
                identity.client_sessions.retain(|d| d != &digest);
                Ok(())
            })?;
        }
        Ok(ApiResponse::Ok)
    }

    fn create_cocoon(
        &self,
        caller: &Identity,
        spec: &CocoonSpec,
        allow_duplicate: bool,
    ) -> ApiResult<ApiResponse> {
        let cocoon = Cocoon {
            id: spec.id.clone(),
            repo: spec.repo.clone(),
            build: spec.build.clone(),
            memory: Memory::parse(&spec.memory)?,
            cpu_share: CpuShare::parse(&spec.cpu_share)?,
            num_signatories: spec.num_signatories,
            sig_threshold: spec.sig_threshold,
            signatories: spec.signatories.clone(),
            releases: Vec::new(),
            status: CocoonStatus::Created,
            acl: spec.acl.clone(),
            firewall: spec.firewall.clone(),
            env: spec.env.clone(),
            created_at: now_rfc3339(),
        };
        let cocoon = if allow_duplicate {
            self.cocoons.upsert(cocoon)?
        } else {
            self.cocoons.create(cocoon)?
        };
        self.identities.add_cocoon(&caller.email, &cocoon.id)?;
        Ok(ApiResponse::Cocoon {
            cocoon: Box::new(cocoon),
        })
    }

    /// Archives the source first: a failed upload must never leave a
    /// release record behind, while a sealed archive with no release is
    /// harmless and collides idempotently on retry.
    fn create_release(
        &self,
        id: &str,
        cocoon_id: &str,
        repo: &Repo,
        build: &str,
        source: &str,
        allow_duplicate: bool,
    ) -> ApiResult<ApiResponse> {
        self.cocoons.get(cocoon_id)?;
        if !source.is_empty() {
            let payload = BASE64.decode(source).map_err(|e| {
                ApiError::invalid_field("source", format!("not valid base64: {e}"))
            })?;
            let name = archive_object_name(cocoon_id, &repo.version);
            archive_payload(self.archive.as_ref(), &name, &payload)?;
        }
        let release = Release {
            id: id.to_string(),
            cocoon_id: cocoon_id.to_string(),
            repo: repo.clone(),
            build: build.to_string(),
            voters_id: Vec::new(),
            sig_approved: 0,
            sig_denied: 0,
            created_at: now_rfc3339(),
        };
        let release = if allow_duplicate {
            self.releases.upsert(release)?
        } else {
            self.releases.create(release)?
        };
        Ok(ApiResponse::Release {
            release: Box::new(release),
            state: ReleaseState::Pending,
        })
    }

    fn add_vote(&self, caller: &Identity, release_id: &str, vote: &str) -> ApiResult<ApiResponse> {
        let vote = Vote::parse(vote)?;
        let outcome = self.releases.add_vote(release_id, &caller.id(), vote)?;
        if outcome.newly_approved {
            self.deploy_release(&outcome.cocoon, &outcome.release)?;
        }
        Ok(ApiResponse::Release {
            release: Box::new(outcome.release),
            state: outcome.state,
        })
    }

    fn deploy(&self, cocoon_id: &str, release_id: &str) -> ApiResult<ApiResponse> {
        let cocoon = self.cocoons.get(cocoon_id)?;
        let release = if release_id.is_empty() {
            self.latest_approved(&cocoon)?
        } else {
            let (release, state) = self.releases.get(release_id)?;
            if state != ReleaseState::Approved {
                return Err(ApiError::invalid_field(
                    "release_id",
                    format!("release '{release_id}' is {state:?}, not approved"),
                ));
            }
            release
        };
        let cocoon = self.deploy_release(&cocoon, &release)?;
        Ok(ApiResponse::Cocoon {
            cocoon: Box::new(cocoon),
        })
    }

    fn latest_approved(&self, cocoon: &Cocoon) -> ApiResult<Release> {
        for id in cocoon.releases.iter().rev() {
            let (release, state) = self.releases.get(id)?;
            if state == ReleaseState::Approved {
                return Ok(release);
            }
        }
        Err(ApiError::new(
            ErrorCode::ReleaseNotFound,
            format!("cocoon '{}' has no approved release", cocoon.id),
        ))
    }

    /// Marks the cocoon deploying, dispatches, and marks it running.
    /// On dispatch failure the prior status is restored and the error
    /// surfaced; the release stays approved for a later retry.
    fn deploy_release(&self, cocoon: &Cocoon, release: &Release) -> ApiResult<Cocoon> {
        let spec = DeploymentSpec::build_for(cocoon, release);
        let prior = cocoon.status;
        self.cocoons.update(&cocoon.id, |c| {
            c.status = CocoonStatus::Deploying;
            Ok(())
        })?;
        let timeout = Duration::from_secs(self.config.launcher.deploy_timeout_secs);
        match self.launcher.deploy(&spec, timeout) {
            Ok(()) => self.cocoons.update(&cocoon.id, |c| {
                c.status = CocoonStatus::Running;
                Ok(())
            }),
            Err(err) => {
                tracing::warn!(
                    cocoon = %cocoon.id,
                    release = %release.id,
                    %err,
                    "deployment dispatch failed, restoring status"
                );
                self.cocoons.update(&cocoon.id, |c| {
                    c.status = prior;
                    Ok(())
                })?;
                Err(err.into())
            },
        }
    }

    fn create_ledger(
        &self,
        caller: &Identity,
        name: &str,
        public: bool,
        chained: bool,
    ) -> ApiResult<ApiResponse> {
        if name.is_empty() {
            return Err(ApiError::invalid_field("name", "must not be empty"));
        }
        if is_reserved_ledger(name) {
            return Err(ApiError::new(
                ErrorCode::NameTaken,
                format!("'{name}' is a reserved ledger name"),
            ));
        }
        let storage_name = make_ledger_name(&caller.id(), name);
        let ledger = self.store.create_ledger(&storage_name, public, chained)?;
        Ok(ApiResponse::Ledger { ledger })
    }

    /// Maps a logical ledger name to its storage name in the caller's
    /// namespace, enforcing system-ledger access rules.
    fn resolve_ledger(
        &self,
        caller: &Identity,
        logical_name: &str,
        for_write: bool,
    ) -> ApiResult<String> {
        if is_reserved_ledger(logical_name) && logical_name != GLOBAL_LEDGER {
            let action = if for_write { "writable" } else { "readable" };
            return Err(ApiError::new(
                ErrorCode::PermissionDenied,
                format!("system ledger '{logical_name}' is not {action} through the API"),
            ));
        }
        Ok(make_ledger_name(&caller.id(), logical_name))
    }
}

impl std::fmt::Debug for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Platform").finish_non_exhaustive()
    }
}

fn caller_of(caller: Option<Identity>) -> ApiResult<Identity> {
    caller.ok_or_else(|| {
        ApiError::new(
            ErrorCode::NoActiveSession,
            "this method requires a session token",
        )
    })
}

fn bad_credentials() -> ApiError {
    ApiError::new(ErrorCode::PermissionDenied, "invalid email or password")
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
