//! Cocoon entity: a deployable contract and its signatory policy.
//!
//! Self-contained invariants (threshold bounds, signatory capacity,
//! repository and resource validity) are enforced here; cross-entity
//! invariants (signatories exist, link target exists, releases belong
//! to this cocoon) are the registries' job because they need the store.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};
use crate::release::Release;
use crate::resource::{
    CpuShare, Language, Memory, ResourceSet, validate_build_json, validate_repo_url,
};

/// Pointer to a cocoon's source repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repo {
    /// Source repository URL (host-whitelisted).
    pub url: String,
    /// Version tag or commit to build.
    pub version: String,
    /// Build/runtime toolchain.
    pub language: Language,
    /// Optional ID of another cocoon to natively link against.
    #[serde(default)]
    pub link: String,
}

/// Cocoon lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CocoonStatus {
    /// Registered, never deployed.
    Created,
    /// A deployment has been handed to the launcher.
    Deploying,
    /// The launcher reported the workload up.
    Running,
    /// Stopped by an operator.
    Stopped,
}

/// Advisory firewall rule passed through to the launcher.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRule {
    /// Destination host or CIDR.
    pub destination: String,
    /// Destination port.
    pub destination_port: String,
    /// Protocol (`tcp`/`udp`).
    pub protocol: String,
}

/// A registered contract unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cocoon {
    /// Unique ID (UUID4).
    pub id: String,
    /// Source repository pointer.
    pub repo: Repo,
    /// Build manifest, arbitrary JSON text. May be empty.
    #[serde(default)]
    pub build: String,
    /// Memory grade.
    pub memory: Memory,
    /// CPU share grade.
    pub cpu_share: CpuShare,
    /// Maximum size of the signatory set.
    pub num_signatories: u32,
    /// Approval votes required to release; in `[1, num_signatories]`.
    pub sig_threshold: u32,
    /// Identity IDs allowed to vote, insertion-ordered, no duplicates.
    #[serde(default)]
    pub signatories: Vec<String>,
    /// Release IDs in proposal order; the last entry is the latest.
    #[serde(default)]
    pub releases: Vec<String>,
    /// Lifecycle status.
    pub status: CocoonStatus,
    /// Advisory ACL record passed to the launcher, keyed by ledger name.
    #[serde(default)]
    pub acl: BTreeMap<String, String>,
    /// Advisory firewall rules passed to the launcher.
    #[serde(default)]
    pub firewall: Vec<FirewallRule>,
    /// Environment variables passed to the launcher.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Creation time, RFC3339.
    pub created_at: String,
}

impl Cocoon {
    /// The launcher-facing resource set for this cocoon's grades.
    #[must_use]
    pub const fn resource_set(&self) -> ResourceSet {
        ResourceSet::for_grades(self.memory, self.cpu_share)
    }

    /// ID of the latest proposed release, if any.
    #[must_use]
    pub fn latest_release(&self) -> Option<&str> {
        self.releases.last().map(String::as_str)
    }

    /// Returns `true` if the identity ID is a current signatory.
    #[must_use]
    pub fn is_signatory(&self, identity_id: &str) -> bool {
        self.signatories.iter().any(|s| s == identity_id)
    }

    /// Validates self-contained invariants.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant as a typed [`ApiError`]:
    /// threshold bounds, signatory capacity and uniqueness, repository
    /// URL, and build-manifest JSON.
    pub fn validate(&self) -> ApiResult<()> {
        if self.id.is_empty() {
            return Err(ApiError::invalid_field("id", "must not be empty"));
        }
        if self.num_signatories < 1 {
            return Err(ApiError::invalid_field("num_signatories", "must be at least 1"));
        }
        if self.sig_threshold < 1 || self.sig_threshold > self.num_signatories {
            return Err(ApiError::invalid_field(
                "sig_threshold",
                format!("must be in [1, {}]", self.num_signatories),
            ));
        }
        if self.signatories.len() as u32 > self.num_signatories {
            return Err(ApiError::invalid_field(
                "signatories",
                format!("at most {} signatories allowed", self.num_signatories),
            ));
        }
        let mut seen = std::collections::BTreeSet::new();
        for signatory in &self.signatories {
            if !seen.insert(signatory) {
                return Err(ApiError::invalid_field(
                    "signatories",
                    format!("duplicate signatory '{signatory}'"),
                ));
            }
        }
        validate_repo_url(&self.repo.url)?;
        if self.repo.version.is_empty() {
            return Err(ApiError::invalid_field("repo.version", "must not be empty"));
        }
        validate_build_json(&self.build)?;
        Ok(())
    }

    /// Derives this release's supersession context: the ID of the
    /// latest approved release of this cocoon, if any.
    ///
    /// `releases_by_id` must cover at least the IDs in `self.releases`;
    /// missing entries are treated as never-approved.
    #[must_use]
    pub fn latest_approved_release<'a>(
        &self,
        releases_by_id: &'a BTreeMap<String, Release>,
    ) -> Option<&'a Release> {
        self.releases
            .iter()
            .rev()
            .filter_map(|id| releases_by_id.get(id))
            .find(|r| r.sig_approved >= self.sig_threshold)
    }
}

/// The launcher-bound record derived from a cocoon and an approved
/// release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentSpec {
    /// Cocoon being deployed.
    pub cocoon_id: String,
    /// Approved release being deployed.
    pub release_id: String,
    /// Source pointer taken from the release.
    pub repo: Repo,
    /// Build manifest taken from the release.
    pub build: String,
    /// Resolved resource allocation.
    pub resources: ResourceSet,
    /// Optional natively linked cocoon.
    pub link: String,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Advisory firewall rules.
    pub firewall: Vec<FirewallRule>,
    /// Advisory ACL record.
    pub acl: BTreeMap<String, String>,
}

impl DeploymentSpec {
    /// Builds the spec for deploying `release` of `cocoon`.
    #[must_use]
    pub fn build_for(cocoon: &Cocoon, release: &Release) -> Self {
        Self {
            cocoon_id: cocoon.id.clone(),
            release_id: release.id.clone(),
            repo: release.repo.clone(),
            build: release.build.clone(),
            resources: cocoon.resource_set(),
            link: release.repo.link.clone(),
            env: cocoon.env.clone(),
            firewall: cocoon.firewall.clone(),
            acl: cocoon.acl.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    pub(crate) fn sample_cocoon() -> Cocoon {
        Cocoon {
            id: "6d5e7a00-14be-4b5c-9d38-9e125d172810".to_string(),
            repo: Repo {
                url: "https://github.com/owner/repo".to_string(),
                version: "v1".to_string(),
                language: Language::Go,
                link: String::new(),
            },
            build: String::new(),
            memory: Memory::M512,
            cpu_share: CpuShare::X1,
            num_signatories: 3,
            sig_threshold: 2,
            signatories: vec!["sig-a".to_string(), "sig-b".to_string()],
            releases: Vec::new(),
            status: CocoonStatus::Created,
            acl: BTreeMap::new(),
            firewall: Vec::new(),
            env: BTreeMap::new(),
            created_at: "2024-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn valid_cocoon_passes() {
        sample_cocoon().validate().unwrap();
    }

    #[test]
    fn threshold_must_stay_within_signatory_count() {
        let mut cocoon = sample_cocoon();
        cocoon.sig_threshold = 4;
        let err = cocoon.validate().unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidField);

        cocoon.sig_threshold = 0;
        assert!(cocoon.validate().is_err());
    }

    #[test]
    fn signatory_set_is_capacity_bounded_and_unique() {
        let mut cocoon = sample_cocoon();
        cocoon.signatories = vec![
            "a".to_string(),
            "b".to_string(),
            "c".to_string(),
            "d".to_string(),
        ];
        assert!(cocoon.validate().is_err());

        cocoon.signatories = vec!["a".to_string(), "a".to_string()];
        let err = cocoon.validate().unwrap_err();
        assert!(err.message.contains("duplicate"));
    }

    #[test]
    fn repo_url_is_validated() {
        let mut cocoon = sample_cocoon();
        cocoon.repo.url = "https://example.com/o/r".to_string();
        let err = cocoon.validate().unwrap_err();
        assert_eq!(err.code, ErrorCode::BadUrl);
    }

    #[test]
    fn latest_release_is_last_entry() {
        let mut cocoon = sample_cocoon();
        assert_eq!(cocoon.latest_release(), None);
        cocoon.releases = vec!["r1".to_string(), "r2".to_string()];
        assert_eq!(cocoon.latest_release(), Some("r2"));
    }

    #[test]
    fn deployment_spec_takes_repo_from_release() {
        let cocoon = sample_cocoon();
        let release = crate::release::tests::sample_release(&cocoon.id);
        let spec = DeploymentSpec::build_for(&cocoon, &release);
        assert_eq!(spec.cocoon_id, cocoon.id);
        assert_eq!(spec.release_id, release.id);
        assert_eq!(spec.repo, release.repo);
        assert_eq!(spec.resources, cocoon.resource_set());
    }
}
