//! Shared fixtures for daemon integration tests.
//!
//! Every test builds its own ephemeral platform: fresh in-memory store,
//! archive directory under a tempdir, and a recording launcher.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::sync::Arc;

use cocoon_core::cocoon::Repo;
use cocoon_core::error::ApiError;
use cocoon_core::ipc::{ApiRequest, ApiResponse, CocoonSpec, RequestFrame};
use cocoon_core::resource::Language;
use cocoon_daemon::archive::FsObjectStore;
use cocoon_daemon::launcher::RecordingLauncher;
use cocoon_daemon::{Platform, SqliteStore};
use tempfile::TempDir;

pub struct TestPlatform {
    pub platform: Arc<Platform>,
    pub launcher: Arc<RecordingLauncher>,
    pub archive_dir: std::path::PathBuf,
    _tmp: TempDir,
}

impl TestPlatform {
    pub fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let archive_dir = tmp.path().join("archives");
        let store = SqliteStore::in_memory().unwrap();
        let launcher = Arc::new(RecordingLauncher::new());
        let platform = Arc::new(Platform::new(
            store,
            Box::new(FsObjectStore::new(archive_dir.clone()).unwrap()),
            Box::new(Arc::clone(&launcher)),
            cocoon_core::config::PlatformConfig::default(),
        ));
        Self {
            platform,
            launcher,
            archive_dir,
            _tmp: tmp,
        }
    }

    /// Dispatches a request, decoding the envelope back into the typed
    /// result union.
    pub fn request(&self, token: &str, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let envelope = self.platform.handle(&RequestFrame {
            token: token.to_string(),
            request,
        });
        if envelope.is_ok() {
            Ok(envelope.decode().unwrap())
        } else {
            Err(envelope.decode_error().unwrap())
        }
    }

    /// Registers an identity and opens a session; returns (token, id).
    pub fn signup(&self, email: &str) -> (String, String) {
        let response = self
            .request(
                "",
                ApiRequest::CreateIdentity {
                    email: email.to_string(),
                    password: "hunter2".to_string(),
                    allow_duplicate: false,
                },
            )
            .unwrap();
        let ApiResponse::Identity { identity } = response else {
            panic!("unexpected response: {response:?}");
        };
        let response = self
            .request(
                "",
                ApiRequest::Login {
                    email: email.to_string(),
                    password: "hunter2".to_string(),
                },
            )
            .unwrap();
        let ApiResponse::Session { token } = response else {
            panic!("unexpected response: {response:?}");
        };
        (token, identity.id)
    }
}

pub fn github_repo(version: &str) -> Repo {
    Repo {
        url: "https://github.com/o/r".to_string(),
        version: version.to_string(),
        language: Language::Go,
        link: String::new(),
    }
}

pub fn cocoon_spec(id: &str, signatories: Vec<String>, threshold: u32) -> CocoonSpec {
    CocoonSpec {
        id: id.to_string(),
        repo: github_repo("v1"),
        build: String::new(),
        memory: "512m".to_string(),
        cpu_share: "1x".to_string(),
        num_signatories: signatories.len() as u32,
        sig_threshold: threshold,
        signatories,
        env: std::collections::BTreeMap::new(),
        firewall: Vec::new(),
        acl: std::collections::BTreeMap::new(),
    }
}
