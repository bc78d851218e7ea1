//! Container launcher contract.
//!
//! The platform never builds or runs user code itself; an approved
//! release is handed to a launcher collaborator as a
//! [`DeploymentSpec`]. The daemon ships a logging stub for
//! environments without a launcher and a recording double for tests.

// Mutex poisoning indicates a panic in another thread, which is
// unrecoverable.
#![allow(clippy::missing_panics_doc)]

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use cocoon_core::cocoon::DeploymentSpec;
use cocoon_core::error::{ApiError, ErrorCode};
use thiserror::Error;

/// Errors from deployment dispatch.
#[derive(Debug, Error)]
pub enum LauncherError {
    /// The launcher endpoint could not be reached or refused.
    #[error("launcher unavailable: {0}")]
    Unavailable(String),

    /// The dispatch deadline expired.
    ///
    /// The release stays approved; a reconciler retries the deployment
    /// out of band.
    #[error("deployment deadline expired")]
    DeadlineExceeded,
}

impl From<LauncherError> for ApiError {
    fn from(err: LauncherError) -> Self {
        match err {
            LauncherError::DeadlineExceeded => {
                Self::new(ErrorCode::DeadlineExceeded, err.to_string())
            },
            LauncherError::Unavailable(_) => {
                Self::new(ErrorCode::LauncherUnavailable, err.to_string())
            },
        }
    }
}

/// Dispatches deployment specifications.
pub trait Launcher: Send + Sync {
    /// Hands a deployment to the launcher, bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`LauncherError::Unavailable`] or
    /// [`LauncherError::DeadlineExceeded`].
    fn deploy(&self, spec: &DeploymentSpec, timeout: Duration) -> Result<(), LauncherError>;
}

impl<T: Launcher + ?Sized> Launcher for std::sync::Arc<T> {
    fn deploy(&self, spec: &DeploymentSpec, timeout: Duration) -> Result<(), LauncherError> {
        (**self).deploy(spec, timeout)
    }
}

/// Launcher client speaking newline-delimited JSON over TCP.
///
/// One deadline covers connect, send, and acknowledgement: every
/// socket operation carries the remaining budget, so a stalled
/// endpoint surfaces as [`LauncherError::DeadlineExceeded`] instead of
/// hanging the dispatcher.
#[derive(Debug, Clone)]
pub struct TcpLauncher {
    address: String,
}

impl TcpLauncher {
    /// Creates a client for the given endpoint address.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

impl Launcher for TcpLauncher {
    fn deploy(&self, spec: &DeploymentSpec, timeout: Duration) -> Result<(), LauncherError> {
        let deadline = Instant::now() + timeout;
        let addr = self
            .address
            .to_socket_addrs()
            .map_err(|e| LauncherError::Unavailable(format!("{}: {e}", self.address)))?
            .next()
            .ok_or_else(|| {
                LauncherError::Unavailable(format!("{}: no resolved address", self.address))
            })?;

        let stream = TcpStream::connect_timeout(&addr, remaining(deadline)?).map_err(map_io)?;
        let mut payload = serde_json::to_vec(spec)
            .map_err(|e| LauncherError::Unavailable(format!("spec encoding failed: {e}")))?;
        payload.push(b'\n');
        stream
            .set_write_timeout(Some(remaining(deadline)?))
            .map_err(map_io)?;
        (&stream).write_all(&payload).map_err(map_io)?;

        stream
            .set_read_timeout(Some(remaining(deadline)?))
            .map_err(map_io)?;
        let mut ack = String::new();
        BufReader::new(&stream).read_line(&mut ack).map_err(map_io)?;
        if ack.trim() == "ok" {
            Ok(())
        } else {
            Err(LauncherError::Unavailable(format!(
                "launcher rejected deployment: '{}'",
                ack.trim()
            )))
        }
    }
}

fn remaining(deadline: Instant) -> Result<Duration, LauncherError> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        return Err(LauncherError::DeadlineExceeded);
    }
    Ok(left)
}

fn map_io(err: std::io::Error) -> LauncherError {
    match err.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
            LauncherError::DeadlineExceeded
        },
        _ => LauncherError::Unavailable(err.to_string()),
    }
}

/// Launcher stub that logs the dispatch and succeeds.
#[derive(Debug, Default)]
pub struct LogLauncher;

impl Launcher for LogLauncher {
    fn deploy(&self, spec: &DeploymentSpec, _timeout: Duration) -> Result<(), LauncherError> {
        tracing::info!(
            cocoon = %spec.cocoon_id,
            release = %spec.release_id,
            resources = %spec.resources.name,
            "deployment dispatched"
        );
        Ok(())
    }
}

/// Test double that records every dispatched spec.
#[derive(Debug, Default)]
pub struct RecordingLauncher {
    deployed: Mutex<Vec<DeploymentSpec>>,
    fail_with: Mutex<Option<String>>,
    expired: Mutex<bool>,
}

impl RecordingLauncher {
    /// Creates a recorder that accepts every dispatch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent dispatches fail as unavailable.
    pub fn fail_with(&self, reason: &str) {
        *self.fail_with.lock().unwrap() = Some(reason.to_string());
    }

    /// Makes subsequent dispatches fail with an expired deadline.
    pub fn expire_deadline(&self) {
        *self.expired.lock().unwrap() = true;
    }

    /// Specs dispatched so far.
    #[must_use]
    pub fn deployed(&self) -> Vec<DeploymentSpec> {
        self.deployed.lock().unwrap().clone()
    }
}

impl Launcher for RecordingLauncher {
    fn deploy(&self, spec: &DeploymentSpec, _timeout: Duration) -> Result<(), LauncherError> {
        if *self.expired.lock().unwrap() {
            return Err(LauncherError::DeadlineExceeded);
        }
        if let Some(reason) = self.fail_with.lock().unwrap().clone() {
            return Err(LauncherError::Unavailable(reason));
        }
        self.deployed.lock().unwrap().push(spec.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::net::TcpListener;

    use cocoon_core::cocoon::Repo;
    use cocoon_core::resource::{Language, SET_S2};

    use super::*;

    fn spec() -> DeploymentSpec {
        DeploymentSpec {
            cocoon_id: "c1".to_string(),
            release_id: "r1".to_string(),
            repo: Repo {
                url: "https://github.com/o/r".to_string(),
                version: "v1".to_string(),
                language: Language::Go,
                link: String::new(),
            },
            build: String::new(),
            resources: SET_S2,
            link: String::new(),
            env: BTreeMap::new(),
            firewall: Vec::new(),
            acl: BTreeMap::new(),
        }
    }

    #[test]
    fn tcp_dispatch_succeeds_on_acknowledgement() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut line = String::new();
            BufReader::new(&stream).read_line(&mut line).unwrap();
            assert!(line.contains("\"cocoon_id\":\"c1\""));
            (&stream).write_all(b"ok\n").unwrap();
        });

        let launcher = TcpLauncher::new(addr.to_string());
        launcher.deploy(&spec(), Duration::from_secs(5)).unwrap();
        server.join().unwrap();
    }

    #[test]
    fn tcp_dispatch_rejection_is_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut line = String::new();
            BufReader::new(&stream).read_line(&mut line).unwrap();
            (&stream).write_all(b"no capacity\n").unwrap();
        });

        let launcher = TcpLauncher::new(addr.to_string());
        let err = launcher.deploy(&spec(), Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, LauncherError::Unavailable(_)));
        server.join().unwrap();
    }

    #[test]
    fn tcp_dispatch_stalled_endpoint_exceeds_deadline() {
        // Bound but never accepted: the connection sits in the backlog
        // and the acknowledgement read runs out the budget.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let launcher = TcpLauncher::new(addr.to_string());
        let err = launcher
            .deploy(&spec(), Duration::from_millis(80))
            .unwrap_err();
        assert!(matches!(err, LauncherError::DeadlineExceeded));
        drop(listener);
    }

    #[test]
    fn malformed_endpoint_is_unavailable() {
        let launcher = TcpLauncher::new("not-an-address");
        let err = launcher
            .deploy(&spec(), Duration::from_millis(80))
            .unwrap_err();
        assert!(matches!(err, LauncherError::Unavailable(_)));
    }
}
