//! Closed resource sets and repository validation.
//!
//! Cocoons pick from enumerated memory and CPU grades; the pair maps
//! onto one of four closed resource sets handed to the launcher.
//! Additions to the supported values are configuration, not code paths:
//! every match below is exhaustive over the enums.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult, ErrorCode};

/// Supported build/runtime toolchains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    /// The Go toolchain.
    Go,
}

impl Language {
    /// Parses a language label.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::UnsupportedLanguage`] for unknown labels.
    pub fn parse(label: &str) -> ApiResult<Self> {
        match label {
            "go" => Ok(Self::Go),
            other => Err(ApiError::new(
                ErrorCode::UnsupportedLanguage,
                format!("unsupported language '{other}' (supported: go)"),
            )),
        }
    }

    /// The canonical label for this language.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Go => "go",
        }
    }
}

/// Supported memory grades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Memory {
    /// 512 MiB.
    #[serde(rename = "512m")]
    M512,
    /// 1 GiB.
    #[serde(rename = "1g")]
    G1,
    /// 2 GiB.
    #[serde(rename = "2g")]
    G2,
}

impl Memory {
    /// Parses a memory grade label.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::BadResourceSet`] for unknown labels.
    pub fn parse(label: &str) -> ApiResult<Self> {
        match label {
            "512m" => Ok(Self::M512),
            "1g" => Ok(Self::G1),
            "2g" => Ok(Self::G2),
            other => Err(ApiError::new(
                ErrorCode::BadResourceSet,
                format!("unknown memory grade '{other}' (supported: 512m, 1g, 2g)"),
            )),
        }
    }

    /// The canonical label for this grade.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::M512 => "512m",
            Self::G1 => "1g",
            Self::G2 => "2g",
        }
    }
}

/// Supported CPU share grades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpuShare {
    /// Baseline share.
    #[serde(rename = "1x")]
    X1,
    /// Double share.
    #[serde(rename = "2x")]
    X2,
}

impl CpuShare {
    /// Parses a CPU share label.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::BadResourceSet`] for unknown labels.
    pub fn parse(label: &str) -> ApiResult<Self> {
        match label {
            "1x" => Ok(Self::X1),
            "2x" => Ok(Self::X2),
            other => Err(ApiError::new(
                ErrorCode::BadResourceSet,
                format!("unknown cpu share '{other}' (supported: 1x, 2x)"),
            )),
        }
    }

    /// The canonical label for this grade.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::X1 => "1x",
            Self::X2 => "2x",
        }
    }
}

/// A concrete launcher-facing resource allocation.
///
/// The catalog is closed, so the label alone identifies a set; the
/// numeric fields on the wire are informational echoes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResourceSet {
    /// Set label (`s1`, `s2`, `m1`, `m2`).
    pub name: &'static str,
    /// Memory in MiB.
    pub memory_mib: u32,
    /// CPU share units.
    pub cpu_share: u32,
    /// Disk in MiB.
    pub disk_mib: u32,
}

/// `s1`: 256 MiB / 100 shares / 4000 MiB disk.
pub const SET_S1: ResourceSet = ResourceSet {
    name: "s1",
    memory_mib: 256,
    cpu_share: 100,
    disk_mib: 4000,
};

/// `s2`: 512 MiB / 100 shares / 4000 MiB disk.
pub const SET_S2: ResourceSet = ResourceSet {
    name: "s2",
    memory_mib: 512,
    cpu_share: 100,
    disk_mib: 4000,
};

/// `m1`: 1024 MiB / 100 shares / 4000 MiB disk.
pub const SET_M1: ResourceSet = ResourceSet {
    name: "m1",
    memory_mib: 1024,
    cpu_share: 100,
    disk_mib: 4000,
};

/// `m2`: 2048 MiB / 200 shares / 4000 MiB disk.
pub const SET_M2: ResourceSet = ResourceSet {
    name: "m2",
    memory_mib: 2048,
    cpu_share: 200,
    disk_mib: 4000,
};

impl<'de> Deserialize<'de> for ResourceSet {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Labeled {
            name: String,
        }
        let Labeled { name } = Labeled::deserialize(deserializer)?;
        match name.as_str() {
            "s1" => Ok(SET_S1),
            "s2" => Ok(SET_S2),
            "m1" => Ok(SET_M1),
            "m2" => Ok(SET_M2),
            other => Err(serde::de::Error::unknown_variant(
                other,
                &["s1", "s2", "m1", "m2"],
            )),
        }
    }
}

impl ResourceSet {
    /// Maps a memory/CPU grade pair onto its closed resource set.
    ///
    /// The memory grade picks the set, so the allocation never falls
    /// below the requested memory; `m2` is the only set carrying a
    /// double CPU share.
    #[must_use]
    pub const fn for_grades(memory: Memory, cpu: CpuShare) -> Self {
        match (memory, cpu) {
            (Memory::M512, _) => SET_S2,
            (Memory::G1, _) => SET_M1,
            (Memory::G2, _) => SET_M2,
        }
    }
}

fn repo_url_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^https?://github\.com/[A-Za-z0-9_.-]+/[A-Za-z0-9_.-]+/?$")
            .expect("repo URL pattern compiles")
    })
}

/// Validates a source-repository URL against the host whitelist.
///
/// # Errors
///
/// Returns [`ErrorCode::BadUrl`] unless the URL matches
/// `https?://github.com/<owner>/<repo>`.
pub fn validate_repo_url(url: &str) -> ApiResult<()> {
    if repo_url_pattern().is_match(url) {
        Ok(())
    } else {
        Err(ApiError::new(
            ErrorCode::BadUrl,
            format!("'{url}' is not an accepted source repository (expected https://github.com/<owner>/<repo>)"),
        ))
    }
}

/// Validates that an optional build manifest parses as JSON.
///
/// # Errors
///
/// Returns [`ErrorCode::BadJson`] when the manifest is present and
/// malformed.
pub fn validate_build_json(build: &str) -> ApiResult<()> {
    if build.is_empty() {
        return Ok(());
    }
    serde_json::from_str::<serde_json::Value>(build).map_err(|e| {
        ApiError::new(ErrorCode::BadJson, format!("build manifest is not valid JSON: {e}"))
    })?;
    Ok(())
}
