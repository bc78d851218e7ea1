//! Release source archiving through the control API.

mod common;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use cocoon_core::error::ErrorCode;
use cocoon_core::ipc::ApiRequest;
use common::{TestPlatform, cocoon_spec, github_repo};

fn create_release_with_source(
    fx: &TestPlatform,
    token: &str,
    release_id: &str,
    source: &str,
) -> Result<(), ErrorCode> {
    fx.request(
        token,
        ApiRequest::CreateRelease {
            id: release_id.to_string(),
            cocoon_id: "C1".to_string(),
            repo: github_repo("v1"),
            build: String::new(),
            source: source.to_string(),
            allow_duplicate: false,
        },
    )
    .map(|_| ())
    .map_err(|e| e.code)
}

#[test]
fn source_is_sealed_under_the_release_object_name() {
    let fx = TestPlatform::new();
    let (token, alice_id) = fx.signup("alice@x.test");
    fx.request(
        &token,
        ApiRequest::CreateCocoon {
            spec: cocoon_spec("C1", vec![alice_id], 1),
            allow_duplicate: false,
        },
    )
    .unwrap();

    let payload = b"tarball bytes";
    create_release_with_source(&fx, &token, "R1", &BASE64.encode(payload)).unwrap();

    let object = fx.archive_dir.join("C1_v1.tar.gz");
    assert_eq!(std::fs::read(object).unwrap(), payload);
}

#[test]
fn colliding_archive_fails_before_the_release_is_written() {
    let fx = TestPlatform::new();
    let (token, alice_id) = fx.signup("alice@x.test");
    fx.request(
        &token,
        ApiRequest::CreateCocoon {
            spec: cocoon_spec("C1", vec![alice_id], 1),
            allow_duplicate: false,
        },
    )
    .unwrap();

    create_release_with_source(&fx, &token, "R1", &BASE64.encode(b"first")).unwrap();

    // Same cocoon and version: the object name collides and the loser
    // fails without creating a second release.
    let err = create_release_with_source(&fx, &token, "R2", &BASE64.encode(b"second")).unwrap_err();
    assert_eq!(err, ErrorCode::ArchiveFailed);
    let err = fx
        .request(
            &token,
            ApiRequest::GetRelease {
                id: "R2".to_string(),
            },
        )
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::ReleaseNotFound);
}

#[test]
fn malformed_source_is_rejected() {
    let fx = TestPlatform::new();
    let (token, alice_id) = fx.signup("alice@x.test");
    fx.request(
        &token,
        ApiRequest::CreateCocoon {
            spec: cocoon_spec("C1", vec![alice_id], 1),
            allow_duplicate: false,
        },
    )
    .unwrap();

    let err = create_release_with_source(&fx, &token, "R1", "%%not-base64%%").unwrap_err();
    assert_eq!(err, ErrorCode::InvalidField);
}

#[test]
fn empty_source_skips_archiving() {
    let fx = TestPlatform::new();
    let (token, alice_id) = fx.signup("alice@x.test");
    fx.request(
        &token,
        ApiRequest::CreateCocoon {
            spec: cocoon_spec("C1", vec![alice_id], 1),
            allow_duplicate: false,
        },
    )
    .unwrap();

    create_release_with_source(&fx, &token, "R1", "").unwrap();
    assert!(!fx.archive_dir.join("C1_v1.tar.gz").exists());
}
