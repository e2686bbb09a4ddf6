//! Offline runs driven purely by a static mappings file.
//!
//! With `--mappings-only`, `--no-copy` and verification off, a run touches
//! no registry at all: the chain replays the mapping and the recorder must
//! reproduce it exactly.

use clap::Parser;

use repin_cli::{App, Cli};
use repin_core::mapping::{serialize_mapping, Mapping, QualifiedImage};

const DIGEST_A: &str =
    "sha256:bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
const DIGEST_B: &str =
    "sha256:cccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccc";

fn entry(tag: &str, digest: &str) -> QualifiedImage {
    QualifiedImage {
        tag: tag.to_string(),
        digest: digest.to_string(),
        found_cves: vec![],
        ignored_cves: vec![],
    }
}

async fn run_mappings_only(mapping: &Mapping) -> Vec<u8> {
    let dir = tempfile::tempdir().unwrap();
    let input_path = dir.path().join("mappings.json");
    let output_path = dir.path().join("out.json");
    std::fs::write(&input_path, serialize_mapping(mapping).unwrap()).unwrap();

    let cli = Cli::try_parse_from([
        "repin",
        "--mappings-only",
        "--no-copy",
        "--verify-static-json-mappings",
        "false",
        "--static-json-mappings-file",
        input_path.to_str().unwrap(),
        "--write-json-mappings-file",
        output_path.to_str().unwrap(),
    ])
    .unwrap();

    App::new(cli).unwrap().run().await.unwrap();
    std::fs::read(&output_path).unwrap()
}

#[tokio::test]
async fn test_written_mapping_equals_input_byte_for_byte() {
    let mut mapping = Mapping::new();
    mapping.insert(
        "busybox:1".to_string(),
        entry("mirror.example.com/busybox:1", DIGEST_A),
    );
    mapping.insert(
        "alpine:3.19".to_string(),
        entry("mirror.example.com/alpine:3.19", DIGEST_B),
    );

    let written = run_mappings_only(&mapping).await;
    assert_eq!(written, serialize_mapping(&mapping).unwrap());
}

#[tokio::test]
async fn test_two_sources_may_share_a_target() {
    let mut mapping = Mapping::new();
    mapping.insert(
        "nginx:1.25".to_string(),
        entry("mirror.example.com/nginx:1.25", DIGEST_A),
    );
    mapping.insert(
        "docker.io/library/nginx:1.25".to_string(),
        entry("mirror.example.com/nginx:1.25", DIGEST_A),
    );

    let written = run_mappings_only(&mapping).await;
    let round_tripped: Mapping = serde_json::from_slice(&written).unwrap();
    assert_eq!(round_tripped.len(), 2);
    assert_eq!(
        round_tripped["nginx:1.25"],
        round_tripped["docker.io/library/nginx:1.25"]
    );
}

#[tokio::test]
async fn test_mappings_only_requires_a_source() {
    let cli = Cli::try_parse_from(["repin", "--mappings-only"]).unwrap();
    let err = App::new(cli).unwrap().run().await.unwrap_err();
    assert!(err.to_string().contains("static mappings source"));
}

#[cfg(unix)]
#[tokio::test]
async fn test_policy_violation_fails_run_but_writes_mapping() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let input_path = dir.path().join("mappings.json");
    let output_path = dir.path().join("out.json");
    let scanner_path = dir.path().join("fake-scanner");

    let mut mapping = Mapping::new();
    mapping.insert(
        "busybox:1".to_string(),
        entry("mirror.example.com/busybox:1", DIGEST_A),
    );
    std::fs::write(&input_path, serialize_mapping(&mapping).unwrap()).unwrap();

    let report = r#"{"Results":[{"Vulnerabilities":[
        {"VulnerabilityID":"CVE-2024-9999","CVSS":{"nvd":{"V3Score":8.1}}},
        {"VulnerabilityID":"CVE-2024-0001","CVSS":{"nvd":{"V3Score":3.0}}}
    ]}]}"#;
    std::fs::write(&scanner_path, format!("#!/bin/sh\ncat <<'EOF'\n{report}\nEOF\n")).unwrap();
    std::fs::set_permissions(&scanner_path, std::fs::Permissions::from_mode(0o755)).unwrap();

    let cli = Cli::try_parse_from([
        "repin",
        "--mappings-only",
        "--no-copy",
        "--verify-static-json-mappings",
        "false",
        "--static-json-mappings-file",
        input_path.to_str().unwrap(),
        "--write-json-mappings-file",
        output_path.to_str().unwrap(),
        "--vulncheck-max-cvss",
        "5.0",
        "--trivy-command",
        scanner_path.to_str().unwrap(),
    ])
    .unwrap();

    let err = App::new(cli).unwrap().run().await.unwrap_err();
    assert!(err.to_string().contains("CVE-2024-9999"));

    // The run failed, but the mapping was still written, with the scan
    // results merged in.
    let written: Mapping =
        serde_json::from_slice(&std::fs::read(&output_path).unwrap()).unwrap();
    let entry = &written["busybox:1"];
    assert_eq!(entry.found_cves, ["CVE-2024-9999"]);
    assert!(entry.ignored_cves.is_empty());
}
