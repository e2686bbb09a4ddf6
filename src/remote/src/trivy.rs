//! Subprocess vulnerability oracle.
//!
//! Runs the configured scanner command with the digest reference appended as
//! the final argument and parses its JSON report. The scanner's own exit
//! code is advisory: a failed scan that still produced a report is parsed,
//! an empty report is a hard error.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use repin_core::error::{Error, Result};
use repin_core::policy::ImageVulnerability;

use crate::scan::VulnGetter;

/// Default scanner invocation.
pub const DEFAULT_TRIVY_COMMAND: &str = "trivy image -f json";

/// Scanner oracle executing a trivy-style subprocess per image.
pub struct TrivyVulnGetter {
    program: String,
    args: Vec<String>,
}

impl TrivyVulnGetter {
    /// Split a command line like `trivy image -f json` into program and
    /// arguments.
    pub fn new(command: &str) -> Result<Self> {
        let mut parts = command.split_whitespace().map(String::from);
        let program = parts
            .next()
            .ok_or_else(|| Error::BadConfig("empty scanner command".to_string()))?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }
}

#[async_trait]
impl VulnGetter for TrivyVulnGetter {
    async fn get(&self, digest_ref: &str) -> Result<Vec<ImageVulnerability>> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(digest_ref)
            .output()
            .await
            .map_err(|e| Error::VulnScan {
                reference: digest_ref.to_string(),
                message: format!("failed to run '{}': {e}", self.program),
            })?;

        if output.stdout.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::VulnScan {
                reference: digest_ref.to_string(),
                message: format!(
                    "scanner produced no output (exit {:?}): {}",
                    output.status.code(),
                    stderr.trim()
                ),
            });
        }
        if !output.status.success() {
            tracing::warn!(
                image = %digest_ref,
                exit = ?output.status.code(),
                "scanner exited non-zero, parsing its report anyway"
            );
        }

        parse_report(digest_ref, &output.stdout)
    }
}

#[derive(Debug, Deserialize)]
struct TrivyReport {
    #[serde(rename = "Results", default)]
    results: Vec<TrivyResult>,
}

#[derive(Debug, Deserialize)]
struct TrivyResult {
    #[serde(rename = "Vulnerabilities", default)]
    vulnerabilities: Vec<TrivyVulnerability>,
}

#[derive(Debug, Deserialize)]
struct TrivyVulnerability {
    #[serde(rename = "VulnerabilityID")]
    id: String,
    #[serde(rename = "CVSS", default)]
    cvss: HashMap<String, TrivyCvss>,
}

#[derive(Debug, Deserialize)]
struct TrivyCvss {
    #[serde(rename = "V3Score")]
    v3_score: Option<f32>,
}

/// Flatten the scanner report. A CVE's score is the highest V3 score any
/// vendor reported; a CVE with no V3 score at all scores 0.
fn parse_report(digest_ref: &str, stdout: &[u8]) -> Result<Vec<ImageVulnerability>> {
    let report: TrivyReport =
        serde_json::from_slice(stdout).map_err(|e| Error::VulnScan {
            reference: digest_ref.to_string(),
            message: format!("unparseable scanner output: {e}"),
        })?;

    let mut vulnerabilities = Vec::new();
    for result in report.results {
        for vuln in result.vulnerabilities {
            let cvss = vuln
                .cvss
                .values()
                .filter_map(|c| c.v3_score)
                .fold(0.0f32, f32::max);
            vulnerabilities.push(ImageVulnerability { id: vuln.id, cvss });
        }
    }
    Ok(vulnerabilities)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = r#"{
        "SchemaVersion": 2,
        "ArtifactName": "registry.example.com/mirror/library/nginx",
        "Results": [
            {
                "Target": "registry.example.com/mirror/library/nginx (debian 12)",
                "Vulnerabilities": [
                    {
                        "VulnerabilityID": "CVE-2024-0001",
                        "PkgName": "libssl3",
                        "CVSS": {
                            "nvd": {"V2Score": 6.8, "V3Score": 7.5},
                            "redhat": {"V3Score": 8.1}
                        }
                    },
                    {
                        "VulnerabilityID": "CVE-2024-0002",
                        "PkgName": "zlib1g",
                        "CVSS": {
                            "nvd": {"V2Score": 4.3}
                        }
                    }
                ]
            },
            {
                "Target": "usr/bin/app",
                "Vulnerabilities": [
                    {
                        "VulnerabilityID": "CVE-2024-0003",
                        "CVSS": {"ghsa": {"V3Score": 5.0}}
                    }
                ]
            }
        ]
    }"#;

    #[test]
    fn test_parse_report_takes_highest_v3_score() {
        let vulns = parse_report("img", REPORT.as_bytes()).unwrap();
        assert_eq!(vulns.len(), 3);
        assert_eq!(vulns[0].id, "CVE-2024-0001");
        assert_eq!(vulns[0].cvss, 8.1);
        // No V3 score anywhere scores zero.
        assert_eq!(vulns[1].cvss, 0.0);
        assert_eq!(vulns[2].cvss, 5.0);
    }

    #[test]
    fn test_parse_report_without_results() {
        let vulns = parse_report("img", br#"{"SchemaVersion": 2}"#).unwrap();
        assert!(vulns.is_empty());
    }

    #[test]
    fn test_parse_report_rejects_garbage() {
        let err = parse_report("img", b"panic: scanner blew up").unwrap_err();
        assert!(matches!(err, Error::VulnScan { .. }));
    }

    #[test]
    fn test_command_splitting() {
        let getter = TrivyVulnGetter::new("trivy image -f json").unwrap();
        assert_eq!(getter.program, "trivy");
        assert_eq!(getter.args, ["image", "-f", "json"]);
        assert!(TrivyVulnGetter::new("   ").is_err());
    }

    #[tokio::test]
    async fn test_empty_stdout_is_hard_error() {
        // `true` exits 0 and prints nothing.
        let getter = TrivyVulnGetter::new("true").unwrap();
        let err = getter.get("registry.example.com/app@sha256:dead").await;
        assert!(matches!(err, Err(Error::VulnScan { .. })));
    }

    #[tokio::test]
    async fn test_nonzero_exit_with_output_is_parsed() {
        // The appended reference lands in $0, the report still parses.
        let getter = TrivyVulnGetter {
            program: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                r#"echo '{"Results":[]}'; exit 1"#.to_string(),
            ],
        };
        let vulns = getter
            .get("registry.example.com/app@sha256:dead")
            .await
            .unwrap();
        assert!(vulns.is_empty());
    }
}
