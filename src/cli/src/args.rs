//! CLI flag definitions.

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser, ValueEnum};

use repin_core::template::DEFAULT_RENAME_TEMPLATE;
use repin_remote::trivy::DEFAULT_TRIVY_COMMAND;

/// How input documents are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum InputKind {
    /// Kubernetes manifests: the built-in workload rules are appended
    K8s,
    /// Plain YAML: only user-supplied rules apply
    Yaml,
}

/// Which vulnerability oracle to consult.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum VulncheckMethod {
    /// Scanner subprocess producing JSON on stdout
    Trivy,
    /// Remote occurrence store
    Grafeas,
}

/// Repin: pin, relocate, scan and attest the images in deployment manifests.
///
/// Reads a YAML document stream on stdin and writes the rewritten stream to
/// stdout; all logging goes to stderr.
#[derive(Debug, Parser)]
#[command(name = "repin", version, about)]
pub struct Cli {
    /// Input format
    #[arg(long, value_enum, default_value_t = InputKind::K8s)]
    pub input: InputKind,

    /// YAML definition of kind/image-path rules
    #[arg(long, value_name = "PATH")]
    pub rules_config: Option<PathBuf>,

    /// Leave images matching this expression untouched
    #[arg(long, value_name = "REGEX")]
    pub ignore: Option<String>,

    /// Resolve digests but keep the name for images matching this expression
    #[arg(long, default_value = "^$", value_name = "REGEX")]
    pub rename_ignore: String,

    /// Registry path renamed images are relocated under
    #[arg(long, value_name = "PATH")]
    pub rename_remote_path: Option<String>,

    /// Layout template for relocated images
    #[arg(long, default_value = DEFAULT_RENAME_TEMPLATE, value_name = "TEMPLATE")]
    pub rename_template: String,

    /// Write digest-only references (repo@sha256:...)
    #[arg(long)]
    pub rename_force_digest: bool,

    /// Take all mappings from a JSON file
    #[arg(long, value_name = "PATH")]
    pub static_json_mappings_file: Option<PathBuf>,

    /// Take all mappings from a registry image
    #[arg(long, value_name = "REF")]
    pub static_json_mappings_img: Option<String>,

    /// Re-resolve every static mapping target before the run
    #[arg(long, default_value_t = true, action = ArgAction::Set, value_name = "BOOL")]
    pub verify_static_json_mappings: bool,

    /// Drive the chain over the static mapping keys instead of stdin
    #[arg(long)]
    pub mappings_only: bool,

    /// Disable copying of renamed images
    #[arg(long)]
    pub no_copy: bool,

    /// Allow overwriting existing remote images
    #[arg(long)]
    pub clobber: bool,

    /// Write final image mappings to a JSON file
    #[arg(long, value_name = "PATH")]
    pub write_json_mappings_file: Option<PathBuf>,

    /// Write final image mappings to a registry image
    #[arg(long, value_name = "REF")]
    pub write_json_mappings_img: Option<String>,

    /// Only log actions that would write or copy
    #[arg(long)]
    pub dryrun: bool,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,

    /// Vulnerability oracle
    #[arg(long, value_enum, default_value_t = VulncheckMethod::Trivy)]
    pub vulncheck_method: VulncheckMethod,

    /// Maximum allowed CVSS score; 0 disables vulnerability checking
    #[arg(long, default_value_t = 0.0, value_name = "SCORE")]
    pub vulncheck_max_cvss: f32,

    /// Comma separated CVE ids to ignore
    #[arg(long, value_delimiter = ',', value_name = "CSV")]
    pub vulncheck_ignore_cve_list: Vec<String>,

    /// Skip CVE checks for images matching this expression
    #[arg(long, value_name = "REGEX")]
    pub vulncheck_ignore_images: Option<String>,

    /// How long to wait for vulnerability scanning, per image
    #[arg(long, default_value = "10m", value_parser = parse_duration, value_name = "DURATION")]
    pub vulncheck_timeout: Duration,

    /// Retry budget while waiting for a remote discovery
    #[arg(long, default_value_t = 20, value_name = "N")]
    pub vulncheck_max_retries: u32,

    /// Scanner command for the trivy method
    #[arg(long, default_value = DEFAULT_TRIVY_COMMAND, value_name = "CMD")]
    pub trivy_command: String,

    /// Grafeas parent (e.g. "projects/my-project")
    #[arg(long, value_name = "PARENT")]
    pub grafeas_parent: Option<String>,

    /// Attestation note reference
    #[arg(long, value_name = "NOTE")]
    pub binauthz_attestor: Option<String>,

    /// KMS key resource used for signing
    #[arg(long, value_name = "KEY")]
    pub gcp_kms_key: Option<String>,
}

/// Parse a duration like "90", "500ms", "90s", "10m" or "2h".
fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    let (num, unit_ms) = if let Some(n) = s.strip_suffix("ms") {
        (n, 1u64)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1000)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60 * 1000)
    } else if let Some(n) = s.strip_suffix('h') {
        (n, 60 * 60 * 1000)
    } else {
        return Err(format!("unrecognized duration: '{s}'"));
    };
    let n: u64 = num
        .trim()
        .parse()
        .map_err(|_| format!("invalid number in duration: '{s}'"))?;
    Ok(Duration::from_millis(n * unit_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["repin"]).unwrap();
        assert_eq!(cli.input, InputKind::K8s);
        assert_eq!(cli.rename_ignore, "^$");
        assert_eq!(cli.rename_template, DEFAULT_RENAME_TEMPLATE);
        assert_eq!(cli.vulncheck_method, VulncheckMethod::Trivy);
        assert_eq!(cli.vulncheck_max_cvss, 0.0);
        assert_eq!(cli.vulncheck_timeout, Duration::from_secs(600));
        assert_eq!(cli.vulncheck_max_retries, 20);
        assert_eq!(cli.trivy_command, DEFAULT_TRIVY_COMMAND);
        assert!(cli.verify_static_json_mappings);
        assert!(!cli.mappings_only);
        assert!(!cli.no_copy);
    }

    #[test]
    fn test_verify_flag_takes_a_value() {
        let cli =
            Cli::try_parse_from(["repin", "--verify-static-json-mappings", "false"]).unwrap();
        assert!(!cli.verify_static_json_mappings);
    }

    #[test]
    fn test_cve_list_splits_on_commas() {
        let cli = Cli::try_parse_from([
            "repin",
            "--vulncheck-ignore-cve-list",
            "CVE-1,CVE-2, CVE-3",
        ])
        .unwrap();
        assert_eq!(cli.vulncheck_ignore_cve_list, ["CVE-1", "CVE-2", " CVE-3"]);
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert!(parse_duration("soon").is_err());
    }
}
