//! CVE policy: which raw scanner findings count as violations.

use std::collections::HashSet;

use regex::Regex;

/// One raw finding from a vulnerability oracle.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageVulnerability {
    /// CVE identifier (e.g. "CVE-2024-12345")
    pub id: String,
    /// CVSS v3 score
    pub cvss: f32,
}

/// Classified findings for one image.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VulnReport {
    /// Policy violations
    pub found: Vec<String>,
    /// Present but explicitly ignored
    pub ignored: Vec<String>,
}

/// The configured CVE policy.
///
/// `max_cvss == 0` disables vulnerability checking entirely. Surprising, but
/// it is the established behaviour and scripts depend on it.
#[derive(Debug, Clone)]
pub struct CvePolicy {
    pub max_cvss: f32,
    pub ignore_list: HashSet<String>,
    pub ignore_images: Option<Regex>,
}

impl CvePolicy {
    pub fn new(max_cvss: f32, ignore_list: Vec<String>, ignore_images: Option<Regex>) -> Self {
        Self {
            max_cvss,
            ignore_list: ignore_list.into_iter().collect(),
            ignore_images,
        }
    }

    /// False when `max_cvss` is zero: no oracle is consulted at all.
    pub fn is_enabled(&self) -> bool {
        self.max_cvss > 0.0
    }

    /// Whole-image exemption from scanning.
    pub fn image_ignored(&self, source: &str) -> bool {
        self.ignore_images
            .as_ref()
            .is_some_and(|re| re.is_match(source))
    }

    /// Split raw findings into violations and ignored CVEs. Findings below
    /// the threshold are dropped; the threshold itself violates (`>=`).
    pub fn classify(&self, vulnerabilities: &[ImageVulnerability]) -> VulnReport {
        let mut report = VulnReport::default();
        for vuln in vulnerabilities {
            if self.ignore_list.contains(&vuln.id) {
                report.ignored.push(vuln.id.clone());
            } else if vuln.cvss >= self.max_cvss {
                report.found.push(vuln.id.clone());
            }
        }
        report
    }
}
