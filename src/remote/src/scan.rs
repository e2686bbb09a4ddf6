//! Vulnerability checking: oracle seam plus policy application.

use std::sync::Arc;

use async_trait::async_trait;

use repin_core::error::Result;
use repin_core::mapping::QualifiedImage;
use repin_core::policy::{CvePolicy, ImageVulnerability, VulnReport};

/// A vulnerability oracle: raw findings for one digest-pinned reference.
#[async_trait]
pub trait VulnGetter: Send + Sync {
    async fn get(&self, digest_ref: &str) -> Result<Vec<ImageVulnerability>>;
}

/// Applies the CVE policy to oracle results for one image.
pub struct VulnChecker {
    policy: CvePolicy,
    getter: Arc<dyn VulnGetter>,
}

impl VulnChecker {
    pub fn new(policy: CvePolicy, getter: Arc<dyn VulnGetter>) -> Self {
        Self { policy, getter }
    }

    /// Check one mapping entry. The oracle is consulted only when the policy
    /// is enabled and the source image is not exempt; either way the report's
    /// lists are set (possibly empty).
    pub async fn check(&self, source: &str, image: &QualifiedImage) -> Result<VulnReport> {
        if !self.policy.is_enabled() {
            return Ok(VulnReport::default());
        }
        if self.policy.image_ignored(source) {
            tracing::debug!(image = %source, "image exempt from vulnerability checks");
            return Ok(VulnReport::default());
        }

        let digest_ref = image.digest_ref()?;
        let vulnerabilities = self.getter.get(&digest_ref).await?;
        let report = self.policy.classify(&vulnerabilities);
        tracing::debug!(
            image = %source,
            found = report.found.len(),
            ignored = report.ignored.len(),
            "vulnerability check complete"
        );
        Ok(report)
    }
}
