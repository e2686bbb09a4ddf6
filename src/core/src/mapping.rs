//! The source-reference → qualified-image table and its JSON form.
//!
//! The mapping is keyed by the exact source string found in the documents,
//! preserves insertion order, and serializes to a flat JSON object so runs
//! can be replayed from a static mappings file or registry artifact.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::reference::{is_valid_digest, ImageReference};

/// The record produced for one source reference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualifiedImage {
    /// Post-rename target reference, including its tag
    #[serde(rename = "Tag")]
    pub tag: String,
    /// Content digest of the target
    #[serde(rename = "Digest")]
    pub digest: String,
    /// CVE ids violating the policy
    #[serde(rename = "FoundCVEs", default)]
    pub found_cves: Vec<String>,
    /// CVE ids present but explicitly ignored
    #[serde(rename = "IgnoredCVEs", default)]
    pub ignored_cves: Vec<String>,
}

impl QualifiedImage {
    /// The target as a parsed, digest-pinned reference.
    pub fn target(&self) -> Result<ImageReference> {
        ImageReference::parse(&self.tag)?.with_digest(&self.digest)
    }

    /// Canonical `repo@digest` form of the target.
    pub fn digest_ref(&self) -> Result<String> {
        self.target()?.digest_ref()
    }
}

/// Source reference string → qualified image, in execution order.
pub type Mapping = IndexMap<String, QualifiedImage>;

/// Parse a mapping from its JSON object form and validate its shape: every
/// target must parse and every digest must be well-formed.
pub fn parse_mapping(bytes: &[u8]) -> Result<Mapping> {
    let mapping: Mapping = serde_json::from_slice(bytes)
        .map_err(|e| Error::BadConfig(format!("mappings are not a JSON object: {e}")))?;
    for (source, image) in &mapping {
        ImageReference::parse(&image.tag).map_err(|e| {
            Error::BadConfig(format!("mapping for '{source}' has a bad target: {e}"))
        })?;
        if !is_valid_digest(&image.digest) {
            return Err(Error::BadConfig(format!(
                "mapping for '{source}' has a bad digest '{}'",
                image.digest
            )));
        }
    }
    Ok(mapping)
}

/// Serialize a mapping to its stable JSON object form: insertion order,
/// UTF-8, no BOM.
pub fn serialize_mapping(mapping: &Mapping) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(mapping)?)
}

/// Re-resolve every target's digest against the registry. Any drift aborts
/// the run: a stale mapping must never be replayed.
pub async fn verify_mapping(
    mapping: &Mapping,
    resolver: &dyn crate::remap::DigestResolver,
) -> Result<()> {
    for (source, image) in mapping {
        let target = ImageReference::parse(&image.tag)?;
        let current = resolver.resolve(&target).await?;
        if current != image.digest {
            return Err(Error::StaleMapping {
                reference: source.clone(),
                recorded: image.digest.clone(),
                current,
            });
        }
        tracing::debug!(source = %source, target = %image.tag, "static mapping verified");
    }
    Ok(())
}
