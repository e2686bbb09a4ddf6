//! Repin Remote - Registry, Scanner and Attestation Backends
//!
//! This crate implements the remote seams `repin-core` defines: the OCI
//! registry client (digest resolution, image copies, the mapping artifact),
//! the vulnerability oracles (scanner subprocess and occurrence store), and
//! the attester with its signing-key seam.

pub mod artifact;
pub mod attest;
pub mod grafeas;
pub mod kms;
pub mod registry;
pub mod scan;
pub mod trivy;

// Re-export common types
pub use attest::{binauthz_payload, Attester, Keyer};
pub use grafeas::{GrafeasVulnGetter, Note, Occurrence, OccurrenceStore, RestOccurrenceStore};
pub use kms::KmsKeyer;
pub use registry::{RegistryAuth, RegistryClient};
pub use scan::{VulnChecker, VulnGetter};
pub use trivy::{TrivyVulnGetter, DEFAULT_TRIVY_COMMAND};

/// Repin Remote version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
