//! Repin Core - Reference Remapping Pipeline
//!
//! This crate provides the manifest-side pipeline: parsing image references,
//! locating them in documents via declarative rules, transforming each
//! through the remapper chain, and accumulating the source → target mapping.
//! Everything that talks to a registry, scanner, or occurrence store sits
//! behind the traits defined here and is implemented in `repin-remote`.

pub mod error;
pub mod finder;
pub mod history;
pub mod mapping;
pub mod policy;
pub mod reference;
pub mod remap;
pub mod retry;
pub mod rules;
pub mod template;
pub mod updater;

// Re-export commonly used types
pub use error::{aggregate, Error, Result};
pub use finder::{extract_image_scalars, ImageFinder, ImageHit};
pub use history::History;
pub use mapping::{parse_mapping, serialize_mapping, verify_mapping, Mapping, QualifiedImage};
pub use policy::{CvePolicy, ImageVulnerability, VulnReport};
pub use reference::ImageReference;
pub use remap::{
    DigestResolver, EnsureRemapper, IgnoreRemapper, ImageCopier, MultiRemapper, RecorderRemapper,
    Remapper, RenameRemapper, StaticRemapper,
};
pub use rules::{default_rules, CompiledRules, RuleConfig};
pub use template::{RenameTemplate, DEFAULT_RENAME_TEMPLATE};
pub use updater::RemapUpdater;

/// Repin version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// File name of the mapping inside the registry artifact's single layer.
/// Part of the wire format shared with existing tooling; do not rename.
pub const MAPPING_FILE_NAME: &str = "reimage-mapping.json";
