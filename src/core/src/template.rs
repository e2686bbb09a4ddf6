//! Rename template expansion.
//!
//! The remote path layout is a template over the canonical parts of the
//! source reference, `{{.Registry}} {{.Repository}} {{.Tag}} {{.Digest}}`,
//! matching the layout strings users already have.

use crate::error::{Error, Result};
use crate::reference::ImageReference;

/// The default layout: keep the canonical repository path.
pub const DEFAULT_RENAME_TEMPLATE: &str = "{{.Repository}}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Registry,
    Repository,
    Tag,
    Digest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(Field),
}

/// A parsed `{{.Field}}` template.
#[derive(Debug, Clone)]
pub struct RenameTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl RenameTemplate {
    pub fn parse(template: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut rest = template;

        while let Some(open) = rest.find("{{") {
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let tail = &rest[open + 2..];
            let close = tail.find("}}").ok_or_else(|| {
                Error::BadConfig(format!("unclosed '{{{{' in rename template '{template}'"))
            })?;
            let name = tail[..close].trim();
            let field = match name.strip_prefix('.') {
                Some("Registry") => Field::Registry,
                Some("Repository") => Field::Repository,
                Some("Tag") => Field::Tag,
                Some("Digest") => Field::Digest,
                _ => {
                    return Err(Error::BadConfig(format!(
                        "unknown rename template field '{name}' in '{template}'"
                    )))
                }
            };
            segments.push(Segment::Field(field));
            rest = &tail[close + 2..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }
        if segments.is_empty() {
            return Err(Error::BadConfig("empty rename template".to_string()));
        }

        Ok(RenameTemplate {
            source: template.to_string(),
            segments,
        })
    }

    /// Expand over the canonical parts of `reference`, with `digest` already
    /// resolved.
    pub fn expand(&self, reference: &ImageReference, digest: &str) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(s) => out.push_str(s),
                Segment::Field(Field::Registry) => out.push_str(reference.canonical_registry()),
                Segment::Field(Field::Repository) => {
                    out.push_str(&reference.canonical_repository())
                }
                Segment::Field(Field::Tag) => {
                    out.push_str(&reference.canonical_tag().unwrap_or_default())
                }
                Segment::Field(Field::Digest) => out.push_str(digest),
            }
        }
        out
    }

    /// True when this is exactly the built-in default.
    pub fn is_default(&self) -> bool {
        self.source == DEFAULT_RENAME_TEMPLATE
    }
}
