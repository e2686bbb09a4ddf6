//! Container image reference parsing and formatting.
//!
//! Parses references like `registry.example.com/app:v1@sha256:...` into
//! structured components. Parsing preserves the original spelling; the
//! Docker Hub defaults (`index.docker.io`, `library/`, `latest`) are applied
//! only when a canonical form is requested, so the original string stays
//! usable as a mapping key.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Error, Result};

/// Default registry applied in canonical forms.
pub const DEFAULT_REGISTRY: &str = "index.docker.io";

/// Default tag applied in canonical forms.
pub const DEFAULT_TAG: &str = "latest";

fn digest_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^sha256:[0-9a-f]{64}$").expect("digest pattern"))
}

/// True if `s` is a well-formed sha256 content digest.
pub fn is_valid_digest(s: &str) -> bool {
    digest_pattern().is_match(s)
}

/// Parsed image reference.
///
/// `registry` is `None` when the original string did not name one; hostname
/// case is preserved as written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry hostname, with optional port (e.g. "ghcr.io", "reg.io:5000")
    pub registry: Option<String>,
    /// Repository path as written (e.g. "nginx", "library/nginx")
    pub repository: String,
    /// Tag (e.g. "latest", "v1.2")
    pub tag: Option<String>,
    /// Digest (e.g. "sha256:abc...")
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// Supported formats:
    /// - `nginx`
    /// - `nginx:1.25`
    /// - `myuser/myimage:v1.0`
    /// - `ghcr.io/org/image:tag`
    /// - `reg.io:5000/org/image:tag@sha256:...`
    pub fn parse(reference: &str) -> Result<Self> {
        if reference.is_empty() {
            return Err(Error::InvalidReference {
                reference: reference.to_string(),
                message: "empty reference".to_string(),
            });
        }
        if reference.chars().any(char::is_whitespace) {
            return Err(Error::InvalidReference {
                reference: reference.to_string(),
                message: "whitespace in reference".to_string(),
            });
        }

        // Split off the digest first (@ separator)
        let (name_tag, digest) = match reference.rfind('@') {
            Some(at_pos) => {
                let digest_part = &reference[at_pos + 1..];
                if !is_valid_digest(digest_part) {
                    return Err(Error::InvalidReference {
                        reference: reference.to_string(),
                        message: format!(
                            "digest '{digest_part}' does not match sha256:<64 hex>"
                        ),
                    });
                }
                (&reference[..at_pos], Some(digest_part.to_string()))
            }
            None => (reference, None),
        };

        // Split the tag: the colon after the last slash. Without a slash a
        // colon always separates a tag (a bare registry:port is not a valid
        // image reference on its own).
        let (name, tag) = match name_tag.rfind('/') {
            Some(slash_pos) => {
                let after_slash = &name_tag[slash_pos + 1..];
                match after_slash.rfind(':') {
                    Some(colon_pos) => (
                        &name_tag[..slash_pos + 1 + colon_pos],
                        Some(after_slash[colon_pos + 1..].to_string()),
                    ),
                    None => (name_tag, None),
                }
            }
            None => match name_tag.rfind(':') {
                Some(colon_pos) => (
                    &name_tag[..colon_pos],
                    Some(name_tag[colon_pos + 1..].to_string()),
                ),
                None => (name_tag, None),
            },
        };

        if let Some(ref t) = tag {
            if t.is_empty() {
                return Err(Error::InvalidReference {
                    reference: reference.to_string(),
                    message: "empty tag".to_string(),
                });
            }
        }

        let (registry, repository) = split_registry_repository(name)?;
        if repository.is_empty() {
            return Err(Error::InvalidReference {
                reference: reference.to_string(),
                message: "empty repository".to_string(),
            });
        }

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Attach a digest, validating its shape.
    pub fn with_digest(&self, digest: &str) -> Result<Self> {
        if !is_valid_digest(digest) {
            return Err(Error::InvalidReference {
                reference: self.to_string(),
                message: format!("digest '{digest}' does not match sha256:<64 hex>"),
            });
        }
        let mut r = self.clone();
        r.digest = Some(digest.to_string());
        Ok(r)
    }

    /// True when the reference carries a content digest.
    pub fn is_digest_pinned(&self) -> bool {
        self.digest.is_some()
    }

    /// True when the reference carries a tag but no digest.
    pub fn is_tag_pinned(&self) -> bool {
        self.tag.is_some() && self.digest.is_none()
    }

    /// Registry with the canonical default applied.
    pub fn canonical_registry(&self) -> &str {
        self.registry.as_deref().unwrap_or(DEFAULT_REGISTRY)
    }

    /// Repository with the canonical `library/` default applied for
    /// single-component Docker Hub repositories.
    pub fn canonical_repository(&self) -> String {
        let on_hub = match self.registry.as_deref() {
            None => true,
            Some(r) => r.eq_ignore_ascii_case("docker.io") || r.eq_ignore_ascii_case("index.docker.io"),
        };
        if on_hub && !self.repository.contains('/') {
            format!("library/{}", self.repository)
        } else {
            self.repository.clone()
        }
    }

    /// Tag with the canonical `latest` default applied when the reference is
    /// not digest-pinned.
    pub fn canonical_tag(&self) -> Option<String> {
        match (&self.tag, &self.digest) {
            (Some(t), _) => Some(t.clone()),
            (None, None) => Some(DEFAULT_TAG.to_string()),
            (None, Some(_)) => None,
        }
    }

    /// Fully-qualified canonical form with all defaults applied.
    pub fn canonical(&self) -> String {
        let mut s = self.repo();
        if let Some(tag) = self.canonical_tag() {
            s.push(':');
            s.push_str(&tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }

    /// Canonical `registry/repository` with no tag or digest.
    pub fn repo(&self) -> String {
        format!("{}/{}", self.canonical_registry(), self.canonical_repository())
    }

    /// The reference's name as written: `[registry/]repository`.
    pub fn name(&self) -> String {
        match &self.registry {
            Some(r) => format!("{}/{}", r, self.repository),
            None => self.repository.clone(),
        }
    }

    /// Canonical digest-only form `registry/repository@digest`.
    ///
    /// Errors when no digest is attached.
    pub fn digest_ref(&self) -> Result<String> {
        match &self.digest {
            Some(digest) => Ok(format!("{}@{}", self.repo(), digest)),
            None => Err(Error::InvalidReference {
                reference: self.to_string(),
                message: "reference is not digest-pinned".to_string(),
            }),
        }
    }
}

/// Split a name into registry and repository. The first path component is a
/// registry iff it contains a dot or a colon, or is "localhost".
fn split_registry_repository(name: &str) -> Result<(Option<String>, String)> {
    if let Some(slash_pos) = name.find('/') {
        let first = &name[..slash_pos];
        if first.contains('.') || first.contains(':') || first == "localhost" {
            let repo = &name[slash_pos + 1..];
            if repo.is_empty() {
                return Err(Error::InvalidReference {
                    reference: name.to_string(),
                    message: "empty repository".to_string(),
                });
            }
            return Ok((Some(first.to_string()), repo.to_string()));
        }
    }
    Ok((None, name.to_string()))
}

impl std::fmt::Display for ImageReference {
    /// Reproduces the original spelling: no defaults, `tag@digest` when both
    /// are present.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ref registry) = self.registry {
            write!(f, "{}/", registry)?;
        }
        write!(f, "{}", self.repository)?;
        if let Some(ref tag) = self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(ref digest) = self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str =
        "sha256:abcdef1234567890abcdef1234567890abcdef1234567890abcdef1234567890";

    #[test]
    fn test_parse_simple_name() {
        let r = ImageReference::parse("nginx").unwrap();
        assert_eq!(r.registry, None);
        assert_eq!(r.repository, "nginx");
        assert_eq!(r.tag, None);
        assert_eq!(r.digest, None);
    }

    #[test]
    fn test_parse_name_with_tag() {
        let r = ImageReference::parse("nginx:1.25").unwrap();
        assert_eq!(r.repository, "nginx");
        assert_eq!(r.tag, Some("1.25".to_string()));
    }

    #[test]
    fn test_parse_custom_registry() {
        let r = ImageReference::parse("ghcr.io/acme/api:v0.1.0").unwrap();
        assert_eq!(r.registry, Some("ghcr.io".to_string()));
        assert_eq!(r.repository, "acme/api");
        assert_eq!(r.tag, Some("v0.1.0".to_string()));
    }

    #[test]
    fn test_parse_registry_with_port() {
        let r = ImageReference::parse("myregistry.io:5000/myimage:v1").unwrap();
        assert_eq!(r.registry, Some("myregistry.io:5000".to_string()));
        assert_eq!(r.repository, "myimage");
        assert_eq!(r.tag, Some("v1".to_string()));
    }

    #[test]
    fn test_parse_localhost_registry() {
        let r = ImageReference::parse("localhost/myimage:test").unwrap();
        assert_eq!(r.registry, Some("localhost".to_string()));
        assert_eq!(r.repository, "myimage");
    }

    #[test]
    fn test_parse_tag_and_digest() {
        let s = format!("ghcr.io/org/app:v1@{DIGEST}");
        let r = ImageReference::parse(&s).unwrap();
        assert_eq!(r.tag, Some("v1".to_string()));
        assert_eq!(r.digest, Some(DIGEST.to_string()));
    }

    #[test]
    fn test_parse_rejects_short_digest() {
        assert!(ImageReference::parse("nginx@sha256:abc123").is_err());
    }

    #[test]
    fn test_parse_rejects_empty() {
        assert!(ImageReference::parse("").is_err());
        assert!(ImageReference::parse("nginx:").is_err());
    }

    #[test]
    fn test_display_round_trips_original() {
        for s in [
            "nginx",
            "nginx:1.25",
            "MyRegistry.Example.COM/app:v1",
            "myuser/myimage",
            "ghcr.io/org/sub/image:v1",
            &format!("internal.example/app:v1@{DIGEST}"),
        ] {
            let r = ImageReference::parse(s).unwrap();
            assert_eq!(r.to_string(), *s);
        }
    }

    #[test]
    fn test_display_preserves_hostname_case() {
        let r = ImageReference::parse("Reg.Example.Com/app:v1").unwrap();
        assert_eq!(r.registry, Some("Reg.Example.Com".to_string()));
        assert_eq!(r.to_string(), "Reg.Example.Com/app:v1");
    }

    #[test]
    fn test_canonical_applies_defaults() {
        let r = ImageReference::parse("nginx").unwrap();
        assert_eq!(r.canonical(), "index.docker.io/library/nginx:latest");

        let r = ImageReference::parse("nginx:1.25").unwrap();
        assert_eq!(r.canonical(), "index.docker.io/library/nginx:1.25");

        let r = ImageReference::parse("myuser/myimage").unwrap();
        assert_eq!(r.canonical(), "index.docker.io/myuser/myimage:latest");
    }

    #[test]
    fn test_canonical_is_exact_for_canonical_input() {
        let s = "index.docker.io/library/nginx:1.25";
        let r = ImageReference::parse(s).unwrap();
        assert_eq!(r.canonical(), s);
    }

    #[test]
    fn test_canonical_no_latest_when_digest_pinned() {
        let s = format!("ghcr.io/org/app@{DIGEST}");
        let r = ImageReference::parse(&s).unwrap();
        assert_eq!(r.canonical(), s);
    }

    #[test]
    fn test_with_digest() {
        let r = ImageReference::parse("nginx:1.25").unwrap();
        let pinned = r.with_digest(DIGEST).unwrap();
        assert!(pinned.is_digest_pinned());
        assert_eq!(pinned.to_string(), format!("nginx:1.25@{DIGEST}"));
        assert!(r.with_digest("sha256:nope").is_err());
    }

    #[test]
    fn test_repo_and_digest_ref() {
        let r = ImageReference::parse("nginx:1.25").unwrap();
        assert_eq!(r.repo(), "index.docker.io/library/nginx");
        assert!(r.digest_ref().is_err());

        let pinned = r.with_digest(DIGEST).unwrap();
        assert_eq!(
            pinned.digest_ref().unwrap(),
            format!("index.docker.io/library/nginx@{DIGEST}")
        );
    }

    #[test]
    fn test_pinning_predicates() {
        let tagged = ImageReference::parse("nginx:1.25").unwrap();
        assert!(tagged.is_tag_pinned());
        assert!(!tagged.is_digest_pinned());

        let pinned = tagged.with_digest(DIGEST).unwrap();
        assert!(pinned.is_digest_pinned());
        assert!(!pinned.is_tag_pinned());
    }
}
