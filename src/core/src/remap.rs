//! The remapper chain: ordered single-image transformations.
//!
//! Each remapper reads the terminal reference from the [`History`], computes
//! the next, and appends it. [`Error::Skip`] stops the chain and leaves the
//! image untouched; any other error aborts that image. The orchestrator
//! composes the fixed order ignore → static → rename → record → ensure.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::history::History;
use crate::mapping::{Mapping, QualifiedImage};
use crate::reference::ImageReference;
use crate::retry::backoff_delay;
use crate::template::RenameTemplate;

/// One transformation step on a reference.
#[async_trait]
pub trait Remapper: Send + Sync {
    fn name(&self) -> &'static str;

    async fn re_map(&self, history: &mut History) -> Result<()>;
}

/// Resolves a reference's current manifest digest (registry HEAD).
#[async_trait]
pub trait DigestResolver: Send + Sync {
    async fn resolve(&self, reference: &ImageReference) -> Result<String>;
}

/// Copies manifest and layers between repositories.
#[async_trait]
pub trait ImageCopier: Send + Sync {
    /// The target's current digest, or None when it does not exist.
    async fn head(&self, reference: &ImageReference) -> Result<Option<String>>;

    async fn copy(&self, source: &ImageReference, target: &ImageReference) -> Result<()>;
}

/// Ordered composition of remappers.
pub struct MultiRemapper {
    remappers: Vec<Box<dyn Remapper>>,
}

impl MultiRemapper {
    pub fn new(remappers: Vec<Box<dyn Remapper>>) -> Self {
        Self { remappers }
    }
}

#[async_trait]
impl Remapper for MultiRemapper {
    fn name(&self) -> &'static str {
        "multi"
    }

    async fn re_map(&self, history: &mut History) -> Result<()> {
        for remapper in &self.remappers {
            remapper.re_map(history).await?;
        }
        Ok(())
    }
}

/// Emits [`Error::Skip`] for sources matching the configured expression.
pub struct IgnoreRemapper {
    pattern: Regex,
}

impl IgnoreRemapper {
    pub fn new(pattern: Regex) -> Self {
        Self { pattern }
    }
}

#[async_trait]
impl Remapper for IgnoreRemapper {
    fn name(&self) -> &'static str {
        "ignore"
    }

    async fn re_map(&self, history: &mut History) -> Result<()> {
        let original = history.original().to_string();
        if self.pattern.is_match(&original) {
            tracing::debug!(image = %original, "image matches ignore expression");
            return Err(Error::Skip);
        }
        Ok(())
    }
}

/// Replays a preloaded source → target table.
pub struct StaticRemapper {
    targets: HashMap<String, ImageReference>,
    mappings_only: bool,
}

impl StaticRemapper {
    /// Pre-parses every target; all targets must be digest-pinnable.
    pub fn new(mapping: &Mapping, mappings_only: bool) -> Result<Self> {
        let mut targets = HashMap::new();
        for (source, image) in mapping {
            targets.insert(source.clone(), image.target()?);
        }
        Ok(Self {
            targets,
            mappings_only,
        })
    }
}

#[async_trait]
impl Remapper for StaticRemapper {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn re_map(&self, history: &mut History) -> Result<()> {
        let original = history.original().to_string();
        match self.targets.get(&original) {
            Some(target) => {
                history.push(self.name(), target.clone());
                Ok(())
            }
            None if self.mappings_only => Err(Error::NoMapping(original)),
            None => Ok(()),
        }
    }
}

/// Resolves the digest and renames into the remote path layout.
///
/// With no remote configured, or for sources matching `ignore`, the name is
/// kept but the reference is still digest-pinned.
pub struct RenameRemapper {
    ignore: Regex,
    remote: Option<(String, RenameTemplate)>,
    resolver: Arc<dyn DigestResolver>,
}

impl RenameRemapper {
    pub fn new(
        ignore: Regex,
        remote: Option<(String, RenameTemplate)>,
        resolver: Arc<dyn DigestResolver>,
    ) -> Self {
        Self {
            ignore,
            remote,
            resolver,
        }
    }
}

#[async_trait]
impl Remapper for RenameRemapper {
    fn name(&self) -> &'static str {
        "rename"
    }

    async fn re_map(&self, history: &mut History) -> Result<()> {
        let current = history.latest().clone();
        let digest = match &current.digest {
            Some(d) => d.clone(),
            None => self.resolver.resolve(&current).await?,
        };

        let original = history.original().to_string();
        let Some((remote_path, template)) = &self.remote else {
            history.push(self.name(), current.with_digest(&digest)?);
            return Ok(());
        };

        // Already under the remote path: renaming again would nest the
        // mirror prefix and break idempotence.
        let already_relocated = current.name() == *remote_path
            || current.name().starts_with(&format!("{remote_path}/"));
        if self.ignore.is_match(&original) || already_relocated {
            history.push(self.name(), current.with_digest(&digest)?);
            return Ok(());
        }
        let assembled = format!("{}/{}", remote_path, template.expand(&current, &digest));
        let mut target = ImageReference::parse(&assembled)?;
        target.tag = current.canonical_tag();
        target.digest = Some(digest);

        tracing::debug!(from = %original, to = %target, "renamed image");
        history.push(self.name(), target);
        Ok(())
    }
}

/// Commits `original → QualifiedImage` into the shared mapping at the end of
/// the chain.
pub struct RecorderRemapper {
    mappings: Arc<Mutex<Mapping>>,
}

impl RecorderRemapper {
    pub fn new() -> Self {
        Self {
            mappings: Arc::new(Mutex::new(Mapping::new())),
        }
    }

    /// Shared handle to the accumulated mapping.
    pub fn mappings(&self) -> Arc<Mutex<Mapping>> {
        Arc::clone(&self.mappings)
    }
}

impl Default for RecorderRemapper {
    fn default() -> Self {
        Self::new()
    }
}

/// The target as recorded in the mapping: name and tag, no digest.
fn tagged_name(reference: &ImageReference) -> String {
    match reference.canonical_tag() {
        Some(tag) => format!("{}:{}", reference.name(), tag),
        None => reference.name(),
    }
}

#[async_trait]
impl Remapper for RecorderRemapper {
    fn name(&self) -> &'static str {
        "recorder"
    }

    async fn re_map(&self, history: &mut History) -> Result<()> {
        if history.entries().len() == 1 {
            // No remapper claimed the image (e.g. a static-mapping miss);
            // it passes through unchanged and is not recorded.
            tracing::debug!(image = %history.original(), "unclaimed image, not recording");
            return Ok(());
        }
        let original = history.original().to_string();
        let latest = history.latest();
        let Some(digest) = latest.digest.clone() else {
            return Err(Error::InvalidReference {
                reference: latest.to_string(),
                message: "recorded reference is not digest-pinned".to_string(),
            });
        };
        let incoming = QualifiedImage {
            tag: tagged_name(latest),
            digest,
            found_cves: vec![],
            ignored_cves: vec![],
        };

        let mut mappings = self.mappings.lock().await;
        match mappings.get(&original) {
            None => {
                mappings.insert(original, incoming);
                Ok(())
            }
            Some(existing) if existing.tag == incoming.tag && existing.digest == incoming.digest => {
                Ok(())
            }
            Some(existing) => Err(Error::MappingConflict {
                reference: original.clone(),
                existing: format!("{}@{}", existing.tag, existing.digest),
                incoming: format!("{}@{}", incoming.tag, incoming.digest),
            }),
        }
    }
}

/// Retry budget for one copy.
const COPY_ATTEMPTS: u32 = 4;

/// Copies the source image to the renamed target when it is missing.
pub struct EnsureRemapper {
    copier: Arc<dyn ImageCopier>,
    no_clobber: bool,
    dry_run: bool,
    completed: Mutex<HashSet<String>>,
}

impl EnsureRemapper {
    pub fn new(copier: Arc<dyn ImageCopier>, no_clobber: bool, dry_run: bool) -> Self {
        Self {
            copier,
            no_clobber,
            dry_run,
            completed: Mutex::new(HashSet::new()),
        }
    }

    async fn copy_with_retry(
        &self,
        source: &ImageReference,
        target: &ImageReference,
    ) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.copier.copy(source, target).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt + 1 < COPY_ATTEMPTS => {
                    let delay = backoff_delay(attempt);
                    tracing::warn!(
                        source = %source,
                        target = %target,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "copy failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    return Err(Error::Copy {
                        source_ref: source.to_string(),
                        target_ref: target.to_string(),
                        message: err.to_string(),
                    })
                }
            }
        }
    }
}

#[async_trait]
impl Remapper for EnsureRemapper {
    fn name(&self) -> &'static str {
        "ensure"
    }

    async fn re_map(&self, history: &mut History) -> Result<()> {
        let target = history.latest().clone();
        let Some(digest) = target.digest.clone() else {
            return Ok(());
        };
        if target.repo() == history.original().repo() {
            return Ok(());
        }

        // One copy per target per run, even when several sources map to it.
        let key = target.to_string();
        {
            let mut completed = self.completed.lock().await;
            if !completed.insert(key) {
                return Ok(());
            }
        }

        let source = history.original().with_digest(&digest)?;

        if self.dry_run {
            tracing::info!(source = %source, target = %target, "dry-run, would copy image");
            return Ok(());
        }

        if self.no_clobber {
            match self.copier.head(&target).await? {
                Some(existing) if existing == digest => {
                    tracing::debug!(target = %target, "target already present");
                    return Ok(());
                }
                Some(existing) => {
                    return Err(Error::Copy {
                        source_ref: source.to_string(),
                        target_ref: target.to_string(),
                        message: format!(
                            "target exists with different digest {existing}, expected {digest}"
                        ),
                    });
                }
                None => {}
            }
        }

        tracing::info!(source = %source, target = %target, "copying image");
        self.copy_with_retry(&source, &target).await
    }
}
