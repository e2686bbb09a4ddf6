//! Drives the finder and the remapper chain over a YAML document stream.
//!
//! Documents are rewritten in input order. A document the rules leave
//! untouched passes through byte-identical; a modified document is
//! re-serialized deterministically. Results are memoized per source string
//! for the whole run, so a source seen twice is remapped once.

use std::collections::HashMap;

use serde_yaml::Value;

use crate::error::{Error, Result};
use crate::finder::{extract_image_scalars, set_at, HitKind, ImageFinder, TemplateExtractor};
use crate::history::History;
use crate::reference::ImageReference;
use crate::remap::Remapper;

/// Stream transformer: split, find, remap, write back.
pub struct RemapUpdater {
    finder: ImageFinder,
    remapper: Box<dyn Remapper>,
    extractor: TemplateExtractor,
    force_digests: bool,
    memo: HashMap<String, Option<String>>,
}

impl RemapUpdater {
    pub fn new(finder: ImageFinder, remapper: Box<dyn Remapper>, force_digests: bool) -> Self {
        Self {
            finder,
            remapper,
            extractor: extract_image_scalars,
            force_digests,
            memo: HashMap::new(),
        }
    }

    /// Replace the template extractor.
    pub fn with_extractor(mut self, extractor: TemplateExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    /// Transform a whole document stream, preserving document order and
    /// `---` separators.
    pub async fn process(&mut self, input: &str) -> Result<String> {
        let mut documents = split_documents(input);
        for (index, document) in documents.iter_mut().enumerate() {
            if let Some(updated) = self.process_document(index, document).await? {
                *document = updated;
            }
        }
        Ok(documents.join("---\n"))
    }

    /// Returns the rewritten document, or None when nothing changed.
    async fn process_document(&mut self, index: usize, raw: &str) -> Result<Option<String>> {
        if raw.trim().is_empty() {
            return Ok(None);
        }
        let mut doc: Value = serde_yaml::from_str(raw)
            .map_err(|e| Error::Serialization(format!("document {index}: {e}")))?;
        if doc.is_null() {
            return Ok(None);
        }

        let mut changed = false;
        for hit in self.finder.find(&doc) {
            let updated = match hit.kind {
                HitKind::Image => self.remap_one(&hit.value).await.map_err(|e| {
                    tracing::error!(cursor = %hit.cursor, image = %hit.value, error = %e, "remap failed");
                    e
                })?,
                HitKind::Template => self.remap_template(&hit.value).await?,
            };
            if let Some(updated) = updated {
                if updated != hit.value {
                    if !set_at(&mut doc, &hit.cursor, updated) {
                        return Err(Error::Serialization(format!(
                            "document {index}: cursor {} no longer resolves",
                            hit.cursor
                        )));
                    }
                    changed = true;
                }
            }
        }

        if !changed {
            return Ok(None);
        }
        Ok(Some(serde_yaml::to_string(&doc)?))
    }

    /// Rewrite every image reference the extractor finds in templated text.
    async fn remap_template(&mut self, text: &str) -> Result<Option<String>> {
        let mut sources = (self.extractor)(text);
        // Longest first, so a reference that prefixes another is not clobbered.
        sources.sort_by_key(|s| std::cmp::Reverse(s.len()));

        let mut updated = text.to_string();
        for source in sources {
            if let Some(replacement) = self.remap_one(&source).await? {
                updated = updated.replace(&source, &replacement);
            }
        }
        Ok(if updated == text { None } else { Some(updated) })
    }

    /// Run one source through the chain, memoized for the run. None means the
    /// source was ignored and must stay as-is.
    async fn remap_one(&mut self, source: &str) -> Result<Option<String>> {
        if let Some(result) = self.memo.get(source) {
            return Ok(result.clone());
        }

        let reference = ImageReference::parse(source)?;
        let mut history = History::new(reference);
        let result = match self.remapper.re_map(&mut history).await {
            // A chain that never touched the history leaves the image as-is
            // (a static-mapping miss outside mappings-only mode).
            Ok(()) if history.entries().len() == 1 => None,
            Ok(()) => Some(format_output(history.latest(), self.force_digests)?),
            Err(Error::Skip) => None,
            Err(e) => return Err(e),
        };

        self.memo.insert(source.to_string(), result.clone());
        Ok(result)
    }
}

/// The written form: `name:tag@digest`, or `name@digest` when digests are
/// forced.
fn format_output(reference: &ImageReference, force_digests: bool) -> Result<String> {
    let Some(ref digest) = reference.digest else {
        return Err(Error::InvalidReference {
            reference: reference.to_string(),
            message: "chain output is not digest-pinned".to_string(),
        });
    };
    if force_digests {
        Ok(format!("{}@{}", reference.name(), digest))
    } else {
        Ok(reference.to_string())
    }
}

/// Split a stream on `---` separator lines. Chunks re-join with `---\n` to
/// reproduce the stream.
fn split_documents(input: &str) -> Vec<String> {
    let mut documents = vec![String::new()];
    for line in input.split_inclusive('\n') {
        if line.trim_end() == "---" {
            documents.push(String::new());
        } else {
            documents
                .last_mut()
                .expect("at least one document")
                .push_str(line);
        }
    }
    documents
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::Mapping;
    use crate::remap::{
        DigestResolver, IgnoreRemapper, MultiRemapper, RecorderRemapper, RenameRemapper,
    };
    use crate::rules::{default_rules, CompiledRules};
    use crate::template::RenameTemplate;
    use async_trait::async_trait;
    use regex::Regex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::Mutex;

    const DIGEST: &str =
        "sha256:eeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee";

    struct FakeResolver {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DigestResolver for FakeResolver {
        async fn resolve(&self, _reference: &ImageReference) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(DIGEST.to_string())
        }
    }

    fn finder() -> ImageFinder {
        ImageFinder::new(CompiledRules::compile(&default_rules()).unwrap())
    }

    struct Setup {
        updater: RemapUpdater,
        mappings: Arc<Mutex<Mapping>>,
        resolver: Arc<FakeResolver>,
    }

    fn setup(ignore: Option<&str>, remote_path: Option<&str>, force_digests: bool) -> Setup {
        let resolver = Arc::new(FakeResolver {
            calls: AtomicUsize::new(0),
        });
        let recorder = RecorderRemapper::new();
        let mappings = recorder.mappings();

        let mut chain: Vec<Box<dyn Remapper>> = Vec::new();
        if let Some(pattern) = ignore {
            chain.push(Box::new(IgnoreRemapper::new(Regex::new(pattern).unwrap())));
        }
        let remote = remote_path.map(|p| {
            (
                p.to_string(),
                RenameTemplate::parse("{{.Repository}}").unwrap(),
            )
        });
        chain.push(Box::new(RenameRemapper::new(
            Regex::new("^$").unwrap(),
            remote,
            resolver.clone(),
        )));
        chain.push(Box::new(recorder));

        Setup {
            updater: RemapUpdater::new(
                finder(),
                Box::new(MultiRemapper::new(chain)),
                force_digests,
            ),
            mappings,
            resolver,
        }
    }

    const POD: &str = "apiVersion: v1\nkind: Pod\nmetadata:\n  name: web\nspec:\n  containers:\n  - name: web\n    image: nginx:1.25\n";

    #[tokio::test]
    async fn test_rename_rewrites_pod_image() {
        let mut s = setup(None, Some("registry.example.com/mirror"), false);
        let out = s.updater.process(POD).await.unwrap();
        assert!(out.contains(&format!(
            "image: registry.example.com/mirror/library/nginx:1.25@{DIGEST}"
        )));
        let mappings = s.mappings.lock().await;
        let entry = mappings.get("nginx:1.25").unwrap();
        assert_eq!(entry.tag, "registry.example.com/mirror/library/nginx:1.25");
        assert_eq!(entry.digest, DIGEST);
    }

    #[tokio::test]
    async fn test_ignored_image_passes_through() {
        let input = POD.replace("nginx:1.25", "internal.example/app:v1");
        let mut s = setup(
            Some(r"^internal\.example/"),
            Some("registry.example.com/mirror"),
            false,
        );
        let out = s.updater.process(&input).await.unwrap();
        assert_eq!(out, input);
        assert!(s.mappings.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_untouched_documents_round_trip_exactly() {
        let input = "# leading comment\n---\napiVersion: v1\nkind: Service\nspec:\n  ports: []\n---\nkind: Namespace\napiVersion: v1\n";
        let mut s = setup(None, Some("registry.example.com/mirror"), false);
        let out = s.updater.process(input).await.unwrap();
        assert_eq!(out, input);
    }

    #[tokio::test]
    async fn test_document_order_preserved() {
        let second = POD.replace("nginx:1.25", "envoy:v1.29").replace("web", "proxy");
        let input = format!("{POD}---\n{second}");
        let mut s = setup(None, Some("registry.example.com/mirror"), false);
        let out = s.updater.process(&input).await.unwrap();
        let nginx_at = out.find("mirror/library/nginx").unwrap();
        let envoy_at = out.find("mirror/library/envoy").unwrap();
        assert!(nginx_at < envoy_at);
        let keys: Vec<String> = s.mappings.lock().await.keys().cloned().collect();
        assert_eq!(keys, ["nginx:1.25", "envoy:v1.29"]);
    }

    #[tokio::test]
    async fn test_repeated_source_resolved_once() {
        let doc = "apiVersion: v1\nkind: Pod\nspec:\n  containers:\n  - name: a\n    image: nginx:1.25\n  - name: b\n    image: nginx:1.25\n";
        let mut s = setup(None, Some("registry.example.com/mirror"), false);
        let out = s.updater.process(doc).await.unwrap();
        assert_eq!(s.resolver.calls.load(Ordering::SeqCst), 1);
        assert_eq!(out.matches(DIGEST).count(), 2);
    }

    #[tokio::test]
    async fn test_force_digests_drops_tag() {
        let mut s = setup(None, Some("registry.example.com/mirror"), true);
        let out = s.updater.process(POD).await.unwrap();
        assert!(out.contains(&format!(
            "image: registry.example.com/mirror/library/nginx@{DIGEST}"
        )));
        assert!(!out.contains("library/nginx:1.25@"));
    }

    #[tokio::test]
    async fn test_every_rewritten_image_is_digest_pinned() {
        let mut s = setup(None, None, false);
        let out = s.updater.process(POD).await.unwrap();
        assert!(out.contains(&format!("image: nginx:1.25@{DIGEST}")));
    }

    #[tokio::test]
    async fn test_template_scalar_rewritten() {
        let input = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: values\ndata:\n  values.yaml: |\n    replicas: 2\n    image: quay.io/org/tool:v3\n";
        let mut s = setup(None, Some("registry.example.com/mirror"), false);
        let out = s.updater.process(input).await.unwrap();
        assert!(out.contains(&format!(
            "image: registry.example.com/mirror/org/tool:v3@{DIGEST}"
        )));
        assert!(s.mappings.lock().await.contains_key("quay.io/org/tool:v3"));
    }

    #[tokio::test]
    async fn test_static_miss_passes_through_unrecorded() {
        use crate::remap::StaticRemapper;

        let mut static_map = Mapping::new();
        static_map.insert(
            "nginx:1.25".to_string(),
            crate::mapping::QualifiedImage {
                tag: "mirror.example.com/nginx:1.25".to_string(),
                digest: DIGEST.to_string(),
                ..Default::default()
            },
        );
        let recorder = RecorderRemapper::new();
        let mappings = recorder.mappings();
        let chain: Vec<Box<dyn Remapper>> = vec![
            Box::new(StaticRemapper::new(&static_map, false).unwrap()),
            Box::new(recorder),
        ];
        let mut updater =
            RemapUpdater::new(finder(), Box::new(MultiRemapper::new(chain)), false);

        let second = POD.replace("nginx:1.25", "envoy:v1.29").replace("web", "proxy");
        let input = format!("{POD}---\n{second}");
        let out = updater.process(&input).await.unwrap();

        // The mapped image is rewritten, the unmapped one is untouched and
        // stays out of the mapping.
        assert!(out.contains(&format!("image: mirror.example.com/nginx:1.25@{DIGEST}")));
        assert!(out.contains("image: envoy:v1.29\n"));
        let mappings = mappings.lock().await;
        assert_eq!(mappings.len(), 1);
        assert!(mappings.contains_key("nginx:1.25"));
    }

    #[tokio::test]
    async fn test_second_pass_is_idempotent() {
        let mut s = setup(None, Some("registry.example.com/mirror"), false);
        let first = s.updater.process(POD).await.unwrap();

        let mut again = setup(None, Some("registry.example.com/mirror"), false);
        let second = again.updater.process(&first).await.unwrap();
        assert_eq!(second, first);
    }

    #[test]
    fn test_split_documents_round_trip() {
        for input in [
            "a: 1\n",
            "---\na: 1\n",
            "a: 1\n---\nb: 2\n",
            "a: 1\n---\nb: 2\n---\n",
            "# comment\n---\na: 1\n",
        ] {
            assert_eq!(split_documents(input).join("---\n"), input);
        }
    }
}
