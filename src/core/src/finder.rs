//! Locates image-bearing fields in decoded manifest documents.
//!
//! The finder matches a document's `kind`/`apiVersion` against the compiled
//! rules and walks every listed path, producing hits with a concrete cursor
//! so the caller can write the rewritten value back in place.

use serde_yaml::Value;

use crate::rules::{CompiledRules, JsonPath, PathStep};

/// How the value at a hit is to be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitKind {
    /// The scalar is an image reference
    Image,
    /// The scalar is templated text containing image references
    Template,
}

/// One concrete step of a cursor (wildcards resolved).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorStep {
    Key(String),
    Index(usize),
}

/// A concrete location in a document, printable for error messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor(Vec<CursorStep>);

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "$")?;
        for step in &self.0 {
            match step {
                CursorStep::Key(k) => write!(f, ".{k}")?,
                CursorStep::Index(i) => write!(f, "[{i}]")?,
            }
        }
        Ok(())
    }
}

/// A string field the rules identified as image-bearing.
#[derive(Debug, Clone)]
pub struct ImageHit {
    pub cursor: Cursor,
    pub value: String,
    pub kind: HitKind,
}

/// Extracts image references from templated text. Must be pure.
pub type TemplateExtractor = fn(&str) -> Vec<String>;

/// Default extractor: `image:` scalars in embedded YAML-ish text, such as
/// Helm values or nested manifests carried in ConfigMap data.
pub fn extract_image_scalars(text: &str) -> Vec<String> {
    let mut found = Vec::new();
    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if key.trim_start().trim_start_matches("- ") != "image" {
            continue;
        }
        let value = value.trim().trim_matches('"').trim_matches('\'');
        if value.is_empty() {
            continue;
        }
        if !found.iter().any(|v| v == value) {
            found.push(value.to_string());
        }
    }
    found
}

/// Rule-driven image field finder.
#[derive(Debug)]
pub struct ImageFinder {
    rules: CompiledRules,
}

impl ImageFinder {
    pub fn new(rules: CompiledRules) -> Self {
        Self { rules }
    }

    /// All image-bearing fields of one decoded document.
    ///
    /// Paths landing on non-string leaves are logged and skipped; they never
    /// abort the document.
    pub fn find(&self, doc: &Value) -> Vec<ImageHit> {
        let kind = top_level_str(doc, "kind");
        let api_version = top_level_str(doc, "apiVersion");

        let mut hits = Vec::new();
        for rule in self.rules.matching(kind, api_version) {
            for path in &rule.image_paths {
                collect_hits(doc, path, HitKind::Image, &mut hits);
            }
            for path in &rule.template_paths {
                collect_hits(doc, path, HitKind::Template, &mut hits);
            }
        }
        hits
    }
}

fn top_level_str<'a>(doc: &'a Value, key: &str) -> &'a str {
    doc.get(key).and_then(Value::as_str).unwrap_or("")
}

fn collect_hits(doc: &Value, path: &JsonPath, kind: HitKind, hits: &mut Vec<ImageHit>) {
    walk(doc, path, path.steps(), Vec::new(), kind, hits);
}

fn walk(
    node: &Value,
    path: &JsonPath,
    remaining: &[PathStep],
    trail: Vec<CursorStep>,
    kind: HitKind,
    hits: &mut Vec<ImageHit>,
) {
    let Some((step, rest)) = remaining.split_first() else {
        match node.as_str() {
            Some(s) => hits.push(ImageHit {
                cursor: Cursor(trail),
                value: s.to_string(),
                kind,
            }),
            None => tracing::warn!(
                path = %path,
                cursor = %Cursor(trail),
                "path does not end in a string, skipping"
            ),
        }
        return;
    };

    match step {
        PathStep::Key(key) => {
            if let Some(child) = node.get(key.as_str()) {
                let mut trail = trail;
                trail.push(CursorStep::Key(key.clone()));
                walk(child, path, rest, trail, kind, hits);
            }
        }
        PathStep::Index(idx) => {
            if let Some(child) = node.as_sequence().and_then(|s| s.get(*idx)) {
                let mut trail = trail;
                trail.push(CursorStep::Index(*idx));
                walk(child, path, rest, trail, kind, hits);
            }
        }
        PathStep::Wildcard => match node {
            Value::Sequence(seq) => {
                for (i, child) in seq.iter().enumerate() {
                    let mut trail = trail.clone();
                    trail.push(CursorStep::Index(i));
                    walk(child, path, rest, trail, kind, hits);
                }
            }
            Value::Mapping(map) => {
                for (key, child) in map {
                    let Some(key) = key.as_str() else { continue };
                    let mut trail = trail.clone();
                    trail.push(CursorStep::Key(key.to_string()));
                    walk(child, path, rest, trail, kind, hits);
                }
            }
            _ => {}
        },
    }
}

/// Overwrite the string at `cursor` with `value`.
///
/// Returns false when the cursor no longer resolves, which only happens if
/// the document was mutated between find and set.
pub fn set_at(doc: &mut Value, cursor: &Cursor, value: String) -> bool {
    let mut node = doc;
    for step in &cursor.0 {
        let next = match step {
            CursorStep::Key(k) => node.get_mut(k.as_str()),
            CursorStep::Index(i) => node.as_sequence_mut().and_then(|s| s.get_mut(*i)),
        };
        match next {
            Some(n) => node = n,
            None => return false,
        }
    }
    *node = Value::String(value);
    true
}
