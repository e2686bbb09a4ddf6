//! Declarative rules locating image fields in manifest documents.
//!
//! A rule matches documents by `kind`/`apiVersion` regex and lists the JSON
//! paths at which image references (or templated text containing image
//! references) live. Rules are compiled once at startup and fail fast on bad
//! regexes or path syntax.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One rule as it appears in the YAML rules file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Regex matched against the document's top-level `kind`
    #[serde(default)]
    pub kind: String,
    /// Regex matched against the document's top-level `apiVersion`
    #[serde(rename = "apiVersion", default)]
    pub api_version: String,
    /// Paths whose scalar values are image references
    #[serde(rename = "imageJSONPaths", default)]
    pub image_json_paths: Vec<String>,
    /// Paths whose scalar values are templated text containing image references
    #[serde(rename = "templateImageJSONPaths", default)]
    pub template_image_json_paths: Vec<String>,
}

/// One step of a JSON path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathStep {
    /// Object key
    Key(String),
    /// Sequence index
    Index(usize),
    /// Every element of a sequence, or every value of a mapping
    Wildcard,
}

/// A compiled `$.key.key[sel]` path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPath {
    source: String,
    steps: Vec<PathStep>,
}

impl JsonPath {
    /// Parse a path like `$.spec.template.spec.containers[*].image`.
    ///
    /// Selectors are a decimal index or `*`; a leading `$` is optional.
    pub fn parse(path: &str) -> Result<Self> {
        let mut rest = path.strip_prefix('$').unwrap_or(path);
        let mut steps = Vec::new();

        while !rest.is_empty() {
            if let Some(tail) = rest.strip_prefix('.') {
                let end = tail
                    .find(|c| c == '.' || c == '[')
                    .unwrap_or(tail.len());
                let key = &tail[..end];
                if key.is_empty() {
                    return Err(Error::BadRule(format!("empty key in path '{path}'")));
                }
                if key == "*" {
                    steps.push(PathStep::Wildcard);
                } else {
                    steps.push(PathStep::Key(key.to_string()));
                }
                rest = &tail[end..];
            } else if let Some(tail) = rest.strip_prefix('[') {
                let end = tail
                    .find(']')
                    .ok_or_else(|| Error::BadRule(format!("unclosed '[' in path '{path}'")))?;
                let sel = &tail[..end];
                if sel == "*" {
                    steps.push(PathStep::Wildcard);
                } else {
                    let idx: usize = sel.parse().map_err(|_| {
                        Error::BadRule(format!("bad selector '[{sel}]' in path '{path}'"))
                    })?;
                    steps.push(PathStep::Index(idx));
                }
                rest = &tail[end + 1..];
            } else {
                return Err(Error::BadRule(format!(
                    "unexpected '{rest}' in path '{path}'"
                )));
            }
        }

        if steps.is_empty() {
            return Err(Error::BadRule(format!("empty path '{path}'")));
        }

        Ok(JsonPath {
            source: path.to_string(),
            steps,
        })
    }

    pub fn steps(&self) -> &[PathStep] {
        &self.steps
    }
}

impl std::fmt::Display for JsonPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

/// A rule with its regexes and paths compiled.
#[derive(Debug)]
pub struct CompiledRule {
    pub kind: Regex,
    pub api_version: Regex,
    pub image_paths: Vec<JsonPath>,
    pub template_paths: Vec<JsonPath>,
}

impl CompiledRule {
    fn compile(config: &RuleConfig) -> Result<Self> {
        let kind = Regex::new(&config.kind)
            .map_err(|e| Error::BadRule(format!("bad kind regex '{}': {e}", config.kind)))?;
        let api_version = Regex::new(&config.api_version).map_err(|e| {
            Error::BadRule(format!(
                "bad apiVersion regex '{}': {e}",
                config.api_version
            ))
        })?;
        let image_paths = config
            .image_json_paths
            .iter()
            .map(|p| JsonPath::parse(p))
            .collect::<Result<Vec<_>>>()?;
        let template_paths = config
            .template_image_json_paths
            .iter()
            .map(|p| JsonPath::parse(p))
            .collect::<Result<Vec<_>>>()?;
        Ok(CompiledRule {
            kind,
            api_version,
            image_paths,
            template_paths,
        })
    }

    /// Does this rule apply to a document with the given kind/apiVersion?
    pub fn matches(&self, kind: &str, api_version: &str) -> bool {
        self.kind.is_match(kind) && self.api_version.is_match(api_version)
    }
}

/// The full compiled rule set.
#[derive(Debug)]
pub struct CompiledRules {
    rules: Vec<CompiledRule>,
}

impl CompiledRules {
    /// Compile a rule list, failing fast on the first invalid rule.
    pub fn compile(configs: &[RuleConfig]) -> Result<Self> {
        let rules = configs
            .iter()
            .map(CompiledRule::compile)
            .collect::<Result<Vec<_>>>()?;
        Ok(CompiledRules { rules })
    }

    /// Rules applying to a document with the given kind/apiVersion.
    pub fn matching<'a>(
        &'a self,
        kind: &'a str,
        api_version: &'a str,
    ) -> impl Iterator<Item = &'a CompiledRule> + 'a {
        self.rules
            .iter()
            .filter(move |r| r.matches(kind, api_version))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Built-in rules for the common Kubernetes workload kinds, plus ConfigMap
/// data scanned for embedded `image:` scalars. Always appended after any
/// user-supplied rules.
pub fn default_rules() -> Vec<RuleConfig> {
    let workload =
        |kind: &str, api_version: &str, prefix: &str| RuleConfig {
            kind: kind.to_string(),
            api_version: api_version.to_string(),
            image_json_paths: vec![
                format!("$.{prefix}.containers[*].image"),
                format!("$.{prefix}.initContainers[*].image"),
            ],
            template_image_json_paths: vec![],
        };

    vec![
        workload("^Pod$", "^v1$", "spec"),
        workload("^(Deployment|StatefulSet|DaemonSet|ReplicaSet)$", "^apps/v1$", "spec.template.spec"),
        workload("^Job$", "^batch/v1$", "spec.template.spec"),
        workload("^CronJob$", "^batch/v1", "spec.jobTemplate.spec.template.spec"),
        RuleConfig {
            kind: "^ConfigMap$".to_string(),
            api_version: "^v1$".to_string(),
            image_json_paths: vec![],
            template_image_json_paths: vec!["$.data[*]".to_string()],
        },
    ]
}
