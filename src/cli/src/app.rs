//! The orchestrated run: load mappings, build the chain, transform the
//! stream, then scan, persist and attest.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use regex::Regex;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use repin_core::error::{aggregate, Error as CoreError};
use repin_core::finder::ImageFinder;
use repin_core::history::History;
use repin_core::mapping::{parse_mapping, serialize_mapping, verify_mapping, Mapping};
use repin_core::policy::CvePolicy;
use repin_core::reference::ImageReference;
use repin_core::remap::{
    EnsureRemapper, IgnoreRemapper, MultiRemapper, RecorderRemapper, Remapper, RenameRemapper,
    StaticRemapper,
};
use repin_core::rules::{default_rules, CompiledRules, RuleConfig};
use repin_core::template::{RenameTemplate, DEFAULT_RENAME_TEMPLATE};
use repin_core::updater::RemapUpdater;
use repin_remote::attest::{Attester, Keyer};
use repin_remote::grafeas::{GrafeasVulnGetter, RestOccurrenceStore};
use repin_remote::kms::KmsKeyer;
use repin_remote::registry::{RegistryAuth, RegistryClient};
use repin_remote::scan::{VulnChecker, VulnGetter};
use repin_remote::trivy::TrivyVulnGetter;

use crate::args::{Cli, InputKind, VulncheckMethod};

/// A configured run.
pub struct App {
    args: Cli,
    ignore: Option<Regex>,
    rename_ignore: Regex,
    vuln_ignore_images: Option<Regex>,
    remote: Option<(String, RenameTemplate)>,
    finder: ImageFinder,
    registry: Arc<RegistryClient>,
}

impl App {
    /// Validate flags and compile everything that must fail fast: regexes,
    /// the rename template, and the finder rules.
    pub fn new(args: Cli) -> Result<Self> {
        let ignore = args
            .ignore
            .as_deref()
            .map(Regex::new)
            .transpose()
            .context("bad --ignore expression")?;
        let rename_ignore =
            Regex::new(&args.rename_ignore).context("bad --rename-ignore expression")?;
        let vuln_ignore_images = args
            .vulncheck_ignore_images
            .as_deref()
            .map(Regex::new)
            .transpose()
            .context("bad --vulncheck-ignore-images expression")?;

        if args.static_json_mappings_file.is_some() && args.static_json_mappings_img.is_some() {
            bail!("only one static mappings source is allowed");
        }

        // A static mapping source replaces renaming wholesale.
        let has_static = args.static_json_mappings_file.is_some()
            || args.static_json_mappings_img.is_some();
        let mut remote_path = args.rename_remote_path.clone();
        if has_static
            && (remote_path.is_some() || args.rename_template != DEFAULT_RENAME_TEMPLATE)
        {
            tracing::info!("static mappings disable image renaming");
            remote_path = None;
        }
        let remote = remote_path
            .map(|path| Ok::<_, CoreError>((path, RenameTemplate::parse(&args.rename_template)?)))
            .transpose()?;

        let finder = build_finder(&args)?;
        let registry = Arc::new(RegistryClient::with_auth(RegistryAuth::from_env()));

        Ok(Self {
            args,
            ignore,
            rename_ignore,
            vuln_ignore_images,
            remote,
            finder,
            registry,
        })
    }

    /// Execute all phases. Non-cancellation errors are accumulated so every
    /// image gets its say; the combined error decides the exit code.
    pub async fn run(self) -> Result<()> {
        let static_mapping = self.load_static_mapping().await?;
        let (chain, mappings) = self.build_chain(static_mapping.as_ref())?;

        let mut run_errors: Vec<CoreError> = Vec::new();
        if self.args.mappings_only {
            let Some(ref static_mapping) = static_mapping else {
                bail!("--mappings-only requires a static mappings source");
            };
            run_errors.extend(self.run_mappings_only(&chain, static_mapping).await);
        } else {
            let mut input = String::new();
            tokio::io::stdin()
                .read_to_string(&mut input)
                .await
                .context("reading stdin")?;
            let mut updater =
                RemapUpdater::new(self.finder, Box::new(chain), self.args.rename_force_digest);
            let output = updater.process(&input).await.context("processing input")?;
            use std::io::Write;
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(output.as_bytes()).context("writing stdout")?;
            stdout.flush().context("flushing stdout")?;

            return finish(
                run_errors,
                &self.args,
                &self.registry,
                mappings,
                self.vuln_ignore_images,
            )
            .await;
        }

        finish(
            run_errors,
            &self.args,
            &self.registry,
            mappings,
            self.vuln_ignore_images,
        )
        .await
    }

    /// Drive the chain over the preloaded mapping keys; no stream I/O.
    /// Iteration order is the mapping's insertion order, but nothing may
    /// depend on it.
    async fn run_mappings_only(
        &self,
        chain: &MultiRemapper,
        static_mapping: &Mapping,
    ) -> Vec<CoreError> {
        let mut errors = Vec::new();
        for source in static_mapping.keys() {
            let reference = match ImageReference::parse(source) {
                Ok(r) => r,
                Err(e) => {
                    errors.push(e);
                    continue;
                }
            };
            let mut history = History::new(reference);
            match chain.re_map(&mut history).await {
                Ok(()) | Err(CoreError::Skip) => {}
                Err(e) => errors.push(e),
            }
        }
        errors
    }

    /// The fixed chain order: ignore → static | rename → record → ensure.
    fn build_chain(
        &self,
        static_mapping: Option<&Mapping>,
    ) -> Result<(MultiRemapper, Arc<Mutex<Mapping>>)> {
        let mut chain: Vec<Box<dyn Remapper>> = Vec::new();

        if let Some(ref pattern) = self.ignore {
            chain.push(Box::new(IgnoreRemapper::new(pattern.clone())));
        }

        let copy_enabled = match static_mapping {
            Some(mapping) => {
                chain.push(Box::new(StaticRemapper::new(
                    mapping,
                    self.args.mappings_only,
                )?));
                true
            }
            None => {
                chain.push(Box::new(RenameRemapper::new(
                    self.rename_ignore.clone(),
                    self.remote.clone(),
                    self.registry.clone(),
                )));
                self.remote.is_some()
            }
        };

        let recorder = RecorderRemapper::new();
        let mappings = recorder.mappings();
        chain.push(Box::new(recorder));

        if !copy_enabled {
            tracing::info!("copying disabled (remote path and template must be set)");
        } else if !self.args.no_copy {
            chain.push(Box::new(EnsureRemapper::new(
                self.registry.clone(),
                !self.args.clobber,
                self.args.dryrun,
            )));
        }

        Ok((MultiRemapper::new(chain), mappings))
    }

    /// Read the static mapping (file or registry artifact) and, when
    /// configured, verify every target digest against the registry.
    async fn load_static_mapping(&self) -> Result<Option<Mapping>> {
        let bytes = match (
            &self.args.static_json_mappings_file,
            &self.args.static_json_mappings_img,
        ) {
            (Some(path), _) => std::fs::read(path)
                .with_context(|| format!("reading mappings file {}", path.display()))?,
            (None, Some(image)) => {
                let reference = ImageReference::parse(image)?;
                self.registry.pull_mapping_image(&reference).await?
            }
            (None, None) => return Ok(None),
        };

        let mapping = parse_mapping(&bytes).context("parsing static mappings")?;
        if self.args.verify_static_json_mappings {
            verify_mapping(&mapping, self.registry.as_ref())
                .await
                .context("verifying static mappings")?;
        }
        tracing::debug!(entries = mapping.len(), "static mappings loaded");
        Ok(Some(mapping))
    }
}

/// The post-stream phases: scan, persist, attest, aggregate.
async fn finish(
    mut run_errors: Vec<CoreError>,
    args: &Cli,
    registry: &Arc<RegistryClient>,
    mappings: Arc<Mutex<Mapping>>,
    vuln_ignore_images: Option<Regex>,
) -> Result<()> {
    let scan_errors = check_vulns(args, vuln_ignore_images, mappings.clone()).await;

    // The mapping is written even when the scan found violations, so a
    // failing run still leaves an inspectable record.
    let snapshot = mappings.lock().await.clone();
    let write_result = write_mappings(args, registry, &snapshot).await;
    if let Err(ref e) = write_result {
        tracing::error!("failed writing mappings: {e:#}");
    }

    run_errors.extend(scan_errors);
    if run_errors.is_empty() {
        run_errors.extend(attest_images(args, &snapshot).await);
    } else if args.binauthz_attestor.is_some() {
        tracing::warn!("skipping attestation, the run already failed");
    }

    if let Some(err) = aggregate(run_errors) {
        return Err(err.into());
    }
    write_result
}

fn build_finder(args: &Cli) -> Result<ImageFinder> {
    let mut configs: Vec<RuleConfig> = match &args.rules_config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading rules file {}", path.display()))?;
            serde_yaml::from_str::<Option<Vec<RuleConfig>>>(&text)
                .with_context(|| format!("parsing rules file {}", path.display()))?
                .unwrap_or_default()
        }
        None => Vec::new(),
    };
    if args.input == InputKind::K8s {
        configs.extend(default_rules());
    }
    Ok(ImageFinder::new(CompiledRules::compile(&configs)?))
}

/// Fan out one task per image, each under the per-image timeout. Errors land
/// in the slot matching the task's position; reports merge into the mapping
/// under its lock.
async fn check_vulns(
    args: &Cli,
    vuln_ignore_images: Option<Regex>,
    mappings: Arc<Mutex<Mapping>>,
) -> Vec<CoreError> {
    let ignore_list: Vec<String> = args
        .vulncheck_ignore_cve_list
        .iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    let policy = CvePolicy::new(args.vulncheck_max_cvss, ignore_list, vuln_ignore_images);
    if !policy.is_enabled() {
        tracing::debug!("vulnerability checking disabled (max CVSS is 0)");
        return Vec::new();
    }

    let getter: Arc<dyn VulnGetter> = match args.vulncheck_method {
        VulncheckMethod::Trivy => match TrivyVulnGetter::new(&args.trivy_command) {
            Ok(getter) => Arc::new(getter),
            Err(e) => return vec![e],
        },
        VulncheckMethod::Grafeas => {
            let Some(ref parent) = args.grafeas_parent else {
                return vec![CoreError::BadConfig(
                    "the grafeas vulncheck method requires --grafeas-parent".to_string(),
                )];
            };
            Arc::new(GrafeasVulnGetter::new(
                Arc::new(RestOccurrenceStore::new(parent.clone())),
                args.vulncheck_max_retries,
            ))
        }
    };
    let checker = Arc::new(VulnChecker::new(policy, getter));

    let entries: Vec<_> = mappings
        .lock()
        .await
        .iter()
        .map(|(source, image)| (source.clone(), image.clone()))
        .collect();

    let mut handles: Vec<JoinHandle<(usize, Option<CoreError>)>> = Vec::new();
    for (i, (source, image)) in entries.into_iter().enumerate() {
        let checker = Arc::clone(&checker);
        let mappings = Arc::clone(&mappings);
        let timeout = args.vulncheck_timeout;
        handles.push(tokio::spawn(async move {
            match tokio::time::timeout(timeout, checker.check(&source, &image)).await {
                Err(_) => (
                    i,
                    Some(CoreError::VulnScan {
                        reference: source,
                        message: format!("timed out after {timeout:?}"),
                    }),
                ),
                Ok(Err(e)) => (i, Some(e)),
                Ok(Ok(report)) => {
                    let violation = (!report.found.is_empty()).then(|| CoreError::PolicyViolation {
                        reference: source.clone(),
                        cves: report.found.join(", "),
                    });
                    let mut mappings = mappings.lock().await;
                    if let Some(entry) = mappings.get_mut(&source) {
                        entry.found_cves = report.found;
                        entry.ignored_cves = report.ignored;
                    }
                    (i, violation)
                }
            }
        }));
    }

    collect_errors(handles).await
}

/// Fan out one attestation task per unique digest, after a clean scan.
async fn attest_images(args: &Cli, mapping: &Mapping) -> Vec<CoreError> {
    let Some(ref note_ref) = args.binauthz_attestor else {
        return Vec::new();
    };
    if args.dryrun {
        tracing::info!("dry-run, skipping attestation");
        return Vec::new();
    }
    let Some(ref parent) = args.grafeas_parent else {
        return vec![CoreError::BadConfig(
            "--binauthz-attestor requires --grafeas-parent".to_string(),
        )];
    };
    let Some(ref key) = args.gcp_kms_key else {
        return vec![CoreError::BadConfig(
            "--binauthz-attestor requires --gcp-kms-key".to_string(),
        )];
    };

    let store = Arc::new(RestOccurrenceStore::new(parent.clone()));
    let keyer: Arc<dyn Keyer> = Arc::new(KmsKeyer::new(key.clone()));
    let attester = Arc::new(Attester::new(store, keyer, note_ref.clone(), None));

    let mut unique: HashMap<String, ImageReference> = HashMap::new();
    for (source, image) in mapping {
        match image.target() {
            Ok(target) => {
                unique.entry(image.digest.clone()).or_insert(target);
            }
            Err(e) => tracing::warn!(image = %source, error = %e, "unattestable mapping entry"),
        }
    }

    let mut handles: Vec<JoinHandle<(usize, Option<CoreError>)>> = Vec::new();
    for (i, reference) in unique.into_values().enumerate() {
        let attester = Arc::clone(&attester);
        handles.push(tokio::spawn(async move {
            (i, attester.attest(&reference).await.err())
        }));
    }

    collect_errors(handles).await
}

async fn write_mappings(
    args: &Cli,
    registry: &Arc<RegistryClient>,
    mapping: &Mapping,
) -> Result<()> {
    if args.write_json_mappings_file.is_none() && args.write_json_mappings_img.is_none() {
        return Ok(());
    }
    let bytes = serialize_mapping(mapping)?;

    if args.dryrun {
        tracing::info!("dry-run, will not write mappings");
        return Ok(());
    }

    if let Some(ref path) = args.write_json_mappings_file {
        std::fs::write(path, &bytes)
            .with_context(|| format!("writing mappings file {}", path.display()))?;
        tracing::info!(path = %path.display(), entries = mapping.len(), "mappings written");
    }
    if let Some(ref image) = args.write_json_mappings_img {
        let reference = ImageReference::parse(image)?;
        registry.push_mapping_image(&reference, &bytes).await?;
    }
    Ok(())
}

/// Join the fan-out, filling a fixed slot per task so no lock is needed for
/// error accumulation.
async fn collect_errors(handles: Vec<JoinHandle<(usize, Option<CoreError>)>>) -> Vec<CoreError> {
    let mut slots: Vec<Option<CoreError>> =
        std::iter::repeat_with(|| None).take(handles.len()).collect();
    let mut aborted = Vec::new();
    for handle in handles {
        match handle.await {
            Ok((i, err)) => slots[i] = err,
            Err(e) => aborted.push(CoreError::Cancelled(format!("worker task aborted: {e}"))),
        }
    }
    slots.into_iter().flatten().chain(aborted).collect()
}
