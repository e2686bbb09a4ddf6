//! OCI registry client.
//!
//! Uses the `oci-distribution` crate to resolve manifest digests and to copy
//! manifest + layers between repositories. Resolved digests are cached per
//! `(registry, repository, tag)` for the process lifetime.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use oci_distribution::client::{ClientConfig, ClientProtocol, Config, ImageLayer};
use oci_distribution::manifest::OciManifest;
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference};

use repin_core::error::{Error, Result};
use repin_core::reference::ImageReference;
use repin_core::remap::{DigestResolver, ImageCopier};

/// Authentication credentials for a container registry.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    /// Create anonymous authentication (no credentials).
    pub fn anonymous() -> Self {
        Self {
            username: None,
            password: None,
        }
    }

    /// Create basic authentication with username and password.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Create authentication from environment variables.
    ///
    /// Reads `REGISTRY_USERNAME` and `REGISTRY_PASSWORD`.
    /// Falls back to anonymous if not set.
    pub fn from_env() -> Self {
        let username = std::env::var("REGISTRY_USERNAME").ok();
        let password = std::env::var("REGISTRY_PASSWORD").ok();

        if username.is_some() && password.is_some() {
            Self { username, password }
        } else {
            Self::anonymous()
        }
    }

    /// Convert to oci-distribution auth type.
    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// Registry client with a process-wide digest cache.
pub struct RegistryClient {
    pub(crate) client: Client,
    auth: RegistryAuth,
    digest_cache: RwLock<HashMap<(String, String, String), String>>,
}

impl RegistryClient {
    /// Create a new registry client with anonymous authentication.
    pub fn new() -> Self {
        Self::with_auth(RegistryAuth::anonymous())
    }

    /// Create a new registry client with the given authentication.
    pub fn with_auth(auth: RegistryAuth) -> Self {
        let config = ClientConfig {
            protocol: ClientProtocol::Https,
            ..Default::default()
        };
        let client = Client::new(config);

        Self {
            client,
            auth,
            digest_cache: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn oci_auth(&self) -> OciRegistryAuth {
        self.auth.to_oci_auth()
    }

    /// The digest a reference currently points at.
    ///
    /// Digest-pinned references return their own digest; tag references go
    /// through the cache and hit the registry at most once per run.
    pub async fn resolve_digest(&self, reference: &ImageReference) -> Result<String> {
        if let Some(ref digest) = reference.digest {
            return Ok(digest.clone());
        }

        let key = (
            reference.canonical_registry().to_string(),
            reference.canonical_repository(),
            reference.canonical_tag().unwrap_or_default(),
        );
        if let Some(digest) = self
            .digest_cache
            .read()
            .expect("digest cache lock")
            .get(&key)
        {
            return Ok(digest.clone());
        }

        let oci_ref = to_oci_reference(reference)?;
        let (_manifest, digest) =
            self.client
                .pull_manifest(&oci_ref, &self.oci_auth())
                .await
                .map_err(|e| Error::DigestResolve {
                    reference: reference.to_string(),
                    message: e.to_string(),
                })?;

        tracing::debug!(reference = %reference, digest = %digest, "resolved digest");
        self.digest_cache
            .write()
            .expect("digest cache lock")
            .insert(key, digest.clone());
        Ok(digest)
    }

    /// The digest the target's tag currently points at, or None when the
    /// registry has no manifest there. The probe always goes by tag: the
    /// question is whether the tag exists, not whether the blob does.
    pub async fn head_digest(&self, reference: &ImageReference) -> Result<Option<String>> {
        let mut tag_ref = reference.clone();
        tag_ref.digest = None;
        let oci_ref = to_oci_reference(&tag_ref)?;
        match self.client.pull_manifest(&oci_ref, &self.oci_auth()).await {
            Ok((_manifest, digest)) => Ok(Some(digest)),
            Err(e) => {
                let msg = e.to_string();
                if msg.contains("404") || msg.to_lowercase().contains("not found") {
                    Ok(None)
                } else {
                    Err(Error::Registry {
                        reference: reference.to_string(),
                        message: msg,
                    })
                }
            }
        }
    }

    /// Copy manifest, config and layers from `source` to `target`.
    ///
    /// The source is pulled by digest when it carries one; the push goes to
    /// the target's tag. The manifest is pushed unchanged, so the target
    /// digest equals the source digest.
    pub async fn copy_image(
        &self,
        source: &ImageReference,
        target: &ImageReference,
    ) -> Result<()> {
        let src_ref = to_oci_reference(source)?;
        let mut target_tag = target.clone();
        target_tag.digest = None;
        let dst_ref = to_oci_reference(&target_tag)?;
        let auth = self.oci_auth();

        let registry_err = |message: String| Error::Registry {
            reference: source.to_string(),
            message,
        };

        let (manifest, digest) = self
            .client
            .pull_manifest(&src_ref, &auth)
            .await
            .map_err(|e| registry_err(format!("failed to pull manifest: {e}")))?;

        let manifest = match manifest {
            OciManifest::Image(m) => m,
            OciManifest::ImageIndex(_) => {
                return Err(registry_err(
                    "multi-platform image index copies are not supported".to_string(),
                ))
            }
        };

        let mut config_data: Vec<u8> = Vec::new();
        self.client
            .pull_blob(&src_ref, &manifest.config, &mut config_data)
            .await
            .map_err(|e| registry_err(format!("failed to pull config blob: {e}")))?;
        let config = Config::new(config_data, manifest.config.media_type.clone(), None);

        let mut layers = Vec::with_capacity(manifest.layers.len());
        for descriptor in &manifest.layers {
            tracing::debug!(digest = %descriptor.digest, size = descriptor.size, "pulling layer");
            let mut data: Vec<u8> = Vec::new();
            self.client
                .pull_blob(&src_ref, descriptor, &mut data)
                .await
                .map_err(|e| {
                    registry_err(format!("failed to pull layer {}: {e}", descriptor.digest))
                })?;
            layers.push(ImageLayer::new(data, descriptor.media_type.clone(), None));
        }

        self.client
            .push(&dst_ref, &layers, config, &auth, Some(manifest))
            .await
            .map_err(|e| Error::Registry {
                reference: target.to_string(),
                message: format!("failed to push: {e}"),
            })?;

        tracing::info!(source = %source, target = %target, digest = %digest, "image copied");
        Ok(())
    }
}

impl Default for RegistryClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DigestResolver for RegistryClient {
    async fn resolve(&self, reference: &ImageReference) -> Result<String> {
        self.resolve_digest(reference).await
    }
}

#[async_trait]
impl ImageCopier for RegistryClient {
    async fn head(&self, reference: &ImageReference) -> Result<Option<String>> {
        self.head_digest(reference).await
    }

    async fn copy(&self, source: &ImageReference, target: &ImageReference) -> Result<()> {
        self.copy_image(source, target).await
    }
}

/// Convert an ImageReference to an oci-distribution Reference. A digest wins
/// over a tag: digest addressing is immutable, which is the whole point of
/// pinning.
pub(crate) fn to_oci_reference(reference: &ImageReference) -> Result<Reference> {
    let repo = reference.repo();
    let ref_str = match (&reference.digest, reference.canonical_tag()) {
        (Some(digest), _) => format!("{repo}@{digest}"),
        (None, Some(tag)) => format!("{repo}:{tag}"),
        (None, None) => format!("{repo}:latest"),
    };

    ref_str.parse::<Reference>().map_err(|e| Error::Registry {
        reference: reference.to_string(),
        message: format!("invalid OCI reference '{ref_str}': {e}"),
    })
}
