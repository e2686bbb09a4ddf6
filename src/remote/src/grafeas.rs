//! Occurrence store: the remote record of discoveries, vulnerability
//! findings and attestations.
//!
//! The store itself is an abstract seam; a REST implementation shaped after
//! the containeranalysis v1 surface is provided for real runs. The
//! vulnerability oracle here waits for a finished discovery before reading
//! findings, retrying with exponential backoff while analysis is running.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use repin_core::error::{Error, Result};
use repin_core::policy::ImageVulnerability;
use repin_core::retry::backoff_delay;

use crate::scan::VulnGetter;

/// Occurrence kinds used on the wire.
pub const KIND_DISCOVERY: &str = "DISCOVERY";
pub const KIND_VULNERABILITY: &str = "VULNERABILITY";
pub const KIND_ATTESTATION: &str = "ATTESTATION";

/// Discovery analysis states.
pub const ANALYSIS_FINISHED_SUCCESS: &str = "FINISHED_SUCCESS";
pub const ANALYSIS_FINISHED_UNSUPPORTED: &str = "FINISHED_UNSUPPORTED";

/// One occurrence record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Occurrence {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub note_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub resource_uri: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discovery: Option<DiscoveryOccurrence>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vulnerability: Option<VulnerabilityOccurrence>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attestation: Option<AttestationOccurrence>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiscoveryOccurrence {
    pub analysis_status: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VulnerabilityOccurrence {
    pub short_description: String,
    pub cvss_score: f32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AttestationOccurrence {
    /// Base64 payload bytes
    pub serialized_payload: String,
    pub signatures: Vec<OccurrenceSignature>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OccurrenceSignature {
    /// Base64 signature bytes
    pub signature: String,
    pub public_key_id: String,
}

/// The attestor note: the trust anchor carrying the accepted public keys.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Note {
    pub name: String,
    pub public_keys: Vec<NotePublicKey>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotePublicKey {
    pub id: String,
    pub pem: String,
}

/// The filter selecting occurrences of one kind for one digest.
pub fn occurrence_filter(kind: &str, digest_ref: &str) -> String {
    format!(r#"((kind = "{kind}") AND (resourceUrl = "https://{digest_ref}"))"#)
}

/// Abstract note/occurrence transport.
#[async_trait]
pub trait OccurrenceStore: Send + Sync {
    async fn list_occurrences(&self, filter: &str) -> Result<Vec<Occurrence>>;

    async fn create_occurrence(&self, occurrence: Occurrence) -> Result<Occurrence>;

    async fn get_note(&self, note_ref: &str) -> Result<Note>;
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ListOccurrencesResponse {
    occurrences: Vec<Occurrence>,
    next_page_token: String,
}

/// containeranalysis-v1-shaped REST store.
///
/// Authenticates with a bearer token from `GRAFEAS_TOKEN` or
/// `GOOGLE_ACCESS_TOKEN`; credential management stays outside this tool.
pub struct RestOccurrenceStore {
    http: reqwest::Client,
    base_url: String,
    parent: String,
    token: Option<String>,
}

impl RestOccurrenceStore {
    pub fn new(parent: impl Into<String>) -> Self {
        Self::with_base_url("https://containeranalysis.googleapis.com/v1", parent)
    }

    pub fn with_base_url(base_url: impl Into<String>, parent: impl Into<String>) -> Self {
        let token = std::env::var("GRAFEAS_TOKEN")
            .or_else(|_| std::env::var("GOOGLE_ACCESS_TOKEN"))
            .ok();
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            parent: parent.into(),
            token,
        }
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn transport_err(&self, message: String) -> Error {
        Error::Registry {
            reference: self.parent.clone(),
            message,
        }
    }
}

#[async_trait]
impl OccurrenceStore for RestOccurrenceStore {
    async fn list_occurrences(&self, filter: &str) -> Result<Vec<Occurrence>> {
        let url = format!("{}/{}/occurrences", self.base_url, self.parent);
        let mut occurrences = Vec::new();
        let mut page_token = String::new();

        loop {
            let mut request = self.request(self.http.get(&url)).query(&[("filter", filter)]);
            if !page_token.is_empty() {
                request = request.query(&[("pageToken", page_token.as_str())]);
            }
            let response = request
                .send()
                .await
                .map_err(|e| self.transport_err(format!("list occurrences: {e}")))?
                .error_for_status()
                .map_err(|e| self.transport_err(format!("list occurrences: {e}")))?;
            let page: ListOccurrencesResponse = response
                .json()
                .await
                .map_err(|e| self.transport_err(format!("list occurrences decode: {e}")))?;

            occurrences.extend(page.occurrences);
            if page.next_page_token.is_empty() {
                return Ok(occurrences);
            }
            page_token = page.next_page_token;
        }
    }

    async fn create_occurrence(&self, occurrence: Occurrence) -> Result<Occurrence> {
        let url = format!("{}/{}/occurrences", self.base_url, self.parent);
        let response = self
            .request(self.http.post(&url))
            .json(&occurrence)
            .send()
            .await
            .map_err(|e| self.transport_err(format!("create occurrence: {e}")))?
            .error_for_status()
            .map_err(|e| self.transport_err(format!("create occurrence: {e}")))?;
        response
            .json()
            .await
            .map_err(|e| self.transport_err(format!("create occurrence decode: {e}")))
    }

    async fn get_note(&self, note_ref: &str) -> Result<Note> {
        let url = format!("{}/{}", self.base_url, note_ref);
        let response = self
            .request(self.http.get(&url))
            .send()
            .await
            .map_err(|e| self.transport_err(format!("get note: {e}")))?
            .error_for_status()
            .map_err(|e| self.transport_err(format!("get note: {e}")))?;
        response
            .json()
            .await
            .map_err(|e| self.transport_err(format!("get note decode: {e}")))
    }
}

/// Oracle reading findings from the occurrence store.
pub struct GrafeasVulnGetter {
    store: Arc<dyn OccurrenceStore>,
    retry_max: u32,
}

impl GrafeasVulnGetter {
    pub fn new(store: Arc<dyn OccurrenceStore>, retry_max: u32) -> Self {
        Self { store, retry_max }
    }

    /// One probe: finished discovery then findings.
    async fn check(&self, digest_ref: &str) -> Result<Vec<ImageVulnerability>> {
        let filter = occurrence_filter(KIND_DISCOVERY, digest_ref);
        let discovery = self
            .store
            .list_occurrences(&filter)
            .await?
            .into_iter()
            .find(|occ| occ.kind == KIND_DISCOVERY)
            .ok_or_else(|| Error::DiscoveryNotFound(digest_ref.to_string()))?;

        let status = discovery
            .discovery
            .map(|d| d.analysis_status)
            .unwrap_or_default();
        match status.as_str() {
            ANALYSIS_FINISHED_UNSUPPORTED => return Ok(Vec::new()),
            ANALYSIS_FINISHED_SUCCESS => {}
            _ => return Err(Error::DiscoverNotFinished(digest_ref.to_string())),
        }

        let filter = occurrence_filter(KIND_VULNERABILITY, digest_ref);
        let findings = self
            .store
            .list_occurrences(&filter)
            .await?
            .into_iter()
            .filter(|occ| occ.kind == KIND_VULNERABILITY)
            .filter_map(|occ| occ.vulnerability)
            .map(|v| ImageVulnerability {
                id: v.short_description,
                cvss: v.cvss_score,
            })
            .collect();
        Ok(findings)
    }
}

#[async_trait]
impl VulnGetter for GrafeasVulnGetter {
    async fn get(&self, digest_ref: &str) -> Result<Vec<ImageVulnerability>> {
        let mut last_err = Error::DiscoveryNotFound(digest_ref.to_string());
        for attempt in 0..=self.retry_max {
            match self.check(digest_ref).await {
                Ok(findings) => return Ok(findings),
                Err(
                    err @ (Error::DiscoverNotFinished(_) | Error::DiscoveryNotFound(_)),
                ) => {
                    let delay = backoff_delay(attempt);
                    tracing::info!(
                        image = %digest_ref,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "discovery not ready, retrying"
                    );
                    last_err = err;
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err)
    }
}
