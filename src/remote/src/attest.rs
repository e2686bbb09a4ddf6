//! Attestation creation and verification over the occurrence store.
//!
//! An attestation is a signed canonical payload published as an occurrence
//! under the configured note-ref. Attesting is idempotent per
//! (digest, note-ref): a digest with an existing verifiable attestation is
//! never re-signed.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Serialize;

use repin_core::error::{Error, Result};
use repin_core::reference::ImageReference;

use crate::grafeas::{
    occurrence_filter, AttestationOccurrence, Occurrence, OccurrenceSignature, OccurrenceStore,
    KIND_ATTESTATION,
};

/// A signing key held elsewhere (KMS, HSM). Key material never enters this
/// process.
#[async_trait]
pub trait Keyer: Send + Sync {
    /// Sign `payload`, returning the signature and the signing key's id.
    async fn sign(&self, payload: &[u8]) -> Result<(Vec<u8>, String)>;

    /// Verify `signature` over `payload`.
    async fn verify(&self, payload: &[u8], signature: &[u8]) -> Result<()>;
}

// The payload layout (and the misspelled "identitiy" key) is the wire format
// existing verifiers expect; do not correct it.
#[derive(Serialize)]
struct BinAuthzPayload<'a> {
    critical: Critical<'a>,
}

#[derive(Serialize)]
struct Critical<'a> {
    #[serde(rename = "identitiy")]
    identity: Identity<'a>,
    image: Image<'a>,
    #[serde(rename = "type")]
    payload_type: &'a str,
}

#[derive(Serialize)]
struct Identity<'a> {
    #[serde(rename = "docker-reference")]
    docker_reference: &'a str,
}

#[derive(Serialize)]
struct Image<'a> {
    #[serde(rename = "docker-manifest-digest")]
    docker_manifest_digest: &'a str,
}

/// The canonical attestation payload for one digest-pinned reference.
pub fn binauthz_payload(docker_reference: &str, manifest_digest: &str) -> Result<Vec<u8>> {
    let payload = BinAuthzPayload {
        critical: Critical {
            identity: Identity { docker_reference },
            image: Image {
                docker_manifest_digest: manifest_digest,
            },
            payload_type: "Google cloud binauthz container signature",
        },
    };
    Ok(serde_json::to_vec(&payload)?)
}

/// Creates and checks attestations for image digests.
pub struct Attester {
    store: Arc<dyn OccurrenceStore>,
    keys: Arc<dyn Keyer>,
    note_ref: String,
    key_id: Option<String>,
}

impl Attester {
    pub fn new(
        store: Arc<dyn OccurrenceStore>,
        keys: Arc<dyn Keyer>,
        note_ref: impl Into<String>,
        key_id: Option<String>,
    ) -> Self {
        Self {
            store,
            keys,
            note_ref: note_ref.into(),
            key_id,
        }
    }

    /// All attestation occurrences for `digest_ref` under the note-ref whose
    /// signature verifies. An empty result is [`Error::AttestationNotFound`].
    pub async fn get(&self, digest_ref: &str) -> Result<Vec<AttestationOccurrence>> {
        let filter = occurrence_filter(KIND_ATTESTATION, digest_ref);
        let occurrences = self.store.list_occurrences(&filter).await?;

        let mut verified = Vec::new();
        for occurrence in occurrences {
            if occurrence.kind != KIND_ATTESTATION {
                continue;
            }
            if !self.note_ref.is_empty() && occurrence.note_name != self.note_ref {
                continue;
            }
            let Some(attestation) = occurrence.attestation else {
                continue;
            };
            let Ok(payload) = BASE64.decode(&attestation.serialized_payload) else {
                continue;
            };
            for (i, sig) in attestation.signatures.iter().enumerate() {
                let Ok(raw_sig) = BASE64.decode(&sig.signature) else {
                    continue;
                };
                match self.keys.verify(&payload, &raw_sig).await {
                    Ok(()) => {
                        verified.push(attestation.clone());
                        break;
                    }
                    Err(err) => {
                        tracing::info!(
                            image = %digest_ref,
                            sig_num = i,
                            error = %err,
                            "attestation signature did not verify"
                        );
                    }
                }
            }
        }

        if verified.is_empty() {
            return Err(Error::AttestationNotFound(digest_ref.to_string()));
        }
        Ok(verified)
    }

    /// Does a verifiable attestation already exist?
    pub async fn check(&self, digest_ref: &str) -> Result<bool> {
        match self.get(digest_ref).await {
            Ok(_) => Ok(true),
            Err(Error::AttestationNotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Attest a digest-pinned reference, skipping if one already exists.
    pub async fn attest(&self, reference: &ImageReference) -> Result<()> {
        let Some(digest) = reference.digest.as_deref() else {
            return Err(Error::Attest {
                reference: reference.to_string(),
                message: "reference is not digest-pinned".to_string(),
            });
        };
        let digest_ref = reference.digest_ref()?;

        if self.check(&digest_ref).await? {
            tracing::debug!(image = %digest_ref, "already attested");
            return Ok(());
        }

        let payload = binauthz_payload(&digest_ref, digest)?;
        let (signature, signed_key_id) = self
            .keys
            .sign(&payload)
            .await
            .map_err(|e| Error::Sign(format!("'{digest_ref}': {e}")))?;
        let key_id = self.resolve_key_id(signed_key_id).await?;

        let occurrence = Occurrence {
            note_name: self.note_ref.clone(),
            resource_uri: format!("https://{digest_ref}"),
            kind: KIND_ATTESTATION.to_string(),
            attestation: Some(AttestationOccurrence {
                serialized_payload: BASE64.encode(&payload),
                signatures: vec![OccurrenceSignature {
                    signature: BASE64.encode(&signature),
                    public_key_id: key_id,
                }],
            }),
            ..Default::default()
        };

        self.store
            .create_occurrence(occurrence)
            .await
            .map_err(|e| Error::Attest {
                reference: digest_ref.clone(),
                message: e.to_string(),
            })?;
        tracing::info!(image = %digest_ref, note = %self.note_ref, "attestation created");
        Ok(())
    }

    /// The signer's key id, the configured one, or the first public key on
    /// the attestor note, in that order.
    async fn resolve_key_id(&self, signed_key_id: String) -> Result<String> {
        if !signed_key_id.is_empty() {
            return Ok(signed_key_id);
        }
        if let Some(ref key_id) = self.key_id {
            return Ok(key_id.clone());
        }
        let note = self.store.get_note(&self.note_ref).await?;
        note.public_keys
            .first()
            .map(|k| k.id.clone())
            .ok_or_else(|| {
                Error::Sign(format!(
                    "no key id configured and note '{}' lists no public keys",
                    self.note_ref
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grafeas::{Note, NotePublicKey};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const DIGEST: &str =
        "sha256:1111111111111111111111111111111111111111111111111111111111111111";
    const NOTE_REF: &str = "projects/example/notes/prod-attestor";

    struct MemoryStore {
        occurrences: Mutex<Vec<Occurrence>>,
        creates: AtomicUsize,
        note: Note,
    }

    impl MemoryStore {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                occurrences: Mutex::new(Vec::new()),
                creates: AtomicUsize::new(0),
                note: Note {
                    name: NOTE_REF.to_string(),
                    public_keys: vec![NotePublicKey {
                        id: "note-key-1".to_string(),
                        pem: String::new(),
                    }],
                },
            })
        }
    }

    #[async_trait]
    impl OccurrenceStore for MemoryStore {
        async fn list_occurrences(&self, filter: &str) -> Result<Vec<Occurrence>> {
            let occurrences = self.occurrences.lock().unwrap();
            Ok(occurrences
                .iter()
                .filter(|occ| filter.contains(&occ.resource_uri))
                .cloned()
                .collect())
        }

        async fn create_occurrence(&self, occurrence: Occurrence) -> Result<Occurrence> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            self.occurrences.lock().unwrap().push(occurrence.clone());
            Ok(occurrence)
        }

        async fn get_note(&self, _note_ref: &str) -> Result<Note> {
            Ok(self.note.clone())
        }
    }

    /// Signs by reversing the payload; verifies the same way.
    struct ReversingKeyer {
        key_id: &'static str,
    }

    #[async_trait]
    impl Keyer for ReversingKeyer {
        async fn sign(&self, payload: &[u8]) -> Result<(Vec<u8>, String)> {
            let sig: Vec<u8> = payload.iter().rev().copied().collect();
            Ok((sig, self.key_id.to_string()))
        }

        async fn verify(&self, payload: &[u8], signature: &[u8]) -> Result<()> {
            let expected: Vec<u8> = payload.iter().rev().copied().collect();
            if signature == expected {
                Ok(())
            } else {
                Err(Error::Sign("signature mismatch".to_string()))
            }
        }
    }

    fn attester(store: Arc<MemoryStore>) -> Attester {
        Attester::new(
            store,
            Arc::new(ReversingKeyer { key_id: "kms-key-1" }),
            NOTE_REF,
            None,
        )
    }

    fn pinned() -> ImageReference {
        ImageReference::parse("registry.example.com/mirror/app:v1")
            .unwrap()
            .with_digest(DIGEST)
            .unwrap()
    }

    #[test]
    fn test_payload_wire_format() {
        let payload = binauthz_payload("registry.example.com/app@sha256:abc", "sha256:abc").unwrap();
        let text = String::from_utf8(payload).unwrap();
        assert_eq!(
            text,
            r#"{"critical":{"identitiy":{"docker-reference":"registry.example.com/app@sha256:abc"},"image":{"docker-manifest-digest":"sha256:abc"},"type":"Google cloud binauthz container signature"}}"#
        );
    }

    #[tokio::test]
    async fn test_attest_creates_occurrence() {
        let store = MemoryStore::new();
        attester(store.clone()).attest(&pinned()).await.unwrap();
        assert_eq!(store.creates.load(Ordering::SeqCst), 1);

        let occurrences = store.occurrences.lock().unwrap();
        let occ = &occurrences[0];
        assert_eq!(occ.kind, KIND_ATTESTATION);
        assert_eq!(occ.note_name, NOTE_REF);
        assert!(occ.resource_uri.starts_with("https://"));
        assert!(occ.resource_uri.ends_with(DIGEST));
        let att = occ.attestation.as_ref().unwrap();
        assert_eq!(att.signatures[0].public_key_id, "kms-key-1");
    }

    #[tokio::test]
    async fn test_attest_twice_creates_once() {
        let store = MemoryStore::new();
        let attester = attester(store.clone());
        attester.attest(&pinned()).await.unwrap();
        attester.attest(&pinned()).await.unwrap();
        assert_eq!(store.creates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unverifiable_attestation_is_replaced() {
        let store = MemoryStore::new();
        let digest_ref = pinned().digest_ref().unwrap();
        store.occurrences.lock().unwrap().push(Occurrence {
            note_name: NOTE_REF.to_string(),
            resource_uri: format!("https://{digest_ref}"),
            kind: KIND_ATTESTATION.to_string(),
            attestation: Some(AttestationOccurrence {
                serialized_payload: BASE64.encode(b"payload"),
                signatures: vec![OccurrenceSignature {
                    signature: BASE64.encode(b"garbage"),
                    public_key_id: "unknown".to_string(),
                }],
            }),
            ..Default::default()
        });

        attester(store.clone()).attest(&pinned()).await.unwrap();
        assert_eq!(store.creates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_other_note_attestations_ignored() {
        let store = MemoryStore::new();
        let attester = attester(store.clone());
        attester.attest(&pinned()).await.unwrap();

        // The same digest attested under a different note still needs ours.
        let other = Attester::new(
            store.clone(),
            Arc::new(ReversingKeyer { key_id: "kms-key-1" }),
            "projects/example/notes/other",
            None,
        );
        other.attest(&pinned()).await.unwrap();
        assert_eq!(store.creates.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_key_id_falls_back_to_note() {
        let store = MemoryStore::new();
        let attester = Attester::new(
            store.clone(),
            Arc::new(ReversingKeyer { key_id: "" }),
            NOTE_REF,
            None,
        );
        attester.attest(&pinned()).await.unwrap();
        let occurrences = store.occurrences.lock().unwrap();
        let att = occurrences[0].attestation.as_ref().unwrap();
        assert_eq!(att.signatures[0].public_key_id, "note-key-1");
    }

    #[tokio::test]
    async fn test_check_reports_absence() {
        let store = MemoryStore::new();
        let attester = attester(store);
        let digest_ref = pinned().digest_ref().unwrap();
        assert!(!attester.check(&digest_ref).await.unwrap());
        attester.attest(&pinned()).await.unwrap();
        assert!(attester.check(&digest_ref).await.unwrap());
    }
}
