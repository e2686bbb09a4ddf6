//! The mapping as a registry artifact.
//!
//! The mapping's registry form is an OCI image with exactly one layer: a tar
//! archive holding one file, `reimage-mapping.json`. That layout is shared
//! with existing tooling and must not change.

use std::io::Read;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use oci_distribution::client::{Config, ImageLayer};
use oci_distribution::manifest::{
    OciImageManifest, IMAGE_CONFIG_MEDIA_TYPE, IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE,
    IMAGE_DOCKER_LAYER_TAR_MEDIA_TYPE, IMAGE_LAYER_GZIP_MEDIA_TYPE, IMAGE_LAYER_MEDIA_TYPE,
};
use sha2::{Digest, Sha256};
use tar::{Archive, Builder, Header};

use repin_core::error::{Error, Result};
use repin_core::reference::ImageReference;
use repin_core::MAPPING_FILE_NAME;

use crate::registry::{to_oci_reference, RegistryClient};

impl RegistryClient {
    /// Pull a mapping artifact and return the raw mapping JSON.
    pub async fn pull_mapping_image(&self, reference: &ImageReference) -> Result<Vec<u8>> {
        let oci_ref = to_oci_reference(reference)?;
        let image = self
            .client
            .pull(
                &oci_ref,
                &self.oci_auth(),
                vec![
                    IMAGE_LAYER_MEDIA_TYPE,
                    IMAGE_LAYER_GZIP_MEDIA_TYPE,
                    IMAGE_DOCKER_LAYER_TAR_MEDIA_TYPE,
                    IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE,
                ],
            )
            .await
            .map_err(|e| Error::Registry {
                reference: reference.to_string(),
                message: format!("failed to pull mapping image: {e}"),
            })?;

        if image.layers.len() != 1 {
            return Err(Error::BadConfig(format!(
                "'{reference}' has {} layers, not a mapping artifact",
                image.layers.len()
            )));
        }

        extract_mapping(&image.layers[0].data).ok_or_else(|| {
            Error::BadConfig(format!(
                "'{reference}' does not contain {MAPPING_FILE_NAME}"
            ))
        })
    }

    /// Push the mapping JSON as a fresh single-layer artifact.
    pub async fn push_mapping_image(
        &self,
        reference: &ImageReference,
        mapping_json: &[u8],
    ) -> Result<()> {
        let oci_ref = to_oci_reference(reference)?;
        let push_err = |message: String| Error::Registry {
            reference: reference.to_string(),
            message,
        };

        let tarball = build_mapping_tar(mapping_json)?;
        let diff_id = format!("sha256:{:x}", Sha256::digest(&tarball));

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        std::io::Write::write_all(&mut encoder, &tarball)?;
        let compressed = encoder.finish()?;

        let layer = ImageLayer::new(
            compressed,
            IMAGE_LAYER_GZIP_MEDIA_TYPE.to_string(),
            None,
        );
        let config_json = serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "rootfs": { "type": "layers", "diff_ids": [diff_id] },
        });
        let config = Config::new(
            serde_json::to_vec(&config_json)?,
            IMAGE_CONFIG_MEDIA_TYPE.to_string(),
            None,
        );
        let manifest = OciImageManifest::build(std::slice::from_ref(&layer), &config, None);

        self.client
            .push(
                &oci_ref,
                std::slice::from_ref(&layer),
                config,
                &self.oci_auth(),
                Some(manifest),
            )
            .await
            .map_err(|e| push_err(format!("failed to push mapping image: {e}")))?;

        tracing::info!(reference = %reference, bytes = mapping_json.len(), "mapping image pushed");
        Ok(())
    }
}

/// A tar with a single `reimage-mapping.json` entry.
fn build_mapping_tar(mapping_json: &[u8]) -> Result<Vec<u8>> {
    let mut builder = Builder::new(Vec::new());
    let mut header = Header::new_gnu();
    header.set_size(mapping_json.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, MAPPING_FILE_NAME, mapping_json)?;
    Ok(builder.into_inner()?)
}

/// Read `reimage-mapping.json` out of a (possibly gzipped) layer tar.
fn extract_mapping(layer: &[u8]) -> Option<Vec<u8>> {
    let decompressed = if layer.starts_with(&[0x1f, 0x8b]) {
        let mut data = Vec::new();
        GzDecoder::new(layer).read_to_end(&mut data).ok()?;
        data
    } else {
        layer.to_vec()
    };

    let mut archive = Archive::new(decompressed.as_slice());
    for entry in archive.entries().ok()? {
        let mut entry = entry.ok()?;
        let path = entry.path().ok()?;
        if path.file_name().and_then(|n| n.to_str()) == Some(MAPPING_FILE_NAME) {
            let mut data = Vec::new();
            entry.read_to_end(&mut data).ok()?;
            return Some(data);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tar_round_trip() {
        let json = br#"{"busybox:1":{"Tag":"mirror/busybox:1"}}"#;
        let tarball = build_mapping_tar(json).unwrap();
        assert_eq!(extract_mapping(&tarball).unwrap(), json);
    }

    #[test]
    fn test_gzipped_layer_round_trip() {
        let json = br#"{"nginx:1.25":{"Tag":"mirror/nginx:1.25"}}"#;
        let tarball = build_mapping_tar(json).unwrap();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        std::io::Write::write_all(&mut encoder, &tarball).unwrap();
        let compressed = encoder.finish().unwrap();
        assert_eq!(extract_mapping(&compressed).unwrap(), json);
    }

    #[test]
    fn test_layer_without_mapping_file() {
        let mut builder = Builder::new(Vec::new());
        let data = b"other";
        let mut header = Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "other.json", &data[..]).unwrap();
        let tarball = builder.into_inner().unwrap();
        assert!(extract_mapping(&tarball).is_none());
    }
}
