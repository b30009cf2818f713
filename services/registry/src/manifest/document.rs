//! Parsing manifest documents into the descriptors they reference.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};

/// OCI image manifest.
pub const OCI_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
/// OCI image index; also the media type of referrers responses.
pub const OCI_IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
/// OCI artifact manifest.
pub const OCI_ARTIFACT_MANIFEST: &str = "application/vnd.oci.artifact.manifest.v1+json";
/// Docker image manifest, schema 2.
pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
/// Docker manifest list.
pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
/// Config media type marking an image manifest as a Helm chart.
pub const HELM_CONFIG: &str = "application/vnd.cncf.helm.config.v1+json";

/// A content descriptor inside a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content.
    pub media_type: String,
    /// Digest of the referenced content.
    pub digest: Digest,
    /// Size of the referenced content, in bytes.
    pub size: i64,
    /// Artifact type of a referenced manifest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    /// Free-form annotations.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// The shape of a manifest, as far as ingest cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    /// OCI or Docker image manifest: a config and layers.
    Image,
    /// An image manifest whose config is a Helm chart config.
    HelmChart,
    /// OCI image index or Docker manifest list: child manifests.
    Index,
    /// OCI artifact manifest: a list of blobs.
    Artifact,
    /// Anything else; stored opaquely.
    Unknown,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawManifest {
    media_type: Option<String>,
    artifact_type: Option<String>,
    config: Option<Descriptor>,
    #[serde(default)]
    layers: Vec<Descriptor>,
    #[serde(default)]
    blobs: Vec<Descriptor>,
    #[serde(default)]
    manifests: Vec<Descriptor>,
    subject: Option<Descriptor>,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
}

/// A parsed manifest.
#[derive(Debug, Clone)]
pub struct Manifest {
    /// The content type the manifest is stored and served with.
    pub media_type: String,
    /// What kind of manifest this is.
    pub kind: ManifestKind,
    /// `artifactType`, or else the config media type.
    pub artifact_type: Option<String>,
    /// The config descriptor of an image manifest.
    pub config: Option<Descriptor>,
    /// Leaf descriptors which must exist as blobs: config, layers and artifact blobs.
    pub blobs: Vec<Descriptor>,
    /// Child manifests which must exist as artifacts.
    pub manifests: Vec<Descriptor>,
    /// The manifest this one refers to.
    pub subject: Option<Descriptor>,
    /// Manifest annotations.
    pub annotations: BTreeMap<String, String>,
}

impl Manifest {
    /// Parse `body`, sent with `content_type`.
    ///
    /// A `mediaType` in the body must agree with the content type when both
    /// are given. Without either, the type is inferred from the fields present.
    /// A body sent with a content type the registry does not know, and which
    /// does not read as a manifest, is kept as an opaque document.
    pub fn parse(content_type: Option<&str>, body: &[u8]) -> RegistryResult<Self> {
        let content_type = content_type
            .map(essence)
            .filter(|ct| !ct.is_empty() && *ct != "application/json");

        let raw: RawManifest = match serde_json::from_slice(body) {
            Ok(raw) => raw,
            Err(err) => match content_type {
                Some(media_type) if !is_known(media_type) => {
                    tracing::debug!(%media_type, error = %err, "storing opaque manifest");
                    return Ok(Self::opaque(media_type));
                }
                _ => return Err(RegistryError::ManifestInvalid(err.to_string())),
            },
        };

        let media_type = match (content_type, raw.media_type.as_deref()) {
            (Some(header), Some(body)) if header != body => {
                return Err(RegistryError::ManifestInvalid(format!(
                    "mediaType {body} does not match Content-Type {header}"
                )));
            }
            (Some(header), _) => header.to_owned(),
            (None, Some(body)) => body.to_owned(),
            (None, None) if !raw.manifests.is_empty() => OCI_IMAGE_INDEX.to_owned(),
            (None, None) if raw.config.is_some() => OCI_IMAGE_MANIFEST.to_owned(),
            (None, None) => {
                return Err(RegistryError::ManifestInvalid(
                    "no media type given for manifest".into(),
                ));
            }
        };

        let kind = match media_type.as_str() {
            OCI_IMAGE_MANIFEST | DOCKER_MANIFEST => {
                match raw.config.as_ref().map(|c| c.media_type.as_str()) {
                    None => {
                        return Err(RegistryError::ManifestInvalid(
                            "image manifest has no config".into(),
                        ));
                    }
                    Some(HELM_CONFIG) => ManifestKind::HelmChart,
                    Some(_) => ManifestKind::Image,
                }
            }
            OCI_IMAGE_INDEX | DOCKER_MANIFEST_LIST => ManifestKind::Index,
            OCI_ARTIFACT_MANIFEST => ManifestKind::Artifact,
            _ => ManifestKind::Unknown,
        };

        let artifact_type = raw
            .artifact_type
            .clone()
            .or_else(|| raw.config.as_ref().map(|c| c.media_type.clone()));

        let mut blobs = Vec::with_capacity(raw.layers.len() + raw.blobs.len() + 1);
        blobs.extend(raw.config.iter().cloned());
        blobs.extend(raw.layers);
        blobs.extend(raw.blobs);

        Ok(Self {
            media_type,
            kind,
            artifact_type,
            config: raw.config,
            blobs,
            manifests: raw.manifests,
            subject: raw.subject,
            annotations: raw.annotations,
        })
    }

    fn opaque(media_type: &str) -> Self {
        Self {
            media_type: media_type.to_owned(),
            kind: ManifestKind::Unknown,
            artifact_type: None,
            config: None,
            blobs: Vec::new(),
            manifests: Vec::new(),
            subject: None,
            annotations: BTreeMap::new(),
        }
    }

    /// Distinct blob digests, in first-seen order.
    pub fn blob_digests(&self) -> Vec<String> {
        distinct(&self.blobs)
    }

    /// Distinct child manifest digests, in first-seen order.
    pub fn manifest_digests(&self) -> Vec<String> {
        distinct(&self.manifests)
    }
}

fn distinct(descriptors: &[Descriptor]) -> Vec<String> {
    let mut seen = Vec::<String>::with_capacity(descriptors.len());
    for descriptor in descriptors {
        let digest = descriptor.digest.to_string();
        if !seen.contains(&digest) {
            seen.push(digest);
        }
    }
    seen
}

fn is_known(media_type: &str) -> bool {
    matches!(
        media_type,
        OCI_IMAGE_MANIFEST
            | OCI_IMAGE_INDEX
            | OCI_ARTIFACT_MANIFEST
            | DOCKER_MANIFEST
            | DOCKER_MANIFEST_LIST
    )
}

/// The media type without parameters: `a/b; charset=utf-8` is `a/b`.
fn essence(content_type: &str) -> &str {
    content_type.split(';').next().unwrap_or(content_type).trim()
}

/// Annotations of a stored manifest, or none if it cannot be read.
pub fn annotations(raw: &[u8]) -> BTreeMap<String, String> {
    #[derive(Deserialize)]
    struct Annotated {
        #[serde(default)]
        annotations: BTreeMap<String, String>,
    }

    serde_json::from_slice::<Annotated>(raw)
        .map(|a| a.annotations)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn digest(data: &str) -> String {
        Digest::sha256(data.as_bytes()).to_string()
    }

    fn image(config_type: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "schemaVersion": 2,
            "mediaType": OCI_IMAGE_MANIFEST,
            "config": { "mediaType": config_type, "digest": digest("config"), "size": 6 },
            "layers": [
                { "mediaType": "application/vnd.oci.image.layer.v1.tar", "digest": digest("layer"), "size": 5 },
                { "mediaType": "application/vnd.oci.image.layer.v1.tar", "digest": digest("layer"), "size": 5 },
            ],
        }))
        .unwrap()
    }

    #[test]
    fn image_manifest_lists_config_and_layers() {
        let manifest = Manifest::parse(
            Some(OCI_IMAGE_MANIFEST),
            &image("application/vnd.oci.image.config.v1+json"),
        )
        .unwrap();
        assert_eq!(manifest.kind, ManifestKind::Image);
        assert_eq!(manifest.blobs.len(), 3);
        assert_eq!(manifest.blob_digests(), [digest("config"), digest("layer")]);
        assert_eq!(
            manifest.artifact_type.as_deref(),
            Some("application/vnd.oci.image.config.v1+json")
        );
    }

    #[test]
    fn helm_chart_is_recognised() {
        let manifest = Manifest::parse(None, &image(HELM_CONFIG)).unwrap();
        assert_eq!(manifest.kind, ManifestKind::HelmChart);
        assert_eq!(manifest.media_type, OCI_IMAGE_MANIFEST);
    }

    #[test]
    fn media_type_must_match_header() {
        let err = Manifest::parse(
            Some(OCI_IMAGE_INDEX),
            &image("application/vnd.oci.image.config.v1+json"),
        )
        .unwrap_err();
        assert_eq!(err.error_code(), "MANIFEST_INVALID");

        // parameters on the header are ignored
        Manifest::parse(
            Some("application/vnd.oci.image.manifest.v1+json; charset=utf-8"),
            &image("application/vnd.oci.image.config.v1+json"),
        )
        .unwrap();
    }

    #[test]
    fn index_lists_children() {
        let body = serde_json::to_vec(&json!({
            "schemaVersion": 2,
            "manifests": [
                { "mediaType": OCI_IMAGE_MANIFEST, "digest": digest("a"), "size": 10 },
                { "mediaType": OCI_IMAGE_MANIFEST, "digest": digest("b"), "size": 10 },
            ],
        }))
        .unwrap();
        let manifest = Manifest::parse(Some(OCI_IMAGE_INDEX), &body).unwrap();
        assert_eq!(manifest.kind, ManifestKind::Index);
        assert!(manifest.blobs.is_empty());
        assert_eq!(manifest.manifest_digests().len(), 2);
    }

    #[test]
    fn artifact_type_and_subject() {
        let body = serde_json::to_vec(&json!({
            "schemaVersion": 2,
            "mediaType": OCI_IMAGE_MANIFEST,
            "artifactType": "application/vnd.example.sbom",
            "config": { "mediaType": "application/vnd.oci.empty.v1+json", "digest": digest("{}"), "size": 2 },
            "layers": [],
            "subject": { "mediaType": OCI_IMAGE_MANIFEST, "digest": digest("s"), "size": 10 },
            "annotations": { "org.example": "yes" },
        }))
        .unwrap();
        let manifest = Manifest::parse(None, &body).unwrap();
        assert_eq!(manifest.artifact_type.as_deref(), Some("application/vnd.example.sbom"));
        assert_eq!(manifest.subject.unwrap().digest.to_string(), digest("s"));
        assert_eq!(annotations(&body)["org.example"], "yes");
    }

    #[test]
    fn unknown_types_still_enumerate_descriptors() {
        let body = serde_json::to_vec(&json!({
            "mediaType": "application/vnd.example.custom+json",
            "layers": [
                { "mediaType": "application/octet-stream", "digest": digest("x"), "size": 1 },
            ],
        }))
        .unwrap();
        let manifest = Manifest::parse(None, &body).unwrap();
        assert_eq!(manifest.kind, ManifestKind::Unknown);
        assert_eq!(manifest.blobs.len(), 1);
    }

    #[test]
    fn unknown_binary_documents_are_opaque() {
        let body = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0xff];
        let manifest =
            Manifest::parse(Some("application/vnd.example.blob; version=1"), &body).unwrap();
        assert_eq!(manifest.kind, ManifestKind::Unknown);
        assert_eq!(manifest.media_type, "application/vnd.example.blob");
        assert!(manifest.blob_digests().is_empty());
        assert!(manifest.manifest_digests().is_empty());
        assert!(manifest.subject.is_none());

        // a known type is still held to its format
        let err = Manifest::parse(Some(DOCKER_MANIFEST), &body).unwrap_err();
        assert_eq!(err.error_code(), "MANIFEST_INVALID");
        let err = Manifest::parse(None, &body).unwrap_err();
        assert_eq!(err.error_code(), "MANIFEST_INVALID");
    }

    #[test]
    fn malformed_documents_are_invalid() {
        for body in [&b"not json"[..], br#"{"config": {"digest": "nope"}}"#] {
            let err = Manifest::parse(Some(OCI_IMAGE_MANIFEST), body).unwrap_err();
            assert_eq!(err.error_code(), "MANIFEST_INVALID");
        }
        let err = Manifest::parse(Some(OCI_IMAGE_MANIFEST), br#"{"layers": []}"#).unwrap_err();
        assert_eq!(err.error_code(), "MANIFEST_INVALID");
    }
}
