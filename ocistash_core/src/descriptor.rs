//! OCI descriptors, manifests, indexes and the media types the store understands.
//!
//! The document types are the ones from `oci-spec`; this module adds the
//! digest-aware helpers the store needs on top of them.

use crate::digest::Digest;
use crate::error::Result;
use std::collections::HashMap;

pub use oci_spec::image::{
    Descriptor, ImageIndex, ImageManifest, MediaType, OciLayout as LayoutMarker,
};
use oci_spec::image::{ImageManifestBuilder, OciLayoutBuilder, SCHEMA_VERSION};

pub mod media_types {
    //! Media type constants.

    pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
    pub const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
    pub const OCI_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";
    pub const OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
    pub const OCI_EMPTY: &str = "application/vnd.oci.empty.v1+json";

    pub const DOCKER_MANIFEST_SCHEMA2: &str =
        "application/vnd.docker.distribution.manifest.v2+json";
    pub const DOCKER_MANIFEST_LIST: &str =
        "application/vnd.docker.distribution.manifest.list.v2+json";
    pub const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";

    pub const CHART_CONFIG: &str = "application/vnd.cncf.helm.config.v1+json";
    pub const CHART_LAYER: &str = "application/vnd.cncf.helm.chart.content.v1.tar+gzip";

    pub const FILE_CONFIG: &str = "application/vnd.ocistash.file.config.v1+json";
    pub const FILE_LAYER: &str = "application/vnd.ocistash.file.layer.v1";
}

pub mod annotations {
    //! Annotation keys.

    /// Name a manifest is tagged with inside `index.json`.
    pub const REF_NAME: &str = "org.opencontainers.image.ref.name";
    /// File name a layer should be materialized as.
    pub const TITLE: &str = "org.opencontainers.image.title";
}

/// Layout version written to new `oci-layout` markers.
pub const LAYOUT_VERSION: &str = "1.0.0";

/// Whether bytes of this media type reference further descriptors.
pub fn is_manifest_media_type(media_type: &str) -> bool {
    matches!(
        media_type,
        media_types::OCI_MANIFEST
            | media_types::OCI_INDEX
            | media_types::DOCKER_MANIFEST_SCHEMA2
            | media_types::DOCKER_MANIFEST_LIST
    )
}

/// Whether bytes of this media type are an index of manifests.
pub fn is_index_media_type(media_type: &str) -> bool {
    matches!(
        media_type,
        media_types::OCI_INDEX | media_types::DOCKER_MANIFEST_LIST
    )
}

/// Store-side view of an OCI [`Descriptor`].
///
/// `oci-spec` keeps the digest as a string and the size as a signed integer;
/// the store works with a parsed [`Digest`] and an unsigned size.
pub trait DescriptorExt: Sized {
    /// Descriptor for content of `size` bytes hashing to `digest`.
    fn for_digest(media_type: &str, digest: &Digest, size: u64) -> Self;

    /// Descriptor for `data`, hashed with SHA-256.
    fn for_bytes(media_type: &str, data: &[u8]) -> Self {
        Self::for_digest(media_type, &Digest::sha256(data), data.len() as u64)
    }

    /// The digest, parsed and validated.
    fn content_digest(&self) -> Result<Digest>;

    /// Declared size in bytes; negative sizes read as zero.
    fn content_size(&self) -> u64;

    /// Media type as its wire string.
    fn media_type_str(&self) -> String;

    fn annotation(&self, key: &str) -> Option<&str>;

    fn with_annotation(self, key: impl Into<String>, value: impl Into<String>) -> Self;

    fn without_annotation(self, key: &str) -> Self;

    /// The `org.opencontainers.image.ref.name` annotation.
    fn ref_name(&self) -> Option<&str> {
        self.annotation(annotations::REF_NAME)
    }

    /// The `org.opencontainers.image.title` annotation.
    fn title(&self) -> Option<&str> {
        self.annotation(annotations::TITLE)
    }

    fn is_manifest(&self) -> bool {
        is_manifest_media_type(&self.media_type_str())
    }

    fn is_index(&self) -> bool {
        is_index_media_type(&self.media_type_str())
    }
}

impl DescriptorExt for Descriptor {
    fn for_digest(media_type: &str, digest: &Digest, size: u64) -> Self {
        Descriptor::new(
            MediaType::from(media_type),
            i64::try_from(size).unwrap_or(i64::MAX),
            digest.to_string(),
        )
    }

    fn content_digest(&self) -> Result<Digest> {
        Digest::parse(self.digest())
    }

    fn content_size(&self) -> u64 {
        u64::try_from(self.size().to_owned()).unwrap_or(0)
    }

    fn media_type_str(&self) -> String {
        self.media_type().to_string()
    }

    fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations()
            .as_ref()
            .and_then(|map| map.get(key))
            .map(String::as_str)
    }

    fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut map = self.annotations().clone().unwrap_or_default();
        map.insert(key.into(), value.into());
        self.set_annotations(Some(map));
        self
    }

    fn without_annotation(mut self, key: &str) -> Self {
        let mut map: HashMap<String, String> = self.annotations().clone().unwrap_or_default();
        map.remove(key);
        self.set_annotations(if map.is_empty() { None } else { Some(map) });
        self
    }
}

/// An image manifest with `config` and `layers`, in that order.
pub fn image_manifest(config: Descriptor, layers: Vec<Descriptor>) -> Result<ImageManifest> {
    Ok(ImageManifestBuilder::default()
        .schema_version(SCHEMA_VERSION)
        .media_type(MediaType::ImageManifest)
        .config(config)
        .layers(layers)
        .build()?)
}

/// An index with no manifests.
pub fn empty_index() -> ImageIndex {
    let mut index = ImageIndex::default();
    index.set_schema_version(SCHEMA_VERSION);
    index.set_media_type(Some(MediaType::ImageIndex));
    index.set_manifests(Vec::new());
    index
}

/// The marker written to `oci-layout`.
pub fn layout_marker() -> Result<LayoutMarker> {
    Ok(OciLayoutBuilder::default()
        .image_layout_version(LAYOUT_VERSION)
        .build()?)
}

/// Serialized manifest bytes. Descriptors produced by the store carry at most
/// one annotation, so the output is stable for a given manifest.
pub fn manifest_bytes(manifest: &ImageManifest) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(manifest)?)
}

/// Config first, then layers.
pub fn manifest_children(manifest: &ImageManifest) -> Vec<Descriptor> {
    let mut children = Vec::with_capacity(manifest.layers().len() + 1);
    children.push(manifest.config().clone());
    children.extend(manifest.layers().iter().cloned());
    children
}

/// Descriptors referenced by the bytes of `desc`.
///
/// Indexes yield their manifests, manifests their config and layers, and
/// anything else nothing.
pub fn children(desc: &Descriptor, data: &[u8]) -> Result<Vec<Descriptor>> {
    if desc.is_index() {
        let index: ImageIndex = serde_json::from_slice(data)?;
        return Ok(index.manifests().clone());
    }
    if desc.is_manifest() {
        let manifest: ImageManifest = serde_json::from_slice(data)?;
        return Ok(manifest_children(&manifest));
    }
    Ok(Vec::new())
}
