//! Artifacts: producers of OCI manifests and the blobs they reference.
//!
//! Anything implementing [`OciArtifact`] can be added to a store. The
//! built-in kinds are gathered in the closed [`Artifact`] enum.

mod chart;
mod file;
mod image;

pub use chart::{ChartArtifact, ChartMetadata};
pub use file::FileArtifact;
pub use image::ImageArtifact;

use crate::descriptor::{self, Descriptor, DescriptorExt, ImageManifest};
use crate::error::Result;
use std::io::{Cursor, Read};
use std::sync::Arc;

/// Capability every ingestible artifact provides.
///
/// Failures are reported as [`Error::ArtifactProduction`](crate::Error::ArtifactProduction)
/// by the staging layer, whatever the producer returned.
pub trait OciArtifact: Send + Sync {
    /// Media type of the manifest document.
    fn media_type(&self) -> String;

    /// The manifest describing config and layers.
    fn manifest(&self) -> Result<ImageManifest>;

    /// Exact manifest bytes; the manifest digest is computed over these.
    fn raw_manifest(&self) -> Result<Vec<u8>> {
        descriptor::manifest_bytes(&self.manifest()?)
    }

    /// Config blob bytes.
    fn raw_config(&self) -> Result<Vec<u8>>;

    /// Stream the bytes of one blob the manifest references.
    fn blob(&self, desc: &Descriptor) -> Result<Box<dyn Read + Send>>;

    /// Descriptor of the manifest document.
    fn descriptor(&self) -> Result<Descriptor> {
        Ok(Descriptor::for_bytes(&self.media_type(), &self.raw_manifest()?))
    }
}

impl<T: OciArtifact + ?Sized> OciArtifact for &T {
    fn media_type(&self) -> String {
        (**self).media_type()
    }

    fn manifest(&self) -> Result<ImageManifest> {
        (**self).manifest()
    }

    fn raw_manifest(&self) -> Result<Vec<u8>> {
        (**self).raw_manifest()
    }

    fn raw_config(&self) -> Result<Vec<u8>> {
        (**self).raw_config()
    }

    fn blob(&self, desc: &Descriptor) -> Result<Box<dyn Read + Send>> {
        (**self).blob(desc)
    }

    fn descriptor(&self) -> Result<Descriptor> {
        (**self).descriptor()
    }
}

/// In-memory payload shared between an artifact and the readers it hands out.
#[derive(Debug, Clone)]
pub(crate) struct SharedBytes(Arc<Vec<u8>>);

impl SharedBytes {
    pub(crate) fn new(data: Vec<u8>) -> Self {
        Self(Arc::new(data))
    }

    /// Reader over the payload; the bytes themselves are not copied.
    pub(crate) fn reader(&self) -> Box<dyn Read + Send> {
        Box::new(Cursor::new(self.clone()))
    }

    #[cfg(test)]
    pub(crate) fn readers(&self) -> usize {
        Arc::strong_count(&self.0) - 1
    }
}

impl AsRef<[u8]> for SharedBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Built-in artifact kinds.
#[derive(Debug, Clone)]
pub enum Artifact {
    /// A single file wrapped in a one-layer manifest.
    File(FileArtifact),
    /// An image already laid out as OCI content.
    Image(ImageArtifact),
    /// A packaged chart archive.
    Chart(ChartArtifact),
}

impl Artifact {
    /// Short kind name, used in listings.
    pub fn kind(&self) -> &'static str {
        match self {
            Artifact::File(_) => "file",
            Artifact::Image(_) => "image",
            Artifact::Chart(_) => "chart",
        }
    }

    fn inner(&self) -> &dyn OciArtifact {
        match self {
            Artifact::File(a) => a,
            Artifact::Image(a) => a,
            Artifact::Chart(a) => a,
        }
    }
}

impl OciArtifact for Artifact {
    fn media_type(&self) -> String {
        self.inner().media_type()
    }

    fn manifest(&self) -> Result<ImageManifest> {
        self.inner().manifest()
    }

    fn raw_manifest(&self) -> Result<Vec<u8>> {
        self.inner().raw_manifest()
    }

    fn raw_config(&self) -> Result<Vec<u8>> {
        self.inner().raw_config()
    }

    fn blob(&self, desc: &Descriptor) -> Result<Box<dyn Read + Send>> {
        self.inner().blob(desc)
    }
}

impl From<FileArtifact> for Artifact {
    fn from(artifact: FileArtifact) -> Self {
        Artifact::File(artifact)
    }
}

impl From<ImageArtifact> for Artifact {
    fn from(artifact: ImageArtifact) -> Self {
        Artifact::Image(artifact)
    }
}

impl From<ChartArtifact> for Artifact {
    fn from(artifact: ChartArtifact) -> Self {
        Artifact::Chart(artifact)
    }
}

/// A group of artifacts added together, each under its own reference.
pub trait Collection {
    /// `(reference, artifact)` pairs in the order they should be added.
    fn contents(&self) -> Result<Vec<(String, Artifact)>>;
}

/// Ordered in-memory collection.
#[derive(Debug, Clone, Default)]
pub struct ArtifactCollection {
    items: Vec<(String, Artifact)>,
}

impl ArtifactCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, reference: impl Into<String>, artifact: impl Into<Artifact>) {
        self.items.push((reference.into(), artifact.into()));
    }

    pub fn with(mut self, reference: impl Into<String>, artifact: impl Into<Artifact>) -> Self {
        self.push(reference, artifact);
        self
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl Collection for ArtifactCollection {
    fn contents(&self) -> Result<Vec<(String, Artifact)>> {
        Ok(self.items.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::media_types;

    #[test]
    fn test_enum_dispatch_matches_inner() {
        let file = FileArtifact::from_bytes("hello.txt", b"hello".to_vec());
        let artifact = Artifact::from(file.clone());

        assert_eq!(artifact.kind(), "file");
        assert_eq!(artifact.media_type(), media_types::OCI_MANIFEST);
        assert_eq!(
            artifact.descriptor().unwrap(),
            file.descriptor().unwrap()
        );
    }

    #[test]
    fn test_collection_keeps_order() {
        let collection = ArtifactCollection::new()
            .with("b:v1", FileArtifact::from_bytes("b", b"b".to_vec()))
            .with("a:v1", FileArtifact::from_bytes("a", b"a".to_vec()));

        let refs: Vec<String> = collection
            .contents()
            .unwrap()
            .into_iter()
            .map(|(r, _)| r)
            .collect();
        assert_eq!(refs, vec!["b:v1", "a:v1"]);
        assert_eq!(collection.len(), 2);
    }

    #[test]
    fn test_descriptor_hashes_raw_manifest() {
        let file = FileArtifact::from_bytes("x", b"x".to_vec());
        let raw = file.raw_manifest().unwrap();
        let desc = file.descriptor().unwrap();
        assert_eq!(desc.content_size(), raw.len() as u64);
        assert_eq!(desc.content_digest().unwrap(), crate::digest::Digest::sha256(&raw));
    }
}
