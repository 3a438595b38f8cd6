use super::OciArtifact;
use crate::descriptor::{self, Descriptor, DescriptorExt, ImageManifest, annotations};
use crate::error::{Error, Result};
use crate::layout::OciLayout;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

/// An image manifest read from an existing OCI layout directory.
///
/// Manifest bytes are passed through untouched, so the image keeps its digest.
#[derive(Debug, Clone)]
pub struct ImageArtifact {
    layout: Arc<OciLayout>,
    desc: Descriptor,
    raw: Vec<u8>,
    manifest: ImageManifest,
}

impl ImageArtifact {
    /// Open the image tagged `ref_name` in the layout at `dir`.
    ///
    /// Without a name the layout must hold exactly one manifest.
    pub fn open<P: AsRef<Path>>(dir: P, ref_name: Option<&str>) -> Result<Self> {
        let layout = OciLayout::open(dir)?;

        let desc = match ref_name {
            Some(name) => layout.resolve(name)?,
            None => {
                let mut manifests = layout.index()?.manifests().clone();
                if manifests.len() != 1 {
                    return Err(Error::invalid_layout(
                        layout.root(),
                        format!(
                            "expected a single manifest, found {}; name one explicitly",
                            manifests.len()
                        ),
                    ));
                }
                manifests.remove(0)
            }
        };
        let desc = desc.without_annotation(annotations::REF_NAME);

        if desc.is_index() || !desc.is_manifest() {
            return Err(Error::unsupported_media_type(desc.media_type_str()));
        }

        let raw = layout.read_blob_bytes(&desc.content_digest()?)?;
        let manifest: ImageManifest = serde_json::from_slice(&raw)?;

        Ok(Self {
            layout: Arc::new(layout),
            desc,
            raw,
            manifest,
        })
    }
}

impl OciArtifact for ImageArtifact {
    fn media_type(&self) -> String {
        self.desc.media_type_str()
    }

    fn manifest(&self) -> Result<ImageManifest> {
        Ok(self.manifest.clone())
    }

    fn raw_manifest(&self) -> Result<Vec<u8>> {
        Ok(self.raw.clone())
    }

    fn raw_config(&self) -> Result<Vec<u8>> {
        self.layout
            .read_blob_bytes(&self.manifest.config().content_digest()?)
    }

    fn blob(&self, desc: &Descriptor) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(self.layout.read_blob(&desc.content_digest()?)?))
    }
}
