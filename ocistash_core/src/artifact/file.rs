use super::{OciArtifact, SharedBytes};
use crate::descriptor::{self, Descriptor, DescriptorExt, ImageManifest, annotations, media_types};
use crate::digest::{Algorithm, Digest};
use crate::error::{Error, Result};
use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Config blob of every file artifact.
const FILE_CONFIG_BYTES: &[u8] = b"{}";

#[derive(Debug, Clone)]
enum Source {
    Bytes(SharedBytes),
    Path(PathBuf),
}

/// A single file as a one-layer manifest.
///
/// The manifest carries no timestamps, so adding the same content under the
/// same name twice produces the same digest.
#[derive(Debug, Clone)]
pub struct FileArtifact {
    name: String,
    source: Source,
    layer: OnceLock<Descriptor>,
}

impl FileArtifact {
    /// In-memory content named `name`.
    pub fn from_bytes(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            source: Source::Bytes(SharedBytes::new(data)),
            layer: OnceLock::new(),
        }
    }

    /// Content read from `path` when the artifact is staged.
    ///
    /// The layer is titled with the file name.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        Self {
            name,
            source: Source::Path(path),
            layer: OnceLock::new(),
        }
    }

    /// Override the layer title.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self.layer = OnceLock::new();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn open(&self) -> Result<Box<dyn Read + Send>> {
        match &self.source {
            Source::Bytes(data) => Ok(data.reader()),
            Source::Path(path) => {
                let file = fs::File::open(path).map_err(|e| {
                    Error::artifact_production(format!("opening {}: {e}", path.display()))
                })?;
                Ok(Box::new(file))
            }
        }
    }

    fn layer(&self) -> Result<Descriptor> {
        if let Some(layer) = self.layer.get() {
            return Ok(layer.clone());
        }

        let (digest, size) = match &self.source {
            Source::Bytes(data) => (Digest::sha256(data.as_ref()), data.as_ref().len() as u64),
            Source::Path(path) => {
                let file = fs::File::open(path).map_err(|e| {
                    Error::artifact_production(format!("opening {}: {e}", path.display()))
                })?;
                let size = file.metadata()?.len();
                (Digest::from_reader(Algorithm::Sha256, file)?, size)
            }
        };
        let layer = Descriptor::for_digest(media_types::FILE_LAYER, &digest, size)
            .with_annotation(annotations::TITLE, self.name.clone());

        let _ = self.layer.set(layer.clone());
        Ok(layer)
    }

    fn config(&self) -> Descriptor {
        Descriptor::for_bytes(media_types::FILE_CONFIG, FILE_CONFIG_BYTES)
    }
}

impl OciArtifact for FileArtifact {
    fn media_type(&self) -> String {
        media_types::OCI_MANIFEST.to_string()
    }

    fn manifest(&self) -> Result<ImageManifest> {
        descriptor::image_manifest(self.config(), vec![self.layer()?])
    }

    fn raw_config(&self) -> Result<Vec<u8>> {
        Ok(FILE_CONFIG_BYTES.to_vec())
    }

    fn blob(&self, desc: &Descriptor) -> Result<Box<dyn Read + Send>> {
        if desc.digest() == self.config().digest() {
            return Ok(Box::new(Cursor::new(FILE_CONFIG_BYTES)));
        }
        if desc.digest() == self.layer()?.digest() {
            return self.open();
        }
        Err(Error::not_found(format!(
            "blob {} in file {}",
            desc.digest(),
            self.name
        )))
    }
}
