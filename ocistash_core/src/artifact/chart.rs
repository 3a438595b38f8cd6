use super::{OciArtifact, SharedBytes};
use crate::descriptor::{self, Descriptor, DescriptorExt, ImageManifest, annotations, media_types};
use crate::error::{Error, Result};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{Cursor, Read};
use std::path::Path;

/// Chart metadata, as read from `Chart.yaml` and stored as the config blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartMetadata {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Remaining fields, kept as they were.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A packaged chart (`.tgz`) as a one-layer manifest.
#[derive(Debug, Clone)]
pub struct ChartArtifact {
    archive: SharedBytes,
    metadata: ChartMetadata,
    config: Vec<u8>,
}

impl ChartArtifact {
    /// Read a packaged chart from disk.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let archive = fs::read(path).map_err(|e| {
            Error::artifact_production(format!("reading chart {}: {e}", path.display()))
        })?;
        Self::from_bytes(archive)
    }

    /// Use an in-memory chart archive.
    pub fn from_bytes(archive: Vec<u8>) -> Result<Self> {
        let metadata = read_chart_metadata(&archive)?;
        let config = serde_json::to_vec(&metadata)?;
        Ok(Self {
            archive: SharedBytes::new(archive),
            metadata,
            config,
        })
    }

    pub fn metadata(&self) -> &ChartMetadata {
        &self.metadata
    }

    /// `name:version`, with `+` (not allowed in tags) replaced by `_`.
    pub fn default_reference(&self) -> String {
        format!(
            "{}:{}",
            self.metadata.name,
            self.metadata.version.replace('+', "_")
        )
    }

    fn layer(&self) -> Descriptor {
        Descriptor::for_bytes(media_types::CHART_LAYER, self.archive.as_ref()).with_annotation(
            annotations::TITLE,
            format!("{}-{}.tgz", self.metadata.name, self.metadata.version),
        )
    }
}

impl OciArtifact for ChartArtifact {
    fn media_type(&self) -> String {
        media_types::OCI_MANIFEST.to_string()
    }

    fn manifest(&self) -> Result<ImageManifest> {
        let config = Descriptor::for_bytes(media_types::CHART_CONFIG, &self.config);
        descriptor::image_manifest(config, vec![self.layer()])
    }

    fn raw_config(&self) -> Result<Vec<u8>> {
        Ok(self.config.clone())
    }

    fn blob(&self, desc: &Descriptor) -> Result<Box<dyn Read + Send>> {
        if desc.digest() == self.layer().digest() {
            return Ok(self.archive.reader());
        }
        if desc.content_digest()? == crate::digest::Digest::sha256(&self.config) {
            return Ok(Box::new(Cursor::new(self.config.clone())));
        }
        Err(Error::not_found(format!(
            "blob {} in chart {}",
            desc.digest(),
            self.metadata.name
        )))
    }
}

/// Find `<chart>/Chart.yaml` at the top of a gzipped tarball.
fn read_chart_metadata(archive: &[u8]) -> Result<ChartMetadata> {
    let mut tar = tar::Archive::new(GzDecoder::new(archive));
    let entries = tar
        .entries()
        .map_err(|e| Error::artifact_production(format!("reading chart archive: {e}")))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| Error::artifact_production(format!("reading chart archive: {e}")))?;
        let path = entry
            .path()
            .map_err(|e| Error::artifact_production(format!("reading chart archive: {e}")))?
            .into_owned();

        let components: Vec<_> = path.components().collect();
        if components.len() != 2 || components[1].as_os_str() != "Chart.yaml" {
            continue;
        }

        let mut yaml = String::new();
        entry.read_to_string(&mut yaml)?;
        let metadata: ChartMetadata = serde_yaml::from_str(&yaml)
            .map_err(|e| Error::artifact_production(format!("parsing Chart.yaml: {e}")))?;
        if metadata.name.is_empty() || metadata.version.is_empty() {
            return Err(Error::artifact_production(
                "Chart.yaml must set name and version",
            ));
        }
        return Ok(metadata);
    }

    Err(Error::artifact_production("archive has no Chart.yaml"))
}
