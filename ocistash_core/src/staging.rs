//! Per-artifact staging area.
//!
//! An artifact is first written into a private OCI layout in a temporary
//! directory. Only once every blob is there and verified is the content
//! copied into the store and the reference tagged, so a failed add leaves
//! the store as it was.

use crate::artifact::OciArtifact;
use crate::context::Context;
use crate::descriptor::{self, Descriptor, DescriptorExt, ImageManifest};
use crate::error::{Error, Result};
use crate::layout::OciLayout;
use crate::reference::{Identifier, ParseOptions, Reference};
use std::io::{self, Read};
use std::path::Path;
use tempfile::TempDir;
use tracing::{debug, info};

/// What one `add` left in the staging layout.
#[derive(Debug, Clone)]
struct Staged {
    name: String,
    manifest: Descriptor,
    children: Vec<Descriptor>,
}

/// Throwaway OCI layout holding exactly one artifact.
///
/// The directory is removed when the value is dropped.
#[derive(Debug)]
pub struct Staging {
    layout: OciLayout,
    staged: Option<Staged>,
    // Dropped last so the layout never outlives its directory.
    dir: TempDir,
}

impl Staging {
    pub fn new() -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("ocistash-stage-")
            .tempdir()?;
        let layout = OciLayout::create(dir.path())?;
        Ok(Self {
            layout,
            staged: None,
            dir,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write `artifact` into the staging layout under `reference`.
    ///
    /// The reference gets no implicit registry and defaults to tag `latest`.
    /// A digest-form reference must name the manifest being staged.
    pub fn add(
        &mut self,
        ctx: &Context,
        artifact: &dyn OciArtifact,
        reference: &str,
    ) -> Result<Descriptor> {
        if self.staged.is_some() {
            return Err(Error::invalid_layout(
                self.dir.path(),
                "staging area already holds an artifact",
            ));
        }
        ctx.check()?;

        let reference = Reference::parse_with(reference, &ParseOptions::store())?;

        let raw = artifact.raw_manifest().map_err(Error::into_production)?;
        let manifest: ImageManifest = serde_json::from_slice(&raw)
            .map_err(|e| Error::from(e).into_production())?;
        let desc = Descriptor::for_bytes(&artifact.media_type(), &raw);

        if let Identifier::Digest(digest) = reference.identifier()
            && *digest != desc.content_digest()?
        {
            return Err(Error::digest_mismatch(
                digest.to_string(),
                desc.digest().clone(),
            ));
        }

        let config = artifact.raw_config().map_err(Error::into_production)?;
        ctx.check()?;
        self.layout.write_bytes(manifest.config(), &config)?;

        for layer in manifest.layers() {
            ctx.check()?;
            if self.layout.blob_exists(&layer.content_digest()?) {
                continue;
            }

            let reader = artifact.blob(layer).map_err(Error::into_production)?;
            let mut producer = ProducerReader::new(reader);
            if let Err(e) = self.layout.write_blob(layer, &mut producer) {
                return Err(match producer.failure.take() {
                    Some(reason) => Error::artifact_production(format!(
                        "reading layer {}: {reason}",
                        layer.digest()
                    )),
                    None => e,
                });
            }
        }

        self.layout.write_bytes(&desc, &raw)?;
        let name = reference.name();
        self.layout.tag(&desc, &name)?;
        debug!(reference = %name, digest = %desc.digest(), "artifact staged");

        self.staged = Some(Staged {
            name,
            manifest: desc.clone(),
            children: descriptor::manifest_children(&manifest),
        });
        Ok(desc)
    }

    /// Copy the staged artifact into `store` and tag it there.
    ///
    /// Blobs go first and the manifest last; the index is only touched once
    /// all of them are in place. Blobs the store already has are skipped.
    pub fn commit(mut self, ctx: &Context, store: &OciLayout) -> Result<Descriptor> {
        let staged = self
            .staged
            .take()
            .ok_or_else(|| Error::not_found("staged artifact"))?;

        store.ensure()?;

        let mut written = 0usize;
        for desc in staged
            .children
            .iter()
            .chain(std::iter::once(&staged.manifest))
        {
            ctx.check()?;
            let digest = desc.content_digest()?;
            if store.blob_exists(&digest) {
                continue;
            }
            let blob = self.layout.read_blob(&digest)?;
            if store.write_blob(desc, blob)? {
                written += 1;
            }
        }

        ctx.check()?;
        store.tag(&staged.manifest, &staged.name)?;
        info!(
            reference = %staged.name,
            digest = %staged.manifest.digest(),
            blobs_written = written,
            "committed artifact"
        );
        Ok(staged.manifest)
    }
}

/// Remembers the first read error so producer failures can be told apart
/// from failures writing into the staging directory.
struct ProducerReader<R> {
    inner: R,
    failure: Option<String>,
}

impl<R: Read> ProducerReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            failure: None,
        }
    }
}

impl<R: Read> Read for ProducerReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.inner.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Err(e),
            Err(e) => {
                self.failure.get_or_insert_with(|| e.to_string());
                Err(e)
            }
        }
    }
}
