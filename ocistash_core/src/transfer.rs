//! Copying manifest graphs between content targets.
//!
//! A [`Target`] is anything that can hand out and accept blobs by descriptor
//! and keep named references. Content calls carry the reference being
//! copied, which targets that scope blobs per repository need. [`GraphCopy`] moves one tagged manifest, with
//! every blob it reaches, from one target to another.

use crate::context::Context;
use crate::descriptor::{self, Descriptor, DescriptorExt, ImageManifest, annotations};
use crate::error::Result;
use crate::layout::OciLayout;
use std::collections::HashSet;
use std::io::Read;
use tracing::{debug, info};

/// Content-addressed source or destination of a copy.
pub trait Target: Send + Sync {
    /// Descriptor tagged with `name`.
    fn resolve(&self, name: &str) -> Result<Descriptor>;

    /// Stream the content of `desc`, reached from `reference`.
    fn fetch(&self, reference: &str, desc: &Descriptor) -> Result<Box<dyn Read + Send>>;

    /// Whether the target already holds `desc` for `reference`.
    fn exists(&self, reference: &str, desc: &Descriptor) -> Result<bool>;

    /// Store content for `desc` under `reference`, verifying it against the descriptor.
    fn push(&self, reference: &str, desc: &Descriptor, content: &mut dyn Read) -> Result<()>;

    /// Point `name` at `desc`.
    fn tag(&self, desc: &Descriptor, name: &str) -> Result<()>;
}

impl Target for OciLayout {
    fn resolve(&self, name: &str) -> Result<Descriptor> {
        OciLayout::resolve(self, name)
    }

    fn fetch(&self, _reference: &str, desc: &Descriptor) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(self.read_blob(&desc.content_digest()?)?))
    }

    fn exists(&self, _reference: &str, desc: &Descriptor) -> Result<bool> {
        Ok(self.blob_exists(&desc.content_digest()?))
    }

    fn push(&self, _reference: &str, desc: &Descriptor, content: &mut dyn Read) -> Result<()> {
        self.write_blob(desc, content)?;
        Ok(())
    }

    fn tag(&self, desc: &Descriptor, name: &str) -> Result<()> {
        OciLayout::tag(self, desc, name)?;
        Ok(())
    }
}

/// Options for a single copy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyOptions {
    /// Media types, beyond the standard manifest and index types, whose
    /// content is decoded as a manifest and whose children are copied too.
    pub additional_cached_media_types: Vec<String>,
}

impl CopyOptions {
    pub fn with_media_type(mut self, media_type: impl Into<String>) -> Self {
        let media_type = media_type.into();
        if !self.additional_cached_media_types.contains(&media_type) {
            self.additional_cached_media_types.push(media_type);
        }
        self
    }

    fn is_graph_node(&self, media_type: &str) -> bool {
        descriptor::is_manifest_media_type(media_type)
            || self
                .additional_cached_media_types
                .iter()
                .any(|m| m == media_type)
    }
}

/// Primitive that copies a referenced manifest and its blob closure.
///
/// Errors from either side are returned as raised; retrying is up to the
/// implementation.
pub trait Transfer: Send + Sync {
    /// Copy `src_ref` from `src` to `dst` as `dst_ref` (empty keeps the source name).
    fn copy(
        &self,
        ctx: &Context,
        src: &dyn Target,
        src_ref: &str,
        dst: &dyn Target,
        dst_ref: &str,
        opts: &CopyOptions,
    ) -> Result<Descriptor>;
}

/// Depth-first graph copy.
///
/// Children are pushed before the manifests that reference them, so a
/// destination never holds a manifest whose blobs are missing. Anything the
/// destination already has is skipped along with everything below it.
#[derive(Debug, Clone, Copy, Default)]
pub struct GraphCopy;

impl Transfer for GraphCopy {
    fn copy(
        &self,
        ctx: &Context,
        src: &dyn Target,
        src_ref: &str,
        dst: &dyn Target,
        dst_ref: &str,
        opts: &CopyOptions,
    ) -> Result<Descriptor> {
        ctx.check()?;

        let root = src
            .resolve(src_ref)?
            .without_annotation(annotations::REF_NAME);
        let name = if dst_ref.is_empty() { src_ref } else { dst_ref };

        let refs = CopyRefs { src: src_ref, dst: name };
        let mut visited = HashSet::new();
        let mut stats = CopyStats::default();
        copy_node(ctx, src, dst, &refs, &root, opts, &mut visited, &mut stats)?;

        dst.tag(&root, name)?;

        info!(
            from = src_ref,
            to = name,
            digest = %root.digest(),
            copied = stats.copied,
            skipped = stats.skipped,
            "copied reference"
        );
        Ok(root)
    }
}

#[derive(Debug, Default)]
struct CopyStats {
    copied: usize,
    skipped: usize,
}

struct CopyRefs<'a> {
    src: &'a str,
    dst: &'a str,
}

#[allow(clippy::too_many_arguments)]
fn copy_node(
    ctx: &Context,
    src: &dyn Target,
    dst: &dyn Target,
    refs: &CopyRefs<'_>,
    desc: &Descriptor,
    opts: &CopyOptions,
    visited: &mut HashSet<String>,
    stats: &mut CopyStats,
) -> Result<()> {
    ctx.check()?;

    if !visited.insert(desc.digest().to_string()) {
        return Ok(());
    }
    if dst.exists(refs.dst, desc)? {
        debug!(digest = %desc.digest(), "destination already has content");
        stats.skipped += 1;
        return Ok(());
    }

    if opts.is_graph_node(&desc.media_type_str()) {
        let mut data = Vec::new();
        src.fetch(refs.src, desc)?.read_to_end(&mut data)?;

        for child in graph_children(desc, &data)? {
            copy_node(ctx, src, dst, refs, &child, opts, visited, stats)?;
        }
        dst.push(refs.dst, desc, &mut data.as_slice())?;
    } else {
        let mut reader = src.fetch(refs.src, desc)?;
        dst.push(refs.dst, desc, &mut reader)?;
    }

    stats.copied += 1;
    Ok(())
}

fn graph_children(desc: &Descriptor, data: &[u8]) -> Result<Vec<Descriptor>> {
    if desc.is_manifest() {
        descriptor::children(desc, data)
    } else {
        let manifest: ImageManifest = serde_json::from_slice(data)?;
        Ok(descriptor::manifest_children(&manifest))
    }
}
