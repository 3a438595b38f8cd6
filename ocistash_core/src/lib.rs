//! # ocistash core
//!
//! A content-addressed artifact store built on the OCI image layout.
//!
//! Files, charts and images are normalized into OCI manifests and blobs,
//! staged in a private directory, and committed into a shared layout that any
//! OCI-layout tool can read. Stored references can be copied, with their full
//! blob closure, to other targets under new names.
//!
//! ## Features
//!
//! - Standard on-disk layout: `oci-layout`, `index.json`, `blobs/<alg>/<hex>`
//! - Every blob verified against its digest as it is written
//! - Staged adds: a failed add never touches the store
//! - Optional blob cache injected at construction
//! - Graph copy to any [`Target`], with reference relocation
//! - Registry target speaking the OCI distribution API
//! - Garbage collection of blobs orphaned by re-tags
//!
//! ## Example
//!
//! ```no_run
//! use ocistash_core::{Context, FileArtifact, OciLayout, Store, relocate};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let ctx = Context::background();
//! let store = Store::open("./store")?;
//!
//! // Add a file under a reference (no registry, tag defaults to `latest`)
//! let artifact = FileArtifact::from_path("./notes.md");
//! let desc = store.add_artifact(&ctx, &artifact, "docs/notes")?;
//! println!("{} -> {}", desc.digest(), store.identify(&desc));
//!
//! // Copy everything to another layout under a new registry
//! let target = OciLayout::create("./mirror")?;
//! let mapper = |name: &str| -> ocistash_core::Result<String> {
//!     Ok(relocate(name, "registry.example.com")?.name())
//! };
//! store.copy_all(&ctx, &target, Some(&mapper))?;
//!
//! // Drop blobs no reference reaches any more
//! let stats = store.gc(false)?;
//! println!("Deleted {} blobs", stats.blobs_deleted);
//! # Ok(())
//! # }
//! ```

mod artifact;
mod cache;
mod context;
mod descriptor;
mod digest;
mod error;
mod gc;
mod layout;
mod mapper;
mod reference;
mod registry;
mod staging;
mod store;
mod transfer;

pub use artifact::{
    Artifact, ArtifactCollection, ChartArtifact, ChartMetadata, Collection, FileArtifact,
    ImageArtifact, OciArtifact,
};
pub use cache::{Cache, CacheWriter, CachedArtifact, FsCache, wrap as wrap_cached};
pub use context::Context;
pub use descriptor::{
    Descriptor, DescriptorExt, ImageIndex, ImageManifest, LAYOUT_VERSION, LayoutMarker, MediaType,
    annotations, children, is_index_media_type, is_manifest_media_type, media_types,
};
pub use digest::{Algorithm, Digest, Digester};
pub use error::{Error, Result};
pub use gc::GcStats;
pub use layout::OciLayout;
pub use mapper::DirectoryTarget;
pub use reference::{DEFAULT_TAG, DOCKER_HUB_REGISTRY, Identifier, ParseOptions, Reference, relocate};
pub use registry::{Credentials, RegistryConfig, RegistryTarget};
pub use staging::Staging;
pub use store::Store;
pub use transfer::{CopyOptions, GraphCopy, Target, Transfer};
pub use tokio_util::sync::CancellationToken;
