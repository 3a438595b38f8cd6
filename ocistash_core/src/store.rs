//! The persistent content store.

use crate::artifact::{Collection, OciArtifact};
use crate::cache::{self, Cache};
use crate::context::Context;
use crate::descriptor::{Descriptor, DescriptorExt, media_types};
use crate::error::{Error, Result};
use crate::layout::{BLOBS_DIR, INDEX_FILE, LAYOUT_FILE, OciLayout};
use crate::reference::{ParseOptions, Reference};
use crate::staging::Staging;
use crate::transfer::{CopyOptions, GraphCopy, Target, Transfer};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Content-addressed artifact store backed by an OCI image layout.
///
/// A `Store` is shared freely between threads. Adds for distinct references
/// never interfere; adds for the same tag race and the last one wins.
pub struct Store {
    layout: OciLayout,
    cache: Option<Arc<dyn Cache>>,
    transfer: Arc<dyn Transfer>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("root", &self.layout.root())
            .field("cache", &self.cache.is_some())
            .finish()
    }
}

impl Store {
    /// Open the store at `root`, creating the layout if it does not exist.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let store = Self::at(root);
        store.layout.ensure()?;
        Ok(store)
    }

    /// Handle on the store at `root` without creating anything.
    ///
    /// A missing layout reads as empty. Adds still create it on commit.
    pub fn at<P: AsRef<Path>>(root: P) -> Self {
        Self {
            layout: OciLayout::at(root),
            cache: None,
            transfer: Arc::new(GraphCopy),
        }
    }

    /// Serve artifact blobs through `cache` when adding.
    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Use `transfer` for `copy` and `copy_all` instead of [`GraphCopy`].
    pub fn with_transfer(mut self, transfer: Arc<dyn Transfer>) -> Self {
        self.transfer = transfer;
        self
    }

    /// Get the store root directory.
    pub fn root(&self) -> &Path {
        self.layout.root()
    }

    /// The underlying layout.
    pub fn layout(&self) -> &OciLayout {
        &self.layout
    }

    /// Stage `artifact` and commit it under `reference`.
    pub fn add_artifact(
        &self,
        ctx: &Context,
        artifact: &dyn OciArtifact,
        reference: &str,
    ) -> Result<Descriptor> {
        let mut staging = Staging::new()?;
        match &self.cache {
            Some(cache) => {
                let cached = cache::wrap(artifact, Arc::clone(cache));
                staging.add(ctx, &cached, reference)?;
            }
            None => {
                staging.add(ctx, artifact, reference)?;
            }
        }
        staging.commit(ctx, &self.layout)
    }

    /// Add every artifact of `collection` in order.
    ///
    /// Stops at the first failure. Artifacts added before it stay in the store.
    pub fn add_collection(
        &self,
        ctx: &Context,
        collection: &dyn Collection,
    ) -> Result<Vec<Descriptor>> {
        let contents = collection.contents()?;
        let mut descs = Vec::with_capacity(contents.len());
        for (reference, artifact) in &contents {
            descs.push(self.add_artifact(ctx, artifact, reference)?);
        }
        Ok(descs)
    }

    /// Remove all store content.
    ///
    /// Only `blobs/`, `index.json` and `oci-layout` are deleted; the root
    /// directory and anything else in it stay.
    pub fn flush(&self, ctx: &Context) -> Result<()> {
        ctx.check()?;
        let root = self.root();

        remove_path(&root.join(BLOBS_DIR))?;
        remove_path(&root.join(INDEX_FILE))?;
        remove_path(&root.join(LAYOUT_FILE))?;

        info!(root = %root.display(), "store flushed");
        Ok(())
    }

    /// Open the content of `desc` for reading.
    pub fn open_blob(&self, desc: &Descriptor) -> Result<fs::File> {
        self.layout.read_blob(&desc.content_digest()?)
    }

    /// Call `visit` for each indexed manifest, in index order.
    ///
    /// The index is read once up front; the first error from `visit` stops the walk.
    pub fn walk<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(&Descriptor) -> Result<()>,
    {
        for desc in self.layout.index()?.manifests() {
            visit(desc)?;
        }
        Ok(())
    }

    /// Tagged references and their descriptors, in index order.
    pub fn references(&self) -> Result<Vec<(String, Descriptor)>> {
        self.layout.references()
    }

    /// Descriptor for `reference`.
    ///
    /// Exact index names match first; otherwise the reference is normalized
    /// the way adds normalize it (`myrepo` finds `myrepo:latest`).
    pub fn resolve(&self, reference: &str) -> Result<Descriptor> {
        let name = self.resolve_name(reference)?;
        self.layout.resolve(&name)
    }

    fn resolve_name(&self, reference: &str) -> Result<String> {
        match self.layout.resolve(reference) {
            Ok(_) => Ok(reference.to_string()),
            Err(e) if e.is_not_found() => {
                Ok(Reference::parse_with(reference, &ParseOptions::store())?.name())
            }
            Err(e) => Err(e),
        }
    }

    /// Copy `reference` and everything it references to `target`.
    ///
    /// An empty `target_reference` keeps the store's name.
    pub fn copy(
        &self,
        ctx: &Context,
        reference: &str,
        target: &dyn Target,
        target_reference: &str,
    ) -> Result<Descriptor> {
        let name = self.resolve_name(reference)?;
        let opts = CopyOptions::default().with_media_type(media_types::DOCKER_MANIFEST_SCHEMA2);
        self.transfer
            .copy(ctx, &self.layout, &name, target, target_reference, &opts)
    }

    /// Copy every reference to `target`.
    ///
    /// `mapper` computes each destination name; without one, names are kept.
    /// The first mapper or copy error stops the run, and references copied
    /// before it stay copied.
    pub fn copy_all(
        &self,
        ctx: &Context,
        target: &dyn Target,
        mapper: Option<&dyn Fn(&str) -> Result<String>>,
    ) -> Result<()> {
        for (name, _) in self.references()? {
            ctx.check()?;
            let to = match mapper {
                Some(mapper) => mapper(&name)?,
                None => String::new(),
            };
            self.copy(ctx, &name, target, &to)?;
        }
        Ok(())
    }

    /// Copy `src_ref` and everything it references from `source` into the
    /// store, tagged as `reference`.
    pub fn pull(
        &self,
        ctx: &Context,
        source: &dyn Target,
        src_ref: &str,
        reference: &str,
    ) -> Result<Descriptor> {
        let name = Reference::parse_with(reference, &ParseOptions::store())?.name();
        self.layout.ensure()?;
        let opts = CopyOptions::default().with_media_type(media_types::DOCKER_MANIFEST_SCHEMA2);
        let desc = self
            .transfer
            .copy(ctx, source, src_ref, &self.layout, &name, &opts)?;
        info!(from = src_ref, reference = %name, digest = %desc.digest(), "pulled");
        Ok(desc)
    }

    /// Config media type of the manifest `desc` points at.
    ///
    /// Returns an empty string when the content is missing or is not a
    /// manifest with a config.
    pub fn identify(&self, desc: &Descriptor) -> String {
        #[derive(Deserialize)]
        struct Config {
            #[serde(rename = "mediaType", default)]
            media_type: String,
        }
        #[derive(Deserialize)]
        struct ConfigBearing {
            config: Option<Config>,
        }

        let file = match desc
            .content_digest()
            .and_then(|digest| self.layout.read_blob(&digest))
        {
            Ok(file) => file,
            Err(e) => {
                debug!(digest = %desc.digest(), error = %e, "identify: content unavailable");
                return String::new();
            }
        };
        match serde_json::from_reader::<_, ConfigBearing>(std::io::BufReader::new(file)) {
            Ok(doc) => doc.config.map(|c| c.media_type).unwrap_or_default(),
            Err(_) => String::new(),
        }
    }

    /// On-disk path of a stored blob given its digest string.
    pub fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        let digest = crate::digest::Digest::parse(digest)?;
        let path = self.layout.blob_path(&digest);
        if !path.is_file() {
            return Err(Error::not_found(format!("blob {digest}")));
        }
        Ok(path)
    }
}

fn remove_path(path: &Path) -> Result<()> {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{ArtifactCollection, ChartArtifact, FileArtifact, ImageArtifact};
    use crate::cache::FsCache;
    use crate::descriptor;
    use crate::digest::{Algorithm, Digest};
    use crate::reference::{Identifier, relocate};
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Read;
    use std::sync::Mutex;
    use std::thread;
    use tempfile::TempDir;

    fn new_store() -> (TempDir, Store) {
        let temp_dir = TempDir::new().unwrap();
        let store = Store::open(temp_dir.path().join("store")).unwrap();
        (temp_dir, store)
    }

    fn hello() -> FileArtifact {
        FileArtifact::from_bytes("hello.txt", b"hello".to_vec())
    }

    /// Lay out a one-layer image under `dir`, tagged `name`.
    fn image_layout(dir: &Path, name: &str) -> Descriptor {
        let layout = OciLayout::create(dir).unwrap();
        let config_bytes = br#"{"architecture":"arm64","os":"linux"}"#;
        let config = Descriptor::for_bytes(media_types::OCI_CONFIG, config_bytes);
        let layer = Descriptor::for_bytes(media_types::OCI_LAYER_GZIP, b"rootfs");
        layout.write_bytes(&config, config_bytes).unwrap();
        layout.write_bytes(&layer, b"rootfs").unwrap();

        // Indented on purpose: the store must keep these exact bytes
        let manifest = descriptor::image_manifest(config, vec![layer]).unwrap();
        let bytes = serde_json::to_vec_pretty(&manifest).unwrap();
        let desc = Descriptor::for_bytes(media_types::OCI_MANIFEST, &bytes);
        layout.write_bytes(&desc, &bytes).unwrap();
        layout.tag(&desc, name).unwrap();
        desc
    }

    /// A packaged chart named `name`.
    fn chart_archive(name: &str, version: &str) -> Vec<u8> {
        let chart_yaml = format!("apiVersion: v2\nname: {name}\nversion: {version}\n");
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        let mut header = tar::Header::new_gnu();
        header.set_size(chart_yaml.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("{name}/Chart.yaml"), chart_yaml.as_bytes())
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap()
    }

    fn walk_all(store: &Store) -> Vec<Descriptor> {
        let mut seen = Vec::new();
        store
            .walk(|desc| {
                seen.push(desc.clone());
                Ok(())
            })
            .unwrap();
        seen
    }

    #[test]
    fn test_open_creates_layout() {
        let (_tmp, store) = new_store();
        assert!(store.root().join("oci-layout").is_file());
        assert!(store.root().join("index.json").is_file());
        assert!(store.root().join("blobs").is_dir());
    }

    #[test]
    fn test_add_artifact_without_default_registry() {
        let (_tmp, store) = new_store();
        let ctx = Context::background();

        let desc = store.add_artifact(&ctx, &hello(), "myrepo:latest").unwrap();

        let refs = store.references().unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].0, "myrepo:latest");

        let parsed = Reference::parse_with(&refs[0].0, &ParseOptions::store()).unwrap();
        assert_eq!(parsed.registry(), "");
        assert_eq!(parsed.repository(), "myrepo");
        assert_eq!(parsed.identifier(), &Identifier::Tag("latest".to_string()));

        assert_eq!(store.resolve("myrepo").unwrap().digest(), desc.digest());
        assert_eq!(store.identify(&desc), media_types::FILE_CONFIG);
    }

    #[test]
    fn test_add_image_keeps_source_digest() {
        let (tmp, store) = new_store();
        let ctx = Context::background();
        let source = image_layout(&tmp.path().join("image"), "nginx:1.25");

        let image = ImageArtifact::open(tmp.path().join("image"), None).unwrap();
        let desc = store
            .add_artifact(&ctx, &image, "docker.io/library/nginx:1.25")
            .unwrap();

        assert_eq!(desc.digest(), source.digest());
        assert_eq!(desc.content_size(), source.content_size());
        assert_eq!(store.identify(&desc), media_types::OCI_CONFIG);
        assert_eq!(
            store.resolve("docker.io/library/nginx:1.25").unwrap().digest(),
            source.digest()
        );
        // Manifest, config and layer
        assert_eq!(store.layout().list_blobs().unwrap().len(), 3);
    }

    #[test]
    fn test_add_chart() {
        let (_tmp, store) = new_store();
        let ctx = Context::background();
        let chart = ChartArtifact::from_bytes(chart_archive("podinfo", "6.5.0")).unwrap();

        let desc = store
            .add_artifact(&ctx, &chart, &chart.default_reference())
            .unwrap();

        assert_eq!(store.references().unwrap()[0].0, "podinfo:6.5.0");
        assert_eq!(store.identify(&desc), media_types::CHART_CONFIG);

        let layer = chart.manifest().unwrap().layers()[0].clone();
        assert_eq!(layer.media_type_str(), media_types::CHART_LAYER);
        let mut data = Vec::new();
        store.open_blob(&layer).unwrap().read_to_end(&mut data).unwrap();
        assert_eq!(data, chart_archive("podinfo", "6.5.0"));
    }

    #[test]
    fn test_collection_mixing_kinds() {
        let (tmp, store) = new_store();
        image_layout(&tmp.path().join("image"), "app:v1");
        let collection = ArtifactCollection::new()
            .with("docs/readme:v1", FileArtifact::from_bytes("README.md", b"# app".to_vec()))
            .with(
                "charts/app:0.1.0",
                ChartArtifact::from_bytes(chart_archive("app", "0.1.0")).unwrap(),
            )
            .with(
                "images/app:v1",
                ImageArtifact::open(tmp.path().join("image"), Some("app:v1")).unwrap(),
            );

        let descs = store
            .add_collection(&Context::background(), &collection)
            .unwrap();

        let kinds: Vec<String> = descs.iter().map(|d| store.identify(d)).collect();
        assert_eq!(
            kinds,
            vec![
                media_types::FILE_CONFIG,
                media_types::CHART_CONFIG,
                media_types::OCI_CONFIG,
            ]
        );
        let names: Vec<String> = store.references().unwrap().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["docs/readme:v1", "charts/app:0.1.0", "images/app:v1"]);
    }

    #[test]
    fn test_digest_integrity() {
        let (_tmp, store) = new_store();
        let ctx = Context::background();
        store.add_artifact(&ctx, &hello(), "a:v1").unwrap();
        store
            .add_artifact(
                &ctx,
                &FileArtifact::from_bytes("big.bin", vec![3u8; 200_000]),
                "b:v1",
            )
            .unwrap();

        for (digest, size) in store.layout().list_blobs().unwrap() {
            let file = fs::File::open(store.layout().blob_path(&digest)).unwrap();
            assert_eq!(Digest::from_reader(Algorithm::Sha256, file).unwrap(), digest);
            assert!(size > 0);
        }
    }

    #[test]
    fn test_idempotent_readd() {
        let (_tmp, store) = new_store();
        let ctx = Context::background();

        let first = store.add_artifact(&ctx, &hello(), "myrepo").unwrap();
        let blobs = store.layout().list_blobs().unwrap();
        let second = store.add_artifact(&ctx, &hello(), "myrepo:latest").unwrap();

        assert_eq!(first, second);
        assert_eq!(store.layout().list_blobs().unwrap(), blobs);
        assert_eq!(walk_all(&store).len(), 1);
    }

    #[test]
    fn test_retag_last_write_wins() {
        let (_tmp, store) = new_store();
        let ctx = Context::background();

        store.add_artifact(&ctx, &hello(), "app:v1").unwrap();
        let newer = store
            .add_artifact(&ctx, &FileArtifact::from_bytes("hello.txt", b"hi".to_vec()), "app:v1")
            .unwrap();

        assert_eq!(walk_all(&store).len(), 1);
        assert_eq!(store.resolve("app:v1").unwrap().digest(), newer.digest());
    }

    #[test]
    fn test_invalid_reference_leaves_store_untouched() {
        let (_tmp, store) = new_store();
        let err = store
            .add_artifact(&Context::background(), &hello(), "UPPER/case")
            .unwrap_err();
        assert!(matches!(err, Error::InvalidReference { .. }));
        assert!(store.layout().list_blobs().unwrap().is_empty());
    }

    #[test]
    fn test_flush_scope() {
        let (_tmp, store) = new_store();
        let ctx = Context::background();
        store.add_artifact(&ctx, &hello(), "myrepo").unwrap();
        fs::write(store.root().join("README"), b"keep me").unwrap();
        fs::create_dir(store.root().join("notes")).unwrap();

        store.flush(&ctx).unwrap();

        assert!(store.root().is_dir());
        assert!(!store.root().join("blobs").exists());
        assert!(!store.root().join("index.json").exists());
        assert!(!store.root().join("oci-layout").exists());
        assert!(store.root().join("README").is_file());
        assert!(store.root().join("notes").is_dir());

        // Flushing again is a no-op
        store.flush(&ctx).unwrap();
        assert!(walk_all(&store).is_empty());
    }

    #[test]
    fn test_flush_missing_store_creates_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("never-created");

        Store::at(&root).flush(&Context::background()).unwrap();
        assert!(!root.exists());
    }

    #[test]
    fn test_add_after_flush_restores_layout() {
        let (_tmp, store) = new_store();
        let ctx = Context::background();
        store.flush(&ctx).unwrap();

        store.add_artifact(&ctx, &hello(), "myrepo").unwrap();
        assert!(store.root().join("oci-layout").is_file());
        OciLayout::open(store.root()).unwrap();
    }

    #[test]
    fn test_collection_partial_progress() {
        let (tmp, store) = new_store();
        let collection = ArtifactCollection::new()
            .with("one:v1", FileArtifact::from_bytes("one", b"1".to_vec()))
            .with("two:v1", FileArtifact::from_path(tmp.path().join("missing")))
            .with("three:v1", FileArtifact::from_bytes("three", b"3".to_vec()));

        let err = store
            .add_collection(&Context::background(), &collection)
            .unwrap_err();
        assert!(matches!(err, Error::ArtifactProduction { .. }));

        let names: Vec<String> = walk_all(&store)
            .iter()
            .filter_map(|d| d.ref_name().map(str::to_string))
            .collect();
        assert_eq!(names, vec!["one:v1"]);
    }

    #[test]
    fn test_collection_success() {
        let (_tmp, store) = new_store();
        let collection = ArtifactCollection::new()
            .with("one:v1", FileArtifact::from_bytes("one", b"1".to_vec()))
            .with("two:v1", FileArtifact::from_bytes("two", b"2".to_vec()));

        let descs = store
            .add_collection(&Context::background(), &collection)
            .unwrap();
        assert_eq!(descs.len(), 2);
        assert_eq!(store.references().unwrap().len(), 2);
    }

    #[test]
    fn test_open_blob() {
        let (_tmp, store) = new_store();
        let ctx = Context::background();
        store.add_artifact(&ctx, &hello(), "myrepo").unwrap();

        let layer = hello().manifest().unwrap().layers()[0].clone();
        let mut data = Vec::new();
        store.open_blob(&layer).unwrap().read_to_end(&mut data).unwrap();
        assert_eq!(data, b"hello");

        let absent = Descriptor::for_bytes(media_types::OCI_LAYER, b"absent");
        assert!(store.open_blob(&absent).unwrap_err().is_not_found());
    }

    #[test]
    fn test_walk_propagates_error() {
        let (_tmp, store) = new_store();
        let ctx = Context::background();
        store.add_artifact(&ctx, &hello(), "a:v1").unwrap();
        store.add_artifact(&ctx, &hello(), "b:v1").unwrap();

        let mut visited = 0;
        let err = store
            .walk(|_| {
                visited += 1;
                Err(Error::transfer("stop"))
            })
            .unwrap_err();
        assert!(matches!(err, Error::Transfer { .. }));
        assert_eq!(visited, 1);
    }

    #[test]
    fn test_identify_non_manifest() {
        let (_tmp, store) = new_store();
        let ctx = Context::background();
        store.add_artifact(&ctx, &hello(), "myrepo").unwrap();

        let layer = hello().manifest().unwrap().layers()[0].clone();
        assert_eq!(store.identify(&layer), "");

        let absent = Descriptor::for_bytes(media_types::OCI_MANIFEST, b"absent");
        assert_eq!(store.identify(&absent), "");
    }

    #[test]
    fn test_copy_to_layout() {
        let (tmp, store) = new_store();
        let ctx = Context::background();
        let desc = store.add_artifact(&ctx, &hello(), "myrepo").unwrap();
        let target = OciLayout::create(tmp.path().join("target")).unwrap();

        let copied = store
            .copy(&ctx, "myrepo", &target, "registry.example.com/myrepo:latest")
            .unwrap();
        assert_eq!(copied.digest(), desc.digest());
        assert_eq!(
            target
                .resolve("registry.example.com/myrepo:latest")
                .unwrap()
                .digest(),
            desc.digest()
        );
        assert_eq!(target.list_blobs().unwrap().len(), 3);
    }

    #[test]
    fn test_pull_from_other_layout() {
        let (tmp, source) = new_store();
        let ctx = Context::background();
        let desc = source.add_artifact(&ctx, &hello(), "myrepo").unwrap();

        let store = Store::at(tmp.path().join("fresh"));
        let pulled = store
            .pull(&ctx, source.layout(), "myrepo:latest", "mirror/myrepo:v2")
            .unwrap();
        assert_eq!(pulled.digest(), desc.digest());
        assert_eq!(store.resolve("mirror/myrepo:v2").unwrap().digest(), desc.digest());
        assert_eq!(store.layout().list_blobs().unwrap().len(), 3);

        let err = store
            .pull(&ctx, source.layout(), "absent:v1", "absent:v1")
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_copy_missing_reference() {
        let (tmp, store) = new_store();
        let target = OciLayout::create(tmp.path().join("target")).unwrap();
        let err = store
            .copy(&Context::background(), "nothing:here", &target, "")
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_copy_all_keeps_names() {
        let (tmp, store) = new_store();
        let ctx = Context::background();
        for name in ["a", "b", "c"] {
            store
                .add_artifact(&ctx, &FileArtifact::from_bytes(name, name.as_bytes().to_vec()), name)
                .unwrap();
        }
        let target = OciLayout::create(tmp.path().join("target")).unwrap();

        store.copy_all(&ctx, &target, None).unwrap();

        let names: Vec<String> = target.references().unwrap().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a:latest", "b:latest", "c:latest"]);
    }

    #[test]
    fn test_copy_all_mapper_error_stops() {
        let (tmp, store) = new_store();
        let ctx = Context::background();
        let names = ["r0", "r1", "r2", "r3", "r4"];
        for name in names {
            store
                .add_artifact(&ctx, &FileArtifact::from_bytes(name, name.as_bytes().to_vec()), name)
                .unwrap();
        }
        let target = OciLayout::create(tmp.path().join("target")).unwrap();

        let mapper = |name: &str| -> Result<String> {
            if name == "r2:latest" {
                return Err(Error::invalid_reference(name, "refused by mapper"));
            }
            Ok(relocate(name, "registry.example.com")?.name())
        };
        let err = store.copy_all(&ctx, &target, Some(&mapper)).unwrap_err();
        assert!(matches!(err, Error::InvalidReference { .. }));

        let copied: Vec<String> = target.references().unwrap().into_iter().map(|(n, _)| n).collect();
        assert_eq!(
            copied,
            vec![
                "registry.example.com/library/r0:latest",
                "registry.example.com/library/r1:latest",
            ]
        );
    }

    /// Fails every copy after the first `allowed` ones.
    struct FlakyTransfer {
        allowed: usize,
        calls: Mutex<usize>,
    }

    impl Transfer for FlakyTransfer {
        fn copy(
            &self,
            ctx: &Context,
            src: &dyn Target,
            src_ref: &str,
            dst: &dyn Target,
            dst_ref: &str,
            opts: &CopyOptions,
        ) -> Result<Descriptor> {
            assert!(
                opts.additional_cached_media_types
                    .iter()
                    .any(|m| m == media_types::DOCKER_MANIFEST_SCHEMA2)
            );
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            if *calls > self.allowed {
                return Err(Error::transfer("registry unavailable"));
            }
            GraphCopy.copy(ctx, src, src_ref, dst, dst_ref, opts)
        }
    }

    #[test]
    fn test_copy_all_transfer_error_propagates() {
        let (tmp, store) = new_store();
        let store = store.with_transfer(Arc::new(FlakyTransfer {
            allowed: 1,
            calls: Mutex::new(0),
        }));
        let ctx = Context::background();
        store.add_artifact(&ctx, &hello(), "a").unwrap();
        store.add_artifact(&ctx, &hello(), "b").unwrap();
        let target = OciLayout::create(tmp.path().join("target")).unwrap();

        let err = store.copy_all(&ctx, &target, None).unwrap_err();
        assert!(matches!(err, Error::Transfer { .. }));
        assert_eq!(target.references().unwrap().len(), 1);
    }

    #[test]
    fn test_add_with_cache() {
        let (tmp, store) = new_store();
        let cache = Arc::new(FsCache::open(tmp.path().join("cache")).unwrap());
        let store = store.with_cache(cache.clone());
        let ctx = Context::background();

        let desc = store.add_artifact(&ctx, &hello(), "myrepo").unwrap();
        let layer = hello().manifest().unwrap().layers()[0].clone();
        let mut cached = Vec::new();
        cache
            .get(layer.digest())
            .unwrap()
            .unwrap()
            .read_to_end(&mut cached)
            .unwrap();
        assert_eq!(cached, b"hello");

        // Same result with or without the cache
        let (_tmp2, plain) = new_store();
        assert_eq!(plain.add_artifact(&ctx, &hello(), "myrepo").unwrap(), desc);
    }

    #[test]
    fn test_concurrent_adds_distinct_references() {
        let (_tmp, store) = new_store();
        let store = Arc::new(store);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    // Every artifact shares the same layer content
                    let artifact = FileArtifact::from_bytes(format!("f{i}"), b"shared".to_vec());
                    store
                        .add_artifact(&Context::background(), &artifact, &format!("app{i}:v1"))
                        .unwrap()
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.references().unwrap().len(), 8);
        // One shared config, one shared layer, eight manifests
        assert_eq!(store.layout().list_blobs().unwrap().len(), 10);
    }

    #[test]
    fn test_cancelled_add() {
        let (_tmp, store) = new_store();
        let ctx = Context::background();
        ctx.cancel();
        let err = store.add_artifact(&ctx, &hello(), "myrepo").unwrap_err();
        assert!(matches!(err, Error::Cancelled { .. }));
        assert!(store.references().unwrap().is_empty());
    }

    #[test]
    fn test_blob_path() {
        let (_tmp, store) = new_store();
        let desc = store
            .add_artifact(&Context::background(), &hello(), "myrepo")
            .unwrap();
        let path = store.blob_path(desc.digest()).unwrap();
        assert!(path.starts_with(store.root()));
        assert!(store.blob_path("sha256:zz").is_err());
    }
}
