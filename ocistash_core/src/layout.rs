//! OCI image layout directory I/O.
//!
//! Layout:
//! ```text
//! {root}/
//! ├── oci-layout            {"imageLayoutVersion":"1.0.0"}
//! ├── index.json            tagged manifests
//! └── blobs/
//!     └── sha256/
//!         └── 2cf24dba...   content, named by digest
//! ```
//!
//! Blobs are written to a temp file beside their final path, verified, and
//! renamed into place, so readers never observe a partial blob. `index.json`
//! is replaced the same way.

use crate::descriptor::{
    self, Descriptor, DescriptorExt, ImageIndex, LayoutMarker, annotations,
};
use crate::digest::{Digest, Digester};
use crate::error::{Error, Result};
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

pub const LAYOUT_FILE: &str = "oci-layout";
pub const INDEX_FILE: &str = "index.json";
pub const BLOBS_DIR: &str = "blobs";

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// An OCI image layout rooted at a directory.
#[derive(Debug)]
pub struct OciLayout {
    root: PathBuf,
    index_lock: Mutex<()>,
}

impl OciLayout {
    /// Handle on `root` without touching the disk.
    ///
    /// Reads treat missing files as empty; call [`ensure`](Self::ensure)
    /// before writing.
    pub fn at<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            index_lock: Mutex::new(()),
        }
    }

    /// Create the layout structure under `root` where it is missing.
    ///
    /// Existing content is left untouched.
    pub fn create<P: AsRef<Path>>(root: P) -> Result<Self> {
        let layout = Self::at(root);
        layout.ensure()?;
        Ok(layout)
    }

    /// Recreate whatever part of the layout structure is missing.
    pub fn ensure(&self) -> Result<()> {
        fs::create_dir_all(self.blobs_dir())?;

        let _guard = self
            .index_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !self.marker_path().exists() {
            let marker = serde_json::to_vec(&descriptor::layout_marker()?)?;
            self.write_atomic(&self.marker_path(), &marker)?;
        }
        if !self.index_path().exists() {
            self.save_index(&descriptor::empty_index())?;
        }
        Ok(())
    }

    /// Open an existing layout, validating its marker file.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        if !root.is_dir() {
            return Err(Error::invalid_layout(&root, "directory does not exist"));
        }

        let marker_path = root.join(LAYOUT_FILE);
        let data = match fs::read(&marker_path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::invalid_layout(&root, "oci-layout file not found"));
            }
            Err(e) => return Err(e.into()),
        };
        let marker: LayoutMarker = serde_json::from_slice(&data)
            .map_err(|e| Error::invalid_layout(&root, format!("unreadable oci-layout: {e}")))?;
        if !marker.image_layout_version().starts_with("1.") {
            return Err(Error::invalid_layout(
                &root,
                format!(
                    "unsupported image layout version {}",
                    marker.image_layout_version()
                ),
            ));
        }

        Ok(Self::at(root))
    }

    /// Get the root directory of the layout.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.root.join(BLOBS_DIR)
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    pub fn marker_path(&self) -> PathBuf {
        self.root.join(LAYOUT_FILE)
    }

    /// Get the path to a blob given its digest.
    ///
    /// Returns: `blobs/{algorithm}/{hex}`
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.blobs_dir()
            .join(digest.algorithm().as_str())
            .join(digest.hex())
    }

    pub fn blob_exists(&self, digest: &Digest) -> bool {
        self.blob_path(digest).is_file()
    }

    /// Store a blob from a reader, verifying digest and size as it streams.
    ///
    /// Returns `false` without consuming the reader when the blob is already present.
    pub fn write_blob<R: Read>(&self, desc: &Descriptor, mut reader: R) -> Result<bool> {
        let digest = desc.content_digest()?;
        let blob_path = self.blob_path(&digest);
        if blob_path.is_file() {
            debug!(%digest, "blob already present");
            return Ok(false);
        }

        let parent = self.blobs_dir().join(digest.algorithm().as_str());
        fs::create_dir_all(&parent)?;

        let mut temp_file = tempfile::NamedTempFile::new_in(&parent)?;
        let mut digester = Digester::new(digest.algorithm());
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            temp_file.write_all(&buf[..n])?;
            digester.update(&buf[..n]);
        }
        digester.verify(&digest, Some(desc.content_size()))?;
        temp_file.flush()?;

        // Identical content may land concurrently; replacing it is harmless.
        temp_file.persist(&blob_path)?;
        debug!(%digest, size = desc.content_size(), "blob written");
        Ok(true)
    }

    /// Store an in-memory blob.
    pub fn write_bytes(&self, desc: &Descriptor, data: &[u8]) -> Result<bool> {
        self.write_blob(desc, data)
    }

    /// Open a blob for reading.
    pub fn read_blob(&self, digest: &Digest) -> Result<fs::File> {
        match fs::File::open(self.blob_path(digest)) {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(Error::not_found(format!("blob {digest}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read a whole blob into memory.
    pub fn read_blob_bytes(&self, digest: &Digest) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        self.read_blob(digest)?.read_to_end(&mut data)?;
        Ok(data)
    }

    pub fn remove_blob(&self, digest: &Digest) -> Result<()> {
        match fs::remove_file(self.blob_path(digest)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Every blob on disk with its size, sorted by digest.
    pub fn list_blobs(&self) -> Result<Vec<(Digest, u64)>> {
        let mut blobs = Vec::new();
        let blobs_dir = self.blobs_dir();
        if !blobs_dir.exists() {
            return Ok(blobs);
        }

        for algo_entry in fs::read_dir(&blobs_dir)? {
            let algo_entry = algo_entry?;
            let algo_path = algo_entry.path();
            if !algo_path.is_dir() {
                continue;
            }
            let algo = algo_entry.file_name().to_string_lossy().into_owned();

            for blob_entry in fs::read_dir(&algo_path)? {
                let blob_entry = blob_entry?;
                let metadata = blob_entry.metadata()?;
                if !metadata.is_file() {
                    continue;
                }
                let name = blob_entry.file_name().to_string_lossy().into_owned();
                // Temp files from in-flight writes do not parse as digests.
                if let Ok(digest) = Digest::parse(&format!("{algo}:{name}")) {
                    blobs.push((digest, metadata.len()));
                }
            }
        }

        blobs.sort();
        Ok(blobs)
    }

    /// Load `index.json`; a missing file reads as an empty index.
    pub fn index(&self) -> Result<ImageIndex> {
        match fs::read(self.index_path()) {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(descriptor::empty_index()),
            Err(e) => Err(e.into()),
        }
    }

    fn save_index(&self, index: &ImageIndex) -> Result<()> {
        let data = serde_json::to_vec_pretty(index)?;
        self.write_atomic(&self.index_path(), &data)
    }

    /// Record `desc` in the index under `name`, replacing any manifest
    /// previously tagged with the same name.
    pub fn tag(&self, desc: &Descriptor, name: &str) -> Result<Descriptor> {
        let tagged = desc.clone().with_annotation(annotations::REF_NAME, name);

        let _guard = self
            .index_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut index = self.index()?;
        let mut manifests = index.manifests().clone();
        manifests.retain(|m| m.ref_name() != Some(name));
        manifests.push(tagged.clone());
        index.set_manifests(manifests);
        self.save_index(&index)?;

        Ok(tagged)
    }

    /// Drop `name` from the index. Returns whether it was present.
    pub fn untag(&self, name: &str) -> Result<bool> {
        let _guard = self
            .index_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut index = self.index()?;
        let mut manifests = index.manifests().clone();
        let before = manifests.len();
        manifests.retain(|m| m.ref_name() != Some(name));
        let removed = manifests.len() != before;
        if removed {
            index.set_manifests(manifests);
            self.save_index(&index)?;
        }
        Ok(removed)
    }

    /// Descriptor tagged with `name`.
    pub fn resolve(&self, name: &str) -> Result<Descriptor> {
        self.index()?
            .manifests()
            .iter()
            .cloned()
            .find(|m| m.ref_name() == Some(name))
            .ok_or_else(|| Error::not_found(format!("reference {name}")))
    }

    /// Tagged manifests in index order.
    pub fn references(&self) -> Result<Vec<(String, Descriptor)>> {
        Ok(self
            .index()?
            .manifests()
            .iter()
            .cloned()
            .filter_map(|m| m.ref_name().map(str::to_string).map(|name| (name, m)))
            .collect())
    }

    fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<()> {
        let dir = path.parent().unwrap_or(&self.root);
        let mut temp_file = tempfile::NamedTempFile::new_in(dir)?;
        temp_file.write_all(data)?;
        temp_file.flush()?;
        temp_file.persist(path)?;
        Ok(())
    }
}
