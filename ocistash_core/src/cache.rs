//! Blob cache consulted before asking an artifact to produce a blob.
//!
//! The cache is only a shortcut: every failure on the cache path is logged
//! and the artifact's own producer is used instead. Entries are streamed in
//! both directions, so no blob is ever held in memory whole.
//!
//! On-disk layout of [`FsCache`]:
//! ```text
//! {root}/
//! └── 2c/
//!     └── sha256-2cf24dba...    [codec: u8][payload]
//! ```

use crate::artifact::OciArtifact;
use crate::descriptor::{Descriptor, DescriptorExt, ImageManifest};
use crate::digest::{Digest, Digester};
use crate::error::Result;
use std::fs;
use std::io::{self, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Entries at or above this size are stored zstd-compressed.
const COMPRESSION_THRESHOLD: usize = 4096;

const CODEC_RAW: u8 = 0;
const CODEC_ZSTD: u8 = 1;

const ZSTD_LEVEL: i32 = 3;

/// Key/value side table for encoded blobs.
pub trait Cache: Send + Sync {
    /// Reader over the cached bytes for `key`, or `None` on a miss.
    fn get(&self, key: &str) -> io::Result<Option<Box<dyn Read + Send>>>;

    /// Start writing the entry for `key`.
    fn put(&self, key: &str) -> io::Result<Box<dyn CacheWriter>>;
}

/// A cache entry being written.
///
/// Nothing is visible to [`Cache::get`] until [`commit`](Self::commit);
/// dropping the writer discards the entry.
pub trait CacheWriter: Write + Send {
    fn commit(self: Box<Self>) -> io::Result<()>;
}

/// Directory-backed cache.
#[derive(Debug, Clone)]
pub struct FsCache {
    root: PathBuf,
}

impl FsCache {
    /// Use (and create if needed) `root` as the cache directory.
    pub fn open<P: AsRef<Path>>(root: P) -> io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Entry path for a key; digest keys shard by their hex prefix.
    pub fn entry_path(&self, key: &str) -> PathBuf {
        let digest = Digest::parse(key).unwrap_or_else(|_| Digest::sha256(key.as_bytes()));
        self.root.join(digest.prefix()).join(format!(
            "{}-{}",
            digest.algorithm().as_str(),
            digest.hex()
        ))
    }
}

impl Cache for FsCache {
    fn get(&self, key: &str) -> io::Result<Option<Box<dyn Read + Send>>> {
        let mut file = match fs::File::open(self.entry_path(key)) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        let mut codec = [0u8; 1];
        if file.read(&mut codec)? == 0 {
            return Err(io::Error::new(ErrorKind::InvalidData, "empty cache entry"));
        }
        match codec[0] {
            CODEC_RAW => Ok(Some(Box::new(file))),
            CODEC_ZSTD => Ok(Some(Box::new(zstd::Decoder::new(file)?))),
            other => Err(io::Error::new(
                ErrorKind::InvalidData,
                format!("unknown cache codec {other}"),
            )),
        }
    }

    fn put(&self, key: &str) -> io::Result<Box<dyn CacheWriter>> {
        let path = self.entry_path(key);
        let dir = path
            .parent()
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "cache entry has no parent"))?;
        fs::create_dir_all(dir)?;

        let temp_file = NamedTempFile::new_in(dir)?;
        Ok(Box::new(FsCacheWriter {
            path,
            state: Some(WriterState::Head(temp_file, Vec::new())),
        }))
    }
}

/// Small entries are buffered until the threshold tells which codec to use.
enum WriterState {
    Head(NamedTempFile, Vec<u8>),
    Compressing(zstd::Encoder<'static, NamedTempFile>),
}

struct FsCacheWriter {
    path: PathBuf,
    state: Option<WriterState>,
}

fn poisoned_writer() -> io::Error {
    io::Error::other("cache writer failed earlier")
}

impl Write for FsCacheWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let state = match self.state.take() {
            Some(WriterState::Head(mut file, mut head)) => {
                head.extend_from_slice(buf);
                if head.len() < COMPRESSION_THRESHOLD {
                    WriterState::Head(file, head)
                } else {
                    file.write_all(&[CODEC_ZSTD])?;
                    let mut encoder = zstd::Encoder::new(file, ZSTD_LEVEL)?;
                    encoder.write_all(&head)?;
                    WriterState::Compressing(encoder)
                }
            }
            Some(WriterState::Compressing(mut encoder)) => {
                encoder.write_all(buf)?;
                WriterState::Compressing(encoder)
            }
            None => return Err(poisoned_writer()),
        };
        self.state = Some(state);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.state.as_mut() {
            Some(WriterState::Head(..)) => Ok(()),
            Some(WriterState::Compressing(encoder)) => encoder.flush(),
            None => Err(poisoned_writer()),
        }
    }
}

impl CacheWriter for FsCacheWriter {
    fn commit(mut self: Box<Self>) -> io::Result<()> {
        let mut file = match self.state.take() {
            Some(WriterState::Head(mut file, head)) => {
                file.write_all(&[CODEC_RAW])?;
                file.write_all(&head)?;
                file
            }
            Some(WriterState::Compressing(encoder)) => encoder.finish()?,
            None => return Err(poisoned_writer()),
        };
        file.flush()?;
        file.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

/// An artifact whose blobs are served from a cache when possible.
pub struct CachedArtifact<A> {
    inner: A,
    cache: Arc<dyn Cache>,
}

/// Decorate `artifact` so its blobs go through `cache`.
pub fn wrap<A: OciArtifact>(artifact: A, cache: Arc<dyn Cache>) -> CachedArtifact<A> {
    CachedArtifact {
        inner: artifact,
        cache,
    }
}

impl<A: OciArtifact> CachedArtifact<A> {
    pub fn into_inner(self) -> A {
        self.inner
    }

    /// A reader over a verified cache entry.
    ///
    /// The entry is hashed in one streaming pass and reopened for the caller.
    fn lookup(&self, key: &str, digest: &Digest, size: u64) -> Option<Box<dyn Read + Send>> {
        let mut digester = Digester::new(digest.algorithm());
        let checked = match self.cache.get(key) {
            Ok(Some(mut reader)) => io::copy(&mut reader, &mut digester),
            Ok(None) => return None,
            Err(e) => Err(e),
        };
        if let Err(e) = checked {
            warn!(%digest, error = %e, "cache read failed, producing blob");
            return None;
        }
        if let Err(e) = digester.verify(digest, Some(size)) {
            warn!(%digest, error = %e, "ignoring corrupt cache entry");
            return None;
        }

        match self.cache.get(key) {
            Ok(reader) => reader,
            Err(e) => {
                warn!(%digest, error = %e, "cache read failed, producing blob");
                None
            }
        }
    }
}

impl<A: OciArtifact> OciArtifact for CachedArtifact<A> {
    fn media_type(&self) -> String {
        self.inner.media_type()
    }

    fn manifest(&self) -> Result<ImageManifest> {
        self.inner.manifest()
    }

    fn raw_manifest(&self) -> Result<Vec<u8>> {
        self.inner.raw_manifest()
    }

    fn raw_config(&self) -> Result<Vec<u8>> {
        self.inner.raw_config()
    }

    fn blob(&self, desc: &Descriptor) -> Result<Box<dyn Read + Send>> {
        let digest = desc.content_digest()?;
        let key = digest.to_string();
        let size = desc.content_size();

        if let Some(reader) = self.lookup(&key, &digest, size) {
            debug!(%digest, "blob served from cache");
            return Ok(reader);
        }

        let reader = self.inner.blob(desc)?;
        match self.cache.put(&key) {
            Ok(entry) => Ok(Box::new(CacheFill {
                inner: reader,
                pending: Some((entry, Digester::new(digest.algorithm()))),
                digest,
                size,
            })),
            Err(e) => {
                warn!(%digest, error = %e, "cache write failed");
                Ok(reader)
            }
        }
    }
}

/// Passes producer bytes through while copying them into a cache entry.
///
/// The entry is committed once the producer reaches end of stream and the
/// bytes match the descriptor; a reader dropped early leaves no entry.
struct CacheFill {
    inner: Box<dyn Read + Send>,
    pending: Option<(Box<dyn CacheWriter>, Digester)>,
    digest: Digest,
    size: u64,
}

impl CacheFill {
    fn finish(&mut self) {
        let Some((entry, digester)) = self.pending.take() else {
            return;
        };
        if let Err(e) = digester.verify(&self.digest, Some(self.size)) {
            debug!(digest = %self.digest, error = %e, "producer output not cached");
            return;
        }
        if let Err(e) = entry.commit() {
            warn!(digest = %self.digest, error = %e, "cache write failed");
        }
    }
}

impl Read for CacheFill {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 {
            self.finish();
            return Ok(0);
        }

        if let Some((entry, digester)) = self.pending.as_mut() {
            match entry.write_all(&buf[..n]) {
                Ok(()) => digester.update(&buf[..n]),
                Err(e) => {
                    warn!(digest = %self.digest, error = %e, "cache write failed");
                    self.pending = None;
                }
            }
        }
        Ok(n)
    }
}
