//! Materializing stored artifacts as plain files.

use crate::context::Context;
use crate::descriptor::{Descriptor, DescriptorExt};
use crate::digest::{Digest, Digester};
use crate::error::{Error, Result};
use crate::store::Store;
use crate::transfer::Target;
use std::collections::HashMap;
use std::fs;
use std::io::{self, Cursor, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// A copy target that writes titled layers into a directory.
///
/// Each layer with an `org.opencontainers.image.title` annotation becomes
/// `<dir>/<title>`. Manifests are held in memory so the copy can walk them;
/// other blobs are verified and dropped. Tags are ignored.
#[derive(Debug)]
pub struct DirectoryTarget {
    dir: PathBuf,
    manifests: Mutex<HashMap<Digest, Vec<u8>>>,
    written: Mutex<Vec<PathBuf>>,
}

impl DirectoryTarget {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            manifests: Mutex::new(HashMap::new()),
            written: Mutex::new(Vec::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Files written so far, in write order.
    pub fn written(&self) -> Vec<PathBuf> {
        self.written
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Destination for a layer title, keeping it inside the target directory.
    fn destination(&self, title: &str) -> Result<PathBuf> {
        let mut path = self.dir.clone();
        let mut depth = 0usize;
        for component in Path::new(title).components() {
            match component {
                Component::Normal(part) => {
                    path.push(part);
                    depth += 1;
                }
                Component::CurDir => {}
                _ => {
                    return Err(Error::transfer(format!(
                        "layer title {title:?} escapes the target directory"
                    )));
                }
            }
        }
        if depth == 0 {
            return Err(Error::transfer(format!("layer title {title:?} is empty")));
        }
        Ok(path)
    }

    fn write_file(&self, desc: &Descriptor, title: &str, content: &mut dyn Read) -> Result<()> {
        let path = self.destination(title)?;
        let parent = path.parent().unwrap_or(&self.dir);
        fs::create_dir_all(parent)?;

        let digest = desc.content_digest()?;
        let mut temp_file = tempfile::NamedTempFile::new_in(parent)?;
        let mut digester = Digester::new(digest.algorithm());
        let mut tee = TeeWriter {
            file: &mut temp_file,
            digester: &mut digester,
        };
        io::copy(content, &mut tee)?;
        digester.verify(&digest, Some(desc.content_size()))?;
        temp_file.flush()?;
        temp_file.persist(&path)?;

        debug!(path = %path.display(), %digest, "file written");
        self.written
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(path);
        Ok(())
    }
}

struct TeeWriter<'a, W> {
    file: &'a mut W,
    digester: &'a mut Digester,
}

impl<W: Write> Write for TeeWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.file.write(buf)?;
        self.digester.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Target for DirectoryTarget {
    fn resolve(&self, name: &str) -> Result<Descriptor> {
        Err(Error::not_found(format!(
            "reference {name} (directory targets hold no references)"
        )))
    }

    fn fetch(&self, _reference: &str, desc: &Descriptor) -> Result<Box<dyn Read + Send>> {
        let digest = desc.content_digest()?;
        let manifests = self
            .manifests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match manifests.get(&digest) {
            Some(data) => Ok(Box::new(Cursor::new(data.clone()))),
            None => Err(Error::not_found(format!("blob {digest}"))),
        }
    }

    fn exists(&self, _reference: &str, desc: &Descriptor) -> Result<bool> {
        let digest = desc.content_digest()?;
        Ok(self
            .manifests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(&digest))
    }

    fn push(&self, _reference: &str, desc: &Descriptor, content: &mut dyn Read) -> Result<()> {
        if let Some(title) = desc.title() {
            return self.write_file(desc, title, content);
        }

        let digest = desc.content_digest()?;
        let mut digester = Digester::new(digest.algorithm());
        if desc.is_manifest() {
            let mut data = Vec::new();
            content.read_to_end(&mut data)?;
            digester.update(&data);
            digester.verify(&digest, Some(desc.content_size()))?;
            self.manifests
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .insert(digest, data);
        } else {
            io::copy(content, &mut digester)?;
            digester.verify(&digest, Some(desc.content_size()))?;
            debug!(%digest, media_type = %desc.media_type(), "untitled blob skipped");
        }
        Ok(())
    }

    fn tag(&self, desc: &Descriptor, name: &str) -> Result<()> {
        debug!(reference = name, digest = %desc.digest(), "directory target ignores tags");
        Ok(())
    }
}

impl Store {
    /// Write the titled layers of `reference` into `dir`.
    ///
    /// Returns the paths written.
    pub fn extract<P: AsRef<Path>>(
        &self,
        ctx: &Context,
        reference: &str,
        dir: P,
    ) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(dir.as_ref())?;
        let target = DirectoryTarget::new(dir);
        self.copy(ctx, reference, &target, "")?;
        Ok(target.written())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::FileArtifact;
    use crate::descriptor::media_types;
    use tempfile::TempDir;

    #[test]
    fn test_extract_file_artifact() {
        let temp_dir = TempDir::new().unwrap();
        let store = Store::open(temp_dir.path().join("store")).unwrap();
        let ctx = Context::background();
        let artifact = FileArtifact::from_bytes("docs/readme.md", b"# readme".to_vec());
        store.add_artifact(&ctx, &artifact, "docs:v1").unwrap();

        let out = temp_dir.path().join("out");
        let written = store.extract(&ctx, "docs:v1", &out).unwrap();

        assert_eq!(written, vec![out.join("docs").join("readme.md")]);
        assert_eq!(fs::read(&written[0]).unwrap(), b"# readme");
    }

    #[test]
    fn test_title_cannot_escape() {
        let temp_dir = TempDir::new().unwrap();
        let target = DirectoryTarget::new(temp_dir.path());

        assert!(target.destination("../evil").is_err());
        assert!(target.destination("/etc/passwd").is_err());
        assert!(target.destination("").is_err());
        assert_eq!(
            target.destination("./a/b.txt").unwrap(),
            temp_dir.path().join("a").join("b.txt")
        );
    }

    #[test]
    fn test_push_verifies_content() {
        let temp_dir = TempDir::new().unwrap();
        let target = DirectoryTarget::new(temp_dir.path());
        let desc = Descriptor::for_bytes(media_types::FILE_LAYER, b"expected")
            .with_annotation(crate::descriptor::annotations::TITLE, "f.txt");

        let err = target.push("", &desc, &mut &b"tampered"[..]).unwrap_err();
        assert!(matches!(err, Error::DigestMismatch { .. }));
        assert!(!temp_dir.path().join("f.txt").exists());
        assert!(target.written().is_empty());
    }

    #[test]
    fn test_manifests_are_kept_in_memory() {
        let temp_dir = TempDir::new().unwrap();
        let target = DirectoryTarget::new(temp_dir.path());
        let desc = Descriptor::for_bytes(media_types::OCI_MANIFEST, b"{}");

        assert!(!target.exists("", &desc).unwrap());
        target.push("", &desc, &mut &b"{}"[..]).unwrap();
        assert!(target.exists("", &desc).unwrap());

        let mut data = Vec::new();
        target.fetch("", &desc).unwrap().read_to_end(&mut data).unwrap();
        assert_eq!(data, b"{}");
        assert_eq!(fs::read_dir(temp_dir.path()).unwrap().count(), 0);
    }
}
