//! Garbage collection.

use crate::descriptor::{self, Descriptor, DescriptorExt};
use crate::digest::Digest;
use crate::error::Result;
use crate::store::Store;
use std::collections::HashSet;
use tracing::info;

/// Statistics from a garbage collection run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Number of blobs deleted.
    pub blobs_deleted: usize,
    /// Bytes freed.
    pub bytes_freed: u64,
}

impl Store {
    /// Run garbage collection.
    ///
    /// Walks every manifest in the index to mark reachable blobs, then deletes
    /// the rest. If `dry_run` is true, reports what would be deleted without
    /// actually deleting.
    ///
    /// Run it while nothing is adding to the store: a commit in progress has
    /// blobs on disk that the index does not reference yet.
    pub fn gc(&self, dry_run: bool) -> Result<GcStats> {
        // Mark phase: collect all reachable blobs
        let reachable = self.mark_reachable()?;

        // Sweep phase: delete unreachable blobs
        self.sweep(&reachable, dry_run)
    }

    fn mark_reachable(&self) -> Result<HashSet<Digest>> {
        let mut reachable = HashSet::new();
        for desc in self.layout().index()?.manifests() {
            self.mark(desc, &mut reachable)?;
        }
        Ok(reachable)
    }

    /// Mark a blob and, for manifests and indexes, everything below it.
    fn mark(&self, desc: &Descriptor, reachable: &mut HashSet<Digest>) -> Result<()> {
        let digest = desc.content_digest()?;
        if reachable.contains(&digest) {
            return Ok(());
        }

        // Referenced but absent: nothing to keep
        if !self.layout().blob_exists(&digest) {
            return Ok(());
        }
        reachable.insert(digest.clone());

        if desc.is_manifest() {
            let data = self.layout().read_blob_bytes(&digest)?;
            for child in descriptor::children(desc, &data)? {
                self.mark(&child, reachable)?;
            }
        }

        Ok(())
    }

    fn sweep(&self, reachable: &HashSet<Digest>, dry_run: bool) -> Result<GcStats> {
        let mut stats = GcStats::default();

        for (digest, size) in self.layout().list_blobs()? {
            if reachable.contains(&digest) {
                continue;
            }
            stats.blobs_deleted += 1;
            stats.bytes_freed += size;
            if !dry_run {
                self.layout().remove_blob(&digest)?;
            }
        }

        info!(
            blobs = stats.blobs_deleted,
            bytes = stats.bytes_freed,
            dry_run,
            "garbage collection finished"
        );
        Ok(stats)
    }
}
