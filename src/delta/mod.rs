use std::collections::{HashMap, HashSet};

use crate::manifest::{FileEntry, Manifest};

/// Files whose content differs between an installed and a released manifest.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Delta {
    /// Remote entries that are new or whose content hash changed, in remote order.
    pub changed_files: Vec<FileEntry>,
    /// Sum of `changed_files[*].file_size`.
    pub delta_size: u64,
    /// Paths present locally but absent remotely. Reported only; never deleted.
    pub stale_files: Vec<String>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.changed_files.is_empty()
    }

    pub fn critical_count(&self) -> usize {
        self.changed_files.iter().filter(|f| f.is_critical).count()
    }
}

/// Content identity alone decides "changed": sizes and timestamps are ignored.
pub fn compute_delta(local: &Manifest, remote: &Manifest) -> Delta {
    let local_hashes: HashMap<&str, &str> = local
        .files
        .iter()
        .map(|f| (f.relative_path.as_str(), f.content_hash.as_str()))
        .collect();

    let changed_files: Vec<FileEntry> = remote
        .files
        .iter()
        .filter(|remote_entry| {
            local_hashes
                .get(remote_entry.relative_path.as_str())
                .is_none_or(|hash| !hash.eq_ignore_ascii_case(&remote_entry.content_hash))
        })
        .cloned()
        .collect();
    let delta_size = changed_files.iter().map(|f| f.file_size).sum();

    let remote_paths: HashSet<&str> = remote
        .files
        .iter()
        .map(|f| f.relative_path.as_str())
        .collect();
    let stale_files = local
        .files
        .iter()
        .filter(|f| !remote_paths.contains(f.relative_path.as_str()))
        .map(|f| f.relative_path.clone())
        .collect();

    Delta {
        changed_files,
        delta_size,
        stale_files,
    }
}
