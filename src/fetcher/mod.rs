use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::StreamExt;
use futures_util::stream;

use crate::error::{Result, UpdateError};
use crate::logging::UpdateLogger;
use crate::manifest::{FileEntry, hash_file};
use crate::networking::{
    NetworkClient, ProgressCallback, ProgressUpdate, emit_progress, reborrow_progress,
};
use crate::util::{cancel_requested, progress_percent};

pub mod archive;

use archive::{ArchiveKind, extract_entry, staged_path};

pub const STAGED_FILES_DIR: &str = "files";
pub const STAGED_MANIFEST_FILE: &str = "manifest.json";
/// Changed-file list the applier must find staged, whatever the install holds.
pub const STAGED_EXPECTED_FILE: &str = "expected.json";
const EXTRACT_ATTEMPTS: usize = 2;

/// Verified, not-yet-applied copies of the changed files.
#[derive(Clone, Debug)]
pub struct StagedUpdate {
    pub root: PathBuf,
    pub files_dir: PathBuf,
    pub entries: Vec<FileEntry>,
}

impl StagedUpdate {
    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(STAGED_MANIFEST_FILE)
    }

    pub fn expected_path(&self) -> PathBuf {
        self.root.join(STAGED_EXPECTED_FILE)
    }
}

pub struct PackageFetcher {
    client: NetworkClient,
    logger: UpdateLogger,
    workers: usize,
    cancel: Option<Arc<AtomicBool>>,
}

impl PackageFetcher {
    pub fn new(
        client: NetworkClient,
        logger: UpdateLogger,
        workers: usize,
        cancel: Option<Arc<AtomicBool>>,
    ) -> Self {
        Self {
            client,
            logger,
            workers: workers.max(1),
            cancel,
        }
    }

    /// Download the package and stage exactly `changed` into `staging_dir`.
    ///
    /// On any failure the staging directory is removed, so the applier never
    /// sees a partially verified set.
    pub async fn fetch(
        &self,
        archive_url: &str,
        expected_size: Option<u64>,
        changed: &[FileEntry],
        staging_dir: &Path,
        mut progress: ProgressCallback<'_>,
    ) -> Result<StagedUpdate> {
        reset_dir(staging_dir)?;
        let kind = ArchiveKind::from_url(archive_url);
        let archive_path = staging_dir.join(format!("package.{}", kind.extension()));

        let downloaded = self
            .client
            .download_to_path(
                archive_url,
                &archive_path,
                expected_size,
                &self.cancel,
                reborrow_progress(&mut progress),
            )
            .await;
        let staged = match downloaded {
            Ok(bytes) => {
                self.logger.info(format!(
                    "package downloaded ({bytes} bytes), verifying {} files",
                    changed.len()
                ));
                self.stage_from_archive(&archive_path, kind, changed, staging_dir, progress)
                    .await
            }
            Err(err) => Err(err),
        };

        match staged {
            Ok(staged) => {
                let _ = fs::remove_file(&archive_path);
                Ok(staged)
            }
            Err(err) => {
                self.logger
                    .error(format!("fetch failed, discarding staging area: {err}"));
                let _ = fs::remove_dir_all(staging_dir);
                Err(err)
            }
        }
    }

    /// Extract and verify each changed file from an already-downloaded archive.
    pub(crate) async fn stage_from_archive(
        &self,
        archive_path: &Path,
        kind: ArchiveKind,
        changed: &[FileEntry],
        staging_dir: &Path,
        mut progress: ProgressCallback<'_>,
    ) -> Result<StagedUpdate> {
        let files_dir = staging_dir.join(STAGED_FILES_DIR);
        fs::create_dir_all(&files_dir)?;

        let abort = Arc::new(AtomicBool::new(false));
        let job_dir = files_dir.clone();
        let jobs = changed.iter().cloned().map(|entry| {
            let archive_path = archive_path.to_path_buf();
            let files_dir = job_dir.clone();
            let logger = self.logger.clone();
            let cancel = self.cancel.clone();
            let abort = abort.clone();
            async move {
                let path = entry.relative_path.clone();
                tokio::task::spawn_blocking(move || {
                    let target = StageTarget {
                        entry: &entry,
                        files_dir: &files_dir,
                        logger: &logger,
                        cancel: &cancel,
                        abort: &abort,
                    };
                    target.stage(|dest| extract_entry(&archive_path, kind, &entry.relative_path, dest))
                })
                .await
                .map_err(|e| UpdateError::Archive(format!("verification of {path} panicked: {e}")))?
            }
        });

        let total = changed.len();
        let mut results = stream::iter(jobs).buffer_unordered(self.workers);
        let mut verified = 0usize;
        let mut first_error = None;
        while let Some(result) = results.next().await {
            match result {
                Ok(relative_path) => {
                    verified += 1;
                    emit_progress(
                        &mut progress,
                        ProgressUpdate {
                            stage: "verify",
                            progress: progress_percent(verified as u64, Some(total as u64)),
                            message: format!("Verified {verified} of {total} files"),
                            current_file: Some(relative_path),
                            speed: None,
                            downloaded: Some(verified as u64),
                            total: Some(total as u64),
                        },
                    );
                }
                Err(err) => {
                    // Remaining jobs see the flag and stop before writing anything.
                    abort.store(true, Ordering::SeqCst);
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }
        let staged = StagedUpdate {
            root: staging_dir.to_path_buf(),
            files_dir,
            entries: changed.to_vec(),
        };
        fs::write(staged.expected_path(), serde_json::to_vec_pretty(&staged.entries)?)?;
        Ok(staged)
    }
}

/// One changed file on its way into the staging area.
struct StageTarget<'a> {
    entry: &'a FileEntry,
    files_dir: &'a Path,
    logger: &'a UpdateLogger,
    cancel: &'a Option<Arc<AtomicBool>>,
    abort: &'a AtomicBool,
}

impl StageTarget<'_> {
    /// Extract with `extract` and verify the digest, re-extracting once on mismatch.
    fn stage(&self, mut extract: impl FnMut(&Path) -> Result<bool>) -> Result<String> {
        let entry = self.entry;
        let dest = staged_path(self.files_dir, &entry.relative_path);
        let mut actual = String::from("<missing from archive>");

        for attempt in 1..=EXTRACT_ATTEMPTS {
            if cancel_requested(self.cancel) {
                return Err(UpdateError::Cancelled);
            }
            if self.abort.load(Ordering::SeqCst) {
                return Err(UpdateError::Archive("staging aborted".into()));
            }

            if extract(dest.as_path())? {
                actual = hash_file(&dest)?;
                if actual == entry.content_hash {
                    self.logger.debug(format!("{} verified", entry.relative_path));
                    return Ok(entry.relative_path.clone());
                }
                let _ = fs::remove_file(&dest);
            }
            self.logger.warn(format!(
                "{}: digest mismatch on attempt {attempt}/{EXTRACT_ATTEMPTS} (expected {}, got {actual})",
                entry.relative_path, entry.content_hash
            ));
        }

        Err(UpdateError::HashMismatch {
            path: entry.relative_path.clone(),
            expected: entry.content_hash.clone(),
            actual,
        })
    }
}

fn reset_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir)?;
    }
    fs::create_dir_all(dir)?;
    Ok(())
}
