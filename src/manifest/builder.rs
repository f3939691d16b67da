use std::collections::BTreeSet;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use super::{FileEntry, Manifest};
use crate::env;
use crate::error::{Result, UpdateError};
use crate::logging::UpdateLogger;
use crate::version::Version;

const CRITICAL_EXTENSIONS: [&str; 4] = ["exe", "dll", "so", "dylib"];

#[derive(Clone, Debug, Default)]
pub struct BuildOptions {
    /// Host executable, relative to the install root.
    pub executable: Option<String>,
    /// Additional file names (or relative paths) treated as critical.
    pub critical_names: BTreeSet<String>,
    /// Top-level entries excluded from the walk, relative to the install root.
    pub exclude: BTreeSet<String>,
}

impl BuildOptions {
    pub fn with_executable(executable: Option<String>) -> Self {
        let mut exclude = BTreeSet::new();
        exclude.insert(env::MANIFEST_FILE.to_owned());
        exclude.insert(env::SETTINGS_FILE.to_owned());
        Self {
            executable,
            critical_names: BTreeSet::new(),
            exclude,
        }
    }

    fn is_critical(&self, relative_path: &str) -> bool {
        if self.executable.as_deref() == Some(relative_path) {
            return true;
        }
        let file_name = relative_path.rsplit('/').next().unwrap_or(relative_path);
        if self.critical_names.contains(relative_path) || self.critical_names.contains(file_name) {
            return true;
        }
        Path::new(file_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                CRITICAL_EXTENSIONS
                    .iter()
                    .any(|critical| ext.eq_ignore_ascii_case(critical))
            })
            .unwrap_or(false)
    }
}

/// Hash every file under `install_root` into a manifest.
///
/// The walk is sorted and `buildTimestamp` is taken from the newest file, so two
/// builds over an unchanged tree serialize to identical bytes.
pub fn build(
    install_root: &Path,
    version: Version,
    options: &BuildOptions,
    logger: &UpdateLogger,
) -> Result<Manifest> {
    logger.info(format!(
        "building manifest for {} at version {}",
        install_root.display(),
        version
    ));

    let mut files = Vec::new();
    let walker = WalkDir::new(install_root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() != 1
                || !options
                    .exclude
                    .contains(entry.file_name().to_string_lossy().as_ref())
        });

    for entry in walker {
        let entry = entry.map_err(|e| {
            UpdateError::Io(e.into_io_error().unwrap_or_else(|| {
                std::io::Error::other("filesystem loop while walking install root")
            }))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let relative_path = relative_path_of(install_root, entry.path())?;
        let metadata = entry.metadata().map_err(|e| {
            UpdateError::Io(
                e.into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("metadata unavailable")),
            )
        })?;
        let last_modified: DateTime<Utc> = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        let content_hash = hash_file(entry.path())?;
        let is_critical = options.is_critical(&relative_path);
        logger.debug(format!(
            "{relative_path}: {} bytes, critical={is_critical}",
            metadata.len()
        ));

        files.push(FileEntry {
            relative_path,
            content_hash,
            file_size: metadata.len(),
            last_modified,
            is_critical,
        });
    }

    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    let build_timestamp = files
        .iter()
        .map(|f| f.last_modified)
        .max()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

    let manifest = Manifest::new(version, build_timestamp, files);
    logger.info(format!(
        "manifest built: {} files, {} bytes",
        manifest.files.len(),
        manifest.total_size
    ));
    Ok(manifest)
}

/// Streaming SHA-256 of a file as lowercase hex.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn relative_path_of(root: &Path, path: &Path) -> Result<String> {
    let relative: PathBuf = path
        .strip_prefix(root)
        .map_err(|_| {
            UpdateError::Io(std::io::Error::other(format!(
                "{} is outside {}",
                path.display(),
                root.display()
            )))
        })?
        .to_path_buf();
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}
