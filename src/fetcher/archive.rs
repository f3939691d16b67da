use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;
use zip::read::ZipArchive;
use zip::result::ZipError;

use crate::error::{Result, UpdateError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArchiveKind {
    TarGz,
    Zip,
}

impl ArchiveKind {
    pub fn extension(self) -> &'static str {
        match self {
            ArchiveKind::TarGz => "tar.gz",
            ArchiveKind::Zip => "zip",
        }
    }

    /// Guess the container from an asset URL, defaulting to zip.
    pub fn from_url(url: &str) -> Self {
        let path = url.split(['?', '#']).next().unwrap_or(url);
        if path.ends_with(".tar.gz") || path.ends_with(".tgz") {
            ArchiveKind::TarGz
        } else {
            ArchiveKind::Zip
        }
    }
}

/// Extract the single entry `relative_path` from the archive into `dest`.
///
/// Returns `Ok(false)` when the archive holds no such entry.
pub fn extract_entry(
    archive_path: &Path,
    kind: ArchiveKind,
    relative_path: &str,
    dest: &Path,
) -> Result<bool> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    match kind {
        ArchiveKind::Zip => extract_zip_entry(archive_path, relative_path, dest),
        ArchiveKind::TarGz => extract_targz_entry(archive_path, relative_path, dest),
    }
}

fn extract_zip_entry(archive_path: &Path, relative_path: &str, dest: &Path) -> Result<bool> {
    let file = fs::File::open(archive_path)?;
    let mut archive =
        ZipArchive::new(file).map_err(|e| UpdateError::Archive(format!("zip parse error: {e}")))?;
    let mut entry = match archive.by_name(relative_path) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => return Ok(false),
        Err(e) => return Err(UpdateError::Archive(format!("zip entry error: {e}"))),
    };
    if entry.is_dir() || entry.enclosed_name().is_none() {
        return Ok(false);
    }

    let mut out_file = fs::File::create(dest)?;
    io::copy(&mut entry, &mut out_file)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Some(mode) = entry.unix_mode() {
            fs::set_permissions(dest, fs::Permissions::from_mode(mode & 0o7777))?;
        }
    }

    Ok(true)
}

fn extract_targz_entry(archive_path: &Path, relative_path: &str, dest: &Path) -> Result<bool> {
    let file = fs::File::open(archive_path)?;
    let mut archive = Archive::new(GzDecoder::new(file));
    let entries = archive
        .entries()
        .map_err(|e| UpdateError::Archive(format!("tar.gz read error: {e}")))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| UpdateError::Archive(format!("tar.gz entry error: {e}")))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry
            .path()
            .map_err(|e| UpdateError::Archive(format!("tar.gz path error: {e}")))?;
        if normalize_tar_path(&path).as_deref() != Some(relative_path) {
            continue;
        }
        entry
            .unpack(dest)
            .map_err(|e| UpdateError::Archive(format!("tar.gz extract error: {e}")))?;
        return Ok(true);
    }
    Ok(false)
}

/// `./a/b` and `a/b` both name `a/b`; anything escaping the root names nothing.
fn normalize_tar_path(path: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            _ => return None,
        }
    }
    (!parts.is_empty()).then(|| parts.join("/"))
}

/// Location of a staged file for `relative_path` under `files_dir`.
pub fn staged_path(files_dir: &Path, relative_path: &str) -> PathBuf {
    relative_path
        .split('/')
        .fold(files_dir.to_path_buf(), |acc, part| acc.join(part))
}
