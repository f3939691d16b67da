use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Component, Path};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, UpdateError};
use crate::version::Version;

pub mod builder;

pub use builder::{BuildOptions, build, hash_file};

/// One file of an installation, keyed by its path relative to the install root.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub relative_path: String,
    pub content_hash: String,
    pub file_size: u64,
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub is_critical: bool,
}

/// Versioned list of files with content hashes describing an installation or release.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub version: Version,
    pub build_timestamp: DateTime<Utc>,
    pub files: Vec<FileEntry>,
    #[serde(default)]
    pub total_size: u64,
}

impl Manifest {
    pub fn new(version: Version, build_timestamp: DateTime<Utc>, files: Vec<FileEntry>) -> Self {
        let total_size = files.iter().map(|f| f.file_size).sum();
        Self {
            version,
            build_timestamp,
            files,
            total_size,
        }
    }

    /// Read and validate a persisted manifest.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        Self::from_json(&bytes).map_err(|err| match err {
            UpdateError::ManifestParse(msg) => {
                UpdateError::ManifestParse(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    /// Parse manifest JSON. The persisted `totalSize` is not trusted and is recomputed.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let mut manifest: Manifest =
            serde_json::from_slice(bytes).map_err(|e| UpdateError::ManifestParse(e.to_string()))?;
        manifest.validate()?;
        manifest.total_size = manifest.files.iter().map(|f| f.file_size).sum();
        Ok(manifest)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        let mut json = serde_json::to_string_pretty(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Persist the manifest as a whole: written to a sibling temporary file, then renamed.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = self.to_json_pretty()?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let temp_path = path.with_extension("json.tmp");
        let written = (|| -> std::io::Result<()> {
            let mut file = fs::File::create(&temp_path)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
            fs::rename(&temp_path, path)
        })();
        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path);
            return Err(err.into());
        }
        Ok(())
    }

    pub fn entry(&self, relative_path: &str) -> Option<&FileEntry> {
        self.files.iter().find(|f| f.relative_path == relative_path)
    }

    fn validate(&mut self) -> Result<()> {
        let mut seen = HashSet::with_capacity(self.files.len());
        for entry in &mut self.files {
            validate_relative_path(&entry.relative_path)?;
            entry.content_hash = entry.content_hash.to_ascii_lowercase();
            if entry.content_hash.len() != 64
                || !entry.content_hash.bytes().all(|b| b.is_ascii_hexdigit())
            {
                return Err(UpdateError::ManifestParse(format!(
                    "{} has an invalid SHA-256 digest {:?}",
                    entry.relative_path, entry.content_hash
                )));
            }
            if !seen.insert(entry.relative_path.as_str()) {
                return Err(UpdateError::ManifestParse(format!(
                    "duplicate entry {}",
                    entry.relative_path
                )));
            }
        }
        Ok(())
    }
}

/// Reject anything that could resolve outside the install root.
pub(crate) fn validate_relative_path(relative_path: &str) -> Result<()> {
    let invalid = |reason: &str| {
        Err(UpdateError::ManifestParse(format!(
            "path {relative_path:?} {reason}"
        )))
    };
    if relative_path.is_empty() {
        return invalid("is empty");
    }
    if relative_path.contains('\\') {
        return invalid("must use '/' separators");
    }
    for component in Path::new(relative_path).components() {
        match component {
            Component::Normal(_) => {}
            Component::CurDir => return invalid("must not contain '.' components"),
            _ => return invalid("must stay inside the install root"),
        }
    }
    Ok(())
}
