use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, UpdateError};

pub const DEFAULT_API_BASE_URL: &str = "https://api.github.com";

fn default_check_interval_hours() -> u64 {
    24
}

fn default_host_exit_timeout_secs() -> u64 {
    30
}

fn default_verify_workers() -> usize {
    4
}

fn default_manifest_asset_name() -> String {
    "manifest.json".into()
}

fn default_local_manifest_path() -> PathBuf {
    PathBuf::from(crate::env::MANIFEST_FILE)
}

/// Persisted per-installation update settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSettings {
    pub repository_owner: String,
    pub repository_name: String,

    /// Bearer token for private repositories.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,

    #[serde(default)]
    pub last_check_timestamp: Option<DateTime<Utc>>,

    #[serde(default = "default_check_interval_hours")]
    pub check_interval_hours: u64,

    /// Relative paths resolve against the install root.
    #[serde(default = "default_local_manifest_path")]
    pub local_manifest_path: PathBuf,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_asset_name: Option<String>,

    #[serde(default = "default_manifest_asset_name")]
    pub manifest_asset_name: String,

    /// Host executable relative to the install root, relaunched after an update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable_name: Option<String>,

    #[serde(default = "default_host_exit_timeout_secs")]
    pub host_exit_timeout_secs: u64,

    #[serde(default = "default_verify_workers")]
    pub verify_workers: usize,
}

impl UpdateSettings {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            repository_owner: owner.into(),
            repository_name: repo.into(),
            access_token: None,
            last_check_timestamp: None,
            check_interval_hours: default_check_interval_hours(),
            local_manifest_path: default_local_manifest_path(),
            api_base_url: None,
            archive_asset_name: None,
            manifest_asset_name: default_manifest_asset_name(),
            executable_name: None,
            host_exit_timeout_secs: default_host_exit_timeout_secs(),
            verify_workers: default_verify_workers(),
        }
    }

    pub fn api_base_url(&self) -> &str {
        self.api_base_url
            .as_deref()
            .unwrap_or(DEFAULT_API_BASE_URL)
            .trim_end_matches('/')
    }

    pub fn manifest_path(&self, install_root: &Path) -> PathBuf {
        if self.local_manifest_path.is_absolute() {
            self.local_manifest_path.clone()
        } else {
            install_root.join(&self.local_manifest_path)
        }
    }

    /// When the next scheduled check is allowed, or `None` if one is due now.
    pub fn next_check_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let last = self.last_check_timestamp?;
        // A century is as good as "never" and keeps the arithmetic in range.
        let hours = self.check_interval_hours.min(24 * 365 * 100) as i64;
        let next = last.checked_add_signed(Duration::hours(hours))?;
        (next > now).then_some(next)
    }
}

/// Loads and persists `UpdateSettings` at a fixed path.
#[derive(Clone, Debug)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<UpdateSettings> {
        let contents = fs::read_to_string(&self.path).map_err(|e| {
            UpdateError::Settings(format!("unable to read {}: {e}", self.path.display()))
        })?;
        serde_json::from_str(&contents).map_err(|e| {
            UpdateError::Settings(format!("unable to parse {}: {e}", self.path.display()))
        })
    }

    /// Whole-file replace through a sibling temporary file.
    pub fn save(&self, settings: &UpdateSettings) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let temp_path = self.path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(settings)?;
        fs::write(&temp_path, content)?;
        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}
