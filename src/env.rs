use std::env;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

pub const SETTINGS_FILE: &str = "update-settings.json";
pub const MANIFEST_FILE: &str = "manifest.json";

/// Returns the install root of the running application: the directory holding
/// the current executable, falling back to the working directory.
pub fn default_install_root() -> PathBuf {
    env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Per-user data directory of the updater.
pub fn user_data_dir() -> PathBuf {
    let base = match env::consts::OS {
        "windows" => env::var_os("LOCALAPPDATA")
            .or_else(|| env::var_os("APPDATA"))
            .map(PathBuf::from),
        "macos" => env::var_os("HOME")
            .map(PathBuf::from)
            .map(|home| home.join("Library").join("Application Support")),
        _ => env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .or_else(|| {
                env::var_os("HOME")
                    .map(PathBuf::from)
                    .map(|home| home.join(".local").join("share"))
            }),
    }
    .unwrap_or_else(env::temp_dir);

    base.join("delta-updater")
}

/// Staging and helper area for one install. It lives with the user, not the
/// install, so a read-only install root can still be staged for and elevated into.
pub fn work_dir(install_root: &Path) -> PathBuf {
    user_data_dir().join("installs").join(install_key(install_root))
}

/// Stable directory name for an install root: its last component plus a path digest.
fn install_key(install_root: &Path) -> String {
    let absolute = std::path::absolute(install_root).unwrap_or_else(|_| install_root.to_path_buf());
    let digest = format!("{:x}", Sha256::digest(absolute.to_string_lossy().as_bytes()));
    let name = absolute
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "root".to_owned());
    format!("{name}-{}", &digest[..16])
}

pub fn staging_dir(work_dir: &Path) -> PathBuf {
    work_dir.join("staging")
}

pub fn helper_dir(work_dir: &Path) -> PathBuf {
    work_dir.join("helper")
}

pub fn apply_log_path(work_dir: &Path) -> PathBuf {
    work_dir.join("apply.log")
}

pub fn default_settings_path(install_root: &Path) -> PathBuf {
    install_root.join(SETTINGS_FILE)
}

pub fn default_manifest_path(install_root: &Path) -> PathBuf {
    install_root.join(MANIFEST_FILE)
}

/// File name of an executable on the current platform.
pub fn executable_file_name(stem: &str) -> String {
    if cfg!(target_os = "windows") && !stem.ends_with(".exe") {
        format!("{stem}.exe")
    } else {
        stem.to_owned()
    }
}
