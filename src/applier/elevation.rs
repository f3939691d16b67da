use std::io;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Arc;

use crate::logging::UpdateLogger;

/// Replaces a single install file with administrator rights.
pub trait Elevation: Send + Sync {
    fn replace_elevated(&self, source: &Path, target: &Path) -> io::Result<()>;
}

impl<E: Elevation + ?Sized> Elevation for Arc<E> {
    fn replace_elevated(&self, source: &Path, target: &Path) -> io::Result<()> {
        (**self).replace_elevated(source, target)
    }
}

/// Never elevates; every request fails with `PermissionDenied`.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoElevation;

impl Elevation for NoElevation {
    fn replace_elevated(&self, _source: &Path, target: &Path) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("elevation unavailable for {}", target.display()),
        ))
    }
}

/// Elevation through the platform's own prompt.
#[derive(Clone)]
pub struct SystemElevation {
    logger: UpdateLogger,
}

impl SystemElevation {
    pub fn new(logger: UpdateLogger) -> Self {
        Self { logger }
    }
}

impl Elevation for SystemElevation {
    #[cfg(not(target_os = "windows"))]
    fn replace_elevated(&self, source: &Path, target: &Path) -> io::Result<()> {
        let partial = super::partial_path(target);
        let prefix = elevation_prefix();
        self.logger.info(format!(
            "replacing {} via {}",
            target.display(),
            prefix.join(" ")
        ));

        let mut cmd = replace_command(&prefix, source, &partial, target)?;
        let status = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("elevated replace of {} exited with {status}", target.display()),
            ))
        }
    }

    #[cfg(target_os = "windows")]
    fn replace_elevated(&self, source: &Path, target: &Path) -> io::Result<()> {
        self.logger
            .info(format!("replacing {} via RunAs", target.display()));
        let copy = format!(
            "/c copy /Y \"{}\" \"{}\"",
            source.display(),
            target.display()
        );
        let script = format!(
            "$p = Start-Process -FilePath cmd -ArgumentList '{}' -Verb RunAs -Wait -PassThru -WindowStyle Hidden; exit $p.ExitCode",
            copy.replace('\'', "''")
        );
        let status = Command::new("powershell")
            .args(["-NoProfile", "-NonInteractive", "-Command", &script])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("elevated copy to {} exited with {status}", target.display()),
            ))
        }
    }
}

/// `pkexec` when a graphical session can show its prompt, `sudo -n` otherwise.
#[cfg(not(target_os = "windows"))]
fn elevation_prefix() -> Vec<String> {
    let graphical = std::env::var_os("DISPLAY").is_some()
        || std::env::var_os("WAYLAND_DISPLAY").is_some();
    if graphical && find_in_path("pkexec") {
        vec!["pkexec".to_owned()]
    } else {
        vec!["sudo".to_owned(), "-n".to_owned()]
    }
}

#[cfg(not(target_os = "windows"))]
fn find_in_path(program: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
        .unwrap_or(false)
}

/// Copy, rename and cleanup in one shell, so one prompt covers the whole replacement.
/// Paths are passed as positional parameters and never spliced into the script.
#[cfg(not(target_os = "windows"))]
const REPLACE_SCRIPT: &str = r#"cp -f -- "$1" "$2" && mv -f -- "$2" "$3" || { rm -f -- "$2"; exit 1; }"#;

#[cfg(not(target_os = "windows"))]
fn replace_command(prefix: &[String], source: &Path, partial: &Path, target: &Path) -> io::Result<Command> {
    let Some((launcher, launcher_args)) = prefix.split_first() else {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty elevation prefix"));
    };
    let mut cmd = Command::new(launcher);
    cmd.args(launcher_args)
        .args(["/bin/sh", "-c", REPLACE_SCRIPT, "sh"])
        .arg(source)
        .arg(partial)
        .arg(target);
    Ok(cmd)
}
