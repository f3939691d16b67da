use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};

use crate::env;
use crate::error::{Result, UpdateError};
use crate::logging::UpdateLogger;

/// Answers whether the host process is still alive.
pub trait HostMonitor: Send + Sync {
    fn is_running(&self, pid: u32) -> bool;
}

/// Process table lookup through `sysinfo`. Zombies count as exited.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemHostMonitor;

impl HostMonitor for SystemHostMonitor {
    fn is_running(&self, pid: u32) -> bool {
        let pid = Pid::from_u32(pid);
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system
            .process(pid)
            .map(|process| !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
            .unwrap_or(false)
    }
}

/// Arguments handed to the out-of-process apply helper.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HelperInvocation {
    pub staging_dir: PathBuf,
    pub install_root: PathBuf,
    pub host_pid: u32,
    pub manifest: PathBuf,
    pub local_manifest: PathBuf,
    pub relaunch: Option<PathBuf>,
    pub host_exit_timeout: Duration,
}

impl HelperInvocation {
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "apply".to_owned(),
            "--staging".to_owned(),
            self.staging_dir.display().to_string(),
            "--install-root".to_owned(),
            self.install_root.display().to_string(),
            "--host-pid".to_owned(),
            self.host_pid.to_string(),
            "--manifest".to_owned(),
            self.manifest.display().to_string(),
            "--local-manifest".to_owned(),
            self.local_manifest.display().to_string(),
            "--timeout-secs".to_owned(),
            self.host_exit_timeout.as_secs().to_string(),
        ];
        if let Some(relaunch) = &self.relaunch {
            args.push("--relaunch".to_owned());
            args.push(relaunch.display().to_string());
        }
        args
    }
}

#[derive(Clone)]
pub struct ProcessLauncher {
    logger: UpdateLogger,
}

impl ProcessLauncher {
    pub fn new(logger: UpdateLogger) -> Self {
        Self { logger }
    }

    /// Start the updated executable, detached from the helper.
    pub fn relaunch(&self, executable: &Path, working_dir: &Path) -> Result<u32> {
        if !executable.exists() {
            return Err(UpdateError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("executable not found at {}", executable.display()),
            )));
        }
        self.logger
            .info(format!("relaunching {}", executable.display()));
        let mut cmd = Command::new(executable);
        cmd.current_dir(working_dir);
        let pid = spawn_detached(cmd)?;
        self.logger.info(format!("relaunched with pid {pid}"));
        Ok(pid)
    }

    /// Copy the running executable into `helper_dir` and start it as the apply helper.
    ///
    /// The copy is what lets the helper overwrite the original binary.
    pub fn spawn_helper(&self, invocation: &HelperInvocation, helper_dir: &Path) -> Result<u32> {
        let current = std::env::current_exe()?;
        fs::create_dir_all(helper_dir)?;
        let helper_path = helper_dir.join(env::executable_file_name("delta-updater-helper"));
        fs::copy(&current, &helper_path)?;

        let args = invocation.to_args();
        self.logger.info(format!(
            "starting apply helper {} {}",
            helper_path.display(),
            args.join(" ")
        ));
        let mut cmd = Command::new(&helper_path);
        cmd.args(&args).current_dir(helper_dir);
        spawn_detached(cmd)
    }
}

fn spawn_detached(mut cmd: Command) -> Result<u32> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::null());
    cmd.stderr(Stdio::null());

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::process::CommandExt;
        // CREATE_NO_WINDOW | DETACHED_PROCESS
        cmd.creation_flags(0x08000000 | 0x00000008);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // Own process group, so the host's terminal signals do not reach it.
        cmd.process_group(0);
    }

    let child = cmd.spawn()?;
    Ok(child.id())
}
