use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use thiserror::Error;
use walkdir::WalkDir;

use crate::delta::compute_delta;
use crate::error::{Result, UpdateError};
use crate::fetcher::archive::staged_path;
use crate::logging::UpdateLogger;
use crate::manifest::{FileEntry, Manifest, hash_file};
use crate::process::{HostMonitor, ProcessLauncher};
use crate::util::cancel_requested;

pub mod elevation;

use elevation::Elevation;

const PARTIAL_SUFFIX: &str = ".update-partial";
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyState {
    Idle,
    WaitingForHostExit,
    Copying,
    CommittingManifest,
    Relaunching,
    Done,
    Failed,
}

impl fmt::Display for ApplyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ApplyState::Idle => "idle",
            ApplyState::WaitingForHostExit => "waiting for host exit",
            ApplyState::Copying => "copying",
            ApplyState::CommittingManifest => "committing manifest",
            ApplyState::Relaunching => "relaunching",
            ApplyState::Done => "done",
            ApplyState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug)]
pub struct ApplyPlan {
    pub staging_files_dir: PathBuf,
    /// Changed files recorded at staging time; each must be staged for the apply to proceed.
    pub expected_files_path: PathBuf,
    pub install_root: PathBuf,
    pub host_pid: Option<u32>,
    pub new_manifest_path: PathBuf,
    pub local_manifest_path: PathBuf,
    pub relaunch: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApplyReport {
    /// Relative paths in the order they were installed.
    pub copied: Vec<String>,
    pub relaunched: Option<u32>,
}

#[derive(Debug, Error)]
#[error("apply failed while {failed_in}: {source}")]
pub struct ApplyFailure {
    pub failed_in: ApplyState,
    /// Files already replaced when the failure happened. They are not rolled back.
    pub copied: Vec<String>,
    pub source: UpdateError,
}

pub struct UpdateApplier {
    logger: UpdateLogger,
    monitor: Box<dyn HostMonitor>,
    elevation: Box<dyn Elevation>,
    launcher: ProcessLauncher,
    cancel: Option<Arc<AtomicBool>>,
    host_exit_timeout: Duration,
    state: ApplyState,
}

impl UpdateApplier {
    pub fn new(
        logger: UpdateLogger,
        monitor: Box<dyn HostMonitor>,
        elevation: Box<dyn Elevation>,
        cancel: Option<Arc<AtomicBool>>,
        host_exit_timeout: Duration,
    ) -> Self {
        Self {
            launcher: ProcessLauncher::new(logger.scoped("process")),
            logger,
            monitor,
            elevation,
            cancel,
            host_exit_timeout,
            state: ApplyState::Idle,
        }
    }

    pub fn state(&self) -> ApplyState {
        self.state
    }

    /// Run the plan to `Done`, or stop in `Failed` recording where it broke.
    pub fn apply(&mut self, plan: ApplyPlan) -> std::result::Result<ApplyReport, ApplyFailure> {
        self.state = ApplyState::Idle;
        let mut copied = Vec::new();
        match self.run(&plan, &mut copied) {
            Ok(relaunched) => {
                self.enter(ApplyState::Done);
                if let Some(staging_root) = plan.staging_files_dir.parent()
                    && let Err(err) = fs::remove_dir_all(staging_root)
                {
                    self.logger.warn(format!(
                        "could not remove staging area {}: {err}",
                        staging_root.display()
                    ));
                }
                Ok(ApplyReport { copied, relaunched })
            }
            Err(source) => {
                let failed_in = self.state;
                self.logger.error(format!(
                    "apply failed in state '{failed_in}' after {} file(s): {source}",
                    copied.len()
                ));
                self.state = ApplyState::Failed;
                Err(ApplyFailure {
                    failed_in,
                    copied,
                    source,
                })
            }
        }
    }

    fn run(&mut self, plan: &ApplyPlan, copied: &mut Vec<String>) -> Result<Option<u32>> {
        self.enter(ApplyState::WaitingForHostExit);
        if let Some(pid) = plan.host_pid {
            self.wait_for_host_exit(pid)?;
        }

        self.enter(ApplyState::Copying);
        let manifest = Manifest::load(&plan.new_manifest_path)?;
        let ordered = self.preflight(plan, &manifest)?;
        for (entry, source) in &ordered {
            if cancel_requested(&self.cancel) {
                self.logger.warn("apply cancelled between copies");
                return Err(UpdateError::Cancelled);
            }
            let target = staged_path(&plan.install_root, &entry.relative_path);
            self.install_file(source, &target)?;
            self.logger.debug(format!(
                "installed {}{}",
                entry.relative_path,
                if entry.is_critical { " (critical)" } else { "" }
            ));
            copied.push(entry.relative_path.clone());
        }

        self.enter(ApplyState::CommittingManifest);
        self.commit_manifest(&manifest, &plan.new_manifest_path, &plan.local_manifest_path)?;
        self.logger.info(format!(
            "committed manifest {} ({} file(s) replaced)",
            manifest.version,
            copied.len()
        ));

        self.enter(ApplyState::Relaunching);
        match &plan.relaunch {
            Some(executable) => self
                .launcher
                .relaunch(executable, &plan.install_root)
                .map(Some),
            None => Ok(None),
        }
    }

    fn enter(&mut self, state: ApplyState) {
        self.logger.debug(format!("{} -> {}", self.state, state));
        self.state = state;
    }

    fn wait_for_host_exit(&self, pid: u32) -> Result<()> {
        self.logger.info(format!(
            "waiting up to {}s for process {pid} to exit",
            self.host_exit_timeout.as_secs()
        ));
        let started = Instant::now();
        loop {
            if cancel_requested(&self.cancel) {
                return Err(UpdateError::Cancelled);
            }
            if !self.monitor.is_running(pid) {
                self.logger.info(format!("process {pid} has exited"));
                return Ok(());
            }
            if started.elapsed() >= self.host_exit_timeout {
                return Err(UpdateError::ProcessTimeout {
                    pid,
                    timeout_secs: self.host_exit_timeout.as_secs(),
                });
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Check the staging area against the new manifest before any install file is touched.
    ///
    /// Returns the staged files in install order: non-critical first, critical last.
    fn preflight(&self, plan: &ApplyPlan, manifest: &Manifest) -> Result<Vec<(FileEntry, PathBuf)>> {
        let mut staged = Vec::new();
        if plan.staging_files_dir.exists() {
            for item in WalkDir::new(&plan.staging_files_dir).sort_by_file_name() {
                let item = item.map_err(|e| UpdateError::Io(io::Error::other(e.to_string())))?;
                if !item.file_type().is_file() {
                    continue;
                }
                let relative = relative_path_of(&plan.staging_files_dir, item.path())?;
                let Some(entry) = manifest.entry(&relative) else {
                    return Err(UpdateError::ManifestParse(format!(
                        "staged file {relative} is not listed in manifest {}",
                        manifest.version
                    )));
                };
                let actual = hash_file(item.path())?;
                if actual != entry.content_hash {
                    return Err(UpdateError::HashMismatch {
                        path: relative,
                        expected: entry.content_hash.clone(),
                        actual,
                    });
                }
                staged.push((entry.clone(), item.path().to_path_buf()));
            }
        }

        let mut expected = load_expected(&plan.expected_files_path)?;
        if plan.local_manifest_path.exists() {
            let local = Manifest::load(&plan.local_manifest_path)?;
            expected.extend(compute_delta(&local, manifest).changed_files);
        }
        for wanted in &expected {
            let Some(entry) = manifest.entry(&wanted.relative_path) else {
                return Err(UpdateError::ManifestParse(format!(
                    "expected file {} is not listed in manifest {}",
                    wanted.relative_path, manifest.version
                )));
            };
            if wanted.content_hash != entry.content_hash {
                return Err(UpdateError::HashMismatch {
                    path: entry.relative_path.clone(),
                    expected: entry.content_hash.clone(),
                    actual: wanted.content_hash.clone(),
                });
            }
            if !staged.iter().any(|(s, _)| s.relative_path == entry.relative_path) {
                return Err(UpdateError::HashMismatch {
                    path: entry.relative_path.clone(),
                    expected: entry.content_hash.clone(),
                    actual: "<missing from staging>".into(),
                });
            }
        }

        staged.sort_by(|(a, _), (b, _)| {
            (a.is_critical, &a.relative_path).cmp(&(b.is_critical, &b.relative_path))
        });
        self.logger.info(format!(
            "{} staged file(s) verified, {} critical",
            staged.len(),
            staged.iter().filter(|(e, _)| e.is_critical).count()
        ));
        Ok(staged)
    }

    fn install_file(&self, source: &Path, target: &Path) -> Result<()> {
        match replace_file(source, target) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                self.logger.warn(format!(
                    "permission denied replacing {}, retrying elevated",
                    target.display()
                ));
                self.elevation
                    .replace_elevated(source, target)
                    .map_err(|err| {
                        self.logger
                            .error(format!("elevated replace of {} failed: {err}", target.display()));
                        UpdateError::Permission {
                            path: target.to_path_buf(),
                        }
                    })
            }
            Err(err) => Err(err.into()),
        }
    }

    fn commit_manifest(&self, manifest: &Manifest, source: &Path, local: &Path) -> Result<()> {
        match manifest.save(local) {
            Err(UpdateError::Io(err)) if err.kind() == io::ErrorKind::PermissionDenied => {
                self.logger.warn(format!(
                    "permission denied writing {}, retrying elevated",
                    local.display()
                ));
                self.elevation
                    .replace_elevated(source, local)
                    .map_err(|_| UpdateError::Permission {
                        path: local.to_path_buf(),
                    })
            }
            other => other,
        }
    }
}

fn load_expected(path: &Path) -> Result<Vec<FileEntry>> {
    let bytes = fs::read(path).map_err(|err| match err.kind() {
        io::ErrorKind::NotFound => UpdateError::ManifestParse(format!(
            "staging has no expected-file list at {}",
            path.display()
        )),
        _ => UpdateError::Io(err),
    })?;
    serde_json::from_slice(&bytes).map_err(|e| {
        UpdateError::ManifestParse(format!("expected-file list {}: {e}", path.display()))
    })
}

/// Sibling of `target` that receives the new bytes before the rename.
pub(crate) fn partial_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(OsString::new);
    name.push(PARTIAL_SUFFIX);
    target.with_file_name(name)
}

fn replace_file(source: &Path, target: &Path) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let partial = partial_path(target);
    let result = fs::copy(source, &partial).and_then(|_| fs::rename(&partial, target));
    if result.is_err() {
        let _ = fs::remove_file(&partial);
    }
    result
}

fn relative_path_of(root: &Path, path: &Path) -> Result<String> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| UpdateError::Io(io::Error::other(format!("{} escapes staging", path.display()))))?;
    Ok(relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/"))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::applier::elevation::NoElevation;
    use crate::version::Version;
    use chrono::Utc;
    use sha2::{Digest, Sha256};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeMonitor {
        running_polls: AtomicUsize,
        polls: Arc<AtomicUsize>,
    }

    impl FakeMonitor {
        fn exits_after(polls: usize) -> (Self, Arc<AtomicUsize>) {
            let counter = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    running_polls: AtomicUsize::new(polls),
                    polls: counter.clone(),
                },
                counter,
            )
        }
    }

    impl HostMonitor for FakeMonitor {
        fn is_running(&self, _pid: u32) -> bool {
            self.polls.fetch_add(1, Ordering::SeqCst);
            self.running_polls
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    /// Performs the copy itself, restoring write access first, and records each call.
    #[derive(Default)]
    pub(crate) struct RecordingElevation {
        pub(crate) calls: Arc<Mutex<Vec<PathBuf>>>,
    }

    impl Elevation for RecordingElevation {
        fn replace_elevated(&self, source: &Path, target: &Path) -> io::Result<()> {
            self.calls.lock().unwrap().push(target.to_path_buf());
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Some(parent) = target.parent() {
                    fs::set_permissions(parent, fs::Permissions::from_mode(0o755))?;
                }
            }
            replace_file(source, target)
        }
    }

    fn digest(bytes: &[u8]) -> String {
        format!("{:x}", Sha256::digest(bytes))
    }

    fn entry(path: &str, contents: &[u8], critical: bool) -> FileEntry {
        FileEntry {
            relative_path: path.into(),
            content_hash: digest(contents),
            file_size: contents.len() as u64,
            last_modified: Utc::now(),
            is_critical: critical,
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        install: PathBuf,
        staging: PathBuf,
    }

    impl Fixture {
        /// Install tree at v1, and a staging area holding `changed` for v2.
        fn new(installed: &[(&str, &[u8])], changed: &[(&str, &[u8], bool)]) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let install = dir.path().join("app");
            let staging = dir.path().join("work").join("staging");
            let files_dir = staging.join("files");
            fs::create_dir_all(&files_dir).unwrap();

            let mut local = Vec::new();
            for (path, contents) in installed {
                let target = staged_path(&install, path);
                fs::create_dir_all(target.parent().unwrap()).unwrap();
                fs::write(&target, contents).unwrap();
                local.push(entry(path, contents, false));
            }
            Manifest::new(Version::new(1, 0, 0), Utc::now(), local.clone())
                .save(&install.join("manifest.json"))
                .unwrap();

            let mut remote: Vec<FileEntry> = local
                .into_iter()
                .filter(|e| !changed.iter().any(|(p, _, _)| *p == e.relative_path))
                .collect();
            let mut expected = Vec::new();
            for (path, contents, critical) in changed {
                let staged = staged_path(&files_dir, path);
                fs::create_dir_all(staged.parent().unwrap()).unwrap();
                fs::write(&staged, contents).unwrap();
                expected.push(entry(path, contents, *critical));
            }
            remote.extend(expected.iter().cloned());
            Manifest::new(Version::new(2, 0, 0), Utc::now(), remote)
                .save(&staging.join("manifest.json"))
                .unwrap();
            fs::write(
                staging.join("expected.json"),
                serde_json::to_vec(&expected).unwrap(),
            )
            .unwrap();

            Self {
                _dir: dir,
                install,
                staging,
            }
        }

        fn plan(&self, host_pid: Option<u32>) -> ApplyPlan {
            ApplyPlan {
                staging_files_dir: self.staging.join("files"),
                expected_files_path: self.staging.join("expected.json"),
                install_root: self.install.clone(),
                host_pid,
                new_manifest_path: self.staging.join("manifest.json"),
                local_manifest_path: self.install.join("manifest.json"),
                relaunch: None,
            }
        }

        fn local_version(&self) -> Version {
            Manifest::load(&self.install.join("manifest.json"))
                .unwrap()
                .version
        }

        /// Every install file with its contents.
        fn snapshot(&self) -> Vec<(PathBuf, Vec<u8>)> {
            WalkDir::new(&self.install)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .map(|e| (e.path().to_path_buf(), fs::read(e.path()).unwrap()))
                .collect()
        }
    }

    fn applier(monitor: impl HostMonitor + 'static, elevation: impl Elevation + 'static) -> UpdateApplier {
        UpdateApplier::new(
            UpdateLogger::new("applier"),
            Box::new(monitor),
            Box::new(elevation),
            None,
            Duration::from_millis(300),
        )
    }

    #[test]
    fn applies_critical_files_last_and_commits_manifest() {
        let fixture = Fixture::new(
            &[("app.exe", b"app v1"), ("data/a.bin", b"a1"), ("readme", b"r")],
            &[
                ("app.exe", b"app v2", true),
                ("data/a.bin", b"a2", false),
                ("lib/z.so", b"z2", true),
                ("lib/new.txt", b"n2", false),
            ],
        );
        let (monitor, _) = FakeMonitor::exits_after(0);
        let mut applier = applier(monitor, NoElevation);

        let report = applier.apply(fixture.plan(None)).unwrap();
        assert_eq!(
            report.copied,
            ["data/a.bin", "lib/new.txt", "app.exe", "lib/z.so"]
        );
        assert_eq!(report.relaunched, None);
        assert_eq!(applier.state(), ApplyState::Done);
        assert_eq!(fs::read(fixture.install.join("app.exe")).unwrap(), b"app v2");
        assert_eq!(fs::read(fixture.install.join("lib").join("new.txt")).unwrap(), b"n2");
        assert_eq!(fs::read(fixture.install.join("readme")).unwrap(), b"r");
        assert!(!fixture.install.join("app.exe.update-partial").exists());
        assert_eq!(fixture.local_version(), Version::new(2, 0, 0));
        assert!(!fixture.staging.exists());
    }

    #[test]
    fn waits_for_host_to_exit_before_copying() {
        let fixture = Fixture::new(&[("app.exe", b"v1")], &[("app.exe", b"v2", true)]);
        let (monitor, polls) = FakeMonitor::exits_after(2);
        let mut applier = applier(monitor, NoElevation);

        applier.apply(fixture.plan(Some(4242))).unwrap();
        assert_eq!(polls.load(Ordering::SeqCst), 3);
        assert_eq!(fs::read(fixture.install.join("app.exe")).unwrap(), b"v2");
    }

    #[test]
    fn host_timeout_leaves_install_untouched() {
        let fixture = Fixture::new(
            &[("app.exe", b"v1"), ("data.bin", b"d1")],
            &[("app.exe", b"v2", true), ("data.bin", b"d2", false)],
        );
        let before = fixture.snapshot();
        let (monitor, _) = FakeMonitor::exits_after(usize::MAX);
        let mut applier = applier(monitor, NoElevation);

        let failure = applier.apply(fixture.plan(Some(4242))).unwrap_err();
        assert_eq!(failure.failed_in, ApplyState::WaitingForHostExit);
        assert!(matches!(
            failure.source,
            UpdateError::ProcessTimeout { pid: 4242, .. }
        ));
        assert!(failure.copied.is_empty());
        assert_eq!(applier.state(), ApplyState::Failed);
        assert_eq!(fixture.snapshot(), before);
        assert_eq!(fixture.local_version(), Version::new(1, 0, 0));
    }

    #[cfg(unix)]
    #[test]
    fn real_host_process_that_keeps_running_times_out() {
        let fixture = Fixture::new(&[("app", b"v1")], &[("app", b"v2", true)]);
        let before = fixture.snapshot();
        let mut child = std::process::Command::new("sleep").arg("10").spawn().unwrap();
        let mut applier = applier(crate::process::SystemHostMonitor, NoElevation);

        let failure = applier.apply(fixture.plan(Some(child.id()))).unwrap_err();
        child.kill().unwrap();
        child.wait().unwrap();

        assert!(matches!(failure.source, UpdateError::ProcessTimeout { .. }));
        assert_eq!(fixture.snapshot(), before);
    }

    #[test]
    fn tampered_staging_fails_before_any_copy() {
        let fixture = Fixture::new(
            &[("a", b"1"), ("b", b"1")],
            &[("a", b"2", false), ("b", b"2", false)],
        );
        fs::write(fixture.staging.join("files").join("b"), b"evil").unwrap();
        let before = fixture.snapshot();
        let (monitor, _) = FakeMonitor::exits_after(0);
        let mut applier = applier(monitor, NoElevation);

        let failure = applier.apply(fixture.plan(None)).unwrap_err();
        assert_eq!(failure.failed_in, ApplyState::Copying);
        assert!(matches!(failure.source, UpdateError::HashMismatch { ref path, .. } if path == "b"));
        assert!(failure.copied.is_empty());
        assert_eq!(fixture.snapshot(), before);
        assert_eq!(fixture.local_version(), Version::new(1, 0, 0));
    }

    #[test]
    fn missing_staged_file_fails_before_any_copy() {
        let fixture = Fixture::new(
            &[("a", b"1"), ("b", b"1")],
            &[("a", b"2", false), ("b", b"2", false)],
        );
        fs::remove_file(fixture.staging.join("files").join("a")).unwrap();
        let before = fixture.snapshot();
        let (monitor, _) = FakeMonitor::exits_after(0);

        let failure = applier(monitor, NoElevation)
            .apply(fixture.plan(None))
            .unwrap_err();
        assert!(matches!(failure.source, UpdateError::HashMismatch { ref path, ref actual, .. }
            if path == "a" && actual == "<missing from staging>"));
        assert_eq!(fixture.snapshot(), before);
    }

    #[test]
    fn cancellation_stops_before_manifest_commit() {
        let fixture = Fixture::new(&[("a", b"1")], &[("a", b"2", false)]);
        let (monitor, _) = FakeMonitor::exits_after(0);
        let cancel = Arc::new(AtomicBool::new(true));
        let mut applier = UpdateApplier::new(
            UpdateLogger::new("applier"),
            Box::new(monitor),
            Box::new(NoElevation),
            Some(cancel),
            Duration::from_millis(300),
        );

        let failure = applier.apply(fixture.plan(Some(1))).unwrap_err();
        assert!(matches!(failure.source, UpdateError::Cancelled));
        assert_eq!(failure.failed_in, ApplyState::WaitingForHostExit);

        let failure = applier.apply(fixture.plan(None)).unwrap_err();
        assert!(matches!(failure.source, UpdateError::Cancelled));
        assert_eq!(failure.failed_in, ApplyState::Copying);
        assert_eq!(fs::read(fixture.install.join("a")).unwrap(), b"1");
        assert_eq!(fixture.local_version(), Version::new(1, 0, 0));
    }

    #[test]
    fn unmanaged_install_with_nothing_staged_is_not_committed() {
        let fixture = Fixture::new(&[("app.exe", b"old")], &[("app.exe", b"new", true)]);
        fs::remove_file(fixture.install.join("manifest.json")).unwrap();
        fs::remove_dir_all(fixture.staging.join("files")).unwrap();
        let (monitor, _) = FakeMonitor::exits_after(0);
        let mut applier = applier(monitor, NoElevation);

        let failure = applier.apply(fixture.plan(None)).unwrap_err();
        assert_eq!(failure.failed_in, ApplyState::Copying);
        assert!(matches!(failure.source, UpdateError::HashMismatch { ref path, ref actual, .. }
            if path == "app.exe" && actual == "<missing from staging>"));
        assert_eq!(applier.state(), ApplyState::Failed);
        assert_eq!(fs::read(fixture.install.join("app.exe")).unwrap(), b"old");
        assert!(!fixture.install.join("manifest.json").exists());
    }

    #[test]
    fn staging_without_expected_list_is_refused() {
        let fixture = Fixture::new(&[("a", b"1")], &[("a", b"2", false)]);
        fs::remove_file(fixture.staging.join("expected.json")).unwrap();
        let before = fixture.snapshot();
        let (monitor, _) = FakeMonitor::exits_after(0);

        let failure = applier(monitor, NoElevation)
            .apply(fixture.plan(None))
            .unwrap_err();
        assert_eq!(failure.failed_in, ApplyState::Copying);
        assert!(matches!(failure.source, UpdateError::ManifestParse(_)));
        assert_eq!(fixture.snapshot(), before);
        assert_eq!(fixture.local_version(), Version::new(1, 0, 0));
    }

    #[cfg(unix)]
    #[test]
    fn relaunches_the_updated_executable() {
        let Some(true_bin) = ["/bin/true", "/usr/bin/true"]
            .into_iter()
            .map(Path::new)
            .find(|p| p.is_file())
        else {
            return;
        };
        let fixture = Fixture::new(&[("a", b"1")], &[("a", b"2", false)]);
        let executable = fixture.install.join("dashboard");
        fs::copy(true_bin, &executable).unwrap();
        let (monitor, _) = FakeMonitor::exits_after(0);
        let mut applier = applier(monitor, NoElevation);
        let mut plan = fixture.plan(None);
        plan.relaunch = Some(executable);

        let report = applier.apply(plan).unwrap();
        assert!(report.relaunched.is_some());
        assert_eq!(applier.state(), ApplyState::Done);
        assert_eq!(fixture.local_version(), Version::new(2, 0, 0));
    }

    #[test]
    fn failed_relaunch_keeps_the_committed_update() {
        let fixture = Fixture::new(&[("a", b"1")], &[("a", b"2", false)]);
        let (monitor, _) = FakeMonitor::exits_after(0);
        let mut applier = applier(monitor, NoElevation);
        let mut plan = fixture.plan(None);
        plan.relaunch = Some(fixture.install.join("no-such-binary"));

        let failure = applier.apply(plan).unwrap_err();
        assert_eq!(failure.failed_in, ApplyState::Relaunching);
        assert!(matches!(failure.source, UpdateError::Io(ref err) if err.kind() == io::ErrorKind::NotFound));
        assert_eq!(failure.copied, ["a"]);
        assert_eq!(fs::read(fixture.install.join("a")).unwrap(), b"2");
        assert_eq!(fixture.local_version(), Version::new(2, 0, 0));
    }

    /// Root ignores directory permissions, so permission tests only run when they bite.
    #[cfg(unix)]
    pub(crate) fn lock_dir(dir: &Path) -> bool {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o555)).unwrap();
        let check = dir.join(".write-check");
        if fs::write(&check, b"").is_ok() {
            let _ = fs::remove_file(&check);
            fs::set_permissions(dir, fs::Permissions::from_mode(0o755)).unwrap();
            return false;
        }
        true
    }

    #[cfg(unix)]
    #[test]
    fn permission_denied_is_retried_once_elevated() {
        let fixture = Fixture::new(
            &[("data/a", b"1"), ("bin/app", b"1")],
            &[("data/a", b"2", false), ("bin/app", b"2", true)],
        );
        if !lock_dir(&fixture.install.join("bin")) {
            return;
        }
        let (monitor, _) = FakeMonitor::exits_after(0);
        let elevation = RecordingElevation::default();
        let calls = elevation.calls.clone();

        let report = applier(monitor, elevation).apply(fixture.plan(None)).unwrap();
        assert_eq!(report.copied, ["data/a", "bin/app"]);
        assert_eq!(*calls.lock().unwrap(), [fixture.install.join("bin").join("app")]);
        assert_eq!(fs::read(fixture.install.join("bin").join("app")).unwrap(), b"2");
        assert_eq!(fixture.local_version(), Version::new(2, 0, 0));
    }

    #[cfg(unix)]
    #[test]
    fn second_permission_failure_fails_without_commit() {
        use std::os::unix::fs::PermissionsExt;
        let fixture = Fixture::new(
            &[("data/a", b"1"), ("bin/app", b"1")],
            &[("data/a", b"2", false), ("bin/app", b"2", true)],
        );
        let locked = fixture.install.join("bin");
        if !lock_dir(&locked) {
            return;
        }
        let (monitor, _) = FakeMonitor::exits_after(0);

        let failure = applier(monitor, NoElevation)
            .apply(fixture.plan(None))
            .unwrap_err();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        assert_eq!(failure.failed_in, ApplyState::Copying);
        assert!(matches!(failure.source, UpdateError::Permission { ref path } if *path == locked.join("app")));
        assert_eq!(failure.copied, ["data/a"]);
        assert_eq!(fixture.local_version(), Version::new(1, 0, 0));
    }

    #[test]
    fn partial_path_is_a_sibling() {
        assert_eq!(
            partial_path(Path::new("/opt/app/bin/app.exe")),
            PathBuf::from("/opt/app/bin/app.exe.update-partial")
        );
    }

    #[test]
    fn state_names_read_in_logs() {
        assert_eq!(ApplyState::WaitingForHostExit.to_string(), "waiting for host exit");
        assert_eq!(ApplyState::CommittingManifest.to_string(), "committing manifest");
    }
}
