use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::applier::elevation::{Elevation, SystemElevation};
use crate::applier::{ApplyPlan, ApplyReport, UpdateApplier};
use crate::delta::compute_delta;
use crate::env;
use crate::error::{Result, UpdateError};
use crate::fetcher::PackageFetcher;
use crate::fetcher::archive::staged_path;
use crate::logging::UpdateLogger;
use crate::manifest::{self, BuildOptions, FileEntry, Manifest};
use crate::networking::{NetworkClient, ProgressCallback};
use crate::process::{HelperInvocation, ProcessLauncher, SystemHostMonitor};
use crate::release::{ReleaseLocator, ReleaseSource};
use crate::storage::{SettingsStore, UpdateSettings};
use crate::version::Version;

/// What a check found out about the newest release.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCheckResult {
    pub current_version: Version,
    pub latest_version: Version,
    pub download_url: String,
    pub manifest_url: String,
    pub release_notes: String,
    pub changed_files: Vec<FileEntry>,
    pub delta_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_size: Option<u64>,
}

impl UpdateCheckResult {
    /// Bytes saved compared to installing the full package, when its size is known.
    pub fn bandwidth_saved(&self) -> Option<u64> {
        self.archive_size
            .map(|archive| archive.saturating_sub(self.delta_size))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CheckOutcome {
    Skipped { next_check: DateTime<Utc> },
    NoReleases,
    UpToDate { version: Version },
    UpdateAvailable(UpdateCheckResult),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Nothing was applied; the check result says why.
    NotApplied(CheckOutcome),
    Applied {
        result: UpdateCheckResult,
        report: ApplyReport,
    },
    HelperLaunched {
        result: UpdateCheckResult,
        helper_pid: u32,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyMode {
    /// Replace files from this process; used when the updater is not the host itself.
    InProcess,
    /// Hand over to a detached helper that waits for `host_pid` to exit.
    Helper { host_pid: u32 },
}

struct Evaluation {
    outcome: CheckOutcome,
    remote: Option<Manifest>,
}

pub struct UpdateOrchestrator {
    store: SettingsStore,
    install_root: PathBuf,
    work_dir: PathBuf,
    logger: UpdateLogger,
    cancel: Option<Arc<AtomicBool>>,
    elevation: Arc<dyn Elevation>,
}

impl UpdateOrchestrator {
    pub fn new(store: SettingsStore, install_root: PathBuf, logger: UpdateLogger) -> Self {
        Self {
            store,
            work_dir: env::work_dir(&install_root),
            install_root,
            elevation: Arc::new(SystemElevation::new(logger.scoped("elevation"))),
            logger,
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Stage and keep the helper under `work_dir` instead of the per-user default.
    pub fn with_work_dir(mut self, work_dir: PathBuf) -> Self {
        self.work_dir = work_dir;
        self
    }

    /// Privileged write path used by in-process applies.
    pub fn with_elevation(mut self, elevation: Arc<dyn Elevation>) -> Self {
        self.elevation = elevation;
        self
    }

    /// Compare the installed files with the newest release without downloading the package.
    pub async fn check(&self, force: bool) -> Result<CheckOutcome> {
        let mut settings = self.store.load()?;
        let now = Utc::now();
        if let Some(next_check) = self.due(&settings, force, now) {
            return Ok(CheckOutcome::Skipped { next_check });
        }

        let evaluated = self.evaluate(&settings).await;
        self.record_check(&mut settings, now);
        if let Err(err) = &evaluated {
            self.report_failure(err);
        }
        evaluated.map(|evaluation| evaluation.outcome)
    }

    /// Full cycle: check, download and verify the delta, then apply it.
    pub async fn check_and_apply(
        &self,
        force: bool,
        mode: ApplyMode,
        progress: ProgressCallback<'_>,
    ) -> Result<UpdateOutcome> {
        let mut settings = self.store.load()?;
        let now = Utc::now();
        if let Some(next_check) = self.due(&settings, force, now) {
            return Ok(UpdateOutcome::NotApplied(CheckOutcome::Skipped { next_check }));
        }

        let outcome = self.run_update(&settings, mode, progress).await;
        self.record_check(&mut settings, now);
        if let Err(err) = &outcome {
            self.report_failure(err);
        }
        outcome
    }

    fn report_failure(&self, err: &UpdateError) {
        if err.is_transient() {
            self.logger
                .warn(format!("update check failed, retrying at the next scheduled check: {err}"));
        } else {
            self.logger.error(format!("update failed: {err}"));
        }
    }

    fn due(&self, settings: &UpdateSettings, force: bool, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if force {
            return None;
        }
        let next = settings.next_check_at(now)?;
        self.logger
            .info(format!("next update check not before {}", next.to_rfc3339()));
        Some(next)
    }

    fn record_check(&self, settings: &mut UpdateSettings, now: DateTime<Utc>) {
        settings.last_check_timestamp = Some(now);
        if let Err(err) = self.store.save(settings) {
            self.logger.warn(format!(
                "could not record check time in {}: {err}",
                self.store.path().display()
            ));
        }
    }

    async fn run_update(
        &self,
        settings: &UpdateSettings,
        mode: ApplyMode,
        progress: ProgressCallback<'_>,
    ) -> Result<UpdateOutcome> {
        let evaluation = self.evaluate(settings).await?;
        let (result, remote) = match (evaluation.outcome, evaluation.remote) {
            (CheckOutcome::UpdateAvailable(result), Some(remote)) => (result, remote),
            (outcome, _) => return Ok(UpdateOutcome::NotApplied(outcome)),
        };

        let staging_dir = env::staging_dir(&self.work_dir);
        let fetcher = PackageFetcher::new(
            NetworkClient::new(settings.access_token.clone(), self.logger.scoped("network")),
            self.logger.scoped("fetcher"),
            settings.verify_workers,
            self.cancel.clone(),
        );
        let staged = fetcher
            .fetch(
                &result.download_url,
                result.archive_size,
                &result.changed_files,
                &staging_dir,
                progress,
            )
            .await?;
        remote.save(&staged.manifest_path())?;
        self.logger.info(format!(
            "{} file(s) staged in {}",
            staged.entries.len(),
            staged.root.display()
        ));

        let local_manifest = settings.manifest_path(&self.install_root);
        let host_exit_timeout = Duration::from_secs(settings.host_exit_timeout_secs);
        match mode {
            ApplyMode::InProcess => {
                let plan = ApplyPlan {
                    staging_files_dir: staged.files_dir.clone(),
                    expected_files_path: staged.expected_path(),
                    install_root: self.install_root.clone(),
                    host_pid: None,
                    new_manifest_path: staged.manifest_path(),
                    local_manifest_path: local_manifest,
                    relaunch: None,
                };
                let mut applier = UpdateApplier::new(
                    self.logger.scoped("applier"),
                    Box::new(SystemHostMonitor),
                    Box::new(self.elevation.clone()),
                    self.cancel.clone(),
                    host_exit_timeout,
                );
                let report = tokio::task::spawn_blocking(move || applier.apply(plan))
                    .await
                    .map_err(|e| UpdateError::Io(std::io::Error::other(format!("apply task failed: {e}"))))?
                    .map_err(|failure| failure.source)?;
                self.logger.info(format!(
                    "updated to {} ({} file(s) replaced)",
                    result.latest_version,
                    report.copied.len()
                ));
                Ok(UpdateOutcome::Applied { result, report })
            }
            ApplyMode::Helper { host_pid } => {
                let invocation = HelperInvocation {
                    staging_dir: staged.root.clone(),
                    install_root: self.install_root.clone(),
                    host_pid,
                    manifest: staged.manifest_path(),
                    local_manifest,
                    relaunch: settings
                        .executable_name
                        .as_deref()
                        .map(|name| staged_path(&self.install_root, name)),
                    host_exit_timeout,
                };
                let helper_pid = ProcessLauncher::new(self.logger.scoped("process"))
                    .spawn_helper(&invocation, &env::helper_dir(&self.work_dir))?;
                Ok(UpdateOutcome::HelperLaunched { result, helper_pid })
            }
        }
    }

    async fn evaluate(&self, settings: &UpdateSettings) -> Result<Evaluation> {
        let local = self.local_manifest(settings).await?;

        let client = NetworkClient::new(settings.access_token.clone(), self.logger.scoped("network"));
        let locator = ReleaseLocator::new(
            client,
            ReleaseSource::from_settings(settings),
            self.logger.scoped("release"),
        );
        let Some(latest) = locator.latest().await? else {
            return Ok(Evaluation {
                outcome: CheckOutcome::NoReleases,
                remote: None,
            });
        };

        if latest.version <= local.version {
            self.logger.info(format!(
                "installed {} is current (latest release {})",
                local.version, latest.version
            ));
            return Ok(Evaluation {
                outcome: CheckOutcome::UpToDate {
                    version: local.version,
                },
                remote: None,
            });
        }

        let remote = locator.fetch_manifest(&latest.manifest_url).await?;
        if remote.version != latest.version {
            self.logger.warn(format!(
                "release {} publishes a manifest for {}",
                latest.tag, remote.version
            ));
        }

        let delta = compute_delta(&local, &remote);
        if !delta.stale_files.is_empty() {
            self.logger.info(format!(
                "{} installed file(s) are no longer shipped and are left in place: {}",
                delta.stale_files.len(),
                delta.stale_files.join(", ")
            ));
        }
        if delta.is_empty() {
            self.logger.info(format!(
                "release {} changes no installed files",
                latest.version
            ));
            return Ok(Evaluation {
                outcome: CheckOutcome::UpToDate {
                    version: local.version,
                },
                remote: None,
            });
        }

        self.logger.info(format!(
            "update {} -> {}: {} of {} files changed, {} bytes ({} critical)",
            local.version,
            latest.version,
            delta.changed_files.len(),
            remote.files.len(),
            delta.delta_size,
            delta.critical_count()
        ));
        Ok(Evaluation {
            outcome: CheckOutcome::UpdateAvailable(UpdateCheckResult {
                current_version: local.version,
                latest_version: latest.version,
                download_url: latest.archive_url,
                manifest_url: latest.manifest_url,
                release_notes: latest.release_notes,
                changed_files: delta.changed_files,
                delta_size: delta.delta_size,
                archive_size: latest.archive_size,
            }),
            remote: Some(remote),
        })
    }

    /// The installed manifest, or one hashed from disk at 0.0.0 when none was ever committed.
    async fn local_manifest(&self, settings: &UpdateSettings) -> Result<Manifest> {
        let path = settings.manifest_path(&self.install_root);
        if path.exists() {
            return Manifest::load(&path);
        }

        self.logger.warn(format!(
            "no manifest at {}, hashing the install directory",
            path.display()
        ));
        let install_root = self.install_root.clone();
        let options = BuildOptions::with_executable(settings.executable_name.clone());
        let logger = self.logger.scoped("manifest");
        tokio::task::spawn_blocking(move || {
            manifest::build(&install_root, Version::ZERO, &options, &logger)
        })
        .await
        .map_err(|e| UpdateError::Io(std::io::Error::other(format!("manifest build task failed: {e}"))))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::archive::tests::write_zip;
    use chrono::Duration as ChronoDuration;
    use mockito::{Mock, Server, ServerGuard};
    use serde_json::json;
    use std::fs;
    use std::path::Path;

    const RELEASES_PATH: &str = "/repos/acme/dashboard/releases?per_page=100";

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        install: PathBuf,
        work: PathBuf,
        store: SettingsStore,
    }

    impl Fixture {
        fn new(server: &ServerGuard, files: &[(&str, &[u8])]) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path().to_path_buf();
            let install = root.join("app");
            write_tree(&install, files);

            let store = SettingsStore::new(install.join("update-settings.json"));
            let mut settings = UpdateSettings::new("acme", "dashboard");
            settings.api_base_url = Some(server.url());
            store.save(&settings).unwrap();
            Self {
                _dir: dir,
                work: root.join("work"),
                root,
                install,
                store,
            }
        }

        fn commit_local(&self, version: &str) -> Manifest {
            let manifest = build(&self.install, version);
            manifest.save(&self.install.join("manifest.json")).unwrap();
            manifest
        }

        /// A manifest for the release tree `files`, built outside the install root.
        fn release_manifest(&self, version: &str, files: &[(&str, &[u8])]) -> Manifest {
            let tree = self.root.join(format!("release-{version}"));
            write_tree(&tree, files);
            build(&tree, version)
        }

        fn orchestrator(&self) -> UpdateOrchestrator {
            UpdateOrchestrator::new(
                self.store.clone(),
                self.install.clone(),
                UpdateLogger::new("updater"),
            )
            .with_work_dir(self.work.clone())
        }

        fn settings(&self) -> UpdateSettings {
            self.store.load().unwrap()
        }
    }

    fn write_tree(root: &Path, files: &[(&str, &[u8])]) {
        for (path, contents) in files {
            let target = staged_path(root, path);
            fs::create_dir_all(target.parent().unwrap()).unwrap();
            fs::write(target, contents).unwrap();
        }
    }

    fn build(root: &Path, version: &str) -> Manifest {
        manifest::build(
            root,
            version.parse().unwrap(),
            &BuildOptions::with_executable(None),
            &UpdateLogger::new("manifest"),
        )
        .unwrap()
    }

    async fn publish(server: &mut ServerGuard, tag: &str, archive_size: u64) -> Mock {
        let body = json!([{
            "tag_name": tag,
            "body": "fixes",
            "draft": false,
            "assets": [
                {"name": "dashboard.zip", "size": archive_size,
                 "browser_download_url": format!("{}/dl/dashboard.zip", server.url())},
                {"name": "manifest.json", "size": 100,
                 "browser_download_url": format!("{}/dl/manifest.json", server.url())}
            ]
        }]);
        server
            .mock("GET", RELEASES_PATH)
            .with_status(200)
            .with_body(body.to_string())
            .create_async()
            .await
    }

    async fn serve_manifest(server: &mut ServerGuard, manifest: &Manifest) -> Mock {
        server
            .mock("GET", "/dl/manifest.json")
            .with_status(200)
            .with_body(manifest.to_json_pretty().unwrap())
            .create_async()
            .await
    }

    #[tokio::test]
    async fn recent_check_is_skipped_unless_forced() {
        let mut server = Server::new_async().await;
        let fixture = Fixture::new(&server, &[("a.txt", b"a")]);
        let mut settings = fixture.settings();
        let last = Utc::now() - ChronoDuration::hours(1);
        settings.last_check_timestamp = Some(last);
        fixture.store.save(&settings).unwrap();
        let releases = server
            .mock("GET", RELEASES_PATH)
            .with_status(200)
            .with_body("[]")
            .expect(1)
            .create_async()
            .await;

        let outcome = fixture.orchestrator().check(false).await.unwrap();
        assert!(matches!(outcome, CheckOutcome::Skipped { next_check } if next_check == last + ChronoDuration::hours(24)));
        assert_eq!(fixture.settings().last_check_timestamp, Some(last));

        let outcome = fixture.orchestrator().check(true).await.unwrap();
        assert_eq!(outcome, CheckOutcome::NoReleases);
        assert!(fixture.settings().last_check_timestamp.unwrap() > last);
        releases.assert_async().await;
    }

    #[tokio::test]
    async fn failed_check_still_records_timestamp() {
        let mut server = Server::new_async().await;
        let fixture = Fixture::new(&server, &[("a.txt", b"a")]);
        fixture.commit_local("1.0.0");
        let _mock = server
            .mock("GET", RELEASES_PATH)
            .with_status(500)
            .create_async()
            .await;

        let err = fixture.orchestrator().check(false).await.unwrap_err();
        assert!(err.is_transient());
        assert!(fixture.settings().last_check_timestamp.is_some());
    }

    #[tokio::test]
    async fn older_or_equal_release_is_up_to_date_without_manifest_fetch() {
        let mut server = Server::new_async().await;
        let fixture = Fixture::new(&server, &[("a.txt", b"a")]);
        fixture.commit_local("2.0.0");
        let _releases = publish(&mut server, "v2.0.0", 10).await;
        let manifest = server
            .mock("GET", "/dl/manifest.json")
            .expect(0)
            .create_async()
            .await;

        let outcome = fixture.orchestrator().check(true).await.unwrap();
        assert_eq!(
            outcome,
            CheckOutcome::UpToDate {
                version: Version::new(2, 0, 0)
            }
        );
        manifest.assert_async().await;
    }

    #[tokio::test]
    async fn identical_files_never_reach_the_fetcher() {
        let mut server = Server::new_async().await;
        let files: &[(&str, &[u8])] = &[("a.txt", b"a"), ("bin/app.exe", b"app")];
        let fixture = Fixture::new(&server, files);
        fixture.commit_local("1.0.0");
        let remote = fixture.release_manifest("1.1.0", files);
        let _releases = publish(&mut server, "v1.1.0", 10).await;
        let _manifest = serve_manifest(&mut server, &remote).await;
        let archive = server
            .mock("GET", "/dl/dashboard.zip")
            .expect(0)
            .create_async()
            .await;

        let outcome = fixture
            .orchestrator()
            .check_and_apply(true, ApplyMode::InProcess, None)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            UpdateOutcome::NotApplied(CheckOutcome::UpToDate {
                version: Version::new(1, 0, 0)
            })
        );
        assert!(!env::staging_dir(&fixture.work).exists());
        archive.assert_async().await;
    }

    #[tokio::test]
    async fn missing_local_manifest_is_synthesized_but_not_written() {
        let mut server = Server::new_async().await;
        let files: &[(&str, &[u8])] = &[("a.txt", b"a"), ("b.txt", b"b")];
        let fixture = Fixture::new(&server, files);
        let remote = fixture.release_manifest("1.0.0", &[("a.txt", b"a"), ("b.txt", b"B")]);
        let _releases = publish(&mut server, "v1.0.0", 4_000).await;
        let _manifest = serve_manifest(&mut server, &remote).await;

        let outcome = fixture.orchestrator().check(true).await.unwrap();
        let CheckOutcome::UpdateAvailable(result) = outcome else {
            panic!("expected an update, got {outcome:?}");
        };
        assert_eq!(result.current_version, Version::ZERO);
        assert_eq!(result.latest_version, Version::new(1, 0, 0));
        assert_eq!(result.changed_files.len(), 1);
        assert_eq!(result.changed_files[0].relative_path, "b.txt");
        assert_eq!(result.delta_size, 1);
        assert_eq!(result.bandwidth_saved(), Some(3_999));
        assert!(!fixture.install.join("manifest.json").exists());
    }

    #[tokio::test]
    async fn applies_delta_in_process() {
        let mut server = Server::new_async().await;
        let fixture = Fixture::new(
            &server,
            &[("a.txt", b"old"), ("b.txt", b"same"), ("legacy.txt", b"gone")],
        );
        fixture.commit_local("1.0.0");
        let remote = fixture.release_manifest(
            "1.1.0",
            &[("a.txt", b"new"), ("b.txt", b"same"), ("lib/c.dll", b"c")],
        );

        let zip_path = fixture.root.join("dashboard.zip");
        write_zip(
            &zip_path,
            &[("a.txt", b"new"), ("b.txt", b"same"), ("lib/c.dll", b"c")],
        );
        let zip = fs::read(&zip_path).unwrap();
        let _releases = publish(&mut server, "v1.1.0", zip.len() as u64).await;
        let _manifest = serve_manifest(&mut server, &remote).await;
        let archive = server
            .mock("GET", "/dl/dashboard.zip")
            .with_status(200)
            .with_body(zip)
            .expect(1)
            .create_async()
            .await;

        let outcome = fixture
            .orchestrator()
            .check_and_apply(true, ApplyMode::InProcess, None)
            .await
            .unwrap();
        let UpdateOutcome::Applied { result, report } = outcome else {
            panic!("expected an applied update, got {outcome:?}");
        };
        assert_eq!(result.delta_size, 4);
        assert_eq!(report.copied, ["a.txt", "lib/c.dll"]);
        assert_eq!(fs::read(fixture.install.join("a.txt")).unwrap(), b"new");
        assert_eq!(fs::read(fixture.install.join("lib").join("c.dll")).unwrap(), b"c");
        assert_eq!(fs::read(fixture.install.join("legacy.txt")).unwrap(), b"gone");

        let committed = Manifest::load(&fixture.install.join("manifest.json")).unwrap();
        assert_eq!(committed, remote);
        assert!(!env::staging_dir(&fixture.work).exists());
        assert!(fixture.settings().last_check_timestamp.is_some());
        archive.assert_async().await;
    }

    /// Publish v1.1.0 with a package holding `files`. Keep the mocks alive for the test.
    async fn serve_package(
        server: &mut ServerGuard,
        fixture: &Fixture,
        files: &[(&str, &[u8])],
    ) -> (Mock, Mock) {
        let zip_path = fixture.root.join("dashboard.zip");
        write_zip(&zip_path, files);
        let zip = fs::read(&zip_path).unwrap();
        let releases = publish(server, "v1.1.0", zip.len() as u64).await;
        let archive = server
            .mock("GET", "/dl/dashboard.zip")
            .with_status(200)
            .with_body(zip)
            .create_async()
            .await;
        (releases, archive)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn read_only_install_is_staged_and_installed_through_elevation() {
        use crate::applier::tests::{RecordingElevation, lock_dir};
        use std::os::unix::fs::PermissionsExt;

        let mut server = Server::new_async().await;
        let fixture = Fixture::new(&server, &[("a.txt", b"old"), ("b.txt", b"same")]);
        fixture.commit_local("1.0.0");
        let remote = fixture.release_manifest("1.1.0", &[("a.txt", b"new"), ("b.txt", b"same")]);
        let _manifest = serve_manifest(&mut server, &remote).await;
        let _package = serve_package(&mut server, &fixture, &[("a.txt", b"new"), ("b.txt", b"same")]).await;
        if !lock_dir(&fixture.install) {
            return;
        }
        let elevation = Arc::new(RecordingElevation::default());
        let calls = elevation.calls.clone();

        let outcome = fixture
            .orchestrator()
            .with_elevation(elevation)
            .check_and_apply(true, ApplyMode::InProcess, None)
            .await;
        fs::set_permissions(&fixture.install, fs::Permissions::from_mode(0o755)).unwrap();

        let UpdateOutcome::Applied { report, .. } = outcome.unwrap() else {
            panic!("expected an applied update");
        };
        assert_eq!(report.copied, ["a.txt"]);
        assert_eq!(*calls.lock().unwrap(), [fixture.install.join("a.txt")]);
        assert_eq!(fs::read(fixture.install.join("a.txt")).unwrap(), b"new");
        assert_eq!(
            Manifest::load(&fixture.install.join("manifest.json")).unwrap(),
            remote
        );
        assert!(!fixture.install.join(".update").exists());
        assert!(!env::staging_dir(&fixture.work).exists());
    }

    #[tokio::test]
    async fn staging_never_touches_the_install_root() {
        let mut server = Server::new_async().await;
        let fixture = Fixture::new(&server, &[("a.txt", b"old")]);
        fixture.commit_local("1.0.0");
        let remote = fixture.release_manifest("1.1.0", &[("a.txt", b"new")]);
        let _manifest = serve_manifest(&mut server, &remote).await;
        let _package = serve_package(&mut server, &fixture, &[("a.txt", b"tampered")]).await;
        let listing = || {
            let mut names: Vec<_> = fs::read_dir(&fixture.install)
                .unwrap()
                .map(|e| e.unwrap().file_name())
                .collect();
            names.sort();
            names
        };
        let before = listing();

        let err = fixture
            .orchestrator()
            .check_and_apply(true, ApplyMode::InProcess, None)
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::HashMismatch { .. }));
        assert_eq!(listing(), before);
        assert!(fixture.work.exists());
    }

    #[tokio::test]
    async fn corrupt_package_leaves_install_and_manifest_untouched() {
        let mut server = Server::new_async().await;
        let fixture = Fixture::new(&server, &[("a.txt", b"old"), ("b.txt", b"old")]);
        let local = fixture.commit_local("1.0.0");
        let remote = fixture.release_manifest("1.1.0", &[("a.txt", b"new"), ("b.txt", b"new")]);

        let zip_path = fixture.root.join("dashboard.zip");
        write_zip(&zip_path, &[("a.txt", b"new"), ("b.txt", b"tampered")]);
        let zip = fs::read(&zip_path).unwrap();
        let _releases = publish(&mut server, "v1.1.0", zip.len() as u64).await;
        let _manifest = serve_manifest(&mut server, &remote).await;
        let _archive = server
            .mock("GET", "/dl/dashboard.zip")
            .with_status(200)
            .with_body(zip)
            .create_async()
            .await;

        let err = fixture
            .orchestrator()
            .check_and_apply(true, ApplyMode::InProcess, None)
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::HashMismatch { ref path, .. } if path == "b.txt"));
        assert_eq!(fs::read(fixture.install.join("a.txt")).unwrap(), b"old");
        assert_eq!(
            Manifest::load(&fixture.install.join("manifest.json")).unwrap(),
            local
        );
        assert!(!env::staging_dir(&fixture.work).exists());
    }

    #[tokio::test]
    async fn cancelled_cycle_discards_staging() {
        let mut server = Server::new_async().await;
        let fixture = Fixture::new(&server, &[("a.txt", b"old")]);
        let local = fixture.commit_local("1.0.0");
        let remote = fixture.release_manifest("1.1.0", &[("a.txt", b"new")]);
        let zip_path = fixture.root.join("dashboard.zip");
        write_zip(&zip_path, &[("a.txt", b"new")]);
        let zip = fs::read(&zip_path).unwrap();
        let _releases = publish(&mut server, "v1.1.0", zip.len() as u64).await;
        let _manifest = serve_manifest(&mut server, &remote).await;
        let _archive = server
            .mock("GET", "/dl/dashboard.zip")
            .with_status(200)
            .with_body(zip)
            .create_async()
            .await;

        let cancel = Arc::new(AtomicBool::new(true));
        let err = fixture
            .orchestrator()
            .with_cancel(cancel)
            .check_and_apply(true, ApplyMode::InProcess, None)
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::Cancelled));
        assert_eq!(fs::read(fixture.install.join("a.txt")).unwrap(), b"old");
        assert_eq!(
            Manifest::load(&fixture.install.join("manifest.json")).unwrap(),
            local
        );
        assert!(!env::staging_dir(&fixture.work).exists());
    }
}
