use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::{Parser, Subcommand};
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::error;
use tokio::runtime::{Builder, Runtime};

mod applier;
mod delta;
mod env;
mod error;
mod fetcher;
mod logging;
mod manifest;
mod networking;
mod process;
mod release;
mod storage;
mod updater;
mod util;
mod version;

use applier::elevation::{Elevation, NoElevation, SystemElevation};
use applier::{ApplyPlan, UpdateApplier};
use error::{Result, UpdateError};
use logging::UpdateLogger;
use manifest::{BuildOptions, Manifest};
use networking::ProgressUpdate;
use process::SystemHostMonitor;
use storage::SettingsStore;
use updater::{ApplyMode, CheckOutcome, UpdateCheckResult, UpdateOrchestrator, UpdateOutcome};
use util::format_bytes;
use version::Version;

#[derive(Parser, Debug)]
#[command(
    name = "delta-updater",
    author,
    version,
    about = "Delta self-updater: downloads and installs only the files a release changed"
)]
struct Cli {
    /// Settings file (default: update-settings.json in the install root).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Installation directory (default: directory of this executable).
    #[arg(long, global = true)]
    install_root: Option<PathBuf>,

    /// Staging and helper directory (default: per-user data directory).
    #[arg(long, global = true)]
    work_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check for a newer release and report what would be downloaded.
    Check {
        /// Ignore the configured check interval.
        #[arg(long)]
        force: bool,
    },
    /// Check, download the changed files and install them.
    Update {
        #[arg(long)]
        force: bool,
        /// Replace files from this process instead of a detached helper.
        #[arg(long)]
        in_process: bool,
        /// Fail instead of asking for administrator rights.
        #[arg(long)]
        no_elevate: bool,
    },
    /// Install a staged update once the host process has exited.
    Apply {
        #[arg(long)]
        staging: PathBuf,
        #[arg(long)]
        host_pid: u32,
        #[arg(long)]
        manifest: PathBuf,
        #[arg(long)]
        local_manifest: Option<PathBuf>,
        #[arg(long)]
        relaunch: Option<PathBuf>,
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
    /// Hash a release tree into a manifest.
    BuildManifest {
        #[arg(long)]
        root: PathBuf,
        #[arg(long = "version")]
        release_version: String,
        #[arg(long)]
        out: Option<PathBuf>,
        /// Host executable, relative to the root.
        #[arg(long)]
        executable: Option<String>,
        /// Extra file names to treat as critical.
        #[arg(long)]
        critical: Vec<String>,
    },
    /// Show the files that differ between two manifests.
    Diff { local: PathBuf, remote: PathBuf },
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            error!("{err}");
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let explicit_root = cli.install_root.clone();
    let install_root = cli
        .install_root
        .unwrap_or_else(env::default_install_root);
    let store = SettingsStore::new(
        cli.settings
            .unwrap_or_else(|| env::default_settings_path(&install_root)),
    );
    let logger = UpdateLogger::new("cli");
    let work_dir = cli
        .work_dir
        .unwrap_or_else(|| env::work_dir(&install_root));

    match cli.command {
        Command::Check { force } => {
            let orchestrator = UpdateOrchestrator::new(store, install_root, logger.scoped("updater"))
                .with_work_dir(work_dir);
            let outcome = build_runtime()?.block_on(orchestrator.check(force))?;
            print_check(&outcome)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Update {
            force,
            in_process,
            no_elevate,
        } => {
            let cancel = Arc::new(AtomicBool::new(false));
            let mut orchestrator = UpdateOrchestrator::new(store, install_root, logger.scoped("updater"))
                .with_work_dir(work_dir)
                .with_cancel(cancel.clone());
            if no_elevate {
                orchestrator = orchestrator.with_elevation(Arc::new(NoElevation));
            }
            let mode = if in_process {
                ApplyMode::InProcess
            } else {
                ApplyMode::Helper {
                    host_pid: std::process::id(),
                }
            };

            let bar = download_bar();
            let mut on_progress = |update: ProgressUpdate| {
                bar.set_position(update.progress.clamp(0.0, 100.0) as u64);
                bar.set_message(progress_message(&update));
            };
            let outcome = build_runtime()?.block_on(async {
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        cancel.store(true, Ordering::SeqCst);
                    }
                });
                orchestrator
                    .check_and_apply(force, mode, Some(&mut on_progress))
                    .await
            });
            bar.finish_and_clear();

            match outcome? {
                UpdateOutcome::NotApplied(outcome) => print_check(&outcome)?,
                UpdateOutcome::Applied { result, report } => {
                    print_savings(&result);
                    println!(
                        "Installed {} ({} file(s) replaced).",
                        result.latest_version,
                        report.copied.len()
                    );
                }
                UpdateOutcome::HelperLaunched { result, helper_pid } => {
                    print_savings(&result);
                    println!(
                        "Update {} staged; helper {helper_pid} installs it once this process exits.",
                        result.latest_version
                    );
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Apply {
            staging,
            host_pid,
            manifest,
            local_manifest,
            relaunch,
            timeout_secs,
        } => {
            let Some(install_root) = explicit_root else {
                return Err(UpdateError::Settings("apply requires --install-root".into()));
            };
            // The staging area sits in the work directory, next to the log.
            let log_path = env::apply_log_path(staging.parent().unwrap_or(work_dir.as_path()));
            run_apply(
                ApplyPlan {
                    staging_files_dir: staging.join(fetcher::STAGED_FILES_DIR),
                    expected_files_path: staging.join(fetcher::STAGED_EXPECTED_FILE),
                    local_manifest_path: local_manifest
                        .unwrap_or_else(|| env::default_manifest_path(&install_root)),
                    install_root,
                    host_pid: Some(host_pid),
                    new_manifest_path: manifest,
                    relaunch,
                },
                Duration::from_secs(timeout_secs),
                &log_path,
                Box::new(SystemElevation::new(logger.scoped("elevation"))),
            )
        }
        Command::BuildManifest {
            root,
            release_version,
            out,
            executable,
            critical,
        } => {
            let version: Version = release_version.parse()?;
            let mut options = BuildOptions::with_executable(executable);
            options.critical_names.extend(critical);
            let built = manifest::build(&root, version, &options, &logger.scoped("manifest"))?;
            let out = out.unwrap_or_else(|| env::default_manifest_path(&root));
            built.save(&out)?;
            println!(
                "Wrote {} for {}: {} files, {}.",
                out.display(),
                built.version,
                built.files.len(),
                format_bytes(built.total_size)
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Diff { local, remote } => {
            let local = Manifest::load(&local)?;
            let remote = Manifest::load(&remote)?;
            let delta = delta::compute_delta(&local, &remote);
            for entry in &delta.changed_files {
                let marker = if entry.is_critical { "!" } else { " " };
                println!("{marker} {:>10}  {}", entry.file_size, entry.relative_path);
            }
            for path in &delta.stale_files {
                println!("- {:>10}  {path}", "stale");
            }
            println!(
                "{} -> {}: {} of {} files changed, {} to download.",
                local.version,
                remote.version,
                delta.changed_files.len(),
                remote.files.len(),
                format_bytes(delta.delta_size)
            );
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Helper entry point. Runs detached, so the outcome also goes to `log_path`.
fn run_apply(
    plan: ApplyPlan,
    timeout: Duration,
    log_path: &Path,
    elevation: Box<dyn Elevation>,
) -> Result<ExitCode> {
    let base = UpdateLogger::new("helper");
    let logger = match base.clone().with_file(log_path) {
        Ok(logger) => logger,
        Err(err) => {
            base.warn(format!("apply log unavailable: {err}"));
            base
        }
    };
    logger.info(format!(
        "applying {} into {}",
        plan.new_manifest_path.display(),
        plan.install_root.display()
    ));

    let mut applier = UpdateApplier::new(
        logger.scoped("applier"),
        Box::new(SystemHostMonitor),
        elevation,
        None,
        timeout,
    );
    match applier.apply(plan) {
        Ok(report) => {
            logger.info(format!(
                "update {}: {} file(s) replaced{}",
                applier.state(),
                report.copied.len(),
                report
                    .relaunched
                    .map(|pid| format!(", relaunched as {pid}"))
                    .unwrap_or_default()
            ));
            Ok(ExitCode::SUCCESS)
        }
        Err(failure) => {
            logger.error(format!(
                "update failed in state '{}': {}",
                failure.failed_in, failure.source
            ));
            Ok(ExitCode::from(2))
        }
    }
}

fn print_check(outcome: &CheckOutcome) -> Result<()> {
    match outcome {
        CheckOutcome::Skipped { next_check } => {
            println!("Checked recently; next check after {}.", next_check.to_rfc3339());
        }
        CheckOutcome::NoReleases => println!("No releases published yet."),
        CheckOutcome::UpToDate { version } => println!("Up to date ({version})."),
        CheckOutcome::UpdateAvailable(result) => {
            println!("{}", serde_json::to_string_pretty(result)?);
            print_savings(result);
        }
    }
    Ok(())
}

fn print_savings(result: &UpdateCheckResult) {
    let changed = format!(
        "{} -> {}: {} file(s), {}",
        result.current_version,
        result.latest_version,
        result.changed_files.len(),
        format_bytes(result.delta_size)
    );
    match (result.archive_size, result.bandwidth_saved()) {
        (Some(archive), Some(saved)) => println!(
            "{changed} instead of {} ({} saved).",
            format_bytes(archive),
            format_bytes(saved)
        ),
        _ => println!("{changed}."),
    }
}

fn progress_message(update: &ProgressUpdate) -> String {
    let mut message = match &update.current_file {
        Some(file) if update.stage != "download" => format!("{}: {file}", update.message),
        _ => update.message.clone(),
    };
    let mut details = Vec::new();
    if update.stage == "download"
        && let (Some(done), Some(total)) = (update.downloaded, update.total)
    {
        details.push(format!("{} of {}", format_bytes(done), format_bytes(total)));
    }
    if let Some(speed) = &update.speed {
        details.push(speed.clone());
    }
    if !details.is_empty() {
        message = format!("{message} ({})", details.join(", "));
    }
    message
}

fn download_bar() -> ProgressBar {
    let bar = ProgressBar::new(100);
    if let Ok(style) = ProgressStyle::with_template("  {msg} [{bar:30}] {pos}%") {
        bar.set_style(style);
    }
    bar
}

fn build_runtime() -> Result<Runtime> {
    match Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => Ok(rt),
        Err(err) => {
            log::warn!("failed to create multithreaded runtime ({err}); trying single-threaded runtime");
            Ok(Builder::new_current_thread().enable_all().build()?)
        }
    }
}
