//! anvil - parallel-track agent orchestration harness
//!
//! Command-line surface: `debug run`, `debug resume`, `harden run`, and the
//! `cleanup` family. The binary validates inputs into a `SessionConfig`,
//! drives the session, and maps failure classes onto stable exit codes.

use anvil::session::{self, SessionError};
use anvil::{cleanup, EXIT_ENV, EXIT_FAIL, EXIT_INPUT, EXIT_OK, EXIT_SCHEMA_DRIFT};
use anvil_core::{load_tracks_with_defaults, validate_name, Mode, RunStatus, SessionConfig, TrackBudget};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Parallel-track agent orchestration harness.
#[derive(Parser)]
#[command(name = "anvil")]
#[command(about = "Drive parallel AI coding agents against a repository")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fix a known defect with parallel fixer tracks
    Debug {
        #[command(subcommand)]
        command: DebugCommand,
    },
    /// Hunt for latent defects with breaker tracks
    Harden {
        #[command(subcommand)]
        command: HardenCommand,
    },
    /// Remove run state (branches, worktrees, artifacts)
    Cleanup {
        #[command(subcommand)]
        command: CleanupCommand,
    },
}

#[derive(Args)]
struct CommonRunArgs {
    /// Path to the target repository
    #[arg(long, default_value = ".")]
    repo: PathBuf,

    /// Path to the tracks configuration file
    #[arg(long)]
    tracks: PathBuf,

    /// Run identifier (generated when omitted)
    #[arg(long)]
    run_id: Option<String>,

    /// Run agents and verification inside a container
    #[arg(long, env = "ANVIL_CONTAINER")]
    container: bool,
}

#[derive(Subcommand)]
enum DebugCommand {
    /// Start a debug session
    Run {
        #[command(flatten)]
        common: CommonRunArgs,

        /// Issue text describing the defect
        #[arg(long, conflicts_with = "issue_file")]
        issue: Option<String>,

        /// File containing the issue text
        #[arg(long)]
        issue_file: Option<PathBuf>,

        /// Apply the winning patch to the repository
        #[arg(long, env = "ANVIL_AUTO_APPLY")]
        auto_apply: bool,

        /// Resume a previous run with the same run id
        #[arg(long)]
        resume: bool,
    },
    /// Resume a previous debug session
    Resume {
        /// Path to the target repository
        #[arg(long, default_value = ".")]
        repo: PathBuf,

        /// Run identifier of the session to resume
        #[arg(long)]
        run_id: String,
    },
}

#[derive(Subcommand)]
enum HardenCommand {
    /// Start a harden session
    Run {
        #[command(flatten)]
        common: CommonRunArgs,

        /// Verify patches produced by breaker tracks
        #[arg(long)]
        verify_patches: bool,
    },
}

#[derive(Subcommand)]
enum CleanupCommand {
    /// Remove one run's branches, worktrees, and artifacts
    Run {
        #[arg(long, default_value = ".")]
        repo: PathBuf,
        #[arg(long)]
        run_id: String,
    },
    /// List known runs and their status
    List {
        #[arg(long, default_value = ".")]
        repo: PathBuf,
    },
    /// Remove runs older than the given number of days
    Stale {
        #[arg(long, default_value = ".")]
        repo: PathBuf,
        #[arg(long)]
        older_than: i64,
    },
    /// Remove every run
    All {
        #[arg(long, default_value = ".")]
        repo: PathBuf,
    },
}

fn main() {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    let code = runtime.block_on(dispatch(cli.command));
    std::process::exit(code);
}

async fn dispatch(command: Command) -> i32 {
    match command {
        Command::Debug { command } => match command {
            DebugCommand::Run {
                common,
                issue,
                issue_file,
                auto_apply,
                resume,
            } => {
                let issue = match resolve_issue(issue, issue_file) {
                    Ok(issue) => issue,
                    Err(message) => return input_error(&message),
                };
                let config = match build_config(
                    &common,
                    Mode::Debug,
                    issue,
                    resume,
                    auto_apply,
                    true,
                ) {
                    Ok(config) => config,
                    Err(message) => return input_error(&message),
                };
                run_session(config).await
            }
            DebugCommand::Resume { repo, run_id } => resume_session(&repo, &run_id).await,
        },
        Command::Harden { command } => match command {
            HardenCommand::Run {
                common,
                verify_patches,
            } => {
                let config = match build_config(
                    &common,
                    Mode::Harden,
                    None,
                    false,
                    false,
                    verify_patches,
                ) {
                    Ok(config) => config,
                    Err(message) => return input_error(&message),
                };
                run_session(config).await
            }
        },
        Command::Cleanup { command } => run_cleanup(command),
    }
}

fn input_error(message: &str) -> i32 {
    eprintln!("anvil: {message}");
    EXIT_INPUT
}

fn resolve_issue(
    issue: Option<String>,
    issue_file: Option<PathBuf>,
) -> Result<Option<String>, String> {
    match (issue, issue_file) {
        (Some(text), None) => Ok(Some(text)),
        (None, Some(path)) => std::fs::read_to_string(&path)
            .map(Some)
            .map_err(|e| format!("failed to read issue file {}: {e}", path.display())),
        (None, None) => Ok(None),
        (Some(_), Some(_)) => Err("pass either --issue or --issue-file, not both".to_string()),
    }
}

fn build_config(
    common: &CommonRunArgs,
    mode: Mode,
    issue: Option<String>,
    resume: bool,
    auto_apply: bool,
    verify_patches: bool,
) -> Result<SessionConfig, String> {
    let run_id = common.run_id.clone().unwrap_or_else(generate_run_id);
    validate_name(&run_id).map_err(|e| format!("invalid run id: {e}"))?;

    let tracks = load_tracks_with_defaults(&common.tracks, budget_defaults())
        .map_err(|e| format!("tracks file: {e}"))?;

    let repo = common
        .repo
        .canonicalize()
        .map_err(|e| format!("repository path {}: {e}", common.repo.display()))?;

    Ok(SessionConfig {
        run_id,
        dbg_root: repo.join(".dbg"),
        repo,
        mode,
        issue,
        resume,
        auto_apply,
        container: common.container,
        verify_patches,
        tracks,
    })
}

/// Budget defaults, with the per-iteration timeout overridable from the
/// environment.
fn budget_defaults() -> TrackBudget {
    let mut defaults = TrackBudget::default();
    if let Some(timeout_s) = std::env::var("ANVIL_ITER_TIMEOUT_S")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
    {
        defaults.per_iter_timeout_s = timeout_s;
    }
    defaults
}

fn generate_run_id() -> String {
    // Time-ordered and unique without coordination.
    let now = chrono::Utc::now().format("%Y%m%d-%H%M%S");
    let tail = uuid::Uuid::now_v7().simple().to_string();
    format!("{now}-{}", &tail[tail.len() - 6..])
}

async fn run_session(config: SessionConfig) -> i32 {
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received interrupt; shutting down gracefully");
            interrupt.cancel();
        }
    });

    info!(
        run_id = %config.run_id,
        mode = config.mode.as_str(),
        tracks = config.tracks.len(),
        "starting session"
    );

    match session::run(&config, cancel).await {
        Ok(report) => {
            println!(
                "run {} finished: {} (winner: {}); artifacts in {}",
                config.run_id,
                report.status.as_str(),
                report.scorecard.winner.as_deref().unwrap_or("none"),
                report.run_dir.display(),
            );
            if report.status == RunStatus::Fail {
                EXIT_FAIL
            } else {
                EXIT_OK
            }
        }
        Err(e) => {
            let code = match &e {
                SessionError::Env(_) => EXIT_ENV,
                SessionError::ResumeDrift { .. } => EXIT_SCHEMA_DRIFT,
                _ => EXIT_FAIL,
            };
            error!(error = %e, "session failed");
            eprintln!(
                "anvil: session failed: {e}; see {}",
                config.run_dir().display()
            );
            code
        }
    }
}

async fn resume_session(repo: &Path, run_id: &str) -> i32 {
    if let Err(e) = validate_name(run_id) {
        return input_error(&format!("invalid run id: {e}"));
    }
    let repo = match repo.canonicalize() {
        Ok(repo) => repo,
        Err(e) => return input_error(&format!("repository path: {e}")),
    };
    let dbg_root = repo.join(".dbg");

    // Rebuild the configuration from the persisted run metadata.
    let meta_path = dbg_root.join("runs").join(run_id).join("RUN.json");
    let meta: anvil_core::RunMeta = match std::fs::read_to_string(&meta_path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(meta) => meta,
            Err(e) => {
                eprintln!("anvil: corrupt RUN.json for run {run_id}: {e}");
                return EXIT_SCHEMA_DRIFT;
            }
        },
        Err(e) => return input_error(&format!("no run metadata at {}: {e}", meta_path.display())),
    };

    let config = SessionConfig {
        run_id: run_id.to_string(),
        dbg_root,
        repo,
        mode: meta.mode,
        issue: meta.issue.clone(),
        resume: true,
        auto_apply: false,
        container: false,
        verify_patches: true,
        tracks: meta.tracks,
    };
    run_session(config).await
}

fn run_cleanup(command: CleanupCommand) -> i32 {
    let result = match command {
        CleanupCommand::Run { repo, run_id } => {
            if let Err(e) = validate_name(&run_id) {
                return input_error(&format!("invalid run id: {e}"));
            }
            cleanup::cleanup_run(&repo, &repo.join(".dbg"), &run_id)
                .map(|()| println!("cleaned run {run_id}"))
        }
        CleanupCommand::List { repo } => cleanup::list_runs(&repo.join(".dbg")).map(|runs| {
            if runs.is_empty() {
                println!("no runs");
            }
            for run in runs {
                println!(
                    "{}\t{}\t{}",
                    run.run_id,
                    run.status.as_deref().unwrap_or("-"),
                    run.updated_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "-".to_string()),
                );
            }
        }),
        CleanupCommand::Stale { repo, older_than } => {
            cleanup::cleanup_stale(&repo, &repo.join(".dbg"), older_than).map(|removed| {
                println!("removed {} stale run(s)", removed.len());
            })
        }
        CleanupCommand::All { repo } => {
            cleanup::cleanup_all(&repo, &repo.join(".dbg")).map(|removed| {
                println!("removed {} run(s)", removed.len());
            })
        }
    };

    match result {
        Ok(()) => EXIT_OK,
        Err(e) => {
            eprintln!("anvil: cleanup failed: {e}");
            EXIT_FAIL
        }
    }
}
