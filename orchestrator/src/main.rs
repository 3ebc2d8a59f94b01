//! Command line entry point
//!
//! Wires the git-backed source and producer, the filesystem artifact store
//! and the JSON-snapshotted memory store into the orchestrator, then runs a
//! single command or the background daemon.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::{signal, sync::mpsc};

use paper_orchestrator::{
    services::{CommandProducer, ConfiguredNotifier, FsArtifactStore, GitCliSource, MemoryStore, SystemClock},
    EngineConfig, EntityStore, Orchestrator,
};
use shared::{
    logging, process_debug, process_info, Paper, PaperId, ProcessId, ProductionMode, RepoRef, Repository,
    RepositoryId, TrackedFile, UserId, VersionId,
};

type CliOrchestrator = Orchestrator<
    MemoryStore,
    GitCliSource,
    CommandProducer<FsArtifactStore>,
    FsArtifactStore,
    ConfiguredNotifier,
    SystemClock,
>;

/// Keeps mirrored paper PDFs in step with their source repositories
#[derive(Parser)]
#[command(name = "paper-orchestrator")]
#[command(about = "Refreshes mirrored repositories and rebuilds the papers they track")]
pub struct Args {
    /// Tracing endpoint URL
    #[arg(long)]
    pub trace_ep: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// JSON snapshot of the entity store
    #[arg(long, default_value = "./paper-state.json")]
    pub state: PathBuf,

    /// Directory holding produced artifacts
    #[arg(long, default_value = "./artifacts")]
    pub artifact_dir: PathBuf,

    /// Directory holding bare mirrors of the remotes
    #[arg(long, default_value = "./mirrors")]
    pub mirror_dir: PathBuf,

    /// Webhook receiving notifications (logged when absent)
    #[arg(long)]
    pub webhook: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Register a remote repository
    AddRepo {
        #[arg(long)]
        user: String,
        #[arg(long)]
        remote: String,
        #[arg(long, default_value = "main")]
        branch: String,
        /// Include the repository in the periodic background refresh
        #[arg(long)]
        background: bool,
    },
    /// Track a file inside a repository as a paper
    Track {
        #[arg(long)]
        user: String,
        #[arg(long)]
        repo: String,
        #[arg(long)]
        path: String,
        #[arg(long, value_enum, default_value = "compile")]
        mode: ModeArg,
        #[arg(long)]
        title: Option<String>,
    },
    /// Refresh one repository
    Refresh {
        #[arg(long)]
        user: String,
        #[arg(long)]
        repo: String,
    },
    /// Build one paper
    Build {
        #[arg(long)]
        user: String,
        #[arg(long)]
        paper: String,
        /// Rebuild even when nothing changed
        #[arg(long)]
        force: bool,
    },
    /// Refresh every repository of a user
    RefreshAll {
        #[arg(long)]
        user: String,
        /// Ignore the minimum refresh interval
        #[arg(long)]
        force: bool,
    },
    /// Build every paper that never built or is out of date
    BuildStale {
        #[arg(long)]
        user: String,
    },
    /// Clear a stuck or failed repository refresh
    Reset {
        #[arg(long)]
        user: String,
        #[arg(long)]
        repo: String,
    },
    /// Pin or unpin a paper version
    Pin {
        #[arg(long)]
        user: String,
        #[arg(long)]
        version: String,
        #[arg(long)]
        unpin: bool,
    },
    /// Show repositories and papers of a user
    Status {
        #[arg(long)]
        user: String,
    },
    /// Run background refreshes and deferred tasks until Ctrl+C
    Daemon,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum ModeArg {
    Committed,
    Compile,
}

impl From<ModeArg> for ProductionMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Committed => ProductionMode::Committed,
            ModeArg::Compile => ProductionMode::Compile,
        }
    }
}

fn user_id(raw: &str) -> Result<UserId> {
    UserId::from_string(raw).with_context(|| format!("invalid user id '{raw}'"))
}

fn repository_id(raw: &str) -> Result<RepositoryId> {
    RepositoryId::from_string(raw).with_context(|| format!("invalid repository id '{raw}'"))
}

fn paper_id(raw: &str) -> Result<PaperId> {
    PaperId::from_string(raw).with_context(|| format!("invalid paper id '{raw}'"))
}

fn version_id(raw: &str) -> Result<VersionId> {
    VersionId::from_string(raw).with_context(|| format!("invalid version id '{raw}'"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let daemon = matches!(args.command, Command::Daemon);
    if daemon {
        ProcessId::init_daemon();
    } else {
        ProcessId::init_cli();
    }

    let trace_endpoint = args
        .trace_ep
        .as_ref()
        .map(|url| logging::TracingEndpoint::new(url.clone()));
    logging::init_tracing_with_endpoint_and_level(trace_endpoint, Some(&args.log_level));

    let config = EngineConfig::from_env().context("loading engine configuration")?;
    let store = Arc::new(
        MemoryStore::load(&args.state)
            .await
            .with_context(|| format!("loading state from {}", args.state.display()))?,
    );
    let git = Arc::new(GitCliSource::new(args.mirror_dir.clone()));
    let artifacts = Arc::new(FsArtifactStore::new(args.artifact_dir.clone()));
    let producer = Arc::new(CommandProducer::latexmk(git.clone(), artifacts.clone()));
    let notifier = Arc::new(ConfiguredNotifier::from_url(args.webhook.clone()));

    let orchestrator = Arc::new(Orchestrator::new(
        store,
        git,
        producer,
        artifacts,
        notifier,
        Arc::new(SystemClock),
        config,
    ));

    if daemon {
        logging::log_startup(ProcessId::current(), "background refresh daemon");
        run_daemon(orchestrator, &args.state).await?;
        logging::log_success(ProcessId::current(), "Daemon stopped gracefully");
        return Ok(());
    }

    let result = run_command(&orchestrator, args.command).await;

    // Deferred cleanup and notifications from this command
    match orchestrator.run_outbox_once().await {
        Ok(report) => process_debug!(ProcessId::current(), "Outbox handled {} task(s)", report.handled()),
        Err(e) => logging::log_error(ProcessId::current(), "Outbox", &e),
    }
    save(&orchestrator, &args.state).await?;

    result
}

async fn save(orchestrator: &CliOrchestrator, path: &Path) -> Result<()> {
    orchestrator
        .store()
        .save(path)
        .await
        .with_context(|| format!("saving state to {}", path.display()))
}

async fn run_command(orchestrator: &CliOrchestrator, command: Command) -> Result<()> {
    let store = orchestrator.store();
    match command {
        Command::AddRepo {
            user,
            remote,
            branch,
            background,
        } => {
            let mut repository = Repository::new(user_id(&user)?, RepoRef::new(remote), branch);
            repository.background_refresh = background;
            let id = repository.id.clone();
            store.insert_repository(repository).await?;
            println!("{id}");
        }
        Command::Track {
            user,
            repo,
            path,
            mode,
            title,
        } => {
            let user = user_id(&user)?;
            let repository_id = repository_id(&repo)?;
            let repository = store
                .get_repository(&repository_id)
                .await?
                .filter(|r| r.user_id == user)
                .with_context(|| format!("repository {repository_id} not found"))?;

            let file = TrackedFile::new(repository.id, path.clone(), mode.into());
            let paper = Paper::tracking(user, &file, title.unwrap_or(path));
            let id = paper.id.clone();
            store.insert_tracked_file(file).await?;
            store.insert_paper(paper).await?;
            println!("{id}");
        }
        Command::Refresh { user, repo } => {
            let outcome = orchestrator
                .request_refresh(&user_id(&user)?, &repository_id(&repo)?)
                .await?;
            println!("{outcome:?}");
        }
        Command::Build { user, paper, force } => {
            let outcome = orchestrator
                .request_build(&user_id(&user)?, &paper_id(&paper)?, force)
                .await?;
            println!("{outcome:?}");
        }
        Command::RefreshAll { user, force } => {
            let summary = orchestrator.request_refresh_all(&user_id(&user)?, force).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::BuildStale { user } => {
            let summary = orchestrator.build_stale(&user_id(&user)?).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Reset { user, repo } => {
            orchestrator
                .reset_repository(&user_id(&user)?, &repository_id(&repo)?)
                .await?;
            process_info!(ProcessId::current(), "🔓 Repository {} reset", repo);
        }
        Command::Pin { user, version, unpin } => {
            orchestrator
                .set_version_pinned(&user_id(&user)?, &version_id(&version)?, !unpin)
                .await?;
        }
        Command::Status { user } => {
            let user = user_id(&user)?;
            for repository in store.list_repositories(&user).await? {
                println!(
                    "repo  {} {} [{:?}] head={}",
                    repository.id,
                    repository.source,
                    repository.sync_status,
                    repository.last_commit_hash.as_deref().unwrap_or("-"),
                );
            }
            for paper in store.list_papers(&user).await? {
                let state = orchestrator.paper_sync_state(&user, &paper.id).await?;
                println!(
                    "paper {} {} [{}] commit={}",
                    paper.id,
                    paper.title,
                    state,
                    paper.cached_commit_hash.as_deref().unwrap_or("-"),
                );
            }
        }
        Command::Daemon => anyhow::bail!("daemon cannot run as a one-shot command"),
    }
    Ok(())
}

async fn run_daemon(orchestrator: Arc<CliOrchestrator>, state: &Path) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let worker = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run_outbox(shutdown_rx).await })
    };

    let mut ticker = tokio::time::interval(orchestrator.config().batch.background_interval);
    loop {
        tokio::select! {
            signal = signal::ctrl_c() => {
                match signal {
                    Ok(()) => logging::log_shutdown(ProcessId::current(), "Received Ctrl+C signal"),
                    Err(err) => logging::log_error(ProcessId::current(), "Signal handling", &err),
                }
                break;
            }
            _ = ticker.tick() => {
                if let Err(e) = orchestrator.background_tick().await {
                    logging::log_error(ProcessId::current(), "Background tick", &e);
                }
                save(&orchestrator, state).await?;
            }
        }
    }

    let _ = shutdown_tx.send(()).await;
    worker.await.context("outbox worker panicked")?;
    save(&orchestrator, state).await
}
