mod error;
mod progress;
mod prompt;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Result;
use clap::{Parser, Subcommand};
use error::ClientError;
use git::{GitService, RemoteOperationResult, ResultCode, StageSide};
use progress::ProgressView;
use prompt::TerminalPrompter;
use services::services::{
    config::{Config, ConfigError, load_config_from_file, save_config_to_file},
    credentials::FileCredentialStore,
    engine::LocalRepo,
    remote_operation::RemoteOperationCoordinator,
    staging::StagingAction,
    status::PathStatus,
    working_copy::{BatchOutcome, TransitionOutcome, WorkingCopy},
};
use tracing::debug;
use utils::text::first_line;

#[derive(Parser, Debug)]
#[command(name = "stagehand")]
#[command(
    about = "Stage, unstage and resolve changes in a git working copy, and keep it in sync with its remote. Paths are relative to the repository root."
)]
#[command(version)]
struct Args {
    /// Repository to work in
    #[arg(
        short = 'C',
        long,
        global = true,
        env = "STAGEHAND_REPO",
        default_value = "."
    )]
    repo: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List changed paths with their status tags
    Status,
    /// Stage paths
    Stage {
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Unstage paths
    Unstage {
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Stage, unstage or resolve each path, whichever applies
    Toggle {
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Mark conflicted paths as resolved, optionally taking one side
    Resolve {
        #[arg(required = true)]
        paths: Vec<String>,
        /// Keep our version
        #[arg(long, conflicts_with = "theirs")]
        ours: bool,
        /// Keep their version
        #[arg(long)]
        theirs: bool,
    },
    /// Throw away unstaged changes to paths
    Revert {
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Stage everything with unstaged changes
    StageAll,
    /// Unstage everything that is staged
    UnstageAll,
    /// Commit the staged changes
    Commit {
        #[arg(short, long)]
        message: String,
    },
    /// Fetch from the default remote
    Fetch,
    /// Fetch and merge the upstream of the current branch
    Pull,
    /// Push the current branch, or the given refspec
    Push { refspec: Option<String> },
    /// Clone a repository
    Clone { url: String, target: PathBuf },
    /// Print the effective settings
    Settings {
        /// Also save them to the settings file
        #[arg(long)]
        write: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config_from_file(&utils::paths::settings_path()).await;

    let level = if args.verbose {
        "debug"
    } else {
        config.log_level.as_str()
    };
    utils::logging::init(level);

    debug!("Args: {:?}", args);

    if let Err(e) = run(args, config).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }

    Ok(())
}

async fn run(args: Args, config: Config) -> Result<(), ClientError> {
    let repo_path = args.repo;
    match args.command {
        Command::Clone { url, target } => clone(&config, url, target).await,
        Command::Settings { write } => settings(&config, write).await,
        Command::Fetch => remote(&config, open(&repo_path)?, RemoteCommand::Fetch).await,
        Command::Pull => remote(&config, open(&repo_path)?, RemoteCommand::Pull).await,
        Command::Push { refspec } => {
            remote(&config, open(&repo_path)?, RemoteCommand::Push(refspec)).await
        }
        Command::Commit { message } => {
            if open(&repo_path)?.commit(&message)? {
                println!("Committed: {}", first_line(&message));
            } else {
                println!("Nothing to commit");
            }
            Ok(())
        }
        Command::Status => {
            let wc = working_copy(&config, &repo_path).await?;
            print_status(&wc.snapshot());
            Ok(())
        }
        Command::Stage { paths } => {
            let wc = working_copy(&config, &repo_path).await?;
            apply(&wc, &paths, StagingAction::Stage).await
        }
        Command::Unstage { paths } => {
            let wc = working_copy(&config, &repo_path).await?;
            apply(&wc, &paths, StagingAction::Unstage).await
        }
        Command::Toggle { paths } => {
            let wc = working_copy(&config, &repo_path).await?;
            apply(&wc, &paths, StagingAction::Toggle).await
        }
        Command::Revert { paths } => {
            let wc = working_copy(&config, &repo_path).await?;
            apply(&wc, &paths, StagingAction::Revert).await
        }
        Command::Resolve {
            paths,
            ours,
            theirs,
        } => {
            let action = match (ours, theirs) {
                (true, _) => StagingAction::ResolveWith(StageSide::Ours),
                (_, true) => StagingAction::ResolveWith(StageSide::Theirs),
                _ => StagingAction::Resolve,
            };
            let wc = working_copy(&config, &repo_path).await?;
            apply(&wc, &paths, action).await
        }
        Command::StageAll => {
            let wc = working_copy(&config, &repo_path).await?;
            report_batch(wc.stage_all().await)
        }
        Command::UnstageAll => {
            let wc = working_copy(&config, &repo_path).await?;
            report_batch(wc.unstage_all().await)
        }
    }
}

async fn settings(config: &Config, write: bool) -> Result<(), ClientError> {
    let path = utils::paths::settings_path();
    println!("# {}", path.display());
    println!(
        "{}",
        serde_json::to_string_pretty(config).map_err(ConfigError::from)?
    );
    if write {
        save_config_to_file(config, &path).await?;
        println!("Saved settings to {}", path.display());
    }
    Ok(())
}

fn open(repo_path: &Path) -> Result<Arc<LocalRepo>, ClientError> {
    LocalRepo::open(repo_path)
        .map(Arc::new)
        .map_err(|source| ClientError::NotARepository {
            path: repo_path.display().to_string(),
            source,
        })
}

async fn working_copy(config: &Config, repo_path: &Path) -> Result<WorkingCopy, ClientError> {
    let wc = WorkingCopy::new(open(repo_path)?)
        .with_rescan_after_transition(config.rescan_after_transition);
    wc.refresh().await?;
    Ok(wc)
}

/// Accept `./dir/file` and `dir/` as well as the repository-relative form.
fn normalize_path(raw: &str) -> String {
    let trimmed = raw.trim_start_matches("./").trim_end_matches('/');
    if trimmed.is_empty() {
        raw.to_string()
    } else {
        trimmed.to_string()
    }
}

async fn apply(
    wc: &WorkingCopy,
    paths: &[String],
    action: StagingAction,
) -> Result<(), ClientError> {
    let mut outcomes: BatchOutcome = Vec::with_capacity(paths.len());
    for raw in paths {
        let path = normalize_path(raw);
        let outcome = wc.transition(&path, action).await;
        outcomes.push((path, outcome));
    }
    report_batch(outcomes)
}

fn report_batch(outcomes: BatchOutcome) -> Result<(), ClientError> {
    let total = outcomes.len();
    let mut failed = 0usize;
    for (path, outcome) in outcomes {
        match outcome {
            Ok(outcome) => print_outcome(&outcome),
            Err(e) => {
                failed += 1;
                eprintln!("{path}: {e}");
            }
        }
    }
    if failed > 0 {
        return Err(ClientError::TransitionsFailed { failed, total });
    }
    Ok(())
}

fn print_outcome(outcome: &TransitionOutcome) {
    match (&outcome.command, &outcome.status) {
        (None, _) => println!("{}: nothing to do", outcome.path),
        (Some(_), Some(status)) => print_status(std::slice::from_ref(status)),
        (Some(_), None) => println!("{}: clean", outcome.path),
    }
}

fn print_status(statuses: &[PathStatus]) {
    if statuses.is_empty() {
        println!("Working tree clean");
        return;
    }
    for status in statuses {
        let tags: Vec<String> = status
            .display_tags()
            .iter()
            .map(|tag| format!("{tag:?}"))
            .collect();
        println!("{:<48} {}", status.path, tags.join(" "));
    }
}

enum RemoteCommand {
    Fetch,
    Pull,
    Push(Option<String>),
}

impl RemoteCommand {
    fn title(&self) -> &'static str {
        match self {
            RemoteCommand::Fetch => "fetch",
            RemoteCommand::Pull => "pull",
            RemoteCommand::Push(_) => "push",
        }
    }
}

fn coordinator(config: &Config) -> RemoteOperationCoordinator {
    let store = Arc::new(FileCredentialStore::new(utils::paths::credentials_path()));
    RemoteOperationCoordinator::new(store, config.flight_policy)
}

async fn remote(
    config: &Config,
    repo: Arc<LocalRepo>,
    command: RemoteCommand,
) -> Result<(), ClientError> {
    let remote_url = repo
        .remote_url()
        .map_err(|e| ClientError::NoRemote(e.to_string()))?;
    let coordinator = coordinator(config);
    let credentials = coordinator
        .initial_credentials(&remote_url, repo.path())
        .await;

    let view = config
        .progress_bar
        .then(|| ProgressView::follow(coordinator.progress(), command.title()));
    let prompter = TerminalPrompter::new(
        config.remember_credentials,
        view.as_ref().map(ProgressView::bar),
    );

    let result = match command {
        RemoteCommand::Fetch => {
            coordinator
                .run(move |c, m| repo.fetch(c, m), credentials, &prompter)
                .await
        }
        RemoteCommand::Pull => {
            coordinator
                .run(move |c, m| repo.pull(c, m), credentials, &prompter)
                .await
        }
        RemoteCommand::Push(refspec) => {
            coordinator
                .run(
                    move |c, m| repo.push(refspec.as_deref(), c, m),
                    credentials,
                    &prompter,
                )
                .await
        }
    };

    if let Some(view) = view {
        view.finish();
    }
    report_remote(result)
}

async fn clone(config: &Config, url: String, target: PathBuf) -> Result<(), ClientError> {
    let coordinator = coordinator(config);
    let credentials = coordinator.initial_credentials(&url, &target).await;

    let view = config
        .progress_bar
        .then(|| ProgressView::follow(coordinator.progress(), "clone"));
    let prompter = TerminalPrompter::new(
        config.remember_credentials,
        view.as_ref().map(ProgressView::bar),
    );

    let git = GitService::new();
    let result = coordinator
        .run(
            move |c, m| git.clone_repository(&url, &target, c, m),
            credentials,
            &prompter,
        )
        .await;

    if let Some(view) = view {
        view.finish();
    }
    report_remote(result)
}

fn report_remote(result: RemoteOperationResult) -> Result<(), ClientError> {
    match result.code {
        ResultCode::Ok | ResultCode::Cancel => {
            println!("{}", result.message);
            Ok(())
        }
        _ => {
            if let Some(files) = result
                .payload
                .as_ref()
                .and_then(|p| p.get("conflicted_files"))
                .and_then(|f| f.as_array())
            {
                eprintln!("Conflicts in:");
                for file in files.iter().filter_map(|f| f.as_str()) {
                    eprintln!("  {file}");
                }
            }
            Err(ClientError::RemoteFailed(
                first_line(&result.message).to_string(),
            ))
        }
    }
}
