use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use revgraph::git::{is_ignored, is_versioned, GitRepository, StatusOutcome, ERROR_EXIT_CODE};
use revgraph::graph::Filter;
use revgraph::provider::CachingProvider;
use revgraph::state::{run_until_idle, EngineConfig, StateController};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "revgraph", version, about = "Revision-graph layout for DVCS histories")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Exit 1 if PATH is versioned, 0 if not, 3 on error
    IsVersioned {
        #[arg(short, long)]
        quiet: bool,
        path: PathBuf,
    },
    /// Exit 1 if PATH is ignored, 0 if not, 3 on error
    IsIgnored {
        #[arg(short, long)]
        quiet: bool,
        path: PathBuf,
    },
    /// Lay out a repository's history and print the frame as JSON
    Layout(LayoutArgs),
}

#[derive(Args, Debug)]
struct LayoutArgs {
    #[arg(long, default_value = ".")]
    repo: PathBuf,
    /// Maximum number of revisions to load
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    search: Option<String>,
    #[arg(long)]
    author: Option<String>,
    #[arg(long = "path")]
    paths: Vec<String>,
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("REVGRAPH_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn report_status(
    outcome: Result<StatusOutcome>,
    quiet: bool,
    yes: &str,
    no: &str,
    path: &Path,
) -> ExitCode {
    match outcome {
        Ok(outcome) => {
            if !quiet {
                match outcome {
                    StatusOutcome::Yes => println!("{}", yes),
                    StatusOutcome::No => println!("{}", no),
                }
            }
            ExitCode::from(outcome.exit_code())
        }
        Err(e) => {
            error!("Status query for {} failed: {:#}", path.display(), e);
            eprintln!("revgraph: {:#}", e);
            ExitCode::from(ERROR_EXIT_CODE)
        }
    }
}

fn run_layout(args: LayoutArgs) -> Result<()> {
    let repo = GitRepository::discover(&args.repo)?;
    let tips = repo.branch_tips()?;

    let mut config = EngineConfig::load();
    if let Some(limit) = args.limit {
        config = config.with_max_revisions(limit);
    }

    let mut filter = Filter::new();
    if let Some(search) = args.search {
        filter = filter.with_search(search);
    }
    if let Some(author) = args.author {
        filter = filter.with_author(author);
    }
    for path in args.paths {
        filter = filter.with_path(path);
    }

    let provider = CachingProvider::new(repo, config.provider_cache_capacity);
    let mut controller = StateController::new(provider, (), config);
    info!("Laying out {} tips", tips.len());
    controller.on_tips_changed(tips);
    if !filter.is_empty() {
        controller.on_filter_changed(filter);
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .context("Failed to start runtime")?;
    runtime.block_on(run_until_idle(&mut controller));

    let frame = controller.frame().context("No frame was published")?;
    println!("{}", serde_json::to_string_pretty(frame.as_ref())?);
    Ok(())
}

fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Command::IsVersioned { quiet, path } => {
            report_status(is_versioned(&path), quiet, "versioned", "not versioned", &path)
        }
        Command::IsIgnored { quiet, path } => {
            report_status(is_ignored(&path), quiet, "ignored", "not ignored", &path)
        }
        Command::Layout(args) => match run_layout(args) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("Layout failed: {:#}", e);
                eprintln!("revgraph: {:#}", e);
                ExitCode::FAILURE
            }
        },
    }
}
