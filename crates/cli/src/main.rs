//! DVX CLI - dvx command

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cmd;
mod util;

/// DVX - Data versioning and experiment tracking
#[derive(Parser)]
#[command(name = "dvx")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize DVX in the current directory
    Init,
    /// Track a file, directory or external location
    Add {
        /// Path or URL to track
        target: String,
        /// Target is an external location (s3://, ssh://, /abs/path, ...)
        #[arg(long)]
        external: bool,
    },
    /// Show tracked outputs that differ from their committed version
    Status,
    /// Restore tracked outputs from the cache
    Checkout {
        /// Output or tracking file; everything when omitted
        target: Option<PathBuf>,
    },
    /// Record the current content of every tracked output
    Commit,
    /// Upload cached objects to a remote
    Push {
        #[arg(short, long)]
        remote: Option<String>,
    },
    /// Download objects from a remote and check them out
    Pull {
        #[arg(short, long)]
        remote: Option<String>,
    },
    /// Download objects from a remote into the cache
    Fetch {
        #[arg(short, long)]
        remote: Option<String>,
    },
    /// Remove cached objects nothing references
    Gc {
        /// Keep only the workspace and promoted branches
        #[arg(short, long, conflicts_with = "all_experiments")]
        workspace: bool,
        /// Keep objects of every experiment (default)
        #[arg(short, long)]
        all_experiments: bool,
    },
    /// Manage remotes
    Remote {
        #[command(subcommand)]
        action: RemoteAction,
    },
    /// Configure caches
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Reproduce a pipeline stage and everything upstream of it
    Repro {
        stage: String,
        /// Rerun the stage even when up to date
        #[arg(short, long)]
        force: bool,
    },
    /// Run and manage experiments
    Exp {
        #[command(subcommand)]
        action: ExpAction,
    },
    /// Show and compare metrics
    Metrics {
        #[command(subcommand)]
        action: MetricsAction,
    },
    /// Show parameters
    Params {
        #[command(subcommand)]
        action: ParamsAction,
    },
    /// Show plot data
    Plots {
        #[command(subcommand)]
        action: PlotsAction,
    },
}

#[derive(Subcommand)]
enum RemoteAction {
    /// Add a remote
    Add {
        name: String,
        url: String,
        /// Make it the default remote
        #[arg(short, long)]
        default: bool,
        /// Endpoint for S3-compatible services
        #[arg(long)]
        endpoint: Option<String>,
        #[arg(long)]
        region: Option<String>,
    },
    /// List remotes
    List,
    /// Set the default remote
    Default { name: String },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Use a remote as the external cache for a scheme
    External { scheme: String, remote: String },
}

#[derive(Subcommand)]
enum ExpAction {
    /// Run a checkpoint stage as an experiment
    Run {
        /// Stage to run; the pipeline's checkpoint stage when omitted
        stage: Option<String>,
        /// Experiment name
        #[arg(short, long)]
        name: Option<String>,
        /// Start a new chain instead of resuming
        #[arg(long)]
        reset: bool,
    },
    /// Show experiments with their latest metrics
    Show,
    /// List experiment names
    List,
    /// Compare metrics of two experiments, branches or checkpoints
    Diff {
        a: String,
        b: String,
        /// Hide metrics with the same value on both sides
        #[arg(long)]
        changed: bool,
    },
    /// Restore a checkpoint into the workspace
    Apply {
        checkpoint: String,
        /// Name of the experiment started from it
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Promote an experiment to a branch
    Branch { experiment: String, branch: String },
    /// Remove experiments and their unreferenced checkpoints
    Gc {
        /// Keep only experiments the workspace came from
        #[arg(short, long, conflicts_with = "all")]
        workspace: bool,
        /// Remove every experiment not kept by name (branches survive)
        #[arg(short, long)]
        all: bool,
        /// Keep these experiments
        #[arg(short, long)]
        keep: Vec<String>,
    },
}

#[derive(Subcommand)]
enum MetricsAction {
    /// Print metrics files
    Show {
        /// Metrics file; every declared metrics file when omitted
        file: Option<PathBuf>,
    },
    /// Compare metrics of two experiments, branches or checkpoints
    Diff {
        a: String,
        b: String,
        /// Hide metrics with the same value on both sides
        #[arg(long)]
        changed: bool,
    },
}

#[derive(Subcommand)]
enum ParamsAction {
    /// Print parameters used by the pipeline
    Show,
}

#[derive(Subcommand)]
enum PlotsAction {
    /// Print plot series as JSON
    Show { file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "dvx_cli=debug,tracking=debug,checkpoint=debug,storage=debug"
    } else {
        "dvx_cli=info,tracking=info,checkpoint=info,storage=warn"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
    tracing::debug!(version = env!("CARGO_PKG_VERSION"), "dvx starting");

    match cli.command {
        Commands::Init => cmd::init::run().await,
        Commands::Add { target, external } => cmd::add::run(&target, external).await,
        Commands::Status => cmd::status::run().await,
        Commands::Checkout { target } => cmd::checkout::run(target).await,
        Commands::Commit => cmd::commit::run().await,
        Commands::Push { remote } => cmd::transfer::run_push(remote.as_deref()).await,
        Commands::Pull { remote } => cmd::transfer::run_pull(remote.as_deref()).await,
        Commands::Fetch { remote } => cmd::transfer::run_fetch(remote.as_deref()).await,
        Commands::Gc { workspace, .. } => cmd::gc::run(workspace).await,
        Commands::Remote { action } => match action {
            RemoteAction::Add {
                name,
                url,
                default,
                endpoint,
                region,
            } => cmd::remote::run_add(&name, &url, default, endpoint, region).await,
            RemoteAction::List => cmd::remote::run_list().await,
            RemoteAction::Default { name } => cmd::remote::run_default(&name).await,
        },
        Commands::Cache { action } => match action {
            CacheAction::External { scheme, remote } => {
                cmd::cache::run_external(&scheme, &remote).await
            }
        },
        Commands::Repro { stage, force } => cmd::repro::run(&stage, force).await,
        Commands::Exp { action } => match action {
            ExpAction::Run { stage, name, reset } => cmd::exp::run_run(stage, name, reset).await,
            ExpAction::Show => cmd::exp::run_show().await,
            ExpAction::List => cmd::exp::run_list().await,
            ExpAction::Diff { a, b, changed } => cmd::exp::run_diff(&a, &b, changed).await,
            ExpAction::Apply { checkpoint, name } => {
                cmd::exp::run_apply(&checkpoint, name.as_deref()).await
            }
            ExpAction::Branch { experiment, branch } => {
                cmd::exp::run_branch(&experiment, &branch).await
            }
            ExpAction::Gc {
                workspace,
                all,
                keep,
            } => cmd::exp::run_gc(workspace, all, keep).await,
        },
        Commands::Metrics { action } => match action {
            MetricsAction::Show { file } => cmd::metrics::run_show(file).await,
            MetricsAction::Diff { a, b, changed } => cmd::exp::run_diff(&a, &b, changed).await,
        },
        Commands::Params { action } => match action {
            ParamsAction::Show => cmd::params::run_show().await,
        },
        Commands::Plots { action } => match action {
            PlotsAction::Show { file } => cmd::plots::run_show(&file).await,
        },
    }
}
