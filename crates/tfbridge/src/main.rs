mod commands;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "tfbridge")]
#[command(about = "Run terraform verbs against a single managed resource", long_about = None)]
struct Cli {
    /// Runtime configuration file (otherwise discovered)
    #[arg(long, global = true)]
    runtime_config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Resource whose working directory the verb runs in
#[derive(Args, Debug, Clone)]
pub struct Target {
    /// Stable identity of the resource, names its working directory
    #[arg(short, long)]
    resource: String,

    /// Configuration document written as main.tf.json
    #[arg(short, long)]
    config: PathBuf,

    /// Seed state used when the working directory has none
    #[arg(long)]
    state: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or update the resource
    Apply {
        #[command(flatten)]
        target: Target,
        /// Run on a background task and wait for its callback
        #[arg(long = "async")]
        run_async: bool,
    },
    /// Delete the resource and its working directory
    Destroy {
        #[command(flatten)]
        target: Target,
        /// Run on a background task and wait for its callback
        #[arg(long = "async")]
        run_async: bool,
    },
    /// Reconcile the persisted state with the remote object
    Refresh {
        #[command(flatten)]
        target: Target,
    },
    /// Report whether the resource exists and is up to date
    Plan {
        #[command(flatten)]
        target: Target,
    },
    /// Seed the persisted state from an existing remote object
    Import {
        #[command(flatten)]
        target: Target,
        /// Resource type, e.g. aws_vpc
        #[arg(long = "type")]
        resource_type: String,
        /// Resource name in the configuration
        #[arg(long)]
        name: String,
        /// External identifier of the remote object
        #[arg(long)]
        id: Option<String>,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if matches!(cli.command, Commands::Version) {
        println!("tfbridge {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = tfbridge_config::load(cli.runtime_config.as_deref())?;
    tracing::debug!(
        terraform_path = %config.terraform_path,
        workspace_root = %config.workspace_root.display(),
        scheduler = ?config.scheduler.kind,
        "Loaded runtime configuration"
    );
    let runtime = commands::Runtime::new(config);

    match cli.command {
        Commands::Apply { target, run_async } => {
            commands::apply::handle(&runtime, &target, run_async).await?;
        }
        Commands::Destroy { target, run_async } => {
            commands::destroy::handle(&runtime, &target, run_async).await?;
        }
        Commands::Refresh { target } => {
            commands::refresh::handle(&runtime, &target).await?;
        }
        Commands::Plan { target } => {
            commands::plan::handle(&runtime, &target).await?;
        }
        Commands::Import {
            target,
            resource_type,
            name,
            id,
        } => {
            commands::import::handle(&runtime, &target, &resource_type, &name, id.as_deref())
                .await?;
        }
        Commands::Version => {}
    }

    Ok(())
}
