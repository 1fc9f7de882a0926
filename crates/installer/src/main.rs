//! Homelab CLI.
//!
//! Provisions Raspberry Pi nodes, installs K3s on them, and deploys the
//! in-cluster platform stack.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use homelab_cli::commands::bootstrap::BootstrapCommand;
use homelab_cli::commands::clustertoken::ClusterTokenCommand;
use homelab_cli::commands::deploy::DeployCommand;
use homelab_cli::commands::k3s::K3sCommand;
use homelab_cli::commands::kubeconfig::KubeconfigCommand;
use homelab_cli::commands::Globals;
use homelab_cli::config::ENV_CONFIG;
use homelab_cli::ui;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Homelab infrastructure management CLI.
#[derive(Parser)]
#[command(
    name = "homelab",
    version,
    about = "Homelab infrastructure management CLI",
    long_about = "Provision Raspberry Pi nodes and manage K3s clusters for your homelab.\n\n\
                  Settings come from command-line flags, then infra.yaml (auto-detected\n\
                  in the current or parent directory), then HOMELAB_* environment variables."
)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to infra.yaml (auto-detected if not specified).
    #[arg(long, global = true, env = ENV_CONFIG, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision a Raspberry Pi node.
    Bootstrap(BootstrapCommand),

    /// Install K3s on a node.
    K3s(K3sCommand),

    /// Extract kubeconfig from a K3s node.
    Kubeconfig(KubeconfigCommand),

    /// Extract the cluster token from a K3s node.
    Clustertoken(ClusterTokenCommand),

    /// Deploy the platform stack to the cluster.
    Deploy(DeployCommand),
}

fn init_tracing(verbose: bool, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("info,homelab_metal=debug,homelab_stack=debug,homelab_cli=debug")
        } else {
            EnvFilter::new("warn,homelab_metal=info,homelab_stack=info,homelab_cli=info")
        }
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    let globals = Globals { config: cli.config };

    let result = match cli.command {
        Commands::Bootstrap(cmd) => cmd.run(&globals),
        Commands::K3s(cmd) => cmd.run(&globals),
        Commands::Kubeconfig(cmd) => cmd.run(&globals),
        Commands::Clustertoken(cmd) => cmd.run(&globals),
        Commands::Deploy(cmd) => cmd.run(&globals).await,
    };

    if let Err(e) = result {
        error!(error = %e, "Command failed");
        ui::print_error(&format!("{e:#}"));
        std::process::exit(1);
    }
    Ok(())
}
