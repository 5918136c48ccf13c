use clap::{Parser, Subcommand};

use kubeforge::commands;

#[derive(Parser)]
#[command(
    name = "kubeforge",
    version,
    about = "SSH-driven Kubernetes cluster installer and scaling daemon"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the installation daemon (REST + SSE)
    Daemon {
        /// HTTP listen address (overrides config)
        #[arg(long)]
        http_addr: Option<String>,

        /// Log level filter, e.g. info or kubeforge=debug
        #[arg(long)]
        log_level: Option<String>,

        /// Path to a config file (default: ~/.config/kubeforge/config.toml)
        #[arg(long)]
        config: Option<String>,
    },

    /// Inspect and manage recorded clusters
    Clusters {
        #[command(subcommand)]
        command: ClustersCommands,
    },
}

#[derive(Subcommand)]
enum ClustersCommands {
    /// List recorded clusters
    List {
        /// Output format: text or json
        #[arg(long, default_value = "text")]
        format: String,

        /// Path to a config file
        #[arg(long)]
        config: Option<String>,
    },

    /// Delete a recorded cluster by id
    Delete {
        /// Cluster id
        id: String,

        /// Path to a config file
        #[arg(long)]
        config: Option<String>,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Daemon {
            http_addr,
            log_level,
            config,
        } => commands::daemon::run(http_addr, log_level, config),
        Commands::Clusters { command } => match command {
            ClustersCommands::List { format, config } => commands::clusters::list(format, config),
            ClustersCommands::Delete { id, config } => commands::clusters::delete(id, config),
        },
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
