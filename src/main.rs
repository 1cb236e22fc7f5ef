use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::common::{load_config, Overrides};

#[derive(Parser)]
#[command(name = "libreg")]
#[command(about = "Hot-reloadable registry of named library instances", long_about = None)]
struct Cli {
    /// Directory holding library configuration files
    #[arg(long, global = true)]
    etc_dir: Option<PathBuf>,

    /// Data directory handed to libraries
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Configuration file extension
    #[arg(long, global = true)]
    extension: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered libraries
    List {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show one library
    Get {
        /// Library name
        name: String,
    },
    /// Verify a user against a realm connector
    Realm {
        /// Realm connector name
        name: String,
        /// User id
        user: String,
        /// Password
        #[arg(long, env = "LIBREG_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Print an Argon2 PHC hash for a static_realm user entry
    HashPassword {
        /// Password to hash
        #[arg(long, env = "LIBREG_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Watch the configuration directory and apply changes live
    Watch {
        /// Print the library list at this interval (e.g. 30s, 5m)
        #[arg(long)]
        summary: Option<String>,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .init();
    }

    let overrides = Overrides {
        etc_dir: cli.etc_dir,
        data_dir: cli.data_dir,
        extension: cli.extension,
    };

    match cli.command {
        Some(Commands::Version) | None => {
            println!("libreg {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::List { json }) => {
            let config = load_config(&overrides)?;
            cli::inspect::cmd_list(&config, json).await?;
        }
        Some(Commands::Get { name }) => {
            let config = load_config(&overrides)?;
            cli::inspect::cmd_get(&config, &name).await?;
        }
        Some(Commands::Realm {
            name,
            user,
            password,
        }) => {
            let config = load_config(&overrides)?;
            cli::inspect::cmd_realm(&config, &name, &user, &password).await?;
        }
        Some(Commands::HashPassword { password }) => {
            cli::inspect::cmd_hash_password(&password)?;
        }
        Some(Commands::Watch { summary }) => {
            let config = load_config(&overrides)?;
            cli::watch::cmd_watch(&config, summary).await?;
        }
    }

    Ok(())
}
