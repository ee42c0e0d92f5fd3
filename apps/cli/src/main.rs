//! RDM CLI - Command-line front end for the resumable download engine
//!
//! Tasks live in the engine's data directory and survive between runs, so a
//! download interrupted with Ctrl-C picks up where it left off on the next
//! `rdm start`.

mod commands;
mod output;
mod progress;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// RDM - Resumable Download Manager
#[derive(Parser)]
#[command(name = "rdm")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Data directory for RDM
    #[arg(long, env = "RDM_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "human")]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Table,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a new download
    Add {
        /// URL to download
        url: String,

        /// Directory to save into (defaults to the configured save path)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// File name (defaults to the last segment of the URL)
        #[arg(long)]
        name: Option<String>,

        /// MIME type to record instead of the server's
        #[arg(long)]
        mime_type: Option<String>,

        /// Extra request header, as `Name: value` (repeatable)
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        /// User agent for this download only
        #[arg(long)]
        user_agent: Option<String>,

        /// Start download immediately
        #[arg(short = 'n', long)]
        now: bool,
    },

    /// List downloads
    List {
        /// Filter by status
        #[arg(short, long)]
        status: Option<String>,

        /// Show all details
        #[arg(short, long)]
        all: bool,
    },

    /// Show download info
    Info {
        /// Download ID
        id: i64,
    },

    /// Run downloads in the foreground until they finish (Ctrl-C pauses)
    Start {
        /// Download IDs
        #[arg(required = true)]
        ids: Vec<i64>,
    },

    /// Delete a download
    Delete {
        /// Download ID
        id: i64,

        /// Also delete the downloaded file
        #[arg(long)]
        with_file: bool,
    },

    /// Show/update settings
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get {
        /// Config key
        key: String,
    },

    /// Set a config value
    Set {
        /// Config key
        key: String,

        /// Config value
        value: String,
    },

    /// Show all config
    Show,

    /// Reset to defaults
    Reset {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("rdm_core=debug,rdm_cli=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Commands::Completions { shell } = cli.command {
        use clap::CommandFactory;
        clap_complete::generate(shell, &mut Cli::command(), "rdm", &mut std::io::stdout());
        return Ok(());
    }

    // Determine data directory
    let data_dir = cli.data_dir.unwrap_or_else(|| {
        dirs::data_dir()
            .map(|d| d.join("rdm"))
            .unwrap_or_else(|| PathBuf::from(".rdm"))
    });
    debug!("Using data directory {}", data_dir.display());

    // Settings are edited on disk; the engine picks them up on its next start
    if let Commands::Config { action } = cli.command {
        let storage = rdm_core::Storage::new(data_dir).await?;
        return commands::config_action(&storage, action, cli.output).await;
    }

    // Initialize core
    let core = rdm_core::RdmCore::new(data_dir).await?;

    // Execute command
    let result = match cli.command {
        Commands::Add {
            url,
            output,
            name,
            mime_type,
            headers,
            user_agent,
            now,
        } => {
            let request = commands::AddRequest {
                url,
                output,
                name,
                mime_type,
                headers,
                user_agent,
            };
            commands::add_download(&core, request, now, cli.output).await
        }

        Commands::List { status, all } => {
            commands::list_downloads(&core, status, all, cli.output).await
        }

        Commands::Info { id } => commands::show_info(&core, id, cli.output).await,

        Commands::Start { ids } => commands::start_downloads(&core, &ids, cli.output).await,

        Commands::Delete { id, with_file } => {
            commands::delete_download(&core, id, with_file, cli.output).await
        }

        Commands::Config { .. } | Commands::Completions { .. } => Ok(()),
    };

    core.shutdown().await;
    result
}
