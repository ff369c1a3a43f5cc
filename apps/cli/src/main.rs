//! dlsession CLI - fetch a single resource over HTTP(S)
//!
//! Runs one download session with a terminal progress bar, or as a stream
//! of JSON events for scripts.

mod commands;
mod output;
mod progress;

use anyhow::Result;
use clap::{Parser, Subcommand};
use dlsession_core::SettingsStore;
use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// dlsession - single-resource downloader
#[derive(Parser)]
#[command(name = "dlsession")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Settings file to use instead of the default location
    #[arg(long, global = true, env = "DLSESSION_CONFIG")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, default_value = "human")]
    output: OutputFormat,

    /// Verbose logging (to stderr)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a URL
    Get {
        /// URL to download
        url: String,

        /// Directory to save into (overrides the configured one)
        #[arg(short = 'd', long)]
        output_dir: Option<PathBuf>,

        /// Replace an existing file without asking
        #[arg(short, long)]
        force: bool,

        /// Cancel the download after this many seconds
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Accept invalid TLS certificates
        #[arg(long)]
        insecure: bool,

        /// Username for servers that require authentication
        #[arg(short, long)]
        user: Option<String>,

        /// Password for --user
        #[arg(short, long, env = "DLSESSION_PASSWORD", hide_env_values = true)]
        password: Option<String>,
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

        /// Config value (`none` clears optional values)
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

    /// Print the settings file location
    Path,
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "warn,dlsession=debug,dlsession_core=debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let store = SettingsStore::new(cli.config.unwrap_or_else(SettingsStore::default_path));

    let exit_code = match cli.command {
        Commands::Get {
            url,
            output_dir,
            force,
            timeout,
            insecure,
            user,
            password,
        } => {
            let options = commands::GetOptions {
                url,
                output_dir,
                force,
                timeout,
                insecure,
                user,
                password,
            };
            let outcome = commands::get(&store, options, cli.output).await?;
            commands::exit_code(&outcome)
        }

        Commands::Config { action } => {
            commands::config_action(&store, action, cli.output).await?;
            0
        }

        Commands::Completions { shell } => {
            use clap::CommandFactory;
            clap_complete::generate(shell, &mut Cli::command(), "dlsession", &mut std::io::stdout());
            0
        }
    };

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}
