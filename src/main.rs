use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use crate::core::settings::Settings;
use std::io;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod cli;
mod core;
mod daemon;
mod providers;

#[derive(Parser)]
#[command(name = "claude-meter")]
#[command(author, version, about = "Adaptive Claude usage poller with threshold alerts")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the polling daemon
    Daemon,

    /// Fetch and show current usage
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check that the stored credentials are accepted by the API
    Validate,

    /// Trigger daemon refresh via D-Bus
    Refresh,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn init_logging(debug: bool, journald: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let journald = if journald {
        tracing_journald::layer().ok()
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .with(journald)
        .init();
}

/// Logging is set up before the config is read so load errors are visible;
/// the config's `debug` flag only applies once it parsed.
fn load_settings(journald: bool) -> anyhow::Result<Settings> {
    let debug_hint = Settings::config_path()
        .and_then(|path| std::fs::read_to_string(path).ok())
        .and_then(|content| toml::from_str::<Settings>(&content).ok())
        .is_some_and(|s| s.debug);
    init_logging(debug_hint, journald);
    Settings::load()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon => {
            let settings = load_settings(true)?;
            daemon::run(settings).await
        }
        Commands::Status { json } => {
            let settings = load_settings(false)?;
            cli::status::run(&settings, json).await
        }
        Commands::Validate => {
            let settings = load_settings(false)?;
            cli::validate::run(&settings).await
        }
        Commands::Refresh => {
            init_logging(false, false);
            cli::refresh::run().await
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            generate(shell, &mut cmd, name, &mut io::stdout());
            Ok(())
        }
    }
}
