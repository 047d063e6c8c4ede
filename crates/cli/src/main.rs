//! Operator tooling for a mirage installation.

mod error;
mod store;

use crate::error::{ErrorKind, Result};
use crate::store::OpenStore;
use clap::{Parser, Subcommand};
use exn::ResultExt;
use mirage_config::Config;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mirage")]
#[command(about = "Inspect and maintain a mirage content cache", long_about = None)]
struct Cli {
    /// Configuration file (TOML, YAML or JSON). Defaults to the platform
    /// config directory.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless `RUST_LOG` says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Content store maintenance
    #[command(subcommand)]
    Store(StoreCommand),
    /// Print the resolved configuration as JSON
    Config,
}

#[derive(Debug, Subcommand)]
enum StoreCommand {
    /// Summarize what is cached
    Stats,
    /// Re-hash every cached file
    Verify {
        /// Forget entries that are missing or corrupt
        #[arg(long)]
        prune: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(error) => {
            eprintln!("Error: {error:?}");
            ExitCode::FAILURE
        },
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = load_config(&cli)?;
    match cli.command {
        Command::Config => {
            let json = serde_json::to_string_pretty(&config).or_raise(|| ErrorKind::Output)?;
            println!("{json}");
            Ok(ExitCode::SUCCESS)
        },
        Command::Store(StoreCommand::Stats) => {
            let opened = OpenStore::open(&config.cache).await?;
            println!("{}", store::render_stats(&opened.store.stats()));
            opened.close().await;
            Ok(ExitCode::SUCCESS)
        },
        Command::Store(StoreCommand::Verify { prune }) => {
            let opened = OpenStore::open(&config.cache).await?;
            let result = store::verify(&opened.store, prune).await;
            opened.close().await;
            let summary = result?;
            println!(
                "intact: {}, missing: {}, corrupt: {}, unreadable: {}, pruned: {}",
                summary.intact, summary.missing, summary.corrupt, summary.unreadable, summary.pruned,
            );
            // Pruning repairs the index, so only an unpruned problem is a failure.
            let clean = summary.is_clean() || (prune && summary.unreadable == 0);
            Ok(if clean { ExitCode::SUCCESS } else { ExitCode::from(2) })
        },
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    match &cli.config {
        Some(file) => mirage_config::load(Some(file)),
        None => mirage_config::load_default(),
    }
    .or_raise(|| ErrorKind::Config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_store_verify() {
        let cli = Cli::try_parse_from(["mirage", "store", "verify", "--prune", "-c", "mirage.toml"]).unwrap();
        assert!(matches!(cli.command, Command::Store(StoreCommand::Verify { prune: true })));
        assert_eq!(cli.config, Some(PathBuf::from("mirage.toml")));
        assert!(!cli.verbose);
    }

    #[test]
    fn test_parse_config() {
        let cli = Cli::try_parse_from(["mirage", "--verbose", "config"]).unwrap();
        assert!(matches!(cli.command, Command::Config));
        assert!(cli.verbose);
    }

    #[test]
    fn test_store_requires_subcommand() {
        assert!(Cli::try_parse_from(["mirage", "store"]).is_err());
    }

    #[test]
    fn test_command_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
