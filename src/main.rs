use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Error};
use clap::{Parser, Subcommand};
use tracing::error;

use aid_downloader::config::ConfigManager;
use aid_downloader::logger::{init_logger, log_system_information};
use aid_downloader::program::Program;

/// Saves downloaded image-board files without writing duplicates.
#[derive(Parser, Debug)]
#[command(name = "aid", version, about)]
struct Cli {
    /// Directory holding config.toml
    #[arg(long, env = "AID_CONFIG_DIR", default_value = "config")]
    config_dir: PathBuf,

    /// Hide the progress bar
    #[arg(long, short)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write every file below SOURCE into the download directory
    Import {
        source: PathBuf,

        /// Override the configured download directory
        #[arg(long)]
        destination: Option<PathBuf>,

        /// Only skip duplicates seen during this run, ignore the database index
        #[arg(long)]
        memory_index: bool,
    },
    /// Show the state of the file index
    Index {
        /// Print the index record for this destination path
        #[arg(long)]
        lookup: Option<String>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Error> {
    let config_manager = ConfigManager::new(&cli.config_dir)
        .with_context(|| format!("Failed to load config from {}", cli.config_dir.display()))?;
    let config = config_manager.get_app_config();

    // Held until exit so buffered log lines reach the file.
    let _guard = match init_logger(&PathBuf::from(&config.paths.log_directory), &config.logging) {
        Ok(guard) => {
            log_system_information();
            for notice in config_manager.drain_notices() {
                notice.emit();
            }
            guard
        }
        Err(e) => {
            eprintln!("Failed to initialize logger: {}. Continuing without logging.", e);
            for notice in config_manager.drain_notices() {
                eprintln!("{:?}: {}", notice.level, notice.message);
            }
            None
        }
    };

    let program = if cli.quiet {
        Program::new(config).quiet()
    } else {
        Program::new(config)
    };

    match cli.command {
        Command::Import {
            source,
            destination,
            memory_index,
        } => {
            let summary = program.import(&source, destination.as_deref(), memory_index)?;
            println!("{}", summary);
        }
        Command::Index { lookup } => {
            let report = program.index_report(lookup.as_deref())?;
            println!("{}", report);
        }
    }

    Ok(())
}
