mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "sandrun-cli")]
#[command(about = "Sandrun CLI - Run, check and inspect sandboxed code executions", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a source file locally through the full pipeline
    Run {
        /// Language id (cpp, java, python, javascript)
        #[arg(short, long)]
        language: String,

        /// Source file to execute
        #[arg(short, long)]
        file: PathBuf,

        /// Cap on the execute phase in milliseconds
        #[arg(short, long)]
        timeout_ms: Option<u64>,

        /// Skip the structural plausibility check
        #[arg(long)]
        no_check: bool,

        /// Print the raw result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate a source file the way the submission endpoint does
    Check {
        #[arg(short, long)]
        language: String,

        #[arg(short, long)]
        file: PathBuf,
    },

    /// List supported languages and their toolchain commands
    Languages,

    /// Show the stored status of a queued job
    Status {
        /// Job id returned by POST /execute
        #[arg(short, long)]
        job_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            language,
            file,
            timeout_ms,
            no_check,
            json,
        } => {
            commands::run_file(&language, &file, timeout_ms, !no_check, json).await?;
        }
        Commands::Check { language, file } => {
            commands::check_file(&language, &file)?;
        }
        Commands::Languages => {
            commands::list_languages();
        }
        Commands::Status { job_id } => {
            commands::show_status(&job_id).await?;
        }
    }

    Ok(())
}
