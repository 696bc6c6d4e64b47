mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "codegrade-cli")]
#[command(about = "Codegrade CLI - Submit Java programs to the grading gateway", long_about = None)]
struct Cli {
    /// Gateway base URL
    #[arg(long, env = "CODEGRADE_URL", default_value = "http://127.0.0.1:3000", global = true)]
    gateway: String,

    /// Gateway API key, sent as a bearer token
    #[arg(long, env = "CODEGRADE_API_KEY", global = true)]
    api_key: Option<String>,

    /// Print the raw JSON response instead of a summary
    #[arg(long, default_value = "false", global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Grade a source file against a JSON file of test cases
    Run {
        /// Java source file defining class Main
        #[arg(short, long)]
        source: PathBuf,

        /// JSON array of test cases ({input, expectedOutput, ...})
        #[arg(short, long)]
        tests: PathBuf,

        /// User id the submission is attributed to
        #[arg(short, long, env = "CODEGRADE_USER")]
        user: String,

        /// Mark the submission as a practice run
        #[arg(long, default_value = "false")]
        run_only: bool,
    },

    /// Run a source file anonymously with no assertions
    Demo {
        /// Java source file defining class Main
        #[arg(short, long)]
        source: PathBuf,
    },

    /// Show gateway and executor health
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let gateway = commands::Gateway::new(&cli.gateway, cli.api_key.as_deref())?;

    let success = match cli.command {
        Commands::Run {
            source,
            tests,
            user,
            run_only,
        } => commands::run(&gateway, &source, &tests, &user, run_only, cli.json).await?,
        Commands::Demo { source } => commands::demo(&gateway, &source, cli.json).await?,
        Commands::Health => commands::health(&gateway, cli.json).await?,
    };

    if !success {
        std::process::exit(1);
    }
    Ok(())
}
