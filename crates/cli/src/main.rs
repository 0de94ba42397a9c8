use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod replay;

use replay::{demo_script, ReplayScript};

#[derive(Parser)]
#[command(name = "brainstorm")]
#[command(about = "Brainstorm board CLI - scripted collaborative sessions")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a built-in two-user session and print the resulting board
    Demo {
        /// Print single-line JSON
        #[arg(long)]
        compact: bool,
    },

    /// Replay a JSON script of user actions
    Replay {
        /// Script file path
        script: PathBuf,

        /// Print single-line JSON
        #[arg(long)]
        compact: bool,

        /// Write the result to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let fallback = if cli.verbose {
        "debug"
    } else {
        "cli=info,collaboration=info"
    };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .context("invalid log filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Demo { compact } => demo_command(compact).await,
        Commands::Replay {
            script,
            compact,
            output,
        } => replay_command(script, compact, output).await,
    }
}

async fn demo_command(compact: bool) -> Result<()> {
    info!("Running demo session");
    let outcome = replay::run(&demo_script()).await?;
    println!("{}", render(&outcome, compact)?);
    Ok(())
}

async fn replay_command(path: PathBuf, compact: bool, output: Option<PathBuf>) -> Result<()> {
    info!("Replaying script: {:?}", path);

    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let script: ReplayScript = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse {}", path.display()))?;

    let outcome = replay::run(&script).await?;
    let rendered = render(&outcome, compact)?;

    if let Some(output_path) = output {
        std::fs::write(&output_path, rendered)
            .with_context(|| format!("failed to write {}", output_path.display()))?;
        info!("Board written to: {:?}", output_path);
    } else {
        println!("{}", rendered);
    }
    Ok(())
}

fn render(outcome: &replay::Outcome, compact: bool) -> Result<String> {
    let text = if compact {
        serde_json::to_string(outcome)?
    } else {
        serde_json::to_string_pretty(outcome)?
    };
    Ok(text)
}
