// ABOUTME: Entry point for the chatwire CLI
// ABOUTME: Initializes logging and dispatches the validate, replay, storage and config commands

use anyhow::{Context, Result};
use chatwire::file_storage::FileValueStorage;
use chatwire::{replay, validate};
use chatwire_core::storage::ValueStorage;
use chatwire_core::ChatConfig;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "chatwire", about = "Tools for the chatwire chat protocol kernel")]
struct Cli {
    /// Emit JSON output and JSON logs
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check custom field answers against field definitions
    Validate {
        /// JSON array of field definitions
        fields: PathBuf,
        /// JSON object of field id to answer
        answers: PathBuf,
    },
    /// Feed a JSON-lines transcript of inbound frames through the event router
    Replay { transcript: PathBuf },
    /// Inspect or reset the persisted connection values
    Storage {
        /// Storage file to use instead of storage.json in the data directory (CHATWIRE_DATA_DIR or XDG)
        #[arg(long)]
        path: Option<PathBuf>,

        #[command(subcommand)]
        action: StorageAction,
    },
    /// Print the effective configuration
    Config,
}

#[derive(Subcommand)]
enum StorageAction {
    Show,
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.json);

    match cli.command {
        Commands::Validate { fields, answers } => {
            let definitions = validate::load_definitions(&fields)?;
            let answers = validate::load_answers(&answers)?;
            let report = validate::check_answers(definitions, &answers);

            if cli.json {
                print_json(&report)?;
            } else if report.valid {
                println!("All answers are valid");
            } else {
                for problem in &report.invalid {
                    println!("invalid  {}: {}", problem.field, problem.reason);
                }
                if !report.missing.is_empty() {
                    println!("missing  {}", report.missing.join(", "));
                }
                for id in &report.unknown {
                    println!("unknown  {}", id);
                }
            }
            if !report.valid {
                std::process::exit(1);
            }
        }
        Commands::Replay { transcript } => {
            let report = replay::replay_file(&transcript)?;
            if cli.json {
                print_json(&report)?;
            } else {
                println!(
                    "{} frames: {} dispatched, {} ignored, {} malformed, {} rejected",
                    report.frames, report.dispatched, report.ignored, report.malformed, report.rejected
                );
                for thread in &report.threads {
                    println!(
                        "{}  {:?}  {} messages  {}",
                        thread.id,
                        thread.state,
                        thread.messages.len(),
                        thread.name.as_deref().unwrap_or("-")
                    );
                }
            }
        }
        Commands::Storage { path, action } => {
            let storage = match path {
                Some(path) => FileValueStorage::open(path)?,
                None => FileValueStorage::open_default()?,
            };
            match action {
                StorageAction::Show => {
                    let entries = storage.entries();
                    if cli.json {
                        print_json(&entries)?;
                    } else if entries.is_empty() {
                        println!("{} is empty", storage.path().display());
                    } else {
                        for (key, value) in entries {
                            println!("{} = {}", key, value);
                        }
                    }
                }
                StorageAction::Clear => {
                    storage.clear_all();
                    println!("Cleared {}", storage.path().display());
                }
            }
        }
        Commands::Config => {
            let config = ChatConfig::load().context("Failed to load configuration")?;
            print_json(&config)?;
        }
    }

    Ok(())
}

/// Logs go to stderr, command output to stdout
fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let (json_layer, plain_layer) = if json {
        (Some(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)), None)
    } else {
        (None, Some(tracing_subscriber::fmt::layer().with_writer(std::io::stderr)))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(plain_layer)
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
