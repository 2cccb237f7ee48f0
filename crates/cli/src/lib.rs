pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "gtmlake",
    about = "GTM data lake operator CLI",
    long_about = "Operate the GTM data lake: migrations, readiness checks, ingestion, \
                  draining the log, asking questions, and recovering from dead letters \
                  or retention gaps.",
    after_help = "Examples:\n  gtmlake doctor --json\n  \
                  gtmlake ingest --type calendar_event events.json\n  gtmlake drain\n  \
                  gtmlake ask \"Show me all customers who had meetings this week\""
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Validate config, embedding provider, DB connectivity, dead letter backlog")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Inspect effective configuration values with source attribution")]
    Config,
    #[command(about = "Run end-to-end readiness checks with per-check timing details")]
    Smoke,
    #[command(about = "Validate and publish raw events from a JSON file (or `-` for stdin)")]
    Ingest {
        #[arg(
            long = "type",
            help = "calendar_event|agent_data|conversation|email_thread|product_usage"
        )]
        event_type: String,
        #[arg(help = "JSON file holding one event object or an array of them")]
        source: PathBuf,
    },
    #[command(about = "Process everything currently on the log, then stop")]
    Drain {
        #[arg(long, default_value_t = 10_000, help = "Stop after this many records")]
        max_records: usize,
    },
    #[command(about = "Answer a natural-language question against the catalog and vector index")]
    Ask {
        question: String,
    },
    #[command(subcommand, about = "Inspect and replay dead-lettered events")]
    DeadLetter(DeadLetterCommand),
    #[command(about = "Rebuild catalog and vectors from the raw store and reset lagging offsets")]
    Resync,
    #[command(about = "Drop log records past the retention window and advance low watermarks")]
    Retention,
}

#[derive(Debug, Subcommand)]
enum DeadLetterCommand {
    #[command(about = "List dead letters, pending only unless --all")]
    List {
        #[arg(long, help = "Include dead letters that were already replayed")]
        all: bool,
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    #[command(about = "Republish a dead-lettered event to its topic")]
    Replay { id: String },
}

/// Logs go to stderr so stdout stays machine-readable.
fn init_logging() {
    let filter =
        EnvFilter::try_from_env("GTMLAKE_CLI_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    init_logging();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Smoke => commands::smoke::run(),
        Command::Ingest { event_type, source } => commands::ingest::run(&event_type, &source),
        Command::Drain { max_records } => commands::drain::run(max_records),
        Command::Ask { question } => commands::ask::run(&question),
        Command::DeadLetter(DeadLetterCommand::List { all, limit }) => {
            commands::dead_letter::list(all, limit)
        }
        Command::DeadLetter(DeadLetterCommand::Replay { id }) => commands::dead_letter::replay(&id),
        Command::Resync => commands::resync::run(),
        Command::Retention => commands::retention::run(),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
