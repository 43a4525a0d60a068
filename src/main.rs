use chrono::Utc;
use clap::Parser;
use miette::{IntoDiagnostic, Result};
use nearby_negotiation::application::service::OfferService;
use nearby_negotiation::config::EngineConfig;
use nearby_negotiation::domain::ports::{RequestStoreBox, ResponseStoreBox};
use nearby_negotiation::infrastructure::system::{ManualClock, TracingNotifier};
use nearby_negotiation::interfaces::csv::command_reader::CommandReader;
use nearby_negotiation::interfaces::csv::script::ScriptRunner;
use nearby_negotiation::interfaces::csv::state_writer::StateWriter;
use std::fs::File;
use std::io::{self, IsTerminal};
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Input negotiation script CSV file
    input: PathBuf,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// How many times a decision is recomputed after a concurrent write on its request
    #[arg(long, env = "NEARBY_MAX_CONFLICT_RETRIES", default_value_t = EngineConfig::DEFAULT_MAX_CONFLICT_RETRIES)]
    max_conflict_retries: u32,

    /// How many times a single offer write is attempted
    #[arg(long, env = "NEARBY_MAX_WRITE_ATTEMPTS", default_value_t = EngineConfig::DEFAULT_MAX_WRITE_ATTEMPTS)]
    max_write_attempts: u32,
}

#[cfg(feature = "storage-rocksdb")]
fn open_stores(db_path: Option<PathBuf>) -> Result<(RequestStoreBox, ResponseStoreBox)> {
    use nearby_negotiation::infrastructure::rocksdb::RocksDBStore;

    if let Some(db_path) = db_path {
        let store = RocksDBStore::open(db_path).into_diagnostic()?;
        return Ok((Box::new(store.clone()), Box::new(store)));
    }
    Ok(in_memory_stores())
}

#[cfg(not(feature = "storage-rocksdb"))]
fn open_stores(db_path: Option<PathBuf>) -> Result<(RequestStoreBox, ResponseStoreBox)> {
    if db_path.is_some() {
        tracing::warn!(
            "Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to in-memory storage."
        );
    }
    Ok(in_memory_stores())
}

fn in_memory_stores() -> (RequestStoreBox, ResponseStoreBox) {
    use nearby_negotiation::infrastructure::in_memory::{
        InMemoryRequestStore, InMemoryResponseStore,
    };

    (
        Box::new(InMemoryRequestStore::new()),
        Box::new(InMemoryResponseStore::new()),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::new(cli.max_conflict_retries, cli.max_write_attempts);

    let (requests, responses) = open_stores(cli.db_path)?;
    let clock = ManualClock::new(Utc::now());
    let service = OfferService::with_config(
        requests,
        responses,
        Box::new(TracingNotifier),
        Box::new(clock.clone()),
        config,
    );

    // Replay the script
    let file = File::open(cli.input).into_diagnostic()?;
    let reader = CommandReader::new(file);
    let mut runner = ScriptRunner::new(&service, clock);
    for command in reader.commands() {
        match command {
            Ok(command) => {
                if let Err(e) = runner.apply(command).await {
                    error!("Error processing command: {}", e);
                }
            }
            Err(e) => {
                error!("Error reading command: {}", e);
            }
        }
    }

    // Collect final state
    let mut entries = Vec::new();
    for request in service.requests().await.into_diagnostic()? {
        let offers = service.offers_for(&request.id).await.into_diagnostic()?;
        entries.push((request, offers));
    }

    let stdout = io::stdout();
    let mut writer = StateWriter::new(stdout.lock());
    writer
        .write_state(&entries, &runner.labels())
        .into_diagnostic()?;

    Ok(())
}
