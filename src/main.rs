use clap::{Parser, Subcommand};
use pg_logical_cdc::{Config, Replicator, Result};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "pg-logical-cdc")]
#[command(about = "PostgreSQL wal2json change data capture client", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll the slot and print each change as a JSON line
    Poll,
    /// Create the logical replication slot if it does not exist
    CreateSlot,
    /// Drop the logical replication slot
    DropSlot,
    /// Print the server's current WAL position
    CurrentLsn,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Loading configuration from {:?}", args.config);

    let config = match Config::from_file(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e);
        }
    };

    info!(
        postgres_host = %config.postgres.host,
        postgres_port = %config.postgres.port,
        postgres_database = %config.postgres.database,
        slot = %config.replication.slot_name,
        "Configuration summary"
    );

    let replicator = Replicator::new(config);
    let result = match args.command {
        Command::Poll => replicator.run().await,
        Command::CreateSlot => replicator.create_slot().await,
        Command::DropSlot => replicator.drop_slot().await,
        Command::CurrentLsn => replicator.current_lsn().await.map(|lsn| println!("{lsn}")),
    };

    if let Err(e) = &result {
        error!("{}", e);
    }
    result
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("pg_logical_cdc=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pg_logical_cdc=info,warn"))
    };

    // Logs go to stderr; stdout carries the change stream.
    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
