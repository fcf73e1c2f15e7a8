use anyhow::Context;
use clap::{Parser, Subcommand};
use prediction_questions::config::{Config, StorageBackend};
use prediction_questions::db::SqliteStorage;
use prediction_questions::service::PredictionService;
use prediction_questions::storage::open_storage;
use prediction_questions::{logging, metrics, seed, server};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "prediction_questions")]
#[command(about = "Serves interest-based prediction questions and records their resolutions")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to ./config.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API
    Serve {
        /// Port to listen on, overriding configuration
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Insert questions from a TOML file
    Seed {
        /// File with [[questions]] tables
        #[arg(long)]
        file: PathBuf,
    },
    /// Create the SQLite schema and exit
    InitDb,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    let _log_guard =
        logging::init_logging(&config.logging).context("failed to initialise logging")?;

    match cli.command {
        Commands::Serve { port } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            metrics::init_metrics();

            let storage = open_storage(&config.database)?;
            let service = Arc::new(PredictionService::new(storage, config.questions));
            server::start_server(&config.server, service).await?;
        }
        Commands::Seed { file } => {
            let drafts = seed::load_seed_file(&file)
                .with_context(|| format!("failed to read seed file {}", file.display()))?;
            if config.database.backend == StorageBackend::Memory {
                warn!("Seeding the in-memory backend; questions are lost when this command exits");
            }

            let storage = open_storage(&config.database)?;
            let service = PredictionService::new(storage, config.questions);
            let summary = seed::seed_questions(&service, drafts).await?;

            println!("✅ Seeded {} questions", summary.created);
            for (question, reason) in &summary.skipped {
                println!("   ⚠️  skipped '{}': {}", question, reason);
            }
        }
        Commands::InitDb => match config.database.backend {
            StorageBackend::Sqlite => {
                SqliteStorage::open(&config.database.path)?;
                info!(path = %config.database.path.display(), "Database initialised");
                println!("✅ Database ready at {}", config.database.path.display());
            }
            StorageBackend::Memory => {
                println!("ℹ️  In-memory backend configured; nothing to initialise");
            }
        },
    }

    Ok(())
}
