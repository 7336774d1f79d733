/// One-shot read-marker reconciliation.
///
/// Promotes messages that sit at or below a reader's marker but never
/// reached READ, using the same conditional update as the live read path.
///
/// Usage:
/// ```bash
/// cargo run --bin reconcile-read-markers -- [OPTIONS]
/// ```
///
/// Options:
/// - `--conversation <uuid>`: Limit the pass to one conversation
/// - `--dry-run`: Count candidates without writing
/// - `--batch <N>`: Max messages promoted per marker (default: 10000)
use anyhow::{Context, Result};
use delivery_service::{
    config::ReconcileConfig,
    db, logging,
    services::ReconciliationJob,
    store::PgStore,
};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct ReconcileArgs {
    conversation: Option<Uuid>,
    dry_run: bool,
    batch: i64,
}

impl Default for ReconcileArgs {
    fn default() -> Self {
        Self {
            conversation: None,
            dry_run: false,
            batch: 10_000,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_tracing();
    let args = parse_args()?;
    dotenvy::dotenv().ok();

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = db::init_pool(&database_url)
        .await
        .context("Failed to connect to database")?;
    let store = Arc::new(PgStore::new(pool));

    info!(?args, "starting read-marker reconciliation");
    let config = ReconcileConfig {
        batch: args.batch,
        ..ReconcileConfig::default()
    };
    let job = ReconciliationJob::new(store.clone(), store, &config, 0);
    let report = job
        .run_once(args.conversation, args.dry_run)
        .await
        .context("reconciliation pass failed")?;

    println!("markers scanned:    {}", report.markers_scanned);
    println!("candidate messages: {}", report.candidates);
    if args.dry_run {
        println!("dry run: nothing written");
    } else {
        println!("messages updated:   {}", report.updated);
    }
    if report.failed > 0 {
        println!("markers failed:     {}", report.failed);
    }
    Ok(())
}

fn parse_args() -> Result<ReconcileArgs> {
    let mut config = ReconcileArgs::default();
    let args: Vec<String> = std::env::args().collect();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--dry-run" => {
                config.dry_run = true;
                i += 1;
            }
            "--batch" => {
                let value = args.get(i + 1).context("--batch requires a value")?;
                config.batch = value.parse().context("Invalid batch size")?;
                if config.batch <= 0 {
                    anyhow::bail!("--batch must be positive");
                }
                i += 2;
            }
            "--conversation" => {
                let value = args
                    .get(i + 1)
                    .context("--conversation requires a UUID value")?;
                config.conversation =
                    Some(Uuid::parse_str(value).context("Invalid UUID for --conversation")?);
                i += 2;
            }
            "--help" | "-h" => {
                println!("usage: reconcile-read-markers [--conversation <uuid>] [--dry-run] [--batch <n>]");
                std::process::exit(0);
            }
            other => anyhow::bail!("Unknown argument: {}", other),
        }
    }

    Ok(config)
}
