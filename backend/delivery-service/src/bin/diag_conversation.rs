/// Print the latest messages of a conversation next to its read markers and
/// flag rows whose status disagrees with them.
///
/// Usage:
/// ```bash
/// cargo run --bin diag-conversation -- <conversation_id> [--limit <N>]
/// ```
use anyhow::{Context, Result};
use delivery_service::{
    db, logging,
    services::{diagnose_conversation, Anomaly},
    store::{MessageRepository, PgStore, ReadMarkerRepository},
};
use std::sync::Arc;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_tracing();
    let (conversation_id, limit) = parse_args()?;
    dotenvy::dotenv().ok();

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = db::init_pool(&database_url)
        .await
        .context("Failed to connect to database")?;
    let store = Arc::new(PgStore::new(pool));
    let messages: Arc<dyn MessageRepository> = store.clone();
    let markers: Arc<dyn ReadMarkerRepository> = store;

    let report = diagnose_conversation(&messages, &markers, conversation_id, limit)
        .await
        .context("diagnosis failed")?;

    println!("conversation {}", report.conversation_id);
    for marker in &report.markers {
        println!(
            "  marker user={} last_read={} updated_at={}",
            marker.user_id, marker.last_read_message_id, marker.updated_at
        );
    }
    println!();
    for m in &report.messages {
        let tags: Vec<&str> = m.anomalies.iter().map(|a| a.tag()).collect();
        println!(
            "  #{:<10} sender={} status={} expected_read={} delivered_at={} read_at={} {}",
            m.id,
            m.sender_id,
            m.delivery_status,
            m.expected_read,
            m.delivered_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into()),
            m.read_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into()),
            tags.join(",")
        );
    }
    println!();
    println!("messages checked:            {}", report.messages.len());
    for kind in [
        Anomaly::ExpectedReadNotPersisted,
        Anomaly::Status2NoReadAt,
        Anomaly::ReadAtStatus1,
    ] {
        println!("{:<29}{}", format!("{}:", kind.tag()), report.anomaly_count(kind));
    }
    Ok(())
}

fn parse_args() -> Result<(Uuid, i64)> {
    let args: Vec<String> = std::env::args().collect();
    let mut conversation = None;
    let mut limit = 30;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--limit" => {
                let value = args.get(i + 1).context("--limit requires a value")?;
                limit = value.parse().context("Invalid limit")?;
                i += 2;
            }
            "--help" | "-h" => {
                println!("usage: diag-conversation <conversation_id> [--limit <n>]");
                std::process::exit(0);
            }
            value if conversation.is_none() => {
                conversation = Some(Uuid::parse_str(value).context("Invalid conversation id")?);
                i += 1;
            }
            other => anyhow::bail!("Unknown argument: {}", other),
        }
    }

    let conversation = conversation.context("conversation_id is required")?;
    Ok((conversation, limit))
}
