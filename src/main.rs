//! veritas-chat - terminal client for the statement-validation service
//!
//! A thin REPL over the client core: type an utterance, watch the
//! statement stream in, then walk the assertion/evidence chain with slash
//! commands.

use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use veritas_client::db::Database;
use veritas_client::{HttpBackend, ProductionSession, Session, Update, WsDialer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "veritas_client=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    // Configuration
    let ws_url = std::env::var("VERITAS_WS_URL")
        .unwrap_or_else(|_| "wss://localhost:8443/ws".to_string());
    let api_url = std::env::var("VERITAS_API_URL")
        .unwrap_or_else(|_| "https://localhost:8443".to_string());
    let session_token = std::env::var("VERITAS_SESSION")?;
    let db_path = std::env::var("VERITAS_DB_PATH").unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        format!("{home}/.veritas/veritas.db")
    });

    // Ensure database directory exists
    if let Some(parent) = std::path::PathBuf::from(&db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(path = %db_path, "Opening database");
    let db = Arc::new(Database::open(&db_path)?);

    let session: ProductionSession = Session::new(
        HttpBackend::new(api_url),
        WsDialer,
        ws_url,
        db.clone(),
        db,
    );

    let user = session.connect(&session_token).await?;
    println!("signed in as {} <{}>", user.name, user.email);

    let session = Arc::new(session);
    spawn_update_printer(&session);

    let topic = match session.topics().into_iter().next() {
        Some(topic) => topic,
        None => session.create_topic("new conversation").await?,
    };
    println!("topic: {} ({})", topic.title, topic.id);
    println!("commands: /verify <statement-id>, /evidence <assertion-id> <text>, /quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }

        let outcome = if let Some(rest) = line.strip_prefix("/verify ") {
            verify(&session, &topic.id, rest.trim()).await
        } else if let Some(rest) = line.strip_prefix("/evidence ") {
            evidence(&session, &topic.id, rest.trim()).await
        } else {
            utter(&session, &topic.id, &line).await
        };
        if let Err(e) = outcome {
            eprintln!("error: {e}");
        }
    }

    Ok(())
}

async fn utter(
    session: &ProductionSession,
    chat_id: &str,
    text: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let statement = session.submit_utterance(chat_id, text).await?;
    println!("[{}] {}", statement.id(), statement.text());
    Ok(())
}

async fn verify(
    session: &ProductionSession,
    chat_id: &str,
    statement_id: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let assertions = session.request_assertions(chat_id, statement_id).await?;
    for (id, text) in assertions.entries() {
        println!("[{id}] {text}");
    }
    Ok(())
}

async fn evidence(
    session: &ProductionSession,
    chat_id: &str,
    rest: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let (assertion_id, text) = rest.split_once(' ').unwrap_or((rest, ""));
    let frame = session
        .request_evidence(chat_id, assertion_id, text, None)
        .await?;
    if let Some(evidence) = frame.evidence {
        println!("verdict: {}", evidence.final_verdict);
        println!("summary: {}", evidence.summary);
        for (name, item) in &evidence.items {
            println!("  {name}: {} ({}) {}", item.verdict, item.score, item.source_url);
        }
    }
    Ok(())
}

/// Print stream chunks as they arrive so statements render progressively.
fn spawn_update_printer(session: &Arc<ProductionSession>) {
    let mut updates = session.subscribe();
    tokio::spawn(async move {
        while let Ok(update) = updates.recv().await {
            match update {
                Update::StreamChunk { text, .. } => {
                    if !text.is_empty() {
                        print!("{text}");
                        let _ = std::io::Write::flush(&mut std::io::stdout());
                    }
                }
                Update::StreamEnded { .. } => println!(),
                Update::Link(state) => tracing::info!(?state, "link state"),
                _ => {}
            }
        }
    });
}
