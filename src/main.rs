use anyhow::Result;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use riftlink::config::EngineConfig;
use riftlink::llm_client::LlmClient;
use riftlink::persona::Persona;
use riftlink::session::{ChatSession, SendOutcome, SessionEvent};
use riftlink::store::PersonaStore;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,riftlink=debug")),
        )
        .init();

    tracing::info!("Riftlink starting...");

    let config = EngineConfig::load();
    let store = Arc::new(PersonaStore::open(&config.database_path)?);
    let generator = Arc::new(LlmClient::new(
        config.llm_api_url.clone(),
        config.llm_api_key.clone().unwrap_or_default(),
        config.llm_model.clone(),
    ));

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run(store, generator, config))
}

async fn run(
    store: Arc<PersonaStore>,
    generator: Arc<LlmClient>,
    config: EngineConfig,
) -> Result<()> {
    let persona = match store.list()?.into_iter().next() {
        Some(persona) => persona,
        None => {
            let persona = Persona::new("Aki");
            store.create(&persona)?;
            tracing::info!("Created persona {} ({})", persona.name, persona.id);
            persona
        }
    };

    let (event_tx, event_rx) = flume::unbounded();
    let session = ChatSession::new(Arc::clone(&store), generator, config, event_tx);
    session.start(&persona.id).await?;

    // Out-of-band arrivals: proactive contacts, delayed replies, queue
    // flushes.
    let event_store = Arc::clone(&store);
    let event_name = persona.name.clone();
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv_async().await {
            match event {
                SessionEvent::MessageArrived { persona_id } => {
                    match event_store.messages(&persona_id) {
                        Ok(log) => {
                            if let Some(last) = log.last() {
                                println!("\n{}: {}", event_name, last.content);
                            }
                        }
                        Err(e) => tracing::warn!("Failed to read log: {}", e),
                    }
                }
                SessionEvent::StatusChanged { persona_id } => {
                    match event_store.status(&persona_id) {
                        Ok(Some(status)) => println!("\n[{} is now: {}]", event_name, status.label),
                        Ok(None) => println!("\n[{} status cleared]", event_name),
                        Err(e) => tracing::warn!("Failed to read status: {}", e),
                    }
                }
            }
        }
    });

    println!("Connected to {}. Type a message, or /quit to exit.", persona.name);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        if line == "/retry" {
            match session.retry_reply().await {
                Ok(message) => println!("{}: {}", persona.name, message.content),
                Err(e) => println!("[retry failed: {}]", e),
            }
            continue;
        }

        match session.send_message(line).await {
            Ok(SendOutcome::Replied(message)) => {
                println!("{}: {}", persona.name, message.content);
            }
            Ok(SendOutcome::Delayed { eta_minutes }) => {
                println!("[{} will reply in about {}m]", persona.name, eta_minutes);
            }
            Ok(SendOutcome::Queued) => {
                println!("[{} is unavailable right now; message held]", persona.name);
            }
            Err(e) => {
                println!("[send failed: {} - /retry to try again]", e);
            }
        }
    }

    session.stop();
    tracing::info!("Riftlink shutting down");
    Ok(())
}
