//! EstateFlow service binary.
//!
//! Wires the core: Redis-backed KV store + queue, SQLite relational mirror
//! and vector indexes, HTTP LLM/embedding clients, the Meta gateway, worker
//! pool, and idle sweeper. Everything is constructed here once and passed as
//! dependencies; no global state beyond the tracing subscriber.

use std::sync::{Arc, Mutex};

use anyhow::Context;
use tokio::sync::watch;

use estateflow::config::Settings;
use estateflow::db::CoreDatabase;
use estateflow::dispatcher::{MessageDispatcher, Worker};
use estateflow::embedding::HttpEmbeddingClient;
use estateflow::escalation::{EscalationDetector, EscalationHandoff};
use estateflow::intent::IntentClassifier;
use estateflow::lead::LeadNotificationRouter;
use estateflow::llm::{HttpLlmClient, LlmClient};
use estateflow::notify::{LoggingEmailSender, LoggingSmsSender};
use estateflow::outbound::{MetaGateway, OutboundDispatcher, OutboundSender};
use estateflow::queue::{JobQueue, RedisJobQueue};
use estateflow::rag::RagRetriever;
use estateflow::ratelimit::RateLimiter;
use estateflow::session::SessionStore;
use estateflow::store::{KvStore, RedisStore};
use estateflow::sweeper::IdleSweeper;
use estateflow::vector::{DocumentIndex, PropertyIndex};

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let settings = Settings::from_env();
    tracing::info!(
        agent_id = %settings.agent_id,
        concurrency = settings.queue.concurrency,
        "estateflow starting"
    );

    // Shared infrastructure.
    let kv: Arc<dyn KvStore> = Arc::new(
        RedisStore::connect(&settings.redis_url)
            .await
            .context("redis connection failed")?,
    );
    let queue: Arc<dyn JobQueue> = Arc::new(
        RedisJobQueue::connect(&settings.redis_url)
            .await
            .context("redis queue connection failed")?,
    );
    let db = Arc::new(CoreDatabase::open(&settings.database_path).context("sqlite open failed")?);

    let vector_conn = Arc::new(Mutex::new(
        rusqlite::Connection::open(&settings.database_path)
            .context("vector index open failed")?,
    ));
    let properties = Arc::new(PropertyIndex::open_properties(vector_conn.clone())?);
    let documents = Arc::new(DocumentIndex::open_documents(vector_conn)?);

    // Model backends.
    let llm: Arc<dyn LlmClient> = Arc::new(HttpLlmClient::new(settings.llm.clone())?);
    let embeddings = Arc::new(HttpEmbeddingClient::new(settings.embedding.clone())?);

    // Core services.
    let sessions = Arc::new(SessionStore::new(kv.clone(), settings.session.clone()));
    let retriever = Arc::new(RagRetriever::new(embeddings, properties, documents));
    let classifier = Arc::new(IntentClassifier::new(llm.clone()));
    let detector = Arc::new(EscalationDetector::new(llm.clone()));

    let gateway = Arc::new(MetaGateway::new(settings.gateway.clone())?);
    let limiter = RateLimiter::new(kv.clone(), settings.rate_limit);
    let outbound: Arc<dyn OutboundSender> = Arc::new(OutboundDispatcher::new(
        limiter,
        gateway,
        settings.gateway.phone_number_id.clone(),
    ));

    let email = Arc::new(LoggingEmailSender);
    let sms = Arc::new(LoggingSmsSender);
    let handoff = Arc::new(EscalationHandoff::new(
        db.clone(),
        sessions.clone(),
        llm.clone(),
        outbound.clone(),
        email.clone(),
        sms,
    ));
    let lead_router = Arc::new(LeadNotificationRouter::new(
        db.clone(),
        email,
        outbound.clone(),
    ));

    let dispatcher = Arc::new(MessageDispatcher::new(
        settings.agent_id.clone(),
        sessions.clone(),
        classifier,
        retriever,
        llm,
        detector,
        handoff,
        lead_router,
        db,
        outbound,
    ));

    // Background tasks.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = Worker::new(queue, dispatcher, settings.queue.clone());
    let worker_handle = tokio::spawn(worker.run(shutdown_rx.clone()));

    let sweeper = IdleSweeper::new(sessions, settings.session.idle_check_interval);
    let sweeper_rx = shutdown_rx.clone();
    let sweeper_handle = tokio::spawn(async move { sweeper.run(sweeper_rx).await });

    tokio::signal::ctrl_c()
        .await
        .context("ctrl-c handler failed")?;
    tracing::info!("shutdown signal received");
    shutdown_tx.send(true).ok();

    let _ = worker_handle.await;
    let _ = sweeper_handle.await;
    tracing::info!("estateflow stopped");
    Ok(())
}
