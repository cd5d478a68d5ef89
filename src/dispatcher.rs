//! Message dispatcher: the per-job pipeline and the worker pool.
//!
//! One job per inbound `ParsedMessage`, keyed by `messageId` so duplicate
//! deliveries collapse. The pipeline: load/create session, compute the next
//! state in memory, classify, merge entities, retrieve context, generate,
//! post-process, persist the session ONCE, score the lead (single
//! conversation update), then send. Escalation short-circuits to the handoff.
//!
//! User and assistant messages accumulate in memory until after the LLM call
//! an LLM failure still persists the user message and transmits a
//! bilingual fallback to the customer.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use crate::config::QueueSettings;
use crate::db::CoreDatabase;
use crate::entities::{extract_search_filters, merge};
use crate::error::{CoreError, CoreResult};
use crate::escalation::{EscalationDetector, EscalationHandoff, EscalationTrigger};
use crate::intent::{detect_language, Intent, IntentClassifier};
use crate::lead::{calculate_score, LeadNotificationRouter};
use crate::llm::{ChatMessage, GenerationOptions, LlmClient};
use crate::outbound::OutboundSender;
use crate::postprocess::{ResponseContext, ResponsePostProcessor, RichResponse};
use crate::queue::{Job, JobQueue};
use crate::rag::{RagRetriever, RetrievalOptions, RetrievedContext};
use crate::session::{MessageRole, Session, SessionMessage, SessionState, SessionStore};
use crate::types::{MessageContent, OutboundBody, OutboundMessage, ParsedMessage};

// ─── Constants ──────────────────────────────────────────────────────────────

/// Retry delays between job attempts.
const RETRY_BACKOFF: [Duration; 3] = [
    Duration::from_secs(2),
    Duration::from_secs(4),
    Duration::from_secs(8),
];

/// Attempts per job before the DLQ.
const MAX_ATTEMPTS: u32 = 3;

/// How much history rides along into the generation call.
const GENERATION_HISTORY_WINDOW: usize = 6;

/// Sent to the customer when generation fails outright.
const FALLBACK_MESSAGE: &str = "عذراً، حدث خطأ مؤقت. سيتم الرد عليك خلال لحظات.\nSorry, something went wrong on our side — we'll get back to you in a moment.";

// ─── Outcome ────────────────────────────────────────────────────────────────

/// What one logical processing produced.
#[derive(Debug, Clone, Copy)]
pub struct ProcessOutcome {
    pub processed: bool,
    pub response_generated: bool,
    pub escalated: bool,
    pub intent: Option<Intent>,
}

// ─── Dispatcher ─────────────────────────────────────────────────────────────

/// Orchestrates the full pipeline for one inbound message.
pub struct MessageDispatcher {
    agent_id: String,
    sessions: Arc<SessionStore>,
    classifier: Arc<IntentClassifier>,
    retriever: Arc<RagRetriever>,
    llm: Arc<dyn LlmClient>,
    detector: Arc<EscalationDetector>,
    handoff: Arc<EscalationHandoff>,
    lead_router: Arc<LeadNotificationRouter>,
    db: Arc<CoreDatabase>,
    outbound: Arc<dyn OutboundSender>,
}

impl MessageDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agent_id: String,
        sessions: Arc<SessionStore>,
        classifier: Arc<IntentClassifier>,
        retriever: Arc<RagRetriever>,
        llm: Arc<dyn LlmClient>,
        detector: Arc<EscalationDetector>,
        handoff: Arc<EscalationHandoff>,
        lead_router: Arc<LeadNotificationRouter>,
        db: Arc<CoreDatabase>,
        outbound: Arc<dyn OutboundSender>,
    ) -> Self {
        MessageDispatcher {
            agent_id,
            sessions,
            classifier,
            retriever,
            llm,
            detector,
            handoff,
            lead_router,
            db,
            outbound,
        }
    }

    /// One logical processing of an inbound message.
    pub async fn process(&self, message: &ParsedMessage) -> CoreResult<ProcessOutcome> {
        let mut session = self.sessions.get(&message.from, &self.agent_id).await?;

        if session.extracted_info.customer_name.is_none() {
            session.extracted_info.customer_name = message.from_name.clone();
        }

        // Candidate next state, in memory only.
        match session.state {
            SessionState::New | SessionState::Idle => {
                self.sessions.update_state(&mut session, SessionState::Active)?;
            }
            _ => {}
        }

        match &message.content {
            MessageContent::Text { body } => {
                let body = body.clone();
                self.process_text(&mut session, message, &body).await
            }
            other => {
                tracing::info!(
                    customer = %message.from,
                    kind = ?content_kind(other),
                    "non-text message received, persisting only"
                );
                self.sessions
                    .add_message(&mut session, inbound_entry(message));
                self.sessions.update(&mut session).await?;
                Ok(ProcessOutcome {
                    processed: true,
                    response_generated: false,
                    escalated: false,
                    intent: None,
                })
            }
        }
    }

    async fn process_text(
        &self,
        session: &mut Session,
        message: &ParsedMessage,
        body: &str,
    ) -> CoreResult<ProcessOutcome> {
        let language = detect_language(body);
        session.language_preference = Some(language.as_str().to_string());

        // Classify with the last three messages as context.
        let history: Vec<String> = session
            .message_history
            .iter()
            .rev()
            .take(3)
            .rev()
            .filter_map(|m| m.text_body().map(str::to_string))
            .collect();
        let context_refs: Vec<&str> = history.iter().map(String::as_str).collect();
        let classification = self.classifier.classify(body, &context_refs).await?;
        let intent = classification.intent;

        session.extracted_info = merge(&session.extracted_info, &classification.entities);
        self.sessions.update_intent(session, intent);

        // Rule/LLM escalation check runs against history BEFORE this turn.
        let check = self.detector.detect(body, session).await;
        if check.should_escalate {
            let trigger = check.trigger.unwrap_or(EscalationTrigger::ExplicitRequest);
            tracing::info!(
                customer = %session.customer_id,
                trigger = trigger.as_str(),
                confidence = check.confidence,
                "escalation detected, short-circuiting to handoff"
            );
            self.sessions.add_message(session, inbound_entry(message));
            self.handoff.handoff(session, trigger, &check.reason).await?;
            self.sessions.update(session).await?;
            self.score_and_update(session).await;
            return Ok(ProcessOutcome {
                processed: true,
                response_generated: false,
                escalated: true,
                intent: Some(intent),
            });
        }

        // Retrieval; greetings and goodbyes never touch the vector store.
        let context = if template_only(intent) {
            RetrievedContext::default()
        } else {
            let options = RetrievalOptions {
                source: None,
                k: None,
                filters: extract_search_filters(&session.extracted_info),
            };
            match self
                .retriever
                .retrieve_context(body, &self.agent_id, &options)
                .await
            {
                Ok(context) => context,
                Err(e) => {
                    // Vector infrastructure fails closed: empty context.
                    tracing::error!(error = %e, "retrieval failed, proceeding with empty context");
                    RetrievedContext::default()
                }
            }
        };

        // Generate (skipped when a template will answer anyway).
        let generated = if template_only(intent) {
            Ok(String::new())
        } else {
            self.generate_reply(session, body, &context).await
        };

        let llm_text = match generated {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(customer = %session.customer_id, error = %e, "generation failed, sending fallback");
                self.sessions.add_message(session, inbound_entry(message));
                if let Err(persist_err) = self.sessions.update(session).await {
                    tracing::error!(error = %persist_err, "session persist failed after LLM failure");
                }
                if let Err(send_err) = self
                    .outbound
                    .dispatch(&OutboundMessage::text(
                        session.customer_id.clone(),
                        FALLBACK_MESSAGE,
                    ))
                    .await
                {
                    tracing::error!(error = %send_err, "fallback message send failed");
                }
                self.score_and_update(session).await;
                return Ok(ProcessOutcome {
                    processed: true,
                    response_generated: false,
                    escalated: false,
                    intent: Some(intent),
                });
            }
        };

        let properties: Vec<_> = context
            .properties
            .iter()
            .map(|hit| hit.document.clone())
            .collect();
        let agent_name = self
            .db
            .get_agent(&self.agent_id)
            .ok()
            .flatten()
            .map(|profile| profile.name);
        let rich = ResponsePostProcessor::process(
            &llm_text,
            &ResponseContext {
                intent,
                properties: &properties,
                customer_name: session.extracted_info.customer_name.as_deref(),
                agent_name: agent_name.as_deref(),
                extracted_info: &session.extracted_info,
                language,
            },
        );

        self.sessions.add_message(session, inbound_entry(message));
        self.sessions.add_message(
            session,
            SessionMessage::text(MessageRole::Assistant, rich.text.clone()),
        );

        // The post-processor's cue forces the handoff; its customer notice
        // replaces the generated reply.
        if rich.requires_escalation {
            let trigger = if intent == Intent::Complaint {
                EscalationTrigger::Complaint
            } else {
                EscalationTrigger::ExplicitRequest
            };
            self.handoff
                .handoff(session, trigger, "response post-processor flagged escalation")
                .await?;
            self.sessions.update(session).await?;
            self.score_and_update(session).await;
            return Ok(ProcessOutcome {
                processed: true,
                response_generated: true,
                escalated: true,
                intent: Some(intent),
            });
        }

        // The single session write of the happy path.
        if let Err(e) = self.sessions.update(session).await {
            // Persistence is primary, but the customer still gets a reply;
            // the retry rebuilds the session.
            tracing::error!(customer = %session.customer_id, error = %e, "session persist failed, sending reply anyway");
            if self.send_reply(&session.customer_id, message, &rich).await.is_err() {
                let _ = self
                    .outbound
                    .dispatch(&OutboundMessage::text(
                        session.customer_id.clone(),
                        FALLBACK_MESSAGE,
                    ))
                    .await;
            }
            return Err(e);
        }

        self.score_and_update(session).await;
        self.send_reply(&session.customer_id, message, &rich).await?;

        Ok(ProcessOutcome {
            processed: true,
            response_generated: true,
            escalated: false,
            intent: Some(intent),
        })
    }

    async fn generate_reply(
        &self,
        session: &Session,
        body: &str,
        context: &RetrievedContext,
    ) -> CoreResult<String> {
        let system = self.build_system_prompt(session, context);
        let mut messages = vec![ChatMessage::system(system)];

        let start = session
            .message_history
            .len()
            .saturating_sub(GENERATION_HISTORY_WINDOW);
        for entry in &session.message_history[start..] {
            if let Some(text) = entry.text_body() {
                messages.push(match entry.role {
                    MessageRole::User => ChatMessage::user(text),
                    MessageRole::Assistant | MessageRole::Agent => ChatMessage::assistant(text),
                });
            }
        }
        messages.push(ChatMessage::user(body));

        let completion = self
            .llm
            .generate(&messages, GenerationOptions::default())
            .await?;
        if let Some(usage) = completion.usage {
            tracing::debug!(
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "generation token usage"
            );
        }
        Ok(completion.text)
    }

    fn build_system_prompt(&self, session: &Session, context: &RetrievedContext) -> String {
        let mut prompt = String::from(
            "You are a friendly real-estate sales assistant on WhatsApp. Answer \
             concisely, stay factual about listings, and never invent prices or \
             availability.",
        );

        match session.language_preference.as_deref() {
            Some("ar") => prompt.push_str(" Reply in Arabic."),
            Some("en") => prompt.push_str(" Reply in English."),
            _ => prompt.push_str(" Mirror the customer's mix of Arabic and English."),
        }

        if session.extracted_info.filled_count() > 0 {
            if let Ok(info) = serde_json::to_string(&session.extracted_info) {
                prompt.push_str("\n\nKnown customer preferences: ");
                prompt.push_str(&info);
            }
        }

        // One grounding-instruction block for the whole crate.
        crate::rag::apply_context(&prompt, &context.combined_context)
    }

    /// Lead scoring + the single conversation row update. Auxiliary: logs,
    /// never fails the pipeline.
    async fn score_and_update(&self, session: &Session) {
        let score = calculate_score(session);
        let conversation = match self
            .db
            .upsert_conversation(&self.agent_id, &session.customer_id)
        {
            Ok(conversation) => conversation,
            Err(e) => {
                tracing::error!(error = %e, "conversation upsert failed, skipping lead update");
                return;
            }
        };

        let agent = self.db.get_agent(&self.agent_id).ok().flatten();
        let outcome = self
            .lead_router
            .route(&conversation, agent.as_ref(), &score)
            .await;

        let mut patch = outcome.metadata;
        if let Ok(factors) = serde_json::to_value(score.factors) {
            patch["leadScoreFactors"] = factors;
        }

        if let Err(e) =
            self.db
                .update_lead(&conversation.id, score.total, score.quality.as_str(), &patch)
        {
            tracing::error!(error = %e, "lead update failed");
        }
    }

    /// Deliver the rich response: one text-or-buttons message (cards folded
    /// into the body), then an optional best-effort map pin.
    async fn send_reply(
        &self,
        to: &str,
        message: &ParsedMessage,
        rich: &RichResponse,
    ) -> CoreResult<()> {
        let mut text = rich.text.clone();
        if !rich.property_cards.is_empty() {
            text.push_str("\n");
            for card in &rich.property_cards {
                text.push_str(&format!("\n• {}", card.title));
                if let Some(ref price) = card.price_display {
                    text.push_str(&format!(" — {price}"));
                }
                if let Some(ref location) = card.location {
                    text.push_str(&format!(" — {location}"));
                }
            }
        }

        let body = if rich.buttons.is_empty() {
            OutboundBody::Text { text }
        } else {
            OutboundBody::Buttons {
                text,
                buttons: rich.buttons.clone(),
            }
        };

        self.outbound
            .dispatch(&OutboundMessage {
                to: to.to_string(),
                body,
                client_message_id: Some(format!("reply:{}", message.message_id)),
            })
            .await?;

        if let Some(ref pin) = rich.location {
            let location_message = OutboundMessage {
                to: to.to_string(),
                body: OutboundBody::Location {
                    latitude: pin.latitude,
                    longitude: pin.longitude,
                    name: pin.name.clone(),
                    address: pin.address.clone(),
                },
                client_message_id: None,
            };
            if let Err(e) = self.outbound.dispatch(&location_message).await {
                tracing::warn!(error = %e, "location pin send failed");
            }
        }
        Ok(())
    }
}

/// Intents answered purely by template: no retrieval, no generation.
fn template_only(intent: Intent) -> bool {
    matches!(intent, Intent::Greeting | Intent::Goodbye | Intent::AgentRequest)
}

fn content_kind(content: &MessageContent) -> &'static str {
    match content {
        MessageContent::Text { .. } => "text",
        MessageContent::Media(_) => "media",
        MessageContent::Location(_) => "location",
        MessageContent::Interactive { .. } => "interactive",
    }
}

fn inbound_entry(message: &ParsedMessage) -> SessionMessage {
    let timestamp = chrono::DateTime::parse_from_rfc3339(&message.timestamp)
        .map(|t| t.timestamp_millis())
        .unwrap_or_else(|_| Utc::now().timestamp_millis());
    SessionMessage {
        role: MessageRole::User,
        content: message.content.clone(),
        timestamp,
        message_id: Some(message.message_id.clone()),
    }
}

// ─── Worker pool ────────────────────────────────────────────────────────────

/// Consumes the job queue with N concurrent workers, a per-second job rate
/// cap, retry/backoff/DLQ handling, and a periodic stalled-job scan.
pub struct Worker {
    queue: Arc<dyn JobQueue>,
    dispatcher: Arc<MessageDispatcher>,
    settings: QueueSettings,
    rate: tokio::sync::Mutex<RateWindow>,
}

struct RateWindow {
    window_start: tokio::time::Instant,
    count: u32,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        dispatcher: Arc<MessageDispatcher>,
        settings: QueueSettings,
    ) -> Arc<Self> {
        Arc::new(Worker {
            queue,
            dispatcher,
            settings,
            rate: tokio::sync::Mutex::new(RateWindow {
                window_start: tokio::time::Instant::now(),
                count: 0,
            }),
        })
    }

    /// Run the pool until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let mut handles = Vec::new();
        for index in 0..self.settings.concurrency {
            let worker = self.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                worker.consume_loop(index, shutdown).await;
            }));
        }

        let worker = self.clone();
        let stall_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            worker.stall_loop(stall_shutdown).await;
        }));

        futures::future::join_all(handles).await;
        tracing::info!("worker pool drained");
    }

    async fn consume_loop(&self, index: usize, shutdown: watch::Receiver<bool>) {
        tracing::info!(worker = index, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.rate_gate().await;
            match self.queue.reserve().await {
                Ok(Some(job)) => self.run_job(job).await,
                Ok(None) => tokio::time::sleep(Duration::from_millis(200)).await,
                Err(e) => {
                    tracing::error!(worker = index, error = %e, "queue reserve failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        tracing::info!(worker = index, "worker stopped");
    }

    async fn stall_loop(&self, shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.stalled_check_interval);
        loop {
            ticker.tick().await;
            if *shutdown.borrow() {
                break;
            }
            match self
                .queue
                .recover_stalled(self.settings.job_lock, self.settings.max_stalls)
                .await
            {
                Ok(0) => {}
                Ok(recovered) => tracing::warn!(recovered, "recovered stalled jobs"),
                Err(e) => tracing::error!(error = %e, "stalled scan failed"),
            }
        }
    }

    /// Burst throttle: at most `jobs_per_second` reservations per second.
    async fn rate_gate(&self) {
        loop {
            let sleep_for = {
                let mut window = self.rate.lock().await;
                let now = tokio::time::Instant::now();
                if now.duration_since(window.window_start) >= Duration::from_secs(1) {
                    window.window_start = now;
                    window.count = 0;
                }
                if window.count < self.settings.jobs_per_second {
                    window.count += 1;
                    return;
                }
                Duration::from_secs(1) - now.duration_since(window.window_start)
            };
            tokio::time::sleep(sleep_for).await;
        }
    }

    /// Run one job with retry/backoff; exhausted retries dead-letter it.
    pub async fn run_job(&self, job: Job) {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.dispatcher.process(&job.message).await {
                Ok(outcome) => {
                    tracing::info!(
                        job_id = %job.id,
                        attempt,
                        response_generated = outcome.response_generated,
                        escalated = outcome.escalated,
                        "job processed"
                    );
                    if let Err(e) = self.queue.complete(&job).await {
                        tracing::error!(job_id = %job.id, error = %e, "job ack failed");
                    }
                    return;
                }
                Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                    let delay = RETRY_BACKOFF[(attempt - 1) as usize];
                    tracing::warn!(
                        job_id = %job.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "job attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_retryable() || matches!(e, CoreError::Permanent { .. }) => {
                    tracing::error!(
                        job_id = %job.id,
                        attempts = attempt,
                        error = %e,
                        is_final_failure = true,
                        "job failed, dead-lettering"
                    );
                    if let Err(dlq_err) = self.queue.fail_to_dlq(&job, &e.to_string()).await {
                        tracing::error!(job_id = %job.id, error = %dlq_err, "DLQ write failed");
                    }
                    return;
                }
                Err(e) => {
                    // Validation / NotFound / InvalidTransition: surfaced,
                    // never retried, never crashes the worker.
                    tracing::error!(job_id = %job.id, error = %e, "job failed with non-retryable error, dropping");
                    let _ = self.queue.complete(&job).await;
                    return;
                }
            }
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
