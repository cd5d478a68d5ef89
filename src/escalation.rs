//! Escalation: detection, handoff to a human agent, and resuming AI control.
//!
//! Six triggers evaluated in order, first match wins: explicit request,
//! complaint, negotiation (all bilingual regex), repeated question (Jaccard
//! over recent user messages), then two JSON-constrained LLM probes for
//! frustration and query complexity. Probe failures never escalate on their
//! own; the cheap rule triggers are the safety net.
//!
//! The handoff moves the conversation row and session to WAITING_AGENT,
//! generates a handoff summary (LLM with a deterministic fallback), notifies
//! the customer bilingually, and fans out to the agent: the in-app event is
//! written first (authoritative), then WhatsApp, email, and SMS run in
//! parallel and fail independently.

use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::db::CoreDatabase;
use crate::error::CoreResult;
use crate::intent::extract_first_json;
use crate::llm::{ChatMessage, GenerationOptions, LlmClient};
use crate::notify::{EmailSender, SmsSender};
use crate::outbound::OutboundSender;
use crate::session::{MessageRole, Session, SessionState, SessionStore};
use crate::types::{AgentProfile, ConversationStatus, OutboundMessage};

// ─── Triggers ───────────────────────────────────────────────────────────────

/// Why a conversation escalates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscalationTrigger {
    ExplicitRequest,
    Complaint,
    NegotiationRequest,
    RepeatedQuestion,
    FrustrationDetected,
    ComplexQuery,
}

impl EscalationTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationTrigger::ExplicitRequest => "EXPLICIT_REQUEST",
            EscalationTrigger::Complaint => "COMPLAINT",
            EscalationTrigger::NegotiationRequest => "NEGOTIATION_REQUEST",
            EscalationTrigger::RepeatedQuestion => "REPEATED_QUESTION",
            EscalationTrigger::FrustrationDetected => "FRUSTRATION_DETECTED",
            EscalationTrigger::ComplexQuery => "COMPLEX_QUERY",
        }
    }

    /// Urgency drives only the email subject and color.
    pub fn urgency(&self) -> Urgency {
        match self {
            EscalationTrigger::ExplicitRequest
            | EscalationTrigger::Complaint
            | EscalationTrigger::FrustrationDetected => Urgency::High,
            EscalationTrigger::NegotiationRequest | EscalationTrigger::RepeatedQuestion => {
                Urgency::Medium
            }
            EscalationTrigger::ComplexQuery => Urgency::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    High,
    Medium,
    Low,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::High => "high",
            Urgency::Medium => "medium",
            Urgency::Low => "low",
        }
    }
}

/// Detector verdict.
#[derive(Debug, Clone)]
pub struct EscalationCheck {
    pub should_escalate: bool,
    pub trigger: Option<EscalationTrigger>,
    pub confidence: f32,
    pub reason: String,
    pub customer_message: Option<String>,
}

impl EscalationCheck {
    fn negative() -> Self {
        EscalationCheck {
            should_escalate: false,
            trigger: None,
            confidence: 0.0,
            reason: String::new(),
            customer_message: None,
        }
    }

    fn positive(trigger: EscalationTrigger, confidence: f32, reason: impl Into<String>) -> Self {
        EscalationCheck {
            should_escalate: true,
            trigger: Some(trigger),
            confidence,
            reason: reason.into(),
            customer_message: Some(customer_notice(trigger).to_string()),
        }
    }
}

// ─── Detector ───────────────────────────────────────────────────────────────

/// How similar a message pair must be to count as a repeat.
const REPEAT_SIMILARITY: f64 = 0.7;

/// How many near-duplicates among the last five user messages trip the
/// repeated-question trigger.
const REPEAT_COUNT: usize = 2;

/// Minimum probe confidence before an LLM verdict escalates.
const PROBE_CONFIDENCE_FLOOR: f64 = 0.6;

fn explicit_request_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(talk|speak|chat)\s+(to|with)\s+(an?\s+)?(human|agent|person|someone|rep|representative)\b|\bhuman\s+agent\b|\breal\s+person\b",
        )
        .unwrap()
    })
}

const EXPLICIT_REQUEST_AR: [&str; 8] = [
    "عايز اكلم",
    "عايز أكلم",
    "اريد التحدث",
    "أريد التحدث",
    "كلمني حد",
    "حد يكلمني",
    "موظف",
    "مندوب",
];

fn complaint_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(complaint|complain|disappointed|terrible|horrible|awful|worst|scam|unacceptable)\b",
        )
        .unwrap()
    })
}

const COMPLAINT_AR: [&str; 6] = ["شكوى", "مش راضي", "سيء", "وحش", "نصب", "زفت"];

fn negotiation_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(discount|negotiat\w*|final\s+price|best\s+price|lower\s+price|better\s+(price|deal|offer)|special\s+(deal|offer))\b",
        )
        .unwrap()
    })
}

const NEGOTIATION_AR: [&str; 6] = ["خصم", "تفاوض", "تخفيض", "سعر أفضل", "اخر سعر", "آخر سعر"];

/// Word-set Jaccard similarity, punctuation-insensitive.
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let words = |s: &str| -> std::collections::HashSet<String> {
        s.to_lowercase()
            .split_whitespace()
            .map(|w| {
                w.chars()
                    .filter(|c| c.is_alphanumeric())
                    .collect::<String>()
            })
            .filter(|w| !w.is_empty())
            .collect()
    };
    let set_a = words(a);
    let set_b = words(b);
    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    intersection as f64 / union as f64
}

/// Rule + LLM hybrid escalation detector.
pub struct EscalationDetector {
    llm: Arc<dyn LlmClient>,
}

impl EscalationDetector {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        EscalationDetector { llm }
    }

    /// Evaluate the six triggers in order; first match wins.
    pub async fn detect(&self, message: &str, session: &Session) -> EscalationCheck {
        let lower = message.to_lowercase();

        if explicit_request_pattern().is_match(message)
            || EXPLICIT_REQUEST_AR.iter().any(|p| lower.contains(p))
        {
            return EscalationCheck::positive(
                EscalationTrigger::ExplicitRequest,
                0.95,
                "customer asked for a human agent",
            );
        }

        if complaint_pattern().is_match(message) || COMPLAINT_AR.iter().any(|p| lower.contains(p))
        {
            return EscalationCheck::positive(
                EscalationTrigger::Complaint,
                0.9,
                "complaint language detected",
            );
        }

        if negotiation_pattern().is_match(message)
            || NEGOTIATION_AR.iter().any(|p| lower.contains(p))
        {
            return EscalationCheck::positive(
                EscalationTrigger::NegotiationRequest,
                0.85,
                "customer wants to negotiate",
            );
        }

        if self.is_repeated_question(message, session) {
            return EscalationCheck::positive(
                EscalationTrigger::RepeatedQuestion,
                0.8,
                "customer repeated the same question",
            );
        }

        if let Some(confidence) = self.probe_frustration(message, session).await {
            return EscalationCheck::positive(
                EscalationTrigger::FrustrationDetected,
                confidence,
                "sentiment probe flagged frustration",
            );
        }

        if let Some(confidence) = self.probe_complexity(message).await {
            return EscalationCheck::positive(
                EscalationTrigger::ComplexQuery,
                confidence,
                "query beyond assistant scope",
            );
        }

        EscalationCheck::negative()
    }

    /// Jaccard >= 0.7 against at least two of the last five user messages.
    fn is_repeated_question(&self, message: &str, session: &Session) -> bool {
        let recent = session.recent_user_texts(5);
        let near_duplicates = recent
            .iter()
            .filter(|prior| jaccard_similarity(message, prior) >= REPEAT_SIMILARITY)
            .count();
        near_duplicates >= REPEAT_COUNT
    }

    async fn probe_frustration(&self, message: &str, session: &Session) -> Option<f32> {
        let recent: Vec<&str> = session.recent_user_texts(3);
        let prompt = format!(
            "Recent customer messages:\n{}\n\nLatest message: {message}\n\n\
             Is the customer frustrated or angry? Respond with ONLY JSON:\n\
             {{\"frustrated\": true/false, \"confidence\": 0.0}}",
            recent.join("\n")
        );
        self.run_probe(&prompt, "frustrated").await
    }

    async fn probe_complexity(&self, message: &str) -> Option<f32> {
        let prompt = format!(
            "Customer message: {message}\n\n\
             Does answering require legal, contractual, or custom-deal expertise \
             beyond a real-estate sales assistant (availability, prices, viewings, \
             payment plans)? Respond with ONLY JSON:\n\
             {{\"complex\": true/false, \"confidence\": 0.0}}"
        );
        self.run_probe(&prompt, "complex").await
    }

    /// Shared probe protocol: JSON-constrained, temperature 0.3, failures
    /// never escalate.
    async fn run_probe(&self, prompt: &str, flag_key: &str) -> Option<f32> {
        let messages = [ChatMessage::user(prompt.to_string())];
        let options = GenerationOptions {
            temperature: Some(0.3),
            max_tokens: Some(128),
        };

        let completion = match self.llm.generate(&messages, options).await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(probe = flag_key, error = %e, "escalation probe failed");
                return None;
            }
        };

        let value: serde_json::Value =
            serde_json::from_str(extract_first_json(&completion.text)?).ok()?;
        let flagged = value.get(flag_key)?.as_bool()?;
        let confidence = value
            .get("confidence")
            .and_then(|c| c.as_f64())
            .unwrap_or(0.0)
            .clamp(0.0, 1.0);

        if flagged && confidence >= PROBE_CONFIDENCE_FLOOR {
            Some(confidence as f32)
        } else {
            None
        }
    }
}

// ─── Customer notices ───────────────────────────────────────────────────────

/// Bilingual templated reply chosen by trigger.
pub fn customer_notice(trigger: EscalationTrigger) -> &'static str {
    match trigger {
        EscalationTrigger::ExplicitRequest => {
            "جاري تحويلك إلى أحد موظفينا الآن.\nTransferring you to one of our agents now — they will be with you shortly."
        }
        EscalationTrigger::Complaint => {
            "نأسف لذلك. أحد موظفينا سيتواصل معك فوراً لحل المشكلة.\nWe're sorry about this — an agent will contact you right away to resolve it."
        }
        EscalationTrigger::NegotiationRequest => {
            "سيتواصل معك أحد موظفينا لمناقشة أفضل عرض ممكن.\nOne of our agents will reach out to discuss the best possible offer."
        }
        EscalationTrigger::RepeatedQuestion => {
            "يبدو أن إجاباتي لم تكن كافية، جاري تحويلك لموظف مختص.\nIt seems my answers weren't quite enough — connecting you with a specialist."
        }
        EscalationTrigger::FrustrationDetected => {
            "نعتذر عن أي إزعاج. أحد موظفينا سيتولى المحادثة الآن.\nApologies for any inconvenience — an agent is taking over now."
        }
        EscalationTrigger::ComplexQuery => {
            "سؤال ممتاز يحتاج لمختص، جاري تحويلك لأحد موظفينا.\nGreat question — it needs a specialist, connecting you with one of our agents."
        }
    }
}

const RESUME_NOTICE: &str = "عدت لمساعدتك! كيف يمكنني خدمتك؟\nI'm back to assist you — how can I help?";

// ─── Handoff ────────────────────────────────────────────────────────────────

/// Result of a completed handoff.
#[derive(Debug, Clone)]
pub struct HandoffResult {
    pub conversation_id: String,
    pub summary: String,
    pub urgency: Urgency,
}

/// Orchestrates the transfer from AI to human agent.
pub struct EscalationHandoff {
    db: Arc<CoreDatabase>,
    sessions: Arc<SessionStore>,
    llm: Arc<dyn LlmClient>,
    outbound: Arc<dyn OutboundSender>,
    email: Arc<dyn EmailSender>,
    sms: Arc<dyn SmsSender>,
}

impl EscalationHandoff {
    pub fn new(
        db: Arc<CoreDatabase>,
        sessions: Arc<SessionStore>,
        llm: Arc<dyn LlmClient>,
        outbound: Arc<dyn OutboundSender>,
        email: Arc<dyn EmailSender>,
        sms: Arc<dyn SmsSender>,
    ) -> Self {
        EscalationHandoff {
            db,
            sessions,
            llm,
            outbound,
            email,
            sms,
        }
    }

    /// Execute the handoff. Mutates the session to WAITING_AGENT in memory;
    /// the caller persists it (the worker's single session write).
    ///
    /// Primary steps (conversation row, session transition) fail the call;
    /// everything downstream (summary, notifications, analytics) is
    /// auxiliary and only logs.
    pub async fn handoff(
        &self,
        session: &mut Session,
        trigger: EscalationTrigger,
        reason: &str,
    ) -> CoreResult<HandoffResult> {
        let conversation = self
            .db
            .upsert_conversation(&session.agent_id, &session.customer_id)?;
        self.db.set_conversation_status(
            &conversation.id,
            ConversationStatus::WaitingAgent,
            &json!({
                "escalated": true,
                "escalatedAt": chrono::Utc::now().to_rfc3339(),
                "escalationTrigger": trigger.as_str(),
            }),
        )?;

        self.sessions
            .update_state(session, SessionState::WaitingAgent)?;

        let summary = match self.generate_summary(session, trigger).await {
            Ok(summary) => summary,
            Err(e) => {
                tracing::warn!(error = %e, "handoff summary generation failed, using basic summary");
                basic_summary(session)
            }
        };

        // Customer notice is auxiliary: the handoff stands even if the send
        // fails.
        if let Err(e) = self
            .outbound
            .dispatch(&OutboundMessage::text(
                session.customer_id.clone(),
                customer_notice(trigger),
            ))
            .await
        {
            tracing::error!(customer = %session.customer_id, error = %e, "escalation customer notice failed");
        }

        let urgency = trigger.urgency();
        let agent = self.db.get_agent(&session.agent_id)?;
        self.notify_agent(session, &conversation.id, agent.as_ref(), trigger, &summary)
            .await;

        if let Err(e) = self.db.append_event(
            &session.agent_id,
            "conversation_escalated",
            &json!({
                "conversationId": conversation.id,
                "customerPhone": session.customer_id,
                "trigger": trigger.as_str(),
                "urgency": urgency.as_str(),
                "reason": reason,
            }),
        ) {
            tracing::error!(error = %e, "conversation_escalated analytics append failed");
        }

        Ok(HandoffResult {
            conversation_id: conversation.id,
            summary,
            urgency,
        })
    }

    /// Agent fan-out: in-app first (authoritative), then the side channels in
    /// parallel, each independently fault-tolerant.
    async fn notify_agent(
        &self,
        session: &Session,
        conversation_id: &str,
        agent: Option<&AgentProfile>,
        trigger: EscalationTrigger,
        summary: &str,
    ) {
        let urgency = trigger.urgency();
        if let Err(e) = self.db.append_event(
            &session.agent_id,
            "escalation_notification",
            &json!({
                "conversationId": conversation_id,
                "customerPhone": session.customer_id,
                "trigger": trigger.as_str(),
                "urgency": urgency.as_str(),
                "summary": summary,
            }),
        ) {
            tracing::error!(error = %e, "in-app escalation notification failed");
        }

        let Some(agent) = agent else {
            tracing::warn!(agent_id = %session.agent_id, "no agent profile, side channels skipped");
            return;
        };

        let whatsapp = async {
            if let Some(ref number) = agent.whatsapp_number {
                let text = format!(
                    "Escalation ({}): customer {} needs you.\n{}",
                    urgency.as_str(),
                    session.customer_id,
                    summary
                );
                if let Err(e) = self
                    .outbound
                    .dispatch(&OutboundMessage::text(number.clone(), text))
                    .await
                {
                    tracing::error!(agent = %agent.id, error = %e, "agent WhatsApp notification failed");
                }
            }
        };

        let email = async {
            if let Some(ref address) = agent.email {
                let subject = format!(
                    "[{}] Conversation escalated: {}",
                    urgency.as_str().to_uppercase(),
                    session.customer_id
                );
                if let Err(e) = self.email.send(address, &subject, summary).await {
                    tracing::error!(agent = %agent.id, error = %e, "agent email notification failed");
                }
            }
        };

        let sms = async {
            if agent.sms_enabled {
                if let Some(ref number) = agent.sms_number {
                    let text = format!("Escalation: customer {} waiting", session.customer_id);
                    if let Err(e) = self.sms.send(number, &text).await {
                        tracing::error!(agent = %agent.id, error = %e, "agent SMS notification failed");
                    }
                    if let Err(e) = self.db.append_event(
                        &session.agent_id,
                        "sms_notification_attempted",
                        &json!({ "conversationId": conversation_id, "to": number }),
                    ) {
                        tracing::error!(error = %e, "sms analytics append failed");
                    }
                }
            }
        };

        tokio::join!(whatsapp, email, sms);
    }

    async fn generate_summary(
        &self,
        session: &Session,
        trigger: EscalationTrigger,
    ) -> CoreResult<String> {
        let transcript: Vec<String> = session
            .message_history
            .iter()
            .filter_map(|m| {
                m.text_body().map(|text| {
                    let who = match m.role {
                        MessageRole::User => "Customer",
                        MessageRole::Assistant => "Assistant",
                        MessageRole::Agent => "Agent",
                    };
                    format!("{who}: {text}")
                })
            })
            .collect();

        let prompt = format!(
            "A conversation is being escalated to a human agent (trigger: {}).\n\n\
             Conversation:\n{}\n\nExtracted customer preferences:\n{}\n\n\
             Write a short bullet-style handoff overview for the agent: who the \
             customer is, what they want, their stated preferences, and why this \
             escalated. No preamble.",
            trigger.as_str(),
            transcript.join("\n"),
            serde_json::to_string_pretty(&session.extracted_info)?,
        );

        let completion = self
            .llm
            .generate(
                &[ChatMessage::user(prompt)],
                GenerationOptions {
                    temperature: Some(0.3),
                    max_tokens: Some(512),
                },
            )
            .await?;
        Ok(completion.text)
    }

    /// Hand the conversation back to the AI: WAITING_AGENT → ACTIVE, tell the
    /// customer, log the analytics event.
    pub async fn resume_ai_control(&self, conversation_id: &str) -> CoreResult<()> {
        let conversation = self.db.get_conversation(conversation_id)?;
        self.db.set_conversation_status(
            conversation_id,
            ConversationStatus::Active,
            &json!({ "resumedAt": chrono::Utc::now().to_rfc3339() }),
        )?;

        let mut session = self
            .sessions
            .get(&conversation.customer_phone, &conversation.agent_id)
            .await?;
        if session.state == SessionState::WaitingAgent {
            self.sessions.update_state(&mut session, SessionState::Active)?;
            self.sessions.update(&mut session).await?;
        }

        if let Err(e) = self
            .outbound
            .dispatch(&OutboundMessage::text(
                conversation.customer_phone.clone(),
                RESUME_NOTICE,
            ))
            .await
        {
            tracing::error!(customer = %conversation.customer_phone, error = %e, "resume notice failed");
        }

        if let Err(e) = self.db.append_event(
            &conversation.agent_id,
            "ai_control_resumed",
            &json!({ "conversationId": conversation_id }),
        ) {
            tracing::error!(error = %e, "ai_control_resumed analytics append failed");
        }
        Ok(())
    }
}

/// Deterministic fallback summary: extracted info + the last three messages.
fn basic_summary(session: &Session) -> String {
    let mut lines = vec![format!("- Customer: {}", session.customer_id)];
    let info = serde_json::to_value(&session.extracted_info).unwrap_or_default();
    if let Some(obj) = info.as_object() {
        for (key, value) in obj {
            if !value.is_null() {
                lines.push(format!("- {key}: {value}"));
            }
        }
    }
    lines.push("- Recent messages:".to_string());
    for message in session.message_history.iter().rev().take(3).rev() {
        if let Some(text) = message.text_body() {
            lines.push(format!("  - {text}"));
        }
    }
    lines.join("\n")
}

// ─── Tests ──────────────────────────────────────────────────────────────────
