//! Lead scoring and transition-gated notifications.
//!
//! `calculate_score` is a pure function over the session: six weighted
//! factors, each in [0,100], weights summing to 1.0. Quality tiers gate the
//! notification router: an unchanged quality between two consecutive
//! scorings emits nothing, which is what keeps agents from being spammed.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::db::CoreDatabase;
use crate::notify::EmailSender;
use crate::outbound::OutboundSender;
use crate::session::{MessageRole, Session};
use crate::types::{AgentProfile, Conversation, OutboundMessage};

// ─── Weights ────────────────────────────────────────────────────────────────

const WEIGHT_BUDGET: f64 = 0.25;
const WEIGHT_LOCATION: f64 = 0.20;
const WEIGHT_URGENCY: f64 = 0.20;
const WEIGHT_ENGAGEMENT: f64 = 0.15;
const WEIGHT_INFORMATION: f64 = 0.10;
const WEIGHT_PROPERTY_TYPE: f64 = 0.10;

/// All six factor weights; must sum to 1.0 ± 0.01.
pub const WEIGHTS: [f64; 6] = [
    WEIGHT_BUDGET,
    WEIGHT_LOCATION,
    WEIGHT_URGENCY,
    WEIGHT_ENGAGEMENT,
    WEIGHT_INFORMATION,
    WEIGHT_PROPERTY_TYPE,
];

// ─── Score model ────────────────────────────────────────────────────────────

/// Individual factor scores, each in [0,100].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FactorScores {
    pub budget_clarity: u32,
    pub location_specific: u32,
    pub urgency: u32,
    pub engagement: u32,
    pub information_provided: u32,
    pub property_type_clarity: u32,
}

/// Quality tier derived from the total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeadQuality {
    Cold,
    Warm,
    Hot,
}

impl LeadQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeadQuality::Cold => "cold",
            LeadQuality::Warm => "warm",
            LeadQuality::Hot => "hot",
        }
    }

    pub fn from_total(total: u32) -> LeadQuality {
        match total {
            0..=39 => LeadQuality::Cold,
            40..=69 => LeadQuality::Warm,
            _ => LeadQuality::Hot,
        }
    }
}

/// Full scoring result.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LeadScore {
    pub total: u32,
    pub factors: FactorScores,
    pub quality: LeadQuality,
}

// ─── Scoring ────────────────────────────────────────────────────────────────

/// Score the session. Pure: no I/O, no clock.
pub fn calculate_score(session: &Session) -> LeadScore {
    let factors = FactorScores {
        budget_clarity: budget_clarity(session),
        location_specific: location_specific(session),
        urgency: urgency(session),
        engagement: engagement(session),
        information_provided: information_provided(session),
        property_type_clarity: property_type_clarity(session),
    };

    let total = (factors.budget_clarity as f64 * WEIGHT_BUDGET
        + factors.location_specific as f64 * WEIGHT_LOCATION
        + factors.urgency as f64 * WEIGHT_URGENCY
        + factors.engagement as f64 * WEIGHT_ENGAGEMENT
        + factors.information_provided as f64 * WEIGHT_INFORMATION
        + factors.property_type_clarity as f64 * WEIGHT_PROPERTY_TYPE)
        .round()
        .clamp(0.0, 100.0) as u32;

    LeadScore {
        total,
        factors,
        quality: LeadQuality::from_total(total),
    }
}

fn budget_clarity(session: &Session) -> u32 {
    let info = &session.extracted_info;
    let has_range = info.min_price.is_some() || info.max_price.is_some();
    let mut score = if info.budget.is_some() && !has_range {
        80
    } else if info.budget.is_some() || has_range {
        40
    } else {
        0
    };
    if score > 0 && info.payment_method.is_some() {
        score += 20;
    }
    score.min(100)
}

fn location_specific(session: &Session) -> u32 {
    let info = &session.extracted_info;
    let named = info
        .location
        .as_deref()
        .unwrap_or("")
        .to_lowercase();
    // Compound or neighborhood naming is the top tier. The Arabic "حي" is
    // matched as a whole word so it can't fire inside longer words.
    if named.contains("compound")
        || named.contains("كمبوند")
        || named.contains("neighborhood")
        || named.contains("neighbourhood")
        || named.split_whitespace().any(|word| word == "حي")
    {
        return 100;
    }
    if info.district.is_some() {
        70
    } else if info.city.is_some() || info.location.is_some() {
        40
    } else {
        0
    }
}

const IMMEDIATE_HINTS: [&str; 7] = ["immediate", "now", "asap", "this week", "فورا", "حالا", "فوراً"];
const MONTHS_HINTS: [&str; 5] = ["month", "months", "شهر", "شهور", "أشهر"];
const SOON_HINTS: [&str; 4] = ["soon", "قريب", "قريبا", "قريباً"];

fn urgency(session: &Session) -> u32 {
    let info = &session.extracted_info;
    let text = format!(
        "{} {}",
        info.urgency.as_deref().unwrap_or(""),
        info.delivery_timeline.as_deref().unwrap_or("")
    )
    .to_lowercase();

    if text.trim().is_empty() {
        0
    } else if IMMEDIATE_HINTS.iter().any(|h| text.contains(h)) {
        100
    } else if MONTHS_HINTS.iter().any(|h| text.contains(h)) {
        70
    } else if SOON_HINTS.iter().any(|h| text.contains(h)) {
        50
    } else {
        30
    }
}

fn engagement(session: &Session) -> u32 {
    let user_messages: Vec<&str> = session
        .message_history
        .iter()
        .filter(|m| m.role == MessageRole::User)
        .filter_map(|m| m.text_body())
        .collect();

    let mut score = match user_messages.len() {
        0 => 0,
        1..=2 => 25,
        3..=5 => 50,
        6..=9 => 70,
        _ => 85,
    };

    let questions = user_messages
        .iter()
        .filter(|t| t.contains('?') || t.contains('؟'))
        .count();
    if questions >= 3 {
        score += 15;
    }
    score.min(100)
}

fn information_provided(session: &Session) -> u32 {
    match session.extracted_info.filled_count() {
        0 => 0,
        1..=2 => 30,
        3..=4 => 60,
        5..=6 => 80,
        _ => 100,
    }
}

fn property_type_clarity(session: &Session) -> u32 {
    let info = &session.extracted_info;
    let mut score = 0;
    if info.property_type.is_some() {
        score += 50;
    }
    if info.bedrooms.is_some() {
        score += 20;
    }
    if info.area.is_some() {
        score += 20;
    }
    if info.extra.contains_key("amenities") {
        score += 10;
    }
    score.min(100)
}

// ─── Notification router ────────────────────────────────────────────────────

/// What the router did; merged by the caller into the same conversation
/// update that sets the score (one atomic row write).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationOutcome {
    pub notified: bool,
    pub previous_quality: Option<String>,
    /// Metadata patch for the conversation row.
    pub metadata: serde_json::Value,
}

/// Routes quality transitions to the right channels.
pub struct LeadNotificationRouter {
    db: Arc<CoreDatabase>,
    email: Arc<dyn EmailSender>,
    outbound: Arc<dyn OutboundSender>,
}

impl LeadNotificationRouter {
    pub fn new(
        db: Arc<CoreDatabase>,
        email: Arc<dyn EmailSender>,
        outbound: Arc<dyn OutboundSender>,
    ) -> Self {
        LeadNotificationRouter {
            db,
            email,
            outbound,
        }
    }

    /// Route after scoring. Unchanged quality is a no-op.
    pub async fn route(
        &self,
        conversation: &Conversation,
        agent: Option<&AgentProfile>,
        score: &LeadScore,
    ) -> NotificationOutcome {
        let previous = conversation
            .metadata
            .get("previousQuality")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| conversation.lead_quality.clone());

        if previous.as_deref() == Some(score.quality.as_str()) {
            return NotificationOutcome {
                notified: false,
                previous_quality: previous,
                metadata: json!({}),
            };
        }

        let event_data = json!({
            "conversationId": conversation.id,
            "customerPhone": conversation.customer_phone,
            "score": score.total,
            "quality": score.quality.as_str(),
            "previousQuality": previous,
        });

        match score.quality {
            LeadQuality::Hot => {
                self.append_event(&conversation.agent_id, "hot_lead_identified", &event_data);
                self.notify_hot(conversation, agent, score).await;
                self.append_event(&conversation.agent_id, "hot_lead_notification", &event_data);
            }
            LeadQuality::Warm => {
                // Picked up by the digest job.
                self.append_event(&conversation.agent_id, "warm_lead_identified", &event_data);
            }
            LeadQuality::Cold => {
                // Feeds the nurture campaign.
                self.append_event(&conversation.agent_id, "cold_lead_identified", &event_data);
            }
        }

        NotificationOutcome {
            notified: true,
            previous_quality: previous.clone(),
            metadata: json!({
                "previousQuality": score.quality.as_str(),
                "lastNotification": {
                    "quality": score.quality.as_str(),
                    "from": previous,
                },
            }),
        }
    }

    /// Immediate multi-channel push for a hot lead. Channel failures are
    /// auxiliary: logged, never rethrown.
    async fn notify_hot(
        &self,
        conversation: &Conversation,
        agent: Option<&AgentProfile>,
        score: &LeadScore,
    ) {
        let Some(agent) = agent else {
            tracing::warn!(
                conversation = %conversation.id,
                "hot lead with no agent profile, in-app event only"
            );
            return;
        };

        let summary = format!(
            "Hot lead: {} (score {}). Budget: {}. Location: {}.",
            conversation.customer_phone,
            score.total,
            conversation
                .metadata
                .get("budget")
                .and_then(|v| v.as_f64())
                .map(|b| b.to_string())
                .unwrap_or_else(|| "n/a".into()),
            conversation
                .metadata
                .get("location")
                .and_then(|v| v.as_str())
                .unwrap_or("n/a"),
        );

        if let Some(ref number) = agent.whatsapp_number {
            if let Err(e) = self
                .outbound
                .dispatch(&OutboundMessage::text(number.clone(), summary.clone()))
                .await
            {
                tracing::error!(agent = %agent.id, error = %e, "hot lead WhatsApp notification failed");
            }
        }
        if let Some(ref email) = agent.email {
            if let Err(e) = self
                .email
                .send(email, "Hot lead identified", &summary)
                .await
            {
                tracing::error!(agent = %agent.id, error = %e, "hot lead email notification failed");
            }
        }
    }

    fn append_event(&self, agent_id: &str, event_type: &str, data: &serde_json::Value) {
        if let Err(e) = self.db.append_event(agent_id, event_type, data) {
            tracing::error!(agent_id, event_type, error = %e, "analytics append failed");
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::ExtractedInfo;
    use crate::session::SessionMessage;
    use crate::store::MemoryStore;

    fn session_with(info: ExtractedInfo, user_texts: &[&str]) -> Session {
        let store = crate::session::SessionStore::new(
            Arc::new(MemoryStore::new()),
            crate::config::SessionSettings::default(),
        );
        let mut session = tokio_test::block_on(store.get("+20100", "agent-1")).unwrap();
        session.extracted_info = info;
        for text in user_texts {
            session
                .message_history
                .push(SessionMessage::text(MessageRole::User, *text));
        }
        session
    }

    #[test]
    fn test_weights_sum_to_one() {
        let sum: f64 = WEIGHTS.iter().sum();
        assert!((sum - 1.0).abs() <= 0.01, "weights sum {sum}");
    }

    #[test]
    fn test_empty_session_is_cold() {
        let score = calculate_score(&session_with(ExtractedInfo::default(), &[]));
        assert_eq!(score.total, 0);
        assert_eq!(score.quality, LeadQuality::Cold);
    }

    #[test]
    fn test_budget_clarity_tiers() {
        let exact = ExtractedInfo {
            budget: Some(3_000_000.0),
            ..ExtractedInfo::default()
        };
        assert_eq!(budget_clarity(&session_with(exact, &[])), 80);

        let range = ExtractedInfo {
            min_price: Some(2_000_000.0),
            max_price: Some(3_000_000.0),
            budget: Some(3_000_000.0),
            ..ExtractedInfo::default()
        };
        assert_eq!(budget_clarity(&session_with(range, &[])), 40);

        let financed = ExtractedInfo {
            budget: Some(3_000_000.0),
            payment_method: Some("installments".into()),
            ..ExtractedInfo::default()
        };
        assert_eq!(budget_clarity(&session_with(financed, &[])), 100);
    }

    #[test]
    fn test_budget_clarity_at_least_40_for_stated_budget() {
        let info = ExtractedInfo {
            budget: Some(3_000_000.0),
            ..ExtractedInfo::default()
        };
        let score = calculate_score(&session_with(info, &[]));
        assert!(score.factors.budget_clarity >= 40);
    }

    #[test]
    fn test_location_tiers() {
        let city = ExtractedInfo {
            city: Some("Cairo".into()),
            ..ExtractedInfo::default()
        };
        assert_eq!(location_specific(&session_with(city, &[])), 40);

        let district = ExtractedInfo {
            city: Some("Cairo".into()),
            district: Some("Maadi".into()),
            ..ExtractedInfo::default()
        };
        assert_eq!(location_specific(&session_with(district, &[])), 70);

        let compound = ExtractedInfo {
            location: Some("Palm Hills compound".into()),
            ..ExtractedInfo::default()
        };
        assert_eq!(location_specific(&session_with(compound, &[])), 100);

        let neighborhood = ExtractedInfo {
            location: Some("quiet neighborhood near the club".into()),
            ..ExtractedInfo::default()
        };
        assert_eq!(location_specific(&session_with(neighborhood, &[])), 100);

        let neighborhood_ar = ExtractedInfo {
            location: Some("حي هادئ".into()),
            ..ExtractedInfo::default()
        };
        assert_eq!(location_specific(&session_with(neighborhood_ar, &[])), 100);

        // "حي" only counts as a whole word.
        let not_neighborhood = ExtractedInfo {
            city: Some("Cairo".into()),
            location: Some("ترحيب".into()),
            ..ExtractedInfo::default()
        };
        assert_eq!(location_specific(&session_with(not_neighborhood, &[])), 40);
    }

    #[test]
    fn test_urgency_keywords() {
        let immediate = ExtractedInfo {
            urgency: Some("immediate".into()),
            ..ExtractedInfo::default()
        };
        assert_eq!(urgency(&session_with(immediate, &[])), 100);

        let months = ExtractedInfo {
            delivery_timeline: Some("within 6 months".into()),
            ..ExtractedInfo::default()
        };
        assert_eq!(urgency(&session_with(months, &[])), 70);

        let vague = ExtractedInfo {
            urgency: Some("whenever".into()),
            ..ExtractedInfo::default()
        };
        assert_eq!(urgency(&session_with(vague, &[])), 30);
    }

    #[test]
    fn test_engagement_question_bonus() {
        let texts = ["ما السعر؟", "هل يوجد حديقة؟", "متى التسليم؟", "تمام", "حسنا", "اه"];
        let score = engagement(&session_with(ExtractedInfo::default(), &texts));
        assert_eq!(score, 70 + 15);
    }

    #[test]
    fn test_hot_lead_scenario() {
        // Exact budget, district, immediate urgency, bedrooms, 3+ questions
        // over six messages: must land hot.
        let info = ExtractedInfo {
            budget: Some(3_000_000.0),
            city: Some("Cairo".into()),
            district: Some("Fifth Settlement".into()),
            location: Some("Cairo, Fifth Settlement".into()),
            urgency: Some("immediate".into()),
            bedrooms: Some(3),
            ..ExtractedInfo::default()
        };
        let texts = [
            "I need an apartment?",
            "budget is 3,000,000",
            "Fifth Settlement please",
            "3 bedrooms?",
            "can I move in immediately?",
            "ok",
        ];
        let score = calculate_score(&session_with(info, &texts));
        assert!(score.total >= 70, "total {}", score.total);
        assert_eq!(score.quality, LeadQuality::Hot);
    }

    #[test]
    fn test_total_bounded() {
        let info = ExtractedInfo {
            budget: Some(3_000_000.0),
            payment_method: Some("cash".into()),
            location: Some("compound".into()),
            city: Some("Cairo".into()),
            district: Some("Maadi".into()),
            urgency: Some("now".into()),
            property_type: Some("villa".into()),
            bedrooms: Some(4),
            area: Some(300.0),
            bathrooms: Some(3),
            purpose: Some("residence".into()),
            customer_name: Some("Omar".into()),
            ..ExtractedInfo::default()
        };
        let texts = ["a?"; 12];
        let score = calculate_score(&session_with(info, &texts));
        assert!(score.total <= 100);
        assert_eq!(score.quality, LeadQuality::Hot);
    }
}
