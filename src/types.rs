//! Shared domain types.
//!
//! The inbound types mirror the normalized record the gateway adapter must
//! deliver; the outbound types are gateway-agnostic and translated to the
//! wire format inside the adapter.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Inbound ────────────────────────────────────────────────────────────────

/// Normalized inbound message from the WhatsApp gateway adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedMessage {
    /// Unique, stable gateway message id. Doubles as the job id; duplicate
    /// deliveries collapse into one logical processing.
    pub message_id: String,
    /// E.164 customer phone.
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_name: Option<String>,
    /// ISO-8601 gateway timestamp.
    pub timestamp: String,
    pub content: MessageContent,
}

/// Tagged inbound message content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text { body: String },
    Media(MediaRef),
    Location(LocationRef),
    Interactive { button_payload: String },
}

/// Reference to a media object held by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaRef {
    pub media_id: String,
    /// Gateway media kind: image, video, document, audio.
    pub kind: MediaKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
    Document,
    Audio,
}

/// A shared location pin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationRef {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

// ─── Outbound ───────────────────────────────────────────────────────────────

/// Structured outbound send request; the gateway adapter owns the wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    /// E.164 destination phone.
    pub to: String,
    pub body: OutboundBody,
    /// Idempotency key forwarded to the gateway where supported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<String>,
}

/// Tagged outbound payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundBody {
    Text {
        text: String,
    },
    /// Text with up to three reply buttons (WhatsApp cap).
    Buttons {
        text: String,
        buttons: Vec<CtaButton>,
    },
    Location {
        latitude: f64,
        longitude: f64,
        name: Option<String>,
        address: Option<String>,
    },
}

/// A call-to-action reply button.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CtaButton {
    /// Stable payload id, e.g. `schedule_viewing`.
    pub id: String,
    /// Display title (bilingual where templates supply it).
    pub title: String,
}

impl OutboundMessage {
    /// Plain text message.
    pub fn text(to: impl Into<String>, text: impl Into<String>) -> Self {
        OutboundMessage {
            to: to.into(),
            body: OutboundBody::Text { text: text.into() },
            client_message_id: None,
        }
    }
}

// ─── Knowledge base ─────────────────────────────────────────────────────────

/// A property listing with its retrieval embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyDocument {
    pub id: String,
    pub agent_id: String,
    pub title: String,
    pub city: Option<String>,
    pub district: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub base_price: Option<f64>,
    pub price_per_meter: Option<f64>,
    pub currency: Option<String>,
    pub area: Option<f64>,
    pub bedrooms: Option<u32>,
    pub bathrooms: Option<u32>,
    pub floors: Option<u32>,
    pub property_type: Option<String>,
    #[serde(default)]
    pub amenities: Vec<String>,
    #[serde(default)]
    pub payment_plans: Vec<PaymentPlan>,
    pub delivery_date: Option<DateTime<Utc>>,
    pub description: Option<String>,
    #[serde(default)]
    pub media_urls: Vec<String>,
    /// Unit-norm retrieval vector, fixed dimension.
    #[serde(default)]
    pub embedding: Vec<f32>,
    /// The text the embedding was computed from.
    #[serde(default)]
    pub embedding_text: String,
}

/// An installment plan attached to a property.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPlan {
    pub down_payment_percentage: f64,
    pub installment_years: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monthly_payment: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Knowledge-base document kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Brochure,
    FloorPlan,
    Contract,
    Policy,
    Faq,
    Guide,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Brochure => "brochure",
            DocumentType::FloorPlan => "floor_plan",
            DocumentType::Contract => "contract",
            DocumentType::Policy => "policy",
            DocumentType::Faq => "faq",
            DocumentType::Guide => "guide",
        }
    }
}

/// A non-property knowledge document (policy, FAQ, brochure, …).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeDocument {
    pub id: String,
    pub agent_id: String,
    pub document_type: DocumentType,
    pub category: Option<String>,
    pub title: String,
    pub description: Option<String>,
    #[serde(default)]
    pub content_chunks: Vec<String>,
    #[serde(default)]
    pub embedding: Vec<f32>,
}

// ─── Relational mirror ──────────────────────────────────────────────────────

/// Conversation row status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationStatus {
    Active,
    WaitingAgent,
    Closed,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Active => "ACTIVE",
            ConversationStatus::WaitingAgent => "WAITING_AGENT",
            ConversationStatus::Closed => "CLOSED",
        }
    }
}

/// Relational mirror of a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub agent_id: String,
    pub customer_phone: String,
    pub status: ConversationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub lead_score: Option<u32>,
    pub lead_quality: Option<String>,
    /// Arbitrary JSON: `escalated`, `closeReason`, `lastNotification`,
    /// `previousQuality`, `leadScoreFactors`, …
    pub metadata: serde_json::Value,
}

/// Immutable append-only analytics event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsEvent {
    pub agent_id: String,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Human agent contact points used by escalation and lead notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentProfile {
    pub id: String,
    pub name: String,
    pub whatsapp_number: Option<String>,
    pub email: Option<String>,
    pub sms_number: Option<String>,
    pub sms_enabled: bool,
}

// ─── Helpers ────────────────────────────────────────────────────────────────

/// Merge `patch` into `base` at the top level, keeping unrelated keys.
///
/// Used for conversation metadata so routers and handoff never clobber each
/// other's keys.
pub fn merge_metadata(base: &serde_json::Value, patch: &serde_json::Value) -> serde_json::Value {
    let mut merged: BTreeMap<String, serde_json::Value> = match base.as_object() {
        Some(obj) => obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        None => BTreeMap::new(),
    };
    if let Some(obj) = patch.as_object() {
        for (k, v) in obj {
            merged.insert(k.clone(), v.clone());
        }
    }
    serde_json::to_value(merged).unwrap_or(serde_json::Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parsed_message_round_trip() {
        let raw = json!({
            "messageId": "wamid.1",
            "from": "+201001234567",
            "fromName": "Omar",
            "timestamp": "2026-01-05T10:00:00Z",
            "content": {"type": "text", "body": "مرحبا"}
        });
        let msg: ParsedMessage = serde_json::from_value(raw).unwrap();
        assert_eq!(msg.message_id, "wamid.1");
        match &msg.content {
            MessageContent::Text { body } => assert_eq!(body, "مرحبا"),
            other => panic!("expected text content, got {other:?}"),
        }
    }

    #[test]
    fn test_content_tagged_variants() {
        let loc: MessageContent = serde_json::from_value(json!({
            "type": "location", "latitude": 30.02, "longitude": 31.45
        }))
        .unwrap();
        assert!(matches!(loc, MessageContent::Location(_)));

        let media: MessageContent = serde_json::from_value(json!({
            "type": "media", "mediaId": "m-1", "kind": "image"
        }))
        .unwrap();
        assert!(matches!(media, MessageContent::Media(_)));
    }

    #[test]
    fn test_merge_metadata_keeps_unrelated_keys() {
        let base = json!({"escalated": true, "closeReason": null});
        let patch = json!({"previousQuality": "warm"});
        let merged = merge_metadata(&base, &patch);
        assert_eq!(merged["escalated"], json!(true));
        assert_eq!(merged["previousQuality"], json!("warm"));
    }

    #[test]
    fn test_document_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&DocumentType::FloorPlan).unwrap(),
            "\"floor_plan\""
        );
        assert_eq!(DocumentType::Faq.as_str(), "faq");
    }
}
