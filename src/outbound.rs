//! Outbound WhatsApp delivery.
//!
//! Every send is gated by the distributed rate limiter: a closed gate fails
//! the job with a retryable error, an open gate increments the windows and
//! hands the message to the gateway. Gateway wire-format details stay inside
//! the `WhatsAppGateway` impl; the rest of the core only sees
//! `OutboundMessage`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::config::GatewaySettings;
use crate::error::{CoreError, CoreResult};
use crate::ratelimit::RateLimiter;
use crate::types::{OutboundBody, OutboundMessage};

// ─── Capabilities ───────────────────────────────────────────────────────────

/// Gateway seam: translate and deliver one message, returning the gateway
/// message id.
#[async_trait]
pub trait WhatsAppGateway: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> CoreResult<String>;
}

/// Rate-gated send capability used by the dispatcher, handoff, and lead
/// router.
#[async_trait]
pub trait OutboundSender: Send + Sync {
    async fn dispatch(&self, message: &OutboundMessage) -> CoreResult<String>;
}

// ─── Meta-style gateway ─────────────────────────────────────────────────────

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Meta Graph API gateway (`POST {api}/{phone_number_id}/messages`).
pub struct MetaGateway {
    http: reqwest::Client,
    settings: GatewaySettings,
}

impl MetaGateway {
    pub fn new(settings: GatewaySettings) -> CoreResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CoreError::infra(format!("failed to build HTTP client: {e}")))?;
        Ok(MetaGateway { http, settings })
    }

    /// Translate to the Graph API payload.
    fn wire_payload(message: &OutboundMessage) -> serde_json::Value {
        let mut payload = match &message.body {
            OutboundBody::Text { text } => json!({
                "messaging_product": "whatsapp",
                "to": message.to,
                "type": "text",
                "text": { "body": text },
            }),
            OutboundBody::Buttons { text, buttons } => json!({
                "messaging_product": "whatsapp",
                "to": message.to,
                "type": "interactive",
                "interactive": {
                    "type": "button",
                    "body": { "text": text },
                    "action": {
                        "buttons": buttons.iter().map(|b| json!({
                            "type": "reply",
                            "reply": { "id": b.id, "title": b.title },
                        })).collect::<Vec<_>>(),
                    },
                },
            }),
            OutboundBody::Location {
                latitude,
                longitude,
                name,
                address,
            } => json!({
                "messaging_product": "whatsapp",
                "to": message.to,
                "type": "location",
                "location": {
                    "latitude": latitude,
                    "longitude": longitude,
                    "name": name,
                    "address": address,
                },
            }),
        };
        // Idempotency key where the gateway supports it.
        if let Some(ref id) = message.client_message_id {
            payload["biz_opaque_callback_data"] = json!(id);
        }
        payload
    }
}

#[async_trait]
impl WhatsAppGateway for MetaGateway {
    async fn send(&self, message: &OutboundMessage) -> CoreResult<String> {
        let url = format!(
            "{}/{}/messages",
            self.settings.api_url, self.settings.phone_number_id
        );
        let payload = Self::wire_payload(message);

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.settings.access_token)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CoreError::infra(format!("gateway HTTP {status}: {body}")));
        }

        let body: serde_json::Value = response.json().await?;
        Ok(body["messages"][0]["id"]
            .as_str()
            .unwrap_or_default()
            .to_string())
    }
}

// ─── Rate-gated dispatcher ──────────────────────────────────────────────────

/// Gates every gateway send behind the sliding-window limiter.
pub struct OutboundDispatcher {
    limiter: RateLimiter,
    gateway: Arc<dyn WhatsAppGateway>,
    /// Limiter identifier: one quota per sending phone number.
    limit_id: String,
}

impl OutboundDispatcher {
    pub fn new(limiter: RateLimiter, gateway: Arc<dyn WhatsAppGateway>, limit_id: String) -> Self {
        OutboundDispatcher {
            limiter,
            gateway,
            limit_id,
        }
    }
}

#[async_trait]
impl OutboundSender for OutboundDispatcher {
    async fn dispatch(&self, message: &OutboundMessage) -> CoreResult<String> {
        let decision = self.limiter.check_limit(&self.limit_id).await;
        if !decision.allowed {
            tracing::warn!(
                to = %message.to,
                reset_in_ms = decision.reset_in_ms,
                limit = decision.limit,
                "outbound send rate limited"
            );
            return Err(CoreError::RateLimited {
                reset_in_ms: decision.reset_in_ms,
            });
        }

        self.limiter.increment(&self.limit_id).await;
        let gateway_id = self.gateway.send(message).await?;
        tracing::debug!(to = %message.to, gateway_id = %gateway_id, "outbound message delivered");
        Ok(gateway_id)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────


#[cfg(test)]
mod tests {
    use super::doubles::RecordingGateway;
    use super::*;
    use crate::config::RateLimitSettings;
    use crate::store::MemoryStore;

    fn dispatcher_with(
        settings: RateLimitSettings,
    ) -> (Arc<RecordingGateway>, OutboundDispatcher) {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(RecordingGateway::new());
        let dispatcher = OutboundDispatcher::new(
            RateLimiter::new(store, settings),
            gateway.clone(),
            "pn-1".to_string(),
        );
        (gateway, dispatcher)
    }

    #[tokio::test]
    async fn test_dispatch_sends_and_increments() {
        let (gateway, dispatcher) = dispatcher_with(RateLimitSettings::default());
        let id = dispatcher
            .dispatch(&OutboundMessage::text("+20100", "hello"))
            .await
            .unwrap();
        assert!(id.starts_with("wamid.out."));
        assert_eq!(gateway.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_closed_gate_is_retryable_error() {
        let settings = RateLimitSettings {
            max_per_second: 1,
            max_per_minute: 600,
            max_per_hour: 10_000,
        };
        let (gateway, dispatcher) = dispatcher_with(settings);

        dispatcher
            .dispatch(&OutboundMessage::text("+20100", "one"))
            .await
            .unwrap();
        let err = dispatcher
            .dispatch(&OutboundMessage::text("+20100", "two"))
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::RateLimited { .. }));
        assert!(err.is_retryable());
        assert_eq!(gateway.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_wire_payload_buttons() {
        let message = OutboundMessage {
            to: "+20100".into(),
            body: OutboundBody::Buttons {
                text: "Pick one".into(),
                buttons: vec![crate::types::CtaButton {
                    id: "schedule_viewing".into(),
                    title: "Schedule viewing".into(),
                }],
            },
            client_message_id: Some("wamid.reply.1".into()),
        };
        let payload = MetaGateway::wire_payload(&message);
        assert_eq!(payload["type"], "interactive");
        assert_eq!(
            payload["interactive"]["action"]["buttons"][0]["reply"]["id"],
            "schedule_viewing"
        );
        assert_eq!(payload["biz_opaque_callback_data"], "wamid.reply.1");
    }

    #[test]
    fn test_wire_payload_location() {
        let message = OutboundMessage {
            to: "+20100".into(),
            body: OutboundBody::Location {
                latitude: 30.02,
                longitude: 31.45,
                name: Some("Garden Apartment".into()),
                address: None,
            },
            client_message_id: None,
        };
        let payload = MetaGateway::wire_payload(&message);
        assert_eq!(payload["type"], "location");
        assert_eq!(payload["location"]["latitude"], 30.02);
    }
}
