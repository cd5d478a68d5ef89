//! Response post-processing.
//!
//! Turns raw LLM text into the rich outbound payload: template
//! short-circuits for intents that never need generation, bilingual price
//! rewriting, property cards (max three), CTA buttons (WhatsApp caps reply
//! buttons at three), an optional map pin, and the conservative
//! self-escalation cue.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::entities::ExtractedInfo;
use crate::intent::{Intent, Language};
use crate::types::{CtaButton, LocationRef, PropertyDocument};

// ─── Output ─────────────────────────────────────────────────────────────────

/// Structured property card attached to a reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyCard {
    pub property_id: String,
    pub title: String,
    pub price_display: Option<String>,
    pub location: Option<String>,
    pub bedrooms: Option<u32>,
    pub bathrooms: Option<u32>,
    pub area: Option<f64>,
    pub image_url: Option<String>,
}

/// The post-processed rich response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RichResponse {
    pub text: String,
    pub property_cards: Vec<PropertyCard>,
    pub buttons: Vec<CtaButton>,
    pub location: Option<LocationRef>,
    pub requires_escalation: bool,
    /// Which template short-circuited generation, if any.
    pub template_used: Option<String>,
}

/// Inputs the post-processor needs besides the LLM text.
pub struct ResponseContext<'a> {
    pub intent: Intent,
    pub properties: &'a [PropertyDocument],
    pub customer_name: Option<&'a str>,
    pub agent_name: Option<&'a str>,
    pub extracted_info: &'a ExtractedInfo,
    pub language: Language,
}

// ─── Caps ───────────────────────────────────────────────────────────────────

const MAX_CARDS: usize = 3;
const MAX_BUTTONS: usize = 3;

// ─── Processor ──────────────────────────────────────────────────────────────

pub struct ResponsePostProcessor;

impl ResponsePostProcessor {
    /// Run the full pipeline over the LLM text.
    pub fn process(llm_text: &str, ctx: &ResponseContext<'_>) -> RichResponse {
        let (text, template_used) = match template_for(ctx) {
            Some((name, text)) => (text, Some(name.to_string())),
            None => (rewrite_prices(llm_text), None),
        };

        let property_cards = ctx
            .properties
            .iter()
            .take(MAX_CARDS)
            .map(property_card)
            .collect();

        let mut buttons = buttons_for(ctx.intent, !ctx.properties.is_empty());
        buttons.truncate(MAX_BUTTONS);

        let location = location_pin(ctx);

        let requires_escalation = matches!(ctx.intent, Intent::AgentRequest | Intent::Complaint)
            || mentions_cannot_help(llm_text);

        RichResponse {
            text,
            property_cards,
            buttons,
            location,
            requires_escalation,
            template_used,
        }
    }
}

// ─── Templates ──────────────────────────────────────────────────────────────

fn template_for(ctx: &ResponseContext<'_>) -> Option<(&'static str, String)> {
    let name = ctx.customer_name.unwrap_or("").trim();
    let greeting_name = if name.is_empty() {
        String::new()
    } else {
        format!(" {name}")
    };

    match ctx.intent {
        Intent::Greeting => Some((
            "greeting",
            match ctx.language {
                Language::Ar => format!(
                    "مرحباً{greeting_name}! أنا مساعدك العقاري. كيف يمكنني مساعدتك اليوم؟\nHello{greeting_name}! I'm your real-estate assistant — how can I help you today?"
                ),
                Language::En => format!(
                    "Hello{greeting_name}! I'm your real-estate assistant — how can I help you today?\nمرحباً{greeting_name}! أنا مساعدك العقاري."
                ),
                Language::Mixed => format!(
                    "مرحباً{greeting_name}! Hello! I'm your real-estate assistant — كيف يمكنني مساعدتك اليوم؟"
                ),
            },
        )),
        Intent::Goodbye => Some((
            "goodbye",
            match ctx.language {
                Language::Ar => "شكراً لتواصلك معنا! نتمنى لك يوماً سعيداً.\nThank you for reaching out — have a great day!".to_string(),
                _ => "Thank you for reaching out — have a great day!\nشكراً لتواصلك معنا!".to_string(),
            },
        )),
        Intent::AgentRequest => {
            // Name the assigned agent when we know who is taking over.
            let agent = ctx.agent_name.unwrap_or("").trim();
            let who_en = if agent.is_empty() {
                "one of our agents".to_string()
            } else {
                agent.to_string()
            };
            let who_ar = if agent.is_empty() {
                "أحد موظفينا".to_string()
            } else {
                agent.to_string()
            };
            Some((
                "agent_request",
                match ctx.language {
                    Language::Ar => format!(
                        "جاري تحويلك إلى {who_ar}، سيتواصل معك في أقرب وقت.\nTransferring you to {who_en} — they will be with you shortly."
                    ),
                    _ => format!(
                        "Transferring you to {who_en} — they will be with you shortly.\nجاري تحويلك إلى {who_ar}."
                    ),
                },
            ))
        }
        Intent::PropertyInquiry if ctx.properties.is_empty() => Some((
            "no_results",
            match ctx.language {
                Language::Ar => "عذراً، لم أجد عقارات مطابقة لطلبك حالياً. هل تود تعديل ميزانيتك أو المنطقة المفضلة؟\nSorry, I couldn't find matching properties right now — would you like to adjust your budget or preferred area?".to_string(),
                _ => "Sorry, I couldn't find matching properties right now — would you like to adjust your budget or preferred area?\nعذراً، لم أجد عقارات مطابقة لطلبك حالياً.".to_string(),
            },
        )),
        _ => None,
    }
}

// ─── Price rewriting ────────────────────────────────────────────────────────

/// Format with thousands separators, English digits: `3,000,000`.
pub fn group_digits_en(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Format with Arabic-Indic digits and the Arabic thousands separator:
/// `٣،٠٠٠،٠٠٠`.
pub fn group_digits_ar(n: u64) -> String {
    group_digits_en(n)
        .chars()
        .map(|c| match c {
            '0'..='9' => char::from_u32('\u{0660}' as u32 + (c as u32 - '0' as u32)).unwrap_or(c),
            ',' => '،',
            other => other,
        })
        .collect()
}

/// Bilingual price rendering: `3,000,000 EGP (٣،٠٠٠،٠٠٠ جنيه)`.
pub fn format_price_bilingual(amount: u64) -> String {
    format!("{} EGP ({} جنيه)", group_digits_en(amount), group_digits_ar(amount))
}

fn price_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)([0-9][0-9,]{2,})\s*(egp\b|le\b|l\.e\.|pounds?\b|جنيه|جنية)").unwrap()
    })
}

/// Rewrite any 4+-digit amount carrying a currency hint into the bilingual
/// grouped form. Smaller numbers (years, floor counts) pass through.
pub fn rewrite_prices(text: &str) -> String {
    price_pattern()
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let digits: String = caps[1].chars().filter(|c| c.is_ascii_digit()).collect();
            if digits.len() < 4 {
                return caps[0].to_string();
            }
            match digits.parse::<u64>() {
                Ok(amount) => format_price_bilingual(amount),
                Err(_) => caps[0].to_string(),
            }
        })
        .into_owned()
}

// ─── Cards, buttons, pin ────────────────────────────────────────────────────

fn property_card(property: &PropertyDocument) -> PropertyCard {
    let location = match (&property.city, &property.district) {
        (Some(city), Some(district)) => Some(format!("{city}, {district}")),
        (Some(city), None) => Some(city.clone()),
        (None, Some(district)) => Some(district.clone()),
        (None, None) => None,
    };
    PropertyCard {
        property_id: property.id.clone(),
        title: property.title.clone(),
        price_display: property
            .base_price
            .filter(|p| *p >= 0.0)
            .map(|p| format_price_bilingual(p.round() as u64)),
        location,
        bedrooms: property.bedrooms,
        bathrooms: property.bathrooms,
        area: property.area,
        image_url: property.media_urls.first().cloned(),
    }
}

fn button(id: &str, title: &str) -> CtaButton {
    CtaButton {
        id: id.to_string(),
        title: title.to_string(),
    }
}

fn buttons_for(intent: Intent, has_properties: bool) -> Vec<CtaButton> {
    match intent {
        Intent::PropertyInquiry | Intent::Comparison => vec![
            button("schedule_viewing", "حجز معاينة / Schedule viewing"),
            button("talk_to_agent", "التحدث مع موظف / Talk to agent"),
        ],
        Intent::PriceInquiry => vec![
            button("payment_plans", "خطط السداد / Payment plans"),
            button("talk_to_agent", "التحدث مع موظف / Talk to agent"),
        ],
        Intent::PaymentPlans => vec![
            button("calculate_payment", "حساب القسط / Calculate payment"),
            button("talk_to_agent", "التحدث مع موظف / Talk to agent"),
        ],
        Intent::LocationInfo if has_properties => vec![
            button("view_map", "عرض الخريطة / View map"),
            button("schedule_viewing", "حجز معاينة / Schedule viewing"),
        ],
        Intent::ScheduleViewing => vec![
            button("confirm_viewing", "تأكيد الموعد / Confirm viewing"),
            button("talk_to_agent", "التحدث مع موظف / Talk to agent"),
        ],
        _ => Vec::new(),
    }
}

fn location_pin(ctx: &ResponseContext<'_>) -> Option<LocationRef> {
    if ctx.intent != Intent::LocationInfo {
        return None;
    }
    let top = ctx.properties.first()?;
    let (lat, lon) = (top.latitude?, top.longitude?);
    Some(LocationRef {
        latitude: lat,
        longitude: lon,
        name: Some(top.title.clone()),
        address: match (&top.city, &top.district) {
            (Some(city), Some(district)) => Some(format!("{district}, {city}")),
            (Some(city), None) => Some(city.clone()),
            _ => None,
        },
    })
}

// ─── Escalation cue ─────────────────────────────────────────────────────────

/// Conservative bilingual "I cannot help" phrase list. Merely mentioning an
/// agent as an option must not trigger.
const CANNOT_HELP_PHRASES: [&str; 8] = [
    "i cannot help",
    "i can't help",
    "i am unable to help",
    "i'm unable to help",
    "cannot assist you",
    "لا أستطيع المساعدة",
    "لا استطيع المساعدة",
    "لا يمكنني مساعدتك",
];

fn mentions_cannot_help(text: &str) -> bool {
    let lower = text.to_lowercase();
    CANNOT_HELP_PHRASES.iter().any(|p| lower.contains(p))
}

// ─── Tests ──────────────────────────────────────────────────────────────────
