//! Intent classification and per-turn entity extraction.
//!
//! The LLM is asked for a strict JSON object. Its reply is scanned for the
//! first balanced `{…}` substring, parsed, and validated: numeric entities
//! are kept only if numeric, string entities are trimmed, enum-ish fields
//! are lowercased, and any intent outside the closed set is coerced to
//! `PROPERTY_INQUIRY`. On parse or backend failure a bilingual keyword
//! classifier answers at confidence 0.5 with no entities.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::entities::{validate, ExtractedInfo};
use crate::error::CoreResult;
use crate::llm::{ChatMessage, GenerationOptions, LlmClient};

// ─── Intent set ─────────────────────────────────────────────────────────────

/// Closed set of customer communicative goals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Intent {
    PropertyInquiry,
    PriceInquiry,
    PaymentPlans,
    LocationInfo,
    ScheduleViewing,
    Comparison,
    GeneralQuestion,
    Complaint,
    AgentRequest,
    Greeting,
    Goodbye,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::PropertyInquiry => "PROPERTY_INQUIRY",
            Intent::PriceInquiry => "PRICE_INQUIRY",
            Intent::PaymentPlans => "PAYMENT_PLANS",
            Intent::LocationInfo => "LOCATION_INFO",
            Intent::ScheduleViewing => "SCHEDULE_VIEWING",
            Intent::Comparison => "COMPARISON",
            Intent::GeneralQuestion => "GENERAL_QUESTION",
            Intent::Complaint => "COMPLAINT",
            Intent::AgentRequest => "AGENT_REQUEST",
            Intent::Greeting => "GREETING",
            Intent::Goodbye => "GOODBYE",
        }
    }

    /// Parse a model-produced tag; anything unknown coerces to
    /// `PROPERTY_INQUIRY`.
    pub fn from_tag(tag: &str) -> Intent {
        match tag.trim().to_uppercase().as_str() {
            "PROPERTY_INQUIRY" => Intent::PropertyInquiry,
            "PRICE_INQUIRY" => Intent::PriceInquiry,
            "PAYMENT_PLANS" => Intent::PaymentPlans,
            "LOCATION_INFO" => Intent::LocationInfo,
            "SCHEDULE_VIEWING" => Intent::ScheduleViewing,
            "COMPARISON" => Intent::Comparison,
            "GENERAL_QUESTION" => Intent::GeneralQuestion,
            "COMPLAINT" => Intent::Complaint,
            "AGENT_REQUEST" => Intent::AgentRequest,
            "GREETING" => Intent::Greeting,
            "GOODBYE" => Intent::Goodbye,
            _ => Intent::PropertyInquiry,
        }
    }

    /// Coarse conversation topic recorded on the session.
    pub fn topic(&self) -> &'static str {
        match self {
            Intent::PropertyInquiry | Intent::Comparison => "properties",
            Intent::PriceInquiry | Intent::PaymentPlans => "pricing",
            Intent::LocationInfo => "location",
            Intent::ScheduleViewing => "scheduling",
            Intent::Complaint | Intent::AgentRequest => "support",
            Intent::Greeting | Intent::Goodbye | Intent::GeneralQuestion => "general",
        }
    }
}

// ─── Language detection ─────────────────────────────────────────────────────

/// Detected customer language, used for template selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Ar,
    En,
    Mixed,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Ar => "ar",
            Language::En => "en",
            Language::Mixed => "mixed",
        }
    }
}

/// Classify by Arabic-letter share of the alphabetic characters.
pub fn detect_language(text: &str) -> Language {
    let mut arabic = 0usize;
    let mut latin = 0usize;
    for c in text.chars() {
        if ('\u{0600}'..='\u{06FF}').contains(&c) || ('\u{0750}'..='\u{077F}').contains(&c) {
            arabic += 1;
        } else if c.is_ascii_alphabetic() {
            latin += 1;
        }
    }
    let total = arabic + latin;
    if total == 0 {
        return Language::En;
    }
    let share = arabic as f32 / total as f32;
    if share > 0.8 {
        Language::Ar
    } else if share < 0.2 {
        Language::En
    } else {
        Language::Mixed
    }
}

// ─── Classification ─────────────────────────────────────────────────────────

/// Result of one classification turn.
#[derive(Debug, Clone)]
pub struct Classification {
    pub intent: Intent,
    pub entities: ExtractedInfo,
    pub confidence: f32,
    pub explanation: Option<String>,
}

const CLASSIFIER_SYSTEM_PROMPT: &str = r#"You are an intent classifier for a real-estate sales assistant serving Arabic and English speaking customers.

Classify the customer's message into exactly one intent:
PROPERTY_INQUIRY, PRICE_INQUIRY, PAYMENT_PLANS, LOCATION_INFO, SCHEDULE_VIEWING, COMPARISON, GENERAL_QUESTION, COMPLAINT, AGENT_REQUEST, GREETING, GOODBYE

Also extract any entities the customer states: budget, minPrice, maxPrice, location, city, district, propertyType, bedrooms, bathrooms, minArea, maxArea, deliveryTimeline, urgency, paymentMethod, downPaymentPercentage, installmentYears, purpose, customerName.

Respond with ONLY a JSON object, no prose:
{"intent": "...", "entities": {...}, "confidence": 0.0, "explanation": "..."}"#;

/// LLM-backed classifier with a rule-based fallback.
pub struct IntentClassifier {
    llm: Arc<dyn LlmClient>,
}

impl IntentClassifier {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        IntentClassifier { llm }
    }

    /// Classify `text`, optionally with the last few messages as context.
    ///
    /// Never fails: LLM or parse trouble degrades to the keyword fallback.
    pub async fn classify(&self, text: &str, context: &[&str]) -> CoreResult<Classification> {
        let user_prompt = if context.is_empty() {
            format!("Customer message: {text}")
        } else {
            format!(
                "Recent conversation:\n{}\n\nCustomer message: {text}",
                context.join("\n")
            )
        };

        let messages = [
            ChatMessage::system(CLASSIFIER_SYSTEM_PROMPT),
            ChatMessage::user(user_prompt),
        ];
        let options = GenerationOptions {
            temperature: Some(0.1),
            max_tokens: Some(512),
        };

        match self.llm.generate(&messages, options).await {
            Ok(completion) => match parse_classification(&completion.text) {
                Some(classification) => Ok(classification),
                None => {
                    tracing::warn!(
                        raw = %completion.text.chars().take(200).collect::<String>(),
                        "classifier output unparseable, using keyword fallback"
                    );
                    Ok(keyword_fallback(text))
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "classifier LLM call failed, using keyword fallback");
                Ok(keyword_fallback(text))
            }
        }
    }
}

// ─── Strict-JSON parsing ────────────────────────────────────────────────────

/// Extract the first balanced `{…}` substring, string-literal aware.
pub fn extract_first_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_classification(raw: &str) -> Option<Classification> {
    let json = extract_first_json(raw)?;
    let value: serde_json::Value = serde_json::from_str(json).ok()?;

    let intent = Intent::from_tag(value.get("intent")?.as_str()?);
    let entities = value
        .get("entities")
        .map(entities_from_value)
        .unwrap_or_default();
    let confidence = value
        .get("confidence")
        .and_then(|c| c.as_f64())
        .unwrap_or(0.5)
        .clamp(0.0, 1.0) as f32;
    let explanation = value
        .get("explanation")
        .and_then(|e| e.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    Some(Classification {
        intent,
        entities,
        confidence,
        explanation,
    })
}

fn number(v: &serde_json::Value) -> Option<f64> {
    v.as_f64()
}

fn small_count(v: &serde_json::Value) -> Option<u32> {
    v.as_u64().and_then(|n| u32::try_from(n).ok())
}

fn trimmed(v: &serde_json::Value) -> Option<String> {
    v.as_str()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn lowered(v: &serde_json::Value) -> Option<String> {
    trimmed(v).map(|s| s.to_lowercase())
}

/// Build a validated entity bag from the model's `entities` object.
///
/// Numeric fields are kept only if numeric; unknown keys ride along in the
/// open-world map.
pub fn entities_from_value(value: &serde_json::Value) -> ExtractedInfo {
    let Some(obj) = value.as_object() else {
        return ExtractedInfo::default();
    };

    let mut info = ExtractedInfo::default();
    for (key, v) in obj {
        match key.as_str() {
            "budget" => info.budget = number(v),
            "minPrice" => info.min_price = number(v),
            "maxPrice" => info.max_price = number(v),
            "location" => info.location = trimmed(v),
            "city" => info.city = trimmed(v),
            "district" => info.district = trimmed(v),
            "propertyType" => info.property_type = lowered(v),
            "bedrooms" => info.bedrooms = small_count(v),
            "bathrooms" => info.bathrooms = small_count(v),
            "area" => info.area = number(v),
            "minArea" => info.min_area = number(v),
            "maxArea" => info.max_area = number(v),
            "deliveryTimeline" => info.delivery_timeline = trimmed(v),
            "urgency" => info.urgency = lowered(v),
            "paymentMethod" => info.payment_method = lowered(v),
            "downPaymentPercentage" => info.down_payment_percentage = number(v),
            "installmentYears" => info.installment_years = small_count(v),
            "purpose" => info.purpose = lowered(v),
            "customerName" => info.customer_name = trimmed(v),
            _ => {
                if !v.is_null() {
                    info.extra.insert(key.clone(), v.clone());
                }
            }
        }
    }
    validate(&info)
}

// ─── Keyword fallback ───────────────────────────────────────────────────────

const FALLBACK_CONFIDENCE: f32 = 0.5;

/// Bilingual keyword classifier; best-effort intent, no entities.
pub fn keyword_fallback(text: &str) -> Classification {
    let lower = text.to_lowercase();
    let hit = |keywords: &[&str]| keywords.iter().any(|k| lower.contains(k));

    let intent = if hit(&[
        "agent", "human", "representative", "موظف", "مندوب", "بشر", "حد اكلمه", "حد أكلمه",
    ]) {
        Intent::AgentRequest
    } else if hit(&["complaint", "terrible", "awful", "شكوى", "سيء", "زفت", "مش راضي"]) {
        Intent::Complaint
    } else if hit(&["viewing", "visit", "schedule", "معاينة", "زيارة", "اشوف", "أشوف", "موعد"]) {
        Intent::ScheduleViewing
    } else if hit(&[
        "installment", "payment plan", "down payment", "قسط", "تقسيط", "أقساط", "اقساط", "مقدم",
    ]) {
        Intent::PaymentPlans
    } else if hit(&["price", "cost", "how much", "سعر", "السعر", "بكام", "التكلفة", "كام"]) {
        Intent::PriceInquiry
    } else if hit(&["compare", "difference", "versus", "مقارنة", "الفرق", "أفضل من", "افضل من"]) {
        Intent::Comparison
    } else if hit(&["where", "location", "address", "فين", "موقع", "العنوان", "مكان"]) {
        Intent::LocationInfo
    } else if hit(&[
        "apartment", "villa", "duplex", "property", "bedroom", "شقة", "فيلا", "دوبلكس", "عقار",
        "غرفة", "غرف",
    ]) {
        Intent::PropertyInquiry
    } else if hit(&["hello", "hi ", "hey", "مرحبا", "السلام عليكم", "اهلا", "أهلا", "صباح", "مساء"])
        || lower.trim() == "hi"
    {
        Intent::Greeting
    } else if hit(&["bye", "goodbye", "مع السلامة", "وداعا", "باي"]) {
        Intent::Goodbye
    } else {
        Intent::GeneralQuestion
    };

    Classification {
        intent,
        entities: ExtractedInfo::default(),
        confidence: FALLBACK_CONFIDENCE,
        explanation: Some("keyword fallback".to_string()),
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Scripted LLM double: pops canned replies, errors when exhausted.
    struct ScriptedLlm {
        replies: Mutex<Vec<String>>,
    }

    impl ScriptedLlm {
        fn with(replies: &[&str]) -> Arc<Self> {
            Arc::new(ScriptedLlm {
                replies: Mutex::new(replies.iter().rev().map(|s| s.to_string()).collect()),
            })
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn generate(
            &self,
            _messages: &[ChatMessage],
            _options: GenerationOptions,
        ) -> CoreResult<crate::llm::Completion> {
            match self.replies.lock().unwrap().pop() {
                Some(text) => Ok(crate::llm::Completion { text, usage: None }),
                None => Err(CoreError::Model {
                    reason: "script exhausted".into(),
                }),
            }
        }
    }

    #[tokio::test]
    async fn test_classify_parses_strict_json() {
        let llm = ScriptedLlm::with(&[
            r#"Sure! {"intent": "PRICE_INQUIRY", "entities": {"budget": 3000000, "location": " New Cairo "}, "confidence": 0.92, "explanation": "asks about price"}"#,
        ]);
        let classifier = IntentClassifier::new(llm);
        let result = classifier.classify("budget 3,000,000 EGP", &[]).await.unwrap();
        assert_eq!(result.intent, Intent::PriceInquiry);
        assert_eq!(result.entities.budget, Some(3_000_000.0));
        assert_eq!(result.entities.location.as_deref(), Some("New Cairo"));
        assert!((result.confidence - 0.92).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_unknown_intent_coerced() {
        let llm = ScriptedLlm::with(&[r#"{"intent": "BUY_NOW", "entities": {}, "confidence": 0.8}"#]);
        let classifier = IntentClassifier::new(llm);
        let result = classifier.classify("I want it", &[]).await.unwrap();
        assert_eq!(result.intent, Intent::PropertyInquiry);
    }

    #[tokio::test]
    async fn test_parse_failure_uses_fallback() {
        let llm = ScriptedLlm::with(&["I could not decide on an intent."]);
        let classifier = IntentClassifier::new(llm);
        let result = classifier.classify("بكام الشقة؟", &[]).await.unwrap();
        assert_eq!(result.intent, Intent::PriceInquiry);
        assert!((result.confidence - 0.5).abs() < 1e-6);
        assert_eq!(result.entities, ExtractedInfo::default());
    }

    #[tokio::test]
    async fn test_llm_error_uses_fallback() {
        let llm = ScriptedLlm::with(&[]);
        let classifier = IntentClassifier::new(llm);
        let result = classifier.classify("hello", &[]).await.unwrap();
        assert_eq!(result.intent, Intent::Greeting);
        assert!((result.confidence - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_extract_first_json_skips_prose_and_braces_in_strings() {
        let raw = r#"Here you go: {"intent": "GREETING", "explanation": "has a { brace }"} trailing"#;
        let json = extract_first_json(raw).unwrap();
        assert!(serde_json::from_str::<serde_json::Value>(json).is_ok());
    }

    #[test]
    fn test_entities_validation_rules() {
        let value = serde_json::json!({
            "budget": "three million",
            "bedrooms": 3,
            "propertyType": " Villa ",
            "urgency": "IMMEDIATE",
            "customerName": "  Omar ",
            "viewPreference": "garden"
        });
        let info = entities_from_value(&value);
        assert_eq!(info.budget, None);
        assert_eq!(info.bedrooms, Some(3));
        assert_eq!(info.property_type.as_deref(), Some("villa"));
        assert_eq!(info.urgency.as_deref(), Some("immediate"));
        assert_eq!(info.customer_name.as_deref(), Some("Omar"));
        assert!(info.extra.contains_key("viewPreference"));
    }

    #[test]
    fn test_keyword_fallback_bilingual() {
        assert_eq!(keyword_fallback("مرحبا").intent, Intent::Greeting);
        assert_eq!(keyword_fallback("عايز أكلم موظف").intent, Intent::AgentRequest);
        assert_eq!(keyword_fallback("what are the installment options").intent, Intent::PaymentPlans);
        assert_eq!(keyword_fallback("فين الموقع").intent, Intent::LocationInfo);
        assert_eq!(keyword_fallback("random text xyz").intent, Intent::GeneralQuestion);
    }

    #[test]
    fn test_language_detection() {
        assert_eq!(detect_language("مرحبا كيف حالك"), Language::Ar);
        assert_eq!(detect_language("hello there"), Language::En);
        assert_eq!(detect_language("hello يا باشا how are you؟"), Language::Mixed);
        assert_eq!(detect_language("12345"), Language::En);
    }

    #[test]
    fn test_intent_wire_names() {
        assert_eq!(
            serde_json::to_string(&Intent::AgentRequest).unwrap(),
            "\"AGENT_REQUEST\""
        );
        assert_eq!(Intent::from_tag("schedule_viewing"), Intent::ScheduleViewing);
    }
}
