//! Environment-driven settings.
//!
//! Every knob has a production default; unset variables never fail startup.
//! Values that parse badly fall back to the default with a warning so a typo
//! in a deployment manifest degrades instead of crashing the worker fleet.

use std::time::Duration;

// ─── Defaults ───────────────────────────────────────────────────────────────

const DEFAULT_SESSION_TIMEOUT_MINUTES: u64 = 30;
const DEFAULT_MAX_MESSAGE_HISTORY: usize = 20;
const DEFAULT_IDLE_CHECK_INTERVAL_MINUTES: u64 = 5;
const DEFAULT_QUEUE_CONCURRENCY: usize = 10;
const DEFAULT_JOBS_PER_SECOND: u32 = 10;
const DEFAULT_JOB_LOCK_SECS: u64 = 120;
const DEFAULT_STALLED_CHECK_SECS: u64 = 30;
const DEFAULT_MAX_STALLS: u32 = 2;

const DEFAULT_MAX_PER_SECOND: u32 = 80;
const DEFAULT_MAX_PER_MINUTE: u32 = 600;
const DEFAULT_MAX_PER_HOUR: u32 = 10_000;

const DEFAULT_LLM_MODEL: &str = "gpt-4o-mini";
const DEFAULT_LLM_MAX_TOKENS: u32 = 1024;
const DEFAULT_LLM_TEMPERATURE: f32 = 0.7;
const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
const DEFAULT_EMBEDDING_DIMENSIONS: usize = 1536;

// ─── Settings ───────────────────────────────────────────────────────────────

/// Session lifecycle knobs.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// TTL for the session blob and reverse index.
    pub timeout: Duration,
    /// Per-session message ring size; oldest entries evicted first.
    pub max_history: usize,
    /// Idle sweep period.
    pub idle_check_interval: Duration,
}

/// Worker pool and job queue knobs.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Number of concurrent workers.
    pub concurrency: usize,
    /// Per-second job rate cap across the pool.
    pub jobs_per_second: u32,
    /// Reservation lock; must exceed worst-case LLM latency.
    pub job_lock: Duration,
    /// How often abandoned reservations are scanned for.
    pub stalled_check_interval: Duration,
    /// Stall retries before a reservation is written off to the DLQ.
    pub max_stalls: u32,
}

/// Outbound rate-limit ceilings (sliding windows of 1s / 60s / 3600s).
#[derive(Debug, Clone, Copy)]
pub struct RateLimitSettings {
    pub max_per_second: u32,
    pub max_per_minute: u32,
    pub max_per_hour: u32,
}

/// LLM generation parameters.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Embedding backend parameters.
#[derive(Debug, Clone)]
pub struct EmbeddingSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub dimensions: usize,
}

/// WhatsApp gateway credentials (Meta-style Graph API).
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub api_url: String,
    pub access_token: String,
    pub phone_number_id: String,
}

/// Full service configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub redis_url: String,
    pub database_path: String,
    /// The tenant this worker processes messages for.
    pub agent_id: String,
    pub session: SessionSettings,
    pub queue: QueueSettings,
    pub rate_limit: RateLimitSettings,
    pub llm: LlmSettings,
    pub embedding: EmbeddingSettings,
    pub gateway: GatewaySettings,
}

impl Settings {
    /// Load settings from the process environment.
    pub fn from_env() -> Self {
        Settings {
            redis_url: env_string("REDIS_URL", "redis://127.0.0.1:6379"),
            database_path: env_string("DATABASE_PATH", "estateflow.db"),
            agent_id: env_string("AGENT_ID", "default"),
            session: SessionSettings {
                timeout: Duration::from_secs(
                    env_parse("SESSION_TIMEOUT_MINUTES", DEFAULT_SESSION_TIMEOUT_MINUTES) * 60,
                ),
                max_history: env_parse("MAX_MESSAGE_HISTORY", DEFAULT_MAX_MESSAGE_HISTORY),
                idle_check_interval: Duration::from_secs(
                    env_parse(
                        "IDLE_CHECK_INTERVAL_MINUTES",
                        DEFAULT_IDLE_CHECK_INTERVAL_MINUTES,
                    ) * 60,
                ),
            },
            queue: QueueSettings {
                concurrency: env_parse("QUEUE_CONCURRENCY", DEFAULT_QUEUE_CONCURRENCY),
                jobs_per_second: env_parse("QUEUE_JOBS_PER_SECOND", DEFAULT_JOBS_PER_SECOND),
                job_lock: Duration::from_secs(env_parse(
                    "QUEUE_JOB_LOCK_SECONDS",
                    DEFAULT_JOB_LOCK_SECS,
                )),
                stalled_check_interval: Duration::from_secs(env_parse(
                    "QUEUE_STALLED_CHECK_SECONDS",
                    DEFAULT_STALLED_CHECK_SECS,
                )),
                max_stalls: env_parse("QUEUE_MAX_STALLS", DEFAULT_MAX_STALLS),
            },
            rate_limit: RateLimitSettings {
                max_per_second: env_parse(
                    "WHATSAPP_MAX_MESSAGES_PER_SECOND",
                    DEFAULT_MAX_PER_SECOND,
                ),
                max_per_minute: env_parse(
                    "WHATSAPP_MAX_MESSAGES_PER_MINUTE",
                    DEFAULT_MAX_PER_MINUTE,
                ),
                max_per_hour: env_parse("WHATSAPP_MAX_MESSAGES_PER_HOUR", DEFAULT_MAX_PER_HOUR),
            },
            llm: LlmSettings {
                base_url: env_string("LLM_BASE_URL", "https://api.openai.com/v1"),
                api_key: std::env::var("LLM_API_KEY").ok(),
                model: env_string("LLM_MODEL", DEFAULT_LLM_MODEL),
                max_tokens: env_parse("LLM_MAX_TOKENS", DEFAULT_LLM_MAX_TOKENS),
                temperature: env_parse("LLM_TEMPERATURE", DEFAULT_LLM_TEMPERATURE),
            },
            embedding: EmbeddingSettings {
                base_url: env_string("EMBEDDING_BASE_URL", "https://api.openai.com/v1"),
                api_key: std::env::var("EMBEDDING_API_KEY")
                    .ok()
                    .or_else(|| std::env::var("LLM_API_KEY").ok()),
                model: env_string("EMBEDDING_MODEL", DEFAULT_EMBEDDING_MODEL),
                dimensions: env_parse("EMBEDDING_DIMENSIONS", DEFAULT_EMBEDDING_DIMENSIONS),
            },
            gateway: GatewaySettings {
                api_url: env_string("WHATSAPP_API_URL", "https://graph.facebook.com/v19.0"),
                access_token: env_string("WHATSAPP_ACCESS_TOKEN", ""),
                phone_number_id: env_string("WHATSAPP_PHONE_NUMBER_ID", ""),
            },
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionSettings {
            timeout: Duration::from_secs(DEFAULT_SESSION_TIMEOUT_MINUTES * 60),
            max_history: DEFAULT_MAX_MESSAGE_HISTORY,
            idle_check_interval: Duration::from_secs(DEFAULT_IDLE_CHECK_INTERVAL_MINUTES * 60),
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        QueueSettings {
            concurrency: DEFAULT_QUEUE_CONCURRENCY,
            jobs_per_second: DEFAULT_JOBS_PER_SECOND,
            job_lock: Duration::from_secs(DEFAULT_JOB_LOCK_SECS),
            stalled_check_interval: Duration::from_secs(DEFAULT_STALLED_CHECK_SECS),
            max_stalls: DEFAULT_MAX_STALLS,
        }
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        RateLimitSettings {
            max_per_second: DEFAULT_MAX_PER_SECOND,
            max_per_minute: DEFAULT_MAX_PER_MINUTE,
            max_per_hour: DEFAULT_MAX_PER_HOUR,
        }
    }
}

// ─── Env helpers ────────────────────────────────────────────────────────────

fn env_string(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

fn env_parse<T: std::str::FromStr + Copy + std::fmt::Display>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(key, raw = %raw, default = %default, "unparseable env var, using default");
                default
            }
        },
        Err(_) => default,
    }
}
