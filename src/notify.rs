//! Notification channel capabilities.
//!
//! Email and SMS sit behind traits so escalation and lead routing can fan
//! out without caring about providers. The bundled SMS provider is
//! logged-only; a real provider slots in behind the same trait.

use async_trait::async_trait;

use crate::error::CoreResult;

// ─── Capabilities ───────────────────────────────────────────────────────────

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> CoreResult<()>;
}

#[async_trait]
pub trait SmsSender: Send + Sync {
    async fn send(&self, to: &str, body: &str) -> CoreResult<()>;
}

// ─── Logged-only providers ──────────────────────────────────────────────────

/// Email provider that only logs. Used when no SMTP relay is configured.
pub struct LoggingEmailSender;

#[async_trait]
impl EmailSender for LoggingEmailSender {
    async fn send(&self, to: &str, subject: &str, body: &str) -> CoreResult<()> {
        tracing::info!(to, subject, body_len = body.len(), "email notification (logged only)");
        Ok(())
    }
}

/// SMS provider that only logs delivery attempts.
pub struct LoggingSmsSender;

#[async_trait]
impl SmsSender for LoggingSmsSender {
    async fn send(&self, to: &str, body: &str) -> CoreResult<()> {
        tracing::info!(to, body_len = body.len(), "sms notification (logged only)");
        Ok(())
    }
}

// ─── Test doubles ───────────────────────────────────────────────────────────

#[cfg(test)]
pub mod doubles {
    use super::*;
    use std::sync::Mutex;

    /// Records every email; optionally fails.
    pub struct RecordingEmailSender {
        pub sent: Mutex<Vec<(String, String)>>,
        pub fail: bool,
    }

    impl RecordingEmailSender {
        pub fn new() -> Self {
            RecordingEmailSender {
                sent: Mutex::new(Vec::new()),
                fail: false,
            }
        }

        pub fn failing() -> Self {
            RecordingEmailSender {
                sent: Mutex::new(Vec::new()),
                fail: true,
            }
        }
    }

    #[async_trait]
    impl EmailSender for RecordingEmailSender {
        async fn send(&self, to: &str, subject: &str, _body: &str) -> CoreResult<()> {
            if self.fail {
                return Err(crate::error::CoreError::infra("smtp down"));
            }
            self.sent
                .lock()
                .unwrap()
                .push((to.to_string(), subject.to_string()));
            Ok(())
        }
    }

    /// Records every SMS.
    pub struct RecordingSmsSender {
        pub sent: Mutex<Vec<String>>,
    }

    impl RecordingSmsSender {
        pub fn new() -> Self {
            RecordingSmsSender {
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SmsSender for RecordingSmsSender {
        async fn send(&self, to: &str, _body: &str) -> CoreResult<()> {
            self.sent.lock().unwrap().push(to.to_string());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_logging_providers_always_succeed() {
        assert!(LoggingEmailSender
            .send("agent@example.com", "subject", "body")
            .await
            .is_ok());
        assert!(LoggingSmsSender.send("+20111", "body").await.is_ok());
    }
}
