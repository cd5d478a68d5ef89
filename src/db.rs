//! Relational mirror: conversations, analytics events, agent profiles.
//!
//! Uses `rusqlite` in synchronous mode behind a mutex; every call is a
//! short row-scoped statement. WAL mode is enabled for concurrent reads.
//! Pass `":memory:"` for tests.
//!
//! The one multi-column atomic contract lives here: lead score, quality, and
//! notification metadata land in a single UPDATE.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::types::{
    merge_metadata, AgentProfile, AnalyticsEvent, Conversation, ConversationStatus,
};

// ─── Database ───────────────────────────────────────────────────────────────

/// SQLite handle for the relational mirror.
pub struct CoreDatabase {
    conn: Mutex<Connection>,
}

impl CoreDatabase {
    /// Open (or create) the database at `path`. `":memory:"` for tests.
    pub fn open(path: &str) -> CoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let db = CoreDatabase {
            conn: Mutex::new(conn),
        };
        db.create_tables()?;
        Ok(db)
    }

    fn create_tables(&self) -> CoreResult<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                customer_phone TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                lead_score INTEGER,
                lead_quality TEXT,
                metadata TEXT NOT NULL DEFAULT '{}'
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_conversations_phone
                ON conversations(agent_id, customer_phone);

            CREATE TABLE IF NOT EXISTS analytics_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                agent_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                event_data TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_events_agent
                ON analytics_events(agent_id, event_type);

            CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                whatsapp_number TEXT,
                email TEXT,
                sms_number TEXT,
                sms_enabled INTEGER NOT NULL DEFAULT 0
            );
            ",
        )?;
        Ok(())
    }

    fn lock(&self) -> CoreResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| CoreError::infra("database lock poisoned"))
    }

    // ─── Conversations ──────────────────────────────────────────────────

    /// Load the conversation for a customer, creating an ACTIVE row if none
    /// exists.
    pub fn upsert_conversation(
        &self,
        agent_id: &str,
        customer_phone: &str,
    ) -> CoreResult<Conversation> {
        if let Some(existing) = self.get_conversation_by_phone(agent_id, customer_phone)? {
            return Ok(existing);
        }
        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            customer_phone: customer_phone.to_string(),
            status: ConversationStatus::Active,
            created_at: now,
            updated_at: now,
            lead_score: None,
            lead_quality: None,
            metadata: serde_json::json!({}),
        };
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO conversations
                 (id, agent_id, customer_phone, status, created_at, updated_at, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, '{}')",
            params![
                conversation.id,
                agent_id,
                customer_phone,
                conversation.status.as_str(),
                now.to_rfc3339(),
                now.to_rfc3339(),
            ],
        )?;
        Ok(conversation)
    }

    pub fn get_conversation_by_phone(
        &self,
        agent_id: &str,
        customer_phone: &str,
    ) -> CoreResult<Option<Conversation>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT id, agent_id, customer_phone, status, created_at, updated_at,
                        lead_score, lead_quality, metadata
                 FROM conversations WHERE agent_id = ?1 AND customer_phone = ?2",
                params![agent_id, customer_phone],
                row_to_conversation,
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_conversation(&self, id: &str) -> CoreResult<Conversation> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, agent_id, customer_phone, status, created_at, updated_at,
                    lead_score, lead_quality, metadata
             FROM conversations WHERE id = ?1",
            params![id],
            row_to_conversation,
        )
        .optional()?
        .ok_or_else(|| CoreError::not_found("conversation", id))
    }

    /// Set status and merge a metadata patch in one UPDATE.
    pub fn set_conversation_status(
        &self,
        id: &str,
        status: ConversationStatus,
        metadata_patch: &serde_json::Value,
    ) -> CoreResult<()> {
        let conn = self.lock()?;
        let current: Option<String> = conn
            .query_row(
                "SELECT metadata FROM conversations WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(current) = current else {
            return Err(CoreError::not_found("conversation", id));
        };
        let base: serde_json::Value = serde_json::from_str(&current)?;
        let merged = merge_metadata(&base, metadata_patch);

        conn.execute(
            "UPDATE conversations SET status = ?2, metadata = ?3, updated_at = ?4
             WHERE id = ?1",
            params![
                id,
                status.as_str(),
                serde_json::to_string(&merged)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// The single atomic lead write: score + quality + metadata together.
    pub fn update_lead(
        &self,
        id: &str,
        score: u32,
        quality: &str,
        metadata_patch: &serde_json::Value,
    ) -> CoreResult<()> {
        let conn = self.lock()?;
        let current: Option<String> = conn
            .query_row(
                "SELECT metadata FROM conversations WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(current) = current else {
            return Err(CoreError::not_found("conversation", id));
        };
        let base: serde_json::Value = serde_json::from_str(&current)?;
        let merged = merge_metadata(&base, metadata_patch);

        conn.execute(
            "UPDATE conversations
             SET lead_score = ?2, lead_quality = ?3, metadata = ?4, updated_at = ?5
             WHERE id = ?1",
            params![
                id,
                score,
                quality,
                serde_json::to_string(&merged)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    // ─── Analytics ──────────────────────────────────────────────────────

    /// Append-only analytics event.
    pub fn append_event(
        &self,
        agent_id: &str,
        event_type: &str,
        event_data: &serde_json::Value,
    ) -> CoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO analytics_events (agent_id, event_type, event_data, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                agent_id,
                event_type,
                serde_json::to_string(event_data)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Events for an agent, optionally filtered by type, newest last.
    pub fn events(
        &self,
        agent_id: &str,
        event_type: Option<&str>,
    ) -> CoreResult<Vec<AnalyticsEvent>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT agent_id, event_type, event_data, created_at
             FROM analytics_events
             WHERE agent_id = ?1 AND (?2 IS NULL OR event_type = ?2)
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![agent_id, event_type], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (agent_id, event_type, data, created_at) = row?;
            events.push(AnalyticsEvent {
                agent_id,
                event_type,
                event_data: serde_json::from_str(&data)?,
                created_at: parse_ts(&created_at)?,
            });
        }
        Ok(events)
    }

    // ─── Agents ─────────────────────────────────────────────────────────

    pub fn upsert_agent(&self, agent: &AgentProfile) -> CoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO agents (id, name, whatsapp_number, email, sms_number, sms_enabled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                 name = ?2, whatsapp_number = ?3, email = ?4, sms_number = ?5, sms_enabled = ?6",
            params![
                agent.id,
                agent.name,
                agent.whatsapp_number,
                agent.email,
                agent.sms_number,
                agent.sms_enabled as i64,
            ],
        )?;
        Ok(())
    }

    pub fn get_agent(&self, id: &str) -> CoreResult<Option<AgentProfile>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT id, name, whatsapp_number, email, sms_number, sms_enabled
                 FROM agents WHERE id = ?1",
                params![id],
                |row| {
                    Ok(AgentProfile {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        whatsapp_number: row.get(2)?,
                        email: row.get(3)?,
                        sms_number: row.get(4)?,
                        sms_enabled: row.get::<_, i64>(5)? != 0,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }
}

// ─── Row mapping ────────────────────────────────────────────────────────────

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let status: String = row.get(3)?;
    let created: String = row.get(4)?;
    let updated: String = row.get(5)?;
    let metadata: String = row.get(8)?;
    Ok(Conversation {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        customer_phone: row.get(2)?,
        status: match status.as_str() {
            "WAITING_AGENT" => ConversationStatus::WaitingAgent,
            "CLOSED" => ConversationStatus::Closed,
            _ => ConversationStatus::Active,
        },
        created_at: DateTime::parse_from_rfc3339(&created)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        updated_at: DateTime::parse_from_rfc3339(&updated)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        lead_score: row.get(6)?,
        lead_quality: row.get(7)?,
        metadata: serde_json::from_str(&metadata).unwrap_or_else(|_| serde_json::json!({})),
    })
}

fn parse_ts(raw: &str) -> CoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| CoreError::Serialization {
            reason: format!("bad timestamp '{raw}': {e}"),
        })
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn db() -> CoreDatabase {
        CoreDatabase::open(":memory:").unwrap()
    }

    #[test]
    fn test_upsert_conversation_idempotent() {
        let db = db();
        let first = db.upsert_conversation("agent-1", "+20100").unwrap();
        let second = db.upsert_conversation("agent-1", "+20100").unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.status, ConversationStatus::Active);
    }

    #[test]
    fn test_update_lead_single_write_merges_metadata() {
        let db = db();
        let conv = db.upsert_conversation("agent-1", "+20100").unwrap();
        db.set_conversation_status(
            &conv.id,
            ConversationStatus::Active,
            &json!({"escalated": false}),
        )
        .unwrap();

        db.update_lead(
            &conv.id,
            77,
            "hot",
            &json!({"previousQuality": "warm", "leadScoreFactors": {"budgetClarity": 80}}),
        )
        .unwrap();

        let loaded = db.get_conversation(&conv.id).unwrap();
        assert_eq!(loaded.lead_score, Some(77));
        assert_eq!(loaded.lead_quality.as_deref(), Some("hot"));
        assert_eq!(loaded.metadata["previousQuality"], json!("warm"));
        // Earlier metadata keys survive the merge.
        assert_eq!(loaded.metadata["escalated"], json!(false));
    }

    #[test]
    fn test_status_transition_with_metadata() {
        let db = db();
        let conv = db.upsert_conversation("agent-1", "+20100").unwrap();
        db.set_conversation_status(
            &conv.id,
            ConversationStatus::WaitingAgent,
            &json!({"escalated": true}),
        )
        .unwrap();

        let loaded = db.get_conversation(&conv.id).unwrap();
        assert_eq!(loaded.status, ConversationStatus::WaitingAgent);
        assert_eq!(loaded.metadata["escalated"], json!(true));
    }

    #[test]
    fn test_events_append_only_and_filtered() {
        let db = db();
        db.append_event("agent-1", "hot_lead_identified", &json!({"score": 80}))
            .unwrap();
        db.append_event("agent-1", "warm_lead_identified", &json!({"score": 50}))
            .unwrap();
        db.append_event("agent-2", "hot_lead_identified", &json!({"score": 90}))
            .unwrap();

        let all = db.events("agent-1", None).unwrap();
        assert_eq!(all.len(), 2);

        let hot = db.events("agent-1", Some("hot_lead_identified")).unwrap();
        assert_eq!(hot.len(), 1);
        assert_eq!(hot[0].event_data["score"], json!(80));
    }

    #[test]
    fn test_agent_round_trip() {
        let db = db();
        let agent = AgentProfile {
            id: "agent-1".into(),
            name: "Sara".into(),
            whatsapp_number: Some("+20111".into()),
            email: Some("sara@example.com".into()),
            sms_number: None,
            sms_enabled: false,
        };
        db.upsert_agent(&agent).unwrap();
        let loaded = db.get_agent("agent-1").unwrap().unwrap();
        assert_eq!(loaded.name, "Sara");
        assert_eq!(loaded.whatsapp_number.as_deref(), Some("+20111"));
        assert!(db.get_agent("missing").unwrap().is_none());
    }

    #[test]
    fn test_missing_conversation_not_found() {
        let db = db();
        let err = db.get_conversation("nope").unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
    }

    #[test]
    fn test_reopen_preserves_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("core.db");
        let path = path.to_str().unwrap();

        let id = {
            let db = CoreDatabase::open(path).unwrap();
            db.upsert_conversation("agent-1", "+20100").unwrap().id
        };

        let db = CoreDatabase::open(path).unwrap();
        let loaded = db.get_conversation(&id).unwrap();
        assert_eq!(loaded.customer_phone, "+20100");
    }
}
