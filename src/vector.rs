//! Agent-scoped vector search.
//!
//! `VectorStore` is the k-NN capability: cosine-ranked search with a
//! similarity threshold, filtered by `agent_id` at the store level;
//! multi-tenant isolation is a correctness invariant, not a convenience.
//!
//! The bundled implementation is brute-force cosine over SQLite rows with
//! f32 little-endian blob embeddings. A per-agent property book is hundreds
//! to low thousands of rows; scanning that is cheaper than running a second
//! database. The trait is the seam for a server-backed index.

use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::embedding::cosine_similarity;
use crate::error::{CoreError, CoreResult};
use crate::types::{KnowledgeDocument, PropertyDocument};

// ─── Thresholds ─────────────────────────────────────────────────────────────

/// Default similarity floor for property search.
pub const PROPERTY_SIMILARITY_THRESHOLD: f32 = 0.7;

/// Default similarity floor for knowledge-document search. Deliberately lower:
/// document embeddings mix more general text than property listings.
pub const DOCUMENT_SIMILARITY_THRESHOLD: f32 = 0.2;

// ─── Capability ─────────────────────────────────────────────────────────────

/// A search hit with its cosine similarity.
#[derive(Debug, Clone)]
pub struct Scored<D> {
    pub document: D,
    pub similarity: f32,
}

/// Rows that can live in a vector index.
pub trait VectorRecord {
    fn id(&self) -> &str;
    fn agent_id(&self) -> &str;
    fn embedding(&self) -> &[f32];
}

impl VectorRecord for PropertyDocument {
    fn id(&self) -> &str {
        &self.id
    }
    fn agent_id(&self) -> &str {
        &self.agent_id
    }
    fn embedding(&self) -> &[f32] {
        &self.embedding
    }
}

impl VectorRecord for KnowledgeDocument {
    fn id(&self) -> &str {
        &self.id
    }
    fn agent_id(&self) -> &str {
        &self.agent_id
    }
    fn embedding(&self) -> &[f32] {
        &self.embedding
    }
}

/// Agent-scoped k-NN over one document collection.
#[async_trait]
pub trait VectorStore: Send + Sync {
    type Doc: VectorRecord;

    /// Top-`k` by descending cosine similarity; hits below `threshold` are
    /// excluded. Only rows belonging to `agent_id` are considered.
    async fn search(
        &self,
        query: &[f32],
        agent_id: &str,
        k: usize,
        threshold: f32,
    ) -> CoreResult<Vec<Scored<Self::Doc>>>;

    async fn upsert(&self, doc: &Self::Doc) -> CoreResult<()>;

    async fn delete(&self, id: &str, agent_id: &str) -> CoreResult<()>;
}

// ─── SQLite implementation ──────────────────────────────────────────────────

/// Brute-force cosine index over a SQLite table.
pub struct SqliteVectorIndex<D> {
    conn: Arc<Mutex<Connection>>,
    table: &'static str,
    _marker: PhantomData<fn() -> D>,
}

impl<D> SqliteVectorIndex<D> {
    /// Bind to (and bootstrap) the given table on a shared connection.
    pub fn open(conn: Arc<Mutex<Connection>>, table: &'static str) -> CoreResult<Self> {
        {
            let guard = conn.lock().map_err(|_| CoreError::infra("vector index lock poisoned"))?;
            guard.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id TEXT PRIMARY KEY,
                    agent_id TEXT NOT NULL,
                    doc TEXT NOT NULL,
                    embedding BLOB NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_{table}_agent ON {table}(agent_id);"
            ))?;
        }
        Ok(SqliteVectorIndex {
            conn,
            table,
            _marker: PhantomData,
        })
    }
}

/// Index bound to the property collection.
pub type PropertyIndex = SqliteVectorIndex<PropertyDocument>;

/// Index bound to the knowledge-document collection.
pub type DocumentIndex = SqliteVectorIndex<KnowledgeDocument>;

impl PropertyIndex {
    pub fn open_properties(conn: Arc<Mutex<Connection>>) -> CoreResult<Self> {
        Self::open(conn, "property_vectors")
    }
}

impl DocumentIndex {
    pub fn open_documents(conn: Arc<Mutex<Connection>>) -> CoreResult<Self> {
        Self::open(conn, "document_vectors")
    }
}

fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for x in embedding {
        bytes.extend_from_slice(&x.to_le_bytes());
    }
    bytes
}

fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[async_trait]
impl<D> VectorStore for SqliteVectorIndex<D>
where
    D: VectorRecord + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    type Doc = D;

    async fn search(
        &self,
        query: &[f32],
        agent_id: &str,
        k: usize,
        threshold: f32,
    ) -> CoreResult<Vec<Scored<D>>> {
        let guard = self
            .conn
            .lock()
            .map_err(|_| CoreError::infra("vector index lock poisoned"))?;
        let mut stmt = guard.prepare(&format!(
            "SELECT doc, embedding FROM {} WHERE agent_id = ?1",
            self.table
        ))?;

        let rows = stmt.query_map(params![agent_id], |row| {
            let doc: String = row.get(0)?;
            let blob: Vec<u8> = row.get(1)?;
            Ok((doc, blob))
        })?;

        let mut hits: Vec<Scored<D>> = Vec::new();
        for row in rows {
            let (doc_json, blob) = row?;
            let embedding = decode_embedding(&blob);
            let similarity = cosine_similarity(query, &embedding);
            if similarity < threshold {
                continue;
            }
            let document: D = serde_json::from_str(&doc_json)?;
            hits.push(Scored {
                document,
                similarity,
            });
        }

        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(k);
        Ok(hits)
    }

    async fn upsert(&self, doc: &D) -> CoreResult<()> {
        let doc_json = serde_json::to_string(doc)?;
        let blob = encode_embedding(doc.embedding());
        let guard = self
            .conn
            .lock()
            .map_err(|_| CoreError::infra("vector index lock poisoned"))?;
        guard.execute(
            &format!(
                "INSERT INTO {} (id, agent_id, doc, embedding) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET agent_id = ?2, doc = ?3, embedding = ?4",
                self.table
            ),
            params![doc.id(), doc.agent_id(), doc_json, blob],
        )?;
        Ok(())
    }

    async fn delete(&self, id: &str, agent_id: &str) -> CoreResult<()> {
        let guard = self
            .conn
            .lock()
            .map_err(|_| CoreError::infra("vector index lock poisoned"))?;
        guard.execute(
            &format!("DELETE FROM {} WHERE id = ?1 AND agent_id = ?2", self.table),
            params![id, agent_id],
        )?;
        Ok(())
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::l2_normalize;

    fn test_property(id: &str, agent_id: &str, embedding: Vec<f32>) -> PropertyDocument {
        PropertyDocument {
            id: id.into(),
            agent_id: agent_id.into(),
            title: format!("Property {id}"),
            city: Some("New Cairo".into()),
            district: None,
            latitude: None,
            longitude: None,
            base_price: Some(3_000_000.0),
            price_per_meter: None,
            currency: Some("EGP".into()),
            area: Some(140.0),
            bedrooms: Some(3),
            bathrooms: Some(2),
            floors: None,
            property_type: Some("apartment".into()),
            amenities: vec![],
            payment_plans: vec![],
            delivery_date: None,
            description: None,
            media_urls: vec![],
            embedding,
            embedding_text: String::new(),
        }
    }

    fn unit(mut v: Vec<f32>) -> Vec<f32> {
        l2_normalize(&mut v);
        v
    }

    fn memory_index() -> PropertyIndex {
        let conn = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
        PropertyIndex::open_properties(conn).unwrap()
    }

    #[tokio::test]
    async fn test_search_ranks_by_similarity() {
        let index = memory_index();
        index
            .upsert(&test_property("p1", "agent-1", unit(vec![1.0, 0.0, 0.0])))
            .await
            .unwrap();
        index
            .upsert(&test_property("p2", "agent-1", unit(vec![0.9, 0.1, 0.0])))
            .await
            .unwrap();
        index
            .upsert(&test_property("p3", "agent-1", unit(vec![0.0, 1.0, 0.0])))
            .await
            .unwrap();

        let hits = index
            .search(&unit(vec![1.0, 0.0, 0.0]), "agent-1", 10, 0.5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].document.id, "p1");
        assert!(hits[0].similarity >= hits[1].similarity);
    }

    #[tokio::test]
    async fn test_agent_isolation() {
        let index = memory_index();
        index
            .upsert(&test_property("p1", "agent-1", unit(vec![1.0, 0.0, 0.0])))
            .await
            .unwrap();
        index
            .upsert(&test_property("p2", "agent-2", unit(vec![1.0, 0.0, 0.0])))
            .await
            .unwrap();

        let hits = index
            .search(&unit(vec![1.0, 0.0, 0.0]), "agent-2", 10, 0.0)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document.id, "p2");
    }

    #[tokio::test]
    async fn test_threshold_excludes_weak_matches() {
        let index = memory_index();
        index
            .upsert(&test_property("p1", "agent-1", unit(vec![0.0, 1.0, 0.0])))
            .await
            .unwrap();
        let hits = index
            .search(&unit(vec![1.0, 0.0, 0.0]), "agent-1", 10, 0.7)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_upsert_replaces_row() {
        let index = memory_index();
        index
            .upsert(&test_property("p1", "agent-1", unit(vec![1.0, 0.0, 0.0])))
            .await
            .unwrap();
        let mut updated = test_property("p1", "agent-1", unit(vec![0.0, 0.0, 1.0]));
        updated.title = "Updated".into();
        index.upsert(&updated).await.unwrap();

        let hits = index
            .search(&unit(vec![0.0, 0.0, 1.0]), "agent-1", 10, 0.9)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document.title, "Updated");
    }

    #[tokio::test]
    async fn test_delete_scoped_by_agent() {
        let index = memory_index();
        index
            .upsert(&test_property("p1", "agent-1", unit(vec![1.0, 0.0, 0.0])))
            .await
            .unwrap();
        // Wrong agent: no-op.
        index.delete("p1", "agent-2").await.unwrap();
        assert_eq!(
            index
                .search(&unit(vec![1.0, 0.0, 0.0]), "agent-1", 10, 0.0)
                .await
                .unwrap()
                .len(),
            1
        );
        index.delete("p1", "agent-1").await.unwrap();
        assert!(index
            .search(&unit(vec![1.0, 0.0, 0.0]), "agent-1", 10, 0.0)
            .await
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_embedding_blob_round_trip() {
        let v = vec![0.25f32, -1.5, 3.75];
        assert_eq!(decode_embedding(&encode_embedding(&v)), v);
    }
}
