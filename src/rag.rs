//! Retrieval-augmented generation.
//!
//! Fuses property and knowledge-document search into one context string for
//! the LLM. Source selection is explicit or keyword-auto-detected; a failure
//! in one source never aborts the other. Ingestion chunks long text, embeds
//! each chunk, and collapses multi-chunk properties into one
//! similarity-preserving unit vector (component average, then L2
//! normalization; without the normalization cosine ranking degrades).

use std::sync::Arc;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

use crate::chunker::TextChunker;
use crate::embedding::{mean_unit_vector, EmbeddingClient};
use crate::entities::SearchFilters;
use crate::error::{CoreError, CoreResult};
use crate::postprocess::format_price_bilingual;
use crate::types::{KnowledgeDocument, PropertyDocument};
use crate::vector::{
    Scored, VectorStore, DOCUMENT_SIMILARITY_THRESHOLD, PROPERTY_SIMILARITY_THRESHOLD,
};

// ─── Options ────────────────────────────────────────────────────────────────

/// Which collections to consult.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetrievalSource {
    Properties,
    Documents,
    Both,
}

/// Per-call retrieval options.
#[derive(Debug, Clone, Default)]
pub struct RetrievalOptions {
    /// Forced source; auto-detected from the query when unset.
    pub source: Option<RetrievalSource>,
    /// Top-k per source (default 5).
    pub k: Option<usize>,
    /// Post-hoc metadata filters applied to property hits.
    pub filters: SearchFilters,
}

const DEFAULT_K: usize = 5;

/// Maximum characters taken from a document's chunks for the context string.
const DOCUMENT_SNIPPET_BUDGET: usize = 1_000;

/// Retrieval output: raw hits plus the formatted context string.
#[derive(Debug, Default)]
pub struct RetrievedContext {
    pub properties: Vec<Scored<PropertyDocument>>,
    pub documents: Vec<Scored<KnowledgeDocument>>,
    pub combined_context: String,
    pub sources: Vec<&'static str>,
}

// ─── Source auto-detection ──────────────────────────────────────────────────

const PROPERTY_HINTS: [&str; 16] = [
    "buy", "rent", "lease", "price", "bedroom", "apartment", "villa", "duplex", "compound",
    "شقة", "فيلا", "سعر", "ايجار", "إيجار", "شراء", "غرف",
];

const DOCUMENT_HINTS: [&str; 14] = [
    "how", "what", "policy", "contract", "procedure", "paperwork", "brochure", "refund",
    "كيف", "ما هي", "سياسة", "عقد", "اجراءات", "إجراءات",
];

/// Keyword heuristic: lease/buy/price words pull properties, how/what/policy
/// words pull documents, ambiguity pulls both.
pub fn detect_source(query: &str) -> RetrievalSource {
    let lower = query.to_lowercase();
    let property = PROPERTY_HINTS.iter().any(|h| lower.contains(h));
    let document = DOCUMENT_HINTS.iter().any(|h| lower.contains(h));
    match (property, document) {
        (true, false) => RetrievalSource::Properties,
        (false, true) => RetrievalSource::Documents,
        _ => RetrievalSource::Both,
    }
}

// ─── Retriever ──────────────────────────────────────────────────────────────

pub struct RagRetriever {
    embeddings: Arc<dyn EmbeddingClient>,
    properties: Arc<dyn VectorStore<Doc = PropertyDocument>>,
    documents: Arc<dyn VectorStore<Doc = KnowledgeDocument>>,
    chunker: TextChunker,
}

impl RagRetriever {
    pub fn new(
        embeddings: Arc<dyn EmbeddingClient>,
        properties: Arc<dyn VectorStore<Doc = PropertyDocument>>,
        documents: Arc<dyn VectorStore<Doc = KnowledgeDocument>>,
    ) -> Self {
        RagRetriever {
            embeddings,
            properties,
            documents,
            chunker: TextChunker::default(),
        }
    }

    /// Retrieve and format context for `query`, scoped to `agent_id`.
    pub async fn retrieve_context(
        &self,
        query: &str,
        agent_id: &str,
        options: &RetrievalOptions,
    ) -> CoreResult<RetrievedContext> {
        let source = options.source.unwrap_or_else(|| detect_source(query));
        let k = options.k.unwrap_or(DEFAULT_K);
        let query_vector = self.embeddings.embed(query).await?;
        if query_vector.is_empty() {
            return Ok(RetrievedContext::default());
        }

        let mut result = RetrievedContext::default();

        if matches!(source, RetrievalSource::Properties | RetrievalSource::Both) {
            match self
                .properties
                .search(&query_vector, agent_id, k, PROPERTY_SIMILARITY_THRESHOLD)
                .await
            {
                Ok(hits) => {
                    result.properties = hits
                        .into_iter()
                        .filter(|hit| property_passes(&hit.document, &options.filters))
                        .collect();
                    result.sources.push("properties");
                }
                Err(e) => {
                    // One source failing must not starve the other.
                    tracing::error!(agent_id, error = %e, "property search failed");
                }
            }
        }

        if matches!(source, RetrievalSource::Documents | RetrievalSource::Both) {
            match self
                .documents
                .search(&query_vector, agent_id, k, DOCUMENT_SIMILARITY_THRESHOLD)
                .await
            {
                Ok(hits) => {
                    result.documents = hits;
                    result.sources.push("documents");
                }
                Err(e) => {
                    tracing::error!(agent_id, error = %e, "document search failed");
                }
            }
        }

        result.combined_context = format_context(&result.properties, &result.documents);
        Ok(result)
    }

    /// Return `system_prompt` with retrieved context and the grounding
    /// instruction block appended.
    pub async fn augment_prompt(
        &self,
        system_prompt: &str,
        query: &str,
        agent_id: &str,
        options: &RetrievalOptions,
    ) -> CoreResult<String> {
        let context = self.retrieve_context(query, agent_id, options).await?;
        Ok(apply_context(system_prompt, &context.combined_context))
    }

    // ─── Ingestion ──────────────────────────────────────────────────────

    /// Embed and store a property listing.
    ///
    /// Long descriptions are chunked; multiple chunk vectors collapse into
    /// one unit vector via component averaging + normalization.
    pub async fn ingest_property(&self, mut property: PropertyDocument) -> CoreResult<PropertyDocument> {
        let text = property_embedding_text(&property);
        let chunks = self.chunker.chunk(&text);
        if chunks.is_empty() {
            return Err(CoreError::Validation {
                reason: format!("property '{}' has no embeddable text", property.id),
            });
        }

        let vectors = self.embeddings.embed_batch(&chunks).await?;
        let embedding = if vectors.len() == 1 {
            vectors.into_iter().next().unwrap_or_default()
        } else {
            mean_unit_vector(&vectors).ok_or_else(|| CoreError::Model {
                reason: "embedding backend returned no vectors".into(),
            })?
        };

        property.embedding = embedding;
        property.embedding_text = text;
        self.properties.upsert(&property).await?;
        Ok(property)
    }

    /// Embed and store a knowledge document (same aggregation rule).
    pub async fn ingest_document(&self, mut document: KnowledgeDocument) -> CoreResult<KnowledgeDocument> {
        let joined = document_embedding_text(&document);
        let chunks = self.chunker.chunk(&joined);
        if chunks.is_empty() {
            return Err(CoreError::Validation {
                reason: format!("document '{}' has no embeddable text", document.id),
            });
        }

        let vectors = self.embeddings.embed_batch(&chunks).await?;
        let embedding = if vectors.len() == 1 {
            vectors.into_iter().next().unwrap_or_default()
        } else {
            mean_unit_vector(&vectors).ok_or_else(|| CoreError::Model {
                reason: "embedding backend returned no vectors".into(),
            })?
        };

        document.embedding = embedding;
        self.documents.upsert(&document).await?;
        Ok(document)
    }
}

/// Append `combined_context` and the grounding instruction block to a prompt.
///
/// The one place the instruction text lives; `augment_prompt` and the
/// dispatcher's prompt builder both go through it.
pub fn apply_context(system_prompt: &str, combined_context: &str) -> String {
    if combined_context.is_empty() {
        return system_prompt.to_string();
    }
    format!(
        "{system_prompt}\n\n{combined_context}\n\nWhen answering, prefer the retrieved \
         context above. If the context does not cover the question, say so plainly \
         instead of guessing, and offer to connect the customer with an agent for \
         specifics."
    )
}

// ─── Metadata filters ───────────────────────────────────────────────────────

fn property_passes(property: &PropertyDocument, filters: &SearchFilters) -> bool {
    if let (Some(max), Some(price)) = (filters.max_price, property.base_price) {
        if price > max {
            return false;
        }
    }
    if let (Some(min), Some(price)) = (filters.min_price, property.base_price) {
        if price < min {
            return false;
        }
    }
    if let Some(wanted) = filters.bedrooms {
        if property.bedrooms.map(|b| b < wanted).unwrap_or(true) {
            return false;
        }
    }
    if let Some(ref kind) = filters.property_type {
        match property.property_type {
            Some(ref actual) if actual.eq_ignore_ascii_case(kind) => {}
            _ => return false,
        }
    }
    if let Some(ref location) = filters.location {
        let needle = location.to_lowercase();
        let hay = [
            property.city.as_deref(),
            property.district.as_deref(),
            Some(property.title.as_str()),
        ];
        let matched = hay.iter().flatten().any(|field| {
            let field = field.to_lowercase();
            field.contains(&needle) || needle.contains(&field)
        });
        if !matched {
            return false;
        }
    }
    if let (Some(min), Some(area)) = (filters.min_area, property.area) {
        if area < min {
            return false;
        }
    }
    if let (Some(max), Some(area)) = (filters.max_area, property.area) {
        if area > max {
            return false;
        }
    }
    true
}

// ─── Context formatting ─────────────────────────────────────────────────────

fn format_context(
    properties: &[Scored<PropertyDocument>],
    documents: &[Scored<KnowledgeDocument>],
) -> String {
    let mut sections: Vec<String> = Vec::new();

    if !documents.is_empty() {
        let mut section = String::from("KNOWLEDGE BASE:\n");
        for (i, hit) in documents.iter().enumerate() {
            section.push_str(&format_document(i + 1, &hit.document));
        }
        sections.push(section);
    }

    if !properties.is_empty() {
        let mut section = String::from("AVAILABLE PROPERTIES:\n");
        for (i, hit) in properties.iter().enumerate() {
            section.push_str(&format_property(i + 1, &hit.document));
        }
        sections.push(section);
    }

    sections.join("\n")
}

fn format_property(index: usize, p: &PropertyDocument) -> String {
    let mut lines = vec![format!("{index}. {}", p.title)];

    if let Some(ref kind) = p.property_type {
        lines.push(format!("   Type: {kind}"));
    }
    match (&p.city, &p.district) {
        (Some(city), Some(district)) => lines.push(format!("   Location: {district}, {city}")),
        (Some(city), None) => lines.push(format!("   Location: {city}")),
        (None, Some(district)) => lines.push(format!("   Location: {district}")),
        (None, None) => {}
    }
    if let Some(price) = p.base_price.filter(|v| *v >= 0.0) {
        lines.push(format!("   Price: {}", format_price_bilingual(price.round() as u64)));
    }
    if let Some(area) = p.area {
        lines.push(format!("   Area: {area} sqm"));
    }
    match (p.bedrooms, p.bathrooms) {
        (Some(bed), Some(bath)) => lines.push(format!("   Rooms: {bed} bedrooms, {bath} bathrooms")),
        (Some(bed), None) => lines.push(format!("   Rooms: {bed} bedrooms")),
        _ => {}
    }
    if !p.amenities.is_empty() {
        lines.push(format!("   Amenities: {}", p.amenities.join(", ")));
    }
    if let Some(delivery) = p.delivery_date {
        lines.push(format!("   Delivery: {}", format_delivery_date(delivery)));
    }
    for plan in p.payment_plans.iter().take(2) {
        lines.push(format!(
            "   Payment plan: {}% down, {} years",
            plan.down_payment_percentage, plan.installment_years
        ));
    }
    lines.push(String::new());
    lines.join("\n")
}

fn format_delivery_date(date: DateTime<Utc>) -> String {
    const MONTHS: [&str; 12] = [
        "January", "February", "March", "April", "May", "June", "July", "August", "September",
        "October", "November", "December",
    ];
    format!("{} {}", MONTHS[date.month0() as usize], date.year())
}

fn format_document(index: usize, d: &KnowledgeDocument) -> String {
    let mut lines = vec![format!("{index}. {} ({})", d.title, d.document_type.as_str())];
    if let Some(ref description) = d.description {
        lines.push(format!("   {description}"));
    }

    let mut budget = DOCUMENT_SNIPPET_BUDGET;
    for chunk in d.content_chunks.iter().take(3) {
        if budget == 0 {
            break;
        }
        let snippet: String = chunk.chars().take(budget).collect();
        budget = budget.saturating_sub(snippet.chars().count());
        lines.push(format!("   {snippet}"));
    }
    lines.push(String::new());
    lines.join("\n")
}

// ─── Embedding text ─────────────────────────────────────────────────────────

fn property_embedding_text(p: &PropertyDocument) -> String {
    let mut parts = vec![p.title.clone()];
    if let Some(ref kind) = p.property_type {
        parts.push(kind.clone());
    }
    match (&p.city, &p.district) {
        (Some(city), Some(district)) => parts.push(format!("{district}, {city}")),
        (Some(city), None) => parts.push(city.clone()),
        (None, Some(district)) => parts.push(district.clone()),
        (None, None) => {}
    }
    if let Some(price) = p.base_price {
        parts.push(format!("price {price} {}", p.currency.as_deref().unwrap_or("EGP")));
    }
    if let (Some(bed), Some(area)) = (p.bedrooms, p.area) {
        parts.push(format!("{bed} bedrooms, {area} sqm"));
    }
    if !p.amenities.is_empty() {
        parts.push(p.amenities.join(", "));
    }
    if let Some(ref description) = p.description {
        parts.push(description.clone());
    }
    parts.join(". ")
}

fn document_embedding_text(d: &KnowledgeDocument) -> String {
    let mut parts = vec![d.title.clone()];
    if let Some(ref description) = d.description {
        parts.push(description.clone());
    }
    parts.extend(d.content_chunks.iter().cloned());
    parts.join("\n")
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::VectorRecord;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Deterministic embedder: buckets on keywords, unit-norm output.
    struct StubEmbedder;

    #[async_trait]
    impl EmbeddingClient for StubEmbedder {
        fn dimensions(&self) -> usize {
            3
        }

        async fn embed(&self, text: &str) -> CoreResult<Vec<f32>> {
            let lower = text.to_lowercase();
            let mut v = vec![0.1f32, 0.1, 0.1];
            if lower.contains("apartment") || lower.contains("bedroom") {
                v[0] = 1.0;
            }
            if lower.contains("policy") || lower.contains("refund") {
                v[1] = 1.0;
            }
            crate::embedding::l2_normalize(&mut v);
            Ok(v)
        }

        async fn embed_batch(&self, texts: &[String]) -> CoreResult<Vec<Vec<f32>>> {
            let mut out = Vec::new();
            for t in texts {
                out.push(self.embed(t).await?);
            }
            Ok(out)
        }
    }

    /// In-memory vector store; `failing` makes every search error.
    struct StubIndex<D> {
        rows: Mutex<Vec<D>>,
        failing: bool,
    }

    impl<D> StubIndex<D> {
        fn new() -> Self {
            StubIndex {
                rows: Mutex::new(Vec::new()),
                failing: false,
            }
        }
        fn failing() -> Self {
            StubIndex {
                rows: Mutex::new(Vec::new()),
                failing: true,
            }
        }
    }

    #[async_trait]
    impl<D> VectorStore for StubIndex<D>
    where
        D: VectorRecord + Clone + Send + Sync + 'static,
    {
        type Doc = D;

        async fn search(
            &self,
            query: &[f32],
            agent_id: &str,
            k: usize,
            threshold: f32,
        ) -> CoreResult<Vec<Scored<D>>> {
            if self.failing {
                return Err(CoreError::infra("index down"));
            }
            let rows = self.rows.lock().unwrap();
            let mut hits: Vec<Scored<D>> = rows
                .iter()
                .filter(|d| d.agent_id() == agent_id)
                .map(|d| Scored {
                    document: d.clone(),
                    similarity: crate::embedding::cosine_similarity(query, d.embedding()),
                })
                .filter(|s| s.similarity >= threshold)
                .collect();
            hits.sort_by(|a, b| b.similarity.partial_cmp(&a.similarity).unwrap());
            hits.truncate(k);
            Ok(hits)
        }

        async fn upsert(&self, doc: &D) -> CoreResult<()> {
            let mut rows = self.rows.lock().unwrap();
            rows.retain(|d| d.id() != doc.id());
            rows.push(doc.clone());
            Ok(())
        }

        async fn delete(&self, id: &str, _agent_id: &str) -> CoreResult<()> {
            self.rows.lock().unwrap().retain(|d| d.id() != id);
            Ok(())
        }
    }

    fn property(id: &str, price: f64) -> PropertyDocument {
        PropertyDocument {
            id: id.into(),
            agent_id: "agent-1".into(),
            title: format!("Apartment {id}"),
            city: Some("New Cairo".into()),
            district: None,
            latitude: None,
            longitude: None,
            base_price: Some(price),
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
            description: Some("Three bedroom apartment near the park.".into()),
            media_urls: vec![],
            embedding: vec![],
            embedding_text: String::new(),
        }
    }

    fn retriever_with(
        properties: StubIndex<PropertyDocument>,
        documents: StubIndex<KnowledgeDocument>,
    ) -> RagRetriever {
        RagRetriever::new(Arc::new(StubEmbedder), Arc::new(properties), Arc::new(documents))
    }

    #[test]
    fn test_source_detection() {
        assert_eq!(detect_source("any 3 bedroom apartment?"), RetrievalSource::Properties);
        assert_eq!(detect_source("what is the refund policy"), RetrievalSource::Documents);
        assert_eq!(detect_source("tell me more"), RetrievalSource::Both);
    }

    #[tokio::test]
    async fn test_ingest_property_unit_norm() {
        let retriever = retriever_with(StubIndex::new(), StubIndex::new());
        let stored = retriever.ingest_property(property("p1", 3_000_000.0)).await.unwrap();
        let norm: f32 = stored.embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-3);
        assert!(!stored.embedding_text.is_empty());
    }

    #[tokio::test]
    async fn test_retrieve_formats_sections_in_order() {
        let properties = StubIndex::new();
        let documents = StubIndex::new();
        let retriever = retriever_with(properties, documents);

        retriever.ingest_property(property("p1", 3_000_000.0)).await.unwrap();
        retriever
            .ingest_document(KnowledgeDocument {
                id: "d1".into(),
                agent_id: "agent-1".into(),
                document_type: crate::types::DocumentType::Policy,
                category: None,
                title: "Refund policy".into(),
                description: None,
                content_chunks: vec!["Refunds are processed within 14 days.".into()],
                embedding: vec![],
            })
            .await
            .unwrap();

        let context = retriever
            .retrieve_context(
                "apartment bedroom refund policy",
                "agent-1",
                &RetrievalOptions {
                    source: Some(RetrievalSource::Both),
                    k: None,
                    filters: SearchFilters::default(),
                },
            )
            .await
            .unwrap();

        let kb = context.combined_context.find("KNOWLEDGE BASE").unwrap();
        let props = context.combined_context.find("AVAILABLE PROPERTIES").unwrap();
        assert!(kb < props, "knowledge base section must come first");
        assert!(context.combined_context.contains("3,000,000 EGP"));
    }

    #[tokio::test]
    async fn test_price_filter_applied_post_hoc() {
        let retriever = retriever_with(StubIndex::new(), StubIndex::new());
        retriever.ingest_property(property("cheap", 2_000_000.0)).await.unwrap();
        retriever.ingest_property(property("pricey", 9_000_000.0)).await.unwrap();

        let context = retriever
            .retrieve_context(
                "3 bedroom apartment",
                "agent-1",
                &RetrievalOptions {
                    source: Some(RetrievalSource::Properties),
                    k: None,
                    filters: SearchFilters {
                        max_price: Some(3_000_000.0),
                        ..SearchFilters::default()
                    },
                },
            )
            .await
            .unwrap();

        assert_eq!(context.properties.len(), 1);
        assert_eq!(context.properties[0].document.id, "cheap");
    }

    #[tokio::test]
    async fn test_one_source_failing_does_not_abort_the_other() {
        let retriever = retriever_with(StubIndex::new(), StubIndex::failing());
        retriever.ingest_property(property("p1", 3_000_000.0)).await.unwrap();

        let context = retriever
            .retrieve_context(
                "apartment with bedroom",
                "agent-1",
                &RetrievalOptions {
                    source: Some(RetrievalSource::Both),
                    k: None,
                    filters: SearchFilters::default(),
                },
            )
            .await
            .unwrap();

        assert_eq!(context.properties.len(), 1);
        assert!(context.documents.is_empty());
        assert_eq!(context.sources, vec!["properties"]);
    }

    #[tokio::test]
    async fn test_augment_prompt_appends_instruction_block() {
        let retriever = retriever_with(StubIndex::new(), StubIndex::new());
        retriever.ingest_property(property("p1", 3_000_000.0)).await.unwrap();

        let prompt = retriever
            .augment_prompt(
                "You are a real-estate assistant.",
                "apartment bedroom",
                "agent-1",
                &RetrievalOptions {
                    source: Some(RetrievalSource::Properties),
                    k: None,
                    filters: SearchFilters::default(),
                },
            )
            .await
            .unwrap();

        assert!(prompt.starts_with("You are a real-estate assistant."));
        assert!(prompt.contains("AVAILABLE PROPERTIES"));
        assert!(prompt.contains("prefer the retrieved context"));
        assert!(prompt.contains("connect the customer with an agent"));
    }

    #[test]
    fn test_apply_context_empty_leaves_prompt_untouched() {
        let prompt = apply_context("base prompt", "");
        assert_eq!(prompt, "base prompt");

        let augmented = apply_context("base prompt", "AVAILABLE PROPERTIES:\n1. Unit");
        assert!(augmented.starts_with("base prompt"));
        assert!(augmented.contains("connect the customer with an agent"));
    }

    #[test]
    fn test_property_filter_rules() {
        let mut p = property("p1", 3_000_000.0);
        p.district = Some("Fifth Settlement".into());

        let mut filters = SearchFilters {
            location: Some("fifth settlement".into()),
            bedrooms: Some(3),
            ..SearchFilters::default()
        };
        assert!(property_passes(&p, &filters));

        filters.bedrooms = Some(4);
        assert!(!property_passes(&p, &filters));

        filters.bedrooms = None;
        filters.property_type = Some("villa".into());
        assert!(!property_passes(&p, &filters));
    }
}
