//! In-process document store provider.
//!
//! Keyword search scores a document by the fraction of query words it
//! contains (title and body). Vector search ranks by cosine similarity.
//! Documents indexed without a vector are embedded when an embedder is
//! attached. Request `filters` must match document metadata exactly.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use tokio::time::Instant;
use uir_search::{
    Capability, Document, Embedder, ProviderAdapter, ProviderError, SearchOptions, SearchResult,
    VectorQuery,
};

use super::{cosine, tokenize};

const DEFAULT_INDEX: &str = "default";

/// A searchable in-memory collection, grouped by index name.
pub struct InMemoryProvider {
    name: String,
    indexes: RwLock<BTreeMap<String, Vec<Document>>>,
    embedder: Option<Arc<dyn Embedder>>,
}

impl std::fmt::Debug for InMemoryProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let indexes = self.indexes.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("InMemoryProvider")
            .field("name", &self.name)
            .field("indexes", &indexes.keys().collect::<Vec<_>>())
            .field("embedder", &self.embedder.as_ref().map(|e| e.model_name().to_string()))
            .finish()
    }
}

impl InMemoryProvider {
    /// Empty store named `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            indexes: RwLock::new(BTreeMap::new()),
            embedder: None,
        }
    }

    /// Embed documents that arrive without a vector.
    #[must_use]
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Number of documents in `index` (the default index when `None`).
    #[must_use]
    pub fn len(&self, index: Option<&str>) -> usize {
        let indexes = self.indexes.read().unwrap_or_else(PoisonError::into_inner);
        indexes
            .get(index.unwrap_or(DEFAULT_INDEX))
            .map_or(0, Vec::len)
    }

    /// Returns `true` if `index` holds no documents.
    #[must_use]
    pub fn is_empty(&self, index: Option<&str>) -> bool {
        self.len(index) == 0
    }

    fn upsert(&self, index: &str, documents: Vec<Document>) -> usize {
        let mut indexes = self.indexes.write().unwrap_or_else(PoisonError::into_inner);
        let stored = indexes.entry(index.to_string()).or_default();
        let count = documents.len();
        for doc in documents {
            match stored.iter_mut().find(|d| d.id == doc.id) {
                Some(existing) => *existing = doc,
                None => stored.push(doc),
            }
        }
        count
    }

    fn check_deadline(&self, deadline: Instant) -> Result<(), ProviderError> {
        if Instant::now() >= deadline {
            return Err(ProviderError::Timeout(format!(
                "{} deadline passed before the query ran",
                self.name
            )));
        }
        Ok(())
    }

    fn to_result(&self, doc: &Document, score: f64) -> SearchResult {
        let mut result = SearchResult::new(doc.id.clone(), self.name.clone(), score);
        result.title = doc.title.clone();
        result.content = doc.content.clone();
        result.url = doc.url.clone();
        result.metadata = doc.metadata.clone();
        result
    }
}

fn matches_filters(doc: &Document, options: &SearchOptions) -> bool {
    options
        .filters
        .iter()
        .all(|(key, value)| doc.metadata.get(key) == Some(value))
}

fn keyword_score(doc: &Document, terms: &HashSet<String>) -> f64 {
    let text = format!(
        "{} {}",
        doc.title.as_deref().unwrap_or_default(),
        doc.content.as_deref().unwrap_or_default()
    );
    let words: HashSet<String> = tokenize(&text).collect();
    let matched = terms.iter().filter(|t| words.contains(*t)).count();
    matched as f64 / terms.len() as f64
}

fn top(mut scored: Vec<SearchResult>, options: &SearchOptions) -> Vec<SearchResult> {
    scored.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
    scored.truncate(options.offset.saturating_add(options.limit));
    scored
}

#[async_trait]
impl ProviderAdapter for InMemoryProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Vec<Capability> {
        vec![Capability::Search, Capability::VectorSearch, Capability::Index]
    }

    async fn search(
        &self,
        query: &str,
        options: &SearchOptions,
        deadline: Instant,
    ) -> Result<Vec<SearchResult>, ProviderError> {
        self.check_deadline(deadline)?;
        let terms: HashSet<String> = tokenize(query).collect();
        if terms.is_empty() {
            return Err(ProviderError::InvalidRequest("query has no words".into()));
        }
        tracing::trace!(provider = %self.name, query, "keyword search");

        let scored = {
            let indexes = self.indexes.read().unwrap_or_else(PoisonError::into_inner);
            let matched = indexes
                .get(DEFAULT_INDEX)
                .into_iter()
                .flatten()
                .filter(|doc| matches_filters(doc, options))
                .filter_map(|doc| {
                    let score = keyword_score(doc, &terms);
                    (score > 0.0).then(|| self.to_result(doc, score))
                })
                .collect::<Vec<_>>();
            matched
        };
        Ok(top(scored, options))
    }

    async fn vector_search(
        &self,
        query: &VectorQuery,
        options: &SearchOptions,
        deadline: Instant,
    ) -> Result<Vec<SearchResult>, ProviderError> {
        self.check_deadline(deadline)?;
        if query.vector.is_empty() {
            return Err(ProviderError::InvalidRequest("query vector is empty".into()));
        }
        let index = query.index.as_deref().unwrap_or(DEFAULT_INDEX);

        let scored = {
            let indexes = self.indexes.read().unwrap_or_else(PoisonError::into_inner);
            let matched = indexes
                .get(index)
                .into_iter()
                .flatten()
                .filter(|doc| matches_filters(doc, options))
                .filter_map(|doc| {
                    let vector = doc.vector.as_ref()?;
                    if vector.len() != query.vector.len() {
                        return None;
                    }
                    Some(self.to_result(doc, cosine(&query.vector, vector)))
                })
                .collect::<Vec<_>>();
            matched
        };
        Ok(top(scored, options))
    }

    async fn index(
        &self,
        documents: &[Document],
        index_name: Option<&str>,
        deadline: Instant,
    ) -> Result<usize, ProviderError> {
        self.check_deadline(deadline)?;
        if let Some(doc) = documents.iter().find(|d| d.id.trim().is_empty()) {
            return Err(ProviderError::InvalidRequest(format!(
                "document without an id (title {:?})",
                doc.title
            )));
        }

        let mut prepared = Vec::with_capacity(documents.len());
        for doc in documents {
            let mut doc = doc.clone();
            if doc.vector.is_none() {
                if let Some(embedder) = &self.embedder {
                    let text = format!(
                        "{} {}",
                        doc.title.as_deref().unwrap_or_default(),
                        doc.content.as_deref().unwrap_or_default()
                    );
                    doc.vector = Some(embedder.embed(&text, deadline).await?);
                }
            }
            prepared.push(doc);
        }

        let index = index_name.unwrap_or(DEFAULT_INDEX);
        let count = self.upsert(index, prepared);
        tracing::debug!(provider = %self.name, index, count, "documents indexed");
        Ok(count)
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}
