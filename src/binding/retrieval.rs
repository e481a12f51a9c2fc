//! Retrieval tools over a vector index.
//!
//! Scoring and filtering variants are explicit adapter strategies selected
//! at construction time; nothing mutates shared search behavior
//! process-wide.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{MusterError, Result};
use crate::platform::{ChatClient, ChatMessage, ChatRequest, EmbeddingClient};
use crate::records::{DatasourceRecord, RetrieverKind, ToolRecord};

use super::tool::{Tool, ToolArguments, ToolExecutionContext};

/// One retrieved document chunk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievedChunk {
    pub text: String,
    pub score: f32,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Similarity search over one collection. The vector store driver is an
/// external collaborator; this is its capability surface.
#[async_trait]
pub trait VectorSearch: Send + Sync {
    /// Handshake validation: verify the index is reachable. Called once at
    /// binding time; failures propagate unretried.
    async fn probe(&self) -> Result<()>;

    async fn similarity_search(&self, vector: &[f32], k: usize) -> Result<Vec<RetrievedChunk>>;

    async fn similarity_search_with_filter(
        &self,
        vector: &[f32],
        k: usize,
        filter: &serde_json::Value,
    ) -> Result<Vec<RetrievedChunk>>;
}

/// Opens index handles for datasources.
pub trait VectorIndexFactory: Send + Sync {
    fn open(&self, datasource: &DatasourceRecord) -> Result<Arc<dyn VectorSearch>>;
}

/// How raw search results are requested and re-scored.
#[derive(Debug, Clone, PartialEq)]
pub enum RetrievalStrategy {
    /// Plain top-k.
    TopK { k: usize },
    /// Top-k restricted by a metadata filter.
    Filtered { k: usize, filter: serde_json::Value },
    /// Top-k re-scored with exponential time decay over a metadata
    /// timestamp field (epoch seconds).
    TimeWeighted {
        k: usize,
        decay_rate: f64,
        timestamp_field: String,
    },
}

const DEFAULT_TOP_K: usize = 4;

impl RetrievalStrategy {
    pub fn from_record(kind: &RetrieverKind, config: Option<&serde_json::Value>) -> Self {
        let k = config
            .and_then(|c| c.get("k"))
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_TOP_K);
        match kind {
            RetrieverKind::Raw => Self::TopK { k },
            RetrieverKind::SelfQuery => Self::Filtered {
                k,
                filter: config
                    .and_then(|c| c.get("filter"))
                    .cloned()
                    .unwrap_or(serde_json::Value::Null),
            },
            RetrieverKind::TimeWeighted => Self::TimeWeighted {
                k,
                decay_rate: config
                    .and_then(|c| c.get("decayRate"))
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.01),
                timestamp_field: config
                    .and_then(|c| c.get("timestampField"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("timestamp")
                    .to_string(),
            },
        }
    }

    async fn search(
        &self,
        index: &dyn VectorSearch,
        vector: &[f32],
    ) -> Result<Vec<RetrievedChunk>> {
        match self {
            Self::TopK { k } => index.similarity_search(vector, *k).await,
            Self::Filtered { k, filter } => {
                index.similarity_search_with_filter(vector, *k, filter).await
            }
            Self::TimeWeighted {
                k,
                decay_rate,
                timestamp_field,
            } => {
                // Over-fetch, re-score by recency, keep k.
                let mut chunks = index.similarity_search(vector, k * 4).await?;
                let now = Utc::now().timestamp() as f64;
                for chunk in &mut chunks {
                    let age_hours = chunk
                        .metadata
                        .get(timestamp_field)
                        .and_then(|v| v.as_f64())
                        .map(|ts| ((now - ts) / 3600.0).max(0.0))
                        .unwrap_or(0.0);
                    chunk.score *= (1.0 - decay_rate).powf(age_hours) as f32;
                }
                chunks.sort_by(|a, b| b.score.total_cmp(&a.score));
                chunks.truncate(*k);
                Ok(chunks)
            }
        }
    }
}

/// A data-source-backed retrieval tool.
pub struct RetrievalTool {
    name: String,
    description: String,
    parameters: serde_json::Value,
    embedder: Arc<dyn EmbeddingClient>,
    index: Arc<dyn VectorSearch>,
    strategy: RetrievalStrategy,
    /// Optional chat model that rewrites the raw query before embedding.
    /// Its output is internal-only and never reaches the transport.
    formatter: Option<Arc<dyn ChatClient>>,
}

impl RetrievalTool {
    pub fn new(
        record: &ToolRecord,
        embedder: Arc<dyn EmbeddingClient>,
        index: Arc<dyn VectorSearch>,
        strategy: RetrievalStrategy,
        formatter: Option<Arc<dyn ChatClient>>,
    ) -> Self {
        Self {
            name: record.name.clone(),
            description: record.description.clone(),
            parameters: record.parameters.clone().unwrap_or_else(|| {
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "query": {
                            "type": "string",
                            "description": "Natural language search query",
                        }
                    },
                    "required": ["query"],
                })
            }),
            embedder,
            index,
            strategy,
            formatter,
        }
    }

    async fn format_query(&self, query: &str) -> Result<String> {
        let Some(formatter) = &self.formatter else {
            return Ok(query.to_string());
        };
        let request = ChatRequest::new(vec![
            ChatMessage::system(
                "Rewrite the user's request as a concise search query. Reply with the query only.",
            ),
            ChatMessage::user(query),
        ]);
        let response = formatter.chat(&request).await?;
        let rewritten = response.text.trim().to_string();
        Ok(if rewritten.is_empty() {
            query.to_string()
        } else {
            rewritten
        })
    }
}

#[async_trait]
impl Tool for RetrievalTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> serde_json::Value {
        self.parameters.clone()
    }

    async fn execute(
        &self,
        args: &ToolArguments,
        _ctx: &ToolExecutionContext,
    ) -> Result<serde_json::Value> {
        let query = args.get_str("query")?;
        let query = self.format_query(query).await?;

        let vectors = self.embedder.embed(&[query.clone()]).await?;
        let vector = vectors.into_iter().next().ok_or_else(|| {
            MusterError::ToolExecution {
                tool_name: self.name.clone(),
                message: "embedding model returned no vector".into(),
            }
        })?;

        let chunks = self.strategy.search(self.index.as_ref(), &vector).await?;
        debug!(tool = %self.name, results = chunks.len(), "retrieval search");

        Ok(serde_json::json!({
            "query": query,
            "results": chunks,
        }))
    }
}

/// In-memory cosine-similarity index for tests and small corpora.
#[derive(Default)]
pub struct MemoryVectorIndex {
    entries: RwLock<Vec<(Vec<f32>, RetrievedChunk)>>,
}

impl MemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, vector: Vec<f32>, text: impl Into<String>, metadata: serde_json::Value) {
        self.entries.write().await.push((
            vector,
            RetrievedChunk {
                text: text.into(),
                score: 0.0,
                metadata,
            },
        ));
    }

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        if na == 0.0 || nb == 0.0 {
            0.0
        } else {
            dot / (na * nb)
        }
    }
}

#[async_trait]
impl VectorSearch for MemoryVectorIndex {
    async fn probe(&self) -> Result<()> {
        Ok(())
    }

    async fn similarity_search(&self, vector: &[f32], k: usize) -> Result<Vec<RetrievedChunk>> {
        let entries = self.entries.read().await;
        let mut scored: Vec<RetrievedChunk> = entries
            .iter()
            .map(|(v, chunk)| {
                let mut chunk = chunk.clone();
                chunk.score = Self::cosine(vector, v);
                chunk
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(k);
        Ok(scored)
    }

    async fn similarity_search_with_filter(
        &self,
        vector: &[f32],
        k: usize,
        filter: &serde_json::Value,
    ) -> Result<Vec<RetrievedChunk>> {
        let all = self.similarity_search(vector, usize::MAX).await?;
        let filtered: Vec<RetrievedChunk> = all
            .into_iter()
            .filter(|chunk| match filter.as_object() {
                Some(map) => map.iter().all(|(key, value)| chunk.metadata.get(key) == Some(value)),
                None => true,
            })
            .take(k)
            .collect();
        Ok(filtered)
    }
}

/// Factory over a fixed set of in-memory indexes, keyed by collection name.
#[derive(Default)]
pub struct MemoryIndexFactory {
    indexes: std::sync::Mutex<std::collections::HashMap<String, Arc<MemoryVectorIndex>>>,
}

impl MemoryIndexFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, collection: impl Into<String>, index: Arc<MemoryVectorIndex>) {
        self.indexes.lock().unwrap().insert(collection.into(), index);
    }
}

impl VectorIndexFactory for MemoryIndexFactory {
    fn open(&self, datasource: &DatasourceRecord) -> Result<Arc<dyn VectorSearch>> {
        self.indexes
            .lock()
            .unwrap()
            .get(&datasource.collection)
            .cloned()
            .map(|index| index as Arc<dyn VectorSearch>)
            .ok_or_else(|| {
                MusterError::binding(
                    &datasource.name,
                    format!("vector collection '{}' is not reachable", datasource.collection),
                )
            })
    }
}
