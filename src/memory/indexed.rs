//! 索引层：进程内向量存储，余弦相似度近似 top-K
//!
//! 记录自带 embedding 时直接使用，否则用 EmbeddingProvider 对 key 编码。

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use super::embedding::{cosine_similarity, EmbeddingProvider};
use super::lookup::{default_applies, TierLookup, TierQuery, TierStore};
use super::record::{MemoryRecord, ScoredRecord, Tier};

struct IndexedEntry {
    record: MemoryRecord,
    vector: Vec<f32>,
}

pub struct IndexedTier {
    entries: RwLock<HashMap<String, IndexedEntry>>,
    embedder: Arc<dyn EmbeddingProvider>,
    sufficient_hits: usize,
}

impl IndexedTier {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, sufficient_hits: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            embedder,
            sufficient_hits,
        }
    }

    /// 按向量检索，返回分数 >= min_score 的前 top_k 条
    pub fn search(&self, query: &[f32], top_k: usize, min_score: f32) -> Vec<ScoredRecord> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut scored: Vec<ScoredRecord> = entries
            .values()
            .filter_map(|e| {
                let score = cosine_similarity(query, &e.vector);
                (score >= min_score).then(|| ScoredRecord::new(e.record.clone(), Tier::Indexed, score))
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.record.created_at.cmp(&a.record.created_at))
        });
        scored.truncate(top_k);
        scored
    }

    pub fn count(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl TierStore for IndexedTier {
    fn tier(&self) -> Tier {
        Tier::Indexed
    }

    async fn put(&self, record: &MemoryRecord) -> Result<(), String> {
        let vector = match &record.embedding {
            Some(v) if v.len() == self.embedder.dims() => v.clone(),
            Some(v) => {
                return Err(format!(
                    "embedding has {} dims, index expects {}",
                    v.len(),
                    self.embedder.dims()
                ))
            }
            None => self.embedder.embed(&record.key),
        };
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            record.id.clone(),
            IndexedEntry {
                record: record.resident_in(Tier::Indexed),
                vector,
            },
        );
        Ok(())
    }

    async fn contains(&self, id: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    async fn len(&self) -> usize {
        self.count()
    }

    async fn records(&self) -> Vec<MemoryRecord> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|e| e.record.clone())
            .collect()
    }

    async fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[async_trait]
impl TierLookup for IndexedTier {
    fn tier(&self) -> Tier {
        Tier::Indexed
    }

    fn applies(&self, query: &TierQuery, gathered: &[ScoredRecord]) -> bool {
        default_applies(Tier::Indexed, query, gathered, self.sufficient_hits)
    }

    async fn lookup(&self, query: &TierQuery, _gathered: &[ScoredRecord]) -> Vec<ScoredRecord> {
        match &query.embedding {
            Some(v) => self.search(v, query.top_k, query.min_score),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::embedding::HashingEmbedder;

    fn tier() -> IndexedTier {
        IndexedTier::new(Arc::new(HashingEmbedder::new(64)), 1)
    }

    #[tokio::test]
    async fn test_put_and_search_by_key_embedding() {
        let t = tier();
        t.put(&MemoryRecord::new("build the project", "ok")).await.unwrap();
        t.put(&MemoryRecord::new("weather tomorrow", "sunny")).await.unwrap();

        let q = HashingEmbedder::new(64).embed("build the project");
        let hits = t.search(&q, 5, 0.5);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.key, "build the project");
        assert!(hits[0].record.residency.indexed);
        assert!((hits[0].score - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_top_k_limits_results() {
        let t = tier();
        for i in 0..10 {
            t.put(&MemoryRecord::new(format!("note {i}"), "x")).await.unwrap();
        }
        let q = HashingEmbedder::new(64).embed("note");
        assert!(t.search(&q, 3, 0.0).len() <= 3);
    }

    #[tokio::test]
    async fn test_wrong_dims_rejected() {
        let t = tier();
        let r = MemoryRecord::new("k", "v").with_embedding(vec![1.0, 0.0]);
        assert!(t.put(&r).await.is_err());
        assert_eq!(t.count(), 0);
    }

    #[tokio::test]
    async fn test_put_is_idempotent_by_id() {
        let t = tier();
        let r = MemoryRecord::new("k", "v");
        t.put(&r).await.unwrap();
        t.put(&r).await.unwrap();
        assert_eq!(t.count(), 1);
        assert!(t.contains(&r.id).await);
    }
}
