//! 记忆控制器：分层读写的唯一入口
//!
//! - write：同步写入热层（返回即可读），再异步传播到索引层与关系层
//! - query：按层级联检索，受每层预算与聚合预算约束，结果合并排序
//! - stats：各层规模、待传播数、淘汰次数
//! - export / import / save_to / load_from / clear：快照持久化

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::embedding::{EmbeddingProvider, HashingEmbedder};
use super::graph::GraphTier;
use super::hot::HotTier;
use super::indexed::IndexedTier;
use super::lookup::{rank, Cascade, TierLookup, TierQuery, TierStore};
use super::propagation::{PropagationConfig, PropagationPool};
use super::record::{MemoryRecord, RankedResults, Tier, TierResidency};
use super::remote::RemoteTier;
use super::snapshot::{MemorySnapshot, SnapshotError};
use crate::config::AppConfig;
use crate::core::HiveError;
use crate::observability::Metrics;

/// 查询目标：精确键或向量
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum QueryTarget {
    Key(String),
    Embedding(Vec<f32>),
}

/// 查询请求（Query 信封 payload）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub target: QueryTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation_hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<usize>,
}

impl QueryRequest {
    pub fn by_key(key: impl Into<String>) -> Self {
        Self {
            target: QueryTarget::Key(key.into()),
            relation_hint: None,
            top_k: None,
        }
    }

    pub fn by_embedding(embedding: Vec<f32>) -> Self {
        Self {
            target: QueryTarget::Embedding(embedding),
            relation_hint: None,
            top_k: None,
        }
    }

    pub fn with_relation(mut self, hint: impl Into<String>) -> Self {
        self.relation_hint = Some(hint.into());
        self
    }

    pub fn with_top_k(mut self, k: usize) -> Self {
        self.top_k = Some(k);
        self
    }
}

/// 写入请求（Write 信封 payload）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteRequest {
    pub record: MemoryRecord,
}

/// 写入确认（热层已可读）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteAck {
    pub id: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evicted_key: Option<String>,
}

/// 控制器统计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub hot_entries: usize,
    pub hot_capacity: usize,
    pub indexed_records: usize,
    pub graph_nodes: usize,
    pub graph_edges: usize,
    pub pending_propagation: usize,
    pub hot_evictions: u64,
}

/// 检索参数
#[derive(Debug, Clone)]
pub struct QuerySettings {
    pub top_k: usize,
    pub min_score: f32,
    pub max_depth: u32,
    pub max_results: usize,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_score: 0.35,
            max_depth: 2,
            max_results: 16,
        }
    }
}

/// 控制器组成部分；字段公开，测试可替换某一层
pub struct ControllerParts {
    pub hot: Arc<HotTier>,
    /// 级联检索的各层（执行顺序）与预算
    pub lookups: Vec<(Arc<dyn TierLookup>, Duration)>,
    /// 后台传播目标
    pub stores: Vec<Arc<dyn TierStore>>,
    pub aggregate: Duration,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub settings: QuerySettings,
    pub propagation: PropagationConfig,
}

impl ControllerParts {
    /// 按配置组装：endpoints 设置时使用远程层，否则使用进程内存储
    pub fn from_config(cfg: &AppConfig) -> Result<Self, HiveError> {
        let m = &cfg.memory;
        let t = &cfg.timeouts;
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(HashingEmbedder::new(m.embedding_dims));
        let hot = Arc::new(HotTier::new(m.hot_capacity));

        let mut lookups: Vec<(Arc<dyn TierLookup>, Duration)> = vec![(hot.clone(), t.hot())];
        let mut stores: Vec<Arc<dyn TierStore>> = Vec::new();

        match &cfg.endpoints.indexed {
            Some(url) => {
                let remote = Arc::new(
                    RemoteTier::new(Tier::Indexed, url.clone(), t.indexed(), m.sufficient_hits)
                        .map_err(|e| HiveError::Protocol(format!("indexed endpoint: {e}")))?,
                );
                lookups.push((remote.clone(), t.indexed()));
                stores.push(remote);
            }
            None => {
                let local = Arc::new(IndexedTier::new(embedder.clone(), m.sufficient_hits));
                lookups.push((local.clone(), t.indexed()));
                stores.push(local);
            }
        }
        match &cfg.endpoints.graphed {
            Some(url) => {
                let remote = Arc::new(
                    RemoteTier::new(Tier::Graphed, url.clone(), t.graphed(), m.sufficient_hits)
                        .map_err(|e| HiveError::Protocol(format!("graphed endpoint: {e}")))?,
                );
                lookups.push((remote.clone(), t.graphed()));
                stores.push(remote);
            }
            None => {
                let local = Arc::new(GraphTier::new());
                lookups.push((local.clone(), t.graphed()));
                stores.push(local);
            }
        }

        Ok(Self {
            hot,
            lookups,
            stores,
            aggregate: t.aggregate(),
            embedder,
            settings: QuerySettings {
                top_k: m.top_k,
                min_score: m.similarity_threshold,
                max_depth: m.graph_max_depth,
                max_results: m.max_results,
            },
            propagation: PropagationConfig {
                workers: m.propagation_workers,
                max_retries: m.propagation_max_retries,
                backoff: Duration::from_millis(m.propagation_backoff_ms),
                backoff_max: Duration::from_millis(m.propagation_backoff_max_ms),
            },
        })
    }
}

pub struct MemoryController {
    hot: Arc<HotTier>,
    stores: Vec<Arc<dyn TierStore>>,
    cascade: Cascade,
    propagation: PropagationPool,
    embedder: Arc<dyn EmbeddingProvider>,
    settings: QuerySettings,
    metrics: Arc<Metrics>,
}

impl MemoryController {
    /// 组装控制器并启动传播池（需在 tokio runtime 内调用）
    pub fn new(parts: ControllerParts, metrics: Arc<Metrics>) -> Self {
        let cascade = parts
            .lookups
            .into_iter()
            .fold(Cascade::new(parts.aggregate), |c, (lookup, budget)| c.stage(lookup, budget));
        let propagation =
            PropagationPool::start(parts.stores.clone(), parts.propagation, Some(metrics.clone()));
        metrics.set_hot_entries(parts.hot.len());
        Self {
            hot: parts.hot,
            stores: parts.stores,
            cascade,
            propagation,
            embedder: parts.embedder,
            settings: parts.settings,
            metrics,
        }
    }

    pub fn from_config(cfg: &AppConfig, metrics: Arc<Metrics>) -> Result<Self, HiveError> {
        Ok(Self::new(ControllerParts::from_config(cfg)?, metrics))
    }

    /// 写入：热层立即可读，随后入队传播
    ///
    /// id 按记录内容重新计算，调用方给出的 id 不被信任。
    pub fn write(&self, record: MemoryRecord) -> WriteAck {
        let out = self.hot.insert(record.sealed());
        self.metrics.set_hot_entries(self.hot.len());

        let evicted_key = out.evicted.map(|e| {
            self.metrics.hot_eviction();
            tracing::debug!(key = %e.record.key, "Hot tier evicted entry");
            e.record.key
        });
        if let Some(prev) = &out.superseded {
            tracing::debug!(key = %out.record.key, previous = %prev, "New record version");
        }

        let ack = WriteAck {
            id: out.record.id.clone(),
            key: out.record.key.clone(),
            previous: out.record.previous.clone(),
            evicted_key,
        };
        self.propagation.enqueue(out.record);
        ack
    }

    fn resolve(&self, request: QueryRequest) -> TierQuery {
        let (key, embedding) = match request.target {
            QueryTarget::Key(k) => {
                let e = self.embedder.embed(&k);
                (Some(k), Some(e))
            }
            QueryTarget::Embedding(e) => (None, Some(e)),
        };
        TierQuery {
            key,
            embedding,
            relation_hint: request.relation_hint,
            top_k: request.top_k.unwrap_or(self.settings.top_k),
            min_score: self.settings.min_score,
            max_depth: self.settings.max_depth,
            seeds: Vec::new(),
        }
    }

    /// 级联查询；`partial` 非空时每层产出结果后推送一份中间排序结果
    pub async fn query(
        &self,
        request: QueryRequest,
        cancel: &CancellationToken,
        partial: Option<&mpsc::UnboundedSender<RankedResults>>,
    ) -> Result<RankedResults, HiveError> {
        let query = self.resolve(request);
        let max_results = self.settings.max_results;

        let outcome = self
            .cascade
            .run(&query, cancel, Some(&self.metrics), |gathered| {
                if let Some(tx) = partial {
                    let _ = tx.send(RankedResults {
                        records: rank(gathered.to_vec(), max_results),
                        skipped: Vec::new(),
                        complete: false,
                    });
                }
            })
            .await;

        if outcome.cancelled {
            return Err(HiveError::Cancelled);
        }
        Ok(RankedResults {
            records: rank(outcome.gathered, max_results),
            complete: outcome.skipped.is_empty(),
            skipped: outcome.skipped,
        })
    }

    /// 记录当前驻留在哪些层
    pub async fn residency(&self, id: &str) -> TierResidency {
        let mut r = TierResidency::default();
        if self.hot.contains_id(id) {
            r.mark(Tier::Hot);
        }
        for store in &self.stores {
            if store.contains(id).await {
                r.mark(store.tier());
            }
        }
        r
    }

    pub async fn stats(&self) -> MemoryStats {
        let mut stats = MemoryStats {
            hot_entries: self.hot.len(),
            hot_capacity: self.hot.capacity(),
            pending_propagation: self.propagation.pending(),
            hot_evictions: self.hot.evictions(),
            ..Default::default()
        };
        for store in &self.stores {
            match store.tier() {
                Tier::Indexed => stats.indexed_records = store.len().await,
                Tier::Graphed => {
                    stats.graph_nodes = store.len().await;
                    stats.graph_edges = store.edge_count().await;
                }
                Tier::Hot => {}
            }
        }
        stats
    }

    /// 导出全部记录：热层与各层已保存的记录，按 id 去重
    pub async fn export(&self) -> MemorySnapshot {
        let mut records = self.hot.records();
        for store in &self.stores {
            records.extend(store.records().await);
        }
        MemorySnapshot::new(records)
    }

    /// 导入快照：直接写入各存储层（不经热层与传播池），并登记每个键的最新版本
    ///
    /// 返回成功写入至少一层的记录数。
    pub async fn import(&self, snapshot: &MemorySnapshot) -> usize {
        let mut imported = 0;
        for record in &snapshot.records {
            let mut stored = false;
            for store in &self.stores {
                match store.put(record).await {
                    Ok(()) => stored = true,
                    Err(e) => tracing::warn!(tier = %store.tier(), id = %record.id, "Skipping snapshot record: {}", e),
                }
            }
            if stored {
                imported += 1;
            }
        }
        for (key, id) in snapshot.latest_ids() {
            self.hot.remember_latest(&key, &id);
        }
        imported
    }

    /// 导出并写入文件
    pub async fn save_to(&self, path: &Path) -> Result<usize, SnapshotError> {
        let snapshot = self.export().await;
        snapshot.save(path).await?;
        tracing::info!(records = snapshot.len(), path = %path.display(), "Memory snapshot saved");
        Ok(snapshot.len())
    }

    /// 从文件导入；文件不存在时返回 0
    pub async fn load_from(&self, path: &Path) -> Result<usize, SnapshotError> {
        let Some(snapshot) = MemorySnapshot::load(path).await? else {
            tracing::info!(path = %path.display(), "No memory snapshot found, starting empty");
            return Ok(0);
        };
        let imported = self.import(&snapshot).await;
        tracing::info!(records = imported, path = %path.display(), "Memory snapshot loaded");
        Ok(imported)
    }

    /// 清空热层、版本登记与各存储层（远程层不受影响）
    ///
    /// 仍在传播中的记录可能在清空后写回，需要时先 `wait_for_propagation`。
    pub async fn clear(&self) {
        self.hot.clear();
        for store in &self.stores {
            store.clear().await;
        }
        self.metrics.set_hot_entries(0);
        tracing::info!("Memory cleared");
    }

    /// 等待后台传播完成（测试与优雅退出使用）
    pub async fn wait_for_propagation(&self, timeout: Duration) -> bool {
        self.propagation.wait_settled(timeout).await
    }

    pub fn pending_propagation(&self) -> usize {
        self.propagation.pending()
    }

    pub fn hot(&self) -> &HotTier {
        &self.hot
    }

    pub fn aggregate_timeout(&self) -> Duration {
        self.cascade.aggregate()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> MemoryController {
        let cfg = AppConfig::default();
        MemoryController::from_config(&cfg, Arc::new(Metrics::new().unwrap())).unwrap()
    }

    #[tokio::test]
    async fn test_read_your_write_from_hot() {
        let c = controller();
        let ack = c.write(MemoryRecord::new("open file main.rs", "opened"));
        let res = c
            .query(QueryRequest::by_key("open file main.rs"), &CancellationToken::new(), None)
            .await
            .unwrap();
        assert_eq!(res.records[0].record.id, ack.id);
        assert_eq!(res.records[0].tier, Tier::Hot);
    }

    #[tokio::test]
    async fn test_propagates_to_indexed_and_graph() {
        let c = controller();
        let ack = c.write(MemoryRecord::new("k", "v"));
        assert!(c.wait_for_propagation(Duration::from_secs(2)).await);
        let r = c.residency(&ack.id).await;
        assert!(r.hot && r.indexed && r.graphed);
        let s = c.stats().await;
        assert_eq!(s.indexed_records, 1);
        assert_eq!(s.graph_nodes, 1);
        assert_eq!(s.pending_propagation, 0);
    }

    #[tokio::test]
    async fn test_relation_hint_follows_chain() {
        let c = controller();
        let first = c.write(MemoryRecord::new("turn one", "a"));
        c.write(MemoryRecord::new("turn two", "b").with_relation("follows", first.id.clone()));
        assert!(c.wait_for_propagation(Duration::from_secs(2)).await);

        let res = c
            .query(
                QueryRequest::by_key("turn two").with_relation("follows"),
                &CancellationToken::new(),
                None,
            )
            .await
            .unwrap();
        assert!(res.complete);
        assert!(res.contains_id(&first.id));
        assert_eq!(res.records[0].record.key, "turn two");
    }

    #[tokio::test]
    async fn test_embedding_query_skips_hot() {
        let c = controller();
        c.write(MemoryRecord::new("build the project", "ok"));
        assert!(c.wait_for_propagation(Duration::from_secs(2)).await);
        let v = HashingEmbedder::new(AppConfig::default().memory.embedding_dims).embed("build the project");
        let res = c
            .query(QueryRequest::by_embedding(v), &CancellationToken::new(), None)
            .await
            .unwrap();
        assert_eq!(res.records.len(), 1);
        assert_eq!(res.records[0].tier, Tier::Indexed);
    }

    #[tokio::test]
    async fn test_partials_are_pushed() {
        let c = controller();
        c.write(MemoryRecord::new("k", "v"));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let res = c
            .query(QueryRequest::by_key("k"), &CancellationToken::new(), Some(&tx))
            .await
            .unwrap();
        let first = rx.try_recv().unwrap();
        assert!(!first.complete);
        assert!(first.contains_key("k"));
        assert!(res.complete);
    }

    #[tokio::test]
    async fn test_extra_edge_does_not_alter_stored_record() {
        let c = controller();
        let first = c.write(MemoryRecord::new("k", "v"));
        assert!(c.wait_for_propagation(Duration::from_secs(2)).await);
        let edges_before = c.stats().await.graph_edges;

        let second = c.write(MemoryRecord::new("k", "v").with_relation("follows", "elsewhere"));
        assert!(c.wait_for_propagation(Duration::from_secs(2)).await);
        assert_ne!(second.id, first.id);
        assert_eq!(second.previous.as_deref(), Some(first.id.as_str()));

        // 旧 id 对应的节点与边保持不变，新版本是单独的节点
        let snapshot = c.export().await;
        let old = snapshot.records.iter().find(|r| r.id == first.id).unwrap();
        assert!(old.relations.is_empty());
        let stats = c.stats().await;
        assert_eq!(stats.graph_nodes, 2);
        assert_eq!(stats.graph_edges, edges_before + 2);
    }

    #[tokio::test]
    async fn test_forged_id_is_recomputed() {
        let c = controller();
        let mut record = MemoryRecord::new("k", "v");
        let expected = record.id.clone();
        record.id = "forged".into();
        assert_eq!(c.write(record).id, expected);
    }

    #[tokio::test]
    async fn test_rewrite_after_eviction_keeps_chain() {
        let mut cfg = AppConfig::default();
        cfg.memory.hot_capacity = 1;
        let c = MemoryController::from_config(&cfg, Arc::new(Metrics::new().unwrap())).unwrap();
        let v1 = c.write(MemoryRecord::new("editor", "vim"));
        c.write(MemoryRecord::new("other", "x"));
        let v2 = c.write(MemoryRecord::new("editor", "helix"));
        assert_eq!(v2.previous.as_deref(), Some(v1.id.as_str()));
    }

    #[tokio::test]
    async fn test_snapshot_restores_into_fresh_controller() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.json");

        let c = controller();
        let first = c.write(MemoryRecord::new("turn one", "a"));
        c.write(MemoryRecord::new("turn two", "b").with_relation("follows", first.id.clone()));
        let v1 = c.write(MemoryRecord::new("editor", "vim"));
        assert!(c.wait_for_propagation(Duration::from_secs(2)).await);
        assert_eq!(c.save_to(&path).await.unwrap(), 3);

        let restored = controller();
        assert_eq!(restored.load_from(&path).await.unwrap(), 3);
        let stats = restored.stats().await;
        assert_eq!(stats.hot_entries, 0);
        assert_eq!(stats.indexed_records, 3);
        assert_eq!(stats.graph_nodes, 3);
        assert_eq!(restored.residency(&first.id).await, TierResidency {
            hot: false,
            indexed: true,
            graphed: true,
        });

        // 恢复后的关系查询与版本链
        let res = restored
            .query(
                QueryRequest::by_key("turn two").with_relation("follows"),
                &CancellationToken::new(),
                None,
            )
            .await
            .unwrap();
        assert!(res.contains_id(&first.id));
        let v2 = restored.write(MemoryRecord::new("editor", "helix"));
        assert_eq!(v2.previous.as_deref(), Some(v1.id.as_str()));
    }

    #[tokio::test]
    async fn test_missing_snapshot_loads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller();
        assert_eq!(c.load_from(&dir.path().join("absent.json")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_clear_empties_every_tier() {
        let c = controller();
        c.write(MemoryRecord::new("k", "v"));
        assert!(c.wait_for_propagation(Duration::from_secs(2)).await);
        c.clear().await;
        let stats = c.stats().await;
        assert_eq!(stats.hot_entries, 0);
        assert_eq!(stats.indexed_records, 0);
        assert_eq!(stats.graph_nodes, 0);
        assert!(c.export().await.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_query() {
        let c = controller();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = c.query(QueryRequest::by_key("k"), &cancel, None).await.unwrap_err();
        assert_eq!(err, HiveError::Cancelled);
    }
}
