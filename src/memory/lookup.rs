//! 分层查询：每层一个检索策略，按 hot → indexed → graphed 依次执行
//!
//! - 每层有独立预算，同时受聚合预算约束（取两者较小值）
//! - 某层超时只跳过该层，记录到 `skipped`，不影响其余层
//! - 每层执行前检查取消；执行中取消也会立即返回
//! - 合并时按 id 去重，排序规则见 [`rank`]

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::record::{MemoryRecord, ScoredRecord, Tier};
use crate::observability::Metrics;

/// 关系提示中匹配任意关系的通配符
pub const ANY_RELATION: &str = "*";

/// 传给各层的已解析查询
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TierQuery {
    /// 热层精确匹配键
    pub key: Option<String>,
    /// 索引层查询向量（只给了键时由控制器嵌入得到）
    pub embedding: Option<Vec<f32>>,
    /// 关系层遍历使用的边标签
    pub relation_hint: Option<String>,
    pub top_k: usize,
    pub min_score: f32,
    pub max_depth: u32,
    /// 关系层遍历起点（远程关系层使用；本地实现直接读 gathered）
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub seeds: Vec<String>,
}

/// 单层检索策略
#[async_trait]
pub trait TierLookup: Send + Sync {
    fn tier(&self) -> Tier;

    /// 根据已收集结果判断本层是否需要执行
    fn applies(&self, query: &TierQuery, gathered: &[ScoredRecord]) -> bool;

    async fn lookup(&self, query: &TierQuery, gathered: &[ScoredRecord]) -> Vec<ScoredRecord>;
}

/// 单层存储（后台传播写入目标）
#[async_trait]
pub trait TierStore: Send + Sync {
    fn tier(&self) -> Tier;

    async fn put(&self, record: &MemoryRecord) -> Result<(), String>;

    async fn contains(&self, id: &str) -> bool;

    async fn len(&self) -> usize;

    /// 关系边数量（非关系层为 0）
    async fn edge_count(&self) -> usize {
        0
    }

    /// 本层保存的全部记录，快照导出用（远程层自行持久化，返回空）
    async fn records(&self) -> Vec<MemoryRecord> {
        Vec::new()
    }

    async fn clear(&self) {}
}

/// 各层默认的执行条件
///
/// - hot：给了键
/// - indexed：有查询向量，且热层命中不足 `sufficient_hits`
/// - graphed：给了关系提示，且已有结果可作为遍历起点
pub fn default_applies(
    tier: Tier,
    query: &TierQuery,
    gathered: &[ScoredRecord],
    sufficient_hits: usize,
) -> bool {
    match tier {
        Tier::Hot => query.key.is_some(),
        Tier::Indexed => {
            let hot_hits = gathered.iter().filter(|r| r.tier == Tier::Hot).count();
            query.embedding.is_some() && hot_hits < sufficient_hits.max(1)
        }
        Tier::Graphed => query.relation_hint.is_some() && !gathered.is_empty(),
    }
}

/// 级联执行结果
#[derive(Debug, Default)]
pub struct CascadeOutcome {
    pub gathered: Vec<ScoredRecord>,
    pub skipped: Vec<Tier>,
    pub cancelled: bool,
}

/// 按顺序执行各层检索策略
#[derive(Clone)]
pub struct Cascade {
    stages: Vec<(Arc<dyn TierLookup>, Duration)>,
    aggregate: Duration,
}

impl Cascade {
    pub fn new(aggregate: Duration) -> Self {
        Self {
            stages: Vec::new(),
            aggregate,
        }
    }

    /// 追加一层（执行顺序即追加顺序）
    pub fn stage(mut self, lookup: Arc<dyn TierLookup>, budget: Duration) -> Self {
        self.stages.push((lookup, budget));
        self
    }

    pub fn aggregate(&self) -> Duration {
        self.aggregate
    }

    /// 执行级联；每层产出结果后调用 `on_partial`
    pub async fn run<F>(
        &self,
        query: &TierQuery,
        cancel: &CancellationToken,
        metrics: Option<&Metrics>,
        mut on_partial: F,
    ) -> CascadeOutcome
    where
        F: FnMut(&[ScoredRecord]),
    {
        let started = Instant::now();
        let mut out = CascadeOutcome::default();

        for (stage, budget) in &self.stages {
            let tier = stage.tier();
            if cancel.is_cancelled() {
                out.cancelled = true;
                break;
            }
            if !stage.applies(query, &out.gathered) {
                continue;
            }

            let remaining = self.aggregate.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                tracing::debug!(%tier, "aggregate budget exhausted, skipping tier");
                out.skipped.push(tier);
                continue;
            }
            let budget = (*budget).min(remaining);

            let tier_start = Instant::now();
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    out.cancelled = true;
                    break;
                }
                r = tokio::time::timeout(budget, stage.lookup(query, &out.gathered)) => r,
            };
            if let Some(m) = metrics {
                m.observe_tier(tier, tier_start.elapsed().as_secs_f64());
            }

            match result {
                Ok(found) => {
                    tracing::debug!(%tier, hits = found.len(), "tier lookup done");
                    if !found.is_empty() {
                        out.gathered.extend(found);
                        on_partial(&out.gathered);
                    }
                }
                Err(_) => {
                    tracing::warn!(%tier, budget_ms = budget.as_millis() as u64, "tier lookup timed out, skipping");
                    if let Some(m) = metrics {
                        m.tier_timeout(tier);
                    }
                    out.skipped.push(tier);
                }
            }
        }

        out
    }
}

fn compare(a: &ScoredRecord, b: &ScoredRecord) -> Ordering {
    b.tier
        .priority()
        .cmp(&a.tier.priority())
        .then_with(|| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal))
        .then_with(|| b.record.created_at.cmp(&a.record.created_at))
        .then_with(|| a.record.id.cmp(&b.record.id))
}

/// 合并排序：层优先级 > 分数 > 新近程度 > id；按 id 去重（保留排序最靠前的一条，驻留标记取并集）
pub fn rank(gathered: Vec<ScoredRecord>, max_results: usize) -> Vec<ScoredRecord> {
    let mut best: HashMap<String, ScoredRecord> = HashMap::new();
    for item in gathered {
        match best.get_mut(&item.record.id) {
            Some(existing) => {
                let residency = existing.record.residency.union(item.record.residency);
                if compare(&item, existing) == Ordering::Less {
                    *existing = item;
                }
                existing.record.residency = residency;
            }
            None => {
                best.insert(item.record.id.clone(), item);
            }
        }
    }
    let mut ranked: Vec<ScoredRecord> = best.into_values().collect();
    ranked.sort_by(compare);
    ranked.truncate(max_results);
    ranked
}
