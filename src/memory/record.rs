//! 记忆记录：内容哈希 id、版本链、关系边、层驻留标记
//!
//! 记录一旦分配 id 就不再原地修改；更新会生成新版本（previous 指向旧 id）。

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// 记忆层（排序时的优先级：hot > indexed > graphed）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// 热层：有界 LRU 缓存，精确键查找
    Hot,
    /// 索引层：向量相似度检索
    Indexed,
    /// 关系层：有界深度图遍历
    Graphed,
}

impl Tier {
    /// 排序优先级，数值越大越靠前
    pub fn priority(self) -> u8 {
        match self {
            Tier::Hot => 3,
            Tier::Indexed => 2,
            Tier::Graphed => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Hot => "hot",
            Tier::Indexed => "indexed",
            Tier::Graphed => "graphed",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 层驻留标记（非互斥：一条记录可同时驻留多层）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierResidency {
    pub hot: bool,
    pub indexed: bool,
    pub graphed: bool,
}

impl TierResidency {
    pub fn only(tier: Tier) -> Self {
        let mut r = Self::default();
        r.mark(tier);
        r
    }

    pub fn mark(&mut self, tier: Tier) {
        match tier {
            Tier::Hot => self.hot = true,
            Tier::Indexed => self.indexed = true,
            Tier::Graphed => self.graphed = true,
        }
    }

    pub fn contains(&self, tier: Tier) -> bool {
        match tier {
            Tier::Hot => self.hot,
            Tier::Indexed => self.indexed,
            Tier::Graphed => self.graphed,
        }
    }

    pub fn union(self, other: Self) -> Self {
        Self {
            hot: self.hot || other.hot,
            indexed: self.indexed || other.indexed,
            graphed: self.graphed || other.graphed,
        }
    }
}

/// 关系边：relation 标签 + 目标记录 id
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Relation {
    pub relation: String,
    pub target: String,
}

/// 版本链在关系层中使用的边标签
pub const SUPERSEDES: &str = "supersedes";

/// 记忆记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// 内容哈希（key + payload + previous + 关系边 + 标签）
    pub id: String,
    /// 查找键（热层精确匹配用）
    pub key: String,
    pub payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relations: Vec<Relation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// 被本版本取代的旧版本 id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<String>,
    /// 创建时间（毫秒时间戳）
    pub created_at: i64,
    #[serde(default)]
    pub residency: TierResidency,
}

fn content_hash(
    key: &str,
    payload: &str,
    previous: Option<&str>,
    relations: &[Relation],
    tags: &[String],
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.update([0u8]);
    hasher.update(payload.as_bytes());
    hasher.update([0u8]);
    if let Some(prev) = previous {
        hasher.update(prev.as_bytes());
    }
    // 边与标签按排序后的集合参与哈希，与追加顺序无关
    let mut edges: Vec<(&str, &str)> = relations
        .iter()
        .map(|r| (r.relation.as_str(), r.target.as_str()))
        .collect();
    edges.sort_unstable();
    edges.dedup();
    hasher.update([1u8]);
    for (relation, target) in edges {
        hasher.update(relation.as_bytes());
        hasher.update([0u8]);
        hasher.update(target.as_bytes());
        hasher.update([0u8]);
    }
    let mut sorted_tags: Vec<&str> = tags.iter().map(String::as_str).collect();
    sorted_tags.sort_unstable();
    sorted_tags.dedup();
    hasher.update([2u8]);
    for tag in sorted_tags {
        hasher.update(tag.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

impl MemoryRecord {
    pub fn new(key: impl Into<String>, payload: impl Into<String>) -> Self {
        let key = key.into();
        let payload = payload.into();
        Self {
            id: content_hash(&key, &payload, None, &[], &[]),
            key,
            payload,
            embedding: None,
            relations: Vec::new(),
            tags: Vec::new(),
            previous: None,
            created_at: chrono::Utc::now().timestamp_millis(),
            residency: TierResidency::default(),
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_relation(mut self, relation: impl Into<String>, target: impl Into<String>) -> Self {
        self.relations.push(Relation {
            relation: relation.into(),
            target: target.into(),
        });
        self.rehash();
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self.rehash();
        self
    }

    pub fn with_created_at(mut self, created_at: i64) -> Self {
        self.created_at = created_at;
        self
    }

    /// 生成取代 `old` 的新版本：previous 指向旧 id，追加 supersedes 边，id 重新计算
    pub fn superseding(self, old: &MemoryRecord) -> Self {
        self.superseding_id(&old.id)
    }

    /// 同 [`superseding`](Self::superseding)，但只需旧版本 id（旧版本可能已不在热层）
    pub fn superseding_id(mut self, old_id: &str) -> Self {
        self.previous = Some(old_id.to_string());
        if !self
            .relations
            .iter()
            .any(|r| r.relation == SUPERSEDES && r.target == old_id)
        {
            self.relations.push(Relation {
                relation: SUPERSEDES.to_string(),
                target: old_id.to_string(),
            });
        }
        self.rehash();
        self
    }

    /// 按当前内容重新计算 id（外部构造的记录写入前统一调用）
    pub fn sealed(mut self) -> Self {
        self.rehash();
        self
    }

    fn rehash(&mut self) {
        self.id = content_hash(
            &self.key,
            &self.payload,
            self.previous.as_deref(),
            &self.relations,
            &self.tags,
        );
    }

    /// 返回标记为驻留在 `tier` 的副本
    pub fn resident_in(&self, tier: Tier) -> Self {
        let mut copy = self.clone();
        copy.residency = TierResidency::only(tier);
        copy
    }
}

/// 带来源层与分数的检索结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredRecord {
    pub record: MemoryRecord,
    pub tier: Tier,
    pub score: f32,
}

impl ScoredRecord {
    pub fn new(record: MemoryRecord, tier: Tier, score: f32) -> Self {
        Self { record, tier, score }
    }
}

/// 合并排序后的查询结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RankedResults {
    pub records: Vec<ScoredRecord>,
    /// 因超时被跳过的层
    #[serde(default)]
    pub skipped: Vec<Tier>,
    /// 是否所有适用层都已执行完（partial 结果为 false）
    pub complete: bool,
}

impl RankedResults {
    pub fn contains_key(&self, key: &str) -> bool {
        self.records.iter().any(|r| r.record.key == key)
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.records.iter().any(|r| r.record.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
