//! 分层记忆：热层（LRU 精确键）、索引层（向量相似度）、关系层（图遍历）
//!
//! 写入先落热层，再由后台传播池推送到索引层与关系层；查询按层级联、受预算约束。
//! 进程退出时记录可导出为 JSON 快照，启动时再导入。

pub mod controller;
pub mod embedding;
pub mod graph;
pub mod hot;
pub mod indexed;
pub mod lookup;
pub mod propagation;
pub mod record;
pub mod remote;
pub mod snapshot;

pub use controller::{
    ControllerParts, MemoryController, MemoryStats, QueryRequest, QuerySettings, QueryTarget,
    WriteAck, WriteRequest,
};
pub use embedding::{cosine_similarity, EmbeddingProvider, HashingEmbedder};
pub use graph::GraphTier;
pub use hot::{CacheEntry, HotInsert, HotTier};
pub use indexed::IndexedTier;
pub use lookup::{rank, Cascade, TierLookup, TierQuery, TierStore, ANY_RELATION};
pub use propagation::{PropagationConfig, PropagationPool};
pub use record::{MemoryRecord, RankedResults, Relation, ScoredRecord, Tier, TierResidency, SUPERSEDES};
pub use remote::RemoteTier;
pub use snapshot::{MemorySnapshot, SnapshotError, SNAPSHOT_VERSION};
