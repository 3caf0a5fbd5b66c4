//! 热层：有界 LRU 缓存，精确键查找
//!
//! 写入与读取都在一把锁内完成，读自己写（read-your-writes）由此保证：
//! `insert` 返回后，任何随后的 `get(key)` 都能看到该记录（除非已被更新的写入淘汰）。
//!
//! 每个键的最新版本 id 单独记录，不随 LRU 淘汰丢失，淘汰后的重写仍能接上版本链。

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use lru::LruCache;

use super::lookup::{default_applies, TierLookup, TierQuery};
use super::record::{MemoryRecord, ScoredRecord, Tier};

/// 缓存条目
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub record: MemoryRecord,
    /// 最近一次访问（毫秒时间戳）
    pub last_accessed: i64,
    pub hits: u64,
}

/// 一次写入的结果
#[derive(Debug, Clone)]
pub struct HotInsert {
    /// 实际存入的记录（如有旧版本则为新版本）
    pub record: MemoryRecord,
    /// 被取代的旧版本 id
    pub superseded: Option<String>,
    /// 因容量被淘汰的条目
    pub evicted: Option<CacheEntry>,
}

struct HotState {
    cache: LruCache<String, CacheEntry>,
    /// key -> 最新版本 id
    latest: HashMap<String, String>,
}

pub struct HotTier {
    state: Mutex<HotState>,
    evictions: AtomicU64,
}

impl HotTier {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: Mutex::new(HotState {
                cache: LruCache::new(capacity),
                latest: HashMap::new(),
            }),
            evictions: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 写入记录；同键已有不同内容时生成新版本
    pub fn insert(&self, record: MemoryRecord) -> HotInsert {
        let now = chrono::Utc::now().timestamp_millis();
        let mut state = self.lock();

        let mut superseded = None;
        let latest = state
            .cache
            .peek(&record.key)
            .map(|e| e.record.id.clone())
            .or_else(|| state.latest.get(&record.key).cloned());
        let record = match latest {
            Some(prev) if prev != record.id && record.previous.is_none() => {
                let record = record.superseding_id(&prev);
                superseded = Some(prev);
                record
            }
            _ => record,
        };
        let record = record.resident_in(Tier::Hot);
        state.latest.insert(record.key.clone(), record.id.clone());

        let entry = CacheEntry {
            record: record.clone(),
            last_accessed: now,
            hits: 0,
        };
        let evicted = match state.cache.push(record.key.clone(), entry) {
            // push 对已有键返回旧值，不算淘汰
            Some((k, old)) if k != record.key => {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                Some(old)
            }
            _ => None,
        };

        HotInsert {
            record,
            superseded,
            evicted,
        }
    }

    /// 登记某键的最新版本 id（快照恢复时使用，不进入缓存）；已有登记时保持不变
    pub fn remember_latest(&self, key: &str, id: &str) {
        self.lock()
            .latest
            .entry(key.to_string())
            .or_insert_with(|| id.to_string());
    }

    /// 某键的最新版本 id（含已被淘汰的键）
    pub fn latest_id(&self, key: &str) -> Option<String> {
        self.lock().latest.get(key).cloned()
    }

    /// 精确键查找，命中时刷新 LRU 顺序
    pub fn get(&self, key: &str) -> Option<MemoryRecord> {
        let now = chrono::Utc::now().timestamp_millis();
        let mut state = self.lock();
        state.cache.get_mut(key).map(|entry| {
            entry.last_accessed = now;
            entry.hits += 1;
            entry.record.clone()
        })
    }

    /// 查找但不影响 LRU 顺序
    pub fn peek(&self, key: &str) -> Option<CacheEntry> {
        self.lock().cache.peek(key).cloned()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.lock().cache.contains(key)
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.lock().cache.iter().any(|(_, e)| e.record.id == id)
    }

    /// 当前缓存中的全部记录（最近使用在前）
    pub fn records(&self) -> Vec<MemoryRecord> {
        self.lock().cache.iter().map(|(_, e)| e.record.clone()).collect()
    }

    /// 清空缓存与版本登记
    pub fn clear(&self) {
        let mut state = self.lock();
        state.cache.clear();
        state.latest.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.lock().cache.cap().get()
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// 按最近使用到最久未使用排列的键
    pub fn keys_by_recency(&self) -> Vec<String> {
        self.lock().cache.iter().map(|(k, _)| k.clone()).collect()
    }
}

#[async_trait]
impl TierLookup for HotTier {
    fn tier(&self) -> Tier {
        Tier::Hot
    }

    fn applies(&self, query: &TierQuery, gathered: &[ScoredRecord]) -> bool {
        default_applies(Tier::Hot, query, gathered, 1)
    }

    async fn lookup(&self, query: &TierQuery, _gathered: &[ScoredRecord]) -> Vec<ScoredRecord> {
        query
            .key
            .as_deref()
            .and_then(|k| self.get(k))
            .map(|record| vec![ScoredRecord::new(record, Tier::Hot, 1.0)])
            .unwrap_or_default()
    }
}
