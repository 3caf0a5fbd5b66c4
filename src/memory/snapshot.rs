//! 记忆快照：JSON 文件导出与导入
//!
//! 保存时先写同目录临时文件再 rename，进程中途退出不会留下半截快照。

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;

use super::record::{MemoryRecord, TierResidency};

/// 当前快照格式版本
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("Snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot format error: {0}")]
    Format(#[from] serde_json::Error),

    #[error("Unsupported snapshot version {found} (expected {expected})")]
    Version { found: u32, expected: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub version: u32,
    /// 保存时间（毫秒时间戳）
    pub saved_at: i64,
    pub records: Vec<MemoryRecord>,
}

impl MemorySnapshot {
    /// 按 id 去重、清除驻留标记，按创建时间排序
    pub fn new(records: impl IntoIterator<Item = MemoryRecord>) -> Self {
        let mut seen = HashSet::new();
        let mut records: Vec<MemoryRecord> = records
            .into_iter()
            .filter(|r| seen.insert(r.id.clone()))
            .map(|mut r| {
                r.residency = TierResidency::default();
                r
            })
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Self {
            version: SNAPSHOT_VERSION,
            saved_at: chrono::Utc::now().timestamp_millis(),
            records,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// 每个键的最新版本 id：没有被同键其他记录取代的版本中创建最晚的一个
    pub fn latest_ids(&self) -> HashMap<String, String> {
        let superseded: HashSet<&str> = self
            .records
            .iter()
            .filter_map(|r| r.previous.as_deref())
            .collect();
        let mut latest: HashMap<&str, &MemoryRecord> = HashMap::new();
        for record in self.records.iter().filter(|r| !superseded.contains(r.id.as_str())) {
            latest
                .entry(record.key.as_str())
                .and_modify(|cur| {
                    if record.created_at > cur.created_at {
                        *cur = record;
                    }
                })
                .or_insert(record);
        }
        latest
            .into_iter()
            .map(|(k, r)| (k.to_string(), r.id.clone()))
            .collect()
    }

    pub async fn save(&self, path: &Path) -> Result<(), SnapshotError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).await?;
        }
        let json = serde_json::to_vec_pretty(self)?;
        let tmp = temp_path(path);
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// 读取快照；文件不存在返回 `None`
    pub async fn load(path: &Path) -> Result<Option<Self>, SnapshotError> {
        let raw = match fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let snapshot: Self = serde_json::from_slice(&raw)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::Version {
                found: snapshot.version,
                expected: SNAPSHOT_VERSION,
            });
        }
        Ok(Some(snapshot))
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "snapshot".into());
    name.push(".tmp");
    path.with_file_name(name)
}
