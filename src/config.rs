//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__MEMORY__HOT_CAPACITY=200`）。
//! 配置在进程启动时读取一次，进程生命周期内不变。

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// 配置加载 / 校验错误
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config load error: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub memory: MemorySection,
    pub timeouts: TimeoutsSection,
    pub router: RouterSection,
    pub ipc: IpcSection,
    pub endpoints: EndpointsSection,
    pub acceleration: AccelerationSection,
    pub operator: OperatorSection,
}

/// [memory] 段：热层容量、检索参数、后台传播
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    /// 热层最大条目数（超出时淘汰最久未访问）
    pub hot_capacity: usize,
    /// 索引层返回的 top-K
    pub top_k: usize,
    /// 索引层最低相似度
    pub similarity_threshold: f32,
    /// 关系层遍历最大深度
    pub graph_max_depth: u32,
    /// 合并后最多返回的条数
    pub max_results: usize,
    /// 热层命中数达到该值即视为足够，跳过索引层
    pub sufficient_hits: usize,
    /// 哈希嵌入维度
    pub embedding_dims: usize,
    /// 后台传播 worker 数
    pub propagation_workers: usize,
    /// 单层传播失败后的最大重试次数
    pub propagation_max_retries: u32,
    /// 首次重试退避（毫秒），之后翻倍
    pub propagation_backoff_ms: u64,
    /// 退避上限（毫秒）
    pub propagation_backoff_max_ms: u64,
    /// 记忆快照文件；记忆进程启动时导入、退出时保存，空字符串表示不持久化
    pub snapshot_path: Option<PathBuf>,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            hot_capacity: 256,
            top_k: 5,
            similarity_threshold: 0.35,
            graph_max_depth: 2,
            max_results: 16,
            sufficient_hits: 1,
            embedding_dims: 64,
            propagation_workers: 4,
            propagation_max_retries: 3,
            propagation_backoff_ms: 50,
            propagation_backoff_max_ms: 1000,
            snapshot_path: Some(PathBuf::from("data/memory.json")),
        }
    }
}

impl MemorySection {
    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path
            .as_deref()
            .filter(|p| !p.as_os_str().is_empty())
    }
}

/// [timeouts] 段：各层预算与聚合预算（毫秒）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutsSection {
    pub hot_ms: u64,
    pub indexed_ms: u64,
    pub graphed_ms: u64,
    /// 聚合查询超时，必须 <= 各层预算之和
    pub aggregate_ms: u64,
    /// IPC 单个请求的超时（到期由通道合成 Timeout 信封）
    pub request_ms: u64,
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            hot_ms: 5,
            indexed_ms: 150,
            graphed_ms: 400,
            aggregate_ms: 500,
            request_ms: 800,
        }
    }
}

impl TimeoutsSection {
    pub fn hot(&self) -> Duration {
        Duration::from_millis(self.hot_ms)
    }

    pub fn indexed(&self) -> Duration {
        Duration::from_millis(self.indexed_ms)
    }

    pub fn graphed(&self) -> Duration {
        Duration::from_millis(self.graphed_ms)
    }

    pub fn aggregate(&self) -> Duration {
        Duration::from_millis(self.aggregate_ms)
    }

    pub fn request(&self) -> Duration {
        Duration::from_millis(self.request_ms)
    }
}

/// [router] 段：置信度阈值与云端委托
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterSection {
    pub low_threshold: f32,
    pub high_threshold: f32,
    /// 云端委托地址；未配置时所有 cloud 目标直接走本地回退
    pub cloud_endpoint: Option<String>,
    pub cloud_timeout_ms: u64,
    /// 低置信度命令是否升级到云端（需配置 cloud_endpoint）
    pub escalate_low_confidence: bool,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            low_threshold: 0.5,
            high_threshold: 0.8,
            cloud_endpoint: None,
            cloud_timeout_ms: 3000,
            escalate_low_confidence: false,
        }
    }
}

/// [ipc] 段：背压上限、帧大小、记忆进程路径
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IpcSection {
    /// 每个方向最多未完成请求数
    pub max_outstanding: usize,
    /// 单帧（一行 JSON）最大字节数
    pub max_frame_bytes: usize,
    /// hive-memd 可执行文件路径，未设置时在当前可执行文件旁查找
    pub memd_path: Option<PathBuf>,
}

impl Default for IpcSection {
    fn default() -> Self {
        Self {
            max_outstanding: 32,
            max_frame_bytes: 4 * 1024 * 1024,
            memd_path: None,
        }
    }
}

/// [endpoints] 段：外部索引层 / 关系层协作方地址；未设置时使用进程内存储
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct EndpointsSection {
    pub indexed: Option<String>,
    pub graphed: Option<String>,
}

/// [acceleration] 段：GPU 开关，对本核心不透明，仅透传给转写 / 合成协作方
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AccelerationSection {
    pub gpu_enabled: bool,
}

/// [operator] 段：查询时附带的关系提示、模拟播放速度
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OperatorSection {
    pub relation_hint: Option<String>,
    /// 控制台合成器每个字符的播放时长（毫秒），0 表示立即播放完
    pub speak_ms_per_char: u64,
}

impl Default for OperatorSection {
    fn default() -> Self {
        Self {
            relation_hint: Some("follows".to_string()),
            speak_ms_per_char: 15,
        }
    }
}

impl AppConfig {
    /// 校验跨字段约束
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.timeouts;
        let tier_sum = t.hot_ms + t.indexed_ms + t.graphed_ms;
        if t.aggregate_ms > tier_sum {
            return Err(ConfigError::Invalid(format!(
                "timeouts.aggregate_ms ({}) must be <= sum of tier budgets ({})",
                t.aggregate_ms, tier_sum
            )));
        }
        if t.aggregate_ms == 0 || t.request_ms == 0 {
            return Err(ConfigError::Invalid(
                "timeouts.aggregate_ms and timeouts.request_ms must be > 0".into(),
            ));
        }

        let r = &self.router;
        for (name, v) in [("low_threshold", r.low_threshold), ("high_threshold", r.high_threshold)] {
            if !(0.0..=1.0).contains(&v) {
                return Err(ConfigError::Invalid(format!("router.{name} must be within [0, 1]")));
            }
        }
        if r.low_threshold > r.high_threshold {
            return Err(ConfigError::Invalid(
                "router.low_threshold must be <= router.high_threshold".into(),
            ));
        }

        let m = &self.memory;
        if !(0.0..=1.0).contains(&m.similarity_threshold) {
            return Err(ConfigError::Invalid(
                "memory.similarity_threshold must be within [0, 1]".into(),
            ));
        }
        if m.hot_capacity == 0 || m.propagation_workers == 0 || m.top_k == 0 || m.max_results == 0 {
            return Err(ConfigError::Invalid(
                "memory.hot_capacity, propagation_workers, top_k and max_results must be > 0".into(),
            ));
        }
        if self.ipc.max_outstanding == 0 {
            return Err(ConfigError::Invalid("ipc.max_outstanding must be > 0".into()));
        }
        Ok(())
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let cfg: AppConfig = builder.build()?.try_deserialize()?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        let t = &cfg.timeouts;
        assert!(t.aggregate_ms <= t.hot_ms + t.indexed_ms + t.graphed_ms);
    }

    #[test]
    fn test_aggregate_over_tier_sum_rejected() {
        let mut cfg = AppConfig::default();
        cfg.timeouts.aggregate_ms = cfg.timeouts.hot_ms + cfg.timeouts.indexed_ms + cfg.timeouts.graphed_ms + 1;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        let mut cfg = AppConfig::default();
        cfg.router.low_threshold = 0.9;
        cfg.router.high_threshold = 0.6;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_empty_snapshot_path_disables_persistence() {
        let mut m = MemorySection::default();
        assert_eq!(m.snapshot_path(), Some(Path::new("data/memory.json")));
        m.snapshot_path = Some(PathBuf::new());
        assert!(m.snapshot_path().is_none());
        m.snapshot_path = None;
        assert!(m.snapshot_path().is_none());
    }

    #[test]
    fn test_load_from_explicit_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[memory]\nhot_capacity = 100\n\n[router]\nlow_threshold = 0.45\nhigh_threshold = 0.9\n"
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.memory.hot_capacity, 100);
        assert!((cfg.router.low_threshold - 0.45).abs() < f32::EPSILON);
        // 未出现的键保持默认值
        assert_eq!(cfg.memory.top_k, MemorySection::default().top_k);
    }
}
