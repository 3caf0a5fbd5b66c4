//! Hive - 语音操作员核心
//!
//! 两个进程：前台操作员（hive）负责唤醒、转写、分类、路由与播报；
//! 记忆进程（hive-memd）持有分层记忆，双方通过 stdio 上的 JSON 行信封通信。
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误与恢复、会话状态机、会话监管、主控循环、优雅关闭
//! - **ipc**: 信封格式、行分帧传输、带关联 id 的客户端与服务端
//! - **memory**: 热层 / 索引层 / 关系层、级联检索、后台传播
//! - **observability**: 日志、Prometheus 指标、健康报告
//! - **router**: 本地处理器注册表、云端委托、命令路由
//! - **voice**: 转写 / 分类 / 合成接口与文本替身

pub mod config;
pub mod core;
pub mod ipc;
pub mod memory;
pub mod observability;
pub mod router;
pub mod voice;
