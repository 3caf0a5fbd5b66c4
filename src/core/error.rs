//! 错误分类与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 HiveError 决定播报道歉 / 降级继续 / 终止会话。
//! 只有输入错误与不可恢复的通道错误是会话致命的，层级与传播错误一律降级处理。

use thiserror::Error;

use crate::memory::Tier;

/// 编排器与记忆控制器运行过程中可能出现的错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HiveError {
    /// 采集或转写失败（会话致命，播报道歉后结束）
    #[error("Input error: {0}")]
    InputError(String),

    /// 分类协作方自身失败
    #[error("Classification error: {0}")]
    ClassificationError(String),

    /// 分类置信度低（非致命，可能触发确认或云端回退）
    #[error("Classification confidence too low: {confidence:.2}")]
    ClassificationLowConfidence { confidence: f32 },

    /// 单层超时（跳过该层即可恢复）
    #[error("Tier timeout: {0}")]
    TierTimeout(Tier),

    /// 未完成请求数达到上限，发送方立即失败
    #[error("IPC channel saturated")]
    ChannelSaturated,

    /// 通道已关闭（对端进程退出等，会话致命）
    #[error("IPC channel closed")]
    ChannelClosed,

    /// 请求在通道超时前没有拿到终止信封
    #[error("IPC request timed out")]
    RequestTimeout,

    /// 对端返回 Error 信封
    #[error("Remote error [{code}]: {message}")]
    Remote { code: String, message: String },

    /// 云端不可达或超时（Router 回退到本地回复）
    #[error("Cloud unavailable: {0}")]
    CloudUnavailable(String),

    /// 后台传播失败（仅记录日志与指标，从不暴露给会话）
    #[error("Propagation to {tier} failed after {attempts} attempts: {reason}")]
    MemoryWritePropagationFailure {
        tier: Tier,
        attempts: u32,
        reason: String,
    },

    /// 合成或播放失败
    #[error("Synthesis error: {0}")]
    SynthesisError(String),

    /// 会话被插话（barge-in）或关闭取消
    #[error("Cancelled")]
    Cancelled,

    /// 信封格式或 payload 无法解析
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl HiveError {
    /// 是否会话致命：输入错误与不可恢复的通道错误
    ///
    /// 单个信封解析失败（Protocol）只影响该请求，通道仍可用，按降级处理。
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, HiveError::InputError(_) | HiveError::ChannelClosed)
    }

    /// 错误码（Error 信封的 code 字段、指标标签）
    pub fn code(&self) -> &'static str {
        match self {
            HiveError::InputError(_) => "input_error",
            HiveError::ClassificationError(_) => "classification_error",
            HiveError::ClassificationLowConfidence { .. } => "classification_low_confidence",
            HiveError::TierTimeout(_) => "tier_timeout",
            HiveError::ChannelSaturated => "channel_saturated",
            HiveError::ChannelClosed => "channel_closed",
            HiveError::RequestTimeout => "request_timeout",
            HiveError::Remote { .. } => "remote_error",
            HiveError::CloudUnavailable(_) => "cloud_unavailable",
            HiveError::MemoryWritePropagationFailure { .. } => "propagation_failure",
            HiveError::SynthesisError(_) => "synthesis_error",
            HiveError::Cancelled => "cancelled",
            HiveError::Protocol(_) => "protocol_error",
        }
    }

    /// 从 Error 信封还原：已知的通道类错误码映射回具体变体
    pub fn from_remote(code: &str, message: &str) -> Self {
        match code {
            "channel_saturated" => HiveError::ChannelSaturated,
            "cancelled" => HiveError::Cancelled,
            "protocol_error" => HiveError::Protocol(message.to_string()),
            _ => HiveError::Remote {
                code: code.to_string(),
                message: message.to_string(),
            },
        }
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// 播报有限长度的道歉并结束会话
    Apologize(String),
    /// 降级继续（跳过该层 / 本地回复），附带可选的播报提示
    Degrade(Option<String>),
    /// 静默结束（取消）
    Abort,
}
