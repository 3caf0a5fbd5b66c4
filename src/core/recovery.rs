//! 错误恢复引擎
//!
//! 根据 HiveError 返回 RecoveryAction：致命错误播报有限长度的道歉，层级 / 云端 / 饱和错误降级继续，取消静默结束。

use crate::core::{HiveError, RecoveryAction};

/// 播报文本的最大字符数
pub const MAX_SPOKEN_CHARS: usize = 240;

pub const APOLOGY_INPUT: &str = "Sorry, I didn't catch that. Please try again.";
pub const APOLOGY_CHANNEL: &str = "Sorry, my memory is unavailable right now.";
pub const APOLOGY_GENERIC: &str = "Sorry, something went wrong.";
pub const NOTICE_DEGRADED: &str = "I'm answering without my notes right now.";

/// 截断到 MAX_SPOKEN_CHARS（按字符），超长时以省略号结尾
pub fn bounded(text: &str) -> String {
    if text.chars().count() <= MAX_SPOKEN_CHARS {
        return text.to_string();
    }
    let mut out: String = text.chars().take(MAX_SPOKEN_CHARS - 3).collect();
    out.push_str("...");
    out
}

#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &HiveError) -> RecoveryAction {
        match err {
            HiveError::InputError(_) => RecoveryAction::Apologize(APOLOGY_INPUT.to_string()),
            HiveError::ChannelClosed => RecoveryAction::Apologize(APOLOGY_CHANNEL.to_string()),
            HiveError::SynthesisError(_) => RecoveryAction::Apologize(APOLOGY_GENERIC.to_string()),
            HiveError::ChannelSaturated => RecoveryAction::Degrade(Some(NOTICE_DEGRADED.to_string())),
            HiveError::TierTimeout(_)
            | HiveError::RequestTimeout
            | HiveError::Remote { .. }
            | HiveError::Protocol(_)
            | HiveError::ClassificationError(_)
            | HiveError::ClassificationLowConfidence { .. }
            | HiveError::MemoryWritePropagationFailure { .. }
            | HiveError::CloudUnavailable(_) => RecoveryAction::Degrade(None),
            HiveError::Cancelled => RecoveryAction::Abort,
        }
    }
}
