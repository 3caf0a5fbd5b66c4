//! 会话数据：话语、命令、单次语音会话

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::state::SessionPhase;

static NEXT_UTTERANCE_SEQ: AtomicU64 = AtomicU64::new(1);

/// 一次转写得到的话语；sequence 在进程内单调递增
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Utterance {
    pub text: String,
    pub confidence: f32,
    pub sequence: u64,
    pub session_id: String,
}

impl Utterance {
    pub fn new(text: impl Into<String>, confidence: f32, session_id: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            confidence: clamp_confidence(confidence),
            sequence: NEXT_UTTERANCE_SEQ.fetch_add(1, Ordering::Relaxed),
            session_id: session_id.into(),
        }
    }

    /// 用作记忆键：小写、合并空白
    pub fn normalized(&self) -> String {
        normalize_text(&self.text)
    }
}

/// 置信度规整到 [0, 1]；NaN 与无穷视为 0
pub fn clamp_confidence(confidence: f32) -> f32 {
    if confidence.is_finite() {
        confidence.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// 执行目标
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionTarget {
    Local,
    Cloud,
}

impl ExecutionTarget {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionTarget::Local => "local",
            ExecutionTarget::Cloud => "cloud",
        }
    }
}

/// 分类并路由后的命令
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub intent: String,
    pub arguments: String,
    pub target: ExecutionTarget,
    pub confidence: f32,
    /// 置信度介于低 / 高阈值之间（或低于低阈值），处理方可要求确认
    pub low_confidence: bool,
    pub utterance: Utterance,
}

/// 单次语音会话：从唤醒开始，到回复播完 / 出错 / 被取消结束
#[derive(Debug)]
pub struct VoiceSession {
    pub id: String,
    pub phase: SessionPhase,
    pub utterance: Option<Utterance>,
    pub command: Option<Command>,
    pub reply: Option<String>,
    pub cancel: CancellationToken,
    pub started_at: Instant,
}

impl VoiceSession {
    /// 唤醒时创建，初始阶段为 Capturing
    pub fn begin(cancel: CancellationToken) -> Self {
        Self {
            id: format!("session_{}", uuid::Uuid::new_v4()),
            phase: SessionPhase::Capturing,
            utterance: None,
            command: None,
            reply: None,
            cancel,
            started_at: Instant::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_is_monotonic() {
        let a = Utterance::new("a", 0.9, "s");
        let b = Utterance::new("b", 0.9, "s");
        assert!(b.sequence > a.sequence);
    }

    #[test]
    fn test_normalized_key() {
        let u = Utterance::new("  Open   File main.rs ", 0.9, "s");
        assert_eq!(u.normalized(), "open file main.rs");
    }

    #[test]
    fn test_confidence_clamped() {
        assert_eq!(Utterance::new("x", 1.7, "s").confidence, 1.0);
        assert_eq!(Utterance::new("x", f32::NAN, "s").confidence, 0.0);
        assert_eq!(Utterance::new("x", f32::INFINITY, "s").confidence, 0.0);
    }

    #[test]
    fn test_session_starts_capturing() {
        let s = VoiceSession::begin(CancellationToken::new());
        assert_eq!(s.phase, SessionPhase::Capturing);
        assert!(s.id.starts_with("session_"));
    }
}
