//! 会话阶段与对外投影
//!
//! 编排器内部维护完整的 VoiceSession；对外只暴露轻量的 OperatorSnapshot（阶段、会话 id、最近回复、错误）。

use serde::Serialize;

/// 语音会话阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Idle,
    Capturing,
    Transcribing,
    Classifying,
    AwaitingMemory,
    Dispatching,
    Synthesizing,
    Speaking,
    Error,
    Cancelled,
}

impl SessionPhase {
    /// 合法转移表
    pub fn can_transition_to(self, next: SessionPhase) -> bool {
        use SessionPhase::*;
        match (self, next) {
            (Idle, Capturing) => true,
            (Capturing, Transcribing) => true,
            (Transcribing, Classifying) => true,
            (Classifying, AwaitingMemory) => true,
            (AwaitingMemory, Dispatching) => true,
            (Dispatching, Synthesizing) => true,
            (Synthesizing, Speaking) => true,
            (Speaking, Idle) => true,
            (Error, Idle) => true,
            // 插话只在合成 / 播放阶段生效
            (Synthesizing | Speaking, Cancelled) => true,
            // 关闭时任意进行中的阶段都可取消
            (Capturing | Transcribing | Classifying | AwaitingMemory | Dispatching, Cancelled) => true,
            (Idle | Error | Cancelled, _) => false,
            (_, Error) => true,
            _ => false,
        }
    }

    /// 插话（再次唤醒）能否打断当前阶段
    pub fn accepts_barge_in(self) -> bool {
        matches!(self, SessionPhase::Synthesizing | SessionPhase::Speaking)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionPhase::Idle | SessionPhase::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Capturing => "capturing",
            SessionPhase::Transcribing => "transcribing",
            SessionPhase::Classifying => "classifying",
            SessionPhase::AwaitingMemory => "awaiting_memory",
            SessionPhase::Dispatching => "dispatching",
            SessionPhase::Synthesizing => "synthesizing",
            SessionPhase::Speaking => "speaking",
            SessionPhase::Error => "error",
            SessionPhase::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 对外投影：当前阶段与最近一次结果
#[derive(Clone, Debug, Serialize)]
pub struct OperatorSnapshot {
    pub session_id: Option<String>,
    pub phase: SessionPhase,
    pub last_reply: Option<String>,
    pub error_message: Option<String>,
}

impl Default for OperatorSnapshot {
    fn default() -> Self {
        Self {
            session_id: None,
            phase: SessionPhase::Idle,
            last_reply: None,
            error_message: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionPhase::*;

    #[test]
    fn test_happy_path_is_legal() {
        let path = [
            Idle,
            Capturing,
            Transcribing,
            Classifying,
            AwaitingMemory,
            Dispatching,
            Synthesizing,
            Speaking,
            Idle,
        ];
        for w in path.windows(2) {
            assert!(w[0].can_transition_to(w[1]), "{} -> {}", w[0], w[1]);
        }
    }

    #[test]
    fn test_no_skipping_phases() {
        assert!(!Idle.can_transition_to(Dispatching));
        assert!(!Transcribing.can_transition_to(Speaking));
        assert!(!Cancelled.can_transition_to(Capturing));
    }

    #[test]
    fn test_barge_in_phases() {
        assert!(Speaking.accepts_barge_in());
        assert!(Synthesizing.accepts_barge_in());
        assert!(!AwaitingMemory.accepts_barge_in());
        assert!(Speaking.can_transition_to(Cancelled));
    }

    #[test]
    fn test_error_reachable_and_recovers_to_idle() {
        assert!(Transcribing.can_transition_to(Error));
        assert!(Speaking.can_transition_to(Error));
        assert!(Error.can_transition_to(Idle));
        assert!(!Error.can_transition_to(Capturing));
    }
}
