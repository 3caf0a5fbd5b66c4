//! 核心编排层：错误与恢复、会话状态、会话监管、主控循环、优雅关闭

pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod session;
pub mod session_supervisor;
pub mod shutdown;
pub mod state;

pub use error::{HiveError, RecoveryAction};
pub use orchestrator::{
    Operator, OperatorDeps, OperatorEvent, OperatorOptions, SessionOutcome, WakeSignal, FOLLOWS,
};
pub use recovery::RecoveryEngine;
pub use session::{clamp_confidence, Command, ExecutionTarget, Utterance, VoiceSession};
pub use session_supervisor::SessionSupervisor;
pub use shutdown::{ShutdownCoordinator, ShutdownManager, ShutdownReason};
pub use state::{OperatorSnapshot, SessionPhase};
