//! 语音协作方：转写、意图分类、合成与播放
//!
//! 真实的语音模型在本核心之外；这里只定义接口，并提供文本替身（终端输入当作音频）。

pub mod local;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::core::session::Utterance;
use crate::core::HiveError;

pub use local::{ConsoleSynthesizer, KeywordClassifier, TextTranscriber, CHAT_INTENT, LOCAL_VERBS};

/// 采集到的音频（或合成结果）
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AudioBuffer {
    pub data: Vec<u8>,
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(data: impl Into<Vec<u8>>, sample_rate: u32) -> Self {
        Self {
            data: data.into(),
            sample_rate,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// 转写结果
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub text: String,
    pub confidence: f32,
}

/// 分类结果（Router 再决定执行目标）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub intent: String,
    pub arguments: String,
    pub confidence: f32,
}

/// 透传给转写 / 合成协作方的选项
#[derive(Debug, Clone, Copy, Default)]
pub struct VoiceOptions {
    pub gpu_enabled: bool,
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: &AudioBuffer) -> Result<Transcript, HiveError>;
}

#[async_trait]
pub trait IntentClassifier: Send + Sync {
    async fn classify(&self, utterance: &Utterance) -> Result<Classification, HiveError>;
}

#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<AudioBuffer, HiveError>;

    /// 播放；`cancel` 触发时应尽快停止并返回 Cancelled
    async fn play(&self, audio: &AudioBuffer, cancel: &CancellationToken) -> Result<(), HiveError>;
}
