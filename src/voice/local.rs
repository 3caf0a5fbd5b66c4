//! 文本替身：把终端输入当作音频，把合成结果打印到终端

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{AudioBuffer, Classification, IntentClassifier, Synthesizer, Transcriber, Transcript, VoiceOptions};
use crate::core::session::{clamp_confidence, Utterance};
use crate::core::HiveError;

/// 可在本地直接处理的动词
pub const LOCAL_VERBS: &[&str] = &["open", "close", "save", "build", "run", "test"];

/// 无法匹配本地动词时的意图（无本地处理器，路由到云端）
pub const CHAT_INTENT: &str = "chat";

const SAMPLE_RATE: u32 = 16_000;

/// 把音频字节按 UTF-8 解码为文本
///
/// 行尾可带 `@0.42` 指定转写置信度，便于在终端模拟低置信度输入。
#[derive(Debug, Clone)]
pub struct TextTranscriber {
    default_confidence: f32,
    options: VoiceOptions,
}

impl TextTranscriber {
    pub fn new(default_confidence: f32, options: VoiceOptions) -> Self {
        if options.gpu_enabled {
            tracing::debug!("GPU acceleration requested; text transcriber ignores it");
        }
        Self {
            default_confidence: default_confidence.clamp(0.0, 1.0),
            options,
        }
    }

    pub fn options(&self) -> VoiceOptions {
        self.options
    }
}

impl Default for TextTranscriber {
    fn default() -> Self {
        Self::new(0.9, VoiceOptions::default())
    }
}

fn split_confidence(text: &str) -> (&str, Option<f32>) {
    if let Some((head, tail)) = text.rsplit_once(" @") {
        if let Ok(c) = tail.trim().parse::<f32>() {
            return (head.trim_end(), Some(clamp_confidence(c)));
        }
    }
    (text, None)
}

#[async_trait]
impl Transcriber for TextTranscriber {
    async fn transcribe(&self, audio: &AudioBuffer) -> Result<Transcript, HiveError> {
        let raw = std::str::from_utf8(&audio.data)
            .map_err(|e| HiveError::InputError(format!("audio is not text: {e}")))?;
        let (text, confidence) = split_confidence(raw.trim());
        if text.is_empty() {
            return Err(HiveError::InputError("nothing was heard".into()));
        }
        Ok(Transcript {
            text: text.to_string(),
            confidence: confidence.unwrap_or(self.default_confidence),
        })
    }
}

/// 关键词分类：首词为本地动词时置信度沿用转写置信度，句中出现动词时打折，否则归为 chat
#[derive(Debug, Clone, Default)]
pub struct KeywordClassifier;

#[async_trait]
impl IntentClassifier for KeywordClassifier {
    async fn classify(&self, utterance: &Utterance) -> Result<Classification, HiveError> {
        let text = utterance.text.trim();
        let words: Vec<String> = text.split_whitespace().map(|w| w.to_lowercase()).collect();
        if words.is_empty() {
            return Err(HiveError::ClassificationError("empty utterance".into()));
        }

        if LOCAL_VERBS.contains(&words[0].as_str()) {
            let arguments = text
                .split_once(char::is_whitespace)
                .map(|(_, rest)| rest.trim().to_string())
                .unwrap_or_default();
            return Ok(Classification {
                intent: words[0].clone(),
                arguments,
                confidence: utterance.confidence,
            });
        }

        if let Some(pos) = words.iter().position(|w| LOCAL_VERBS.contains(&w.as_str())) {
            return Ok(Classification {
                intent: words[pos].clone(),
                arguments: words[pos + 1..].join(" "),
                confidence: utterance.confidence * 0.6,
            });
        }

        Ok(Classification {
            intent: CHAT_INTENT.to_string(),
            arguments: text.to_string(),
            confidence: utterance.confidence * 0.5,
        })
    }
}

/// 控制台合成：打印回复，并按字符数模拟播放时长
#[derive(Debug, Clone)]
pub struct ConsoleSynthesizer {
    per_char: Duration,
    options: VoiceOptions,
}

impl ConsoleSynthesizer {
    pub fn new(per_char: Duration, options: VoiceOptions) -> Self {
        Self { per_char, options }
    }

    pub fn options(&self) -> VoiceOptions {
        self.options
    }
}

#[async_trait]
impl Synthesizer for ConsoleSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<AudioBuffer, HiveError> {
        if text.is_empty() {
            return Err(HiveError::SynthesisError("empty reply".into()));
        }
        Ok(AudioBuffer::new(text.as_bytes(), SAMPLE_RATE))
    }

    async fn play(&self, audio: &AudioBuffer, cancel: &CancellationToken) -> Result<(), HiveError> {
        let text = String::from_utf8_lossy(&audio.data);
        println!("hive> {}", text);
        let duration = self.per_char.saturating_mul(text.chars().count() as u32);
        tokio::select! {
            _ = cancel.cancelled() => Err(HiveError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utt(text: &str, confidence: f32) -> Utterance {
        Utterance::new(text, confidence, "s1")
    }

    #[tokio::test]
    async fn test_transcribe_with_confidence_suffix() {
        let t = TextTranscriber::default();
        let out = t
            .transcribe(&AudioBuffer::new("open file main.rs @0.4", 16_000))
            .await
            .unwrap();
        assert_eq!(out.text, "open file main.rs");
        assert!((out.confidence - 0.4).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_transcribe_non_finite_confidence_is_zero() {
        let t = TextTranscriber::default();
        for raw in ["open x @NaN", "open x @inf", "open x @-inf"] {
            let out = t.transcribe(&AudioBuffer::new(raw, 16_000)).await.unwrap();
            assert_eq!(out.text, "open x");
            assert_eq!(out.confidence, 0.0);
        }
    }

    #[tokio::test]
    async fn test_transcribe_empty_is_input_error() {
        let t = TextTranscriber::default();
        let err = t.transcribe(&AudioBuffer::new("   ", 16_000)).await.unwrap_err();
        assert!(err.is_session_fatal());
    }

    #[tokio::test]
    async fn test_classify_leading_verb() {
        let c = KeywordClassifier;
        let out = c.classify(&utt("open file main.rs", 0.95)).await.unwrap();
        assert_eq!(out.intent, "open");
        assert_eq!(out.arguments, "file main.rs");
        assert!((out.confidence - 0.95).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_classify_embedded_verb_is_discounted() {
        let c = KeywordClassifier;
        let out = c.classify(&utt("please build the project", 1.0)).await.unwrap();
        assert_eq!(out.intent, "build");
        assert_eq!(out.arguments, "the project");
        assert!(out.confidence < 0.7);
    }

    #[tokio::test]
    async fn test_classify_chat_fallback() {
        let c = KeywordClassifier;
        let out = c.classify(&utt("what's the weather tomorrow", 0.9)).await.unwrap();
        assert_eq!(out.intent, CHAT_INTENT);
        assert!((out.confidence - 0.45).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_play_stops_on_cancel() {
        let s = ConsoleSynthesizer::new(Duration::from_millis(100), VoiceOptions::default());
        let audio = s.synthesize("a long reply that takes a while").await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(s.play(&audio, &cancel).await, Err(HiveError::Cancelled));
    }
}
