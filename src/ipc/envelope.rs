//! IPC 信封：跨进程消息的统一格式
//!
//! 每行一个 JSON 信封；payload 为字节串，线上以 base64 编码，内容是各类请求 / 结果体的 JSON。
//! 请求信封的 correlation_id 等于自身 id，回复信封沿用请求的 correlation_id。

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::core::HiveError;

/// 信封类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Query,
    Write,
    PartialResult,
    Result,
    Error,
    Cancel,
    Timeout,
}

impl EnvelopeKind {
    /// 终止类信封：每个请求恰好收到一个
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EnvelopeKind::Result | EnvelopeKind::Error | EnvelopeKind::Cancel | EnvelopeKind::Timeout
        )
    }

    pub fn is_request(self) -> bool {
        matches!(self, EnvelopeKind::Query | EnvelopeKind::Write)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopeKind::Query => "query",
            EnvelopeKind::Write => "write",
            EnvelopeKind::PartialResult => "partial_result",
            EnvelopeKind::Result => "result",
            EnvelopeKind::Error => "error",
            EnvelopeKind::Cancel => "cancel",
            EnvelopeKind::Timeout => "timeout",
        }
    }
}

/// Error 信封的 payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

mod payload_base64 {
    use base64::{engine::general_purpose, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        general_purpose::STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// 跨进程信封
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpcEnvelope {
    pub id: String,
    pub correlation_id: String,
    pub kind: EnvelopeKind,
    #[serde(with = "payload_base64", default)]
    pub payload: Vec<u8>,
    /// 毫秒时间戳
    pub timestamp: i64,
}

fn new_id() -> String {
    format!("env_{}", uuid::Uuid::new_v4())
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl IpcEnvelope {
    fn with_payload(correlation_id: Option<String>, kind: EnvelopeKind, payload: Vec<u8>) -> Self {
        let id = new_id();
        Self {
            correlation_id: correlation_id.unwrap_or_else(|| id.clone()),
            id,
            kind,
            payload,
            timestamp: now_ms(),
        }
    }

    /// 新请求（Query / Write）
    pub fn request<T: Serialize>(kind: EnvelopeKind, body: &T) -> Result<Self, HiveError> {
        let payload = serde_json::to_vec(body).map_err(|e| HiveError::Protocol(e.to_string()))?;
        Ok(Self::with_payload(None, kind, payload))
    }

    /// 对某个请求的回复（PartialResult / Result）
    pub fn reply<T: Serialize>(
        correlation_id: &str,
        kind: EnvelopeKind,
        body: &T,
    ) -> Result<Self, HiveError> {
        let payload = serde_json::to_vec(body).map_err(|e| HiveError::Protocol(e.to_string()))?;
        Ok(Self::with_payload(Some(correlation_id.to_string()), kind, payload))
    }

    pub fn cancel(correlation_id: &str) -> Self {
        Self::with_payload(Some(correlation_id.to_string()), EnvelopeKind::Cancel, Vec::new())
    }

    pub fn timeout(correlation_id: &str) -> Self {
        Self::with_payload(Some(correlation_id.to_string()), EnvelopeKind::Timeout, Vec::new())
    }

    pub fn error(correlation_id: &str, err: &HiveError) -> Self {
        let body = ErrorBody {
            code: err.code().to_string(),
            message: err.to_string(),
        };
        // ErrorBody 只含字符串，序列化不会失败
        let payload = serde_json::to_vec(&body).unwrap_or_default();
        Self::with_payload(Some(correlation_id.to_string()), EnvelopeKind::Error, payload)
    }

    /// 解析 payload 为具体类型
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, HiveError> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| HiveError::Protocol(format!("{} payload: {}", self.kind.as_str(), e)))
    }

    /// Error 信封还原为 HiveError
    pub fn to_error(&self) -> HiveError {
        match self.decode::<ErrorBody>() {
            Ok(body) => HiveError::from_remote(&body.code, &body.message),
            Err(e) => e,
        }
    }

    pub fn to_line(&self) -> Result<String, HiveError> {
        serde_json::to_string(self).map_err(|e| HiveError::Protocol(e.to_string()))
    }

    pub fn from_line(line: &str) -> Result<Self, HiveError> {
        serde_json::from_str(line).map_err(|e| HiveError::Protocol(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::QueryRequest;

    #[test]
    fn test_request_correlates_to_itself() {
        let env = IpcEnvelope::request(EnvelopeKind::Query, &QueryRequest::by_key("k")).unwrap();
        assert_eq!(env.id, env.correlation_id);
        assert!(env.kind.is_request());
        assert!(!env.kind.is_terminal());
    }

    #[test]
    fn test_line_roundtrip_preserves_payload() {
        let env = IpcEnvelope::request(EnvelopeKind::Query, &QueryRequest::by_key("open file")).unwrap();
        let line = env.to_line().unwrap();
        assert!(!line.contains('\n'));
        let back = IpcEnvelope::from_line(&line).unwrap();
        assert_eq!(back, env);
        let req: QueryRequest = back.decode().unwrap();
        assert_eq!(req, QueryRequest::by_key("open file"));
    }

    #[test]
    fn test_error_envelope_restores_variant() {
        let env = IpcEnvelope::error("req-1", &HiveError::ChannelSaturated);
        assert_eq!(env.correlation_id, "req-1");
        assert!(env.kind.is_terminal());
        assert_eq!(env.to_error(), HiveError::ChannelSaturated);
    }

    #[test]
    fn test_garbage_line_is_protocol_error() {
        assert!(matches!(IpcEnvelope::from_line("{not json"), Err(HiveError::Protocol(_))));
    }

    #[test]
    fn test_decode_wrong_type_is_protocol_error() {
        let env = IpcEnvelope::cancel("x");
        assert!(matches!(env.decode::<QueryRequest>(), Err(HiveError::Protocol(_))));
    }
}
