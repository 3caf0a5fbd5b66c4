//! 云端委托：本地无法处理的命令交给远程服务
//!
//! 接口：`POST {endpoint}`，body 为 CloudRequest，返回 `{"reply": "..."}`。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::core::session::Command;
use crate::core::HiveError;
use crate::memory::RankedResults;

#[async_trait]
pub trait CloudDelegate: Send + Sync {
    async fn delegate(&self, command: &Command, context: &RankedResults) -> Result<String, HiveError>;
}

#[derive(Debug, Serialize)]
struct CloudRequest<'a> {
    intent: &'a str,
    arguments: &'a str,
    utterance: &'a str,
    confidence: f32,
    /// 记忆上下文（只带 key 与 payload）
    context: Vec<ContextItem<'a>>,
}

#[derive(Debug, Serialize)]
struct ContextItem<'a> {
    key: &'a str,
    payload: &'a str,
    tier: &'a str,
    score: f32,
}

#[derive(Debug, Deserialize)]
struct CloudReply {
    reply: String,
}

pub struct HttpCloudDelegate {
    endpoint: String,
    client: Client,
}

impl HttpCloudDelegate {
    /// `timeout` 作为 HTTP 客户端超时；Router 另有自己的超时
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, HiveError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HiveError::CloudUnavailable(e.to_string()))?;
        Ok(Self {
            endpoint: endpoint.into(),
            client,
        })
    }
}

#[async_trait]
impl CloudDelegate for HttpCloudDelegate {
    async fn delegate(&self, command: &Command, context: &RankedResults) -> Result<String, HiveError> {
        let body = CloudRequest {
            intent: &command.intent,
            arguments: &command.arguments,
            utterance: &command.utterance.text,
            confidence: command.confidence,
            context: context
                .records
                .iter()
                .map(|r| ContextItem {
                    key: &r.record.key,
                    payload: &r.record.payload,
                    tier: r.tier.as_str(),
                    score: r.score,
                })
                .collect(),
        };
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| HiveError::CloudUnavailable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(HiveError::CloudUnavailable(format!("status {}", resp.status())));
        }
        let reply: CloudReply = resp
            .json()
            .await
            .map_err(|e| HiveError::CloudUnavailable(format!("malformed reply: {e}")))?;
        Ok(reply.reply)
    }
}
