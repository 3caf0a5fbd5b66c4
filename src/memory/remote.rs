//! 远程层：索引层 / 关系层由外部服务承担时的 HTTP 适配
//!
//! 约定接口（JSON）：
//! - `POST {base}/records`        body: MemoryRecord
//! - `POST {base}/query`          body: TierQuery，返回 `Vec<ScoredRecord>`
//! - `GET  {base}/records/{id}`   200 存在 / 404 不存在
//! - `GET  {base}/stats`          返回 `{"count": n}`

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use super::lookup::{default_applies, TierLookup, TierQuery, TierStore};
use super::record::{MemoryRecord, ScoredRecord, Tier};

#[derive(Deserialize)]
struct StatsBody {
    count: usize,
}

pub struct RemoteTier {
    tier: Tier,
    base_url: String,
    client: Client,
    sufficient_hits: usize,
}

impl RemoteTier {
    pub fn new(
        tier: Tier,
        base_url: impl Into<String>,
        request_timeout: Duration,
        sufficient_hits: usize,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            tier,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            sufficient_hits,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }
}

#[async_trait]
impl TierStore for RemoteTier {
    fn tier(&self) -> Tier {
        self.tier
    }

    async fn put(&self, record: &MemoryRecord) -> Result<(), String> {
        let resp = self
            .client
            .post(self.url("records"))
            .json(record)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(format!("{} returned {}", self.base_url, resp.status()))
        }
    }

    async fn contains(&self, id: &str) -> bool {
        match self.client.get(self.url(&format!("records/{id}"))).send().await {
            Ok(resp) => resp.status() == StatusCode::OK,
            Err(e) => {
                tracing::debug!(tier = %self.tier, "Remote contains failed: {}", e);
                false
            }
        }
    }

    async fn len(&self) -> usize {
        let resp = match self.client.get(self.url("stats")).send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(tier = %self.tier, "Remote stats failed: {}", e);
                return 0;
            }
        };
        resp.json::<StatsBody>().await.map(|b| b.count).unwrap_or(0)
    }
}

#[async_trait]
impl TierLookup for RemoteTier {
    fn tier(&self) -> Tier {
        self.tier
    }

    fn applies(&self, query: &TierQuery, gathered: &[ScoredRecord]) -> bool {
        default_applies(self.tier, query, gathered, self.sufficient_hits)
    }

    async fn lookup(&self, query: &TierQuery, gathered: &[ScoredRecord]) -> Vec<ScoredRecord> {
        let mut body = query.clone();
        if self.tier == Tier::Graphed {
            body.seeds.extend(gathered.iter().map(|r| r.record.id.clone()));
        }
        let resp = match self.client.post(self.url("query")).json(&body).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                tracing::warn!(tier = %self.tier, status = %r.status(), "Remote tier query rejected");
                return Vec::new();
            }
            Err(e) => {
                tracing::warn!(tier = %self.tier, "Remote tier query failed: {}", e);
                return Vec::new();
            }
        };
        match resp.json::<Vec<ScoredRecord>>().await {
            Ok(hits) => hits
                .into_iter()
                .map(|mut h| {
                    h.tier = self.tier;
                    h.record.residency.mark(self.tier);
                    h
                })
                .collect(),
            Err(e) => {
                tracing::warn!(tier = %self.tier, "Remote tier returned malformed body: {}", e);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joins_without_double_slash() {
        let t = RemoteTier::new(Tier::Indexed, "http://127.0.0.1:6333/", Duration::from_millis(50), 1).unwrap();
        assert_eq!(t.url("query"), "http://127.0.0.1:6333/query");
    }

    #[tokio::test]
    async fn test_unreachable_remote_degrades_to_empty() {
        // 端口 9 (discard) 通常无服务监听
        let t = RemoteTier::new(Tier::Graphed, "http://127.0.0.1:9", Duration::from_millis(200), 1).unwrap();
        let q = TierQuery {
            relation_hint: Some("follows".into()),
            ..Default::default()
        };
        assert!(t.lookup(&q, &[]).await.is_empty());
        assert!(!t.contains("x").await);
        assert!(t.put(&MemoryRecord::new("k", "v")).await.is_err());
    }
}
