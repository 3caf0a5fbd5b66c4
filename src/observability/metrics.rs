//! Prometheus 指标
//!
//! 每个进程持有一个独立的 Registry（不使用全局静态），测试可以各自创建实例互不干扰。
//! 标签只使用有限取值（层名、信封类型、结果），不带会话 / 请求 id。

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

use crate::memory::Tier;

/// 进程内指标集合
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    ipc_requests: IntCounterVec,
    tier_lookup_seconds: HistogramVec,
    tier_timeouts: IntCounterVec,
    hot_evictions: IntCounter,
    hot_entries: IntGauge,
    propagation: IntCounterVec,
    sessions: IntCounterVec,
    cloud_calls: IntCounterVec,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let ipc_requests = IntCounterVec::new(
            Opts::new("hive_ipc_requests_total", "IPC requests by kind and outcome"),
            &["kind", "outcome"],
        )?;
        let tier_lookup_seconds = HistogramVec::new(
            HistogramOpts::new("hive_tier_lookup_seconds", "Per-tier lookup latency")
                .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
            &["tier"],
        )?;
        let tier_timeouts = IntCounterVec::new(
            Opts::new("hive_tier_timeouts_total", "Tier lookups skipped on timeout"),
            &["tier"],
        )?;
        let hot_evictions = IntCounter::new("hive_hot_evictions_total", "Hot tier LRU evictions")?;
        let hot_entries = IntGauge::new("hive_hot_entries", "Entries currently in the hot tier")?;
        let propagation = IntCounterVec::new(
            Opts::new("hive_propagation_total", "Background propagation attempts by outcome"),
            &["tier", "outcome"],
        )?;
        let sessions = IntCounterVec::new(
            Opts::new("hive_sessions_total", "Voice sessions by terminal outcome"),
            &["outcome"],
        )?;
        let cloud_calls = IntCounterVec::new(
            Opts::new("hive_cloud_calls_total", "Cloud delegation calls by outcome"),
            &["outcome"],
        )?;

        registry.register(Box::new(ipc_requests.clone()))?;
        registry.register(Box::new(tier_lookup_seconds.clone()))?;
        registry.register(Box::new(tier_timeouts.clone()))?;
        registry.register(Box::new(hot_evictions.clone()))?;
        registry.register(Box::new(hot_entries.clone()))?;
        registry.register(Box::new(propagation.clone()))?;
        registry.register(Box::new(sessions.clone()))?;
        registry.register(Box::new(cloud_calls.clone()))?;

        Ok(Self {
            registry,
            ipc_requests,
            tier_lookup_seconds,
            tier_timeouts,
            hot_evictions,
            hot_entries,
            propagation,
            sessions,
            cloud_calls,
        })
    }

    pub fn ipc_request(&self, kind: &str, outcome: &str) {
        self.ipc_requests.with_label_values(&[kind, outcome]).inc();
    }

    pub fn ipc_requests(&self, kind: &str, outcome: &str) -> u64 {
        self.ipc_requests.with_label_values(&[kind, outcome]).get()
    }

    pub fn observe_tier(&self, tier: Tier, seconds: f64) {
        self.tier_lookup_seconds
            .with_label_values(&[tier.as_str()])
            .observe(seconds);
    }

    pub fn tier_timeout(&self, tier: Tier) {
        self.tier_timeouts.with_label_values(&[tier.as_str()]).inc();
    }

    pub fn tier_timeouts(&self, tier: Tier) -> u64 {
        self.tier_timeouts.with_label_values(&[tier.as_str()]).get()
    }

    pub fn hot_eviction(&self) {
        self.hot_evictions.inc();
    }

    pub fn set_hot_entries(&self, n: usize) {
        self.hot_entries.set(n as i64);
    }

    pub fn propagation(&self, tier: Tier, outcome: &str) {
        self.propagation
            .with_label_values(&[tier.as_str(), outcome])
            .inc();
    }

    pub fn propagation_count(&self, tier: Tier, outcome: &str) -> u64 {
        self.propagation
            .with_label_values(&[tier.as_str(), outcome])
            .get()
    }

    pub fn session_finished(&self, outcome: &str) {
        self.sessions.with_label_values(&[outcome]).inc();
    }

    pub fn sessions(&self, outcome: &str) -> u64 {
        self.sessions.with_label_values(&[outcome]).get()
    }

    pub fn cloud_call(&self, outcome: &str) {
        self.cloud_calls.with_label_values(&[outcome]).inc();
    }

    /// Prometheus 文本格式导出
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            tracing::warn!("Failed to encode metrics: {}", e);
            return String::new();
        }
        String::from_utf8_lossy(&buf).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_registered_families() {
        let m = Metrics::new().unwrap();
        m.ipc_request("query", "ok");
        m.tier_timeout(Tier::Graphed);
        m.observe_tier(Tier::Hot, 0.0001);
        let text = m.render();
        assert!(text.contains("hive_ipc_requests_total"));
        assert!(text.contains("hive_tier_timeouts_total"));
        assert!(text.contains("tier=\"graphed\""));
    }

    #[test]
    fn test_independent_registries() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.tier_timeout(Tier::Indexed);
        assert_eq!(a.tier_timeouts(Tier::Indexed), 1);
        assert_eq!(b.tier_timeouts(Tier::Indexed), 0);
    }
}
