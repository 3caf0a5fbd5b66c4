//! 记忆控制器集成测试：读己之写、LRU 容量、层超时降级、后台传播

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use async_trait::async_trait;
    use hive::config::AppConfig;
    use hive::memory::{
        ControllerParts, GraphTier, HashingEmbedder, HotTier, IndexedTier, MemoryController, MemoryRecord,
        PropagationConfig, QueryRequest, QuerySettings, ScoredRecord, Tier, TierLookup, TierQuery, TierStore,
    };
    use hive::observability::Metrics;
    use tokio_util::sync::CancellationToken;

    /// 永远比预算慢的索引层
    struct StalledIndex;

    #[async_trait]
    impl TierLookup for StalledIndex {
        fn tier(&self) -> Tier {
            Tier::Indexed
        }

        fn applies(&self, _query: &TierQuery, _gathered: &[ScoredRecord]) -> bool {
            true
        }

        async fn lookup(&self, _query: &TierQuery, _gathered: &[ScoredRecord]) -> Vec<ScoredRecord> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Vec::new()
        }
    }

    fn metrics() -> Arc<Metrics> {
        Arc::new(Metrics::new().unwrap())
    }

    fn controller_with_capacity(capacity: usize) -> MemoryController {
        let mut cfg = AppConfig::default();
        cfg.memory.hot_capacity = capacity;
        MemoryController::from_config(&cfg, metrics()).unwrap()
    }

    #[tokio::test]
    async fn test_read_your_writes() {
        let c = controller_with_capacity(16);
        let ack = c.write(MemoryRecord::new("remember the milk", "noted"));
        // 不等待传播，热层必须立即可读
        let res = c
            .query(QueryRequest::by_key("remember the milk"), &CancellationToken::new(), None)
            .await
            .unwrap();
        assert!(res.contains_id(&ack.id));
        assert_eq!(res.records[0].tier, Tier::Hot);
    }

    #[tokio::test]
    async fn test_hot_capacity_is_bounded() {
        let c = controller_with_capacity(3);
        let mut evicted = Vec::new();
        for i in 0..5 {
            let ack = c.write(MemoryRecord::new(format!("k{i}"), "v"));
            evicted.extend(ack.evicted_key);
        }
        assert_eq!(evicted, vec!["k0".to_string(), "k1".to_string()]);
        let stats = c.stats().await;
        assert_eq!(stats.hot_entries, 3);
        assert_eq!(stats.hot_evictions, 2);
        assert!(!c.hot().contains_key("k0"));
        assert!(c.hot().contains_key("k4"));
    }

    #[tokio::test]
    async fn test_evicted_key_still_found_in_indexed_tier() {
        let c = controller_with_capacity(1);
        let first = c.write(MemoryRecord::new("open file main.rs", "opened"));
        c.write(MemoryRecord::new("close the editor", "closed"));
        assert!(c.wait_for_propagation(Duration::from_secs(5)).await);

        let res = c
            .query(QueryRequest::by_key("open file main.rs"), &CancellationToken::new(), None)
            .await
            .unwrap();
        let hit = res.records.iter().find(|r| r.record.id == first.id).unwrap();
        assert_eq!(hit.tier, Tier::Indexed);
        assert!(!hit.record.residency.hot);
    }

    #[tokio::test]
    async fn test_slow_tier_is_bounded_by_aggregate_timeout() {
        let hot = Arc::new(HotTier::new(8));
        let embedder = Arc::new(HashingEmbedder::new(32));
        let graph = Arc::new(GraphTier::new());
        let parts = ControllerParts {
            hot: hot.clone(),
            lookups: vec![
                (hot.clone() as Arc<dyn TierLookup>, Duration::from_millis(5)),
                (Arc::new(StalledIndex), Duration::from_millis(1000)),
                (graph.clone() as Arc<dyn TierLookup>, Duration::from_millis(400)),
            ],
            stores: vec![graph as Arc<dyn TierStore>],
            aggregate: Duration::from_millis(100),
            embedder,
            settings: QuerySettings::default(),
            propagation: PropagationConfig::default(),
        };
        let c = MemoryController::new(parts, metrics());
        c.write(MemoryRecord::new("status", "green"));

        let started = Instant::now();
        let res = c
            .query(QueryRequest::by_embedding(vec![0.0; 32]), &CancellationToken::new(), None)
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(!res.complete);
        assert!(res.skipped.contains(&Tier::Indexed));
        assert_eq!(c.metrics().tier_timeouts(Tier::Indexed), 1);
    }

    #[tokio::test]
    async fn test_thousand_writes_eventually_indexed() {
        let c = controller_with_capacity(100);
        for i in 0..1000 {
            c.write(MemoryRecord::new(format!("note {i}"), format!("payload {i}")));
        }
        assert!(c.wait_for_propagation(Duration::from_secs(20)).await);

        let stats = c.stats().await;
        assert_eq!(stats.hot_entries, 100);
        assert_eq!(stats.hot_evictions, 900);
        assert_eq!(stats.indexed_records, 1000);
        assert_eq!(stats.graph_nodes, 1000);
        assert_eq!(stats.pending_propagation, 0);
        assert_eq!(c.metrics().propagation_count(Tier::Indexed, "ok"), 1000);
        // 热层恰好是最近写入的 100 条，最近写入在前
        let expected: Vec<String> = (900..1000).rev().map(|i| format!("note {i}")).collect();
        assert_eq!(c.hot().keys_by_recency(), expected);
    }

    #[tokio::test]
    async fn test_rewrite_creates_new_version() {
        let c = controller_with_capacity(8);
        let v1 = c.write(MemoryRecord::new("favourite editor", "vim"));
        let v2 = c.write(MemoryRecord::new("favourite editor", "helix"));
        assert_ne!(v1.id, v2.id);
        assert_eq!(v2.previous.as_deref(), Some(v1.id.as_str()));
        assert!(c.wait_for_propagation(Duration::from_secs(5)).await);

        // 旧版本仍在索引层，热层只保留最新版本
        assert!(c.residency(&v1.id).await.indexed);
        assert!(!c.residency(&v1.id).await.hot);
        let stats = c.stats().await;
        assert_eq!(stats.hot_entries, 1);
        assert_eq!(stats.indexed_records, 2);
        assert!(stats.graph_edges >= 1);
    }

    #[tokio::test]
    async fn test_indexed_tier_standalone_store() {
        let embedder = Arc::new(HashingEmbedder::new(16));
        let tier = IndexedTier::new(embedder, 1);
        tier.put(&MemoryRecord::new("build the project", "ok")).await.unwrap();
        assert_eq!(tier.len().await, 1);
    }
}
