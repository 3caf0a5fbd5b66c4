//! IPC 通道集成测试：进程内 duplex 传输上跑真实的 serve + IpcClient

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use hive::config::AppConfig;
    use hive::core::HiveError;
    use hive::ipc::{serve, EnvelopeKind, IpcClient, IpcClientConfig, IpcEnvelope, ServerConfig, Transport};
    use hive::memory::{
        ControllerParts, HashingEmbedder, HotTier, MemoryController, MemoryRecord, PropagationConfig,
        QueryRequest, QuerySettings, ScoredRecord, Tier, TierLookup, TierQuery,
    };
    use hive::observability::Metrics;
    use tokio::io::AsyncWriteExt;
    use tokio::task::JoinHandle;
    use tokio_util::sync::CancellationToken;

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
            tokio::time::sleep(Duration::from_secs(10)).await;
            Vec::new()
        }
    }

    fn default_controller() -> Arc<MemoryController> {
        let metrics = Arc::new(Metrics::new().unwrap());
        Arc::new(MemoryController::from_config(&AppConfig::default(), metrics).unwrap())
    }

    /// 索引层会卡住 5 秒以上的控制器（聚合预算放宽到 5 秒）
    fn stalled_controller() -> Arc<MemoryController> {
        let hot = Arc::new(HotTier::new(8));
        let parts = ControllerParts {
            hot: hot.clone(),
            lookups: vec![
                (hot as Arc<dyn TierLookup>, Duration::from_millis(5)),
                (Arc::new(StalledIndex), Duration::from_secs(5)),
            ],
            stores: Vec::new(),
            aggregate: Duration::from_secs(5),
            embedder: Arc::new(HashingEmbedder::new(16)),
            settings: QuerySettings::default(),
            propagation: PropagationConfig::default(),
        };
        Arc::new(MemoryController::new(parts, Arc::new(Metrics::new().unwrap())))
    }

    struct Harness {
        client: IpcClient,
        shutdown: CancellationToken,
        server: JoinHandle<Result<(), HiveError>>,
    }

    fn start(controller: Arc<MemoryController>, client_cfg: IpcClientConfig, server_cfg: ServerConfig) -> Harness {
        let (client_side, server_side) = Transport::pair(64 * 1024);
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve(controller, server_side, server_cfg, shutdown.clone()));
        let client = IpcClient::connect(client_side, client_cfg, None);
        Harness {
            client,
            shutdown,
            server,
        }
    }

    fn client_cfg(max_outstanding: usize, timeout_ms: u64) -> IpcClientConfig {
        IpcClientConfig {
            max_outstanding,
            request_timeout: Duration::from_millis(timeout_ms),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_concurrent_replies_match_correlation_ids() {
        let h = start(default_controller(), client_cfg(8, 2000), ServerConfig::default());
        let a = h.client.write(MemoryRecord::new("alpha", "1")).await.unwrap();
        let b = h.client.write(MemoryRecord::new("beta", "2")).await.unwrap();

        let never = CancellationToken::new();
        let qa = QueryRequest::by_key("alpha");
        let qb = QueryRequest::by_key("beta");
        let (ra, rb) = tokio::join!(
            h.client.query(&qa, &never, |_| {}),
            h.client.query(&qb, &never, |_| {}),
        );
        assert_eq!(ra.unwrap().records[0].record.id, a.id);
        assert_eq!(rb.unwrap().records[0].record.id, b.id);
        assert_eq!(h.client.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_partials_arrive_before_single_terminal() {
        let h = start(default_controller(), client_cfg(8, 2000), ServerConfig::default());
        h.client.write(MemoryRecord::new("open file main.rs", "opened")).await.unwrap();

        let mut stream = h
            .client
            .request(EnvelopeKind::Query, &QueryRequest::by_key("open file main.rs"))
            .await
            .unwrap();
        let mut kinds = Vec::new();
        while let Some(env) = stream.next().await {
            kinds.push(env.kind);
        }
        assert!(kinds.len() >= 2);
        assert_eq!(kinds[0], EnvelopeKind::PartialResult);
        assert_eq!(*kinds.last().unwrap(), EnvelopeKind::Result);
        assert_eq!(kinds.iter().filter(|k| k.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn test_client_saturation_fails_fast() {
        let h = start(stalled_controller(), client_cfg(1, 5000), ServerConfig::default());
        let _first = h
            .client
            .request(EnvelopeKind::Query, &QueryRequest::by_key("slow"))
            .await
            .unwrap();
        let err = h
            .client
            .request(EnvelopeKind::Query, &QueryRequest::by_key("slow"))
            .await
            .err()
            .unwrap();
        assert_eq!(err, HiveError::ChannelSaturated);
    }

    #[tokio::test]
    async fn test_server_saturation_replies_error() {
        let server_cfg = ServerConfig {
            max_outstanding: 1,
            ..Default::default()
        };
        let h = start(stalled_controller(), client_cfg(4, 5000), server_cfg);
        let _first = h
            .client
            .request(EnvelopeKind::Query, &QueryRequest::by_key("slow"))
            .await
            .unwrap();
        // 保证第一个请求先被服务端接收
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = h
            .client
            .query(&QueryRequest::by_key("slow"), &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert_eq!(err, HiveError::ChannelSaturated);
    }

    #[tokio::test]
    async fn test_timeout_synthesizes_terminal() {
        let h = start(stalled_controller(), client_cfg(4, 100), ServerConfig::default());
        let mut stream = h
            .client
            .request(EnvelopeKind::Query, &QueryRequest::by_key("slow"))
            .await
            .unwrap();
        let env = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(env.kind, EnvelopeKind::Timeout);
        assert!(stream.next().await.is_none());

        let err = h
            .client
            .query(&QueryRequest::by_key("slow"), &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert_eq!(err, HiveError::RequestTimeout);
    }

    #[tokio::test]
    async fn test_cancel_delivers_cancel_and_drops_late_reply() {
        let h = start(stalled_controller(), client_cfg(4, 5000), ServerConfig::default());
        let mut stream = h
            .client
            .request(EnvelopeKind::Query, &QueryRequest::by_key("slow"))
            .await
            .unwrap();
        let corr = stream.correlation_id().to_string();
        h.client.cancel(&corr).await;

        let env = stream.next().await.unwrap();
        assert_eq!(env.kind, EnvelopeKind::Cancel);
        assert_eq!(env.correlation_id, corr);
        assert!(stream.next().await.is_none());
        assert_eq!(h.client.outstanding(), 0);

        // 服务端随后的 Cancel 终止信封被丢弃，通道仍可用
        tokio::time::sleep(Duration::from_millis(50)).await;
        let ack = h.client.write(MemoryRecord::new("after", "cancel")).await.unwrap();
        assert_eq!(ack.key, "after");
    }

    #[tokio::test]
    async fn test_query_cancel_token() {
        let h = start(stalled_controller(), client_cfg(4, 5000), ServerConfig::default());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let err = h
            .client
            .query(&QueryRequest::by_key("slow"), &cancel, |_| {})
            .await
            .unwrap_err();
        assert_eq!(err, HiveError::Cancelled);
    }

    #[tokio::test]
    async fn test_server_exit_closes_channel() {
        let h = start(stalled_controller(), client_cfg(4, 5000), ServerConfig::default());
        let mut stream = h
            .client
            .request(EnvelopeKind::Query, &QueryRequest::by_key("slow"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        h.shutdown.cancel();
        h.server.await.unwrap().unwrap();

        // 在途请求恰好收到一个终止信封
        let env = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(env.kind, EnvelopeKind::Cancel | EnvelopeKind::Error));
        assert!(stream.next().await.is_none());

        tokio::time::timeout(Duration::from_secs(2), h.client.closed())
            .await
            .unwrap();
        let err = h.client.write(MemoryRecord::new("k", "v")).await.unwrap_err();
        assert_eq!(err, HiveError::ChannelClosed);
    }

    #[tokio::test]
    async fn test_dropping_last_client_closes_channel() {
        let h = start(default_controller(), client_cfg(4, 2000), ServerConfig::default());
        h.client.write(MemoryRecord::new("k", "v")).await.unwrap();

        // 仅释放一个克隆时通道保持可用
        let extra = h.client.clone();
        drop(extra);
        let ack = h.client.write(MemoryRecord::new("k2", "v2")).await.unwrap();
        assert_eq!(ack.key, "k2");

        drop(h.client);
        let served = tokio::time::timeout(Duration::from_secs(2), h.server)
            .await
            .expect("server should observe EOF once the client is gone");
        assert!(served.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_malformed_line_is_skipped() {
        let (mut client_side, server_side) = Transport::pair(64 * 1024);
        let shutdown = CancellationToken::new();
        tokio::spawn(serve(default_controller(), server_side, ServerConfig::default(), shutdown.clone()));

        client_side.writer.write_all(b"this is not json\n").await.unwrap();
        let (mut reader, mut writer) = client_side.split(4096);
        let request = IpcEnvelope::request(EnvelopeKind::Query, &QueryRequest::by_key("nothing")).unwrap();
        writer.send(&request).await.unwrap();

        let reply = reader.next().await.unwrap().unwrap();
        assert_eq!(reply.correlation_id, request.correlation_id);
        assert_eq!(reply.kind, EnvelopeKind::Result);
        shutdown.cancel();
    }
}
