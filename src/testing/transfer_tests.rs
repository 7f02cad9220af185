//! Chunk handoff scenarios between in-process ingesters.

#[cfg(test)]
mod tests {
    use crate::chunk::Chunk;
    use crate::config::ChunkConfig;
    use crate::error::{Error, TransferError};
    use crate::ring::NodeState;
    use crate::testing::{wait_for_state, TestCluster};
    use crate::transfer::{ClientFactory, TimeSeriesChunk};
    use crate::types::{Labels, Matcher, Sample, SampleStream, TimeRange, TimeSeries};
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn foo_sample() -> Vec<TimeSeries> {
        vec![TimeSeries::new(
            Labels::metric("foo"),
            vec![Sample::new(123_000, 456.0)],
        )]
    }

    #[tokio::test]
    async fn test_transfer_to_pending_peer() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("debug")
            .try_init();

        let cluster = TestCluster::new();
        let a = cluster.ingester(cluster.config("ing-a")).unwrap();
        let b = cluster
            .ingester(cluster.config("ing-b").with_join_after(None))
            .unwrap();

        a.start().await.unwrap();
        assert!(wait_for_state(&a, NodeState::Active, TIMEOUT).await);
        assert_eq!(a.push("t1", foo_sample()).unwrap().appended, 1);
        let a_tokens = a.lifecycler().tokens();

        b.start().await.unwrap();
        assert_eq!(b.state(), NodeState::Pending);

        a.stop().await.unwrap();
        assert!(wait_for_state(&b, NodeState::Active, TIMEOUT).await);

        let query = || {
            b.query(
                "t1",
                &[Matcher::metric("foo")],
                TimeRange::new(0, 200_000),
            )
            .unwrap()
        };
        let streams = query();
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].samples, vec![Sample::new(123_000, 456.0)]);

        // Re-sending the same sample to the new owner is not a duplicate point.
        let response = b.push("t1", foo_sample()).unwrap();
        assert_eq!(response.duplicates, 1);
        assert!(response.is_success());
        assert_eq!(query()[0].samples, vec![Sample::new(123_000, 456.0)]);

        // B took over A's tokens; A is gone and nothing was flushed.
        assert!(cluster.ring_instance("ing-a").await.is_none());
        let record = cluster.ring_instance("ing-b").await.unwrap();
        assert_eq!(record.state, NodeState::Active);
        assert_eq!(record.tokens, a_tokens);
        assert_eq!(cluster.sink.chunk_count(), 0);
        assert_eq!(a.series_count(), 0);
        assert_eq!(a.metrics().transfers_out.get(), 1);
        assert_eq!(b.metrics().series_received.get(), 1);
    }

    fn series(labels: Labels, samples: &[(i64, f64)]) -> TimeSeries {
        TimeSeries::new(
            labels,
            samples.iter().map(|(t, v)| Sample::new(*t, *v)).collect(),
        )
    }

    #[tokio::test]
    async fn test_transfer_keeps_every_tenant_and_chunk() {
        let cluster = TestCluster::new();
        let chunks = ChunkConfig::default().with_max_samples_per_chunk(2);
        let a = cluster
            .ingester(cluster.config("ing-a").with_chunk_config(chunks.clone()))
            .unwrap();
        let b = cluster
            .ingester(
                cluster
                    .config("ing-b")
                    .with_join_after(None)
                    .with_chunk_config(chunks),
            )
            .unwrap();

        a.start().await.unwrap();
        assert!(wait_for_state(&a, NodeState::Active, TIMEOUT).await);
        let foo = Labels::metric("foo");
        let bar = Labels::from_pairs([("__name__", "bar"), ("job", "api")]);
        let pushed = [
            (
                "t1",
                vec![
                    series(
                        foo.clone(),
                        &[(1_000, 1.0), (2_000, 2.0), (3_000, 3.0), (4_000, 4.0), (5_000, 5.0)],
                    ),
                    series(bar.clone(), &[(1_500, 7.0)]),
                ],
            ),
            (
                "t2",
                vec![series(bar.clone(), &[(10_000, 1.5), (11_000, 2.5), (12_000, 3.5)])],
            ),
        ];
        for (tenant, batch) in pushed {
            assert!(a.push(tenant, batch).unwrap().is_success());
        }

        let snapshot = |ing: &crate::Ingester| -> Vec<(&'static str, Vec<SampleStream>)> {
            ["t1", "t2"]
                .into_iter()
                .map(|t| (t, ing.query(t, &[], TimeRange::all()).unwrap()))
                .collect()
        };
        let before = snapshot(&a);
        assert_eq!(before[0].1.len(), 2);
        assert_eq!(before[0].1[1].samples.len(), 5);
        assert_eq!(before[1].1.len(), 1);

        b.start().await.unwrap();
        a.stop().await.unwrap();
        assert!(wait_for_state(&b, NodeState::Active, TIMEOUT).await);

        assert_eq!(snapshot(&b), before);
        assert_eq!(b.series_count(), 3);
        assert_eq!(b.metrics().series_received.get(), 3);
        assert_eq!(a.metrics().transfers_out.get(), 1);
        assert_eq!(cluster.sink.chunk_count(), 0);

        // Heads arrive open: the next sample of foo still lands after 5000.
        let response = b.push("t1", vec![series(foo.clone(), &[(6_000, 6.0)])]).unwrap();
        assert_eq!(response.appended, 1);
        let response = b.push("t1", vec![series(foo, &[(4_500, 0.0)])]).unwrap();
        assert_eq!(response.failures.len(), 1);
    }

    #[tokio::test]
    async fn test_abandoned_stream_leaves_peer_pending() {
        let cluster = TestCluster::new();
        let b = cluster
            .ingester(cluster.config("ing-b").with_join_after(None))
            .unwrap();
        b.start().await.unwrap();

        let client = cluster.network.connect(b.addr()).await.unwrap();
        let mut stream = client.transfer_chunks().await.unwrap();
        let chunk = Chunk::from_samples(vec![Sample::new(1_000, 1.0), Sample::new(2_000, 2.0)]);
        stream
            .send(TimeSeriesChunk::new("ing-a", "t1", Labels::metric("foo"), &[chunk]))
            .await
            .unwrap();
        assert!(wait_for_state(&b, NodeState::Joining, TIMEOUT).await);

        drop(stream);
        assert!(wait_for_state(&b, NodeState::Pending, TIMEOUT).await);
        assert_eq!(b.series_count(), 0);
        assert!(b.lifecycler().tokens().is_empty());
        let record = cluster.ring_instance("ing-b").await.unwrap();
        assert_eq!(record.state, NodeState::Pending);
        assert!(record.tokens.is_empty());
    }

    #[tokio::test]
    async fn test_retry_moves_to_next_pending_peer() {
        let cluster = TestCluster::new();
        let mut config = cluster.config("ing-a");
        config.lifecycler.heartbeat_timeout = Duration::from_millis(500);
        config.transfer.min_backoff = Duration::from_secs(1);
        config.transfer.max_backoff = Duration::from_secs(1);
        let a = cluster.ingester(config).unwrap();
        let d = cluster.ingester(cluster.config("ing-d")).unwrap();
        let b = cluster
            .ingester(cluster.config("ing-b").with_join_after(None))
            .unwrap();

        a.start().await.unwrap();
        d.start().await.unwrap();
        assert!(wait_for_state(&a, NodeState::Active, TIMEOUT).await);
        assert!(wait_for_state(&d, NodeState::Active, TIMEOUT).await);
        a.push("t1", foo_sample()).unwrap();
        let a_tokens = a.lifecycler().tokens();

        // A stale record that points at an active node. It is the oldest
        // pending registration, so the first attempt picks it and is refused.
        cluster.ring().register("ing-ghost", d.addr()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        b.start().await.unwrap();

        a.stop().await.unwrap();
        assert!(wait_for_state(&b, NodeState::Active, TIMEOUT).await);

        assert_eq!(a.metrics().transfers_failed.get(), 1);
        assert_eq!(a.metrics().transfers_out.get(), 1);
        assert_eq!(d.state(), NodeState::Active);
        assert_eq!(d.series_count(), 0);
        assert_eq!(
            b.query("t1", &[Matcher::metric("foo")], TimeRange::all()).unwrap()[0].samples,
            vec![Sample::new(123_000, 456.0)]
        );
        assert_eq!(cluster.ring_instance("ing-b").await.unwrap().tokens, a_tokens);
        assert_eq!(cluster.sink.chunk_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_transfer_rejected() {
        let cluster = TestCluster::new();
        let b = cluster
            .ingester(cluster.config("ing-b").with_join_after(None))
            .unwrap();
        b.start().await.unwrap();

        let client = cluster.network.connect(b.addr()).await.unwrap();
        let mut stream = client.transfer_chunks().await.unwrap();
        let result = stream.close_and_recv().await;
        assert!(matches!(
            result,
            Err(Error::Transfer(TransferError::Remote(_)))
        ));

        assert_eq!(b.state(), NodeState::Pending);
        assert!(b.lifecycler().tokens().is_empty());
        let record = cluster.ring_instance("ing-b").await.unwrap();
        assert_eq!(record.state, NodeState::Pending);
        assert!(record.tokens.is_empty());
    }

    #[tokio::test]
    async fn test_transfer_refused_by_active_node() {
        let cluster = TestCluster::new();
        let b = cluster.ingester(cluster.config("ing-b")).unwrap();
        b.start().await.unwrap();
        assert!(wait_for_state(&b, NodeState::Active, TIMEOUT).await);

        let client = cluster.network.connect(b.addr()).await.unwrap();
        let mut stream = client.transfer_chunks().await.unwrap();
        let _ = stream
            .send(TimeSeriesChunk::new("ing-a", "t1", Labels::metric("foo"), &[]))
            .await;
        let result = stream.close_and_recv().await;
        assert!(matches!(
            result,
            Err(Error::Transfer(TransferError::Remote(m))) if m.contains("not pending")
        ));
        assert_eq!(b.state(), NodeState::Active);
    }

    #[tokio::test]
    async fn test_falls_back_to_flush_without_peer() {
        let cluster = TestCluster::new();
        let a = cluster.ingester(cluster.config("ing-a")).unwrap();
        a.start().await.unwrap();
        assert!(wait_for_state(&a, NodeState::Active, TIMEOUT).await);
        a.push("t1", foo_sample()).unwrap();

        a.stop().await.unwrap();

        assert_eq!(a.metrics().transfers_failed.get(), 3);
        assert_eq!(a.metrics().transfers_out.get(), 0);
        assert_eq!(
            cluster.sink.samples("t1", &Labels::metric("foo")),
            vec![Sample::new(123_000, 456.0)]
        );
        assert!(cluster.ring_instance("ing-a").await.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_peer_falls_back_to_flush() {
        let cluster = TestCluster::new();
        let a = cluster.ingester(cluster.config("ing-a")).unwrap();
        let b = cluster
            .ingester(cluster.config("ing-b").with_join_after(None))
            .unwrap();
        a.start().await.unwrap();
        b.start().await.unwrap();
        assert!(wait_for_state(&a, NodeState::Active, TIMEOUT).await);
        a.push("t1", foo_sample()).unwrap();

        cluster.network.unregister(b.addr());
        a.stop().await.unwrap();

        assert_eq!(b.state(), NodeState::Pending);
        assert_eq!(cluster.sink.chunk_count(), 1);
    }

    #[tokio::test]
    async fn test_disabled_transfer_flushes() {
        let cluster = TestCluster::new();
        let a = cluster
            .ingester(cluster.config("ing-a").with_max_transfer_retries(0))
            .unwrap();
        let b = cluster
            .ingester(cluster.config("ing-b").with_join_after(None))
            .unwrap();
        a.start().await.unwrap();
        b.start().await.unwrap();
        assert!(wait_for_state(&a, NodeState::Active, TIMEOUT).await);
        a.push("t1", foo_sample()).unwrap();

        a.stop().await.unwrap();

        assert_eq!(b.state(), NodeState::Pending);
        assert_eq!(a.metrics().transfers_failed.get(), 0);
        assert_eq!(cluster.sink.chunk_count(), 1);
    }
}
