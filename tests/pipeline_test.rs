//! End-to-end pipeline tests
//!
//! Readings go through partition readers, shard-aligned workers and the
//! publisher into a sink; these tests check what comes out the other end.

use chrono::Utc;
use history_service::aggregation::{
    AggregationEngine, ClosurePolicy, EngineOptions, HourOfDayKeyDeriver, HoppingWindowAssigner,
    ReadinessGate, TimeBucketKeyDeriver,
};
use history_service::cluster::{ClusterConfig, MembershipCoordinator, StaticResolver};
use history_service::pipeline::{
    JsonLinesSink, JsonLinesSource, MemorySink, MemorySource, Pipeline, PipelineConfig,
};
use history_service::{AggregationKey, AggregationResult, BucketDescriptor, Error, Reading, WindowId};
use std::collections::HashSet;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn fifty_by_one(gate: ReadinessGate, policy: ClosurePolicy) -> Arc<AggregationEngine<HourOfDayKeyDeriver<Utc>>> {
    Arc::new(AggregationEngine::new(
        HourOfDayKeyDeriver::with_timezone(Utc),
        HoppingWindowAssigner::new(Duration::from_secs(50), Duration::from_secs(1)).unwrap(),
        EngineOptions {
            num_shards: 4,
            allowed_lateness_ms: 0,
            closure_policy: policy,
        },
        gate,
    ))
}

fn find<'a>(results: &'a [AggregationResult], entity: &str, window: WindowId) -> Option<&'a AggregationResult> {
    results
        .iter()
        .find(|r| r.key.entity_id == entity && r.window == window)
}

#[tokio::test]
async fn test_sensor_average_over_fifty_second_window() {
    let source = Arc::new(MemorySource::new(1));
    source.push(0, Reading::new("sensor-1", 0, 10.0)).unwrap();
    source.push(0, Reading::new("sensor-1", 10_000, 20.0)).unwrap();
    source.push(0, Reading::new("sensor-2", 60_000, 5.0)).unwrap();
    let sink = Arc::new(MemorySink::new());

    // A single worker keeps the readings in source order
    let report = Pipeline::new(
        fifty_by_one(ReadinessGate::opened(), ClosurePolicy::Inline),
        source,
        sink.clone(),
        PipelineConfig {
            workers: 1,
            ..PipelineConfig::test()
        },
    )
    .run(CancellationToken::new())
    .await
    .unwrap();

    let results = sink.results();
    let shared = find(&results, "sensor-1", WindowId::new(0, 50_000)).unwrap();
    assert_eq!(shared.key, AggregationKey::new("sensor-1", BucketDescriptor::HourOfDay(0)));
    assert!((shared.average - 15.0).abs() < f64::EPSILON);
    assert_eq!(shared.count, 2);

    // Every (key, window) exactly once, flush included
    let unique: HashSet<_> = results.iter().map(|r| (r.key.clone(), r.window)).collect();
    assert_eq!(unique.len(), results.len());
    assert_eq!(report.results_published, results.len() as u64);
    assert_eq!(report.readings_read, 3);
}

#[tokio::test]
async fn test_many_partitions_and_workers_match_single_worker() {
    // Periodic closure with an idle ticker leaves every window open until the
    // flush, so no reading is late whatever the interleaving
    let readings: Vec<Reading> = (0..400)
        .map(|i| Reading::new(format!("sensor-{}", i % 8), (i / 8) * 500, (i % 11) as f64))
        .collect();

    let run = |workers: usize, partitions: u32| {
        let readings = readings.clone();
        async move {
            let sink = Arc::new(MemorySink::new());
            Pipeline::new(
                fifty_by_one(ReadinessGate::opened(), ClosurePolicy::Periodic),
                Arc::new(MemorySource::from_readings(readings, partitions)),
                sink.clone(),
                PipelineConfig {
                    workers,
                    tick_interval: Duration::from_secs(3600),
                    ..PipelineConfig::test()
                },
            )
            .run(CancellationToken::new())
            .await
            .unwrap();
            let mut results = sink.results();
            results.sort_by(|a, b| (a.window, &a.key).cmp(&(b.window, &b.key)));
            results
        }
    };

    let single = run(1, 1).await;
    let sharded = run(4, 3).await;
    assert_eq!(single.len(), sharded.len());
    for (a, b) in single.iter().zip(&sharded) {
        assert_eq!((a.window, &a.key, a.count), (b.window, &b.key, b.count));
        assert!((a.average - b.average).abs() < 1e-9);
    }
}

#[tokio::test]
async fn test_unavailable_sink_surfaces_unpublished_results() {
    let source = Arc::new(MemorySource::new(1));
    for i in 0..20 {
        source.push(0, Reading::new("sensor-1", i * 10_000, 1.0)).unwrap();
    }
    let sink = Arc::new(MemorySink::new());
    sink.set_unavailable(true);

    let err = Pipeline::new(
        fifty_by_one(ReadinessGate::opened(), ClosurePolicy::Inline),
        source,
        sink.clone(),
        PipelineConfig::test(),
    )
    .run(CancellationToken::new())
    .await
    .unwrap_err();

    match err {
        Error::SinkUnavailable(sink_err) => assert!(!sink_err.unpublished.is_empty()),
        other => panic!("expected SinkUnavailable, got {}", other),
    }
    assert!(sink.is_empty());
    assert!(sink.attempts() >= PipelineConfig::test().sink_attempts as u64);
}

#[tokio::test]
async fn test_transient_sink_failures_are_retried() {
    let source = Arc::new(MemorySource::new(1));
    source.push(0, Reading::new("sensor-1", 0, 4.0)).unwrap();
    let sink = Arc::new(MemorySink::new());
    sink.fail_next(2);

    let report = Pipeline::new(
        fifty_by_one(ReadinessGate::opened(), ClosurePolicy::Inline),
        source,
        sink.clone(),
        PipelineConfig::test(),
    )
    .run(CancellationToken::new())
    .await
    .unwrap();

    assert_eq!(report.publish_retries, 2);
    assert_eq!(sink.len(), 50);
}

#[tokio::test]
async fn test_shutdown_flushes_live_source() {
    let source = Arc::new(MemorySource::live(2));
    source.push_keyed(Reading::new("sensor-1", 1_000, 3.0));
    source.push_keyed(Reading::new("sensor-1", 2_000, 5.0));
    let sink = Arc::new(MemorySink::new());

    let shutdown = CancellationToken::new();
    let run = tokio::spawn(
        Pipeline::new(
            fifty_by_one(ReadinessGate::opened(), ClosurePolicy::Inline),
            source.clone(),
            sink.clone(),
            PipelineConfig::test(),
        )
        .run(shutdown.clone()),
    );

    // Wait until both readings are consumed, then stop
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let consumed: u64 = (0..2).filter_map(|p| source.position(p)).sum();
            if consumed == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    shutdown.cancel();

    let report = run.await.unwrap().unwrap();
    assert_eq!(report.readings_read, 2);
    let results = sink.results();
    let shared = find(&results, "sensor-1", WindowId::new(0, 50_000)).unwrap();
    assert!((shared.average - 4.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_pipeline_refuses_to_run_before_join() {
    let gate = ReadinessGate::new();
    let pipeline = Pipeline::new(
        fifty_by_one(gate.clone(), ClosurePolicy::Inline),
        Arc::new(MemorySource::new(1)),
        Arc::new(MemorySink::new()),
        PipelineConfig::test(),
    );
    assert!(matches!(
        pipeline.run(CancellationToken::new()).await,
        Err(Error::NotReady)
    ));

    // Joining opens the shared gate
    let coordinator = MembershipCoordinator::new(
        ClusterConfig {
            port: 0,
            dns_name: Some("history".to_string()),
            ..ClusterConfig::test()
        },
        StaticResolver::new(),
        gate.clone(),
    );
    let membership = coordinator.join(CancellationToken::new()).await.unwrap();
    assert!(gate.is_open());

    let source = Arc::new(MemorySource::new(1));
    source.push(0, Reading::new("sensor-1", 0, 1.0)).unwrap();
    let sink = Arc::new(MemorySink::new());
    Pipeline::new(
        fifty_by_one(gate, ClosurePolicy::Inline),
        source,
        sink.clone(),
        PipelineConfig::test(),
    )
    .run(CancellationToken::new())
    .await
    .unwrap();
    assert!(!sink.is_empty());

    membership.leave().await;
}

#[tokio::test]
async fn test_json_lines_file_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("readings.jsonl");
    let output = dir.path().join("results.jsonl");
    {
        let mut file = std::fs::File::create(&input).unwrap();
        writeln!(file, r#"{{"entity_id":"s","timestamp_ms":0,"value":2.0}}"#).unwrap();
        writeln!(file, "garbage").unwrap();
        writeln!(file, r#"{{"entity_id":"s","timestamp_ms":5000,"value":4.0}}"#).unwrap();
    }

    let engine = Arc::new(AggregationEngine::new(
        TimeBucketKeyDeriver::new(60_000).unwrap(),
        HoppingWindowAssigner::from_millis(10_000, 10_000).unwrap(),
        EngineOptions::default(),
        ReadinessGate::opened(),
    ));
    Pipeline::new(
        engine,
        Arc::new(JsonLinesSource::open(&input).await.unwrap()),
        Arc::new(JsonLinesSink::create(&output).await.unwrap()),
        PipelineConfig::test(),
    )
    .run(CancellationToken::new())
    .await
    .unwrap();

    let written = std::fs::read_to_string(&output).unwrap();
    assert_eq!(
        written.trim(),
        r#"{"key":"s;0","window_start":0,"window_end":10000,"average":3.0,"count":2}"#
    );
}
