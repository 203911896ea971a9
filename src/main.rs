//! History service
//!
//! Joins the cluster, then aggregates JSON-lines readings from `INPUT_PATH`
//! (stdin when unset) and writes one JSON line per closed window to
//! `OUTPUT_PATH` (stdout when unset). Configuration is described in
//! `history_service::config`.
//!
//! Exits non-zero when configuration is invalid, the join fails or the sink
//! stays unavailable. Ctrl-C stops reading, flushes partial windows and
//! leaves the cluster.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use history_service::cluster::{MembershipCoordinator, SystemResolver};
use history_service::observability::{init_tracing, LogConfig};
use history_service::pipeline::{JsonLinesSink, JsonLinesSource, StreamSink, StreamSource};
use history_service::{AggregationEngine, AppConfig, Error, Pipeline, ReadinessGate, Result};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(e) => {
            init_tracing(&LogConfig::default());
            error!("{}", e);
            return ExitCode::from(2);
        }
    };
    init_tracing(&config.log);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            signal.cancel();
        }
    });

    match run(config, shutdown).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            if let Error::SinkUnavailable(sink_err) = &e {
                error!("{} result(s) were not published", sink_err.unpublished.len());
            }
            if e.is_fatal() {
                ExitCode::from(1)
            } else {
                ExitCode::from(3)
            }
        }
    }
}

async fn run(config: AppConfig, shutdown: CancellationToken) -> Result<()> {
    let gate = ReadinessGate::new();
    let coordinator = MembershipCoordinator::new(config.cluster.clone(), SystemResolver, gate.clone());
    let membership = coordinator.join(shutdown.clone()).await?;
    info!(
        "Node {} ready; cluster size {}",
        membership.node_id(),
        membership.cluster_size()
    );

    let engine = Arc::new(AggregationEngine::new(
        config.engine.key_strategy.build()?,
        config.window.assigner()?,
        config.engine.options(),
        gate,
    ));

    let source: Arc<dyn StreamSource> = match &config.io.input_path {
        Some(path) => {
            info!("Reading from {}", path.display());
            Arc::new(JsonLinesSource::open(path).await?)
        }
        None => Arc::new(JsonLinesSource::stdin()),
    };
    let sink: Arc<dyn StreamSink> = match &config.io.output_path {
        Some(path) => {
            info!("Writing results to {}", path.display());
            Arc::new(JsonLinesSink::create(path).await?)
        }
        None => Arc::new(JsonLinesSink::stdout()),
    };

    let outcome = Pipeline::new(engine, source, sink, config.pipeline.clone())
        .run(shutdown)
        .await;
    membership.leave().await;

    let report = outcome?;
    if report.engine.dropped_readings > 0 {
        warn!("{} late reading(s) were dropped", report.engine.dropped_readings);
    }
    info!(
        "Done: {} reading(s), {} result(s), {} late window update(s)",
        report.readings_read, report.results_published, report.engine.late_window_updates
    );
    Ok(())
}
