//! RCA Agent - per-node root cause analysis
//!
//! Runs on every cluster member: evaluates the analysis graph on a fixed
//! tick, exchanges flow units with peer nodes and serves health, metrics
//! and statistics over HTTP.

use anyhow::{Context, Result};
use rca_agent::{api, config::AgentConfig};
use rca_lib::{
    collector::{CollectionLoopBuilder, FileMetricsCollector},
    config::{ConfHandle, ConfReloader, RcaConf},
    graph::{AnalysisGraph, GraphContext, GraphRegistry},
    health::{components, HealthRegistry},
    net::{InboundRouter, NetworkLayer, NetworkWorker},
    observability::{RcaMetrics, StructuredLogger},
    scheduler::Scheduler,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting rca-agent");

    let config = AgentConfig::load()?;
    info!(
        node_address = %config.node_address,
        conf_path = %config.conf_path.display(),
        tick_secs = config.tick_secs,
        "Agent configured"
    );

    let health_registry = HealthRegistry::new();
    health_registry.register_all(components::ALL).await;

    let metrics = RcaMetrics::new();
    let logger = StructuredLogger::new(&config.node_address);

    // Configuration errors are fatal at startup
    let conf_handle = Arc::new(ConfHandle::new(RcaConf::load(&config.conf_path)?));
    let snapshot = conf_handle.load();

    let network = Arc::new(NetworkLayer::new(
        config.node_address.clone(),
        &snapshot,
        config.network_config(),
    ));

    let definition = GraphRegistry::with_builtins()
        .resolve(&snapshot.analysis_graph_entry_point, &snapshot)?;
    let context = GraphContext::local(&snapshot, config.tick()).with_network(Arc::clone(&network));
    let graph = Arc::new(AnalysisGraph::build(&definition, &context)?);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut handles = Vec::new();

    // Evaluation
    let scheduler = Arc::new(
        Scheduler::new(
            Arc::clone(&graph),
            Arc::clone(&conf_handle),
            config.scheduler_config(),
            logger.clone(),
        )
        .with_health(health_registry.clone()),
    );
    handles.push(tokio::spawn(
        Arc::clone(&scheduler).run_supervised(shutdown_tx.subscribe()),
    ));

    // Peer transport
    handles.push(tokio::spawn(
        NetworkWorker::new(Arc::clone(&network))
            .with_health(health_registry.clone())
            .run(shutdown_tx.subscribe()),
    ));
    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind peer listener on {}", config.listen_addr))?;
    let router: Arc<dyn InboundRouter> = graph.clone();
    handles.push(tokio::spawn(Arc::clone(&network).serve(
        listener,
        router,
        shutdown_tx.subscribe(),
    )));

    // Configuration reload
    let reloader = {
        let network = Arc::clone(&network);
        let graph = Arc::clone(&graph);
        ConfReloader::new(config.conf_path.clone(), Arc::clone(&conf_handle))
            .with_health(health_registry.clone())
            .on_reload(move |conf| {
                network.reconcile(conf);
                graph.apply_conf(conf);
            })
    };
    handles.push(tokio::spawn(reloader.run(shutdown_tx.subscribe())));

    // Local metrics
    match &config.metrics_file {
        Some(path) => {
            let collection_loop = CollectionLoopBuilder::new()
                .collector(Arc::new(FileMetricsCollector::new(path.clone())))
                .graph(Arc::clone(&graph))
                .health(health_registry.clone())
                .interval(config.tick())
                .node(config.node_address.clone())
                .build()?;
            handles.push(tokio::spawn(collection_loop.run(shutdown_tx.subscribe())));
        }
        None => {
            warn!("No metrics file configured, metric sources only receive peer traffic");
            health_registry
                .set_degraded(components::COLLECTOR, "no metrics file configured")
                .await;
        }
    }

    let app_state = Arc::new(
        api::AppState::new(health_registry.clone(), metrics)
            .with_scheduler(Arc::clone(&scheduler))
            .with_network(Arc::clone(&network)),
    );
    let api_handle = tokio::spawn(api::serve(
        config.http_port,
        app_state,
        shutdown_tx.subscribe(),
    ));

    logger.log_startup(AGENT_VERSION, graph.name(), graph.schema_version());
    health_registry.set_ready(true).await;

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    health_registry.set_ready(false).await;
    let _ = shutdown_tx.send(());

    // In-flight ticks and flushes complete, bounded by the shutdown timeout
    let drain = async {
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Task ended abnormally");
            }
        }
        match api_handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "API server failed"),
            Err(e) => warn!(error = %e, "API server task ended abnormally"),
        }
    };
    if tokio::time::timeout(config.shutdown_timeout(), drain)
        .await
        .is_err()
    {
        warn!(
            timeout_secs = config.shutdown_timeout_secs,
            "Shutdown timed out, abandoning in-flight work"
        );
    }

    info!("Shutting down");
    Ok(())
}
