//! Prometheus metrics sampled from the engine.
//!
//! # Metrics
//!
//! - `argot_tunnels{state}` - Number of keys per tunnel state
//! - `argot_repairs_pending` - Number of armed repair timers
//! - `argot_repair_attempts` - Sum of the current repair attempt counters
//! - `argot_queue_depth` - Number of keys waiting in the work queue
//! - `argot_resyncs_total` - Number of full resyncs
//! - `argot_tunnel_failures_total` - Number of connection failures reported by the transport

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{Router, extract::State, http::header, response::IntoResponse, routing::get};
use log::{debug, info};
use tokio::net::TcpListener;
use prometheus::{Encoder, IntCounter, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;

use crate::{
    IngressKey, Result,
    queue::WorkQueue,
    repair::RepairScheduler,
    store::{StateStore, TunnelState},
};

pub struct Metrics {
    registry: Registry,
    pub tunnels: IntGaugeVec,
    pub repairs_pending: IntGauge,
    pub repair_attempts: IntGauge,
    pub queue_depth: IntGauge,
    pub resyncs: IntCounter,
    pub tunnel_failures: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let tunnels = IntGaugeVec::new(
            Opts::new("argot_tunnels", "Number of Ingress keys per tunnel state"),
            &["state"],
        )?;
        let repairs_pending = IntGauge::new("argot_repairs_pending", "Number of armed repair timers")?;
        let repair_attempts = IntGauge::new(
            "argot_repair_attempts",
            "Sum of the repair attempt counters of all keys",
        )?;
        let queue_depth = IntGauge::new("argot_queue_depth", "Number of keys waiting to be reconciled")?;
        let resyncs = IntCounter::new("argot_resyncs_total", "Number of full resyncs")?;
        let tunnel_failures = IntCounter::new(
            "argot_tunnel_failures_total",
            "Number of connection failures reported for live tunnels",
        )?;

        registry.register(Box::new(tunnels.clone()))?;
        registry.register(Box::new(repairs_pending.clone()))?;
        registry.register(Box::new(repair_attempts.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(resyncs.clone()))?;
        registry.register(Box::new(tunnel_failures.clone()))?;

        // Publish every state from the start so dashboards see explicit zeros.
        for state in TunnelState::ALL {
            tunnels.with_label_values(&[state.as_str()]).set(0);
        }

        Ok(Self {
            registry,
            tunnels,
            repairs_pending,
            repair_attempts,
            queue_depth,
            resyncs,
            tunnel_failures,
        })
    }

    /// Copies the current engine state into the gauges.
    pub fn sample(&self, store: &StateStore, repairs: &RepairScheduler, queue: &WorkQueue<IngressKey>) {
        let summary = store.summary();
        for state in TunnelState::ALL {
            self.tunnels
                .with_label_values(&[state.as_str()])
                .set(summary.count(state) as i64);
        }
        self.repair_attempts
            .set(i64::try_from(summary.repair_attempts).unwrap_or(i64::MAX));
        self.repairs_pending.set(repairs.pending() as i64);
        self.queue_depth.set(queue.len() as i64);
    }

    /// Encodes all metrics in the Prometheus text format.
    pub fn encode(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| crate::Error::UnexpectedError(e.to_string()))
    }
}

///
/// Samples the engine every `interval` until `shutdown` fires. Runs independently of the
/// reconcile path and only ever reads.
///
pub async fn run_reporter(
    metrics: Arc<Metrics>,
    store: Arc<StateStore>,
    repairs: RepairScheduler,
    queue: Arc<WorkQueue<IngressKey>>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => metrics.sample(&store, &repairs, &queue),
        }
    }
    debug!("Metrics reporter stopped");
}

async fn render(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            axum::http::StatusCode::OK,
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            body,
        ),
        Err(e) => (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain")],
            e.to_string(),
        ),
    }
}

fn routes(metrics: Arc<Metrics>, connection_limit: usize) -> Router {
    Router::new()
        .route("/metrics", get(render))
        .route("/healthz", get(|| async { "ok" }))
        .layer(GlobalConcurrencyLimitLayer::new(connection_limit))
        .with_state(metrics)
}

/// Opens the metrics listener. Called before the engine starts so a taken address fails
/// startup.
pub async fn bind(address: SocketAddr) -> Result<TcpListener> {
    Ok(TcpListener::bind(address).await?)
}

/// Serves `/metrics` on `listener` until `shutdown` fires.
pub async fn serve(
    metrics: Arc<Metrics>,
    listener: TcpListener,
    connection_limit: usize,
    shutdown: CancellationToken,
) -> Result<()> {
    info!("Serving metrics on `{}`", listener.local_addr()?);
    axum::serve(listener, routes(metrics, connection_limit))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
