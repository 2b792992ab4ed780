//! Per-controller Prometheus metrics, gated behind the `metrics` feature.
//!
//! One [`ControllerMetrics`] instance per reconciler (agents, tasks,
//! workflow-runs, crontasks, cronworkflows), each registered with its own
//! `name` label so the same process can run several controllers without
//! metric collisions.

#[cfg(feature = "metrics")]
use lazy_static::lazy_static;
#[cfg(feature = "metrics")]
use prometheus::{HistogramVec, IntCounterVec, register_histogram_vec, register_int_counter_vec};

#[cfg(feature = "metrics")]
lazy_static! {
    static ref RECONCILE_COUNTER: IntCounterVec = register_int_counter_vec!(
        "kubetask_operator_reconcile_total",
        "Total number of reconcile invocations",
        &["controller", "name", "namespace"]
    )
    .unwrap();
    static ref ACTION_COUNTER: IntCounterVec = register_int_counter_vec!(
        "kubetask_operator_action_total",
        "Total number of actions taken by a reconciler",
        &["controller", "name", "namespace", "action"]
    )
    .unwrap();
    static ref READ_HISTOGRAM: HistogramVec = register_histogram_vec!(
        "kubetask_operator_reconcile_read_seconds",
        "Time spent determining the next action during reconciliation",
        &["controller", "name", "namespace", "action"]
    )
    .unwrap();
    static ref WRITE_HISTOGRAM: HistogramVec = register_histogram_vec!(
        "kubetask_operator_reconcile_write_seconds",
        "Time spent applying the determined action during reconciliation",
        &["controller", "name", "namespace", "action"]
    )
    .unwrap();
}

#[cfg(feature = "metrics")]
pub struct ControllerMetrics {
    controller: String,
    pub reconcile_counter: &'static IntCounterVec,
    pub action_counter: &'static IntCounterVec,
    pub read_histogram: &'static HistogramVec,
    pub write_histogram: &'static HistogramVec,
}

#[cfg(feature = "metrics")]
impl ControllerMetrics {
    pub fn new(controller: &str) -> Self {
        Self {
            controller: controller.to_string(),
            reconcile_counter: &RECONCILE_COUNTER,
            action_counter: &ACTION_COUNTER,
            read_histogram: &READ_HISTOGRAM,
            write_histogram: &WRITE_HISTOGRAM,
        }
    }

    pub fn controller(&self) -> &str {
        &self.controller
    }
}

#[cfg(not(feature = "metrics"))]
pub struct ControllerMetrics;

#[cfg(not(feature = "metrics"))]
impl ControllerMetrics {
    pub fn new(_controller: &str) -> Self {
        Self
    }
}

/// Serves the `prometheus` default registry as `/metrics`, `/healthz`,
/// `/readyz` on `METRICS_PORT`, gated behind the `metrics` feature. Separate
/// from `kubetask_common::metrics`, which exposes the webhook's own
/// `metrics`-crate recorder — this operator registers its counters directly
/// against `prometheus::default_registry()`, so it needs its own exposition.
#[cfg(feature = "metrics")]
pub async fn maybe_spawn_metrics_server() {
    use http_body_util::Full;
    use hyper::body::{Bytes, Incoming};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use hyper_util::rt::TokioIo;
    use owo_colors::OwoColorize;
    use prometheus::{Encoder, TextEncoder};
    use tokio::net::TcpListener;

    let Ok(port) = std::env::var("METRICS_PORT").map(|s| s.parse::<u16>()) else {
        return;
    };
    let Ok(port) = port else {
        eprintln!("🛑 METRICS_PORT is not a valid port number");
        return;
    };

    let addr = format!("0.0.0.0:{port}");
    let listener = match TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("🛑 Failed to bind metrics server to {addr}: {e}");
            return;
        }
    };
    println!(
        "{}{}",
        "📈 Starting operator metrics server • port=".green(),
        format!("{port}").green().dimmed()
    );

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => continue,
            };
            let io = TokioIo::new(stream);
            tokio::spawn(async move {
                let service = service_fn(|req: Request<Incoming>| async move {
                    let body = match req.uri().path() {
                        "/metrics" => {
                            let encoder = TextEncoder::new();
                            let metric_families = prometheus::gather();
                            let mut buffer = Vec::new();
                            encoder.encode(&metric_families, &mut buffer).unwrap_or_default();
                            buffer
                        }
                        "/healthz" | "/readyz" => b"ok".to_vec(),
                        _ => b"not found".to_vec(),
                    };
                    Ok::<_, std::convert::Infallible>(Response::new(Full::new(Bytes::from(body))))
                });
                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    eprintln!("metrics connection error: {e}");
                }
            });
        }
    });
}

#[cfg(not(feature = "metrics"))]
pub async fn maybe_spawn_metrics_server() {}
