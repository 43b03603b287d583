//! Prometheus metrics definitions and HTTP server

use std::net::SocketAddr;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use tokio::net::TcpListener;
use tracing::{error, info};

lazy_static::lazy_static! {
    /// Total number of reconciliations
    pub static ref RECONCILIATIONS: CounterVec = register_counter_vec!(
        "lvm_backup_operator_reconciliations_total",
        "Total number of reconciliations",
        &["kind"]
    ).unwrap();

    /// Total number of reconciliation errors
    pub static ref RECONCILIATION_ERRORS: CounterVec = register_counter_vec!(
        "lvm_backup_operator_reconciliation_errors_total",
        "Total number of reconciliation errors",
        &["kind"]
    ).unwrap();

    /// Reconciliation duration histogram
    pub static ref RECONCILE_DURATION: HistogramVec = register_histogram_vec!(
        "lvm_backup_operator_reconcile_duration_seconds",
        "Duration of reconciliations in seconds",
        &["kind"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).unwrap();

    /// Backups that reached a terminal state on this node
    pub static ref BACKUPS_TOTAL: CounterVec = register_counter_vec!(
        "lvm_backup_operator_backups_total",
        "Total number of finished backups by outcome",
        &["outcome", "namespace"]
    ).unwrap();

    /// Restores that reached a terminal state on this node
    pub static ref RESTORES_TOTAL: CounterVec = register_counter_vec!(
        "lvm_backup_operator_restores_total",
        "Total number of finished restores by outcome",
        &["outcome", "namespace"]
    ).unwrap();

    /// Scripts launched
    pub static ref SCRIPT_RUNS_STARTED: CounterVec = register_counter_vec!(
        "lvm_backup_operator_script_runs_started_total",
        "Total number of backup and restore script launches",
        &["kind"]
    ).unwrap();

    /// Volume service calls by operation and outcome
    pub static ref LV_OPERATIONS: CounterVec = register_counter_vec!(
        "lvm_backup_operator_lv_operations_total",
        "Total number of logical volume operations by outcome",
        &["operation", "outcome"]
    ).unwrap();

    /// Free capacity per volume group
    pub static ref VG_FREE_BYTES: GaugeVec = register_gauge_vec!(
        "lvm_backup_operator_vg_free_bytes",
        "Unallocated capacity of the volume group in bytes",
        &["volume_group"]
    ).unwrap();

    /// Operator health (1 = healthy, 0 = unhealthy)
    pub static ref OPERATOR_HEALTH: prometheus::Gauge = prometheus::register_gauge!(
        "lvm_backup_operator_health",
        "Operator health status (1 = healthy, 0 = unhealthy)"
    ).unwrap();
}

/// Serve `/metrics`, `/healthz` and `/readyz` until the listener fails
pub async fn serve(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Metrics server listening");

    OPERATOR_HEALTH.set(1.0);

    loop {
        let (stream, peer) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_request))
                .await
            {
                error!(%peer, error = %e, "Error serving metrics connection");
            }
        });
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let (status, content_type, body) = match req.uri().path() {
        "/metrics" => match encode_metrics() {
            Ok((content_type, body)) => (StatusCode::OK, content_type, body),
            Err(e) => {
                error!(error = %e, "Failed to encode metrics");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    TEXT_PLAIN.to_string(),
                    b"encode failed".to_vec(),
                )
            }
        },
        "/healthz" | "/readyz" if OPERATOR_HEALTH.get() >= 1.0 => {
            (StatusCode::OK, TEXT_PLAIN.to_string(), b"ok".to_vec())
        }
        "/healthz" | "/readyz" => (
            StatusCode::SERVICE_UNAVAILABLE,
            TEXT_PLAIN.to_string(),
            b"unhealthy".to_vec(),
        ),
        _ => (StatusCode::NOT_FOUND, TEXT_PLAIN.to_string(), b"Not Found".to_vec()),
    };

    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    if let Ok(value) = HeaderValue::from_str(&content_type) {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    Ok(response)
}

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

fn encode_metrics() -> prometheus::Result<(String, Vec<u8>)> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    Ok((encoder.format_type().to_string(), buffer))
}
