use axum::http::StatusCode;
use axum::response::IntoResponse;
use lazy_static::lazy_static;
use prometheus::{Encoder, Histogram, IntCounterVec, IntGauge, IntGaugeVec, Registry, TextEncoder};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::warn;

use crate::domain::Domain;
use crate::registry::HealthStatus;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}

static REQ_COUNTER: OnceLock<IntCounterVec> = OnceLock::new();
static BACKEND_CALLS: OnceLock<IntCounterVec> = OnceLock::new();
static FALLBACKS: OnceLock<IntCounterVec> = OnceLock::new();
static INFLIGHT: OnceLock<IntGauge> = OnceLock::new();
static DISPATCH_TIME: OnceLock<Histogram> = OnceLock::new();
static BACKEND_HEALTH: OnceLock<IntGaugeVec> = OnceLock::new();

/// Register all gateway metrics. Safe to call more than once.
pub fn init_metrics() {
    if let Ok(counter) = IntCounterVec::new(
        prometheus::opts!("gateway_requests_total", "Requests per route and status"),
        &["route", "status"],
    ) {
        if REQ_COUNTER.set(counter.clone()).is_ok() {
            REGISTRY.register(Box::new(counter)).ok();
        }
    }

    if let Ok(counter) = IntCounterVec::new(
        prometheus::opts!("gateway_backend_calls_total", "Backend calls by domain and outcome"),
        &["domain", "outcome"],
    ) {
        if BACKEND_CALLS.set(counter.clone()).is_ok() {
            REGISTRY.register(Box::new(counter)).ok();
        }
    }

    if let Ok(counter) = IntCounterVec::new(
        prometheus::opts!(
            "gateway_fallbacks_total",
            "Requests answered by the general model instead of the classified domain"
        ),
        &["domain"],
    ) {
        if FALLBACKS.set(counter.clone()).is_ok() {
            REGISTRY.register(Box::new(counter)).ok();
        }
    }

    if let Ok(gauge) = IntGauge::new("gateway_inflight_requests", "Chat requests being served") {
        if INFLIGHT.set(gauge.clone()).is_ok() {
            REGISTRY.register(Box::new(gauge)).ok();
        }
    }

    if let Ok(histogram) = Histogram::with_opts(
        prometheus::HistogramOpts::new("gateway_dispatch_seconds", "Wall time spent dispatching one request")
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
    ) {
        if DISPATCH_TIME.set(histogram.clone()).is_ok() {
            REGISTRY.register(Box::new(histogram)).ok();
        }
    }

    if let Ok(gauge) = IntGaugeVec::new(
        prometheus::opts!(
            "gateway_backend_health",
            "Backend health (2 healthy, 1 degraded, 0 unavailable)"
        ),
        &["backend"],
    ) {
        if BACKEND_HEALTH.set(gauge.clone()).is_ok() {
            REGISTRY.register(Box::new(gauge)).ok();
        }
    }
}

pub fn inc_request(route: &str, status: &str) {
    if let Some(counter) = REQ_COUNTER.get() {
        counter.with_label_values(&[route, status]).inc();
    }
}

pub fn record_backend_call(domain: Domain, outcome: &str) {
    if let Some(counter) = BACKEND_CALLS.get() {
        counter.with_label_values(&[domain.as_str(), outcome]).inc();
    }
}

pub fn record_fallback(domain: Domain) {
    if let Some(counter) = FALLBACKS.get() {
        counter.with_label_values(&[domain.as_str()]).inc();
    }
}

pub fn inc_inflight() {
    if let Some(gauge) = INFLIGHT.get() {
        gauge.inc();
    }
}

pub fn dec_inflight() {
    if let Some(gauge) = INFLIGHT.get() {
        gauge.dec();
    }
}

pub fn observe_dispatch(elapsed: Duration) {
    if let Some(histogram) = DISPATCH_TIME.get() {
        histogram.observe(elapsed.as_secs_f64());
    }
}

pub fn set_backend_health(id: &str, status: HealthStatus) {
    if let Some(gauge) = BACKEND_HEALTH.get() {
        gauge.with_label_values(&[id]).set(status.gauge_value());
    }
}

pub fn clear_backend_health(id: &str) {
    if let Some(gauge) = BACKEND_HEALTH.get() {
        gauge.remove_label_values(&[id]).ok();
    }
}

/// Decrements the in-flight gauge when a request finishes, however it ends.
pub struct InflightGuard;

impl InflightGuard {
    pub fn enter() -> Self {
        inc_inflight();
        InflightGuard
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        dec_inflight();
    }
}

pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

pub async fn get_metrics() -> impl IntoResponse {
    match render() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            warn!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}
