//! Metrics module
//!
//! Process-wide Prometheus metrics. [`init`] registers them once with the
//! default registry; until then every recorder is a no-op, which keeps unit
//! tests independent of global state.

use once_cell::sync::OnceCell;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts};

use crate::error::{Error, Result};

static METRICS: OnceCell<GatewayMetrics> = OnceCell::new();

/// Metric handles.
pub struct GatewayMetrics {
    pub lifecycle_jobs: IntCounterVec,
    pub lifecycle_scanned: IntCounter,
    pub recycle_removed: IntCounter,
    pub recycle_failed: IntCounter,
    pub recycle_pending: IntGauge,
    pub restores: IntCounterVec,
    pub window_resizes: IntCounterVec,
    pub circuit_rejections: IntCounter,
}

fn prom(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics registration failed: {}", e))
}

impl GatewayMetrics {
    fn new() -> Result<Self> {
        Ok(Self {
            lifecycle_jobs: IntCounterVec::new(
                Opts::new("objgate_lifecycle_jobs_total", "Lifecycle jobs emitted"),
                &["action"],
            )
            .map_err(prom)?,
            lifecycle_scanned: IntCounter::new(
                "objgate_lifecycle_scanned_total",
                "Metadata records visited by the lifecycle scanner",
            )
            .map_err(prom)?,
            recycle_removed: IntCounter::new(
                "objgate_recycle_removed_total",
                "Backend blobs removed by the recycle queue",
            )
            .map_err(prom)?,
            recycle_failed: IntCounter::new(
                "objgate_recycle_failed_total",
                "Backend blobs that exhausted removal retries",
            )
            .map_err(prom)?,
            recycle_pending: IntGauge::new(
                "objgate_recycle_pending",
                "Blobs waiting in the recycle queue",
            )
            .map_err(prom)?,
            restores: IntCounterVec::new(
                Opts::new("objgate_restores_total", "Restore attempts by result"),
                &["result"],
            )
            .map_err(prom)?,
            window_resizes: IntCounterVec::new(
                Opts::new(
                    "objgate_upload_window_resizes_total",
                    "Adaptive upload window changes",
                ),
                &["direction"],
            )
            .map_err(prom)?,
            circuit_rejections: IntCounter::new(
                "objgate_circuit_rejections_total",
                "Outbound calls rejected by an open circuit",
            )
            .map_err(prom)?,
        })
    }

    fn register(&self, registry: &prometheus::Registry) -> Result<()> {
        registry
            .register(Box::new(self.lifecycle_jobs.clone()))
            .map_err(prom)?;
        registry
            .register(Box::new(self.lifecycle_scanned.clone()))
            .map_err(prom)?;
        registry
            .register(Box::new(self.recycle_removed.clone()))
            .map_err(prom)?;
        registry
            .register(Box::new(self.recycle_failed.clone()))
            .map_err(prom)?;
        registry
            .register(Box::new(self.recycle_pending.clone()))
            .map_err(prom)?;
        registry
            .register(Box::new(self.restores.clone()))
            .map_err(prom)?;
        registry
            .register(Box::new(self.window_resizes.clone()))
            .map_err(prom)?;
        registry
            .register(Box::new(self.circuit_rejections.clone()))
            .map_err(prom)?;
        Ok(())
    }
}

/// Register gateway metrics with the default registry.
pub fn init() -> Result<()> {
    if METRICS.get().is_some() {
        return Ok(());
    }
    let metrics = GatewayMetrics::new()?;
    metrics.register(prometheus::default_registry())?;
    let _ = METRICS.set(metrics);
    Ok(())
}

/// Registered metrics, if [`init`] ran.
pub fn get() -> Option<&'static GatewayMetrics> {
    METRICS.get()
}

pub(crate) fn lifecycle_job(action: &str) {
    if let Some(m) = get() {
        m.lifecycle_jobs.with_label_values(&[action]).inc();
    }
}

pub(crate) fn lifecycle_scanned() {
    if let Some(m) = get() {
        m.lifecycle_scanned.inc();
    }
}

pub(crate) fn recycle_removed() {
    if let Some(m) = get() {
        m.recycle_removed.inc();
    }
}

pub(crate) fn recycle_failed() {
    if let Some(m) = get() {
        m.recycle_failed.inc();
    }
}

pub(crate) fn recycle_pending(delta: i64) {
    if let Some(m) = get() {
        m.recycle_pending.add(delta);
    }
}

pub(crate) fn restore(result: &str) {
    if let Some(m) = get() {
        m.restores.with_label_values(&[result]).inc();
    }
}

pub(crate) fn window_resize(direction: &str) {
    if let Some(m) = get() {
        m.window_resizes.with_label_values(&[direction]).inc();
    }
}

pub(crate) fn circuit_rejection() {
    if let Some(m) = get() {
        m.circuit_rejections.inc();
    }
}
