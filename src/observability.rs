//! Logging, tracing and metrics around coordination operations.
//!
//! Both subsystems funnel every operation through [`Observability::record`],
//! which opens a span, times the call, feeds the duration histogram and
//! writes one structured log line. Without a [`MetricsSink`] the metric
//! calls are skipped; without a subscriber the span and log are no-ops.

use std::future::Future;
use std::sync::Arc;

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use tokio::time::Instant;
use tracing::{debug, debug_span, error, Instrument};

use crate::error::Result;

/// Destination for operation metrics.
pub trait MetricsSink: Send + Sync {
    fn record_duration(
        &self,
        component: &str,
        operation: &str,
        driver: &str,
        status: &str,
        seconds: f64,
    );

    fn record_allowance(&self, driver: &str, allowed: bool);

    fn record_lock_acquire(&self, driver: &str, success: bool);

    fn record_lock_release(&self, driver: &str);
}

/// Per-manager observability state.
#[derive(Clone)]
pub struct Observability {
    component: &'static str,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl std::fmt::Debug for Observability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observability")
            .field("component", &self.component)
            .field("metrics", &self.metrics.is_some())
            .finish()
    }
}

impl Observability {
    /// Observability that only logs and traces.
    pub fn new(component: &'static str) -> Self {
        Self {
            component,
            metrics: None,
        }
    }

    pub fn with_metrics(component: &'static str, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            component,
            metrics: Some(metrics),
        }
    }

    /// Run `operation` inside a span, then record its duration and outcome.
    pub async fn record<T, F>(
        &self,
        driver: &'static str,
        operation: &'static str,
        key: &str,
        fut: F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let key = sanitize_key(key);
        let span = debug_span!(
            "coordination",
            component = self.component,
            operation,
            driver,
            key = %key,
        );

        let start = Instant::now();
        let result = fut.instrument(span.clone()).await;
        let duration = start.elapsed().as_secs_f64();

        if let Some(metrics) = &self.metrics {
            metrics.record_duration(self.component, operation, driver, status(&result), duration);
        }

        span.in_scope(|| match &result {
            Ok(_) => debug!(
                operation,
                key = %key,
                duration,
                "{} operation success",
                self.component
            ),
            Err(e) => error!(
                operation,
                key = %key,
                error = %e,
                duration,
                "{} operation failed",
                self.component
            ),
        });

        result
    }

    pub fn record_allowance(&self, driver: &str, allowed: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.record_allowance(driver, allowed);
        }
    }

    pub fn record_lock_acquire(&self, driver: &str, success: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.record_lock_acquire(driver, success);
        }
    }

    pub fn record_lock_release(&self, driver: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_lock_release(driver);
        }
    }
}

fn status<T>(result: &Result<T>) -> &'static str {
    if result.is_ok() {
        "success"
    } else {
        "error"
    }
}

/// Mask keys before they reach logs and spans.
///
/// Keys up to 10 characters are kept as-is; longer ones keep the first 5.
pub fn sanitize_key(key: &str) -> String {
    if key.chars().count() <= 10 {
        return key.to_string();
    }
    let prefix: String = key.chars().take(5).collect();
    format!("{}***", prefix)
}

/// [`MetricsSink`] that exports to a Prometheus registry.
#[derive(Clone)]
pub struct PrometheusMetrics {
    operation_duration: HistogramVec,
    decisions: IntCounterVec,
    lock_acquire: IntCounterVec,
    lock_acquire_failed: IntCounterVec,
    lock_release: IntCounterVec,
}

impl PrometheusMetrics {
    /// Create the collectors and register them with `registry`.
    pub fn register(registry: &Registry) -> prometheus::Result<Self> {
        let operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "warden_operation_duration_seconds",
                "Duration of rate limiter and lock operations",
            ),
            &["component", "operation", "driver", "status"],
        )?;
        let decisions = IntCounterVec::new(
            Opts::new("warden_ratelimit_decisions_total", "Rate limit decisions"),
            &["driver", "decision"],
        )?;
        let lock_acquire = IntCounterVec::new(
            Opts::new("warden_lock_acquire_total", "Successful lock acquisitions"),
            &["driver"],
        )?;
        let lock_acquire_failed = IntCounterVec::new(
            Opts::new(
                "warden_lock_acquire_failed_total",
                "Lock acquisition attempts that found the lock held",
            ),
            &["driver"],
        )?;
        let lock_release = IntCounterVec::new(
            Opts::new("warden_lock_release_total", "Lock releases"),
            &["driver"],
        )?;

        registry.register(Box::new(operation_duration.clone()))?;
        registry.register(Box::new(decisions.clone()))?;
        registry.register(Box::new(lock_acquire.clone()))?;
        registry.register(Box::new(lock_acquire_failed.clone()))?;
        registry.register(Box::new(lock_release.clone()))?;

        Ok(Self {
            operation_duration,
            decisions,
            lock_acquire,
            lock_acquire_failed,
            lock_release,
        })
    }
}

impl MetricsSink for PrometheusMetrics {
    fn record_duration(
        &self,
        component: &str,
        operation: &str,
        driver: &str,
        status: &str,
        seconds: f64,
    ) {
        self.operation_duration
            .with_label_values(&[component, operation, driver, status])
            .observe(seconds);
    }

    fn record_allowance(&self, driver: &str, allowed: bool) {
        let decision = if allowed { "allowed" } else { "rejected" };
        self.decisions.with_label_values(&[driver, decision]).inc();
    }

    fn record_lock_acquire(&self, driver: &str, success: bool) {
        if success {
            self.lock_acquire.with_label_values(&[driver]).inc();
        } else {
            self.lock_acquire_failed.with_label_values(&[driver]).inc();
        }
    }

    fn record_lock_release(&self, driver: &str) {
        self.lock_release.with_label_values(&[driver]).inc();
    }
}
