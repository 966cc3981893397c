//! A thin wrapper around the `prometheus` crate's counters and gauges.
//!
//! Grounded on `alpenhorn/common/metrics.py`'s `Metric` class: every metric
//! of a given name shares one underlying prometheus object and a fixed set
//! of label names, but individual `Metric` values may have a subset of
//! those names already "bound" to a fixed value, leaving the rest to be
//! supplied at each call site.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use once_cell::sync::Lazy;
use prometheus::{CounterVec, GaugeVec, Opts};

#[derive(Clone)]
enum Inner {
    Counter(CounterVec),
    Gauge(GaugeVec),
}

struct Registered {
    inner: Inner,
    labelnames: BTreeSet<String>,
}

static REGISTRY: Lazy<Mutex<BTreeMap<String, Registered>>> = Lazy::new(|| Mutex::new(BTreeMap::new()));

#[derive(Debug, thiserror::Error)]
pub enum MetricError {
    #[error("label {0:?} is both bound and unbound")]
    BoundAndUnbound(String),
    #[error("wrong metric type for metric {0:?}")]
    WrongType(String),
    #[error("wrong labels for metric {0:?}")]
    WrongLabels(String),
    #[error("label {0:?} is not bound")]
    NotBound(String),
    #[error("label {0:?} is not an unbound label")]
    NotUnbound(String),
    #[error(transparent)]
    Prometheus(#[from] prometheus::Error),
}

/// A named metric with a fixed label set, some of which may be pre-bound
/// to specific values.
#[derive(Clone)]
pub struct Metric {
    name: String,
    description: String,
    counter: bool,
    unbound_labels: BTreeSet<String>,
    bound_labels: BTreeMap<String, String>,
    inner: Inner,
}

impl Metric {
    /// Create (or attach to an existing) metric named `alpenhorn_{name}`.
    pub fn new(
        name: &str,
        description: &str,
        counter: bool,
        unbound: &[&str],
        bound: &[(&str, &str)],
    ) -> Result<Self, MetricError> {
        let unbound_labels: BTreeSet<String> = unbound.iter().map(|s| s.to_string()).collect();
        let bound_labels: BTreeMap<String, String> =
            bound.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();

        for key in bound_labels.keys() {
            if unbound_labels.contains(key) {
                return Err(MetricError::BoundAndUnbound(key.clone()));
            }
        }

        let labelnames: BTreeSet<String> =
            unbound_labels.iter().chain(bound_labels.keys()).cloned().collect();

        let mut registry = REGISTRY.lock().unwrap();
        let inner = if let Some(existing) = registry.get(name) {
            if existing.labelnames != labelnames {
                return Err(MetricError::WrongLabels(name.to_string()));
            }
            match (&existing.inner, counter) {
                (Inner::Counter(_), true) | (Inner::Gauge(_), false) => existing.inner.clone(),
                _ => return Err(MetricError::WrongType(name.to_string())),
            }
        } else {
            let label_vec: Vec<&str> = labelnames.iter().map(|s| s.as_str()).collect();
            let full_name = format!("alpenhorn_{name}");
            let opts = Opts::new(full_name, description);
            let inner = if counter {
                Inner::Counter(CounterVec::new(opts, &label_vec)?)
            } else {
                Inner::Gauge(GaugeVec::new(opts, &label_vec)?)
            };
            registry.insert(
                name.to_string(),
                Registered {
                    inner: inner.clone(),
                    labelnames: labelnames.clone(),
                },
            );
            inner
        };

        Ok(Self {
            name: name.to_string(),
            description: description.to_string(),
            counter,
            unbound_labels,
            bound_labels,
            inner,
        })
    }

    /// Return a copy with some previously-unbound labels now bound.
    pub fn bind(&self, labels: &[(&str, &str)]) -> Result<Self, MetricError> {
        let mut unbound = self.unbound_labels.clone();
        let mut bound = self.bound_labels.clone();

        for (key, value) in labels {
            if !unbound.remove(*key) {
                return Err(MetricError::NotUnbound((*key).to_string()));
            }
            bound.insert(key.to_string(), value.to_string());
        }

        let bound_pairs: Vec<(&str, &str)> =
            bound.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let unbound_names: Vec<&str> = unbound.iter().map(|s| s.as_str()).collect();
        Self::new(&self.name, &self.description, self.counter, &unbound_names, &bound_pairs)
    }

    fn resolve_labels(&self, labels: &[(&str, &str)]) -> Result<BTreeMap<String, String>, MetricError> {
        let mut merged = self.bound_labels.clone();
        let mut seen = BTreeSet::new();
        for (key, value) in labels {
            if !self.unbound_labels.contains(*key) {
                return Err(MetricError::NotBound((*key).to_string()));
            }
            merged.insert(key.to_string(), value.to_string());
            seen.insert(*key);
        }
        let missing: Vec<_> = self
            .unbound_labels
            .iter()
            .filter(|l| !seen.contains(l.as_str()))
            .collect();
        if !missing.is_empty() {
            return Err(MetricError::NotBound(
                missing.into_iter().cloned().collect::<Vec<_>>().join(", "),
            ));
        }
        Ok(merged)
    }

    /// Add `value` to the metric (must be non-negative for counters).
    pub fn add(&self, value: f64, labels: &[(&str, &str)]) -> Result<(), MetricError> {
        let merged = self.resolve_labels(labels)?;
        let values: Vec<&str> = merged.values().map(|s| s.as_str()).collect();
        match &self.inner {
            Inner::Counter(c) => c.with_label_values(&values).inc_by(value),
            Inner::Gauge(g) => g.with_label_values(&values).add(value),
        }
        Ok(())
    }

    pub fn inc(&self, labels: &[(&str, &str)]) -> Result<(), MetricError> {
        self.add(1.0, labels)
    }

    /// Decrement the metric. Only meaningful for gauges.
    pub fn dec(&self, labels: &[(&str, &str)]) -> Result<(), MetricError> {
        self.add(-1.0, labels)
    }

    /// Set the metric's value directly. Only meaningful for gauges.
    pub fn set(&self, value: f64, labels: &[(&str, &str)]) -> Result<(), MetricError> {
        let merged = self.resolve_labels(labels)?;
        let values: Vec<&str> = merged.values().map(|s| s.as_str()).collect();
        match &self.inner {
            Inner::Gauge(g) => {
                g.with_label_values(&values).set(value);
                Ok(())
            }
            Inner::Counter(_) => Err(MetricError::WrongType(self.name.clone())),
        }
    }
}

/// Serve the process's default prometheus registry over HTTP at `/metrics`,
/// used when `daemon.prom_client_port > 0`. Grounded on
/// `alpenhorn/scheduler/pool.py`'s `start_http_server` call, reimplemented
/// with `axum` since there is no Rust equivalent of `prometheus_client`'s
/// bundled WSGI server.
pub async fn serve(port: u16) -> std::io::Result<()> {
    use axum::routing::get;
    use axum::Router;

    async fn metrics_handler() -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let families = prometheus::gather();
        let mut buf = Vec::new();
        encoder.encode(&families, &mut buf).expect("metrics encode");
        String::from_utf8(buf).expect("metrics are valid utf8")
    }

    let app = Router::new().route("/metrics", get(metrics_handler));
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "metrics server listening");
    axum::serve(listener, app).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_then_inc() {
        let m = Metric::new("test_copy_requests", "test metric", true, &["source", "outcome"], &[])
            .unwrap();
        let bound = m.bind(&[("source", "nodeA")]).unwrap();
        bound.inc(&[("outcome", "success")]).unwrap();
    }

    #[test]
    fn mismatched_labels_rejected() {
        let _ = Metric::new("test_other_metric", "d", false, &["a"], &[]).unwrap();
        let err = Metric::new("test_other_metric", "d", false, &["b"], &[]);
        assert!(err.is_err());
    }
}
