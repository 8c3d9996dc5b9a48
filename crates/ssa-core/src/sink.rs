//! Destinations for named scalar observations.
//!
//! Training and evaluation emit one `(name, value)` pair per metric per
//! step. Nothing is returned from a sink; callers never read back through it.

/// Receives named scalar observations.
pub trait MetricSink {
    /// Records `value` under `name` for the current step.
    fn log_scalar(&mut self, name: &str, value: f64);
}

/// Forwards every observation as a structured `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MetricSink for TracingSink {
    fn log_scalar(&mut self, name: &str, value: f64) {
        tracing::info!(target: "ssa::metrics", metric = name, value, "scalar");
    }
}

/// Keeps every observation in memory, in emission order.
///
/// # Example
///
/// ```
/// use ssa_core::{MemorySink, MetricSink};
///
/// let mut sink = MemorySink::default();
/// sink.log_scalar("val_mcc", 0.5);
/// sink.log_scalar("val_mcc", 0.7);
/// assert_eq!(sink.last("val_mcc"), Some(0.7));
/// assert_eq!(sink.values("val_mcc"), vec![0.5, 0.7]);
/// ```
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    pub records: Vec<(String, f64)>,
}

impl MemorySink {
    /// Most recent value logged under `name`.
    pub fn last(&self, name: &str) -> Option<f64> {
        self.records
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
    }

    /// All values logged under `name`, oldest first.
    pub fn values(&self, name: &str) -> Vec<f64> {
        self.records
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| *v)
            .collect()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

impl MetricSink for MemorySink {
    fn log_scalar(&mut self, name: &str, value: f64) {
        self.records.push((name.to_string(), value));
    }
}

impl<S: MetricSink + ?Sized> MetricSink for &mut S {
    fn log_scalar(&mut self, name: &str, value: f64) {
        (**self).log_scalar(name, value);
    }
}
