//! Metrics/experiment-tracking collaborator.
//!
//! The trainer pushes scalar payloads and per-class routing tables keyed by
//! name and an explicit step index, and never reads anything back. Sink
//! failures are best-effort by contract: the trainer downgrades them to a
//! warning and keeps training.

use tracing::info;

pub type SinkResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

pub trait MetricSink {
    /// Named scalar values for one step.
    fn log_scalars(&mut self, step: usize, scalars: &[(&str, f32)]) -> SinkResult;

    /// One routing-ratio table: `(branch index, mean ratio)` rows under a
    /// name like `Validation/Route0/Class_3`.
    fn log_table(&mut self, step: usize, name: &str, rows: &[(usize, f32)]) -> SinkResult;
}

/// Emits every payload as a `tracing` event. The default sink.
#[derive(Debug, Default)]
pub struct TracingSink;

impl MetricSink for TracingSink {
    fn log_scalars(&mut self, step: usize, scalars: &[(&str, f32)]) -> SinkResult {
        let rendered = scalars
            .iter()
            .map(|(name, value)| format!("{}={:.5}", name, value))
            .collect::<Vec<_>>()
            .join(" ");
        info!(step = step, "{}", rendered);
        Ok(())
    }

    fn log_table(&mut self, step: usize, name: &str, rows: &[(usize, f32)]) -> SinkResult {
        let rendered = rows
            .iter()
            .map(|(branch, ratio)| format!("{}:{:.4}", branch, ratio))
            .collect::<Vec<_>>()
            .join(" ");
        info!(step = step, table = name, "{}", rendered);
        Ok(())
    }
}

/// Discards everything. Used by tests and benchmarks.
#[derive(Debug, Default)]
pub struct NullSink;

impl MetricSink for NullSink {
    fn log_scalars(&mut self, _step: usize, _scalars: &[(&str, f32)]) -> SinkResult {
        Ok(())
    }

    fn log_table(&mut self, _step: usize, _name: &str, _rows: &[(usize, f32)]) -> SinkResult {
        Ok(())
    }
}
