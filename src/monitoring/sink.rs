//! Metric Record Stream
//!
//! Every metric event becomes one timestamped [`MetricRecord`] handed to a
//! [`MetricSink`]. Sinks are independent of `tracing`: the stream is data
//! for append-only consumers, logs are for operators.

use std::collections::{BTreeMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;

/// Source area of a metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricCategory {
    Resource,
    Operation,
    Performance,
    Cache,
    Pool,
    Tuner,
    Precompute,
}

/// One metric event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub name: String,
    pub value: f64,
    pub unit: String,
    pub category: MetricCategory,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl MetricRecord {
    /// Record stamped now with no tags
    pub fn new(
        name: impl Into<String>,
        value: f64,
        unit: impl Into<String>,
        category: MetricCategory,
    ) -> Self {
        Self {
            name: name.into(),
            value,
            unit: unit.into(),
            category,
            tags: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Attach tags
    pub fn with_tags(mut self, tags: BTreeMap<String, String>) -> Self {
        self.tags = tags;
        self
    }

    /// Attach one tag
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// Consumer of the metric record stream
pub trait MetricSink: Send + Sync {
    /// Deliver one record. Must not block for long.
    fn record(&self, record: &MetricRecord);

    /// Flush buffered output, if any
    fn flush(&self) {}
}

// =============================================================================
// Tracing sink
// =============================================================================

/// Emits each record as a `tracing` event
#[derive(Debug, Clone, Default)]
pub struct TracingMetricSink {
    info_level: bool,
}

impl TracingMetricSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn info_level() -> Self {
        Self { info_level: true }
    }

    pub fn debug_level() -> Self {
        Self { info_level: false }
    }
}

impl MetricSink for TracingMetricSink {
    fn record(&self, record: &MetricRecord) {
        if self.info_level {
            info!(
                metric = %record.name,
                value = record.value,
                unit = %record.unit,
                category = ?record.category,
                tags = ?record.tags,
                "Metric"
            );
        } else {
            debug!(
                metric = %record.name,
                value = record.value,
                unit = %record.unit,
                category = ?record.category,
                tags = ?record.tags,
                "Metric"
            );
        }
    }
}

// =============================================================================
// In-memory sink
// =============================================================================

/// Bounded in-memory record buffer; the oldest record is dropped on overflow
#[derive(Debug)]
pub struct InMemoryMetricSink {
    records: RwLock<VecDeque<MetricRecord>>,
    capacity: usize,
}

impl InMemoryMetricSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: RwLock::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn records(&self) -> Vec<MetricRecord> {
        self.records.read().iter().cloned().collect()
    }

    /// Records with the given name
    pub fn records_named(&self, name: &str) -> Vec<MetricRecord> {
        self.records
            .read()
            .iter()
            .filter(|r| r.name == name)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn clear(&self) {
        self.records.write().clear();
    }
}

impl Default for InMemoryMetricSink {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl MetricSink for InMemoryMetricSink {
    fn record(&self, record: &MetricRecord) {
        let mut records = self.records.write();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record.clone());
    }
}

// =============================================================================
// JSON lines sink
// =============================================================================

/// Appends one JSON object per line to a file
pub struct JsonLinesMetricSink {
    writer: Mutex<BufWriter<File>>,
}

impl JsonLinesMetricSink {
    /// Open `path` for appending, creating it if needed
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

impl MetricSink for JsonLinesMetricSink {
    fn record(&self, record: &MetricRecord) {
        let line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(e) => {
                warn!(metric = %record.name, error = %e, "Failed to encode metric record");
                return;
            }
        };
        let mut writer = self.writer.lock();
        if let Err(e) = writeln!(writer, "{}", line) {
            warn!(error = %e, "Failed to write metric record");
        }
    }

    fn flush(&self) {
        if let Err(e) = self.writer.lock().flush() {
            warn!(error = %e, "Failed to flush metric records");
        }
    }
}

impl Drop for JsonLinesMetricSink {
    fn drop(&mut self) {
        let _ = self.writer.get_mut().flush();
    }
}

// =============================================================================
// Composite sink
// =============================================================================

/// Fans records out to several sinks
#[derive(Default)]
pub struct CompositeMetricSink {
    sinks: Vec<Box<dyn MetricSink>>,
}

impl CompositeMetricSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink<S: MetricSink + 'static>(mut self, sink: S) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl std::fmt::Debug for CompositeMetricSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeMetricSink")
            .field("sink_count", &self.sinks.len())
            .finish()
    }
}

impl MetricSink for CompositeMetricSink {
    fn record(&self, record: &MetricRecord) {
        for sink in &self.sinks {
            sink.record(record);
        }
    }

    fn flush(&self) {
        for sink in &self.sinks {
            sink.flush();
        }
    }
}

impl<S: MetricSink + ?Sized> MetricSink for std::sync::Arc<S> {
    fn record(&self, record: &MetricRecord) {
        (**self).record(record)
    }

    fn flush(&self) {
        (**self).flush()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_tracing_sink_does_not_panic() {
        let sink = TracingMetricSink::info_level();
        sink.record(&MetricRecord::new("cpu_percent", 12.0, "percent", MetricCategory::Resource));
    }

    #[test]
    fn test_in_memory_sink_is_bounded() {
        let sink = InMemoryMetricSink::new(2);
        for i in 0..3 {
            sink.record(&MetricRecord::new("n", i as f64, "count", MetricCategory::Operation));
        }
        let values: Vec<f64> = sink.records().iter().map(|r| r.value).collect();
        assert_eq!(values, vec![1.0, 2.0]);

        sink.clear();
        assert!(sink.is_empty());
    }

    #[test]
    fn test_json_lines_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics").join("stream.jsonl");

        {
            let sink = JsonLinesMetricSink::open(&path).unwrap();
            sink.record(
                &MetricRecord::new("operation_duration", 12.5, "ms", MetricCategory::Operation)
                    .with_tag("operation", "backtest"),
            );
            sink.flush();
        }
        {
            let sink = JsonLinesMetricSink::open(&path).unwrap();
            sink.record(&MetricRecord::new("cache_hit_rate", 0.5, "ratio", MetricCategory::Cache));
        }

        let raw = std::fs::read_to_string(&path).unwrap();
        let records: Vec<MetricRecord> = raw
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].tags.get("operation").map(String::as_str), Some("backtest"));
        assert_eq!(records[1].category, MetricCategory::Cache);
    }

    #[test]
    fn test_composite_fans_out() {
        let a = Arc::new(InMemoryMetricSink::default());
        let b = Arc::new(InMemoryMetricSink::default());
        let composite = CompositeMetricSink::new()
            .with_sink(a.clone())
            .with_sink(b.clone())
            .with_sink(TracingMetricSink::debug_level());
        assert_eq!(composite.len(), 3);

        composite.record(&MetricRecord::new("x", 1.0, "", MetricCategory::Pool));
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
    }
}
