//! Metrics Collector
//!
//! Named counters, gauges and histograms behind read-mostly maps, exported
//! in Prometheus text format. Names are prefixed with the collector
//! namespace on export.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

/// Monotonic counter
#[derive(Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment by 1
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment by n
    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.value.store(0, Ordering::Relaxed);
    }
}

/// Floating point gauge (stored as `f64` bits)
#[derive(Default)]
pub struct Gauge {
    bits: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }

    /// Add `delta` (may be negative)
    pub fn add(&self, delta: f64) {
        let mut current = self.bits.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + delta).to_bits();
            match self
                .bits
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn inc(&self) {
        self.add(1.0);
    }

    pub fn dec(&self) {
        self.add(-1.0);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

/// Histogram bucket
#[derive(Debug, Clone)]
pub struct HistogramBucket {
    /// Upper bound (inclusive)
    pub le: f64,
    /// Cumulative count of observations `<= le`
    pub count: u64,
}

/// Bucketed histogram
pub struct Histogram {
    boundaries: Vec<f64>,
    buckets: Vec<AtomicU64>,
    /// Sum scaled by 1000 to keep three decimals in an integer
    sum_milli: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    /// Operation latency buckets in milliseconds
    pub fn latency_ms() -> Self {
        Self::with_buckets(vec![
            1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1_000.0, 2_500.0, 5_000.0, 10_000.0,
            30_000.0,
        ])
    }

    pub fn with_buckets(mut boundaries: Vec<f64>) -> Self {
        boundaries.retain(|b| b.is_finite());
        boundaries.sort_by(|a, b| a.total_cmp(b));
        boundaries.dedup();
        let buckets = boundaries.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            boundaries,
            buckets,
            sum_milli: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record a non-negative observation
    pub fn observe(&self, value: f64) {
        let value = value.max(0.0);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_milli
            .fetch_add((value * 1_000.0) as u64, Ordering::Relaxed);
        for (i, &boundary) in self.boundaries.iter().enumerate() {
            if value <= boundary {
                self.buckets[i].fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Record a duration in milliseconds
    pub fn observe_duration(&self, duration: Duration) {
        self.observe(duration.as_secs_f64() * 1_000.0);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> f64 {
        self.sum_milli.load(Ordering::Relaxed) as f64 / 1_000.0
    }

    pub fn buckets(&self) -> Vec<HistogramBucket> {
        self.boundaries
            .iter()
            .zip(self.buckets.iter())
            .map(|(&le, count)| HistogramBucket {
                le,
                count: count.load(Ordering::Relaxed),
            })
            .collect()
    }

    pub fn average(&self) -> f64 {
        match self.count() {
            0 => 0.0,
            n => self.sum() / n as f64,
        }
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::latency_ms()
    }
}

/// Registry of named metrics
pub struct MetricsCollector {
    namespace: String,
    counters: RwLock<HashMap<String, Arc<Counter>>>,
    gauges: RwLock<HashMap<String, Arc<Gauge>>>,
    histograms: RwLock<HashMap<String, Arc<Histogram>>>,
    start_time: Instant,
}

fn get_or_insert<T: Default>(map: &RwLock<HashMap<String, Arc<T>>>, name: &str) -> Arc<T> {
    if let Some(existing) = map.read().get(name) {
        return existing.clone();
    }
    map.write()
        .entry(name.to_string())
        .or_insert_with(|| Arc::new(T::default()))
        .clone()
}

impl MetricsCollector {
    /// Create a collector whose exported names are `<namespace>_<name>`
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            counters: RwLock::new(HashMap::new()),
            gauges: RwLock::new(HashMap::new()),
            histograms: RwLock::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }

    /// Get or create a counter
    pub fn counter(&self, name: &str) -> Arc<Counter> {
        get_or_insert(&self.counters, name)
    }

    /// Get or create a gauge
    pub fn gauge(&self, name: &str) -> Arc<Gauge> {
        get_or_insert(&self.gauges, name)
    }

    /// Get or create a latency histogram (milliseconds)
    pub fn histogram(&self, name: &str) -> Arc<Histogram> {
        get_or_insert(&self.histograms, name)
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn get_counters(&self) -> BTreeMap<String, u64> {
        self.counters
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.get()))
            .collect()
    }

    pub fn get_gauges(&self) -> BTreeMap<String, f64> {
        self.gauges
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.get()))
            .collect()
    }

    /// Reset all counters
    pub fn reset(&self) {
        for counter in self.counters.read().values() {
            counter.reset();
        }
    }

    fn full_name(&self, name: &str) -> String {
        if self.namespace.is_empty() {
            name.to_string()
        } else {
            format!("{}_{}", self.namespace, name)
        }
    }

    /// Export metrics as Prometheus text, sorted by name
    pub fn export_text(&self) -> String {
        let mut output = String::new();

        for (name, value) in self.get_counters() {
            let name = self.full_name(&name);
            output.push_str(&format!("# TYPE {} counter\n{} {}\n", name, name, value));
        }

        for (name, value) in self.get_gauges() {
            let name = self.full_name(&name);
            output.push_str(&format!("# TYPE {} gauge\n{} {}\n", name, name, value));
        }

        let histograms: BTreeMap<String, Arc<Histogram>> = self
            .histograms
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (name, histogram) in histograms {
            let name = self.full_name(&name);
            output.push_str(&format!("# TYPE {} histogram\n", name));
            for bucket in histogram.buckets() {
                output.push_str(&format!(
                    "{}_bucket{{le=\"{}\"}} {}\n",
                    name, bucket.le, bucket.count
                ));
            }
            output.push_str(&format!(
                "{}_bucket{{le=\"+Inf\"}} {}\n",
                name,
                histogram.count()
            ));
            output.push_str(&format!("{}_sum {}\n", name, histogram.sum()));
            output.push_str(&format!("{}_count {}\n", name, histogram.count()));
        }

        output
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new("quantcache")
    }
}

// =============================================================================
// Tests
// =============================================================================
