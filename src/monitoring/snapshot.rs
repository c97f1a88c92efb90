//! Point-in-time snapshots and their rolling history

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// System resource usage at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub timestamp: DateTime<Utc>,
    /// Global CPU usage, 0-100
    pub cpu_percent: f64,
    /// Used memory, 0-100
    pub memory_percent: f64,
    pub available_memory_bytes: u64,
    pub cpu_count: usize,
    /// 1-minute load average, where the platform reports one
    pub load_average: Option<f64>,
    /// IO wait percentage, where the platform reports one
    pub io_wait: Option<f64>,
}

impl ResourceSnapshot {
    /// Available memory in MiB
    pub fn available_memory_mb(&self) -> f64 {
        self.available_memory_bytes as f64 / (1024.0 * 1024.0)
    }
}

/// Operation performance aggregated over a recent window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub timestamp: DateTime<Utc>,
    /// Number of completed operations in the window
    pub operation_count: usize,
    pub mean_duration_ms: f64,
    pub p95_duration_ms: f64,
    /// Completed operations per second over the window
    pub throughput_ops_per_sec: f64,
    /// Fraction of operations that recorded an error, 0-1
    pub error_rate: f64,
    /// Cache hits / (hits + misses) reported by operations, 0-1
    pub cache_hit_rate: f64,
    /// Operations per MiB of memory reported by operations (0 if none reported)
    pub memory_efficiency: f64,
}

/// Anything with a wall-clock timestamp
pub trait Timestamped {
    fn timestamp(&self) -> DateTime<Utc>;
}

impl Timestamped for ResourceSnapshot {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

impl Timestamped for PerformanceSnapshot {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Fixed-capacity history; the oldest item is dropped on overflow
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T: Clone> RingBuffer<T> {
    /// Create a buffer holding at most `capacity` items (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append, evicting the oldest item when full
    pub fn push(&mut self, item: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    /// Most recent item
    pub fn latest(&self) -> Option<&T> {
        self.items.back()
    }

    /// All items, oldest first
    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T: Clone + Timestamped> RingBuffer<T> {
    /// Items recorded at or after `cutoff`, oldest first
    pub fn since(&self, cutoff: DateTime<Utc>) -> Vec<T> {
        self.items
            .iter()
            .filter(|item| item.timestamp() >= cutoff)
            .cloned()
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn resource_at(ts: DateTime<Utc>, cpu: f64) -> ResourceSnapshot {
        ResourceSnapshot {
            timestamp: ts,
            cpu_percent: cpu,
            memory_percent: 50.0,
            available_memory_bytes: 2 * 1024 * 1024 * 1024,
            cpu_count: 4,
            load_average: None,
            io_wait: None,
        }
    }

    #[test]
    fn test_ring_buffer_drops_oldest() {
        let mut buf = RingBuffer::new(3);
        for i in 0..5 {
            buf.push(i);
        }
        assert_eq!(buf.to_vec(), vec![2, 3, 4]);
        assert_eq!(buf.latest(), Some(&4));
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_zero_capacity_holds_one() {
        let mut buf = RingBuffer::new(0);
        buf.push("a");
        buf.push("b");
        assert_eq!(buf.to_vec(), vec!["b"]);
    }

    #[test]
    fn test_since_filters_by_timestamp() {
        let now = Utc::now();
        let mut buf = RingBuffer::new(10);
        buf.push(resource_at(now - chrono::Duration::seconds(120), 10.0));
        buf.push(resource_at(now - chrono::Duration::seconds(30), 20.0));
        buf.push(resource_at(now, 30.0));

        let recent = buf.since(now - chrono::Duration::seconds(60));
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].cpu_percent, 20.0);
    }

    #[test]
    fn test_available_memory_mb() {
        let snap = resource_at(Utc::now(), 0.0);
        assert_eq!(snap.available_memory_mb(), 2048.0);
    }
}
