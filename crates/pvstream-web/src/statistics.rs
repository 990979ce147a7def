//! Server statistics collection.
//!
//! This module tracks server performance metrics:
//! - Update throughput (updates per second)
//! - Variable and history sizes
//! - WebSocket client and subscription counts
//! - Server uptime
//!
//! Counts are read from the dispatcher and the fan-out manager when a
//! snapshot is taken; only the update rate needs a periodic tick.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use pvstream_core::Dispatcher;
use pvstream_server::FanoutManager;
use serde::{Deserialize, Serialize};

/// Point-in-time server statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatistics {
    /// Updates ingested during the last rate window.
    pub updates_per_second: f64,
    /// Updates ingested since start.
    pub updates_dispatched: u64,
    /// Variables with a last value.
    pub variables: usize,
    /// Samples held across all history buffers.
    pub history_points: usize,
    /// Connected WebSocket clients.
    pub ws_clients: usize,
    /// Active `(connection, variable)` subscriptions.
    pub subscriptions: usize,
    /// Seconds since start.
    pub uptime: u64,
}

/// Collects and tracks server statistics.
pub struct StatisticsCollector {
    /// Server start time.
    start_time: Instant,

    /// Dispatcher total at the last rate update.
    last_total: AtomicU64,

    /// Last calculated update rate.
    update_rate: AtomicU64, // Stored as f64 bits
}

impl StatisticsCollector {
    /// Create a new statistics collector.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            last_total: AtomicU64::new(0),
            update_rate: AtomicU64::new(0),
        }
    }

    /// Update the rate from the dispatcher's running total (call once per second).
    pub fn update_rate(&self, total: u64) {
        let previous = self.last_total.swap(total, Ordering::Relaxed);
        let window = total.saturating_sub(previous);
        self.update_rate
            .store((window as f64).to_bits(), Ordering::Relaxed);
    }

    pub fn rate(&self) -> f64 {
        f64::from_bits(self.update_rate.load(Ordering::Relaxed))
    }

    /// Get current statistics snapshot.
    pub fn snapshot(&self, dispatcher: &Dispatcher, fanout: &FanoutManager) -> ServerStatistics {
        ServerStatistics {
            updates_per_second: self.rate(),
            updates_dispatched: dispatcher.notified_count(),
            variables: dispatcher.variables().len(),
            history_points: dispatcher.history().total_points(),
            ws_clients: fanout.connection_count(),
            subscriptions: fanout.total_subscriptions(),
            uptime: self.start_time.elapsed().as_secs(),
        }
    }
}

impl Default for StatisticsCollector {
    fn default() -> Self {
        Self::new()
    }
}
