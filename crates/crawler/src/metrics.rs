// farcrawl is a polite, high-throughput web crawler.
// Copyright (C) 2024 The farcrawl Authors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! In-process metrics (spec §6): plain `std::sync::atomic` counters and
//! gauges, aggregated and logged on the orchestrator's metrics tick.
//! Exposition to Prometheus/StatsD is explicitly out of scope; this module
//! only names and updates the numbers.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    pub pages_fetched_total: AtomicU64,
    pub fetch_errors_total: AtomicU64,
    pub frontier_enqueued_total: AtomicU64,
    pub frontier_dropped_bloom_total: AtomicU64,
    pub parse_queue_depth: AtomicI64,
    pub parse_queue_bytes: AtomicI64,
}

impl Metrics {
    pub fn record_fetch_ok(&self) {
        self.pages_fetched_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fetch_error(&self) {
        self.fetch_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_enqueued(&self, n: u64) {
        self.frontier_enqueued_total.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_dropped_bloom(&self, n: u64) {
        self.frontier_dropped_bloom_total.fetch_add(n, Ordering::Relaxed);
    }

    pub fn queue_push(&self, bytes: i64) {
        self.parse_queue_depth.fetch_add(1, Ordering::Relaxed);
        self.parse_queue_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn queue_pop(&self, bytes: i64) {
        self.parse_queue_depth.fetch_sub(1, Ordering::Relaxed);
        self.parse_queue_bytes.fetch_sub(bytes, Ordering::Relaxed);
    }

    /// Logs a structured snapshot; called on the orchestrator's
    /// `metrics_interval_seconds` tick.
    pub fn log_snapshot(&self) {
        tracing::info!(
            pages_fetched_total = self.pages_fetched_total.load(Ordering::Relaxed),
            fetch_errors_total = self.fetch_errors_total.load(Ordering::Relaxed),
            frontier_enqueued_total = self.frontier_enqueued_total.load(Ordering::Relaxed),
            frontier_dropped_bloom_total = self.frontier_dropped_bloom_total.load(Ordering::Relaxed),
            parse_queue_depth = self.parse_queue_depth.load(Ordering::Relaxed),
            parse_queue_bytes = self.parse_queue_bytes.load(Ordering::Relaxed),
            "crawler metrics snapshot"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_push_and_pop_are_balanced() {
        let m = Metrics::default();
        m.queue_push(100);
        m.queue_push(200);
        assert_eq!(m.parse_queue_depth.load(Ordering::Relaxed), 2);
        assert_eq!(m.parse_queue_bytes.load(Ordering::Relaxed), 300);

        m.queue_pop(100);
        assert_eq!(m.parse_queue_depth.load(Ordering::Relaxed), 1);
        assert_eq!(m.parse_queue_bytes.load(Ordering::Relaxed), 200);
    }

    #[test]
    fn counters_accumulate() {
        let m = Metrics::default();
        m.record_fetch_ok();
        m.record_fetch_ok();
        m.record_fetch_error();
        assert_eq!(m.pages_fetched_total.load(Ordering::Relaxed), 2);
        assert_eq!(m.fetch_errors_total.load(Ordering::Relaxed), 1);
    }
}
