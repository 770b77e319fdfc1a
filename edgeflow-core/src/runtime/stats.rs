//! Per-node counters.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;
use tokio::time::Instant;

/// Lock-free counters updated by a node loop and read by the topology.
#[derive(Debug, Default)]
pub struct StatManager {
    records_in: AtomicU64,
    records_out: AtomicU64,
    exceptions: AtomicU64,
    buffer_length: AtomicI64,
    process_latency_us: AtomicU64,
    last_exception: Mutex<Option<String>>,
}

/// Point-in-time copy of a node's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatSnapshot {
    pub records_in: u64,
    pub records_out: u64,
    pub exceptions: u64,
    pub buffer_length: i64,
    pub process_latency_us: u64,
    pub last_exception: Option<String>,
}

impl StatManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_records_in(&self) {
        self.records_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_records_out(&self) {
        self.records_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_exceptions(&self, message: &str) {
        self.exceptions.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last) = self.last_exception.lock() {
            *last = Some(message.to_string());
        }
    }

    pub fn set_buffer_length(&self, length: usize) {
        self.buffer_length.store(length as i64, Ordering::Relaxed);
    }

    pub fn process_time_start(&self) -> Instant {
        Instant::now()
    }

    pub fn process_time_end(&self, start: Instant) {
        self.process_latency_us
            .store(start.elapsed().as_micros() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatSnapshot {
        StatSnapshot {
            records_in: self.records_in.load(Ordering::Relaxed),
            records_out: self.records_out.load(Ordering::Relaxed),
            exceptions: self.exceptions.load(Ordering::Relaxed),
            buffer_length: self.buffer_length.load(Ordering::Relaxed),
            process_latency_us: self.process_latency_us.load(Ordering::Relaxed),
            last_exception: self.last_exception.lock().ok().and_then(|last| last.clone()),
        }
    }
}
