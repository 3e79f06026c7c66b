//! Process-wide counters. Relaxed atomics; each hot counter has a single
//! writer, readers are the reporter thread and tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::info;

use crate::config::{MAX_WORKERS, REPORT_INTERVAL_SECS};

static CONNS_ACCEPTED: AtomicU64 = AtomicU64::new(0);
static REQUESTS_RECEIVED: AtomicU64 = AtomicU64::new(0);
static RESPONSES_SENT: AtomicU64 = AtomicU64::new(0);
static BAD_REQUESTS: AtomicU64 = AtomicU64::new(0);
static PARTIAL_DROPPED: AtomicU64 = AtomicU64::new(0);
static COMPUTE_SERVED: [AtomicU64; MAX_WORKERS] =
    [const { AtomicU64::new(0) }; MAX_WORKERS];

#[derive(Clone, Copy)]
pub struct MetricsSnapshot {
    pub conns_accepted: u64,
    pub requests_received: u64,
    pub responses_sent: u64,
    pub bad_requests: u64,
    pub partial_dropped: u64,
    pub compute_served: [u64; MAX_WORKERS],
}

pub fn inc_conns_accepted() {
    CONNS_ACCEPTED.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_requests_received() {
    REQUESTS_RECEIVED.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_responses_sent() {
    RESPONSES_SENT.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_bad_requests() {
    BAD_REQUESTS.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_partial_dropped() {
    PARTIAL_DROPPED.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_compute_served(worker: usize) {
    if let Some(counter) = COMPUTE_SERVED.get(worker) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Requests answered by one compute worker since process start.
pub fn compute_served(worker: usize) -> u64 {
    COMPUTE_SERVED
        .get(worker)
        .map(|c| c.load(Ordering::Relaxed))
        .unwrap_or(0)
}

pub fn snapshot() -> MetricsSnapshot {
    let mut compute_served = [0u64; MAX_WORKERS];
    for (slot, counter) in compute_served.iter_mut().zip(COMPUTE_SERVED.iter()) {
        *slot = counter.load(Ordering::Relaxed);
    }
    MetricsSnapshot {
        conns_accepted: CONNS_ACCEPTED.load(Ordering::Relaxed),
        requests_received: REQUESTS_RECEIVED.load(Ordering::Relaxed),
        responses_sent: RESPONSES_SENT.load(Ordering::Relaxed),
        bad_requests: BAD_REQUESTS.load(Ordering::Relaxed),
        partial_dropped: PARTIAL_DROPPED.load(Ordering::Relaxed),
        compute_served,
    }
}

/// Periodically log throughput deltas. Spawned by the binary; never joined.
pub fn spawn_reporter() {
    std::thread::spawn(|| {
        let mut last = snapshot();
        loop {
            std::thread::sleep(Duration::from_secs(REPORT_INTERVAL_SECS));
            let snap = snapshot();
            info!(
                "metrics delta {}s: accepted={} received={} sent={} bad={} partial={}",
                REPORT_INTERVAL_SECS,
                snap.conns_accepted.saturating_sub(last.conns_accepted),
                snap.requests_received.saturating_sub(last.requests_received),
                snap.responses_sent.saturating_sub(last.responses_sent),
                snap.bad_requests.saturating_sub(last.bad_requests),
                snap.partial_dropped.saturating_sub(last.partial_dropped),
            );
            last = snap;
        }
    });
}
