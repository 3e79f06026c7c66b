//! Split-mode routing policies.

use std::str::FromStr;

use crate::protocol;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Spread requests over compute workers by arrival count.
    RoundRobin,
    /// Route by request kind so one worker's caches see one shape of work.
    ByType,
    /// Stable mapping: connection worker `i` always talks to compute
    /// worker `i`. Requires at least as many compute workers as
    /// connection workers.
    OneToOne,
}

impl Policy {
    /// Pick the compute worker for a freshly received request. `received`
    /// is the 1-indexed arrival count on this connection worker.
    pub fn select(
        self,
        worker_id: usize,
        received: u64,
        payload: &[u8],
        n_compute: usize,
    ) -> usize {
        match self {
            Policy::RoundRobin => (received % n_compute as u64) as usize,
            Policy::ByType => protocol::classify_raw(payload).tag() % n_compute,
            Policy::OneToOne => worker_id,
        }
    }
}

impl FromStr for Policy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round-robin" | "rr" => Ok(Policy::RoundRobin),
            "by-type" => Ok(Policy::ByType),
            "one-to-one" => Ok(Policy::OneToOne),
            other => Err(format!("unknown policy {other:?}")),
        }
    }
}
