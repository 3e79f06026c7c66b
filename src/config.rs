//! Server sizing and operational configuration.
//!
//! Hardcoded values that are not part of the HTTP wire contract. Anything a
//! deployment tunes at runtime lives in `supervisor::ServerConfig` instead.

/// Upper bound on workers of either kind. Sizes the per-compute-worker
/// metric array and the signal module's listener slots.
pub const MAX_WORKERS: usize = 64;

/// io_uring submission ring depth per worker.
pub const RING_DEPTH: u32 = 4096;

/// Per-pop socket read buffer size (bytes). A request must fit in one pop;
/// partial requests are dropped, not reassembled.
pub const POP_BUF_SIZE: usize = 65536;

/// In-memory queue capacity (packets). A full queue is a fatal submission
/// error, so this must exceed the number of requests the connection workers
/// can have in flight toward one compute worker.
pub const MEM_QUEUE_CAPACITY: usize = 1024;

/// Listen backlog per connection worker.
pub const LISTEN_BACKLOG: i32 = 10;

/// Upper bound on the regex builder's HTML body (bytes).
pub const MAX_REGEX_HTML: usize = 8192;

pub const DEFAULT_PORT: u16 = 8080;

/// Metrics reporter period (seconds).
pub const REPORT_INTERVAL_SECS: u64 = 10;

// Compile-time sanity checks
const _: () = assert!(
    MAX_WORKERS <= 256,
    "supervisor cpu plan assumes worker ids fit alongside cpu 0"
);
const _: () = assert!(
    MAX_REGEX_HTML <= POP_BUF_SIZE,
    "a regex response must fit in one pop buffer"
);
const _: () = assert!(MEM_QUEUE_CAPACITY >= 2, "queue capacity too small");
