//! Pool construction: validates the configuration, creates each compute
//! worker's queue pair, spawns pinned worker threads, and joins.
//!
//! CPU plan: the supervisor runs on CPU 0, connection worker `i` on CPU
//! `i + 1`, compute worker `i` on CPU `n_connection + 1 + i`.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{error, info, warn};
use parking_lot::Mutex;
use thiserror::Error;

use crate::config::{MAX_WORKERS, MEM_QUEUE_CAPACITY};
use crate::conn_worker::ConnWorker;
use crate::datapath::{Datapath, DatapathError, EndpointTable, QDesc};
use crate::http_worker::{ComputeHandle, HttpWorker};
use crate::policy::Policy;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub conn_workers: u16,
    pub compute_workers: u16,
    pub split: bool,
    pub policy: Policy,
    /// Base listen address; worker `i` listens on `base + 2*i`. All workers
    /// share the wildcard address when unset.
    pub ip: Option<Ipv4Addr>,
    pub port: u16,
    pub doc_root: PathBuf,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("worker counts must be nonzero")]
    ZeroWorkers,
    #[error("at most {MAX_WORKERS} workers of each kind are supported, got {0}")]
    TooManyWorkers(u16),
    #[error(
        "cannot map workers 1:1 with {conn} connection workers and {compute} compute workers"
    )]
    OneToOneMapping { conn: u16, compute: u16 },
    #[error("document root {} is not a directory", .0.display())]
    BadDocRoot(PathBuf),
    #[error("spawn failed: {0}")]
    Spawn(#[from] std::io::Error),
    #[error(transparent)]
    Datapath(#[from] DatapathError),
}

/// Listening descriptors, registered once per connection worker during
/// setup and read at shutdown.
pub struct Registry {
    listeners: Mutex<Vec<QDesc>>,
}

impl Registry {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn add_listener(&self, qd: QDesc) {
        self.listeners.lock().push(qd);
    }

    pub fn listeners(&self) -> Vec<QDesc> {
        self.listeners.lock().clone()
    }
}

pub struct Server {
    handles: Vec<JoinHandle<()>>,
    compute: Arc<Vec<ComputeHandle>>,
    registry: Arc<Registry>,
}

impl Server {
    pub fn compute_handles(&self) -> &[ComputeHandle] {
        &self.compute
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Blocks until every worker exits, which without a signal is never.
    pub fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

pub fn validate(config: &ServerConfig) -> Result<(), ConfigError> {
    if config.conn_workers == 0 || (config.split && config.compute_workers == 0) {
        return Err(ConfigError::ZeroWorkers);
    }
    for count in [config.conn_workers, config.compute_workers] {
        if count as usize > MAX_WORKERS {
            return Err(ConfigError::TooManyWorkers(count));
        }
    }
    if config.split
        && config.policy == Policy::OneToOne
        && config.conn_workers > config.compute_workers
    {
        return Err(ConfigError::OneToOneMapping {
            conn: config.conn_workers,
            compute: config.compute_workers,
        });
    }
    if !config.doc_root.is_dir() {
        return Err(ConfigError::BadDocRoot(config.doc_root.clone()));
    }
    Ok(())
}

/// Validate, build the pools, and return a handle over the running server.
pub fn launch(config: ServerConfig) -> Result<Server, ConfigError> {
    validate(&config)?;
    if config.split {
        info!("setting up work in split mode");
    } else {
        info!("setting up work in joined mode");
    }

    pin_current(0);

    let table = EndpointTable::new();
    let registry = Registry::new();

    // Queue pairs exist before any worker starts, so the handle table is
    // immutable by the time the first thread reads it.
    let mut compute = Vec::new();
    if config.split {
        for id in 0..config.compute_workers as usize {
            let in_qd = table.create_queue(MEM_QUEUE_CAPACITY)?;
            let out_qd = table.create_queue(MEM_QUEUE_CAPACITY)?;
            compute.push(ComputeHandle { id, in_qd, out_qd });
        }
    }
    let compute = Arc::new(compute);

    let mut handles = Vec::new();
    for id in 0..config.conn_workers as usize {
        let addr = worker_addr(&config, id);
        let table = table.clone();
        let compute = compute.clone();
        let registry = registry.clone();
        let split = config.split;
        let policy = config.policy;
        let doc_root = config.doc_root.clone();

        let handle = thread::Builder::new()
            .name(format!("conn-{id}"))
            .spawn(move || {
                pin_current(id + 1);
                let datapath = match Datapath::new(table) {
                    Ok(dp) => dp,
                    Err(e) => {
                        error!("connection worker {id}: datapath setup failed: {e}");
                        return;
                    }
                };
                let worker = ConnWorker {
                    id,
                    addr,
                    split,
                    policy,
                    doc_root,
                    compute,
                    registry,
                    datapath,
                };
                if let Err(e) = worker.run() {
                    error!("connection worker {id} died: {e}");
                }
            })?;
        handles.push(handle);
    }

    if config.split {
        for ch in compute.iter().copied() {
            let table = table.clone();
            let doc_root = config.doc_root.clone();
            let cpu = config.conn_workers as usize + 1 + ch.id;

            let handle = thread::Builder::new()
                .name(format!("http-{}", ch.id))
                .spawn(move || {
                    pin_current(cpu);
                    let datapath = match Datapath::new(table) {
                        Ok(dp) => dp,
                        Err(e) => {
                            error!("compute worker {}: datapath setup failed: {e}", ch.id);
                            return;
                        }
                    };
                    let worker = HttpWorker {
                        id: ch.id,
                        in_qd: ch.in_qd,
                        out_qd: ch.out_qd,
                        doc_root,
                        datapath,
                    };
                    if let Err(e) = worker.run() {
                        error!("compute worker {} died: {e}", ch.id);
                    }
                })?;
            handles.push(handle);
        }
    }

    Ok(Server {
        handles,
        compute,
        registry,
    })
}

fn worker_addr(config: &ServerConfig, id: usize) -> SocketAddrV4 {
    match config.ip {
        None => SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port),
        Some(base) => {
            let bits = u32::from(base) + 2 * id as u32;
            SocketAddrV4::new(Ipv4Addr::from(bits), config.port)
        }
    }
}

fn pin_current(cpu: usize) {
    if !core_affinity::set_for_current(core_affinity::CoreId { id: cpu }) {
        warn!("could not pin thread to cpu {cpu}");
    }
}
