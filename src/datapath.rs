//! Completion-token datapath over io_uring sockets and in-memory queues.
//!
//! Every asynchronous operation is submitted non-blocking and yields a
//! [`QToken`]; completion is observed only through [`Datapath::wait`] or
//! [`Datapath::wait_any`]. Descriptors live in a process-wide
//! [`EndpointTable`] so a worker may push to a descriptor another worker
//! accepted; waits are per-thread, each worker owning its own ring.
//!
//! In-memory queue pops are bridged into the ring through the queue's
//! eventfd, so socket completions and cross-thread messages resolve through
//! the same wait call.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddrV4;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::ptr;
use std::sync::Arc;

use io_uring::{opcode, squeue::Entry, types::Fd};
use parking_lot::RwLock;
use slab::Slab;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;

use crate::config::{MEM_QUEUE_CAPACITY, POP_BUF_SIZE, RING_DEPTH};
use crate::mem_queue::MemQueue;

/// Opaque handle for a stream socket or an in-memory queue. The two kinds
/// are distinguishable only by provenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QDesc(usize);

/// Opaque handle for one submitted operation. Created at submission,
/// consumed by exactly one wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QToken(u64);

/// Buffer unit crossing stage boundaries: one owned payload plus an
/// optional envelope naming the client descriptor the payload belongs to.
/// The envelope rides queues untouched and is never a buffer itself.
#[derive(Debug)]
pub struct Packet {
    pub payload: Vec<u8>,
    pub origin: Option<QDesc>,
}

impl Packet {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            origin: None,
        }
    }

    pub fn with_origin(payload: Vec<u8>, origin: QDesc) -> Self {
        Self {
            payload,
            origin: Some(origin),
        }
    }
}

#[derive(Debug)]
pub struct Completion {
    pub qd: QDesc,
    pub result: OpResult,
}

#[derive(Debug)]
pub enum OpResult {
    Accepted(QDesc),
    Popped(Packet),
    Pushed,
    /// Raw errno. Reset and abort are terminal for one descriptor;
    /// everything else kills the worker.
    Failed(i32),
}

/// Whether an op failure condemns only its descriptor.
pub fn is_terminal(errno: i32) -> bool {
    errno == libc::ECONNRESET || errno == libc::ECONNABORTED
}

#[derive(Debug, Error)]
pub enum DatapathError {
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    #[error("bad queue descriptor {0:?}")]
    BadDescriptor(QDesc),
    #[error("descriptor {0:?} does not support this operation")]
    WrongKind(QDesc),
    #[error("in-memory queue {0:?} is full")]
    QueueFull(QDesc),
    #[error("unknown completion token {0:?}")]
    BadToken(QToken),
    #[error("queue {0:?} signaled ready but had no packet")]
    EmptyClaim(QDesc),
    #[error("packet from queue {0:?} carries no envelope")]
    MissingEnvelope(QDesc),
}

enum Endpoint {
    /// Dropping the socket closes the fd.
    Tcp(Socket),
    Queue(Arc<MemQueue>),
}

enum Resolved {
    Fd(RawFd),
    Queue(Arc<MemQueue>),
}

/// Process-wide descriptor table. Written on socket/queue creation, accept
/// and close; read on every submission.
pub struct EndpointTable {
    entries: RwLock<Slab<Endpoint>>,
}

impl EndpointTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: RwLock::new(Slab::new()),
        })
    }

    fn insert(&self, ep: Endpoint) -> QDesc {
        QDesc(self.entries.write().insert(ep))
    }

    fn resolve(&self, qd: QDesc) -> Result<Resolved, DatapathError> {
        match self.entries.read().get(qd.0) {
            Some(Endpoint::Tcp(sock)) => Ok(Resolved::Fd(sock.as_raw_fd())),
            Some(Endpoint::Queue(q)) => Ok(Resolved::Queue(q.clone())),
            None => Err(DatapathError::BadDescriptor(qd)),
        }
    }

    pub fn socket_fd(&self, qd: QDesc) -> Result<RawFd, DatapathError> {
        match self.resolve(qd)? {
            Resolved::Fd(fd) => Ok(fd),
            Resolved::Queue(_) => Err(DatapathError::WrongKind(qd)),
        }
    }

    fn with_tcp<R>(
        &self,
        qd: QDesc,
        f: impl FnOnce(&Socket) -> io::Result<R>,
    ) -> Result<R, DatapathError> {
        match self.entries.read().get(qd.0) {
            Some(Endpoint::Tcp(sock)) => Ok(f(sock)?),
            Some(Endpoint::Queue(_)) => Err(DatapathError::WrongKind(qd)),
            None => Err(DatapathError::BadDescriptor(qd)),
        }
    }

    /// Create an in-memory queue endpoint.
    pub fn create_queue(&self, capacity: usize) -> Result<QDesc, DatapathError> {
        let q = MemQueue::new(capacity)?;
        Ok(self.insert(Endpoint::Queue(Arc::new(q))))
    }

    fn adopt_socket(&self, fd: RawFd) -> QDesc {
        let socket = unsafe { Socket::from_raw_fd(fd) };
        let _ = socket.set_nodelay(true);
        self.insert(Endpoint::Tcp(socket))
    }

    pub fn close(&self, qd: QDesc) {
        self.entries.write().try_remove(qd.0);
    }
}

/// Thin wrapper around `IoUring` that centralises submission helpers.
struct Ring {
    inner: io_uring::IoUring,
}

impl Ring {
    fn new(entries: u32) -> io::Result<Self> {
        Ok(Self {
            inner: io_uring::IoUring::new(entries)?,
        })
    }

    /// Push an SQE, flushing the submission queue to the kernel if full.
    fn push(&mut self, sqe: &Entry) -> io::Result<()> {
        loop {
            let result = unsafe { self.inner.submission().push(sqe) };
            match result {
                Ok(()) => return Ok(()),
                Err(_) => {
                    // SQ full — flush to kernel and retry.
                    self.inner.submit()?;
                }
            }
        }
    }

    /// Block until at least one completion is available.
    fn wait(&mut self) -> io::Result<()> {
        self.inner.submit_and_wait(1).map(|_| ())
    }

    /// Drain all pending completions into a `(user_data, result)` vec.
    /// Collects eagerly so the borrow on the completion queue is released
    /// before any SQE submissions happen in the same loop iteration.
    fn drain(&mut self) -> Vec<(u64, i32)> {
        self.inner
            .completion()
            .map(|cqe| (cqe.user_data(), cqe.result()))
            .collect()
    }
}

enum Pending {
    Accept {
        listener: QDesc,
    },
    SocketPop {
        qd: QDesc,
        buf: Vec<u8>,
    },
    SocketPush {
        qd: QDesc,
        buf: Vec<u8>,
        written: usize,
    },
    QueuePop {
        qd: QDesc,
        queue: Arc<MemQueue>,
        /// 8-byte landing pad for the eventfd read; boxed so the kernel's
        /// pointer survives table growth.
        ticket: Box<u64>,
    },
    Ready(Completion),
}

/// Per-thread reactor: one ring, a token table, and a stash of completions
/// observed before their wait.
pub struct Datapath {
    table: Arc<EndpointTable>,
    ring: Ring,
    pending: HashMap<u64, Pending>,
    next_token: u64,
}

impl Datapath {
    pub fn new(table: Arc<EndpointTable>) -> Result<Self, DatapathError> {
        Ok(Self {
            table,
            ring: Ring::new(RING_DEPTH)?,
            pending: HashMap::new(),
            next_token: 0,
        })
    }

    pub fn table(&self) -> &Arc<EndpointTable> {
        &self.table
    }

    fn alloc_token(&mut self) -> u64 {
        let t = self.next_token;
        self.next_token += 1;
        t
    }

    /// Create a TCP stream socket ready to share an address with sibling
    /// workers.
    pub fn socket(&mut self) -> Result<QDesc, DatapathError> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;

        // SO_REUSEPORT via raw setsockopt (not in socket2 API)
        unsafe {
            let optval: libc::c_int = 1;
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_REUSEPORT,
                &optval as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }

        socket.set_nonblocking(true)?;
        socket.set_nodelay(true)?;
        Ok(self.table.insert(Endpoint::Tcp(socket)))
    }

    pub fn bind(&mut self, qd: QDesc, addr: SocketAddrV4) -> Result<(), DatapathError> {
        self.table.with_tcp(qd, |sock| sock.bind(&addr.into()))
    }

    pub fn listen(&mut self, qd: QDesc, backlog: i32) -> Result<(), DatapathError> {
        self.table.with_tcp(qd, |sock| sock.listen(backlog))
    }

    pub fn local_addr(&self, qd: QDesc) -> Result<SocketAddrV4, DatapathError> {
        self.table.with_tcp(qd, |sock| {
            sock.local_addr()?.as_socket_ipv4().ok_or_else(|| {
                io::Error::new(io::ErrorKind::AddrNotAvailable, "not an ipv4 socket")
            })
        })
    }

    /// Create an in-memory queue with the default capacity.
    pub fn queue(&mut self) -> Result<QDesc, DatapathError> {
        self.table.create_queue(MEM_QUEUE_CAPACITY)
    }

    /// Arm one accept. Completes as `Accepted(new_qd)` with the accepted
    /// socket registered in the shared table.
    pub fn accept(&mut self, qd: QDesc) -> Result<QToken, DatapathError> {
        let fd = self.table.socket_fd(qd)?;
        let key = self.alloc_token();
        self.pending.insert(key, Pending::Accept { listener: qd });
        let sqe = opcode::Accept::new(Fd(fd), ptr::null_mut(), ptr::null_mut())
            .build()
            .user_data(key);
        self.ring.push(&sqe)?;
        Ok(QToken(key))
    }

    /// Arm one pop. Socket: one read into a fresh buffer. Queue: an eventfd
    /// ticket read, resolved to a claimed packet at completion.
    pub fn pop(&mut self, qd: QDesc) -> Result<QToken, DatapathError> {
        match self.table.resolve(qd)? {
            Resolved::Fd(fd) => {
                let key = self.alloc_token();
                let mut buf = vec![0u8; POP_BUF_SIZE];
                let ptr = buf.as_mut_ptr();
                self.pending.insert(key, Pending::SocketPop { qd, buf });
                let sqe = opcode::Read::new(Fd(fd), ptr, POP_BUF_SIZE as u32)
                    .build()
                    .user_data(key);
                self.ring.push(&sqe)?;
                Ok(QToken(key))
            }
            Resolved::Queue(queue) => {
                let key = self.alloc_token();
                let mut ticket = Box::new(0u64);
                // The eventfd kernel ABI always writes exactly 8 bytes.
                let ptr = &mut *ticket as *mut u64 as *mut u8;
                let efd = queue.eventfd();
                self.pending.insert(key, Pending::QueuePop { qd, queue, ticket });
                let sqe = opcode::Read::new(Fd(efd), ptr, 8).build().user_data(key);
                self.ring.push(&sqe)?;
                Ok(QToken(key))
            }
        }
    }

    /// Submit a push. Ownership of the payload moves into the datapath and
    /// is released when the completing wait observes `Pushed`. A queue push
    /// is ready immediately; a full queue is a fatal submission error.
    pub fn push(&mut self, qd: QDesc, pkt: Packet) -> Result<QToken, DatapathError> {
        match self.table.resolve(qd)? {
            Resolved::Fd(fd) => {
                let key = self.alloc_token();
                let buf = pkt.payload;
                let ptr = buf.as_ptr();
                let len = buf.len() as u32;
                self.pending.insert(
                    key,
                    Pending::SocketPush {
                        qd,
                        buf,
                        written: 0,
                    },
                );
                let sqe = opcode::Write::new(Fd(fd), ptr, len).build().user_data(key);
                self.ring.push(&sqe)?;
                Ok(QToken(key))
            }
            Resolved::Queue(queue) => {
                queue.push(pkt).map_err(|_| DatapathError::QueueFull(qd))?;
                let key = self.alloc_token();
                self.pending.insert(
                    key,
                    Pending::Ready(Completion {
                        qd,
                        result: OpResult::Pushed,
                    }),
                );
                Ok(QToken(key))
            }
        }
    }

    /// Block until `qt` resolves.
    pub fn wait(&mut self, qt: QToken) -> Result<Completion, DatapathError> {
        loop {
            if let Some(comp) = self.take_ready(qt.0) {
                return Ok(comp);
            }
            if !self.pending.contains_key(&qt.0) {
                return Err(DatapathError::BadToken(qt));
            }
            self.ring.wait()?;
            self.process_completions()?;
        }
    }

    /// Block until any of `qts` resolves; returns the ready index. The
    /// caller must hold every token it has outstanding in `qts` (or wait on
    /// stragglers separately), otherwise a completion outside the set could
    /// leave this blocked.
    pub fn wait_any(&mut self, qts: &[QToken]) -> Result<(usize, Completion), DatapathError> {
        for qt in qts {
            if !self.pending.contains_key(&qt.0) {
                return Err(DatapathError::BadToken(*qt));
            }
        }
        loop {
            for (i, qt) in qts.iter().enumerate() {
                if let Some(comp) = self.take_ready(qt.0) {
                    return Ok((i, comp));
                }
            }
            self.ring.wait()?;
            self.process_completions()?;
        }
    }

    pub fn close(&mut self, qd: QDesc) {
        self.table.close(qd);
    }

    fn take_ready(&mut self, key: u64) -> Option<Completion> {
        match self.pending.get(&key) {
            Some(Pending::Ready(_)) => match self.pending.remove(&key) {
                Some(Pending::Ready(comp)) => Some(comp),
                _ => None,
            },
            _ => None,
        }
    }

    fn process_completions(&mut self) -> Result<(), DatapathError> {
        for (user_data, result) in self.ring.drain() {
            self.complete(user_data, result)?;
        }
        Ok(())
    }

    fn complete(&mut self, key: u64, result: i32) -> Result<(), DatapathError> {
        let Some(op) = self.pending.remove(&key) else {
            return Ok(());
        };
        let comp = match op {
            Pending::Accept { listener } => {
                if result < 0 {
                    Completion {
                        qd: listener,
                        result: OpResult::Failed(-result),
                    }
                } else {
                    let qd = self.table.adopt_socket(result as RawFd);
                    Completion {
                        qd: listener,
                        result: OpResult::Accepted(qd),
                    }
                }
            }
            Pending::SocketPop { qd, mut buf } => {
                if result > 0 {
                    buf.truncate(result as usize);
                    Completion {
                        qd,
                        result: OpResult::Popped(Packet::new(buf)),
                    }
                } else if result == 0 {
                    // EOF; the peer is gone, same terminal path as a reset.
                    Completion {
                        qd,
                        result: OpResult::Failed(libc::ECONNRESET),
                    }
                } else {
                    Completion {
                        qd,
                        result: OpResult::Failed(-result),
                    }
                }
            }
            Pending::SocketPush { qd, buf, written } => {
                if result < 0 {
                    Completion {
                        qd,
                        result: OpResult::Failed(-result),
                    }
                } else {
                    let written = written + result as usize;
                    if written < buf.len() {
                        // Short write: resubmit the tail under the same token.
                        let fd = self.table.socket_fd(qd)?;
                        let ptr = unsafe { buf.as_ptr().add(written) };
                        let len = (buf.len() - written) as u32;
                        self.pending
                            .insert(key, Pending::SocketPush { qd, buf, written });
                        let sqe = opcode::Write::new(Fd(fd), ptr, len).build().user_data(key);
                        self.ring.push(&sqe)?;
                        return Ok(());
                    }
                    // The payload is freed here, never before its push completed.
                    Completion {
                        qd,
                        result: OpResult::Pushed,
                    }
                }
            }
            Pending::QueuePop { qd, queue, .. } => {
                if result < 0 {
                    Completion {
                        qd,
                        result: OpResult::Failed(-result),
                    }
                } else {
                    let pkt = queue.claim().ok_or(DatapathError::EmptyClaim(qd))?;
                    Completion {
                        qd,
                        result: OpResult::Popped(pkt),
                    }
                }
            }
            ready @ Pending::Ready(_) => {
                self.pending.insert(key, ready);
                return Ok(());
            }
        };
        self.pending.insert(key, Pending::Ready(comp));
        Ok(())
    }
}

impl Drop for Datapath {
    fn drop(&mut self) {
        // The kernel may still write into in-flight buffers; leak them
        // rather than free under an active operation.
        for (_, op) in self.pending.drain() {
            std::mem::forget(op);
        }
    }
}
