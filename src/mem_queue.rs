//! In-memory packet queues with eventfd completion signaling.
//!
//! Each queue pairs a bounded MPMC buffer with an `eventfd` in semaphore
//! mode. A push enqueues the packet and then writes 1 to the eventfd; a
//! completed 8-byte read of the eventfd is a claim ticket for exactly one
//! packet, so several workers with outstanding pops on the same queue each
//! receive exactly one packet per armed pop. The enqueue happens before the
//! signal, so a granted ticket always finds its packet.

use std::io;
use std::os::unix::io::RawFd;

use crossbeam_queue::ArrayQueue;

use crate::datapath::Packet;

pub struct MemQueue {
    items: ArrayQueue<Packet>,
    efd: RawFd,
}

impl MemQueue {
    pub fn new(capacity: usize) -> io::Result<Self> {
        let efd = unsafe { libc::eventfd(0, libc::EFD_SEMAPHORE | libc::EFD_NONBLOCK) };
        if efd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            items: ArrayQueue::new(capacity),
            efd,
        })
    }

    /// The fd a popper arms a read on to learn a packet is claimable.
    pub fn eventfd(&self) -> RawFd {
        self.efd
    }

    /// Enqueue a packet and signal one ticket. Returns the packet on a full
    /// queue so ownership stays with the submitter.
    pub fn push(&self, pkt: Packet) -> Result<(), Packet> {
        self.items.push(pkt)?;
        let val: u64 = 1;
        unsafe {
            libc::write(self.efd, &val as *const u64 as *const libc::c_void, 8);
        }
        Ok(())
    }

    /// Take one packet. Valid only after consuming a ticket from the eventfd.
    pub fn claim(&self) -> Option<Packet> {
        self.items.pop()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl Drop for MemQueue {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.efd);
        }
    }
}
