//! Termination-signal plumbing: block around worker spawn so only the
//! supervisor thread delivers, then install a handler that closes every
//! listening socket and exits. Termination is abrupt; there is no drain.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

use crate::config::MAX_WORKERS;

// Fixed fd slots so the handler touches nothing but atomics. Slots never
// recycle; registration past MAX_WORKERS is dropped.
static LISTENER_FDS: [AtomicI32; MAX_WORKERS] = [const { AtomicI32::new(-1) }; MAX_WORKERS];
static NEXT_SLOT: AtomicUsize = AtomicUsize::new(0);

const TERMINATION_SIGNALS: [libc::c_int; 3] = [libc::SIGINT, libc::SIGTERM, libc::SIGQUIT];

/// Record a listening socket for the termination handler.
pub fn register_listener(fd: RawFd) {
    let slot = NEXT_SLOT.fetch_add(1, Ordering::Relaxed);
    if let Some(s) = LISTENER_FDS.get(slot) {
        s.store(fd, Ordering::Relaxed);
    }
}

// Only close(2) and _exit(2) in here; both are async-signal-safe.
extern "C" fn handle_termination(_signo: libc::c_int) {
    for slot in &LISTENER_FDS {
        let fd = slot.load(Ordering::Relaxed);
        if fd >= 0 {
            unsafe {
                libc::close(fd);
            }
        }
    }
    unsafe { libc::_exit(0) }
}

fn termination_mask() -> libc::sigset_t {
    unsafe {
        let mut mask: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut mask);
        for sig in TERMINATION_SIGNALS {
            libc::sigaddset(&mut mask, sig);
        }
        mask
    }
}

/// Block termination signals in the calling thread; spawned workers inherit
/// the mask, so only the thread that later unblocks delivers them.
pub fn block_termination() -> io::Result<()> {
    let mask = termination_mask();
    let rc = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &mask, std::ptr::null_mut()) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    Ok(())
}

/// Install the termination handler and unblock the signals again.
pub fn install_handlers() -> io::Result<()> {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handle_termination as extern "C" fn(libc::c_int) as usize;
        libc::sigemptyset(&mut sa.sa_mask);
        for sig in TERMINATION_SIGNALS {
            if libc::sigaction(sig, &sa, std::ptr::null_mut()) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
    }
    let mask = termination_mask();
    let rc = unsafe { libc::pthread_sigmask(libc::SIG_UNBLOCK, &mask, std::ptr::null_mut()) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    Ok(())
}
