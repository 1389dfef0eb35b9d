//! Receiver engines and the harness that drives them.
//!
//! Each engine is a single-threaded receive loop owning all of its state;
//! one engine maps to one OS thread. The only cross-thread signal is the
//! atomic shutdown flag: process-wide for SIGINT, per-engine for the
//! harness.

mod epoll;
mod uring;

pub use epoll::EpollEngine;
pub use uring::UringEngine;

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::error::Result;
use crate::socket::ListenSock;

/// Process-wide shutdown flag, flipped by the SIGINT handler.
pub static GLOBAL_SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// The seam both engines implement; the harness drives receivers through
/// it without caring which notifier is underneath.
pub trait Runner: Send {
    fn name(&self) -> &str;

    /// Hand the engine a listening socket. Called before `run`.
    fn add_listen_sock(&mut self, sock: ListenSock) -> Result<()>;

    /// Run the receive loop until shutdown is observed (and, for the ring
    /// engine, in-flight connections drain). Blocking.
    fn run(&mut self, shutdown: &AtomicBool) -> Result<()>;

    /// Begin stopping: close listeners so no new connections arrive.
    fn stop(&mut self);
}

/// Byte, request and connection accounting shared by both engines.
#[derive(Debug, Default)]
pub struct EngineCounters {
    bytes_rx: u64,
    requests_rx: u64,
    socks: usize,
}

impl EngineCounters {
    pub fn did_read(&mut self, n: usize) {
        self.bytes_rx += n as u64;
    }

    pub fn finished_requests(&mut self, n: u32) {
        self.requests_rx += u64::from(n);
    }

    pub fn new_sock(&mut self) {
        self.socks += 1;
        if self.socks % 100 == 0 {
            debug!("add sock: now {}", self.socks);
        }
    }

    pub fn del_sock(&mut self) {
        self.socks -= 1;
        if self.socks % 100 == 0 {
            debug!("del sock: now {}", self.socks);
        }
    }

    pub fn bytes(&self) -> u64 {
        self.bytes_rx
    }

    pub fn requests(&self) -> u64 {
        self.requests_rx
    }

    pub fn socks(&self) -> usize {
        self.socks
    }
}

/// Install the SIGINT handler that flips [`GLOBAL_SHUTDOWN`]. A second
/// interrupt while shutdown is pending exits immediately.
pub fn install_sigint_handler() {
    extern "C" fn on_sigint(_: libc::c_int) {
        if GLOBAL_SHUTDOWN.swap(true, Ordering::SeqCst) {
            // Signal-handler context: only async-signal-safe calls here.
            unsafe { libc::_exit(130) };
        }
    }
    let handler = on_sigint as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_track_sockets_and_traffic() {
        let mut c = EngineCounters::default();
        c.new_sock();
        c.new_sock();
        c.did_read(100);
        c.did_read(42);
        c.finished_requests(3);
        c.del_sock();
        assert_eq!(c.socks(), 1);
        assert_eq!(c.bytes(), 142);
        assert_eq!(c.requests(), 3);
    }
}
