//! The readiness-driven receiver engine.
//!
//! Listeners carry level-triggered read interest; accepted sockets are
//! edge-triggered, so every readable event drains the socket with
//! nonblocking recv until `EAGAIN` or a short read. Replies are written
//! inline after the read, or queued per loop with `batch_send` and
//! drained after dispatch. A reply that would block arms write interest;
//! the next writable event finishes the drain and disarms it.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use slab::Slab;
use tracing::{debug, warn};

use super::{EngineCounters, Runner, GLOBAL_SHUTDOWN};
use crate::config::EpollRxConfig;
use crate::error::{Result, RingmarkError};
use crate::protocol::FrameParser;
use crate::socket::ListenSock;
use crate::stats::RxStats;
use crate::workload::run_workload;

/// Event tags: listener slots carry the low bit, connection slots do not.
const TAG_LISTENER: u64 = 1;

#[inline]
fn listener_tag(slot: usize) -> u64 {
    ((slot as u64) << 1) | TAG_LISTENER
}

#[inline]
fn conn_tag(slot: usize) -> u64 {
    (slot as u64) << 1
}

struct EpollConn {
    fd: i32,
    parser: FrameParser,
    /// Reply bytes accepted but not yet written out.
    to_write: usize,
    /// Write interest is registered with the notifier.
    write_armed: bool,
}

enum ReadOutcome {
    Open,
    Closed,
}

/// The epoll receiver.
pub struct EpollEngine {
    name: String,
    cfg: EpollRxConfig,
    epfd: i32,
    conns: Slab<EpollConn>,
    listeners: Slab<ListenSock>,
    /// Shared recv target; replies are also sent from here (contents are
    /// irrelevant to the peer).
    recv_buf: Vec<u8>,
    events: Vec<libc::epoll_event>,
    write_queue: Vec<usize>,
    counters: EngineCounters,
    print_rx_stats: bool,
    print_read_stats: bool,
}

impl EpollEngine {
    pub fn new(
        cfg: EpollRxConfig,
        name: String,
        print_rx_stats: bool,
        print_read_stats: bool,
    ) -> Result<Self> {
        cfg.validate()?;
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(RingmarkError::Io(io::Error::last_os_error()));
        }
        Ok(Self {
            name,
            epfd,
            recv_buf: vec![0u8; cfg.common.recv_size],
            events: vec![libc::epoll_event { events: 0, u64: 0 }; cfg.common.max_events],
            write_queue: Vec::with_capacity(1024),
            cfg,
            conns: Slab::with_capacity(1024),
            listeners: Slab::with_capacity(4),
            counters: EngineCounters::default(),
            print_rx_stats,
            print_read_stats,
        })
    }

    fn ctl(&self, op: libc::c_int, fd: i32, events: u32, tag: u64) -> Result<()> {
        let mut ev = libc::epoll_event { events, u64: tag };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc < 0 {
            return Err(RingmarkError::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Register a freshly accepted socket with edge-triggered reads.
    fn register_sock(&mut self, cslot: usize) -> Result<()> {
        let fd = self.conns[cslot].fd;
        self.ctl(
            libc::EPOLL_CTL_ADD,
            fd,
            (libc::EPOLLIN | libc::EPOLLET) as u32,
            conn_tag(cslot),
        )
    }

    fn do_accept(&mut self, lslot: usize) -> Result<()> {
        loop {
            let fd = {
                let Some(ls) = self.listeners.get_mut(lslot) else {
                    return Ok(());
                };
                ls.scratch.len =
                    std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
                unsafe {
                    libc::accept4(
                        ls.fd,
                        (&mut ls.scratch.storage as *mut libc::sockaddr_storage)
                            .cast::<libc::sockaddr>(),
                        &mut ls.scratch.len,
                        libc::SOCK_NONBLOCK,
                    )
                }
            };
            if fd < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EAGAIN) {
                    return Ok(());
                }
                return Err(RingmarkError::Accept(err));
            }
            let cslot = self.conns.insert(EpollConn {
                fd,
                parser: FrameParser::new(),
                to_write: 0,
                write_armed: false,
            });
            self.register_sock(cslot)?;
            self.counters.new_sock();
        }
    }

    fn do_socket(&mut self, cslot: usize, events: u32, reads: &mut u32) -> Result<()> {
        if !self.conns.contains(cslot) {
            return Ok(());
        }
        if events & libc::EPOLLIN as u32 != 0 {
            *reads += 1;
            if let ReadOutcome::Closed = self.do_read(cslot)? {
                return Ok(());
            }
        }
        let to_write = self.conns.get(cslot).map_or(0, |c| c.to_write);
        if events & libc::EPOLLOUT as u32 != 0 || (to_write > 0 && !self.cfg.batch_send) {
            self.do_write(cslot)?;
        } else if to_write > 0 {
            self.write_queue.push(cslot);
        }
        Ok(())
    }

    /// Drain the socket until it would block or delivers a short read.
    fn do_read(&mut self, cslot: usize) -> Result<ReadOutcome> {
        loop {
            let Some(conn) = self.conns.get_mut(cslot) else {
                return Ok(ReadOutcome::Closed);
            };
            let fd = conn.fd;
            let res = if self.cfg.common.recvmsg {
                let mut iov = libc::iovec {
                    iov_base: self.recv_buf.as_mut_ptr().cast(),
                    iov_len: self.recv_buf.len(),
                };
                let mut hdr: libc::msghdr = unsafe { std::mem::zeroed() };
                hdr.msg_iov = &mut iov;
                hdr.msg_iovlen = 1;
                unsafe { libc::recvmsg(fd, &mut hdr, libc::MSG_NOSIGNAL) }
            } else {
                unsafe {
                    libc::recv(
                        fd,
                        self.recv_buf.as_mut_ptr().cast(),
                        self.recv_buf.len(),
                        libc::MSG_NOSIGNAL,
                    )
                }
            };

            if res <= 0 {
                let err = io::Error::last_os_error();
                if res < 0 && err.raw_os_error() == Some(libc::EAGAIN) {
                    return Ok(ReadOutcome::Open);
                }
                self.close_conn(cslot);
                return Ok(ReadOutcome::Closed);
            }

            let n = res as usize;
            self.counters.did_read(n);
            let consumed = {
                let Some(conn) = self.conns.get_mut(cslot) else {
                    return Ok(ReadOutcome::Closed);
                };
                conn.parser.consume(&self.recv_buf[..n])
            };
            run_workload(consumed.frames, self.cfg.common.workload);
            self.counters.finished_requests(consumed.frames);
            if let Some(conn) = self.conns.get_mut(cslot) {
                conn.to_write += consumed.owed_reply_bytes;
            }

            if n < self.recv_buf.len() {
                return Ok(ReadOutcome::Open);
            }
        }
    }

    /// Write owed reply bytes until drained or the socket pushes back,
    /// then reconcile write interest with what is left.
    fn do_write(&mut self, cslot: usize) -> Result<()> {
        let Some(conn) = self.conns.get_mut(cslot) else {
            return Ok(());
        };
        while conn.to_write > 0 {
            let n = conn.to_write.min(self.recv_buf.len());
            let res = unsafe {
                libc::send(
                    conn.fd,
                    self.recv_buf.as_ptr().cast(),
                    n,
                    libc::MSG_NOSIGNAL,
                )
            };
            if res < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EAGAIN) {
                    break;
                }
                // Socket is dying; the read path will observe it.
                warn!(slot = cslot, fd = conn.fd, "write failed ({err})");
                conn.to_write = 0;
            } else {
                conn.to_write -= (res as usize).min(conn.to_write);
            }
        }

        let fd = conn.fd;
        let to_write = conn.to_write;
        let armed = conn.write_armed;
        if armed && to_write == 0 {
            self.ctl(
                libc::EPOLL_CTL_MOD,
                fd,
                (libc::EPOLLIN | libc::EPOLLET) as u32,
                conn_tag(cslot),
            )?;
            if let Some(conn) = self.conns.get_mut(cslot) {
                conn.write_armed = false;
            }
        } else if !armed && to_write > 0 {
            self.ctl(
                libc::EPOLL_CTL_MOD,
                fd,
                (libc::EPOLLIN | libc::EPOLLOUT | libc::EPOLLET) as u32,
                conn_tag(cslot),
            )?;
            if let Some(conn) = self.conns.get_mut(cslot) {
                conn.write_armed = true;
            }
        }
        Ok(())
    }

    fn close_conn(&mut self, cslot: usize) {
        if let Some(conn) = self.conns.try_remove(cslot) {
            unsafe {
                libc::epoll_ctl(
                    self.epfd,
                    libc::EPOLL_CTL_DEL,
                    conn.fd,
                    std::ptr::null_mut(),
                );
                libc::close(conn.fd);
            }
            self.counters.del_sock();
        }
    }
}

impl Runner for EpollEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn add_listen_sock(&mut self, sock: ListenSock) -> Result<()> {
        let fd = sock.fd;
        let lslot = self.listeners.insert(sock);
        self.ctl(
            libc::EPOLL_CTL_ADD,
            fd,
            libc::EPOLLIN as u32,
            listener_tag(lslot),
        )?;
        debug!(fd, "listener registered");
        Ok(())
    }

    fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        let mut stats = RxStats::new(self.name.clone(), self.print_read_stats);

        while !shutdown.load(Ordering::Relaxed) && !GLOBAL_SHUTDOWN.load(Ordering::Relaxed) {
            stats.start_wait();
            let n = unsafe {
                libc::epoll_wait(
                    self.epfd,
                    self.events.as_mut_ptr(),
                    self.events.len() as libc::c_int,
                    1000,
                )
            };
            stats.done_wait();
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(RingmarkError::Io(err));
            }

            let mut reads = 0u32;
            for i in 0..n as usize {
                let ev = self.events[i];
                let slot = (ev.u64 >> 1) as usize;
                if ev.u64 & TAG_LISTENER != 0 {
                    self.do_accept(slot)?;
                } else {
                    self.do_socket(slot, ev.events, &mut reads)?;
                }
            }

            // Batched replies, written after the whole dispatch pass.
            let mut queue = std::mem::take(&mut self.write_queue);
            for cslot in queue.drain(..) {
                if self.conns.get(cslot).is_some_and(|c| c.to_write > 0) {
                    self.do_write(cslot)?;
                }
            }
            self.write_queue = queue;

            if self.print_rx_stats {
                stats.done_loop(
                    self.counters.bytes(),
                    self.counters.requests(),
                    reads,
                    false,
                );
            }
        }
        debug!("{}: loop exited with {} sockets", self.name, self.counters.socks());
        Ok(())
    }

    fn stop(&mut self) {
        for (_, ls) in self.listeners.iter_mut() {
            ls.close();
        }
    }
}

impl Drop for EpollEngine {
    fn drop(&mut self) {
        let slots: Vec<usize> = self.conns.iter().map(|(k, _)| k).collect();
        for slot in slots {
            self.close_conn(slot);
        }
        unsafe { libc::close(self.epfd) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nonblocking_pair() -> (i32, i32) {
        let mut fds = [0i32; 2];
        let rc = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK,
                0,
                fds.as_mut_ptr(),
            )
        };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    fn shrink_send_buffer(fd: i32) {
        let size: libc::c_int = 4096;
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_SNDBUF,
                (&size as *const libc::c_int).cast(),
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
    }

    fn drain_peer(fd: i32) {
        let mut sink = [0u8; 65536];
        loop {
            let res = unsafe { libc::recv(fd, sink.as_mut_ptr().cast(), sink.len(), 0) };
            if res <= 0 {
                break;
            }
        }
    }

    #[test]
    fn test_write_backpressure_arms_then_disarms() {
        let mut engine =
            EpollEngine::new(EpollRxConfig::default(), "test".to_string(), false, false).unwrap();
        let (ours, theirs) = nonblocking_pair();
        shrink_send_buffer(ours);

        // A connection owing far more than the socket buffer can take.
        let cslot = engine.conns.insert(EpollConn {
            fd: ours,
            parser: FrameParser::new(),
            to_write: 4 << 20,
            write_armed: false,
        });
        engine.register_sock(cslot).unwrap();

        engine.do_write(cslot).unwrap();
        {
            let conn = engine.conns.get(cslot).unwrap();
            assert!(conn.write_armed, "blocked write must arm write interest");
            assert!(conn.to_write > 0);
        }

        // Keep draining the peer until the owed bytes are flushed; the
        // final write must disarm the interest again.
        for _ in 0..10_000 {
            drain_peer(theirs);
            engine.do_write(cslot).unwrap();
            if engine.conns.get(cslot).unwrap().to_write == 0 {
                break;
            }
        }
        let conn = engine.conns.get(cslot).unwrap();
        assert_eq!(conn.to_write, 0, "peer drained but reply never finished");
        assert!(!conn.write_armed, "drained connection must disarm write interest");

        unsafe { libc::close(theirs) };
    }

    #[test]
    fn test_dead_socket_write_clears_backlog() {
        let mut engine =
            EpollEngine::new(EpollRxConfig::default(), "test".to_string(), false, false).unwrap();
        let (ours, theirs) = nonblocking_pair();
        unsafe { libc::close(theirs) };

        let cslot = engine.conns.insert(EpollConn {
            fd: ours,
            parser: FrameParser::new(),
            to_write: 1024,
            write_armed: false,
        });
        engine.register_sock(cslot).unwrap();
        engine.do_write(cslot).unwrap();
        assert_eq!(engine.conns.get(cslot).unwrap().to_write, 0);
    }

    #[test]
    fn test_tags_distinguish_listeners_from_conns() {
        assert_eq!(listener_tag(5) & TAG_LISTENER, 1);
        assert_eq!(conn_tag(5) & TAG_LISTENER, 0);
        assert_eq!(listener_tag(5) >> 1, 5);
        assert_eq!(conn_tag(5) >> 1, 5);
    }
}
