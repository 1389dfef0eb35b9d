//! The completion-driven receiver engine.
//!
//! One io_uring instance, one thread. Every submission's `user_data`
//! packs an operation kind into its low two bits and a slot-table key
//! into the rest, so completions route without any pointer games:
//! accepts key the listener slab, reads and writes key the connection
//! slab, and close carries the connection key offset by one so the
//! zero word stays free for internal submissions (buffer publishes).
//!
//! The loop makes exactly one blocking kernel entry per iteration,
//! a submit-and-wait with a one second timeout (100 ms once stopping),
//! then drains ready completions, up to `max_cqe_loop` of them, with a
//! single queue-head advance.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use io_uring::{cqueue, opcode, squeue, types, IoUring};
use slab::Slab;
use static_assertions::const_assert;
use tracing::{debug, warn};

use super::{EngineCounters, Runner, GLOBAL_SHUTDOWN};
use crate::buffers::{Provider, BGID};
use crate::config::{IoUringRxConfig, ProviderKind};
use crate::error::{Result, RingmarkError};
use crate::features::KernelCaps;
use crate::protocol::{Consumed, FrameParser};
use crate::socket::ListenSock;
use crate::stats::RxStats;
use crate::workload::run_workload;

const OP_OTHER: u64 = 0;
const OP_ACCEPT: u64 = 1;
const OP_READ: u64 = 2;
const OP_WRITE: u64 = 3;
const OP_MASK: u64 = 0b11;
const OP_SHIFT: u64 = 2;
const_assert!(OP_WRITE <= OP_MASK);

#[inline]
fn encode(slot: usize, op: u64) -> u64 {
    ((slot as u64) << OP_SHIFT) | op
}

#[inline]
fn decode(user_data: u64) -> (usize, u64) {
    ((user_data >> OP_SHIFT) as usize, user_data & OP_MASK)
}

/// How a connection's socket is addressed in submissions.
#[derive(Debug, Clone, Copy)]
enum SockDesc {
    /// A real file descriptor.
    Fd(i32),
    /// An index into the registered fixed-file table.
    Fixed(u32),
}

/// Expand to an sqe-building expression for either descriptor form.
macro_rules! with_target {
    ($desc:expr, |$t:ident| $body:expr) => {
        match $desc {
            SockDesc::Fd(fd) => {
                let $t = types::Fd(fd);
                $body
            }
            SockDesc::Fixed(idx) => {
                let $t = types::Fixed(idx);
                $body
            }
        }
    };
}

/// recvmsg scratch; boxed so the kernel-visible addresses outlive any
/// slab growth.
#[repr(C)]
struct MsgScratch {
    hdr: libc::msghdr,
    iov: libc::iovec,
}

struct Conn {
    desc: SockDesc,
    parser: FrameParser,
    closing: bool,
    /// Read target when no buffer provider is configured.
    inline_buf: Option<Box<[u8]>>,
    /// Message-mode recv template.
    msg: Option<Box<MsgScratch>>,
}

/// The io_uring receiver.
pub struct UringEngine {
    name: String,
    cfg: IoUringRxConfig,
    caps: KernelCaps,
    ring: IoUring,
    provider: Provider,
    conns: Slab<Conn>,
    listeners: Slab<ListenSock>,
    /// Free fixed-file indices; accept consumes one, close returns it.
    fixed_free: Vec<u32>,
    /// Replies send from here; contents are irrelevant to the peer.
    send_scratch: Vec<u8>,
    counters: EngineCounters,
    stopping: bool,
    /// Ring was created disabled (defer_taskrun) and needs enabling.
    ring_disabled: bool,
    skip_success: bool,
    print_rx_stats: bool,
    print_read_stats: bool,
    cqe_batch: Vec<(u64, i32, u32)>,
}

// All engine state, including the raw pointers inside connection recvmsg
// scratch and the provider mappings, is owned and touched by the single
// thread the engine runs on; `Send` only covers the initial move there.
unsafe impl Send for UringEngine {}

impl UringEngine {
    pub fn new(
        cfg: IoUringRxConfig,
        name: String,
        print_rx_stats: bool,
        print_read_stats: bool,
    ) -> Result<Self> {
        cfg.validate()?;
        let caps = KernelCaps::probe()?;
        check_caps(&cfg, &caps)?;

        let ring = build_ring(&cfg)?;
        let skip_success = caps.skip_success;

        let mut provider = Provider::from_config(&cfg)?;
        provider.register(&ring.submitter())?;

        let mut fixed_free = Vec::new();
        if cfg.fixed_files {
            ring.submitter().register_files_sparse(cfg.fixed_file_count)?;
            fixed_free = (0..cfg.fixed_file_count).rev().collect();
        }

        let ring_disabled = cfg.defer_taskrun;
        let mut engine = Self {
            name,
            cfg,
            caps,
            ring,
            provider,
            conns: Slab::with_capacity(1024),
            listeners: Slab::with_capacity(4),
            fixed_free,
            send_scratch: vec![0u8; 2048],
            counters: EngineCounters::default(),
            stopping: false,
            ring_disabled,
            skip_success,
            print_rx_stats,
            print_read_stats,
            cqe_batch: Vec::with_capacity(1024),
        };

        // Seed the whole classic pool; the sqes ride along with the first
        // loop entry if the ring starts disabled.
        engine.provide_buffers(true)?;
        if !engine.ring_disabled {
            engine.flush_sq()?;
        }
        debug!(caps = ?engine.caps.available(), "ring engine ready");
        Ok(engine)
    }

    /// Queue an sqe, flushing the submission queue once if it is full.
    fn push_sqe(&mut self, entry: &squeue::Entry) -> Result<()> {
        let pushed = unsafe { self.ring.submission().push(entry).is_ok() };
        if !pushed {
            self.flush_sq()?;
            let retried = unsafe { self.ring.submission().push(entry).is_ok() };
            if !retried {
                return Err(RingmarkError::Io(io::Error::other(
                    "submission queue full after flush",
                )));
            }
        }
        Ok(())
    }

    fn flush_sq(&mut self) -> Result<()> {
        loop {
            match self.ring.submit() {
                Ok(_) => return Ok(()),
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(e) => return Err(RingmarkError::Io(e)),
            }
        }
    }

    /// Compact and republish classic-pool buffers when warranted.
    fn provide_buffers(&mut self, force: bool) -> Result<()> {
        if !(force || self.provider.needs_publish()) {
            return Ok(());
        }
        if self.cfg.provided_buffer_compact {
            self.provider.compact();
        }
        while let Some(entry) = self.provider.publish_one() {
            self.push_sqe(&entry)?;
        }
        Ok(())
    }

    /// Post the single outstanding accept for a listener.
    fn post_accept(&mut self, lslot: usize) -> Result<()> {
        if self.listeners[lslot].reserved_slot.is_some() {
            return Err(RingmarkError::Io(io::Error::other(
                "listener already has an accept outstanding",
            )));
        }
        let reserved = if self.cfg.fixed_files {
            let idx = self
                .fixed_free
                .pop()
                .ok_or(RingmarkError::FixedFilesExhausted)?;
            Some(idx)
        } else {
            None
        };

        let ls = &mut self.listeners[lslot];
        ls.reserved_slot = reserved;
        ls.scratch.len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let addr = (&mut ls.scratch.storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr>();
        let len = &mut ls.scratch.len as *mut libc::socklen_t;

        let listen_fd = ls.fd;
        let mut accept =
            opcode::Accept::new(types::Fd(listen_fd), addr, len).flags(libc::SOCK_NONBLOCK);
        if let Some(idx) = reserved {
            let slot = types::DestinationSlot::try_from_slot_target(idx).map_err(|_| {
                RingmarkError::config(format!("fixed file index {idx} not addressable"))
            })?;
            accept = accept.file_index(Some(slot));
        }
        let entry = accept.build().user_data(encode(lslot, OP_ACCEPT));
        self.push_sqe(&entry)
    }

    fn on_accept(&mut self, lslot: usize, res: i32) -> Result<()> {
        if res >= 0 {
            let desc = if self.cfg.fixed_files {
                if res > 0 {
                    return Err(RingmarkError::CapabilityMissing(
                        "direct accept returned a real descriptor",
                    ));
                }
                let idx = self
                    .listeners
                    .get_mut(lslot)
                    .and_then(|ls| ls.reserved_slot.take())
                    .ok_or(RingmarkError::UnexpectedCompletion {
                        user_data: encode(lslot, OP_ACCEPT),
                        res,
                    })?;
                SockDesc::Fixed(idx)
            } else {
                SockDesc::Fd(res)
            };
            self.open_conn(desc)?;
        } else if !self.stopping {
            return Err(RingmarkError::Accept(io::Error::from_raw_os_error(-res)));
        }

        if self.stopping {
            // Recycle the index a failed direct accept left reserved.
            if let Some(ls) = self.listeners.get_mut(lslot) {
                if let Some(idx) = ls.reserved_slot.take() {
                    self.fixed_free.push(idx);
                }
            }
            return Ok(());
        }

        if self.cfg.supports_nonblock_accept && !self.cfg.fixed_files {
            self.drain_accept4(lslot)?;
        }
        self.post_accept(lslot)
    }

    /// Pull any connections already queued on the listener.
    fn drain_accept4(&mut self, lslot: usize) -> Result<()> {
        loop {
            let fd = {
                let ls = &mut self.listeners[lslot];
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
            self.open_conn(SockDesc::Fd(fd))?;
        }
    }

    fn open_conn(&mut self, desc: SockDesc) -> Result<()> {
        let mut conn = Conn {
            desc,
            parser: FrameParser::new(),
            closing: false,
            inline_buf: None,
            msg: None,
        };
        if !self.provider.active() {
            conn.inline_buf = Some(vec![0u8; self.cfg.common.recv_size].into_boxed_slice());
        }
        if self.cfg.common.recvmsg {
            let mut msg: Box<MsgScratch> = Box::new(unsafe { std::mem::zeroed() });
            if let Some(buf) = conn.inline_buf.as_mut() {
                msg.iov.iov_base = buf.as_mut_ptr().cast();
                msg.iov.iov_len = buf.len();
                msg.hdr.msg_iovlen = 1;
            }
            let iov_ptr: *mut libc::iovec = &mut msg.iov;
            msg.hdr.msg_iov = iov_ptr;
            conn.msg = Some(msg);
        }

        let cslot = self.conns.insert(conn);
        self.post_read(cslot)?;
        self.counters.new_sock();
        Ok(())
    }

    fn post_read(&mut self, cslot: usize) -> Result<()> {
        let provider_active = self.provider.active();
        let recv_size = self.provider.size_per_buffer();
        let recvmsg = self.cfg.common.recvmsg;
        let multishot = self.cfg.multishot_recv && provider_active;

        let Some(conn) = self.conns.get_mut(cslot) else {
            return Ok(());
        };
        let desc = conn.desc;
        let entry = match (provider_active, recvmsg) {
            (true, false) => {
                if multishot {
                    with_target!(desc, |t| opcode::RecvMulti::new(t, BGID).build())
                } else {
                    with_target!(desc, |t| opcode::Recv::new(
                        t,
                        std::ptr::null_mut(),
                        recv_size as u32
                    )
                    .buf_group(BGID)
                    .build()
                    .flags(squeue::Flags::BUFFER_SELECT))
                }
            }
            (true, true) => {
                let hdr: *mut libc::msghdr = match conn.msg.as_mut() {
                    Some(m) => &mut m.hdr,
                    None => std::ptr::null_mut(),
                };
                debug_assert!(!hdr.is_null());
                if multishot {
                    with_target!(desc, |t| opcode::RecvMsgMulti::new(t, hdr, BGID).build())
                } else {
                    with_target!(desc, |t| opcode::RecvMsg::new(t, hdr)
                        .buf_group(BGID)
                        .build()
                        .flags(squeue::Flags::BUFFER_SELECT))
                }
            }
            (false, true) => {
                let hdr: *mut libc::msghdr = match conn.msg.as_mut() {
                    Some(m) => &mut m.hdr,
                    None => std::ptr::null_mut(),
                };
                debug_assert!(!hdr.is_null());
                with_target!(desc, |t| opcode::RecvMsg::new(t, hdr).build())
            }
            (false, false) => {
                let (ptr, len) = match conn.inline_buf.as_mut() {
                    Some(buf) => (buf.as_mut_ptr(), buf.len()),
                    None => (std::ptr::null_mut(), 0),
                };
                debug_assert!(!ptr.is_null());
                with_target!(desc, |t| opcode::Recv::new(t, ptr, len as u32).build())
            }
        };
        let entry = entry.user_data(encode(cslot, OP_READ));
        self.push_sqe(&entry)
    }

    fn on_read(&mut self, cslot: usize, res: i32, flags: u32) -> Result<()> {
        let more = cqueue::more(flags);
        let multishot = self.cfg.multishot_recv && self.provider.active();

        if res > 0 {
            let n = res as usize;
            let bid = cqueue::buffer_select(flags);
            let consumed = self.consume_bytes(cslot, n, bid);

            if let Some(bid) = bid {
                self.provider.return_index(bid);
                self.provide_buffers(false)?;
            }

            if consumed.frames > 0 {
                self.counters.finished_requests(consumed.frames);
            }
            if consumed.owed_reply_bytes > 0 {
                self.post_send(cslot, consumed.owed_reply_bytes)?;
            }
            self.counters.did_read(n);

            if !multishot || !more {
                self.post_read(cslot)?;
            }
            return Ok(());
        }

        // A terminal multishot CQE may still carry an unused buffer.
        if let Some(bid) = cqueue::buffer_select(flags) {
            self.provider.return_index(bid);
        }

        if res == -libc::ENOBUFS {
            return Err(RingmarkError::PoolStarvation {
                pending: self.provider.pending_publish(),
            });
        }
        if res < 0 && res != -libc::ECONNRESET && !self.stopping {
            warn!(
                slot = cslot,
                res,
                "unexpected read result ({}), closing connection",
                io::Error::from_raw_os_error(-res)
            );
        }
        if multishot && more {
            // The kernel will still deliver the terminal completion.
            return Ok(());
        }
        self.close_conn(cslot)
    }

    /// Feed received bytes through the parser and the workload hook.
    fn consume_bytes(&mut self, cslot: usize, n: usize, bid: Option<u16>) -> Consumed {
        let workload = self.cfg.common.workload;
        let recvmsg_multishot =
            self.cfg.common.recvmsg && self.cfg.multishot_recv && self.provider.active();

        let Some(conn) = self.conns.get_mut(cslot) else {
            return Consumed::default();
        };
        let consumed = match bid {
            Some(bid) => {
                let data = self.provider.get_data(bid, n);
                if recvmsg_multishot {
                    // Message-mode multishot wraps the payload in an
                    // envelope that must be validated and unwrapped.
                    let parsed = conn
                        .msg
                        .as_ref()
                        .and_then(|m| types::RecvMsgOut::parse(data, &m.hdr).ok());
                    match parsed {
                        Some(out) => conn.parser.consume(out.payload_data()),
                        None => {
                            warn!(slot = cslot, n, "recvmsg envelope failed validation");
                            Consumed::default()
                        }
                    }
                } else {
                    conn.parser.consume(data)
                }
            }
            None => match conn.inline_buf.as_ref() {
                Some(buf) => {
                    let data = &buf[..n.min(buf.len())];
                    conn.parser.consume(data)
                }
                None => Consumed::default(),
            },
        };
        run_workload(consumed.frames, workload);
        consumed
    }

    fn post_send(&mut self, cslot: usize, len: usize) -> Result<()> {
        if self.send_scratch.len() < len {
            self.send_scratch.resize(len, 0);
        }
        let Some(conn) = self.conns.get(cslot) else {
            return Ok(());
        };
        let desc = conn.desc;
        let ptr = self.send_scratch.as_ptr();
        let mut entry = with_target!(desc, |t| opcode::Send::new(t, ptr, len as u32)
            .flags(libc::MSG_WAITALL)
            .build());
        if self.skip_success {
            entry = entry.flags(squeue::Flags::SKIP_SUCCESS);
        }
        let entry = entry.user_data(encode(cslot, OP_WRITE));
        self.push_sqe(&entry)
    }

    fn on_write(&mut self, cslot: usize, res: i32) {
        // Only failures surface when success CQEs are skipped; a write
        // error on a live socket is logged and the read path reaps it.
        if res < 0 {
            if let Some(conn) = self.conns.get(cslot) {
                if !conn.closing {
                    warn!(
                        slot = cslot,
                        res,
                        "socket write failed ({})",
                        io::Error::from_raw_os_error(-res)
                    );
                }
            }
        }
    }

    fn close_conn(&mut self, cslot: usize) -> Result<()> {
        let Some(conn) = self.conns.get_mut(cslot) else {
            return Ok(());
        };
        if conn.closing {
            return Ok(());
        }
        match conn.desc {
            SockDesc::Fixed(idx) => {
                conn.closing = true;
                let entry = opcode::Close::new(types::Fixed(idx))
                    .build()
                    .user_data(encode(cslot + 1, OP_OTHER));
                self.push_sqe(&entry)
            }
            SockDesc::Fd(fd) => {
                unsafe { libc::close(fd) };
                self.conns.remove(cslot);
                self.counters.del_sock();
                Ok(())
            }
        }
    }

    fn on_close(&mut self, cslot: usize, res: i32) {
        let Some(conn) = self.conns.get(cslot) else {
            return;
        };
        if !conn.closing {
            return;
        }
        let desc = conn.desc;
        if res == 0 || res == -libc::EBADF {
            if let SockDesc::Fixed(idx) = desc {
                self.fixed_free.push(idx);
            }
        } else {
            warn!(slot = cslot, res, "close failed; fixed index leaked");
        }
        self.conns.remove(cslot);
        self.counters.del_sock();
    }

    fn on_internal(&mut self, res: i32) {
        // Buffer publishes skip their success completions; anything that
        // lands here with an error is a publish the kernel rejected.
        if res < 0 {
            warn!(res, "internal submission failed");
        }
    }

    fn dispatch(&mut self, user_data: u64, res: i32, flags: u32, reads: &mut u32) -> Result<()> {
        let (slot, op) = decode(user_data);
        match op {
            OP_ACCEPT => self.on_accept(slot, res),
            OP_READ => {
                *reads += 1;
                self.on_read(slot, res, flags)
            }
            OP_WRITE => {
                self.on_write(slot, res);
                Ok(())
            }
            OP_OTHER => {
                if slot == 0 {
                    self.on_internal(res);
                } else {
                    self.on_close(slot - 1, res);
                }
                Ok(())
            }
            _ => Err(RingmarkError::UnexpectedCompletion { user_data, res }),
        }
    }

    /// One kernel entry: submit whatever is queued and wait for a single
    /// completion, bounded by `ts`.
    fn submit_and_wait_one(&mut self, ts: &types::Timespec) -> Result<()> {
        let args = types::SubmitArgs::new().timespec(ts);
        match self.ring.submitter().submit_with_args(1, &args) {
            Ok(_) => Ok(()),
            Err(e)
                if matches!(
                    e.raw_os_error(),
                    Some(libc::ETIME) | Some(libc::EINTR) | Some(libc::EBUSY)
                ) =>
            {
                Ok(())
            }
            Err(e) => Err(RingmarkError::Io(e)),
        }
    }

    /// The completion queue overflowed: enter with a zero timeout so the
    /// kernel flushes the stashed completions, then drain without waiting.
    fn flush_overflow(&mut self) -> Result<()> {
        let zero = types::Timespec::new();
        let args = types::SubmitArgs::new().timespec(&zero);
        match self.ring.submitter().submit_with_args(1, &args) {
            Ok(_) => Ok(()),
            Err(e)
                if matches!(
                    e.raw_os_error(),
                    Some(libc::ETIME) | Some(libc::EINTR) | Some(libc::EBUSY)
                ) =>
            {
                Ok(())
            }
            Err(e) => Err(RingmarkError::Io(e)),
        }
    }
}

impl Runner for UringEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn add_listen_sock(&mut self, sock: ListenSock) -> Result<()> {
        let lslot = self.listeners.insert(sock);
        self.post_accept(lslot)
    }

    fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        let mut stats = RxStats::new(self.name.clone(), self.print_read_stats);
        let mut timeout = types::Timespec::new().sec(1);

        if self.ring_disabled {
            self.ring.submitter().register_enable_rings()?;
            self.ring_disabled = false;
        }
        if self.cfg.register_ring {
            self.ring.submitter().register_ring_fd()?;
        }

        while self.counters.socks() > 0 || !self.stopping {
            let was_overflow = self.ring.submission().cq_overflow();
            let mut reads = 0u32;
            self.provide_buffers(false)?;

            stats.start_wait();
            if was_overflow {
                self.flush_overflow()?;
            } else {
                self.submit_and_wait_one(&timeout)?;
            }
            stats.done_wait();

            if shutdown.load(Ordering::Relaxed) || GLOBAL_SHUTDOWN.load(Ordering::Relaxed) {
                if self.stopping {
                    // Second observation: the drain had its chance.
                    break;
                }
                debug!("{}: stopping", self.name);
                self.stop();
                timeout = types::Timespec::new().nsec(100_000_000);
            }

            // Drain ready completions, at most max_cqe_loop per iteration;
            // anything left stays queued and satisfies the next wait
            // immediately. The queue head advances once per drain.
            self.cqe_batch.clear();
            let cap = self.cfg.max_cqe_loop as usize;
            for cqe in self.ring.completion() {
                self.cqe_batch
                    .push((cqe.user_data(), cqe.result(), cqe.flags()));
                if self.cqe_batch.len() >= cap {
                    break;
                }
            }
            for i in 0..self.cqe_batch.len() {
                let (user_data, res, flags) = self.cqe_batch[i];
                self.dispatch(user_data, res, flags, &mut reads)?;
            }

            if self.print_rx_stats {
                stats.done_loop(
                    self.counters.bytes(),
                    self.counters.requests(),
                    reads,
                    was_overflow,
                );
            }
        }
        debug!("{}: loop exited with {} sockets", self.name, self.counters.socks());
        Ok(())
    }

    fn stop(&mut self) {
        self.stopping = true;
        for (_, ls) in self.listeners.iter_mut() {
            ls.close();
        }
    }
}

/// Build the ring, retrying without the newer setup flags if the kernel
/// rejects them.
fn build_ring(cfg: &IoUringRxConfig) -> Result<IoUring> {
    let attempt = |newer_flags: bool| -> io::Result<IoUring> {
        let mut builder = IoUring::builder();
        builder.setup_cqsize(cfg.effective_cqe_count());
        if newer_flags {
            builder.setup_submit_all();
            builder.setup_coop_taskrun();
        }
        if cfg.defer_taskrun {
            builder.setup_defer_taskrun();
            builder.setup_single_issuer();
            builder.setup_r_disabled();
        }
        builder.build(cfg.sqe_count)
    };

    match attempt(true) {
        Ok(ring) => Ok(ring),
        Err(first) => {
            debug!("ring setup failed ({first}); retrying without SUBMIT_ALL/COOP_TASKRUN");
            attempt(false).map_err(RingmarkError::RingSetup)
        }
    }
}

fn check_caps(cfg: &IoUringRxConfig, caps: &KernelCaps) -> Result<()> {
    match cfg.provide_buffers {
        ProviderKind::Classic if !caps.provide_buffers => {
            return Err(RingmarkError::CapabilityMissing("PROVIDE_BUFFERS"));
        }
        ProviderKind::SharedRing if !caps.buf_ring => {
            return Err(RingmarkError::CapabilityMissing("registered buffer rings"));
        }
        _ => {}
    }
    if cfg.multishot_recv && cfg.provide_buffers != ProviderKind::None && !caps.recv_multishot {
        return Err(RingmarkError::CapabilityMissing("multishot recv"));
    }
    if cfg.fixed_files && !caps.direct_descriptors {
        return Err(RingmarkError::CapabilityMissing("direct descriptors"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_data_round_trip() {
        for slot in [0usize, 1, 7, 1024, 1 << 40] {
            for op in [OP_OTHER, OP_ACCEPT, OP_READ, OP_WRITE] {
                assert_eq!(decode(encode(slot, op)), (slot, op));
            }
        }
    }

    #[test]
    fn test_internal_user_data_is_reserved() {
        // Buffer publishes use the zero word; close completions offset
        // their slot by one so connection slot 0 stays distinguishable.
        assert_eq!(decode(0), (0, OP_OTHER));
        assert_eq!(decode(encode(1, OP_OTHER)), (1, OP_OTHER));
    }
}
