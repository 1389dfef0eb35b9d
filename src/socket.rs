//! Listen socket construction and port selection.

use std::io;
use std::os::unix::io::RawFd;

use tracing::debug;

use crate::error::{Result, RingmarkError};

/// Scratch storage an in-flight accept writes the peer address into.
///
/// Boxed inside [`ListenSock`] so the kernel-visible pointers stay stable
/// regardless of how the owning collection moves the `ListenSock` itself.
#[derive(Debug)]
pub struct AcceptScratch {
    pub storage: libc::sockaddr_storage,
    pub len: libc::socklen_t,
}

impl Default for AcceptScratch {
    fn default() -> Self {
        Self {
            storage: unsafe { std::mem::zeroed() },
            len: std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t,
        }
    }
}

/// A bound, listening TCP socket handed to an engine.
#[derive(Debug)]
pub struct ListenSock {
    pub fd: RawFd,
    pub v6: bool,
    pub scratch: Box<AcceptScratch>,
    /// Fixed-file index reserved for the one outstanding direct accept.
    pub reserved_slot: Option<u32>,
    pub closed: bool,
}

impl ListenSock {
    pub fn new(fd: RawFd, v6: bool) -> Self {
        Self {
            fd,
            v6,
            scratch: Box::default(),
            reserved_slot: None,
            closed: false,
        }
    }

    /// Close the listening descriptor; pending accepts will fail and be
    /// ignored by the stopping engine.
    pub fn close(&mut self) {
        if !self.closed {
            unsafe { libc::close(self.fd) };
            self.closed = true;
        }
    }
}

impl Drop for ListenSock {
    fn drop(&mut self) {
        self.close();
    }
}

/// Create a bound TCP socket on `port` without listening. `extra_flags`
/// is OR'd into the socket type (e.g. `SOCK_NONBLOCK`).
fn bind_socket(port: u16, v6: bool, extra_flags: libc::c_int) -> io::Result<RawFd> {
    unsafe {
        let domain = if v6 { libc::AF_INET6 } else { libc::AF_INET };
        let fd = libc::socket(domain, libc::SOCK_STREAM | extra_flags, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let one: libc::c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        let rc = if v6 {
            let mut addr: libc::sockaddr_in6 = std::mem::zeroed();
            addr.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            addr.sin6_port = port.to_be();
            addr.sin6_addr = libc::in6addr_any;
            libc::bind(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        } else {
            let mut addr: libc::sockaddr_in = std::mem::zeroed();
            addr.sin_family = libc::AF_INET as libc::sa_family_t;
            addr.sin_port = port.to_be();
            addr.sin_addr.s_addr = libc::INADDR_ANY.to_be();
            libc::bind(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }
        Ok(fd)
    }
}

/// Create a listening server socket for an engine.
pub fn mk_server_sock(port: u16, v6: bool, backlog: i32, extra_flags: libc::c_int) -> Result<RawFd> {
    let fd = bind_socket(port, v6, extra_flags)?;
    if unsafe { libc::listen(fd, backlog) } < 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(RingmarkError::Io(err));
    }
    debug!(fd, port, v6, "listening");
    Ok(fd)
}

/// Sequential port allocator for receivers.
///
/// With explicit `--use_port` values it hands them out in order (then
/// keeps counting upward, matching how repeated receivers stack). Without,
/// it probes from a per-process base in the 10000..12000 range until a
/// port binds.
#[derive(Debug)]
pub struct PortPicker {
    next: u16,
    explicit: bool,
}

impl PortPicker {
    pub fn new(use_ports: &[u16]) -> Self {
        match use_ports.first() {
            Some(&p) => Self { next: p, explicit: true },
            None => Self {
                next: 10_000 + (std::process::id() % 2_000) as u16,
                explicit: false,
            },
        }
    }

    pub fn pick(&mut self, v6: bool) -> Result<u16> {
        if self.explicit {
            let port = self.next;
            self.next = self.next.wrapping_add(1);
            return Ok(port);
        }
        for _ in 0..1000 {
            let port = self.next;
            self.next = self.next.wrapping_add(1);
            match bind_socket(port, v6, 0) {
                Ok(fd) => {
                    unsafe { libc::close(fd) };
                    return Ok(port);
                }
                Err(_) => continue,
            }
        }
        Err(RingmarkError::config("no free port found"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_port_binds_free_port() {
        let mut picker = PortPicker::new(&[]);
        let port = picker.pick(false).unwrap();
        // The picked port must actually be bindable.
        let fd = bind_socket(port, false, 0).unwrap();
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_explicit_ports_are_sequential() {
        let mut picker = PortPicker::new(&[15000]);
        assert_eq!(picker.pick(false).unwrap(), 15000);
        assert_eq!(picker.pick(false).unwrap(), 15001);
    }

    #[test]
    fn test_server_sock_listens() {
        let mut picker = PortPicker::new(&[]);
        let port = picker.pick(false).unwrap();
        let fd = mk_server_sock(port, false, 16, 0).unwrap();
        let mut ls = ListenSock::new(fd, false);
        assert!(!ls.closed);
        ls.close();
        assert!(ls.closed);
    }
}
