//! Per-descriptor metadata: whether a descriptor is a socket, whether this
//! crate switched it into non-blocking mode, whether the caller separately
//! asked for non-blocking, and its configured timeouts.
//!
//! Field names follow `original_source/zero/fd_manager.h`'s `FdCtx`
//! bit-for-bit (`m_isInit`, `m_isSocket`, `m_sysNonblock`, `m_userNonblock`,
//! `m_isClosed`, `m_recvTimeout`, `m_sendTimeout`), adapted to Rust's
//! atomics instead of a mutex-guarded plain struct since every field here
//! is independently readable/writable from [`crate::hook::do_io`].

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

/// "No timeout configured" sentinel for `recv_timeout_ms`/`send_timeout_ms`.
pub const NO_TIMEOUT: i64 = -1;

pub struct FdMeta {
    fd: RawFd,
    is_socket: bool,
    sys_nonblock: AtomicBool,
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout_ms: AtomicI64,
    send_timeout_ms: AtomicI64,
}

impl FdMeta {
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    /// True once this crate has put the kernel descriptor into
    /// non-blocking mode on the caller's behalf.
    pub fn is_sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::SeqCst)
    }

    /// True if the caller explicitly asked for non-blocking behavior
    /// (rather than this crate's own transparent hooking). `do_io` skips
    /// the suspend-and-retry dance for such descriptors.
    pub fn is_user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::SeqCst)
    }

    pub fn set_user_nonblock(&self, value: bool) {
        self.user_nonblock.store(value, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// `None` means no timeout is configured (block/suspend indefinitely).
    pub fn recv_timeout_ms(&self) -> Option<i64> {
        non_negative(self.recv_timeout_ms.load(Ordering::SeqCst))
    }

    pub fn send_timeout_ms(&self) -> Option<i64> {
        non_negative(self.send_timeout_ms.load(Ordering::SeqCst))
    }

    /// Socket option interception: timeouts are recorded here, not pushed
    /// down to the kernel socket, so the hook layer is the only thing that
    /// ever observes them.
    pub fn set_recv_timeout_ms(&self, ms: Option<i64>) {
        self.recv_timeout_ms.store(ms.unwrap_or(NO_TIMEOUT), Ordering::SeqCst);
    }

    pub fn set_send_timeout_ms(&self, ms: Option<i64>) {
        self.send_timeout_ms.store(ms.unwrap_or(NO_TIMEOUT), Ordering::SeqCst);
    }
}

fn non_negative(v: i64) -> Option<i64> {
    if v < 0 {
        None
    } else {
        Some(v)
    }
}

/// Index-addressable, grown-on-demand table of [`FdMeta`], mirroring
/// `crate::event::EventTable`'s shape: a reader/writer lock guards resizes,
/// entries are independently reference-counted.
#[derive(Default)]
pub(crate) struct DescriptorTable {
    entries: RwLock<Vec<Option<Arc<FdMeta>>>>,
}

impl DescriptorTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(&self, fd: RawFd) -> Option<Arc<FdMeta>> {
        let entries = self.entries.read().unwrap();
        entries.get(fd as usize).and_then(|e| e.clone())
    }

    /// Returns the existing entry for `fd`, or creates one: puts the
    /// kernel descriptor into non-blocking mode if `is_socket`, and
    /// records "system non-block, user non-block false."
    pub(crate) fn get_or_init(&self, fd: RawFd, is_socket: bool) -> Arc<FdMeta> {
        if let Some(existing) = self.get(fd) {
            return existing;
        }
        let idx = fd as usize;
        let mut entries = self.entries.write().unwrap();
        if entries.len() <= idx {
            entries.resize_with(idx + 1, || None);
        }
        entries[idx]
            .get_or_insert_with(|| {
                let sys_nonblock = is_socket && set_nonblocking(fd);
                Arc::new(FdMeta {
                    fd,
                    is_socket,
                    sys_nonblock: AtomicBool::new(sys_nonblock),
                    user_nonblock: AtomicBool::new(false),
                    closed: AtomicBool::new(false),
                    recv_timeout_ms: AtomicI64::new(NO_TIMEOUT),
                    send_timeout_ms: AtomicI64::new(NO_TIMEOUT),
                })
            })
            .clone()
    }

    /// Destroys the metadata entry for `fd`, on close.
    pub(crate) fn remove(&self, fd: RawFd) {
        let idx = fd as usize;
        let mut entries = self.entries.write().unwrap();
        if let Some(slot) = entries.get_mut(idx) {
            if let Some(meta) = slot.take() {
                meta.mark_closed();
            }
        }
    }
}

fn set_nonblocking(fd: RawFd) -> bool {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 {
            return false;
        }
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_init_is_idempotent() {
        let table = DescriptorTable::new();
        let (r, _w) = unsafe {
            let mut fds = [0i32; 2];
            libc::pipe(fds.as_mut_ptr());
            (fds[0], fds[1])
        };
        let a = table.get_or_init(r, false);
        let b = table.get_or_init(r, false);
        assert_eq!(a.fd(), b.fd());
        assert!(!a.is_socket());
        unsafe {
            libc::close(r);
            libc::close(_w);
        }
    }

    #[test]
    fn remove_marks_closed() {
        let table = DescriptorTable::new();
        let (r, w) = unsafe {
            let mut fds = [0i32; 2];
            libc::pipe(fds.as_mut_ptr());
            (fds[0], fds[1])
        };
        let meta = table.get_or_init(r, false);
        table.remove(r);
        assert!(meta.is_closed());
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }
}
