//! Hooked TCP primitives: plain `std::io::Read`/`Write` types whose blocking
//! calls are transparently backed by non-blocking sockets and the hook
//! layer, instead of a real blocking kernel socket.
//!
//! Grounded in the teacher's `coio.rs` `CoIOStream`/`CoIOListener`: a thin
//! wrapper around a real (here, `mio::net`) socket type, registering itself
//! with the owning [`IOManager`]'s descriptor table on construction and
//! routing every would-block through [`crate::hook::do_io`].

use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use crate::event::EventKind;
use crate::hook::{self, TimeoutKind};
use crate::io_manager::IOManager;

/// A TCP stream whose `read`/`write`/`connect` calls cooperatively suspend
/// the calling fiber instead of blocking the worker thread, per
/// [`crate::hook::do_io`].
pub struct HookedTcpStream {
    io: Arc<IOManager>,
    inner: mio::net::TcpStream,
}

impl HookedTcpStream {
    /// Connects to `addr`, waiting (cooperatively, with `tcp.connect.timeout`)
    /// for the non-blocking connect to complete.
    pub fn connect(io: &Arc<IOManager>, addr: impl ToSocketAddrs) -> crate::Result<Self> {
        let addr = addr
            .to_socket_addrs()
            .map_err(crate::Error::Io)?
            .next()
            .ok_or_else(|| crate::Error::Io(io::Error::new(io::ErrorKind::InvalidInput, "no addresses to connect to")))?;
        Self::connect_addr(io, addr)
    }

    fn connect_addr(io: &Arc<IOManager>, addr: SocketAddr) -> crate::Result<Self> {
        let inner = mio::net::TcpStream::connect(addr).map_err(crate::Error::Io)?;
        io.descriptors().get_or_init(inner.as_raw_fd(), true);
        hook::connect_timeout(io, io.descriptors(), &inner)?;
        Ok(HookedTcpStream { io: io.clone(), inner })
    }

    /// Wraps an already-connected socket (e.g. one returned by
    /// [`HookedTcpListener::accept`]), registering it with the owning
    /// manager's descriptor table.
    fn from_mio(io: Arc<IOManager>, inner: mio::net::TcpStream) -> Self {
        io.descriptors().get_or_init(inner.as_raw_fd(), true);
        HookedTcpStream { io, inner }
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn set_nodelay(&self, value: bool) -> io::Result<()> {
        self.inner.set_nodelay(value)
    }

    /// `None` removes the timeout (block/suspend indefinitely on reads).
    pub fn set_read_timeout_ms(&self, ms: Option<i64>) {
        hook::set_recv_timeout_ms(self.io.descriptors(), self.inner.as_raw_fd(), ms);
    }

    pub fn set_write_timeout_ms(&self, ms: Option<i64>) {
        hook::set_send_timeout_ms(self.io.descriptors(), self.inner.as_raw_fd(), ms);
    }

    /// Opts this stream out of the hook layer entirely: reads and writes
    /// become real non-blocking calls that return `WouldBlock` immediately
    /// instead of suspending.
    pub fn set_user_nonblocking(&self, value: bool) {
        hook::set_user_nonblock(self.io.descriptors(), self.inner.as_raw_fd(), value);
    }
}

impl Read for HookedTcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let fd = self.inner.as_raw_fd();
        let io = &self.io;
        let inner = &mut self.inner;
        hook::do_io(io, io.descriptors(), fd, EventKind::Read, TimeoutKind::Recv, || inner.read(buf)).map_err(Into::into)
    }
}

impl Write for HookedTcpStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let fd = self.inner.as_raw_fd();
        let io = &self.io;
        let inner = &mut self.inner;
        hook::do_io(io, io.descriptors(), fd, EventKind::Write, TimeoutKind::Send, || inner.write(buf)).map_err(Into::into)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl AsRawFd for HookedTcpStream {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

impl Drop for HookedTcpStream {
    fn drop(&mut self) {
        hook::close(&self.io, self.io.descriptors(), self.inner.as_raw_fd());
    }
}

/// A TCP listener whose `accept` cooperatively suspends the calling fiber
/// until a connection arrives (or the configured timeout elapses).
pub struct HookedTcpListener {
    io: Arc<IOManager>,
    inner: mio::net::TcpListener,
}

impl HookedTcpListener {
    pub fn bind(io: &Arc<IOManager>, addr: impl ToSocketAddrs) -> crate::Result<Self> {
        let addr = addr
            .to_socket_addrs()
            .map_err(crate::Error::Io)?
            .next()
            .ok_or_else(|| crate::Error::Io(io::Error::new(io::ErrorKind::InvalidInput, "no addresses to bind to")))?;
        let inner = mio::net::TcpListener::bind(addr).map_err(crate::Error::Io)?;
        io.descriptors().get_or_init(inner.as_raw_fd(), true);
        Ok(HookedTcpListener { io: io.clone(), inner })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Accepts the next incoming connection, parking the current fiber
    /// while none is pending.
    pub fn accept(&self) -> crate::Result<(HookedTcpStream, SocketAddr)> {
        let fd = self.inner.as_raw_fd();
        let (stream, addr) = hook::do_io(&self.io, self.io.descriptors(), fd, EventKind::Read, TimeoutKind::Recv, || self.inner.accept())?;
        Ok((HookedTcpStream::from_mio(self.io.clone(), stream), addr))
    }

    pub fn set_read_timeout_ms(&self, ms: Option<i64>) {
        hook::set_recv_timeout_ms(self.io.descriptors(), self.inner.as_raw_fd(), ms);
    }
}

impl AsRawFd for HookedTcpListener {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

impl Drop for HookedTcpListener {
    fn drop(&mut self) {
        hook::close(&self.io, self.io.descriptors(), self.inner.as_raw_fd());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::Fiber;
    use crate::scheduler::Schedulable;
    use std::sync::Mutex;

    #[test]
    fn accept_and_connect_exchange_a_byte() {
        let io = IOManager::new(2, false, "net-test").unwrap();
        io.start();

        let listener = Arc::new(HookedTcpListener::bind(&io, "127.0.0.1:0").unwrap());
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(None));

        let r = received.clone();
        let l = listener.clone();
        let server = Fiber::new("server", 65536, move || {
            let (mut stream, _peer) = l.accept().unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).unwrap();
            *r.lock().unwrap() = Some(buf);
        });

        let io2 = io.clone();
        let client = Fiber::new("client", 65536, move || {
            let mut stream = HookedTcpStream::connect(&io2, addr).unwrap();
            stream.write_all(b"hello").unwrap();
        });

        io.schedule(Schedulable::Fiber(server), None);
        io.schedule(Schedulable::Fiber(client), None);
        io.stop();

        assert_eq!(*received.lock().unwrap(), Some(*b"hello"));
    }
}
