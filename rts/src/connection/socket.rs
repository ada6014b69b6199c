//! Non-blocking stream sockets.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::net::UnixStream;

use nix::errno::Errno;
use nix::sys::socket::{
    AddressFamily, SockFlag, SockType, SockaddrStorage, connect, getsockopt, socket, sockopt,
};

/// A byte stream a connection can drive from the reactor.
pub trait Socket: Read + Write + AsFd + fmt::Debug {
    /// Switches the stream between blocking and non-blocking mode.
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()>;
}

impl Socket for TcpStream {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        Self::set_nonblocking(self, nonblocking)
    }
}

impl Socket for UnixStream {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        Self::set_nonblocking(self, nonblocking)
    }
}

/// Outcome of starting a non-blocking connect.
#[derive(Debug)]
pub(crate) enum Connecting {
    /// Connected at once.
    Done(TcpStream),
    /// Completion is signalled by writability.
    InProgress(TcpStream),
}

/// Starts a non-blocking TCP connect to `addr`.
pub(crate) fn connect_nonblocking(addr: SocketAddr) -> io::Result<Connecting> {
    let family = match addr {
        SocketAddr::V4(_) => AddressFamily::Inet,
        SocketAddr::V6(_) => AddressFamily::Inet6,
    };
    let fd = socket(family, SockType::Stream, SockFlag::empty(), None)?;
    let stream = TcpStream::from(fd);
    stream.set_nonblocking(true)?;
    stream.set_nodelay(true)?;
    match connect(stream.as_raw_fd(), &SockaddrStorage::from(addr)) {
        Ok(()) => Ok(Connecting::Done(stream)),
        Err(Errno::EINPROGRESS) => Ok(Connecting::InProgress(stream)),
        Err(e) => Err(e.into()),
    }
}

/// Pending socket error after an asynchronous connect, as `SO_ERROR`.
pub(crate) fn take_socket_error(sock: &impl AsFd) -> io::Result<()> {
    match getsockopt(sock, sockopt::SocketError)? {
        0 => Ok(()),
        code => Err(io::Error::from_raw_os_error(code)),
    }
}
