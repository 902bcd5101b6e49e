use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket as RawSocket, Type};

/// Kernel receive buffer requested at bind time. Reception is
/// loss-intolerant, so the kernel side gets the same budget as the
/// default user-space ring.
const RECV_BUFFER_BYTES: usize = 4 * 1024 * 1024;

/// Non-blocking UDP socket for the reception pipeline.
///
/// The receiver thread alternates between [`Socket::wait_readable`], which
/// bounds how long shutdown can go unnoticed, and [`Socket::recv_into`],
/// which drains whatever the kernel buffered without ever blocking.
pub struct Socket {
    inner: UdpSocket,
}

impl Socket {
    /// Bind a UDP socket configured for reception: `SO_REUSEADDR`, a large
    /// `SO_RCVBUF`, and non-blocking mode.
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let domain = match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };

        let socket = RawSocket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_recv_buffer_size(RECV_BUFFER_BYTES)?;
        socket.bind(&addr.into())?;

        Self::from_std(socket.into())
    }

    /// Adopt an already bound socket, switching it to non-blocking mode.
    pub fn from_std(inner: UdpSocket) -> io::Result<Self> {
        inner.set_nonblocking(true)?;
        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Wait until the socket is readable or `timeout` expires. `Ok(false)`
    /// is a plain timeout; an error means polling itself failed, which the
    /// receiver treats as fatal.
    #[cfg(unix)]
    pub fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        use std::os::fd::AsRawFd;

        let mut pfd = libc::pollfd {
            fd: self.inner.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };

        // SAFETY: `pfd` lives across the call and the descriptor stays open
        // for as long as `self` does.
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout.as_millis() as libc::c_int) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(ret > 0 && pfd.revents & libc::POLLIN != 0)
    }

    /// Portable fallback without `poll(2)`: probe with a non-blocking peek
    /// on a small cadence until data shows up or the timeout runs out.
    #[cfg(not(unix))]
    pub fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        let deadline = std::time::Instant::now() + timeout;
        let mut probe = [0u8; 1];

        loop {
            match self.inner.peek_from(&mut probe) {
                Ok(_) => return Ok(true),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if std::time::Instant::now() >= deadline {
                        return Ok(false);
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Non-blocking receive of one datagram into `buf`.
    ///
    /// `Ok(None)` means the kernel queue has drained for this round. Any
    /// other failure is returned as-is and shuts the reception flow down.
    pub fn recv_into(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match self.inner.recv_from(buf) {
            Ok((n, _)) => Ok(Some(n)),
            Err(e) => match e.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(None),
                // ICMP port-unreachable from a peer that went away surfaces
                // here on some platforms; a receiver keeps going.
                io::ErrorKind::ConnectionReset => {
                    log::trace!("udp receive interrupted by connection reset");
                    Ok(None)
                }
                _ => Err(e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_recv_round_trip() {
        let socket = Socket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = socket.local_addr().unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"ping", addr).unwrap();

        assert!(socket.wait_readable(Duration::from_secs(2)).unwrap());

        let mut buf = [0u8; 16];
        assert_eq!(socket.recv_into(&mut buf).unwrap(), Some(4));
        assert_eq!(&buf[..4], b"ping");

        // The queue is drained now.
        assert_eq!(socket.recv_into(&mut buf).unwrap(), None);
    }

    #[test]
    fn wait_readable_times_out_on_silence() {
        let socket = Socket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        assert!(!socket.wait_readable(Duration::from_millis(20)).unwrap());
    }
}
