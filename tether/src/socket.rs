//! Non-blocking UDP socket facade.
//!
//! Wraps `std::net::UdpSocket` the way the engine needs it: bound
//! non-blocking with enlarged kernel buffers, drained with `WouldBlock`
//! mapped to "nothing there", and waited on with a bounded poll.

use std::io;
use std::net::UdpSocket;

use crate::address::Address;

/// Kernel receive buffer requested at bind time.
pub const RECEIVE_BUFFER_SIZE: usize = 256 * 1024;
/// Kernel send buffer requested at bind time.
pub const SEND_BUFFER_SIZE: usize = 256 * 1024;

pub(crate) struct Socket {
    inner: UdpSocket,
}

impl Socket {
    /// Bind a datagram socket and configure it for the service loop.
    pub fn bind(address: Address) -> io::Result<Self> {
        let socket = UdpSocket::bind(address.to_socket_addr())?;
        socket.set_nonblocking(true)?;
        socket.set_broadcast(true)?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let fd = socket.as_raw_fd();
            for (option, size) in [
                (libc::SO_RCVBUF, RECEIVE_BUFFER_SIZE as i32),
                (libc::SO_SNDBUF, SEND_BUFFER_SIZE as i32),
            ] {
                unsafe {
                    libc::setsockopt(
                        fd,
                        libc::SOL_SOCKET,
                        option,
                        &size as *const i32 as *const libc::c_void,
                        std::mem::size_of::<i32>() as libc::socklen_t,
                    );
                }
            }
        }

        Ok(Self { inner: socket })
    }

    pub fn local_address(&self) -> io::Result<Address> {
        let addr = self.inner.local_addr()?;
        Address::from_socket_addr(addr)
            .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "socket is not IPv4"))
    }

    /// Send one datagram. A full kernel buffer reports 0 bytes sent
    /// instead of failing.
    pub fn send(&self, to: Address, data: &[u8]) -> io::Result<usize> {
        match self.inner.send_to(data, to.to_socket_addr()) {
            Ok(sent) => Ok(sent),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Receive one datagram if available. Asynchronous ICMP errors
    /// surfaced on the socket (a remote that went away) are swallowed so
    /// one dead peer cannot wedge the host.
    pub fn receive(&self, buffer: &mut [u8]) -> io::Result<Option<(usize, Address)>> {
        loop {
            match self.inner.recv_from(buffer) {
                Ok((length, from)) => match Address::from_socket_addr(from) {
                    Some(address) => return Ok(Some((length, address))),
                    None => continue,
                },
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
                    ) =>
                {
                    continue
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Wait up to `timeout` milliseconds for the socket to become
    /// readable. Returns false on timeout or interruption.
    #[cfg(unix)]
    pub fn wait(&self, timeout: u32) -> io::Result<bool> {
        use std::os::unix::io::AsRawFd;

        let mut poll_fd = libc::pollfd {
            fd: self.inner.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let result = unsafe { libc::poll(&mut poll_fd, 1, timeout.min(i32::MAX as u32) as i32) };
        if result < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(err);
        }
        Ok(result > 0 && poll_fd.revents & libc::POLLIN != 0)
    }

    /// Fallback wait: sleep briefly and report "maybe readable" so the
    /// non-blocking receive pump decides. Only wakeup latency differs.
    #[cfg(not(unix))]
    pub fn wait(&self, timeout: u32) -> io::Result<bool> {
        std::thread::sleep(std::time::Duration::from_millis(timeout.min(2) as u64));
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn loopback(port: u16) -> Address {
        Address::new(u32::from(Ipv4Addr::LOCALHOST), port)
    }

    #[test]
    fn bind_and_report_address() {
        let socket = Socket::bind(loopback(0)).unwrap();
        let address = socket.local_address().unwrap();
        assert!(address.port > 0);
    }

    #[test]
    fn empty_socket_reports_nothing() {
        let socket = Socket::bind(loopback(0)).unwrap();
        let mut buffer = [0u8; 64];
        assert!(socket.receive(&mut buffer).unwrap().is_none());
    }

    #[test]
    fn datagram_roundtrip_between_sockets() {
        let a = Socket::bind(loopback(0)).unwrap();
        let b = Socket::bind(loopback(0)).unwrap();
        let b_addr = b.local_address().unwrap();

        assert_eq!(a.send(b_addr, b"ping").unwrap(), 4);
        assert!(b.wait(500).unwrap());

        let mut buffer = [0u8; 64];
        let (length, from) = b.receive(&mut buffer).unwrap().unwrap();
        assert_eq!(&buffer[..length], b"ping");
        assert_eq!(from, a.local_address().unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn wait_times_out_quickly_when_idle() {
        let socket = Socket::bind(loopback(0)).unwrap();
        let start = std::time::Instant::now();
        assert!(!socket.wait(30).unwrap());
        assert!(start.elapsed().as_millis() >= 20);
    }
}
