//! Byte-stream transport seam.
//!
//! The connection layer only ever talks to [`StreamTransport`]: a non-blocking
//! duplex stream with scatter/gather IO, readiness registration and peer
//! credentials. The TCP implementation below backs loopback deployments and
//! the integration tests; SafeIPC-style shared-memory transports plug in
//! through the same trait.

use chassis::integrity::{IntegrityLevel, PeerCredentials};
use chassis::ident::UnicastAddress;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;

/// One non-blocking unicast byte stream.
pub trait StreamTransport: Send + Sync {
    /// Registers the transport's readiness source with the poll.
    fn register(
        &self,
        poll: &mio::Poll,
        token: mio::Token,
        interest: mio::Ready,
        opts: mio::PollOpt,
    ) -> io::Result<()>;

    fn deregister(&self, poll: &mio::Poll) -> io::Result<()>;

    /// Completes a non-blocking connect. Called on the first writable event
    /// after the stream was opened.
    fn finish_connect(&self) -> io::Result<()>;

    fn read_vectored(&self, buffers: &mut [io::IoSliceMut<'_>]) -> io::Result<usize>;

    fn write_vectored(&self, buffers: &[io::IoSlice<'_>]) -> io::Result<usize>;

    /// Identity of the peer process. Only meaningful once connected.
    fn peer_credentials(&self) -> io::Result<PeerCredentials>;

    fn shutdown(&self) -> io::Result<()>;
}

/// Opens transports for unicast addresses. One connector per deployment;
/// the connection manager calls it for every new endpoint.
pub trait TransportConnector: Send + Sync {
    fn connect(&self, address: &UnicastAddress) -> io::Result<Arc<dyn StreamTransport>>;
}

/// TCP loopback transport. The address domain selects no routing here, it
/// only namespaces endpoints; the port maps straight onto a loopback port.
pub struct TcpStreamTransport {
    stream: mio::net::TcpStream,
    peer: PeerCredentials,
}

impl StreamTransport for TcpStreamTransport {
    fn register(
        &self,
        poll: &mio::Poll,
        token: mio::Token,
        interest: mio::Ready,
        opts: mio::PollOpt,
    ) -> io::Result<()> {
        poll.register(&self.stream, token, interest, opts)
    }

    fn deregister(&self, poll: &mio::Poll) -> io::Result<()> {
        poll.deregister(&self.stream)
    }

    fn finish_connect(&self) -> io::Result<()> {
        if let Some(err) = self.stream.take_error()? {
            return Err(err);
        }

        // A refused non-blocking connect may surface through peer_addr
        // instead of SO_ERROR.
        self.stream.peer_addr().map(|_| ())
    }

    fn read_vectored(&self, buffers: &mut [io::IoSliceMut<'_>]) -> io::Result<usize> {
        (&self.stream).read_vectored(buffers)
    }

    fn write_vectored(&self, buffers: &[io::IoSlice<'_>]) -> io::Result<usize> {
        (&self.stream).write_vectored(buffers)
    }

    fn peer_credentials(&self) -> io::Result<PeerCredentials> {
        Ok(self.peer)
    }

    fn shutdown(&self) -> io::Result<()> {
        self.stream.shutdown(Shutdown::Both)
    }
}

/// Connector producing TCP loopback transports.
///
/// TCP carries no process credentials, so the peer integrity level is taken
/// from deployment configuration supplied at construction.
pub struct TcpTransportConnector {
    peer_integrity: IntegrityLevel,
}

impl TcpTransportConnector {
    pub fn new(peer_integrity: IntegrityLevel) -> TcpTransportConnector {
        TcpTransportConnector { peer_integrity }
    }
}

impl TransportConnector for TcpTransportConnector {
    fn connect(&self, address: &UnicastAddress) -> io::Result<Arc<dyn StreamTransport>> {
        if address.port > u32::from(u16::max_value()) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Port outside the TCP range",
            ));
        }

        let socket_addr = SocketAddr::from(([127, 0, 0, 1], address.port as u16));
        let stream = mio::net::TcpStream::connect(&socket_addr)?;

        Ok(Arc::new(TcpStreamTransport {
            stream,
            peer: PeerCredentials {
                process_id: 0,
                integrity_level: self.peer_integrity,
            },
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_port_outside_tcp_range() {
        let connector = TcpTransportConnector::new(IntegrityLevel::Qm);
        let result = connector.connect(&UnicastAddress::new(0, 0x0001_0000));

        match result {
            Err(err) => assert_eq!(err.kind(), io::ErrorKind::InvalidInput),
            Ok(_) => panic!("expected connect() to reject an out-of-range port"),
        }
    }

    #[test]
    fn test_connect_and_exchange_over_loopback() {
        use std::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let connector = TcpTransportConnector::new(IntegrityLevel::AsilB);
        let transport = connector
            .connect(&UnicastAddress::new(0, u32::from(port)))
            .unwrap();

        let (mut accepted, _) = listener.accept().unwrap();
        accepted.write_all(&[1, 2, 3]).unwrap();

        assert_eq!(
            transport.peer_credentials().unwrap().integrity_level,
            IntegrityLevel::AsilB
        );

        // Poll until the bytes arrive; the stream is non-blocking.
        let mut received = Vec::new();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);

        while received.len() < 3 {
            let mut buffer = [0u8; 8];
            match transport.read_vectored(&mut [io::IoSliceMut::new(&mut buffer)]) {
                Ok(0) => break,
                Ok(count) => received.extend_from_slice(&buffer[..count]),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    assert!(std::time::Instant::now() < deadline, "Read timed out");
                    std::thread::yield_now();
                }
                Err(err) => panic!("Unexpected read error {:?}", err),
            }
        }

        assert_eq!(received, vec![1, 2, 3]);

        let sent = transport
            .write_vectored(&[io::IoSlice::new(&[9, 8])])
            .unwrap();
        assert_eq!(sent, 2);

        let mut echo = [0u8; 2];
        accepted.read_exact(&mut echo).unwrap();
        assert_eq!(&echo, &[9, 8]);

        transport.shutdown().unwrap();
    }
}
