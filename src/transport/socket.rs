//! Socket wrappers for the shared data channel and the per-peer control streams.
//!
//! Both sockets are driven through tokio's readiness-based `try_*` methods so the consumer's
//! poll never blocks on an actual read or write.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::net::{TcpStream, UdpSocket};
use tracing::{trace, warn};

use super::events::{EventQueue, TransportEvent};
use crate::core::DatagramSink;

#[cfg(any(target_os = "linux", target_os = "android"))]
const IGNORABLE_OS_CODES: &[i32] = &[
    90, // EMSGSIZE
    88, // ENOTSOCK
];

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
const IGNORABLE_OS_CODES: &[i32] = &[
    40, // EMSGSIZE
    38, // ENOTSOCK
];

#[cfg(windows)]
const IGNORABLE_OS_CODES: &[i32] = &[
    10040, // WSAEMSGSIZE
    10038, // WSAENOTSOCK
];

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly",
    windows
)))]
const IGNORABLE_OS_CODES: &[i32] = &[];

/// Whether a socket error is transport noise that must be swallowed without an event.
///
/// Noise: interrupted call, not-a-socket, connection reset, oversized message, timeout, and
/// would-block on a non-blocking call.
pub fn is_ignorable(err: &io::Error) -> bool {
    match err.kind() {
        io::ErrorKind::Interrupted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::TimedOut
        | io::ErrorKind::WouldBlock => true,
        _ => err
            .raw_os_error()
            .is_some_and(|code| IGNORABLE_OS_CODES.contains(&code)),
    }
}

/// The shared UDP data socket.
///
/// Also serves as the [`DatagramSink`] for every engine of the owning transport instance.
/// Reportable send errors become [`TransportEvent::Error`] events on the instance's queue.
#[derive(Debug)]
pub struct DataSocket {
    socket: UdpSocket,
    events: Arc<EventQueue>,
}

impl DataSocket {
    /// Bind a data socket.
    ///
    /// Returns once the reactor has reported the socket writable, so the first
    /// [`write_datagram`](DatagramSink::write_datagram) does not fail with `WouldBlock`.
    pub async fn bind(addr: SocketAddr, events: Arc<EventQueue>) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Self::from_socket(socket, events).await
    }

    /// Wrap an already bound socket, waiting for its first writable readiness.
    pub async fn from_socket(socket: UdpSocket, events: Arc<EventQueue>) -> io::Result<Self> {
        socket.writable().await?;
        Ok(Self { socket, events })
    }

    /// Local address of the socket.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive one datagram without blocking.
    ///
    /// Returns `Ok(None)` if nothing is ready.
    pub fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.socket.try_recv_from(buf) {
            Ok((len, from)) => Ok(Some((len, from))),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Classify a socket error: noise is logged at `trace!`, anything else is queued as an
    /// error event.
    pub fn report(&self, endpoint: Option<SocketAddr>, err: &io::Error) {
        if is_ignorable(err) {
            trace!("ignoring socket error ({:?}): {}", endpoint, err);
            return;
        }
        warn!("socket error ({:?}): {}", endpoint, err);
        self.events.enqueue(TransportEvent::error(endpoint, err));
    }
}

impl DatagramSink for DataSocket {
    fn write_datagram(&self, datagram: &[u8], dest: SocketAddr) -> io::Result<()> {
        match self.socket.try_send_to(datagram, dest) {
            Ok(_) => Ok(()),
            Err(e) => {
                self.report(Some(dest), &e);
                Err(e)
            }
        }
    }
}

/// Result of a non-blocking liveness check on a control stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// No data, or data that was discarded; the peer is still there.
    Alive,
    /// Orderly shutdown or reset by the peer.
    Closed,
}

/// A connection-oriented control stream used to bootstrap one peer.
///
/// Carries the accept message (server to client) and an optional Disconnect tag; never
/// application data.
#[derive(Debug)]
pub struct ControlStream {
    stream: TcpStream,
    peer: SocketAddr,
}

impl ControlStream {
    /// Wrap a connected stream.
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            trace!("control stream {}: TCP_NODELAY not set: {}", peer, e);
        }
        Self { stream, peer }
    }

    /// Remote address of the stream.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Write all of `data`, waiting for writability as needed.
    pub async fn write_all(&self, data: &[u8]) -> io::Result<()> {
        let mut written = 0;
        while written < data.len() {
            self.stream.writable().await?;
            match self.stream.try_write(&data[written..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => written += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Best-effort non-blocking write of a short message.
    pub fn try_send(&self, data: &[u8]) -> io::Result<()> {
        match self.stream.try_write(data)? {
            n if n == data.len() => Ok(()),
            _ => Err(io::ErrorKind::WriteZero.into()),
        }
    }

    /// Read whatever is available into `buf`, waiting for readability first.
    ///
    /// Returns `Ok(0)` on orderly shutdown by the peer.
    pub async fn read_buf(&self, buf: &mut BytesMut) -> io::Result<usize> {
        loop {
            self.stream.readable().await?;
            match self.stream.try_read_buf(buf) {
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                res => return res,
            }
        }
    }

    /// Cheap non-blocking check distinguishing "no data" from "peer closed".
    ///
    /// Bytes that are available are consumed and discarded.
    pub fn probe(&self) -> Liveness {
        let mut scratch = [0u8; 64];
        match self.stream.try_read(&mut scratch) {
            Ok(0) => Liveness::Closed,
            Ok(n) => {
                trace!("control stream {}: discarded {} bytes", self.peer, n);
                Liveness::Alive
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Liveness::Alive,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Liveness::Alive,
            Err(e) => {
                trace!("control stream {}: {}", self.peer, e);
                Liveness::Closed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    use super::*;

    async fn stream_pair() -> (ControlStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        (ControlStream::new(server, peer), client)
    }

    #[test]
    fn test_error_taxonomy() {
        for kind in [
            io::ErrorKind::Interrupted,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::TimedOut,
            io::ErrorKind::WouldBlock,
        ] {
            assert!(is_ignorable(&io::Error::from(kind)), "{kind:?}");
        }
        for kind in [
            io::ErrorKind::AddrNotAvailable,
            io::ErrorKind::PermissionDenied,
            io::ErrorKind::ConnectionRefused,
        ] {
            assert!(!is_ignorable(&io::Error::from(kind)), "{kind:?}");
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_os_codes_ignorable() {
        assert!(is_ignorable(&io::Error::from_raw_os_error(90)));
        assert!(is_ignorable(&io::Error::from_raw_os_error(88)));
        // EACCES
        assert!(!is_ignorable(&io::Error::from_raw_os_error(13)));
    }

    #[tokio::test]
    async fn test_data_socket_send_recv() {
        let events = Arc::new(EventQueue::new());
        let a = DataSocket::bind("127.0.0.1:0".parse().unwrap(), events.clone())
            .await
            .unwrap();
        let b = DataSocket::bind("127.0.0.1:0".parse().unwrap(), events.clone())
            .await
            .unwrap();

        // No sleep or yield: the first send right after bind must go out.
        a.write_datagram(b"hello", b.local_addr().unwrap()).unwrap();
        a.write_datagram(b"again", b.local_addr().unwrap()).unwrap();

        let mut buf = [0u8; 64];
        let mut received = None;
        for _ in 0..100 {
            if let Some(r) = b.try_recv_from(&mut buf).unwrap() {
                received = Some(r);
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let (len, from) = received.expect("datagram not received");
        assert_eq!(&buf[..len], b"hello");
        assert_eq!(from, a.local_addr().unwrap());
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_wrapped_socket_sends_immediately() {
        let events = Arc::new(EventQueue::new());
        let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let a = DataSocket::from_socket(raw, events.clone()).await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        a.write_datagram(b"bye", b.local_addr().unwrap()).unwrap();
        let mut buf = [0u8; 8];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), b.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"bye");
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_empty_socket_yields_none() {
        let socket = DataSocket::bind("127.0.0.1:0".parse().unwrap(), Arc::new(EventQueue::new()))
            .await
            .unwrap();
        let mut buf = [0u8; 16];
        assert!(socket.try_recv_from(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_report_classifies() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let events = Arc::new(EventQueue::new());
        let socket = rt
            .block_on(DataSocket::bind("127.0.0.1:0".parse().unwrap(), events.clone()))
            .unwrap();

        socket.report(None, &io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(events.is_empty());

        socket.report(None, &io::Error::from(io::ErrorKind::PermissionDenied));
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_control_stream_write_and_probe() {
        let (control, mut client) = stream_pair().await;
        assert_eq!(control.probe(), Liveness::Alive);

        control.write_all(b"abc").await.unwrap();
        let mut buf = [0u8; 3];
        tokio::io::AsyncReadExt::read_exact(&mut client, &mut buf)
            .await
            .unwrap();
        assert_eq!(&buf, b"abc");

        client.shutdown().await.unwrap();
        drop(client);

        let mut state = Liveness::Alive;
        for _ in 0..100 {
            state = control.probe();
            if state == Liveness::Closed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(state, Liveness::Closed);
    }

    #[tokio::test]
    async fn test_control_stream_read_buf() {
        let (control, mut client) = stream_pair().await;
        client.write_all(&[1, 2, 3]).await.unwrap();

        let mut buf = BytesMut::new();
        let n = control.read_buf(&mut buf).await.unwrap();
        assert!(n > 0);
        assert_eq!(&buf[..n], &[1, 2, 3][..n]);

        drop(client);
        let mut rest = BytesMut::new();
        loop {
            if control.read_buf(&mut rest).await.unwrap() == 0 {
                break;
            }
        }
    }
}
