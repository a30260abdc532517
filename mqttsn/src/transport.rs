//! Datagram transports for the constrained leg.
//!
//! A [`Transport`] moves whole MQTT-SN datagrams with bounded waits, so a
//! reader loop can poll its cancellation token between reads.

use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};

use crate::codec::MAX_DATAGRAM_SIZE;
use crate::error::{Error, Result};

/// Datagram endpoint with timeout-bounded reads and writes.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Receive one datagram. `Ok(None)` means the timeout elapsed first.
    async fn recv(&self, timeout: Duration) -> Result<Option<Bytes>>;

    /// Send one datagram.
    async fn send(&self, datagram: Bytes, timeout: Duration) -> Result<()>;

    /// Remote address, for logs.
    fn peer(&self) -> String;
}

/// UDP socket connected to a single peer.
pub struct UdpTransport {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl UdpTransport {
    /// Bind an ephemeral local port and connect it to `peer`.
    pub async fn connect(peer: &str) -> Result<Self> {
        let peer: SocketAddr = peer
            .parse()
            .map_err(|e| Error::InvalidConfig(format!("invalid address {}: {}", peer, e)))?;
        let local: SocketAddr = if peer.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(peer).await?;
        Ok(Self { socket, peer })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn recv(&self, timeout: Duration) -> Result<Option<Bytes>> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        match tokio::time::timeout(timeout, self.socket.recv(&mut buf)).await {
            Ok(Ok(n)) => {
                buf.truncate(n);
                Ok(Some(Bytes::from(buf)))
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Ok(None),
        }
    }

    async fn send(&self, datagram: Bytes, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.socket.send(&datagram)).await {
            Ok(result) => {
                result?;
                Ok(())
            }
            Err(_) => Err(Error::Timeout(format!("send to {}", self.peer))),
        }
    }

    fn peer(&self) -> String {
        self.peer.to_string()
    }
}

/// One peer's view of the gateway's shared socket.
///
/// Inbound datagrams are routed here by the listener; outbound ones are
/// sent straight from the shared socket.
pub struct SessionTransport {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    inbound: Mutex<mpsc::Receiver<Bytes>>,
}

impl SessionTransport {
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr, inbound: mpsc::Receiver<Bytes>) -> Self {
        Self {
            socket,
            peer,
            inbound: Mutex::new(inbound),
        }
    }
}

#[async_trait]
impl Transport for SessionTransport {
    async fn recv(&self, timeout: Duration) -> Result<Option<Bytes>> {
        let mut inbound = self.inbound.lock().await;
        match tokio::time::timeout(timeout, inbound.recv()).await {
            Ok(Some(datagram)) => Ok(Some(datagram)),
            Ok(None) => Err(Error::ConnectionClosed),
            Err(_) => Ok(None),
        }
    }

    async fn send(&self, datagram: Bytes, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.socket.send_to(&datagram, self.peer)).await {
            Ok(result) => {
                result?;
                Ok(())
            }
            Err(_) => Err(Error::Timeout(format!("send to {}", self.peer))),
        }
    }

    fn peer(&self) -> String {
        self.peer.to_string()
    }
}

/// In-memory datagram endpoint, one half of a [`pipe`].
pub struct PipeTransport {
    name: String,
    outbound: mpsc::Sender<Bytes>,
    inbound: Mutex<mpsc::Receiver<Bytes>>,
}

/// Connected pair of in-memory transports.
pub fn pipe(capacity: usize) -> (PipeTransport, PipeTransport) {
    let (a_tx, a_rx) = mpsc::channel(capacity);
    let (b_tx, b_rx) = mpsc::channel(capacity);
    (
        PipeTransport {
            name: "pipe-a".to_string(),
            outbound: a_tx,
            inbound: Mutex::new(b_rx),
        },
        PipeTransport {
            name: "pipe-b".to_string(),
            outbound: b_tx,
            inbound: Mutex::new(a_rx),
        },
    )
}

#[async_trait]
impl Transport for PipeTransport {
    async fn recv(&self, timeout: Duration) -> Result<Option<Bytes>> {
        let mut inbound = self.inbound.lock().await;
        match tokio::time::timeout(timeout, inbound.recv()).await {
            Ok(Some(datagram)) => Ok(Some(datagram)),
            Ok(None) => Err(Error::ConnectionClosed),
            Err(_) => Ok(None),
        }
    }

    async fn send(&self, datagram: Bytes, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.outbound.send(datagram)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => Err(Error::Timeout(format!("send on {}", self.name))),
        }
    }

    fn peer(&self) -> String {
        self.name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pipe_delivers_in_order() {
        let (a, b) = pipe(8);
        a.send(Bytes::from_static(b"one"), Duration::from_secs(1)).await.unwrap();
        a.send(Bytes::from_static(b"two"), Duration::from_secs(1)).await.unwrap();

        let first = b.recv(Duration::from_secs(1)).await.unwrap();
        let second = b.recv(Duration::from_secs(1)).await.unwrap();
        assert_eq!(first.as_deref(), Some(&b"one"[..]));
        assert_eq!(second.as_deref(), Some(&b"two"[..]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pipe_recv_times_out() {
        let (_a, b) = pipe(8);
        assert!(b.recv(Duration::from_millis(250)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pipe_closed() {
        let (a, b) = pipe(8);
        drop(a);
        assert!(matches!(b.recv(Duration::from_secs(1)).await, Err(Error::ConnectionClosed)));
        assert!(matches!(
            b.send(Bytes::new(), Duration::from_secs(1)).await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_udp_roundtrip() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let client = UdpTransport::connect(&addr.to_string()).await.unwrap();

        client.send(Bytes::from_static(b"ping"), Duration::from_secs(1)).await.unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");

        let shared = Arc::new(server);
        let (tx, rx) = mpsc::channel(4);
        let session = SessionTransport::new(Arc::clone(&shared), from, rx);
        session.send(Bytes::from_static(b"pong"), Duration::from_secs(1)).await.unwrap();
        let got = client.recv(Duration::from_secs(1)).await.unwrap();
        assert_eq!(got.as_deref(), Some(&b"pong"[..]));

        tx.send(Bytes::from_static(b"routed")).await.unwrap();
        let routed = session.recv(Duration::from_secs(1)).await.unwrap();
        assert_eq!(routed.as_deref(), Some(&b"routed"[..]));
    }
}
