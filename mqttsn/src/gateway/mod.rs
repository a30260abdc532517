//! MQTT-SN gateway.
//!
//! The [`Gateway`] listens on one UDP socket and runs a [`Session`] per
//! client address, each with its own TCP connection to the MQTT broker.
//!
//! # Example
//!
//! ```no_run
//! use giztoy_mqttsn::gateway::{Gateway, GatewayConfig};
//!
//! # async fn example() -> giztoy_mqttsn::Result<()> {
//! let config = GatewayConfig::new("0.0.0.0:1884", "127.0.0.1:1883");
//! let gateway = Gateway::new(config);
//! gateway.serve().await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod connect;
mod handler;
mod outlet;
mod publish;
mod sleep;
mod subscribe;

pub use config::{
    GatewayConfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_POLL_INTERVAL, DEFAULT_RETRY_COUNT,
    DEFAULT_RETRY_DELAY,
};
pub use handler::Session;

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::codec::{Codec, MqttSnCodec, MAX_DATAGRAM_SIZE};
use crate::error::{Error, Result};
use crate::packet::{GwInfo, Packet};
use crate::transport::SessionTransport;

/// Datagrams queued per session before new ones are dropped.
const SESSION_QUEUE: usize = 64;

type SessionMap = Arc<Mutex<HashMap<SocketAddr, Arc<mpsc::Sender<Bytes>>>>>;

/// UDP front end dispatching datagrams to per-client sessions.
pub struct Gateway {
    config: Arc<GatewayConfig>,
    codec: Arc<dyn Codec>,
    cancel: CancellationToken,
    running: AtomicBool,
    sessions: SessionMap,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config: Arc::new(config),
            codec: Arc::new(MqttSnCodec),
            cancel: CancellationToken::new(),
            running: AtomicBool::new(false),
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Use another wire dialect for every session.
    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Bind the configured address and serve until [`shutdown`](Self::shutdown).
    pub async fn serve(&self) -> Result<()> {
        let socket = UdpSocket::bind(&self.config.listen).await?;
        self.serve_on(socket).await
    }

    /// Serve on an already bound socket.
    pub async fn serve_on(&self, socket: UdpSocket) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning);
        }
        let socket = Arc::new(socket);
        info!("Gateway listening on {}", socket.local_addr()?);

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (n, peer) = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = socket.recv_from(&mut buf) => result?,
            };
            let datagram = Bytes::copy_from_slice(&buf[..n]);
            self.dispatch(&socket, peer, datagram).await;
        }

        info!("Gateway on {} stopped", self.config.listen);
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Stop accepting datagrams and end every session.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Number of live client sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    async fn dispatch(&self, socket: &Arc<UdpSocket>, peer: SocketAddr, datagram: Bytes) {
        let existing = self.sessions.lock().get(&peer).cloned();
        if let Some(tx) = existing {
            if let Err(e) = tx.try_send(datagram) {
                warn!("Session {} lagging, dropped datagram: {}", peer, e);
            }
            return;
        }

        let packet = match self.codec.decode(&datagram) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Dropping datagram from {}: {}", peer, e);
                return;
            }
        };
        match packet {
            Packet::SearchGw(_) => {
                let reply = Packet::GwInfo(GwInfo {
                    gateway_id: self.config.gateway_id,
                    address: Bytes::new(),
                });
                match self.codec.encode(&reply) {
                    Ok(bytes) => {
                        if let Err(e) = socket.send_to(&bytes, peer).await {
                            debug!("GWINFO to {} failed: {}", peer, e);
                        }
                    }
                    Err(e) => warn!("Cannot encode GWINFO: {}", e),
                }
                return;
            }
            Packet::Advertise(_) | Packet::GwInfo(_) => {
                trace!("Ignoring {} from {}", packet.kind(), peer);
                return;
            }
            _ => {}
        }

        let (tx, rx) = mpsc::channel(SESSION_QUEUE);
        let tx = Arc::new(tx);
        if tx.try_send(datagram).is_err() {
            return;
        }
        self.sessions.lock().insert(peer, Arc::clone(&tx));
        debug!("New session for {}", peer);

        let transport = SessionTransport::new(Arc::clone(socket), peer, rx);
        let session = Session::new(Arc::clone(&self.config), transport, &self.cancel)
            .with_codec(Arc::clone(&self.codec));
        let config = Arc::clone(&self.config);
        let sessions = Arc::clone(&self.sessions);
        tokio::spawn(async move {
            match dial(&config).await {
                Ok(stream) => {
                    if let Err(e) = session.run(stream).await {
                        debug!("Session {} ended: {}", peer, e);
                    }
                }
                Err(e) => warn!("Cannot reach broker {} for {}: {}", config.broker, peer, e),
            }

            // Only remove our own entry; a newer session may have replaced it.
            let mut sessions = sessions.lock();
            if sessions.get(&peer).is_some_and(|current| Arc::ptr_eq(current, &tx)) {
                sessions.remove(&peer);
            }
        });
    }
}

async fn dial(config: &GatewayConfig) -> Result<TcpStream> {
    match tokio::time::timeout(config.connect_timeout, TcpStream::connect(&config.broker)).await {
        Ok(stream) => {
            let stream = stream?;
            stream.set_nodelay(true)?;
            Ok(stream)
        }
        Err(_) => Err(Error::Timeout(format!("connect to {}", config.broker))),
    }
}
