//! Per-client gateway session.
//!
//! A [`Session`] owns one MQTT-SN client and its MQTT broker connection.
//! Four tasks share the session state: a reader and a writer per leg. Each
//! leg is processed strictly in arrival order; the packet families are
//! handled in `connect`, `publish`, `subscribe` and `sleep`.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::config::GatewayConfig;
use super::connect::BrokerLink;
use super::outlet::{Outlet, OutletReceivers};
use super::sleep::SleepBuffer;
use crate::codec::{Codec, MqttSnCodec};
use crate::error::{Error, Result};
use crate::mqtt;
use crate::packet::{Disconnect, GwInfo, Packet, PingReq, RegAck, Register, TopicRef};
use crate::store::TransactionStore;
use crate::topics::{self, PredefinedTable, TopicAliases};
use crate::transport::Transport;
use crate::types::{QoS, ReturnCode, SessionState, TopicIdType};

/// One client's bridge between MQTT-SN and MQTT.
pub struct Session {
    config: Arc<GatewayConfig>,
    codec: Arc<dyn Codec>,
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
}

impl Session {
    /// Create a session for the client behind `transport`.
    ///
    /// The session stops when `parent` is cancelled.
    pub fn new(
        config: Arc<GatewayConfig>,
        transport: impl Transport + 'static,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            config,
            codec: Arc::new(MqttSnCodec),
            transport: Arc::new(transport),
            cancel: parent.child_token(),
        }
    }

    /// Use another wire dialect on the client leg.
    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Run until the client disconnects, either leg fails, or the parent
    /// token is cancelled.
    ///
    /// Returns `Ok` after a clean DISCONNECT or cancellation, otherwise the
    /// error that ended the session.
    pub async fn run<B>(self, broker: B) -> Result<()>
    where
        B: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (outlet, receivers) = Outlet::new();
        let shared = Arc::new(Shared::new(
            self.config,
            self.codec,
            self.transport.peer(),
            self.cancel,
            outlet,
        ));
        debug!("Session {} started", shared.peer);

        let OutletReceivers { client, broker: to_broker } = receivers;
        let (reader, writer) = tokio::io::split(broker);
        let handles = [
            shared.spawn(Arc::clone(&shared).read_client(Arc::clone(&self.transport))),
            shared.spawn(Arc::clone(&shared).write_client(Arc::clone(&self.transport), client)),
            shared.spawn(Arc::clone(&shared).read_broker(reader)),
            shared.spawn(Arc::clone(&shared).write_broker(writer, to_broker)),
        ];
        for handle in handles {
            if let Err(e) = handle.await {
                shared.abort(Error::Protocol(format!("session task failed: {}", e)));
            }
        }

        shared.teardown();
        let fatal = shared.fatal.lock().take();
        match fatal {
            Some(e) => {
                info!("Session {} closed: {}", shared.peer, e);
                Err(e)
            }
            None => {
                info!("Session {} closed", shared.peer);
                Ok(())
            }
        }
    }
}

/// State shared by a session's tasks and transactions.
pub(super) struct Shared {
    pub(super) config: Arc<GatewayConfig>,
    pub(super) codec: Arc<dyn Codec>,
    pub(super) peer: String,
    pub(super) cancel: CancellationToken,
    pub(super) outlet: Outlet,
    pub(super) state: Mutex<SessionState>,
    pub(super) client_id: Mutex<Option<String>>,
    /// Keep alive negotiated in CONNECT, seconds.
    pub(super) keep_alive: Mutex<u16>,
    pub(super) aliases: Mutex<TopicAliases>,
    pub(super) predefined: Mutex<PredefinedTable>,
    /// Client-originated transactions, keyed by the client's message ids.
    pub(super) upstream: Arc<TransactionStore>,
    /// Broker-originated transactions, keyed by broker packet ids or ids
    /// picked by the gateway.
    pub(super) downstream: Arc<TransactionStore>,
    pub(super) link: Mutex<BrokerLink>,
    pub(super) sleep: Mutex<SleepBuffer<mqtt::Publish>>,
    pub(super) sleep_duration: Mutex<u16>,
    pub(super) sleeper: Mutex<Option<CancellationToken>>,
    clean: AtomicBool,
    fatal: Mutex<Option<Error>>,
}

impl Shared {
    fn new(
        config: Arc<GatewayConfig>,
        codec: Arc<dyn Codec>,
        peer: String,
        cancel: CancellationToken,
        outlet: Outlet,
    ) -> Self {
        // Session-less publishers only ever see the shared predefined topics.
        let predefined = config.predefined.for_client(None);
        let aliases = TopicAliases::new(config.max_topic_aliases);
        Self {
            config,
            codec,
            peer,
            cancel,
            outlet,
            state: Mutex::new(SessionState::Disconnected),
            client_id: Mutex::new(None),
            keep_alive: Mutex::new(0),
            aliases: Mutex::new(aliases),
            predefined: Mutex::new(predefined),
            upstream: TransactionStore::new(),
            downstream: TransactionStore::new(),
            link: Mutex::new(BrokerLink::Idle),
            sleep: Mutex::new(SleepBuffer::new()),
            sleep_duration: Mutex::new(0),
            sleeper: Mutex::new(None),
            clean: AtomicBool::new(false),
            fatal: Mutex::new(None),
        }
    }

    pub(super) fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub(super) fn set_state(&self, next: SessionState) {
        let prev = std::mem::replace(&mut *self.state.lock(), next);
        if prev != next {
            debug!("Session {}: {} -> {}", self.peer, prev, next);
        }
    }

    /// Client id for logs.
    pub(super) fn name(&self) -> String {
        self.client_id
            .lock()
            .clone()
            .unwrap_or_else(|| self.peer.clone())
    }

    /// End the session with `err`. Only the first error is kept, and errors
    /// after a clean shutdown are ignored.
    pub(super) fn abort(&self, err: Error) {
        if self.cancel.is_cancelled() {
            debug!("Session {}: ignoring error after shutdown: {}", self.peer, err);
            return;
        }
        {
            let mut fatal = self.fatal.lock();
            if fatal.is_some() {
                return;
            }
            warn!("Session {} failed: {}", self.name(), err);
            *fatal = Some(err);
        }
        self.farewell();
        self.cancel.cancel();
    }

    /// Queue a DISCONNECT for the client unless it never connected.
    fn farewell(&self) {
        let prev = std::mem::replace(&mut *self.state.lock(), SessionState::Disconnected);
        if prev != SessionState::Disconnected {
            self.outlet.client_now(Packet::Disconnect(Disconnect::default()));
        }
    }

    fn teardown(&self) {
        self.stop_sleeper();
        self.upstream.cancel_all();
        self.downstream.cancel_all();
        self.set_state(SessionState::Disconnected);
    }

    fn spawn<F>(self: &Arc<Self>, task: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = task.await {
                shared.abort(e);
            }
            shared.cancel.cancel();
        })
    }

    // ------------------------------------------------------------------
    // I/O loops
    // ------------------------------------------------------------------

    async fn read_client(self: Arc<Self>, transport: Arc<dyn Transport>) -> Result<()> {
        while !self.cancel.is_cancelled() {
            let datagram = match transport.recv(self.config.poll_interval).await {
                Ok(Some(datagram)) => datagram,
                Ok(None) => continue,
                Err(Error::ConnectionClosed) if self.closing() => return Ok(()),
                Err(e) => return Err(e),
            };
            let packet = self.codec.decode(&datagram)?;
            trace!("{} -> {}", self.peer, packet.kind());
            self.handle_client(packet)?;
        }
        Ok(())
    }

    async fn write_client(
        self: Arc<Self>,
        transport: Arc<dyn Transport>,
        mut rx: UnboundedReceiver<Packet>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                biased;
                packet = rx.recv() => match packet {
                    Some(packet) => self.transmit(transport.as_ref(), &packet).await?,
                    None => return Ok(()),
                },
                _ = self.cancel.cancelled() => break,
            }
        }
        // Deliver whatever was queued before cancellation, e.g. a DISCONNECT.
        while let Ok(packet) = rx.try_recv() {
            if let Err(e) = self.transmit(transport.as_ref(), &packet).await {
                debug!("Session {}: dropped {} on close: {}", self.peer, packet.kind(), e);
                break;
            }
        }
        Ok(())
    }

    /// Packets the codec cannot frame are dropped; the session goes on.
    async fn transmit(&self, transport: &dyn Transport, packet: &Packet) -> Result<()> {
        let datagram = match self.codec.encode(packet) {
            Ok(datagram) => datagram,
            Err(e) => {
                warn!("Session {}: dropping {}: {}", self.peer, packet.kind(), e);
                return Ok(());
            }
        };
        trace!("{} <- {}", self.peer, packet.kind());
        transport.send(datagram, self.config.write_timeout).await
    }

    async fn read_broker<B>(self: Arc<Self>, mut reader: ReadHalf<B>) -> Result<()>
    where
        B: AsyncRead + AsyncWrite + Send,
    {
        let mut buf = BytesMut::with_capacity(4096);
        loop {
            let result = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                result = mqtt::read_packet(&mut reader, &mut buf, self.config.max_packet_size) => {
                    result
                }
            };
            match result {
                Ok(packet) => {
                    trace!("{} <= broker {}", self.peer, mqtt::packet_kind(&packet));
                    self.handle_broker(packet)?;
                }
                Err(Error::ConnectionClosed) if self.closing() => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    async fn write_broker<B>(
        self: Arc<Self>,
        mut writer: WriteHalf<B>,
        mut rx: UnboundedReceiver<mqtt::Packet>,
    ) -> Result<()>
    where
        B: AsyncRead + AsyncWrite + Send,
    {
        loop {
            tokio::select! {
                biased;
                packet = rx.recv() => match packet {
                    Some(packet) => {
                        trace!("{} => broker {}", self.peer, mqtt::packet_kind(&packet));
                        mqtt::write_packet(&mut writer, &packet).await?;
                    }
                    None => return Ok(()),
                },
                _ = self.cancel.cancelled() => break,
            }
        }
        while let Ok(packet) = rx.try_recv() {
            if mqtt::write_packet(&mut writer, &packet).await.is_err() {
                break;
            }
        }
        Ok(())
    }

    /// Peer closure is expected once the session is shutting down.
    fn closing(&self) -> bool {
        self.clean.load(Ordering::SeqCst) || self.cancel.is_cancelled()
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    pub(super) fn handle_client(self: &Arc<Self>, packet: Packet) -> Result<()> {
        let kind = packet.kind();
        if self.state() == SessionState::Disconnected
            && !self.permitted_while_disconnected(&packet)
        {
            return Err(Error::Protocol(format!("{} before CONNECT", kind)));
        }

        match packet {
            Packet::Connect(connect) => self.on_connect(connect),
            Packet::Auth(auth) => self.on_auth(auth),
            Packet::WillTopic(will) => self.on_will_topic(will),
            Packet::WillMsg(will) => self.on_will_msg(will),
            Packet::Register(register) => self.on_register(register),
            Packet::RegAck(regack) => self.on_client_regack(regack),
            Packet::Publish(publish) => self.on_client_publish(publish),
            Packet::PubAck(puback) => self.on_client_puback(puback),
            Packet::PubRec(msg_id) => self.on_client_pubrec(msg_id),
            Packet::PubRel(msg_id) => self.on_client_pubrel(msg_id),
            Packet::PubComp(msg_id) => self.on_client_pubcomp(msg_id),
            Packet::Subscribe(subscribe) => self.on_subscribe(subscribe),
            Packet::Unsubscribe(unsubscribe) => self.on_unsubscribe(unsubscribe),
            Packet::PingReq(ping) => self.on_pingreq(ping),
            Packet::Disconnect(disconnect) => self.on_disconnect(disconnect),
            Packet::SearchGw(_) => {
                self.outlet.client(Packet::GwInfo(GwInfo {
                    gateway_id: self.config.gateway_id,
                    address: Bytes::new(),
                }));
                Ok(())
            }
            Packet::Advertise(_) | Packet::GwInfo(_) => {
                trace!("Ignoring {} from {}", kind, self.peer);
                Ok(())
            }
            Packet::ConnAck(_)
            | Packet::WillTopicReq
            | Packet::WillMsgReq
            | Packet::SubAck(_)
            | Packet::UnsubAck(_)
            | Packet::PingResp => Err(Error::UnexpectedPacket {
                expected: "client packet".to_string(),
                got: kind.to_string(),
            }),
        }
    }

    /// Packets a client may send before its session is established.
    fn permitted_while_disconnected(&self, packet: &Packet) -> bool {
        match packet {
            Packet::Connect(_)
            | Packet::Auth(_)
            | Packet::WillTopic(_)
            | Packet::WillMsg(_)
            | Packet::Disconnect(_)
            | Packet::SearchGw(_)
            | Packet::Advertise(_)
            | Packet::GwInfo(_) => true,
            Packet::Publish(publish) => {
                !self.config.auth_enabled
                    && publish.qos == QoS::FireAndForget
                    && matches!(publish.topic.kind, TopicIdType::Short | TopicIdType::Predefined)
            }
            _ => false,
        }
    }

    pub(super) fn handle_broker(self: &Arc<Self>, packet: mqtt::Packet) -> Result<()> {
        match packet {
            mqtt::Packet::ConnAck(connack) => self.on_broker_connack(connack),
            mqtt::Packet::Publish(publish) => self.on_broker_publish(publish),
            mqtt::Packet::PubAck(puback) => self.on_broker_puback(puback.pkid),
            mqtt::Packet::PubRec(pubrec) => self.on_broker_pubrec(pubrec.pkid),
            mqtt::Packet::PubRel(pubrel) => self.on_broker_pubrel(pubrel.pkid),
            mqtt::Packet::PubComp(pubcomp) => self.on_broker_pubcomp(pubcomp.pkid),
            mqtt::Packet::SubAck(suback) => self.on_broker_suback(suback),
            mqtt::Packet::UnsubAck(unsuback) => self.on_broker_unsuback(unsuback.pkid),
            mqtt::Packet::PingResp => {
                trace!("Broker PINGRESP for {}", self.peer);
                Ok(())
            }
            other => Err(Error::UnexpectedPacket {
                expected: "broker packet".to_string(),
                got: mqtt::packet_kind(&other).to_string(),
            }),
        }
    }

    // ------------------------------------------------------------------
    // Stateless handlers
    // ------------------------------------------------------------------

    fn on_register(&self, register: Register) -> Result<()> {
        let name = register.topic_name.as_str();
        let (topic_id, code) = if name.is_empty() || topics::has_wildcard(name) {
            (0, ReturnCode::NotSupported)
        } else {
            match self.aliases.lock().register_confirmed(name) {
                Ok(id) => (id, ReturnCode::Accepted),
                Err(e) => {
                    warn!("Cannot register {} for {}: {}", name, self.name(), e);
                    (0, ReturnCode::Congestion)
                }
            }
        };
        debug!("Registered {} as {} for {} ({})", name, topic_id, self.name(), code);
        self.outlet.client(Packet::RegAck(RegAck {
            topic_id,
            msg_id: register.msg_id,
            code,
        }));
        Ok(())
    }

    fn on_pingreq(self: &Arc<Self>, ping: PingReq) -> Result<()> {
        match self.state() {
            SessionState::Asleep if ping.client_id.is_some() => self.wake(),
            SessionState::Awake => debug!("Ignoring PINGREQ from {} while flushing", self.name()),
            SessionState::Active => {
                self.outlet.client(Packet::PingResp);
                if self.link_up() {
                    self.outlet.broker(mqtt::create_pingreq());
                }
            }
            _ => self.outlet.client_now(Packet::PingResp),
        }
        Ok(())
    }

    fn on_disconnect(self: &Arc<Self>, disconnect: Disconnect) -> Result<()> {
        match disconnect.sleep_duration() {
            Some(duration) if self.state() != SessionState::Disconnected => {
                self.enter_sleep(duration);
            }
            _ => self.disconnect(),
        }
        Ok(())
    }

    /// Clean disconnect: farewell on both legs, then stop every task.
    fn disconnect(&self) {
        info!("Client {} disconnected", self.name());
        self.clean.store(true, Ordering::SeqCst);
        self.stop_sleeper();
        if self.link_up() {
            self.outlet.broker(mqtt::create_disconnect());
        }
        self.outlet.client_now(Packet::Disconnect(Disconnect::default()));
        self.set_state(SessionState::Disconnected);
        self.cancel.cancel();
    }

    /// Topic name behind a client-supplied topic reference.
    pub(super) fn topic_name(&self, topic: TopicRef) -> Option<String> {
        match topic.kind {
            TopicIdType::Normal => self.aliases.lock().name(topic.id).map(str::to_string),
            TopicIdType::Predefined => self.predefined.lock().name(topic.id).map(str::to_string),
            TopicIdType::Short => topics::decode_short(topic.id),
        }
    }
}
