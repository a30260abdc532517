//! MQTT-SN client.
//!
//! Speaks MQTT-SN 1.2 to a gateway over any [`Transport`]. Every request is
//! a retrying transaction: it is retransmitted (flagged DUP where the packet
//! allows) until answered or the retry budget runs out, and the caller sees
//! the outcome as a typed [`Error`].

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::codec::{Codec, MqttSnCodec};
use crate::error::{Error, Result, TransactionError};
use crate::packet::{
    Auth, Connect, Disconnect, Packet, PingReq, PubAck, Publish, RegAck, Register, Subscribe,
    TopicFilter, TopicRef, Unsubscribe, WillMsg, WillTopic,
};
use crate::store::{IdAllocator, Key, TransactionStore};
use crate::topics::{self, PredefinedTable, TopicAliases};
use crate::transaction::{Lifecycle, Resender, RetryTransaction, Transaction};
use crate::transport::Transport;
use crate::types::{Message, QoS, ReturnCode, SessionState, TopicIdType, PROTOCOL_ID};

/// Last will registered during CONNECT.
#[derive(Debug, Clone)]
pub struct LastWill {
    pub topic: String,
    pub message: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Client ID. Empty lets the gateway pick one.
    pub client_id: String,
    /// Keep alive interval in seconds.
    pub keep_alive: u16,
    /// Clean session flag.
    pub clean_session: bool,
    /// Delay before an unanswered request is retransmitted.
    pub retry_delay: Duration,
    /// Retransmissions before a request fails.
    pub retry_count: u32,
    /// Username for the AUTH exchange.
    pub username: Option<String>,
    /// Password for the AUTH exchange.
    pub password: Option<Vec<u8>>,
    pub will: Option<LastWill>,
    /// Topic ids agreed with the gateway out of band.
    pub predefined: PredefinedTable,
    /// How long one transport read waits before rechecking for shutdown.
    pub poll_interval: Duration,
    /// Bound on a single datagram send.
    pub write_timeout: Duration,
    /// Send PINGREQ at `keep_alive / 2` intervals while active.
    pub auto_keepalive: bool,
}

impl ClientConfig {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            keep_alive: 60,
            clean_session: true,
            retry_delay: Duration::from_secs(10),
            retry_count: 3,
            username: None,
            password: None,
            will: None,
            predefined: PredefinedTable::default(),
            poll_interval: Duration::from_millis(250),
            write_timeout: Duration::from_secs(5),
            auto_keepalive: true,
        }
    }

    pub fn with_keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = seconds;
        self
    }

    pub fn with_clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    /// Set the retransmission delay and budget.
    pub fn with_retry(mut self, delay: Duration, count: u32) -> Self {
        self.retry_delay = delay;
        self.retry_count = count;
        self
    }

    /// Authenticate with SASL PLAIN after CONNECT.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<Vec<u8>>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_will(mut self, will: LastWill) -> Self {
        self.will = Some(will);
        self
    }

    /// Add a predefined topic id.
    pub fn with_predefined(mut self, id: u16, name: &str) -> Self {
        self.predefined.insert(id, name);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_auto_keepalive(mut self, enabled: bool) -> Self {
        self.auto_keepalive = enabled;
        self
    }
}

// Request slots. Requests keyed by message id use `Exchange`; the others
// occupy one singleton slot each.
enum Exchange {}
enum Connecting {}
enum Pinging {}
enum Closing {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Waiting,
    /// QoS 2: PUBREC received, PUBREL sent.
    Releasing,
    Done,
}

/// Queue `packet` for the writer task.
fn push(outlet: &mpsc::UnboundedSender<Packet>, packet: Packet) {
    if let Err(mpsc::error::SendError(packet)) = outlet.send(packet) {
        debug!("Client writer gone, dropping {}", packet.kind());
    }
}

/// One outstanding request and, once answered, its reply.
struct Request<K> {
    retry: Arc<RetryTransaction<Step, Packet>>,
    outlet: mpsc::UnboundedSender<Packet>,
    reply: Mutex<Option<Packet>>,
    _slot: PhantomData<fn() -> K>,
}

impl<K: 'static> Transaction for Request<K> {
    fn lifecycle(&self) -> &Lifecycle {
        self.retry.lifecycle()
    }
}

impl<K: 'static> Request<K> {
    /// Send `packet` and start the retry timer.
    fn begin(&self, packet: Packet) {
        self.retry.proceed(Step::Waiting, Some(packet.clone()));
        push(&self.outlet, packet);
    }

    /// Send the next packet of a multi-step exchange.
    fn step(&self, from: Step, to: Step, packet: Packet) -> bool {
        if !self.retry.advance(from, to, Some(packet.clone())) {
            return false;
        }
        push(&self.outlet, packet);
        true
    }

    fn finish(&self, from: Step, reply: Packet) -> bool {
        if !self.retry.advance(from, Step::Done, None) {
            return false;
        }
        *self.reply.lock() = Some(reply);
        self.lifecycle().success()
    }

    async fn response(&self) -> Result<Packet> {
        self.lifecycle().wait().await?;
        self.reply.lock().take().ok_or(Error::ConnectionClosed)
    }
}

struct Inner {
    config: ClientConfig,
    codec: Arc<dyn Codec>,
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
    outlet: mpsc::UnboundedSender<Packet>,
    store: Arc<TransactionStore>,
    ids: IdAllocator,
    state: Mutex<SessionState>,
    aliases: Mutex<TopicAliases>,
    /// QoS 2 messages delivered but not yet released.
    received: Mutex<HashSet<u16>>,
    messages: mpsc::UnboundedSender<Message>,
    closed: Mutex<Option<Error>>,
}

impl Inner {
    fn state(&self) -> SessionState {
        *self.state.lock()
    }

    fn set_state(&self, next: SessionState) {
        let prev = std::mem::replace(&mut *self.state.lock(), next);
        if prev != next {
            debug!("Client {}: {} -> {}", self.config.client_id, prev, next);
        }
    }

    fn send(&self, packet: Packet) {
        push(&self.outlet, packet);
    }

    /// Stop the client, remembering the first reason.
    fn close(&self, err: Option<Error>) {
        if let Some(err) = err {
            let mut closed = self.closed.lock();
            if closed.is_none() && !self.cancel.is_cancelled() {
                warn!("Client {} closed: {}", self.config.client_id, err);
                *closed = Some(err);
            }
        }
        self.set_state(SessionState::Disconnected);
        self.cancel.cancel();
    }

    fn new_request<K: 'static>(&self, key: Key, follow_up: Option<Packet>) -> Arc<Request<K>> {
        let outlet = self.outlet.clone();
        let resend: Resender<Packet> = Arc::new(move |packet: Packet| {
            let connect = matches!(packet, Packet::Connect(_));
            push(&outlet, packet);
            if connect {
                if let Some(follow_up) = &follow_up {
                    push(&outlet, follow_up.clone());
                }
            }
        });
        let retry = RetryTransaction::new(
            Step::Waiting,
            self.config.retry_delay,
            self.config.retry_count,
            resend,
            &self.cancel,
            Some(self.store.remover(key)),
        );
        Arc::new(Request {
            retry,
            outlet: self.outlet.clone(),
            reply: Mutex::new(None),
            _slot: PhantomData,
        })
    }

    /// Request identified by a fresh message id.
    fn exchange(&self) -> Result<(u16, Arc<Request<Exchange>>)> {
        let msg_id = self
            .ids
            .next_free(&self.store)
            .ok_or(Error::Exhausted("message ids"))?;
        let request = self.new_request(Key::MsgId(msg_id), None);
        self.store.store(msg_id, Arc::clone(&request));
        Ok((msg_id, request))
    }

    /// Request in a singleton slot, superseding any previous one.
    fn singleton<K: 'static>(&self, follow_up: Option<Packet>) -> Arc<Request<K>> {
        let request = self.new_request::<K>(Key::slot::<Request<K>>(), follow_up);
        self.store.store_singleton(Arc::clone(&request));
        request
    }

    async fn ping(&self) -> Result<()> {
        let request = self.singleton::<Pinging>(None);
        request.begin(Packet::PingReq(PingReq::default()));
        request.response().await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Background tasks
    // ------------------------------------------------------------------

    async fn read_loop(self: Arc<Self>) {
        while !self.cancel.is_cancelled() {
            let datagram = match self.transport.recv(self.config.poll_interval).await {
                Ok(Some(datagram)) => datagram,
                Ok(None) => continue,
                Err(e) => return self.close(Some(e)),
            };
            match self.codec.decode(&datagram) {
                Ok(packet) => {
                    trace!("{} <- {}", self.config.client_id, packet.kind());
                    self.handle(packet);
                }
                Err(e) => return self.close(Some(e)),
            }
        }
    }

    async fn write_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Packet>) {
        loop {
            let packet = tokio::select! {
                biased;
                packet = rx.recv() => match packet {
                    Some(packet) => packet,
                    None => return,
                },
                _ = self.cancel.cancelled() => return,
            };
            let result = match self.codec.encode(&packet) {
                Ok(datagram) => {
                    trace!("{} -> {}", self.config.client_id, packet.kind());
                    self.transport.send(datagram, self.config.write_timeout).await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                return self.close(Some(e));
            }
        }
    }

    async fn keepalive_task(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if self.state() != SessionState::Active
                || self.store.get_singleton::<Request<Pinging>>().is_some()
            {
                continue;
            }
            match self.ping().await {
                Ok(()) => trace!("Keepalive ping answered"),
                Err(Error::Transaction(TransactionError::Canceled)) => {}
                Err(e) => {
                    warn!("Keepalive ping failed: {}", e);
                    let err = Error::Timeout("gateway stopped answering".to_string());
                    return self.close(Some(err));
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Inbound packets
    // ------------------------------------------------------------------

    fn handle(&self, packet: Packet) {
        match packet {
            Packet::ConnAck(_) => self.finish_singleton::<Connecting>(packet),
            Packet::WillTopicReq => {
                let reply = Packet::WillTopic(match &self.config.will {
                    Some(will) => WillTopic {
                        qos: will.qos,
                        retain: will.retain,
                        topic: will.topic.clone(),
                    },
                    None => WillTopic {
                        qos: QoS::AtMostOnce,
                        retain: false,
                        topic: String::new(),
                    },
                });
                self.connect_step(reply);
            }
            Packet::WillMsgReq => {
                let message = self
                    .config
                    .will
                    .as_ref()
                    .map(|will| will.message.clone())
                    .unwrap_or_default();
                self.connect_step(Packet::WillMsg(WillMsg { message }));
            }
            Packet::Register(register) => self.on_register(register),
            Packet::RegAck(regack) => self.finish_exchange(regack.msg_id, Step::Waiting, packet),
            Packet::Publish(publish) => self.on_publish(publish),
            Packet::PubAck(puback) => {
                if puback.code == ReturnCode::InvalidTopicId {
                    self.aliases.lock().remove(puback.topic_id);
                }
                self.finish_exchange(puback.msg_id, Step::Waiting, packet)
            }
            Packet::PubRec(msg_id) => match self.store.get::<Request<Exchange>>(msg_id) {
                Some(request) => {
                    if !request.step(Step::Waiting, Step::Releasing, Packet::PubRel(msg_id)) {
                        debug!("Ignoring PUBREC {} in step {:?}", msg_id, request.retry.step());
                    }
                }
                None => debug!("PUBREC {} matches nothing", msg_id),
            },
            Packet::PubRel(msg_id) => {
                self.received.lock().remove(&msg_id);
                self.send(Packet::PubComp(msg_id));
            }
            Packet::PubComp(msg_id) => self.finish_exchange(msg_id, Step::Releasing, packet),
            Packet::SubAck(suback) => self.finish_exchange(suback.msg_id, Step::Waiting, packet),
            Packet::UnsubAck(msg_id) => self.finish_exchange(msg_id, Step::Waiting, packet),
            Packet::PingResp => self.finish_singleton::<Pinging>(packet),
            Packet::PingReq(_) => self.send(Packet::PingResp),
            Packet::Disconnect(_) => {
                if self.store.get_singleton::<Request<Closing>>().is_some() {
                    self.finish_singleton::<Closing>(packet);
                } else {
                    info!("Gateway ended session {}", self.config.client_id);
                    self.close(Some(Error::ConnectionClosed));
                }
            }
            Packet::Advertise(_) | Packet::GwInfo(_) | Packet::SearchGw(_) => {
                trace!("Ignoring {}", packet.kind());
            }
            other => debug!("Unexpected {} from gateway", other.kind()),
        }
    }

    fn finish_exchange(&self, msg_id: u16, from: Step, reply: Packet) {
        let kind = reply.kind();
        match self.store.get::<Request<Exchange>>(msg_id) {
            Some(request) => {
                if !request.finish(from, reply) {
                    debug!("Ignoring {} {} in step {:?}", kind, msg_id, request.retry.step());
                }
            }
            None => debug!("{} {} matches nothing", kind, msg_id),
        }
    }

    fn finish_singleton<K: 'static>(&self, reply: Packet) {
        let kind = reply.kind();
        match self.store.get_singleton::<Request<K>>() {
            Some(request) => {
                request.finish(Step::Waiting, reply);
            }
            None => debug!("Unsolicited {}", kind),
        }
    }

    fn connect_step(&self, packet: Packet) {
        match self.store.get_singleton::<Request<Connecting>>() {
            Some(request) => {
                request.step(Step::Waiting, Step::Waiting, packet);
            }
            None => debug!("Unsolicited {} request", packet.kind()),
        }
    }

    fn on_register(&self, register: Register) {
        debug!("Gateway registered {} as {}", register.topic_name, register.topic_id);
        self.aliases.lock().insert(&register.topic_name, register.topic_id);
        self.send(Packet::RegAck(RegAck {
            topic_id: register.topic_id,
            msg_id: register.msg_id,
            code: ReturnCode::Accepted,
        }));
    }

    fn on_publish(&self, publish: Publish) {
        let name = match publish.topic.kind {
            TopicIdType::Normal => {
                self.aliases.lock().name(publish.topic.id).map(str::to_string)
            }
            TopicIdType::Predefined => {
                self.config.predefined.name(publish.topic.id).map(str::to_string)
            }
            TopicIdType::Short => topics::decode_short(publish.topic.id),
        };
        let Some(topic) = name else {
            debug!("PUBLISH to unknown topic {:?}", publish.topic);
            if publish.qos != QoS::FireAndForget {
                self.send(Packet::PubAck(PubAck {
                    topic_id: publish.topic.id,
                    msg_id: publish.msg_id,
                    code: ReturnCode::InvalidTopicId,
                }));
            }
            return;
        };

        let fresh = match publish.qos {
            QoS::ExactlyOnce => {
                let fresh = self.received.lock().insert(publish.msg_id);
                self.send(Packet::PubRec(publish.msg_id));
                fresh
            }
            QoS::AtLeastOnce => {
                self.send(Packet::PubAck(PubAck {
                    topic_id: publish.topic.id,
                    msg_id: publish.msg_id,
                    code: ReturnCode::Accepted,
                }));
                true
            }
            QoS::AtMostOnce | QoS::FireAndForget => true,
        };
        if !fresh {
            trace!("Duplicate QoS 2 PUBLISH {}", publish.msg_id);
            return;
        }
        let message = Message {
            topic,
            payload: publish.data,
            qos: publish.qos,
            retain: publish.retain,
        };
        if self.messages.send(message).is_err() {
            trace!("Message receiver gone");
        }
    }
}

/// MQTT-SN client bound to one gateway.
pub struct Client {
    inner: Arc<Inner>,
    messages: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
}

impl Client {
    /// Connect to the gateway behind `transport`.
    pub async fn connect(
        transport: impl Transport + 'static,
        config: ClientConfig,
    ) -> Result<Self> {
        Self::connect_with_codec(transport, config, Arc::new(MqttSnCodec)).await
    }

    pub async fn connect_with_codec(
        transport: impl Transport + 'static,
        config: ClientConfig,
        codec: Arc<dyn Codec>,
    ) -> Result<Self> {
        let (outlet, outbound) = mpsc::unbounded_channel();
        let (messages, inbox) = mpsc::unbounded_channel();
        let keepalive = (config.auto_keepalive && config.keep_alive > 0)
            .then(|| Duration::from_secs(u64::from(config.keep_alive)) / 2);
        let aliases = TopicAliases::default();

        let inner = Arc::new(Inner {
            config,
            codec,
            transport: Arc::new(transport),
            cancel: CancellationToken::new(),
            outlet,
            store: TransactionStore::new(),
            ids: IdAllocator::default(),
            state: Mutex::new(SessionState::Disconnected),
            aliases: Mutex::new(aliases),
            received: Mutex::new(HashSet::new()),
            messages,
            closed: Mutex::new(None),
        });
        tokio::spawn(Arc::clone(&inner).read_loop());
        tokio::spawn(Arc::clone(&inner).write_loop(outbound));

        let client = Self {
            inner,
            messages: tokio::sync::Mutex::new(inbox),
        };
        client.handshake().await?;

        if let Some(interval) = keepalive {
            tokio::spawn(Arc::clone(&client.inner).keepalive_task(interval));
        }
        Ok(client)
    }

    async fn handshake(&self) -> Result<()> {
        let config = &self.inner.config;
        let auth = match (&config.username, &config.password) {
            (Some(username), password) => Some(Packet::Auth(Auth::plain(
                username,
                password.as_deref().unwrap_or_default(),
            ))),
            (None, _) => None,
        };
        let connect = Packet::Connect(Connect {
            will: config.will.is_some(),
            clean_session: config.clean_session,
            protocol_id: PROTOCOL_ID,
            duration: config.keep_alive,
            client_id: config.client_id.clone(),
        });

        debug!("Connecting as {}", config.client_id);
        let request = self.inner.singleton::<Connecting>(auth.clone());
        request.begin(connect);
        if let Some(auth) = auth {
            self.inner.send(auth);
        }

        let reply = match request.response().await {
            Ok(reply) => reply,
            Err(e) => {
                self.inner.close(None);
                return Err(e);
            }
        };
        match reply {
            Packet::ConnAck(ack) if ack.code.is_accepted() => {
                self.inner.set_state(SessionState::Active);
                info!("Connected as {}", config.client_id);
                Ok(())
            }
            Packet::ConnAck(ack) => {
                self.inner.close(None);
                Err(Error::ConnectionRefused(ack.code))
            }
            other => Err(Error::UnexpectedPacket {
                expected: "CONNACK".to_string(),
                got: other.kind().to_string(),
            }),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.inner.config.client_id
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// Whether the client is still connected or sleeping.
    pub fn is_running(&self) -> bool {
        !self.inner.cancel.is_cancelled()
    }

    fn ensure_active(&self) -> Result<()> {
        match self.inner.state() {
            SessionState::Active => Ok(()),
            state => Err(Error::Protocol(format!("client is {}", state))),
        }
    }

    /// Register `topic` with the gateway and return its id.
    pub async fn register(&self, topic: &str) -> Result<u16> {
        self.ensure_active()?;
        if topics::has_wildcard(topic) || topic.is_empty() {
            return Err(Error::InvalidTopic(topic.to_string()));
        }
        if let Some(id) = self.inner.aliases.lock().id(topic) {
            return Ok(id);
        }

        let (msg_id, request) = self.inner.exchange()?;
        request.begin(Packet::Register(Register {
            topic_id: 0,
            msg_id,
            topic_name: topic.to_string(),
        }));
        match request.response().await? {
            Packet::RegAck(ack) if ack.code.is_accepted() => {
                debug!("Registered {} as {}", topic, ack.topic_id);
                self.inner.aliases.lock().insert(topic, ack.topic_id);
                Ok(ack.topic_id)
            }
            Packet::RegAck(ack) => Err(TransactionError::Rejected(ack.code).into()),
            other => Err(unexpected("REGACK", &other)),
        }
    }

    /// Topic reference for `topic` without a round trip, if one exists.
    fn known_topic(&self, topic: &str) -> Option<TopicRef> {
        if let Some(id) = topics::encode_short(topic) {
            return Some(TopicRef::short(id));
        }
        if let Some(id) = self.inner.config.predefined.id(topic) {
            return Some(TopicRef::predefined(id));
        }
        self.inner.aliases.lock().id(topic).map(TopicRef::normal)
    }

    /// Publish to a topic name, registering it first if needed.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<()> {
        let topic_ref = match self.known_topic(topic) {
            Some(topic_ref) => topic_ref,
            None if qos == QoS::FireAndForget => {
                return Err(Error::InvalidTopic(format!(
                    "{} needs a short or predefined id for QoS -1",
                    topic
                )));
            }
            None => TopicRef::normal(self.register(topic).await?),
        };
        self.publish_to(topic_ref, payload, qos, retain).await
    }

    /// Publish to an already known topic id.
    pub async fn publish_to(
        &self,
        topic: TopicRef,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<()> {
        if qos != QoS::FireAndForget {
            self.ensure_active()?;
        }
        let mut publish = Publish {
            dup: false,
            qos,
            retain,
            topic,
            msg_id: 0,
            data: payload.into(),
        };
        if !qos.is_acknowledged() {
            self.inner.send(Packet::Publish(publish));
            return Ok(());
        }

        let (msg_id, request) = self.inner.exchange()?;
        publish.msg_id = msg_id;
        request.begin(Packet::Publish(publish));
        match request.response().await? {
            Packet::PubAck(ack) if ack.code.is_accepted() => Ok(()),
            Packet::PubAck(ack) => Err(TransactionError::Rejected(ack.code).into()),
            Packet::PubComp(_) => Ok(()),
            other => Err(unexpected("PUBACK or PUBCOMP", &other)),
        }
    }

    fn filter(&self, topic: &str) -> TopicFilter {
        if let Some(id) = topics::encode_short(topic) {
            return TopicFilter::Short(id);
        }
        match self.inner.config.predefined.id(topic) {
            Some(id) => TopicFilter::Predefined(id),
            None => TopicFilter::Name(topic.to_string()),
        }
    }

    /// Subscribe and return the granted QoS.
    pub async fn subscribe(&self, topic: &str, qos: QoS) -> Result<QoS> {
        self.ensure_active()?;
        let filter = self.filter(topic);
        let (msg_id, request) = self.inner.exchange()?;
        request.begin(Packet::Subscribe(Subscribe {
            dup: false,
            qos,
            msg_id,
            topic: filter.clone(),
        }));
        match request.response().await? {
            Packet::SubAck(ack) if ack.code.is_accepted() => {
                if let TopicFilter::Name(name) = &filter {
                    if ack.topic_id != 0 && !topics::has_wildcard(name) {
                        self.inner.aliases.lock().insert(name, ack.topic_id);
                    }
                }
                debug!("Subscribed to {} with {:?}", topic, ack.qos);
                Ok(ack.qos)
            }
            Packet::SubAck(ack) => Err(TransactionError::Rejected(ack.code).into()),
            other => Err(unexpected("SUBACK", &other)),
        }
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.ensure_active()?;
        let (msg_id, request) = self.inner.exchange()?;
        request.begin(Packet::Unsubscribe(Unsubscribe {
            msg_id,
            topic: self.filter(topic),
        }));
        match request.response().await? {
            Packet::UnsubAck(_) => Ok(()),
            other => Err(unexpected("UNSUBACK", &other)),
        }
    }

    /// Next message from the gateway.
    pub async fn recv(&self) -> Result<Message> {
        let mut inbox = self.messages.lock().await;
        tokio::select! {
            biased;
            message = inbox.recv() => message.ok_or(Error::ConnectionClosed),
            _ = self.inner.cancel.cancelled() => {
                // Hand out whatever arrived before the close.
                inbox.try_recv().map_err(|_| self.take_close_reason())
            }
        }
    }

    /// Receive a message with timeout.
    pub async fn recv_timeout(&self, timeout: Duration) -> Result<Option<Message>> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    fn take_close_reason(&self) -> Error {
        self.inner.closed.lock().take().unwrap_or(Error::ConnectionClosed)
    }

    pub async fn ping(&self) -> Result<()> {
        self.ensure_active()?;
        self.inner.ping().await
    }

    /// Go to sleep for `duration` seconds. The gateway buffers messages
    /// until [`wake`](Self::wake) or [`resume`](Self::resume).
    pub async fn sleep(&self, duration: u16) -> Result<()> {
        if duration == 0 {
            return Err(Error::InvalidConfig("sleep duration must be positive".to_string()));
        }
        self.ensure_active()?;
        let request = self.inner.singleton::<Closing>(None);
        request.begin(Packet::Disconnect(Disconnect {
            duration: Some(duration),
        }));
        request.response().await?;
        self.inner.set_state(SessionState::Asleep);
        info!("Sleeping for {}s", duration);
        Ok(())
    }

    /// Briefly wake up and collect buffered messages, then sleep again.
    ///
    /// The messages are available from [`recv`](Self::recv).
    pub async fn wake(&self) -> Result<()> {
        if self.inner.state() != SessionState::Asleep {
            return Err(Error::Protocol(format!("client is {}", self.inner.state())));
        }
        self.inner.set_state(SessionState::Awake);
        let request = self.inner.singleton::<Pinging>(None);
        request.begin(Packet::PingReq(PingReq {
            client_id: Some(self.inner.config.client_id.clone()),
        }));
        let result = request.response().await;
        if self.inner.state() == SessionState::Awake {
            self.inner.set_state(SessionState::Asleep);
        }
        result.map(|_| ())
    }

    /// Leave sleep and become active again.
    pub async fn resume(&self) -> Result<()> {
        if !self.inner.state().is_sleeping() {
            return Err(Error::Protocol(format!("client is {}", self.inner.state())));
        }
        self.handshake().await
    }

    /// End the session.
    pub async fn disconnect(&self) -> Result<()> {
        debug!("Disconnecting {}", self.inner.config.client_id);
        let request = self.inner.singleton::<Closing>(None);
        request.begin(Packet::Disconnect(Disconnect::default()));
        let result = request.response().await;
        self.inner.close(None);
        result.map(|_| ())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

fn unexpected(expected: &str, got: &Packet) -> Error {
    Error::UnexpectedPacket {
        expected: expected.to_string(),
        got: got.kind().to_string(),
    }
}
