//! CONNECT handshake: optional AUTH, optional will, broker CONNECT.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::GatewayConfig;
use super::handler::Shared;
use crate::error::{Error, Result, TransactionError};
use crate::mqtt;
use crate::packet::{Auth, ConnAck, Connect, Packet, WillMsg, WillTopic};
use crate::store::Key;
use crate::transaction::{Finalizer, Lifecycle, TimedTransaction, Transaction};
use crate::types::{ReturnCode, SessionState, PROTOCOL_ID};

/// State of the session's MQTT connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum BrokerLink {
    /// No CONNECT sent yet.
    Idle,
    /// CONNECT sent, CONNACK outstanding.
    Connecting,
    Connected,
    /// Opened under a generated client id for session-less publishing. It
    /// can never carry a real client's CONNECT.
    Anonymous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ConnectStep {
    Auth,
    WillTopic,
    WillMessage,
    BrokerAck,
    Done,
}

#[derive(Debug)]
pub(super) enum ConnectEvent {
    Start,
    /// SASL PLAIN credentials, or `None` if the exchange was unusable.
    Auth(Option<(String, Vec<u8>)>),
    WillTopic(WillTopic),
    WillMessage(Bytes),
    BrokerAck(ReturnCode),
}

#[derive(Debug)]
pub(super) enum ConnectAction {
    /// Ask the client for the next piece.
    Send(Packet),
    /// Everything is collected; connect the broker leg.
    Forward,
    Accept,
    Reject(ReturnCode),
    Wait,
    Ignore,
}

struct Progress {
    step: ConnectStep,
    credentials: Option<(String, Vec<u8>)>,
    will_topic: Option<WillTopic>,
    will: Option<mqtt::Will>,
}

/// One CONNECT handshake, bounded by a single deadline.
pub(super) struct ConnectTransaction {
    timer: TimedTransaction,
    client_id: String,
    request: Connect,
    progress: Mutex<Progress>,
}

impl Transaction for ConnectTransaction {
    fn lifecycle(&self) -> &Lifecycle {
        self.timer.lifecycle()
    }
}

impl ConnectTransaction {
    pub(super) fn new(
        client_id: String,
        request: Connect,
        auth_required: bool,
        deadline: Duration,
        cancel: &CancellationToken,
        finalizer: Option<Finalizer>,
    ) -> Arc<Self> {
        let step = if auth_required {
            ConnectStep::Auth
        } else if request.will {
            ConnectStep::WillTopic
        } else {
            ConnectStep::BrokerAck
        };
        Arc::new(Self {
            timer: TimedTransaction::new(deadline, cancel, finalizer),
            client_id,
            request,
            progress: Mutex::new(Progress {
                step,
                credentials: None,
                will_topic: None,
                will: None,
            }),
        })
    }

    pub(super) fn step(&self) -> ConnectStep {
        self.progress.lock().step
    }

    /// Feed one event and get what the session should do next.
    pub(super) fn advance(&self, event: ConnectEvent) -> ConnectAction {
        let mut p = self.progress.lock();
        if self.lifecycle().is_done() {
            return ConnectAction::Ignore;
        }

        match (p.step, event) {
            (ConnectStep::Auth, ConnectEvent::Start) => ConnectAction::Wait,
            (ConnectStep::WillTopic, ConnectEvent::Start) => {
                ConnectAction::Send(Packet::WillTopicReq)
            }
            (ConnectStep::BrokerAck, ConnectEvent::Start) => ConnectAction::Forward,

            (ConnectStep::Auth, ConnectEvent::Auth(Some(credentials))) => {
                p.credentials = Some(credentials);
                if self.request.will {
                    p.step = ConnectStep::WillTopic;
                    ConnectAction::Send(Packet::WillTopicReq)
                } else {
                    p.step = ConnectStep::BrokerAck;
                    ConnectAction::Forward
                }
            }
            (ConnectStep::Auth, ConnectEvent::Auth(None)) => {
                p.step = ConnectStep::Done;
                ConnectAction::Reject(ReturnCode::NotSupported)
            }

            (ConnectStep::WillTopic, ConnectEvent::WillTopic(will)) => {
                if will.topic.is_empty() {
                    p.step = ConnectStep::BrokerAck;
                    return ConnectAction::Forward;
                }
                p.will_topic = Some(will);
                p.step = ConnectStep::WillMessage;
                ConnectAction::Send(Packet::WillMsgReq)
            }

            (ConnectStep::WillMessage, ConnectEvent::WillMessage(message)) => {
                p.will = p.will_topic.take().map(|topic| mqtt::Will {
                    topic: topic.topic,
                    payload: message,
                    qos: topic.qos.into(),
                    retain: topic.retain,
                });
                p.step = ConnectStep::BrokerAck;
                ConnectAction::Forward
            }

            (ConnectStep::BrokerAck, ConnectEvent::BrokerAck(code)) => {
                p.step = ConnectStep::Done;
                if code.is_accepted() {
                    ConnectAction::Accept
                } else {
                    ConnectAction::Reject(code)
                }
            }

            (step, event) => {
                debug!("CONNECT for {}: ignoring {:?} in step {:?}", self.client_id, event, step);
                ConnectAction::Ignore
            }
        }
    }

    /// MQTT CONNECT carrying the collected will and credentials.
    ///
    /// Falls back to the gateway's broker credentials when the client did
    /// not authenticate.
    pub(super) fn broker_connect(&self, config: &GatewayConfig) -> mqtt::Packet {
        let p = self.progress.lock();
        let (username, password) = match &p.credentials {
            Some((user, pass)) => (Some(user.as_str()), Some(pass.as_slice())),
            None => (config.broker_username.as_deref(), config.broker_password.as_deref()),
        };
        mqtt::create_connect(
            &self.client_id,
            username,
            password,
            self.request.duration,
            self.request.clean_session,
            p.will.as_ref(),
        )
    }
}

/// SN return code for a broker CONNACK.
fn map_connack(code: mqtt::ConnectReturnCode) -> ReturnCode {
    match code {
        mqtt::ConnectReturnCode::Success => ReturnCode::Accepted,
        mqtt::ConnectReturnCode::ServiceUnavailable => ReturnCode::Congestion,
        _ => ReturnCode::NotSupported,
    }
}

impl Shared {
    pub(super) fn on_connect(self: &Arc<Self>, connect: Connect) -> Result<()> {
        if connect.protocol_id != PROTOCOL_ID {
            warn!("Rejecting CONNECT from {}: protocol id {}", self.peer, connect.protocol_id);
            self.outlet.client(Packet::ConnAck(ConnAck {
                code: ReturnCode::NotSupported,
            }));
            return Ok(());
        }

        if self.state().is_sleeping() {
            self.resume(connect);
            return Ok(());
        }

        let client_id = self.adopt_client_id(&connect.client_id);
        debug!(
            "CONNECT from {} as {} (will={}, clean={}, keep_alive={}s)",
            self.peer, client_id, connect.will, connect.clean_session, connect.duration
        );

        let txn = ConnectTransaction::new(
            client_id,
            connect,
            self.config.auth_enabled,
            self.config.connect_timeout,
            &self.cancel,
            Some(self.upstream.remover(Key::slot::<ConnectTransaction>())),
        );
        // Supersedes, and cancels, any handshake still in flight.
        self.upstream.store_singleton(Arc::clone(&txn));
        self.watch_connect(&txn);

        let action = txn.advance(ConnectEvent::Start);
        self.apply_connect(&txn, action)
    }

    pub(super) fn on_auth(self: &Arc<Self>, auth: Auth) -> Result<()> {
        let Some(txn) = self.upstream.get_singleton::<ConnectTransaction>() else {
            return Err(Error::Protocol("AUTH without CONNECT".to_string()));
        };
        let credentials = auth.plain_credentials();
        if credentials.is_none() {
            warn!("Unusable AUTH ({}) from {}", auth.method, self.peer);
        }
        let action = txn.advance(ConnectEvent::Auth(credentials));
        self.apply_connect(&txn, action)
    }

    pub(super) fn on_will_topic(self: &Arc<Self>, will: WillTopic) -> Result<()> {
        match self.upstream.get_singleton::<ConnectTransaction>() {
            Some(txn) => {
                let action = txn.advance(ConnectEvent::WillTopic(will));
                self.apply_connect(&txn, action)
            }
            None => {
                debug!("Ignoring WILLTOPIC from {} outside CONNECT", self.peer);
                Ok(())
            }
        }
    }

    pub(super) fn on_will_msg(self: &Arc<Self>, will: WillMsg) -> Result<()> {
        match self.upstream.get_singleton::<ConnectTransaction>() {
            Some(txn) => {
                let action = txn.advance(ConnectEvent::WillMessage(will.message));
                self.apply_connect(&txn, action)
            }
            None => {
                debug!("Ignoring WILLMSG from {} outside CONNECT", self.peer);
                Ok(())
            }
        }
    }

    pub(super) fn on_broker_connack(self: &Arc<Self>, connack: mqtt::ConnAck) -> Result<()> {
        let code = map_connack(connack.code);
        {
            let mut link = self.link.lock();
            *link = match *link {
                _ if !code.is_accepted() => BrokerLink::Idle,
                BrokerLink::Anonymous => BrokerLink::Anonymous,
                _ => BrokerLink::Connected,
            };
        }

        match self.upstream.get_singleton::<ConnectTransaction>() {
            Some(txn) => {
                let action = txn.advance(ConnectEvent::BrokerAck(code));
                self.apply_connect(&txn, action)?;
            }
            None => debug!("Broker CONNACK for {} with no CONNECT pending", self.peer),
        }

        if code.is_accepted() {
            Ok(())
        } else {
            Err(Error::ConnectionRefused(code))
        }
    }

    fn apply_connect(
        self: &Arc<Self>,
        txn: &Arc<ConnectTransaction>,
        action: ConnectAction,
    ) -> Result<()> {
        match action {
            ConnectAction::Send(packet) => self.outlet.client(packet),
            ConnectAction::Forward => self.forward_connect(txn)?,
            ConnectAction::Accept => self.accept_connect(txn),
            ConnectAction::Reject(code) => {
                warn!("CONNECT for {} rejected: {}", txn.client_id, code);
                self.outlet.client(Packet::ConnAck(ConnAck { code }));
                txn.lifecycle().fail(TransactionError::Rejected(code));
            }
            ConnectAction::Wait | ConnectAction::Ignore => {}
        }
        Ok(())
    }

    /// Connect the broker leg, unless it already is or is about to be.
    ///
    /// MQTT allows a single CONNECT per connection, so a repeated handshake
    /// rides on the existing link.
    fn forward_connect(self: &Arc<Self>, txn: &Arc<ConnectTransaction>) -> Result<()> {
        let mut link = self.link.lock();
        match *link {
            BrokerLink::Idle => {
                *link = BrokerLink::Connecting;
                drop(link);
                debug!("Connecting {} to broker {}", txn.client_id, self.config.broker);
                self.outlet.broker(txn.broker_connect(&self.config));
                Ok(())
            }
            BrokerLink::Connecting => {
                debug!("CONNECT for {} waits on the pending broker CONNACK", txn.client_id);
                Ok(())
            }
            BrokerLink::Connected => {
                drop(link);
                let action = txn.advance(ConnectEvent::BrokerAck(ReturnCode::Accepted));
                self.apply_connect(txn, action)
            }
            BrokerLink::Anonymous => {
                drop(link);
                // The client retries on a fresh session and broker link.
                warn!("CONNECT for {} arrived on a session-less broker link", txn.client_id);
                self.outlet.client(Packet::ConnAck(ConnAck {
                    code: ReturnCode::Congestion,
                }));
                txn.lifecycle().fail(TransactionError::Rejected(ReturnCode::Congestion));
                self.outlet.broker(mqtt::create_disconnect());
                Err(Error::Protocol(format!(
                    "CONNECT from {} after session-less publishing",
                    self.peer
                )))
            }
        }
    }

    fn accept_connect(&self, txn: &Arc<ConnectTransaction>) {
        *self.keep_alive.lock() = txn.request.duration;
        self.set_state(SessionState::Active);
        self.outlet.client(Packet::ConnAck(ConnAck {
            code: ReturnCode::Accepted,
        }));
        txn.lifecycle().success();
        info!("Client {} connected from {}", txn.client_id, self.peer);
    }

    /// A sleeping client reconnects: skip the handshake and flush what was
    /// buffered while it slept.
    fn resume(self: &Arc<Self>, connect: Connect) {
        debug!("Client {} resumed from sleep", self.name());
        self.stop_sleeper();
        *self.keep_alive.lock() = connect.duration;
        self.set_state(SessionState::Active);
        self.outlet.client_now(Packet::ConnAck(ConnAck {
            code: ReturnCode::Accepted,
        }));
        self.wake_client_leg();
        self.release_sleep_buffer(false);
    }

    /// Record the client id and load its predefined topics.
    fn adopt_client_id(&self, requested: &str) -> String {
        let client_id = if requested.is_empty() {
            self.anonymous_client_id()
        } else {
            requested.to_string()
        };
        *self.predefined.lock() = self.config.predefined.for_client(Some(&client_id));
        *self.client_id.lock() = Some(client_id.clone());
        client_id
    }

    fn anonymous_client_id(&self) -> String {
        let peer: String = self
            .peer
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        format!("{}-{}", self.config.anonymous_prefix, peer)
    }

    /// Open the broker leg for session-less publishing.
    pub(super) fn ensure_broker_link(&self) {
        let mut link = self.link.lock();
        if *link != BrokerLink::Idle {
            return;
        }
        *link = BrokerLink::Anonymous;
        drop(link);

        let client_id = self.anonymous_client_id();
        debug!("Opening anonymous broker session {} for {}", client_id, self.peer);
        self.outlet.broker(mqtt::create_connect(
            &client_id,
            self.config.broker_username.as_deref(),
            self.config.broker_password.as_deref(),
            0,
            true,
            None,
        ));
    }

    pub(super) fn link_up(&self) -> bool {
        *self.link.lock() != BrokerLink::Idle
    }

    /// End the session if the handshake deadline passes before it connects.
    fn watch_connect(self: &Arc<Self>, txn: &Arc<ConnectTransaction>) {
        let shared = Arc::clone(self);
        let txn = Arc::clone(txn);
        tokio::spawn(async move {
            let client_id = &txn.client_id;
            match txn.lifecycle().wait().await {
                Err(TransactionError::Timeout) if shared.state() == SessionState::Disconnected => {
                    shared.abort(Error::Timeout(format!(
                        "CONNECT handshake for {} stuck at {:?}",
                        client_id,
                        txn.step()
                    )));
                }
                Err(TransactionError::Canceled) => debug!("CONNECT for {} superseded", client_id),
                _ => {}
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QoS;

    fn request(will: bool) -> Connect {
        Connect {
            will,
            clean_session: true,
            protocol_id: PROTOCOL_ID,
            duration: 30,
            client_id: "dev".to_string(),
        }
    }

    fn txn(will: bool, auth: bool) -> Arc<ConnectTransaction> {
        ConnectTransaction::new(
            "dev".to_string(),
            request(will),
            auth,
            Duration::from_secs(30),
            &CancellationToken::new(),
            None,
        )
    }

    #[tokio::test]
    async fn test_plain_connect_forwards_immediately() {
        let t = txn(false, false);
        assert!(matches!(t.advance(ConnectEvent::Start), ConnectAction::Forward));
        assert_eq!(t.step(), ConnectStep::BrokerAck);
        assert!(matches!(
            t.advance(ConnectEvent::BrokerAck(ReturnCode::Accepted)),
            ConnectAction::Accept
        ));
        assert_eq!(t.step(), ConnectStep::Done);
    }

    #[tokio::test]
    async fn test_auth_then_will() {
        let t = txn(true, true);
        assert!(matches!(t.advance(ConnectEvent::Start), ConnectAction::Wait));

        let action = t.advance(ConnectEvent::Auth(Some(("user".into(), b"pw".to_vec()))));
        assert!(matches!(action, ConnectAction::Send(Packet::WillTopicReq)));

        let action = t.advance(ConnectEvent::WillTopic(WillTopic {
            qos: QoS::AtLeastOnce,
            retain: true,
            topic: "dev/status".into(),
        }));
        assert!(matches!(action, ConnectAction::Send(Packet::WillMsgReq)));

        let action = t.advance(ConnectEvent::WillMessage(Bytes::from_static(b"offline")));
        assert!(matches!(action, ConnectAction::Forward));

        let config = GatewayConfig::new("127.0.0.1:0", "127.0.0.1:1883");
        match t.broker_connect(&config) {
            mqtt::Packet::Connect(c) => {
                assert_eq!(c.client_id, "dev");
                assert_eq!(c.login.unwrap().username, "user");
                let will = c.last_will.unwrap();
                assert_eq!(will.topic, "dev/status");
                assert_eq!(will.qos, mqtt::QoS::AtLeastOnce);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_out_of_order_events_are_ignored() {
        let t = txn(true, false);
        assert!(matches!(
            t.advance(ConnectEvent::Start),
            ConnectAction::Send(Packet::WillTopicReq)
        ));
        assert!(matches!(
            t.advance(ConnectEvent::WillMessage(Bytes::new())),
            ConnectAction::Ignore
        ));
        assert!(matches!(
            t.advance(ConnectEvent::BrokerAck(ReturnCode::Accepted)),
            ConnectAction::Ignore
        ));
        assert_eq!(t.step(), ConnectStep::WillTopic);
    }

    #[tokio::test]
    async fn test_empty_will_topic_skips_message() {
        let t = txn(true, false);
        t.advance(ConnectEvent::Start);
        let action = t.advance(ConnectEvent::WillTopic(WillTopic {
            qos: QoS::AtMostOnce,
            retain: false,
            topic: String::new(),
        }));
        assert!(matches!(action, ConnectAction::Forward));
    }

    #[tokio::test]
    async fn test_unusable_auth_rejects() {
        let t = txn(false, true);
        t.advance(ConnectEvent::Start);
        assert!(matches!(
            t.advance(ConnectEvent::Auth(None)),
            ConnectAction::Reject(ReturnCode::NotSupported)
        ));
    }

    #[tokio::test]
    async fn test_fallback_broker_credentials() {
        let t = txn(false, false);
        let config = GatewayConfig::new("127.0.0.1:0", "127.0.0.1:1883")
            .with_broker_credentials("gateway", "secret");
        match t.broker_connect(&config) {
            mqtt::Packet::Connect(c) => {
                let login = c.login.unwrap();
                assert_eq!(login.username, "gateway");
                assert_eq!(login.password, "secret");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_connack_mapping() {
        assert_eq!(map_connack(mqtt::ConnectReturnCode::Success), ReturnCode::Accepted);
        assert_eq!(
            map_connack(mqtt::ConnectReturnCode::ServiceUnavailable),
            ReturnCode::Congestion
        );
        assert_eq!(
            map_connack(mqtt::ConnectReturnCode::NotAuthorized),
            ReturnCode::NotSupported
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline() {
        let t = txn(false, true);
        t.advance(ConnectEvent::Start);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(t.lifecycle().err(), Some(TransactionError::Timeout));
        assert!(matches!(t.advance(ConnectEvent::Auth(None)), ConnectAction::Ignore));
    }
}
