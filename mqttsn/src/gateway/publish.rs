//! QoS bridging between the two legs.
//!
//! A [`PublishTransaction`] carries one PUBLISH across the gateway in either
//! direction and drives the acknowledgements on both sides:
//!
//! ```text
//! QoS 0:  [REGISTER/REGACK] PUBLISH
//! QoS 1:  [REGISTER/REGACK] PUBLISH -> PUBACK
//! QoS 2:  [REGISTER/REGACK] PUBLISH -> PUBREC, PUBREL -> PUBCOMP
//! ```
//!
//! The same message id is used on both legs. Every waiting step is retried
//! on the configured delay until the retry budget runs out.

use bytes::Bytes;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::config::GatewayConfig;
use super::handler::Shared;
use super::outlet::{Outbound, Outlet};
use crate::codec::MAX_PUBLISH_DATA;
use crate::error::{Error, Result, TransactionError};
use crate::mqtt;
use crate::packet::{Packet, PubAck, Publish, RegAck, Register, TopicRef};
use crate::store::{Key, TransactionStore};
use crate::topics::{self, Resolved};
use crate::transaction::{Finalizer, Lifecycle, RetryTransaction, Transaction};
use crate::types::{QoS, ReturnCode, SessionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Direction {
    /// Broker to client.
    Downstream,
    /// Client to broker.
    Upstream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum PublishStep {
    Register,
    AwaitAck,
    AwaitReceived,
    AwaitRelease,
    AwaitComplete,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum PublishEvent {
    RegAck(ReturnCode),
    Ack(ReturnCode),
    Received,
    Release,
    Complete,
}

enum Reply {
    Ack(ReturnCode),
    Received,
    Complete,
}

pub(super) struct PublishParams {
    pub msg_id: u16,
    pub qos: QoS,
    pub topic: TopicRef,
    pub topic_name: String,
    pub data: Bytes,
    pub retain: bool,
}

pub(super) struct PublishTransaction {
    retry: Arc<RetryTransaction<PublishStep, Outbound>>,
    direction: Direction,
    params: PublishParams,
    outlet: Outlet,
    delivered: CancellationToken,
}

impl Transaction for PublishTransaction {
    fn lifecycle(&self) -> &Lifecycle {
        self.retry.lifecycle()
    }
}

impl PublishTransaction {
    pub(super) fn new(
        direction: Direction,
        params: PublishParams,
        outlet: &Outlet,
        config: &GatewayConfig,
        cancel: &CancellationToken,
        finalizer: Option<Finalizer>,
    ) -> Arc<Self> {
        let resend = outlet.clone();
        let retry = RetryTransaction::new(
            PublishStep::Register,
            config.retry_delay,
            config.retry_count,
            Arc::new(move |packet| resend.send(packet)),
            cancel,
            finalizer,
        );
        Arc::new(Self {
            retry,
            direction,
            params,
            outlet: outlet.clone(),
            delivered: CancellationToken::new(),
        })
    }

    pub(super) fn msg_id(&self) -> u16 {
        self.params.msg_id
    }

    pub(super) fn topic(&self) -> TopicRef {
        self.params.topic
    }

    pub(super) fn step(&self) -> PublishStep {
        self.retry.step()
    }

    /// Register the topic with the client before publishing.
    pub(super) fn start_with_registration(&self) {
        let register = Packet::Register(Register {
            topic_id: self.params.topic.id,
            msg_id: self.params.msg_id,
            topic_name: self.params.topic_name.clone(),
        });
        self.retry
            .proceed(PublishStep::Register, Some(Outbound::Client(register.clone())));
        self.outlet.client(register);
    }

    /// Publish straight away.
    pub(super) fn start(&self) {
        self.deliver(None);
    }

    /// Hold back client-bound retransmissions while the client sleeps.
    pub(super) fn pause(&self) {
        self.retry.pause();
    }

    pub(super) fn resume(&self) {
        self.retry.resume();
    }

    /// Completes once the PUBLISH went out or the transaction resolved.
    pub(super) async fn delivered(&self) {
        tokio::select! {
            _ = self.delivered.cancelled() => {}
            _ = self.lifecycle().done() => {}
        }
    }

    /// Apply an acknowledgement. Returns false when it does not fit the
    /// current step and was ignored.
    pub(super) fn on_event(&self, event: PublishEvent) -> bool {
        use PublishStep::*;
        match event {
            PublishEvent::RegAck(code) if code.is_accepted() => self.deliver(Some(Register)),
            PublishEvent::RegAck(code) => {
                self.finish(Register, Err(TransactionError::Rejected(code)), None)
            }
            PublishEvent::Ack(code) => {
                let reply = self.to_origin(Reply::Ack(code));
                let outcome = if code.is_accepted() {
                    Ok(())
                } else {
                    Err(TransactionError::Rejected(code))
                };
                self.finish(AwaitAck, outcome, Some(reply))
            }
            PublishEvent::Received => {
                self.step_to(AwaitReceived, AwaitRelease, self.to_origin(Reply::Received))
            }
            PublishEvent::Release => {
                self.step_to(AwaitRelease, AwaitComplete, self.release_to_target())
            }
            PublishEvent::Complete => {
                self.finish(AwaitComplete, Ok(()), Some(self.to_origin(Reply::Complete)))
            }
        }
    }

    /// The origin retransmitted its PUBLISH.
    ///
    /// Once the PUBREC went out, the origin is waiting for it, so send it
    /// again. Earlier steps are covered by the transaction's own retries.
    pub(super) fn on_duplicate(&self) {
        if self.retry.step() == PublishStep::AwaitRelease {
            self.outlet.send(self.to_origin(Reply::Received));
        }
    }

    fn deliver(&self, from: Option<PublishStep>) -> bool {
        let publish = self.to_target();
        let next = match self.params.qos {
            QoS::AtLeastOnce => PublishStep::AwaitAck,
            QoS::ExactlyOnce => PublishStep::AwaitReceived,
            QoS::AtMostOnce | QoS::FireAndForget => PublishStep::Done,
        };
        let payload = (next != PublishStep::Done).then(|| publish.clone());
        match from {
            Some(step) => {
                if !self.retry.advance(step, next, payload) {
                    return false;
                }
            }
            None => self.retry.proceed(next, payload),
        }

        self.outlet.send(publish);
        self.delivered.cancel();
        if next == PublishStep::Done {
            self.lifecycle().success();
        }
        true
    }

    fn step_to(&self, from: PublishStep, to: PublishStep, packet: Outbound) -> bool {
        if !self.retry.advance(from, to, Some(packet.clone())) {
            return false;
        }
        self.outlet.send(packet);
        true
    }

    fn finish(
        &self,
        from: PublishStep,
        outcome: std::result::Result<(), TransactionError>,
        reply: Option<Outbound>,
    ) -> bool {
        if !self.retry.advance(from, PublishStep::Done, None) {
            return false;
        }
        if let Some(reply) = reply {
            self.outlet.send(reply);
        }
        match outcome {
            Ok(()) => self.lifecycle().success(),
            Err(e) => self.lifecycle().fail(e),
        };
        true
    }

    fn to_target(&self) -> Outbound {
        let p = &self.params;
        let msg_id = if p.qos.is_acknowledged() { p.msg_id } else { 0 };
        match self.direction {
            Direction::Downstream => Outbound::Client(Packet::Publish(Publish {
                dup: false,
                qos: p.qos,
                retain: p.retain,
                topic: p.topic,
                msg_id,
                data: p.data.clone(),
            })),
            Direction::Upstream => Outbound::Broker(mqtt::create_publish(
                &p.topic_name,
                p.data.clone(),
                p.qos.into(),
                p.retain,
                msg_id,
            )),
        }
    }

    fn to_origin(&self, reply: Reply) -> Outbound {
        let msg_id = self.params.msg_id;
        match self.direction {
            Direction::Upstream => Outbound::Client(match reply {
                Reply::Ack(code) => Packet::PubAck(PubAck {
                    topic_id: self.params.topic.id,
                    msg_id,
                    code,
                }),
                Reply::Received => Packet::PubRec(msg_id),
                Reply::Complete => Packet::PubComp(msg_id),
            }),
            Direction::Downstream => Outbound::Broker(match reply {
                Reply::Ack(_) => mqtt::create_puback(msg_id),
                Reply::Received => mqtt::create_pubrec(msg_id),
                Reply::Complete => mqtt::create_pubcomp(msg_id),
            }),
        }
    }

    fn release_to_target(&self) -> Outbound {
        match self.direction {
            Direction::Upstream => Outbound::Broker(mqtt::create_pubrel(self.params.msg_id)),
            Direction::Downstream => Outbound::Client(Packet::PubRel(self.params.msg_id)),
        }
    }
}

/// Removes the transaction from `store` and logs how it ended.
fn publish_finalizer(
    store: &Arc<TransactionStore>,
    direction: Direction,
    msg_id: u16,
) -> Finalizer {
    let remove = store.remover(Key::MsgId(msg_id));
    Box::new(move |lifecycle: &Lifecycle| {
        match lifecycle.err() {
            None => trace!("{:?} publish {} complete", direction, msg_id),
            Some(TransactionError::Canceled) => {
                debug!("{:?} publish {} canceled", direction, msg_id)
            }
            Some(e) => warn!("{:?} publish {} failed: {}", direction, msg_id, e),
        }
        remove(lifecycle);
    })
}

impl Shared {
    pub(super) fn on_client_publish(self: &Arc<Self>, publish: Publish) -> Result<()> {
        let Some(topic_name) = self.topic_name(publish.topic) else {
            if publish.qos == QoS::FireAndForget {
                debug!("Dropping session-less PUBLISH to unknown topic {:?}", publish.topic);
            } else {
                debug!("PUBLISH from {} to unknown topic {:?}", self.name(), publish.topic);
                self.outlet.client(Packet::PubAck(PubAck {
                    topic_id: publish.topic.id,
                    msg_id: publish.msg_id,
                    code: ReturnCode::InvalidTopicId,
                }));
            }
            return Ok(());
        };

        if !publish.qos.is_acknowledged() {
            if self.state() == SessionState::Disconnected {
                self.ensure_broker_link();
            }
            self.outlet.broker(mqtt::create_publish(
                &topic_name,
                publish.data,
                mqtt::QoS::AtMostOnce,
                publish.retain,
                0,
            ));
            return Ok(());
        }

        let msg_id = publish.msg_id;
        if msg_id == 0 {
            return Err(Error::Protocol(format!("{:?} PUBLISH without message id", publish.qos)));
        }
        if let Some(existing) = self.upstream.get::<PublishTransaction>(msg_id) {
            trace!("Duplicate PUBLISH {} from {}", msg_id, self.name());
            existing.on_duplicate();
            return Ok(());
        }

        let txn = PublishTransaction::new(
            Direction::Upstream,
            PublishParams {
                msg_id,
                qos: publish.qos,
                topic: publish.topic,
                topic_name,
                data: publish.data,
                retain: publish.retain,
            },
            &self.outlet,
            &self.config,
            &self.cancel,
            Some(publish_finalizer(&self.upstream, Direction::Upstream, msg_id)),
        );
        self.upstream.store(msg_id, Arc::clone(&txn));
        txn.start();
        Ok(())
    }

    pub(super) fn on_broker_publish(self: &Arc<Self>, publish: mqtt::Publish) -> Result<()> {
        if self.state() == SessionState::Disconnected {
            debug!("Dropping broker PUBLISH to {} for unconnected {}", publish.topic, self.peer);
            return Ok(());
        }
        let offered = self.sleep.lock().offer(publish);
        match offered {
            Some(publish) => {
                self.deliver_downstream(publish);
            }
            None => debug!("Buffered PUBLISH for sleeping {}", self.name()),
        }
        Ok(())
    }

    /// Start delivering a broker PUBLISH to the client.
    ///
    /// Returns the transaction when one was needed, so callers can wait for
    /// the PUBLISH to go out.
    pub(super) fn deliver_downstream(
        self: &Arc<Self>,
        publish: mqtt::Publish,
    ) -> Option<Arc<PublishTransaction>> {
        let qos = QoS::from(publish.qos);
        let topic_name = publish.topic.clone();

        if publish.payload.len() > MAX_PUBLISH_DATA {
            warn!(
                "Dropping {}-byte PUBLISH to {} for {}: exceeds a datagram",
                publish.payload.len(),
                topic_name,
                self.name()
            );
            // Settle with the broker so it stops redelivering.
            match publish.qos {
                mqtt::QoS::AtLeastOnce => self.outlet.broker(mqtt::create_puback(publish.pkid)),
                mqtt::QoS::ExactlyOnce => self.outlet.broker(mqtt::create_pubrec(publish.pkid)),
                mqtt::QoS::AtMostOnce => {}
            }
            return None;
        }

        if qos.is_acknowledged() {
            if let Some(existing) = self.downstream.get::<PublishTransaction>(publish.pkid) {
                trace!("Duplicate broker PUBLISH {} for {}", publish.pkid, self.name());
                existing.on_duplicate();
                return None;
            }
        }

        let resolved = {
            let aliases = self.aliases.lock();
            let predefined = self.predefined.lock();
            topics::resolve(&topic_name, &aliases, &predefined)
        };
        let (topic, register) = match resolved {
            Resolved::Short(id) => (TopicRef::short(id), false),
            Resolved::Registered(id) => (TopicRef::normal(id), false),
            Resolved::Predefined(id) => (TopicRef::predefined(id), false),
            Resolved::Unregistered => match self.aliases.lock().register(&topic_name) {
                Ok((id, _)) => (TopicRef::normal(id), true),
                Err(e) => {
                    warn!("Dropping PUBLISH to {} for {}: {}", topic_name, self.name(), e);
                    return None;
                }
            },
        };

        if !register && !qos.is_acknowledged() {
            self.outlet.client(Packet::Publish(Publish {
                dup: false,
                qos,
                retain: publish.retain,
                topic,
                msg_id: 0,
                data: publish.payload,
            }));
            return None;
        }

        let msg_id = if qos.is_acknowledged() {
            publish.pkid
        } else {
            // Best effort: the id is only free at the time of the scan.
            match self.downstream.unused_id() {
                Some(id) => id,
                None => {
                    warn!(
                        "Dropping PUBLISH to {} for {}: no free message id",
                        topic_name,
                        self.name()
                    );
                    return None;
                }
            }
        };

        let txn = PublishTransaction::new(
            Direction::Downstream,
            PublishParams {
                msg_id,
                qos,
                topic,
                topic_name,
                data: publish.payload,
                retain: publish.retain,
            },
            &self.outlet,
            &self.config,
            &self.cancel,
            Some(publish_finalizer(&self.downstream, Direction::Downstream, msg_id)),
        );
        self.downstream.store(msg_id, Arc::clone(&txn));
        if register {
            txn.start_with_registration();
        } else {
            txn.start();
        }
        Some(txn)
    }

    pub(super) fn on_client_regack(&self, regack: RegAck) -> Result<()> {
        let Some(txn) = self.downstream.get::<PublishTransaction>(regack.msg_id) else {
            debug!("REGACK {} from {} matches nothing", regack.msg_id, self.name());
            return Ok(());
        };
        if txn.step() == PublishStep::Register {
            let mut aliases = self.aliases.lock();
            if regack.code.is_accepted() {
                aliases.confirm(txn.topic().id);
            } else {
                aliases.remove(txn.topic().id);
            }
        }
        self.publish_event(&txn, PublishEvent::RegAck(regack.code));
        Ok(())
    }

    pub(super) fn on_client_puback(&self, puback: PubAck) -> Result<()> {
        if puback.code == ReturnCode::InvalidTopicId {
            // The client lost track of the id; register it again next time.
            self.aliases.lock().remove(puback.topic_id);
        }
        self.route(&self.downstream, puback.msg_id, PublishEvent::Ack(puback.code));
        Ok(())
    }

    pub(super) fn on_client_pubrec(&self, msg_id: u16) -> Result<()> {
        self.route(&self.downstream, msg_id, PublishEvent::Received);
        Ok(())
    }

    pub(super) fn on_client_pubrel(&self, msg_id: u16) -> Result<()> {
        if !self.route(&self.upstream, msg_id, PublishEvent::Release) {
            // Already completed: the client missed our PUBCOMP.
            if self.upstream.get::<PublishTransaction>(msg_id).is_none() {
                self.outlet.client(Packet::PubComp(msg_id));
            }
        }
        Ok(())
    }

    pub(super) fn on_client_pubcomp(&self, msg_id: u16) -> Result<()> {
        self.route(&self.downstream, msg_id, PublishEvent::Complete);
        Ok(())
    }

    pub(super) fn on_broker_puback(&self, pkid: u16) -> Result<()> {
        self.route(&self.upstream, pkid, PublishEvent::Ack(ReturnCode::Accepted));
        Ok(())
    }

    pub(super) fn on_broker_pubrec(&self, pkid: u16) -> Result<()> {
        self.route(&self.upstream, pkid, PublishEvent::Received);
        Ok(())
    }

    pub(super) fn on_broker_pubrel(&self, pkid: u16) -> Result<()> {
        if !self.route(&self.downstream, pkid, PublishEvent::Release) {
            if self.downstream.get::<PublishTransaction>(pkid).is_none() {
                self.outlet.broker(mqtt::create_pubcomp(pkid));
            }
        }
        Ok(())
    }

    pub(super) fn on_broker_pubcomp(&self, pkid: u16) -> Result<()> {
        self.route(&self.upstream, pkid, PublishEvent::Complete);
        Ok(())
    }

    /// Hand `event` to the publish transaction holding `msg_id`.
    fn route(&self, store: &TransactionStore, msg_id: u16, event: PublishEvent) -> bool {
        match store.get::<PublishTransaction>(msg_id) {
            Some(txn) => self.publish_event(&txn, event),
            None => {
                debug!("{:?} for unknown message {} on {}", event, msg_id, self.name());
                false
            }
        }
    }

    fn publish_event(&self, txn: &PublishTransaction, event: PublishEvent) -> bool {
        let handled = txn.on_event(event);
        if !handled {
            debug!(
                "Ignoring {:?} for message {} in step {:?}",
                event,
                txn.msg_id(),
                txn.step()
            );
        }
        handled
    }
}
