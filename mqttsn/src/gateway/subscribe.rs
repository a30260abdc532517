//! SUBSCRIBE and UNSUBSCRIBE relaying.
//!
//! The client's message id doubles as the MQTT packet id. A request that the
//! broker never answers within the retry window is rejected toward the
//! client.

use std::sync::Arc;
use tracing::{debug, warn};

use super::handler::Shared;
use super::outlet::Outlet;
use crate::error::{Result, TransactionError};
use crate::mqtt;
use crate::packet::{Packet, SubAck, Subscribe, TopicFilter, Unsubscribe};
use crate::store::Key;
use crate::topics;
use crate::transaction::{Finalizer, Lifecycle, TimedTransaction, Transaction};
use crate::types::{QoS, ReturnCode};

pub(super) struct SubscribeTransaction {
    timer: TimedTransaction,
    msg_id: u16,
    topic_id: u16,
    qos: QoS,
    outlet: Outlet,
}

impl Transaction for SubscribeTransaction {
    fn lifecycle(&self) -> &Lifecycle {
        self.timer.lifecycle()
    }
}

impl SubscribeTransaction {
    /// Answer the client from the broker's SUBACK, unless the deadline
    /// already answered it.
    fn complete(&self, code: mqtt::SubscribeReasonCode) {
        let (qos, code) = match code {
            mqtt::SubscribeReasonCode::Success(granted) => {
                (QoS::from(granted), ReturnCode::Accepted)
            }
            mqtt::SubscribeReasonCode::Failure => (self.qos, ReturnCode::NotSupported),
        };
        let resolved = if code.is_accepted() {
            self.lifecycle().success()
        } else {
            self.lifecycle().fail(TransactionError::Rejected(code))
        };
        if resolved {
            self.outlet.client(Packet::SubAck(SubAck {
                qos,
                topic_id: self.topic_id,
                msg_id: self.msg_id,
                code,
            }));
        }
    }
}

pub(super) struct UnsubscribeTransaction {
    timer: TimedTransaction,
}

impl Transaction for UnsubscribeTransaction {
    fn lifecycle(&self) -> &Lifecycle {
        self.timer.lifecycle()
    }
}

impl Shared {
    pub(super) fn on_subscribe(self: &Arc<Self>, subscribe: Subscribe) -> Result<()> {
        let msg_id = subscribe.msg_id;
        if self.upstream.contains(msg_id) {
            debug!("SUBSCRIBE {} from {} already in flight", msg_id, self.name());
            return Ok(());
        }

        // An alias created here is dropped again if the subscription fails.
        let mut created = false;
        let (filter, topic_id) = match &subscribe.topic {
            TopicFilter::Name(name) if topics::has_wildcard(name) => (Some(name.clone()), 0),
            TopicFilter::Name(name) => {
                let mut aliases = self.aliases.lock();
                created = !aliases.contains(name);
                match aliases.register_confirmed(name) {
                    Ok(id) => (Some(name.clone()), id),
                    Err(e) => {
                        drop(aliases);
                        warn!("Cannot register {} for {}: {}", name, self.name(), e);
                        self.reject_subscribe(&subscribe, 0, ReturnCode::Congestion);
                        return Ok(());
                    }
                }
            }
            TopicFilter::Predefined(id) => {
                (self.predefined.lock().name(*id).map(str::to_string), *id)
            }
            TopicFilter::Short(id) => (topics::decode_short(*id), *id),
        };
        let Some(filter) = filter else {
            debug!("SUBSCRIBE from {} to unknown topic {:?}", self.name(), subscribe.topic);
            self.reject_subscribe(&subscribe, topic_id, ReturnCode::InvalidTopicId);
            return Ok(());
        };

        let txn = Arc::new(SubscribeTransaction {
            timer: TimedTransaction::new(
                self.config.retry_window(),
                &self.cancel,
                Some(self.subscribe_finalizer(msg_id, topic_id, subscribe.qos, created)),
            ),
            msg_id,
            topic_id,
            qos: subscribe.qos,
            outlet: self.outlet.clone(),
        });
        self.upstream.store(msg_id, txn);
        debug!("{} subscribing to {} as {}", self.name(), filter, topic_id);
        self.outlet
            .broker(mqtt::create_subscribe(msg_id, &filter, subscribe.qos.into()));
        Ok(())
    }

    fn reject_subscribe(&self, subscribe: &Subscribe, topic_id: u16, code: ReturnCode) {
        self.outlet.client(Packet::SubAck(SubAck {
            qos: subscribe.qos,
            topic_id,
            msg_id: subscribe.msg_id,
            code,
        }));
    }

    fn subscribe_finalizer(
        self: &Arc<Self>,
        msg_id: u16,
        topic_id: u16,
        qos: QoS,
        created: bool,
    ) -> Finalizer {
        let remove = self.upstream.remover(Key::MsgId(msg_id));
        let shared = Arc::downgrade(self);
        Box::new(move |lifecycle: &Lifecycle| {
            let err = lifecycle.err();
            if let Some(shared) = shared.upgrade() {
                if err == Some(TransactionError::Timeout) {
                    warn!("Broker never acknowledged SUBSCRIBE {}", msg_id);
                    shared.outlet.client(Packet::SubAck(SubAck {
                        qos,
                        topic_id,
                        msg_id,
                        code: ReturnCode::NotSupported,
                    }));
                }
                let failed = matches!(
                    err,
                    Some(TransactionError::Timeout | TransactionError::Rejected(_))
                );
                if created && failed {
                    debug!("Dropping alias {} of failed SUBSCRIBE {}", topic_id, msg_id);
                    shared.aliases.lock().remove(topic_id);
                }
            }
            remove(lifecycle);
        })
    }

    pub(super) fn on_broker_suback(&self, suback: mqtt::SubAck) -> Result<()> {
        let Some(txn) = self.upstream.get::<SubscribeTransaction>(suback.pkid) else {
            debug!("SUBACK {} for {} matches nothing", suback.pkid, self.name());
            return Ok(());
        };
        let code = suback
            .return_codes
            .first()
            .cloned()
            .unwrap_or(mqtt::SubscribeReasonCode::Failure);
        txn.complete(code);
        Ok(())
    }

    pub(super) fn on_unsubscribe(self: &Arc<Self>, unsubscribe: Unsubscribe) -> Result<()> {
        let msg_id = unsubscribe.msg_id;
        if self.upstream.contains(msg_id) {
            debug!("UNSUBSCRIBE {} from {} already in flight", msg_id, self.name());
            return Ok(());
        }

        let filter = match &unsubscribe.topic {
            TopicFilter::Name(name) => Some(name.clone()),
            TopicFilter::Predefined(id) => self.predefined.lock().name(*id).map(str::to_string),
            TopicFilter::Short(id) => topics::decode_short(*id),
        };
        let Some(filter) = filter else {
            // Nothing to remove on the broker side.
            self.outlet.client(Packet::UnsubAck(msg_id));
            return Ok(());
        };

        let remove = self.upstream.remover(Key::MsgId(msg_id));
        let finalizer: Finalizer = Box::new(move |lifecycle: &Lifecycle| {
            if lifecycle.err() == Some(TransactionError::Timeout) {
                warn!("Broker never acknowledged UNSUBSCRIBE {}", msg_id);
            }
            remove(lifecycle);
        });
        let txn = Arc::new(UnsubscribeTransaction {
            timer: TimedTransaction::new(
                self.config.retry_window(),
                &self.cancel,
                Some(finalizer),
            ),
        });
        self.upstream.store(msg_id, txn);
        debug!("{} unsubscribing from {}", self.name(), filter);
        self.outlet.broker(mqtt::create_unsubscribe(msg_id, &filter));
        Ok(())
    }

    pub(super) fn on_broker_unsuback(&self, pkid: u16) -> Result<()> {
        match self.upstream.get::<UnsubscribeTransaction>(pkid) {
            Some(txn) => {
                if txn.lifecycle().success() {
                    self.outlet.client(Packet::UnsubAck(pkid));
                }
            }
            None => debug!("UNSUBACK {} for {} matches nothing", pkid, self.name()),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn txn(outlet: &Outlet) -> SubscribeTransaction {
        SubscribeTransaction {
            timer: TimedTransaction::new(Duration::from_secs(10), &CancellationToken::new(), None),
            msg_id: 4,
            topic_id: 1,
            qos: QoS::AtLeastOnce,
            outlet: outlet.clone(),
        }
    }

    #[tokio::test]
    async fn test_suback_is_answered_once() {
        let (outlet, mut rx) = Outlet::new();
        let txn = txn(&outlet);

        txn.complete(mqtt::SubscribeReasonCode::Success(mqtt::QoS::AtMostOnce));
        match rx.client.try_recv() {
            Ok(Packet::SubAck(ack)) => {
                assert_eq!(ack.code, ReturnCode::Accepted);
                assert_eq!(ack.qos, QoS::AtMostOnce);
            }
            other => panic!("unexpected {:?}", other),
        }

        txn.complete(mqtt::SubscribeReasonCode::Failure);
        assert!(rx.client.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_suback_after_deadline_is_dropped() {
        let (outlet, mut rx) = Outlet::new();
        let txn = txn(&outlet);

        assert!(txn.lifecycle().fail(TransactionError::Timeout));
        txn.complete(mqtt::SubscribeReasonCode::Success(mqtt::QoS::AtLeastOnce));
        assert!(rx.client.try_recv().is_err());
        assert_eq!(txn.lifecycle().err(), Some(TransactionError::Timeout));
    }
}
