//! Outbound queues toward both legs of a session.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

use crate::mqtt;
use crate::packet::Packet;
use crate::transaction::Retransmit;

/// A packet bound for one of the two legs.
#[derive(Debug, Clone)]
pub(crate) enum Outbound {
    Client(Packet),
    Broker(mqtt::Packet),
}

impl Retransmit for Outbound {
    fn mark_duplicate(&mut self) {
        match self {
            Outbound::Client(packet) => packet.mark_duplicate(),
            Outbound::Broker(mqtt::Packet::Publish(publish)) => publish.dup = true,
            Outbound::Broker(_) => {}
        }
    }

    /// Only the client leg sleeps.
    fn pausable(&self) -> bool {
        matches!(self, Outbound::Client(_))
    }
}

/// Senders feeding the session's two writer tasks.
///
/// Sends never block and are dropped silently once the writers are gone.
/// While the client sleeps, client-bound packets wait behind a gate.
#[derive(Clone)]
pub(crate) struct Outlet {
    client: mpsc::UnboundedSender<Packet>,
    broker: mpsc::UnboundedSender<mqtt::Packet>,
    gate: Arc<Mutex<Gate>>,
}

#[derive(Default)]
struct Gate {
    closed: bool,
    held: VecDeque<Packet>,
}

pub(crate) struct OutletReceivers {
    pub client: mpsc::UnboundedReceiver<Packet>,
    pub broker: mpsc::UnboundedReceiver<mqtt::Packet>,
}

impl Outlet {
    pub fn new() -> (Self, OutletReceivers) {
        let (client, client_rx) = mpsc::unbounded_channel();
        let (broker, broker_rx) = mpsc::unbounded_channel();
        (
            Self {
                client,
                broker,
                gate: Arc::default(),
            },
            OutletReceivers {
                client: client_rx,
                broker: broker_rx,
            },
        )
    }

    pub fn client(&self, packet: Packet) {
        let mut gate = self.gate.lock();
        if gate.closed {
            trace!("Holding {} for sleeping client", packet.kind());
            gate.held.push_back(packet);
            return;
        }
        self.client_now(packet);
    }

    /// Send to the client even while the gate is closed.
    pub fn client_now(&self, packet: Packet) {
        if self.client.send(packet).is_err() {
            trace!("Client writer gone, dropping packet");
        }
    }

    /// Hold client-bound packets until [`open_gate`](Self::open_gate).
    pub fn close_gate(&self) {
        self.gate.lock().closed = true;
    }

    /// Send what was held, in order, and stop holding.
    pub fn open_gate(&self) {
        let mut gate = self.gate.lock();
        gate.closed = false;
        while let Some(packet) = gate.held.pop_front() {
            self.client_now(packet);
        }
    }

    pub fn broker(&self, packet: mqtt::Packet) {
        if self.broker.send(packet).is_err() {
            trace!("Broker writer gone, dropping packet");
        }
    }

    pub fn send(&self, outbound: Outbound) {
        match outbound {
            Outbound::Client(packet) => self.client(packet),
            Outbound::Broker(packet) => self.broker(packet),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_holds_client_packets_in_order() {
        let (outlet, mut rx) = Outlet::new();
        outlet.close_gate();
        outlet.client(Packet::PubRel(1));
        outlet.send(Outbound::Client(Packet::PubComp(2)));
        outlet.broker(mqtt::create_pingreq());
        outlet.client_now(Packet::PingResp);

        assert!(matches!(rx.client.try_recv(), Ok(Packet::PingResp)));
        assert!(rx.client.try_recv().is_err());
        assert!(rx.broker.try_recv().is_ok());

        outlet.open_gate();
        assert!(matches!(rx.client.try_recv(), Ok(Packet::PubRel(1))));
        assert!(matches!(rx.client.try_recv(), Ok(Packet::PubComp(2))));

        outlet.client(Packet::PubRec(3));
        assert!(matches!(rx.client.try_recv(), Ok(Packet::PubRec(3))));
    }

    #[test]
    fn test_only_client_payloads_pause() {
        assert!(Outbound::Client(Packet::PubRel(1)).pausable());
        assert!(!Outbound::Broker(mqtt::create_pubrel(1)).pausable());
    }
}
