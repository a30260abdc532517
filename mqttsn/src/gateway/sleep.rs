//! Sleeping clients.
//!
//! While a client sleeps the gateway keeps its broker session alive and
//! buffers broker PUBLISHes. On wake-up (PINGREQ carrying the client id) the
//! buffer is flushed in arrival order, followed by PINGRESP, after which the
//! client is considered asleep again. A reconnect flushes the buffer and
//! leaves the client active. Missing the wake window ends the session.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, Interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::handler::Shared;
use super::publish::PublishTransaction;
use crate::error::Error;
use crate::mqtt;
use crate::packet::{Disconnect, Packet};
use crate::types::SessionState;

/// FIFO of messages held back from a sleeping client.
///
/// Once released, the buffer keeps absorbing new arrivals until it has been
/// drained, so a flush always precedes newer traffic.
#[derive(Debug)]
pub(crate) struct SleepBuffer<T> {
    queue: VecDeque<T>,
    holding: bool,
    draining: bool,
}

impl<T> Default for SleepBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SleepBuffer<T> {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            holding: false,
            draining: false,
        }
    }

    /// Start buffering.
    pub fn hold(&mut self) {
        self.holding = true;
    }

    /// Returns the item back if it may be delivered right away.
    pub fn offer(&mut self, item: T) -> Option<T> {
        if self.holding || self.draining {
            self.queue.push_back(item);
            None
        } else {
            Some(item)
        }
    }

    /// Stop buffering. Returns true when the caller must drain the queue
    /// with [`pop`](Self::pop).
    pub fn release(&mut self) -> bool {
        self.holding = false;
        if self.draining || self.queue.is_empty() {
            return false;
        }
        self.draining = true;
        true
    }

    /// Next item to drain. `None` ends the drain.
    pub fn pop(&mut self) -> Option<T> {
        if self.holding {
            self.draining = false;
            return None;
        }
        let item = self.queue.pop_front();
        if item.is_none() {
            self.draining = false;
        }
        item
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

/// Watch a sleeping client.
///
/// Calls `lost` if `token` is not cancelled within `window`, and `ping`
/// every `ping_every` until then.
pub(super) async fn supervise<P, L>(
    window: Duration,
    ping_every: Option<Duration>,
    token: CancellationToken,
    ping: P,
    lost: L,
) where
    P: Fn(),
    L: FnOnce(),
{
    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);
    let mut ticker =
        ping_every.map(|every| tokio::time::interval_at(Instant::now() + every, every));

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = &mut deadline => {
                lost();
                return;
            }
            _ = tick(&mut ticker) => ping(),
        }
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

impl Shared {
    pub(super) fn enter_sleep(self: &Arc<Self>, duration: u16) {
        info!("Client {} sleeping for {}s", self.name(), duration);
        self.sleep.lock().hold();
        *self.sleep_duration.lock() = duration;
        self.set_state(SessionState::Asleep);
        self.quiet_client_leg();
        self.outlet.client_now(Packet::Disconnect(Disconnect::default()));
        self.start_sleeper(duration);
    }

    fn start_sleeper(self: &Arc<Self>, duration: u16) {
        self.stop_sleeper();
        let token = self.cancel.child_token();
        *self.sleeper.lock() = Some(token.clone());

        let window = Duration::from_millis(u64::from(duration) * 1500);
        let keep_alive = *self.keep_alive.lock();
        let ping_every = (keep_alive > 0 && duration > keep_alive)
            .then(|| Duration::from_secs(u64::from(keep_alive)) / 2);

        let outlet = self.outlet.clone();
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            supervise(
                window,
                ping_every,
                token,
                || outlet.broker(mqtt::create_pingreq()),
                || shared.abort(Error::Timeout("client missed its wake window".to_string())),
            )
            .await
        });
    }

    /// Nothing reaches a sleeping client: queue direct sends and stop
    /// retransmissions in flight.
    fn quiet_client_leg(&self) {
        self.outlet.close_gate();
        for txn in self.in_flight() {
            txn.pause();
        }
    }

    /// Undo [`quiet_client_leg`](Self::quiet_client_leg), sending what was
    /// held and retransmitting unacknowledged messages.
    pub(super) fn wake_client_leg(&self) {
        self.outlet.open_gate();
        for txn in self.in_flight() {
            txn.resume();
        }
    }

    fn in_flight(&self) -> Vec<Arc<PublishTransaction>> {
        let mut txns = self.upstream.all::<PublishTransaction>();
        txns.extend(self.downstream.all::<PublishTransaction>());
        txns.sort_by_key(|txn| txn.msg_id());
        txns
    }

    pub(super) fn stop_sleeper(&self) {
        if let Some(token) = self.sleeper.lock().take() {
            token.cancel();
        }
    }

    /// PINGREQ from a sleeping client.
    pub(super) fn wake(self: &Arc<Self>) {
        debug!("Client {} awake, flushing {} buffered", self.name(), self.sleep.lock().len());
        self.stop_sleeper();
        self.set_state(SessionState::Awake);
        self.wake_client_leg();
        self.release_sleep_buffer(true);
    }

    /// Deliver what accumulated during sleep.
    ///
    /// With `wake` set, the client goes back to sleep after the flush.
    pub(super) fn release_sleep_buffer(self: &Arc<Self>, wake: bool) {
        let drain = self.sleep.lock().release();
        if drain {
            let shared = Arc::clone(self);
            tokio::spawn(async move { shared.flush(wake).await });
        } else if wake {
            self.back_to_sleep();
        }
    }

    async fn flush(self: Arc<Self>, wake: bool) {
        loop {
            let next = {
                let mut sleep = self.sleep.lock();
                let next = sleep.pop();
                if next.is_none() && wake && self.state() == SessionState::Awake {
                    // Arrivals after the flush wait for the next wake-up.
                    sleep.hold();
                }
                next
            };
            let Some(publish) = next else {
                break;
            };
            if let Some(txn) = self.deliver_downstream(publish) {
                tokio::select! {
                    _ = txn.delivered() => {}
                    _ = self.cancel.cancelled() => return,
                }
            }
        }
        if wake {
            self.back_to_sleep();
        }
    }

    fn back_to_sleep(self: &Arc<Self>) {
        if self.state() != SessionState::Awake {
            return;
        }
        self.sleep.lock().hold();
        self.set_state(SessionState::Asleep);
        self.quiet_client_leg();
        self.outlet.client_now(Packet::PingResp);
        let duration = *self.sleep_duration.lock();
        self.start_sleeper(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[test]
    fn test_buffer_holds_in_order() {
        let mut buffer = SleepBuffer::new();
        assert_eq!(buffer.offer(1), Some(1));

        buffer.hold();
        assert_eq!(buffer.offer(2), None);
        assert_eq!(buffer.offer(3), None);
        assert_eq!(buffer.len(), 2);

        assert!(buffer.release());
        // Arrivals during the drain queue behind the backlog.
        assert_eq!(buffer.offer(4), None);
        assert_eq!(buffer.pop(), Some(2));
        assert_eq!(buffer.pop(), Some(3));
        assert_eq!(buffer.pop(), Some(4));
        assert_eq!(buffer.pop(), None);

        assert_eq!(buffer.offer(5), Some(5));
    }

    #[test]
    fn test_release_empty_needs_no_drain() {
        let mut buffer: SleepBuffer<u8> = SleepBuffer::new();
        buffer.hold();
        assert!(!buffer.release());
        assert_eq!(buffer.offer(1), Some(1));
    }

    #[test]
    fn test_second_release_while_draining() {
        let mut buffer = SleepBuffer::new();
        buffer.hold();
        buffer.offer(1);
        assert!(buffer.release());
        assert!(!buffer.release());
        assert_eq!(buffer.pop(), Some(1));
    }

    #[test]
    fn test_hold_during_drain_stops_it() {
        let mut buffer = SleepBuffer::new();
        buffer.hold();
        buffer.offer(1);
        buffer.offer(2);
        assert!(buffer.release());
        assert_eq!(buffer.pop(), Some(1));

        buffer.hold();
        assert_eq!(buffer.pop(), None);
        assert_eq!(buffer.len(), 1);
        assert!(buffer.release());
        assert_eq!(buffer.pop(), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervise_pings_then_gives_up() {
        let pings = AtomicUsize::new(0);
        let lost = AtomicBool::new(false);
        supervise(
            Duration::from_secs(15),
            Some(Duration::from_secs(4)),
            CancellationToken::new(),
            || {
                pings.fetch_add(1, Ordering::SeqCst);
            },
            || lost.store(true, Ordering::SeqCst),
        )
        .await;

        assert_eq!(pings.load(Ordering::SeqCst), 3);
        assert!(lost.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervise_stops_on_cancel() {
        let token = CancellationToken::new();
        let lost = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&lost);
        let watch = token.clone();
        let handle = tokio::spawn(async move {
            supervise(Duration::from_secs(10), None, watch, || {}, || {
                flag.store(true, Ordering::SeqCst)
            })
            .await
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        token.cancel();
        handle.await.unwrap();
        assert!(!lost.load(Ordering::SeqCst));
    }
}
