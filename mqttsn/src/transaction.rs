//! Retry and deadline transactions.
//!
//! A transaction is a multi-step request/acknowledgement cycle that resolves
//! exactly once: succeeded, failed, or canceled. [`Lifecycle`] carries the
//! resolution and completion signal; [`RetryTransaction`] retransmits its
//! last payload on a fixed delay up to a retry budget; [`TimedTransaction`]
//! fails once a single deadline passes.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::TransactionError;

/// Invoked exactly once when a transaction resolves.
pub type Finalizer = Box<dyn FnOnce(&Lifecycle) + Send + 'static>;

/// Sends a retransmission.
pub type Resender<P> = Arc<dyn Fn(P) + Send + Sync>;

/// A payload that can be retransmitted.
pub trait Retransmit: Clone + Send + 'static {
    /// Flag the payload as a retransmission where the wire format allows it.
    fn mark_duplicate(&mut self);

    /// Whether [`RetryTransaction::pause`] holds back this payload.
    fn pausable(&self) -> bool {
        true
    }
}

/// Anything that can live in a [`TransactionStore`](crate::store::TransactionStore).
pub trait Transaction: Send + Sync + 'static {
    fn lifecycle(&self) -> &Lifecycle;
}

/// Resolution state shared by every transaction flavour.
#[derive(Clone)]
pub struct Lifecycle {
    inner: Arc<LifecycleInner>,
}

struct LifecycleInner {
    outcome: Mutex<Option<Result<(), TransactionError>>>,
    finalizer: Mutex<Option<Finalizer>>,
    done: CancellationToken,
}

impl Lifecycle {
    pub fn new(finalizer: Option<Finalizer>) -> Self {
        Self {
            inner: Arc::new(LifecycleInner {
                outcome: Mutex::new(None),
                finalizer: Mutex::new(finalizer),
                done: CancellationToken::new(),
            }),
        }
    }

    /// Resolve as succeeded. Returns false if already resolved.
    pub fn success(&self) -> bool {
        self.resolve(Ok(()))
    }

    /// Resolve as failed. Returns false if already resolved.
    pub fn fail(&self, err: TransactionError) -> bool {
        self.resolve(Err(err))
    }

    /// Resolve as canceled. Returns false if already resolved.
    pub fn cancel(&self) -> bool {
        self.resolve(Err(TransactionError::Canceled))
    }

    fn resolve(&self, outcome: Result<(), TransactionError>) -> bool {
        {
            let mut slot = self.inner.outcome.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
        }
        let finalizer = self.inner.finalizer.lock().take();
        if let Some(finalizer) = finalizer {
            finalizer(self);
        }
        self.inner.done.cancel();
        true
    }

    /// Completes once the transaction has resolved.
    pub async fn done(&self) {
        self.inner.done.cancelled().await
    }

    pub fn is_done(&self) -> bool {
        self.inner.outcome.lock().is_some()
    }

    /// The resolved error, if the transaction failed or was canceled.
    pub fn err(&self) -> Option<TransactionError> {
        match &*self.inner.outcome.lock() {
            Some(Err(e)) => Some(e.clone()),
            _ => None,
        }
    }

    /// Wait for resolution and return the outcome.
    pub async fn wait(&self) -> Result<(), TransactionError> {
        self.done().await;
        self.inner
            .outcome
            .lock()
            .clone()
            .unwrap_or(Err(TransactionError::Closed))
    }

    /// Whether both handles refer to the same transaction.
    pub fn same(&self, other: &Lifecycle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("outcome", &*self.inner.outcome.lock())
            .finish()
    }
}

/// Bounded periodic-retry transaction.
///
/// `proceed` records the current step and the payload just sent, resets the
/// retry counter and arms the timer. Each expiry resends the payload marked
/// as a duplicate, until `max_retries` resends have gone unanswered; the
/// next expiry fails the transaction with [`TransactionError::NoMoreRetries`].
///
/// `pause` stops the clock for pausable payloads without spending the
/// budget; `resume` sends the pending payload again and restarts it.
pub struct RetryTransaction<S, P> {
    lifecycle: Lifecycle,
    delay: Duration,
    max_retries: u32,
    resend: Resender<P>,
    cancel: CancellationToken,
    armed: Mutex<Armed<S, P>>,
}

struct Armed<S, P> {
    step: S,
    payload: Option<P>,
    retries: u32,
    generation: u64,
    timer: Option<CancellationToken>,
    paused: bool,
}

enum Expiry<P> {
    Resend(P, u32),
    Exhausted,
    Stale,
}

impl<S, P> RetryTransaction<S, P>
where
    S: Copy + PartialEq + std::fmt::Debug + Send + 'static,
    P: Retransmit,
{
    pub fn new(
        initial: S,
        delay: Duration,
        max_retries: u32,
        resend: Resender<P>,
        cancel: &CancellationToken,
        finalizer: Option<Finalizer>,
    ) -> Arc<Self> {
        let txn = Arc::new(Self {
            lifecycle: Lifecycle::new(finalizer),
            delay,
            max_retries,
            resend,
            cancel: cancel.child_token(),
            armed: Mutex::new(Armed {
                step: initial,
                payload: None,
                retries: 0,
                generation: 0,
                timer: None,
                paused: false,
            }),
        });

        // Parent cancellation resolves the transaction so waiters never hang.
        let watcher = txn.lifecycle.clone();
        let parent = txn.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = watcher.done() => {}
                _ = parent.cancelled() => {
                    watcher.cancel();
                }
            }
        });

        txn
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn step(&self) -> S {
        self.armed.lock().step
    }

    /// Number of resends since the last `proceed`.
    pub fn retries(&self) -> u32 {
        self.armed.lock().retries
    }

    /// Move to `step`, remembering `payload` for retransmission.
    ///
    /// Passing `None` disarms the timer; the step then waits without a
    /// retry budget.
    pub fn proceed(self: &Arc<Self>, step: S, payload: Option<P>) {
        let mut armed = self.armed.lock();
        self.arm(&mut armed, step, payload);
    }

    /// Atomically move from `expected` to `next`. Returns false, leaving the
    /// transaction untouched, when the current step is not `expected`.
    pub fn advance(self: &Arc<Self>, expected: S, next: S, payload: Option<P>) -> bool {
        let mut armed = self.armed.lock();
        if armed.step != expected || self.lifecycle.is_done() {
            return false;
        }
        self.arm(&mut armed, next, payload);
        true
    }

    /// Stop retransmitting pausable payloads, including ones recorded by
    /// later steps, until [`resume`](Self::resume).
    pub fn pause(&self) {
        let mut armed = self.armed.lock();
        armed.paused = true;
        if armed.payload.as_ref().is_some_and(Retransmit::pausable) {
            armed.generation += 1;
            if let Some(timer) = armed.timer.take() {
                timer.cancel();
            }
        }
    }

    /// Undo [`pause`](Self::pause). A payload held back meanwhile is resent
    /// at once with a fresh retry budget.
    pub fn resume(self: &Arc<Self>) {
        let payload = {
            let mut armed = self.armed.lock();
            if !armed.paused {
                return;
            }
            armed.paused = false;
            if armed.timer.is_some() || self.lifecycle.is_done() {
                return;
            }
            let Some(mut payload) = armed.payload.take() else {
                return;
            };
            payload.mark_duplicate();
            let step = armed.step;
            self.arm(&mut armed, step, Some(payload.clone()));
            payload
        };
        trace!("Retransmitting after resume");
        (self.resend)(payload);
    }

    fn arm(self: &Arc<Self>, armed: &mut Armed<S, P>, step: S, payload: Option<P>) {
        armed.step = step;
        armed.payload = payload;
        armed.retries = 0;
        armed.generation += 1;
        if let Some(timer) = armed.timer.take() {
            timer.cancel();
        }
        let held = armed.paused && armed.payload.as_ref().is_some_and(Retransmit::pausable);
        if armed.payload.is_none() || held || self.lifecycle.is_done() {
            return;
        }

        let timer = self.cancel.child_token();
        armed.timer = Some(timer.clone());
        let generation = armed.generation;
        let txn = Arc::clone(self);
        tokio::spawn(async move { txn.run_timer(generation, timer).await });
    }

    async fn run_timer(self: Arc<Self>, generation: u64, timer: CancellationToken) {
        loop {
            tokio::select! {
                _ = timer.cancelled() => return,
                _ = self.lifecycle.done() => return,
                _ = tokio::time::sleep(self.delay) => {}
            }

            let expiry = {
                let mut armed = self.armed.lock();
                if armed.generation != generation || self.lifecycle.is_done() {
                    Expiry::Stale
                } else if armed.retries >= self.max_retries {
                    Expiry::Exhausted
                } else {
                    armed.retries += 1;
                    let retries = armed.retries;
                    match armed.payload.as_mut() {
                        Some(payload) => {
                            payload.mark_duplicate();
                            Expiry::Resend(payload.clone(), retries)
                        }
                        None => Expiry::Stale,
                    }
                }
            };

            match expiry {
                Expiry::Resend(payload, attempt) => {
                    trace!("Retransmitting (attempt {}/{})", attempt, self.max_retries);
                    (self.resend)(payload);
                }
                Expiry::Exhausted => {
                    debug!(
                        "Giving up after {} retries in step {:?}",
                        self.max_retries,
                        self.step()
                    );
                    self.lifecycle.fail(TransactionError::NoMoreRetries);
                    return;
                }
                Expiry::Stale => return,
            }
        }
    }
}

/// Single-deadline transaction.
pub struct TimedTransaction {
    lifecycle: Lifecycle,
}

impl TimedTransaction {
    pub fn new(
        deadline: Duration,
        cancel: &CancellationToken,
        finalizer: Option<Finalizer>,
    ) -> Self {
        let lifecycle = Lifecycle::new(finalizer);
        let watcher = lifecycle.clone();
        let parent = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = watcher.done() => {}
                _ = parent.cancelled() => {
                    watcher.cancel();
                }
                _ = tokio::time::sleep(deadline) => {
                    if watcher.fail(TransactionError::Timeout) {
                        debug!("Transaction deadline of {:?} exceeded", deadline);
                    }
                }
            }
        });
        Self { lifecycle }
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }
}
