//! Transaction registry.
//!
//! Transactions are keyed either by message id or by a per-type singleton
//! slot. A key holds at most one transaction: storing over an occupied key
//! cancels the previous occupant.

use parking_lot::Mutex;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Weak};
use tracing::trace;

use crate::transaction::{Finalizer, Lifecycle, Transaction};

/// Store key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    /// Message id, 1..=65535.
    MsgId(u16),
    /// One slot per transaction type.
    Slot(TypeId),
}

impl Key {
    pub fn slot<T: Transaction>() -> Self {
        Key::Slot(TypeId::of::<T>())
    }
}

struct Entry {
    txn: Arc<dyn Any + Send + Sync>,
    lifecycle: Lifecycle,
}

/// Concurrent transaction registry.
#[derive(Default)]
pub struct TransactionStore {
    entries: Mutex<HashMap<Key, Entry>>,
}

impl TransactionStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Store under a message id, canceling any previous occupant.
    pub fn store<T: Transaction>(&self, msg_id: u16, txn: Arc<T>) {
        self.insert(Key::MsgId(msg_id), txn);
    }

    /// Look up a transaction of type `T` by message id.
    pub fn get<T: Transaction>(&self, msg_id: u16) -> Option<Arc<T>> {
        self.lookup(Key::MsgId(msg_id))
    }

    pub fn delete(&self, msg_id: u16) {
        self.entries.lock().remove(&Key::MsgId(msg_id));
    }

    pub fn contains(&self, msg_id: u16) -> bool {
        self.entries.lock().contains_key(&Key::MsgId(msg_id))
    }

    /// Store into the singleton slot for `T`, canceling any previous occupant.
    pub fn store_singleton<T: Transaction>(&self, txn: Arc<T>) {
        self.insert(Key::slot::<T>(), txn);
    }

    pub fn get_singleton<T: Transaction>(&self) -> Option<Arc<T>> {
        self.lookup(Key::slot::<T>())
    }

    pub fn delete_singleton<T: Transaction>(&self) {
        self.entries.lock().remove(&Key::slot::<T>());
    }

    /// Remove `key` only while it still holds the transaction behind `lifecycle`.
    pub fn delete_if_same(&self, key: Key, lifecycle: &Lifecycle) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(&key) {
            Some(entry) if entry.lifecycle.same(lifecycle) => {
                entries.remove(&key);
                true
            }
            _ => false,
        }
    }

    /// Finalizer that removes the transaction from `key` once it resolves.
    pub fn remover(self: &Arc<Self>, key: Key) -> Finalizer {
        let store: Weak<Self> = Arc::downgrade(self);
        Box::new(move |lifecycle: &Lifecycle| {
            if let Some(store) = store.upgrade() {
                if store.delete_if_same(key, lifecycle) {
                    trace!("Removed transaction {:?}", key);
                }
            }
        })
    }

    /// Find a message id not currently in use, scanning down from 65535.
    ///
    /// Best effort: the id is not reserved, and `None` means every id is busy.
    pub fn unused_id(&self) -> Option<u16> {
        let entries = self.entries.lock();
        (1..=u16::MAX)
            .rev()
            .find(|id| !entries.contains_key(&Key::MsgId(*id)))
    }

    /// Every stored transaction of type `T`.
    pub fn all<T: Transaction>(&self) -> Vec<Arc<T>> {
        self.entries
            .lock()
            .values()
            .filter_map(|entry| entry.txn.clone().downcast::<T>().ok())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Cancel and drop every transaction.
    pub fn cancel_all(&self) {
        let drained: Vec<Entry> = self.entries.lock().drain().map(|(_, e)| e).collect();
        for entry in drained {
            entry.lifecycle.cancel();
        }
    }

    fn insert<T: Transaction>(&self, key: Key, txn: Arc<T>) {
        let entry = Entry {
            lifecycle: txn.lifecycle().clone(),
            txn,
        };
        let previous = self.entries.lock().insert(key, entry);
        if let Some(previous) = previous {
            if previous.lifecycle.cancel() {
                trace!("Canceled superseded transaction {:?}", key);
            }
        }
    }

    fn lookup<T: Transaction>(&self, key: Key) -> Option<Arc<T>> {
        let txn = self.entries.lock().get(&key)?.txn.clone();
        txn.downcast::<T>().ok()
    }
}

/// Message id allocator, skipping the reserved id 0.
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicU16,
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self {
            next: AtomicU16::new(1),
        }
    }
}

impl IdAllocator {
    pub fn next(&self) -> u16 {
        loop {
            let id = self.next.fetch_add(1, Ordering::SeqCst);
            if id != 0 {
                return id;
            }
        }
    }

    /// Next id that `store` does not currently hold.
    pub fn next_free(&self, store: &TransactionStore) -> Option<u16> {
        for _ in 0..u16::MAX {
            let id = self.next();
            if !store.contains(id) {
                return Some(id);
            }
        }
        None
    }
}
