//! Single-flight creation table.
//!
//! Guards lazy per-key initialization whose setup is expensive (a proxy
//! dial): the first caller for a key becomes the leader and performs the
//! creation, every concurrent caller for the same key parks until the
//! leader finishes, then re-reads the published value. The leader slot is
//! always cleared and waiters are always woken, including on failed
//! creation, so a failed dial never strands followers.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

pub struct CondTable<K> {
    slots: Mutex<HashMap<K, Arc<Notify>>>,
}

/// Outcome of [`CondTable::join`].
pub enum Flight<'a, K: Hash + Eq + Clone> {
    /// This caller owns the creation. Dropping the guard releases the slot
    /// and wakes all followers.
    Leader(FlightGuard<'a, K>),
    /// Another caller performed the creation; it has finished by the time
    /// this value is returned. Re-read the published state.
    Follower,
}

pub struct FlightGuard<'a, K: Hash + Eq + Clone> {
    table: &'a CondTable<K>,
    key: K,
}

impl<K: Hash + Eq + Clone> CondTable<K> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Join the flight for `key`: become the leader, or wait for the
    /// current leader to finish.
    pub async fn join(&self, key: K) -> Flight<'_, K> {
        let notify = {
            let mut slots = match self.slots.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            match slots.entry(key.clone()) {
                Entry::Vacant(entry) => {
                    entry.insert(Arc::new(Notify::new()));
                    return Flight::Leader(FlightGuard { table: self, key });
                }
                Entry::Occupied(entry) => entry.get().clone(),
            }
        };
        let wakeup = notify.notified();
        tokio::pin!(wakeup);
        wakeup.as_mut().enable();
        // The leader may have finished between the entry lookup and the
        // registration above (the slot may even belong to a newer leader by
        // now). Only keep waiting while the slot still holds our notify;
        // its broadcast then comes later than our registration and cannot
        // be missed.
        {
            let slots = match self.slots.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            match slots.get(&key) {
                Some(current) if Arc::ptr_eq(current, &notify) => {}
                _ => return Flight::Follower,
            }
        }
        wakeup.await;
        Flight::Follower
    }
}

impl<K: Hash + Eq + Clone> Drop for FlightGuard<'_, K> {
    fn drop(&mut self) {
        let notify = {
            let mut slots = match self.table.slots.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            slots.remove(&self.key)
        };
        if let Some(notify) = notify {
            notify.notify_waiters();
        }
    }
}
