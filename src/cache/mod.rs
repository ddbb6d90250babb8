//! Bounded reply cache keyed by inbound message id.
//!
//! The messaging platform retries a webhook delivery when it does not get an
//! answer quickly enough. Each retry carries the same `MsgId`, so replies are
//! cached per id and a retried delivery is answered from the cache instead of
//! calling the chat provider again.
//!
//! Entries are first-write-wins: once a reply exists for an id it is never
//! replaced, since the platform may already have shown it to the user.
//! Eviction is least-recently-used on capacity overflow; there is no expiry
//! and nothing survives a restart.

use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::watch;

/// Default number of replies kept in memory.
pub const DEFAULT_REPLY_CACHE_CAPACITY: usize = 100;

/// Result of [`ReplyCache::get_or_try_insert_with`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<V> {
    /// The value already existed, or was produced by a concurrent caller.
    Hit(V),
    /// This call produced and stored the value.
    Inserted(V),
}

impl<V> Lookup<V> {
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit(_))
    }

    pub fn into_inner(self) -> V {
        match self {
            Self::Hit(value) | Self::Inserted(value) => value,
        }
    }
}

struct Slots<V> {
    ready: LruCache<String, V>,
    // Keys whose value is being computed. Kept outside the LRU so an entry
    // cannot be evicted before it has a value.
    in_flight: HashMap<String, watch::Receiver<bool>>,
}

/// LRU map from message id to reply.
///
/// A miss spawns the initializer as its own task. Concurrent deliveries of the
/// same id wait for that task instead of starting another one, and the task
/// keeps running (and stores its value) even if the caller that started it is
/// dropped.
pub struct ReplyCache<V> {
    slots: Arc<Mutex<Slots<V>>>,
}

impl<V: Clone> ReplyCache<V> {
    /// Creates a cache holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            slots: Arc::new(Mutex::new(Slots {
                ready: LruCache::new(capacity),
                in_flight: HashMap::new(),
            })),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().ready.cap().get()
    }

    /// Number of stored values. Keys still being computed are not counted.
    pub fn len(&self) -> usize {
        self.slots.lock().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys whose initializer is still running.
    pub fn in_flight(&self) -> usize {
        self.slots.lock().in_flight.len()
    }

    /// Returns the cached value and marks the key as most recently used.
    pub fn get(&self, key: &str) -> Option<V> {
        self.slots.lock().ready.get(key).cloned()
    }

    /// Stores `value` unless the key already has one.
    ///
    /// Returns `true` when the value was stored. A key whose value is still
    /// being computed by [`get_or_try_insert_with`](Self::get_or_try_insert_with)
    /// counts as occupied.
    pub fn put(&self, key: &str, value: V) -> bool {
        let mut slots = self.slots.lock();
        if slots.ready.contains(key) || slots.in_flight.contains_key(key) {
            return false;
        }
        slots.ready.put(key.to_string(), value);
        true
    }

    /// Returns the value for `key`, running `init` to produce it on a miss.
    ///
    /// `init`'s future runs on a spawned task. Callers racing on the same key
    /// wait for it. A failed `init` stores nothing; the error goes to the
    /// caller that started it and each waiter then retries as if it had
    /// missed.
    pub async fn get_or_try_insert_with<F, Fut, E>(
        &self,
        key: &str,
        init: F,
    ) -> Result<Lookup<V>, E>
    where
        V: Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Send + 'static,
    {
        let done = loop {
            let mut pending = {
                let mut slots = self.slots.lock();
                if let Some(value) = slots.ready.get(key) {
                    return Ok(Lookup::Hit(value.clone()));
                }
                match slots.in_flight.get(key).cloned() {
                    Some(pending) => pending,
                    None => {
                        let (done, pending) = watch::channel(false);
                        slots.in_flight.insert(key.to_string(), pending);
                        break done;
                    }
                }
            };
            // A closed channel means the task is gone; either way look again.
            let _ = pending.wait_for(|finished| *finished).await;
        };

        let mut flight = Flight {
            slots: Arc::clone(&self.slots),
            key: key.to_string(),
            value: None,
            done,
        };
        let fut = init();
        let task = tokio::spawn(async move {
            let result = fut.await;
            if let Ok(value) = &result {
                flight.value = Some(value.clone());
            }
            drop(flight);
            result
        });

        match task.await {
            Ok(result) => result.map(Lookup::Inserted),
            Err(err) => std::panic::resume_unwind(err.into_panic()),
        }
    }
}

impl<V: Clone> Default for ReplyCache<V> {
    fn default() -> Self {
        Self::new(DEFAULT_REPLY_CACHE_CAPACITY)
    }
}

/// Owned by the initializer task. Dropping it retires the in-flight marker,
/// stores the value if there is one, and wakes the waiters.
struct Flight<V> {
    slots: Arc<Mutex<Slots<V>>>,
    key: String,
    value: Option<V>,
    done: watch::Sender<bool>,
}

impl<V> Drop for Flight<V> {
    fn drop(&mut self) {
        {
            let mut slots = self.slots.lock();
            slots.in_flight.remove(&self.key);
            if let Some(value) = self.value.take() {
                if !slots.ready.contains(&self.key) {
                    slots.ready.put(self.key.clone(), value);
                }
            }
        }
        let _ = self.done.send(true);
    }
}
