//! Backoff Scheduler
//!
//! Keyed one-shot timers. At most one timer is pending per key; scheduling
//! again replaces it. Each timer carries a generation so a fire that raced
//! with cancellation can be recognised and discarded by the owner.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Notification delivered when a timer elapses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerFired<K> {
    /// Timer key.
    pub key: K,
    /// Generation the timer was scheduled with.
    pub generation: u64,
}

#[derive(Debug)]
struct Pending {
    generation: u64,
    task: JoinHandle<()>,
}

/// Keyed, cancellable, replace-on-reschedule timers.
#[derive(Debug)]
pub struct BackoffScheduler<K: Eq + Hash> {
    timers: HashMap<K, Pending>,
    next_generation: u64,
}

impl<K: Eq + Hash> Default for BackoffScheduler<K> {
    fn default() -> Self {
        Self {
            timers: HashMap::new(),
            next_generation: 0,
        }
    }
}

impl<K> BackoffScheduler<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    /// Create an empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `fire` to run after `delay`, replacing any timer pending for `key`.
    ///
    /// Returns the generation of the new timer. Must be called within a tokio runtime.
    pub fn schedule<F>(&mut self, key: K, delay: Duration, fire: F) -> u64
    where
        F: FnOnce(TimerFired<K>) + Send + 'static,
    {
        self.cancel(&key);

        self.next_generation += 1;
        let generation = self.next_generation;
        let fired = TimerFired {
            key: key.clone(),
            generation,
        };
        let deadline = Instant::now() + delay;
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            fire(fired);
        });

        self.timers.insert(key, Pending { generation, task });
        generation
    }

    /// Cancel the timer for `key`. Returns whether one was pending.
    pub fn cancel(&mut self, key: &K) -> bool {
        self.timers.remove(key).is_some_and(|pending| {
            pending.task.abort();
            true
        })
    }

    /// Cancel every pending timer.
    pub fn cancel_all(&mut self) {
        for (_, pending) in self.timers.drain() {
            pending.task.abort();
        }
    }

    /// Accept a fire notification.
    ///
    /// Returns `true` and forgets the timer if the notification belongs to the
    /// currently pending timer for its key; `false` if it is stale.
    pub fn acknowledge(&mut self, fired: &TimerFired<K>) -> bool {
        match self.timers.get(&fired.key) {
            Some(pending) if pending.generation == fired.generation => {
                self.timers.remove(&fired.key);
                true
            }
            _ => false,
        }
    }

    /// Whether a timer is pending for `key`.
    #[must_use]
    pub fn is_pending(&self, key: &K) -> bool {
        self.timers.contains_key(key)
    }

    /// Number of pending timers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.timers.len()
    }

    /// Whether no timer is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

impl<K: Eq + Hash> Drop for BackoffScheduler<K> {
    fn drop(&mut self) {
        for (_, pending) in self.timers.drain() {
            pending.task.abort();
        }
    }
}
