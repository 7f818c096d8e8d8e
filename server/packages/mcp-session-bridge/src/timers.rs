//! Keyed timers with cancel-and-replace semantics.
//!
//! Every session owns one [`TimerSet`]; idle and lifetime eviction, request timeouts,
//! progress heartbeats and delayed notifications are all entries in it.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKey {
    Idle,
    Lifetime,
    RequestTimeout(String),
    Heartbeat(String),
    ToolsChanged,
}

#[derive(Debug)]
struct Armed {
    generation: u64,
    handle: AbortHandle,
}

#[derive(Debug)]
struct TimerTable<K> {
    next_generation: u64,
    armed: HashMap<K, Armed>,
}

#[derive(Debug)]
pub struct TimerSet<K> {
    table: Arc<Mutex<TimerTable<K>>>,
}

impl<K> Default for TimerSet<K> {
    fn default() -> Self {
        Self {
            table: Arc::new(Mutex::new(TimerTable {
                next_generation: 0,
                armed: HashMap::new(),
            })),
        }
    }
}

impl<K> TimerSet<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `fire` once after `delay`, replacing any timer already armed under `key`.
    ///
    /// The entry is disarmed before `fire` starts, so `fire` may re-arm the same key.
    pub fn once<F>(&self, key: K, delay: Duration, fire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut table = lock(&self.table);
        let generation = table.bump();
        let shared = self.table.clone();
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !disarm(&shared, &task_key, generation) {
                return;
            }
            fire.await;
        })
        .abort_handle();
        table.replace(key, Armed { generation, handle });
    }

    /// Calls `tick` every `period` (first call after one full period) with a counter starting
    /// at 1, until the timer is cancelled or `tick` returns `false`.
    pub fn every<F, Fut>(&self, key: K, period: Duration, mut tick: F)
    where
        F: FnMut(u64) -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let mut table = lock(&self.table);
        let generation = table.bump();
        let shared = self.table.clone();
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut count = 0u64;
            loop {
                interval.tick().await;
                count += 1;
                if !tick(count).await {
                    disarm(&shared, &task_key, generation);
                    return;
                }
            }
        })
        .abort_handle();
        table.replace(key, Armed { generation, handle });
    }

    /// Cancels the timer under `key`. Returns whether one was armed.
    pub fn cancel(&self, key: &K) -> bool {
        match lock(&self.table).armed.remove(key) {
            Some(armed) => {
                armed.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let drained = lock(&self.table).armed.drain().collect::<Vec<_>>();
        let count = drained.len();
        for (_, armed) in drained {
            armed.handle.abort();
        }
        count
    }

    pub fn is_armed(&self, key: &K) -> bool {
        lock(&self.table).armed.contains_key(key)
    }

    pub fn len(&self) -> usize {
        lock(&self.table).armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K> Drop for TimerSet<K> {
    fn drop(&mut self) {
        for (_, armed) in lock(&self.table).armed.drain() {
            armed.handle.abort();
        }
    }
}

impl<K: Eq + Hash> TimerTable<K> {
    fn bump(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn replace(&mut self, key: K, armed: Armed) {
        if let Some(previous) = self.armed.insert(key, armed) {
            previous.handle.abort();
        }
    }
}

/// Removes the entry only if it still belongs to `generation`; a replacement keeps running.
fn disarm<K: Eq + Hash>(table: &Mutex<TimerTable<K>>, key: &K, generation: u64) -> bool {
    let mut table = lock(table);
    match table.armed.get(key) {
        Some(armed) if armed.generation == generation => {
            table.armed.remove(key);
            true
        }
        _ => false,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn once_fires_after_delay_and_disarms() {
        let timers = TimerSet::new();
        let fired = Arc::new(AtomicU64::new(0));
        let counter = fired.clone();
        timers.once(TimerKey::Idle, Duration::from_secs(5), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(timers.is_armed(&TimerKey::Idle));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timers.is_armed(&TimerKey::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn replacing_a_key_postpones_the_deadline() {
        let timers = TimerSet::new();
        let fired = Arc::new(AtomicU64::new(0));

        for _ in 0..3 {
            let counter = fired.clone();
            timers.once(TimerKey::Idle, Duration::from_secs(10), async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_secs(6)).await;
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let timers = TimerSet::new();
        let fired = Arc::new(AtomicU64::new(0));
        let counter = fired.clone();
        timers.once(
            TimerKey::RequestTimeout("1".to_string()),
            Duration::from_secs(1),
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );

        assert!(timers.cancel(&TimerKey::RequestTimeout("1".to_string())));
        assert!(!timers.cancel(&TimerKey::RequestTimeout("1".to_string())));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn every_counts_up_until_cancelled() {
        let timers = TimerSet::new();
        let seen = Arc::new(AtomicU64::new(0));
        let last = seen.clone();
        timers.every(
            TimerKey::Heartbeat("7".to_string()),
            Duration::from_secs(10),
            move |count| {
                let last = last.clone();
                async move {
                    last.store(count, Ordering::SeqCst);
                    true
                }
            },
        );

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 3);

        timers.cancel(&TimerKey::Heartbeat("7".to_string()));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn every_stops_when_tick_returns_false() {
        let timers = TimerSet::new();
        timers.every(TimerKey::ToolsChanged, Duration::from_secs(1), |count| async move {
            count < 2
        });

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert!(timers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_disarms_everything() {
        let timers = TimerSet::new();
        let fired = Arc::new(AtomicU64::new(0));
        for key in [TimerKey::Idle, TimerKey::Lifetime] {
            let counter = fired.clone();
            timers.once(key, Duration::from_secs(1), async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert_eq!(timers.cancel_all(), 2);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
