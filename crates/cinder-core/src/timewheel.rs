//! Hashed-slot timewheel for deferred tasks.
//!
//! The wheel is a ring of slots; scheduling a task computes the slot
//! and the number of full revolutions from the delay to its deadline.
//! Each tick fires the current slot's zero-revolution tasks and
//! decrements the rest. A task is addressed by its string key:
//! re-scheduling an existing key cancels the old task first, and
//! cancellation is by key alone.
//!
//! Fired jobs run on spawned tasks, isolated from each other — a
//! panicking job is caught and logged, never taking the ticker down.
//! Jobs run without holding the wheel mutex or any keyspace lock; a
//! job that touches the keyspace must re-acquire the key's lock and
//! re-check state before acting.

use std::panic::AssertUnwindSafe;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ahash::AHashMap;
use tracing::warn;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Task {
    revolutions: usize,
    job: Job,
}

struct Wheel {
    slots: Vec<AHashMap<String, Task>>,
    /// task key -> slot index holding it
    timer: AHashMap<String, usize>,
    current: usize,
}

/// The timewheel. One per server, shared by every database.
pub struct TimeWheel {
    tick: Duration,
    inner: Mutex<Wheel>,
}

/// Milliseconds since the unix epoch.
pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl TimeWheel {
    /// Creates a wheel with the given tick interval and slot count.
    pub fn new(tick: Duration, slot_count: usize) -> Self {
        let slot_count = slot_count.max(1);
        Self {
            tick,
            inner: Mutex::new(Wheel {
                slots: (0..slot_count).map(|_| AHashMap::new()).collect(),
                timer: AHashMap::new(),
                current: 0,
            }),
        }
    }

    /// The configured tick interval.
    pub fn tick_interval(&self) -> Duration {
        self.tick
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Wheel> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Schedules `job` to fire at the absolute unix-ms deadline. A task
    /// already registered under `key` is cancelled first.
    pub fn at(&self, deadline_unix_ms: u64, key: &str, job: impl FnOnce() + Send + 'static) {
        let delay_ms = deadline_unix_ms.saturating_sub(now_unix_ms());
        self.schedule_in(Duration::from_millis(delay_ms), key, job);
    }

    /// Schedules `job` to fire after `delay`.
    pub fn schedule_in(&self, delay: Duration, key: &str, job: impl FnOnce() + Send + 'static) {
        let ticks = (delay.as_millis() / self.tick.as_millis().max(1)) as usize;
        let mut wheel = self.lock();
        let slot_count = wheel.slots.len();
        let revolutions = ticks / slot_count;
        // a zero-delay task lands in the current slot and fires on the
        // next tick
        let position = (wheel.current + ticks % slot_count) % slot_count;

        if let Some(old_slot) = wheel.timer.remove(key) {
            wheel.slots[old_slot].remove(key);
        }
        wheel.slots[position].insert(
            key.to_owned(),
            Task {
                revolutions,
                job: Box::new(job),
            },
        );
        wheel.timer.insert(key.to_owned(), position);
    }

    /// Cancels the task registered under `key`, if any.
    pub fn cancel(&self, key: &str) {
        let mut wheel = self.lock();
        if let Some(slot) = wheel.timer.remove(key) {
            wheel.slots[slot].remove(key);
        }
    }

    /// `true` if a task is currently registered under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.lock().timer.contains_key(key)
    }

    /// Advances the wheel one position and fires the due tasks.
    ///
    /// Exposed so tests can drive the wheel deterministically; the
    /// running server calls it from [`TimeWheel::run`].
    pub fn tick_once(&self) {
        let due = {
            let mut wheel = self.lock();
            let current = wheel.current;
            let slot = &mut wheel.slots[current];

            let due_keys: Vec<String> = slot
                .iter()
                .filter(|(_, task)| task.revolutions == 0)
                .map(|(key, _)| key.clone())
                .collect();

            let mut due = Vec::with_capacity(due_keys.len());
            for key in due_keys {
                if let Some(task) = slot.remove(&key) {
                    due.push((key, task.job));
                }
            }
            for task in slot.values_mut() {
                task.revolutions -= 1;
            }

            for (key, _) in &due {
                wheel.timer.remove(key);
            }
            wheel.current = (current + 1) % wheel.slots.len();
            due
        };

        for (key, job) in due {
            tokio::spawn(async move {
                if std::panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    warn!(task = %key, "timewheel task panicked");
                }
            });
        }
    }

    /// Runs the ticker until the returned handle is aborted.
    pub fn run(self: std::sync::Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                self.tick_once();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn wheel(slots: usize) -> TimeWheel {
        TimeWheel::new(Duration::from_millis(100), slots)
    }

    #[tokio::test]
    async fn fires_on_due_tick() {
        let tw = wheel(8);
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        tw.schedule_in(Duration::from_millis(100), "t1", move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        // delay of one tick lands two positions ahead of current
        tw.tick_once();
        tw.tick_once();
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!tw.contains("t1"));
    }

    #[tokio::test]
    async fn revolutions_delay_firing() {
        let tw = wheel(4);
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        // 6 ticks with 4 slots: one full revolution plus two positions
        tw.schedule_in(Duration::from_millis(600), "t", move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..6 {
            tw.tick_once();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tw.tick_once();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_prevents_firing() {
        let tw = wheel(8);
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        tw.schedule_in(Duration::ZERO, "gone", move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert!(tw.contains("gone"));
        tw.cancel("gone");
        assert!(!tw.contains("gone"));

        for _ in 0..9 {
            tw.tick_once();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reschedule_replaces_old_task() {
        let tw = wheel(8);
        let counter = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&counter);
        tw.schedule_in(Duration::ZERO, "k", move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let c = Arc::clone(&counter);
        tw.schedule_in(Duration::ZERO, "k", move || {
            c.fetch_add(10, Ordering::SeqCst);
        });

        for _ in 0..9 {
            tw.tick_once();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        // only the replacement ran
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn panicking_task_does_not_stop_the_wheel() {
        let tw = wheel(4);
        let fired = Arc::new(AtomicUsize::new(0));

        tw.schedule_in(Duration::ZERO, "boom", || panic!("task blew up"));
        let f = Arc::clone(&fired);
        tw.schedule_in(Duration::from_millis(100), "after", move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..5 {
            tw.tick_once();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
