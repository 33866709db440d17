//! "Run once after N", "run every day at HH:MM" and "run again after a
//! varying gap" on top of tokio tasks.

use chrono::{DateTime, Local, NaiveTime, TimeZone, Timelike};
use cron::Schedule;
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{CoreError, CoreResult};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// --- 1. Keyed one-shot timers ---

struct Slot {
    generation: u64,
    handle: JoinHandle<()>,
}

/// One pending timer per key. A firing timer must claim its slot before it
/// runs, so a timer that was cancelled or replaced never executes its job
/// even if its task already woke up.
pub struct TimerRegistry<K> {
    slots: Arc<Mutex<HashMap<K, Slot>>>,
    next_generation: AtomicU64,
}

impl<K> Default for TimerRegistry<K> {
    fn default() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
        }
    }
}

impl<K: Debug> Debug for TimerRegistry<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slots = lock(&self.slots);
        f.debug_struct("TimerRegistry")
            .field("pending", &slots.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<K> TimerRegistry<K>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms a timer for `key`, replacing any timer already pending for it.
    /// Returns the generation identifying this arming.
    pub fn schedule<F, Fut>(&self, key: K, delay: Duration, job: F) -> u64
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let slots = Arc::clone(&self.slots);
        let task_key = key.clone();

        // Hold the lock until the slot is in place so the task cannot try to
        // claim it first.
        let mut guard = lock(&self.slots);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if claim(&slots, &task_key, generation) {
                job().await;
            } else {
                debug!(key = ?task_key, generation = generation, "Timer superseded; skipping");
            }
        });
        if let Some(previous) = guard.insert(key, Slot { generation, handle }) {
            previous.handle.abort();
        }
        generation
    }

    /// Cancels the timer for `key` only if it is still the one armed as
    /// `generation`.
    pub fn cancel_generation(&self, key: &K, generation: u64) -> bool {
        let mut guard = lock(&self.slots);
        match guard.get(key) {
            Some(slot) if slot.generation == generation => {
                if let Some(slot) = guard.remove(key) {
                    slot.handle.abort();
                }
                true
            }
            _ => false,
        }
    }

    /// Cancels the pending timer for `key`. Returns false when nothing was
    /// pending (already fired, already cancelled, never armed).
    pub fn cancel(&self, key: &K) -> bool {
        match lock(&self.slots).remove(key) {
            Some(slot) => {
                slot.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, key: &K) -> bool {
        lock(&self.slots).contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.slots).len()
    }

    pub fn cancel_all(&self) {
        for (_, slot) in lock(&self.slots).drain() {
            slot.handle.abort();
        }
    }
}

fn claim<K: Eq + Hash>(slots: &Mutex<HashMap<K, Slot>>, key: &K, generation: u64) -> bool {
    let mut guard = lock(slots);
    match guard.get(key) {
        Some(slot) if slot.generation == generation => {
            guard.remove(key);
            true
        }
        _ => false,
    }
}

// --- 2. Named jobs ---

pub fn parse_time_of_day(raw: &str) -> CoreResult<NaiveTime> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .map_err(|_| CoreError::Schedule(format!("expected HH:MM, got '{raw}'")))
}

/// Cron schedule firing every day at `at` (seconds ignored).
pub fn daily_schedule(at: NaiveTime) -> CoreResult<Schedule> {
    let expr = format!("0 {} {} * * *", at.minute(), at.hour());
    Schedule::from_str(&expr).map_err(|e| CoreError::Schedule(format!("{expr}: {e}")))
}

pub fn next_daily_fire<Tz: TimeZone>(schedule: &Schedule, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
    schedule.after(after).next()
}

#[derive(Default)]
pub struct Scheduler {
    once: TimerRegistry<String>,
    recurring: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("once", &self.once)
            .field("recurring", &lock(&self.recurring).keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run_once<F, Fut>(&self, name: impl Into<String>, delay: Duration, job: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        debug!(job = %name, delay_secs = delay.as_secs(), "One-shot job armed");
        self.once.schedule(name, delay, job);
    }

    /// Runs `job` every day at `at` (local time) until cancelled.
    pub fn run_daily<F, Fut>(&self, name: impl Into<String>, at: &str, job: F) -> CoreResult<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let time = parse_time_of_day(at)?;
        let schedule = daily_schedule(time)?;

        let job_name = name.clone();
        let handle = tokio::spawn(async move {
            loop {
                let now = Local::now();
                let Some(next) = next_daily_fire(&schedule, &now) else {
                    warn!(job = %job_name, "Schedule has no upcoming run; stopping");
                    break;
                };
                let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
                debug!(job = %job_name, next = %next, "Daily job waiting");
                tokio::time::sleep(wait).await;
                info!(job = %job_name, "Daily job firing");
                job().await;
            }
        });

        info!(job = %name, at = %time.format("%H:%M"), "Daily job registered");
        if let Some(previous) = lock(&self.recurring).insert(name, handle) {
            previous.abort();
        }
        Ok(())
    }

    /// Runs `job` repeatedly, sleeping `gap()` before each run. The gap is
    /// drawn afresh every time, so callers can randomise it.
    pub fn run_with_gaps<G, F, Fut>(&self, name: impl Into<String>, gap: G, job: F)
    where
        G: Fn() -> Duration + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let job_name = name.clone();
        let handle = tokio::spawn(async move {
            loop {
                let wait = gap();
                debug!(job = %job_name, wait_secs = wait.as_secs(), "Recurring job waiting");
                tokio::time::sleep(wait).await;
                info!(job = %job_name, "Recurring job firing");
                job().await;
            }
        });

        info!(job = %name, "Recurring job registered");
        if let Some(previous) = lock(&self.recurring).insert(name, handle) {
            previous.abort();
        }
    }

    pub fn cancel(&self, name: &str) -> bool {
        let once = self.once.cancel(&name.to_string());
        let recurring = match lock(&self.recurring).remove(name) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        };
        once || recurring
    }

    pub fn shutdown(&self) {
        self.once.cancel_all();
        for (name, handle) in lock(&self.recurring).drain() {
            debug!(job = %name, "Aborting recurring job");
            handle.abort();
        }
    }
}
