// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! A process-wide background thread that refreshes a shared timestamp.
//!
//! Reading an atomic is cheaper than a clock syscall on systems with slow
//! timers, so threads that sample often can subscribe here and read
//! [`get_time`] instead. The thread runs while at least one subscription is
//! alive and refreshes the timestamp at the smallest subscribed interval.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, LazyLock, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;

use super::walltime;

const MAX_SUBSCRIBERS: usize = 1000;
const IDLE_INTERVAL: Duration = Duration::from_secs(1);

/// Errors from the timing thread.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TimingThreadError {
    /// Every subscriber id is in use.
    #[error("too many timing thread subscribers (max {MAX_SUBSCRIBERS})")]
    TooManySubscribers,
    /// The id passed to unsubscribe is not subscribed.
    #[error("not subscribed to the timing thread")]
    NotSubscribed,
    /// The background thread could not be started.
    #[error("unable to spawn the timing thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy)]
struct Subscription {
    id: usize,
    interval: Duration,
}

#[derive(Debug, Default)]
struct State {
    subscribers: Vec<Subscription>,
    // bumped every time the refresh loop publishes a timestamp
    generation: u64,
    // identifies the current run of the thread, so a run that was told to
    // stop never keeps going after a new one started
    run: u64,
    alive: bool,
    handle: Option<JoinHandle<()>>,
}

impl State {
    fn interval(&self) -> Option<Duration> {
        self.subscribers.iter().map(|s| s.interval).min()
    }
}

struct Shared {
    state: Mutex<State>,
    // wakes the refresh loop early when the subscriber set changes
    wake: Condvar,
    // signalled by the refresh loop after each published timestamp
    published: Condvar,
    // f64 bits
    current_time: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn store_time(&self, now: f64) {
        self.current_time.store(now.to_bits(), Ordering::Release);
    }
}

static TIMING_THREAD: LazyLock<Shared> = LazyLock::new(|| Shared {
    state: Mutex::new(State::default()),
    wake: Condvar::new(),
    published: Condvar::new(),
    current_time: AtomicU64::new(0f64.to_bits()),
});

fn refresh_loop(shared: &'static Shared, run: u64) {
    let mut state = shared.lock();
    while state.alive && state.run == run {
        shared.store_time(walltime());
        state.generation += 1;
        shared.published.notify_all();

        let interval = state.interval().unwrap_or(IDLE_INTERVAL);
        state = shared
            .wake
            .wait_timeout(state, interval)
            .unwrap_or_else(PoisonError::into_inner)
            .0;
    }
}

/// A live subscription to the timing thread. Dropping it unsubscribes.
#[derive(Debug)]
pub struct TimingThreadSubscription {
    id: usize,
}

impl TimingThreadSubscription {
    /// The id of this subscription.
    pub fn id(&self) -> usize {
        self.id
    }
}

impl Drop for TimingThreadSubscription {
    fn drop(&mut self) {
        if let Err(err) = unsubscribe(self.id) {
            tracing::warn!(?err, id = self.id, "unable to unsubscribe from the timing thread");
        }
    }
}

/// Subscribes to the timing thread, starting it if needed, and asks for the
/// timestamp to be refreshed at least every `interval`.
///
/// Blocks until the thread has published a timestamp taken after this call,
/// so [`get_time`] never returns a value older than the subscription.
pub fn subscribe(interval: Duration) -> Result<TimingThreadSubscription, TimingThreadError> {
    let shared: &'static Shared = &TIMING_THREAD;
    let mut state = shared.lock();

    let id = (0..MAX_SUBSCRIBERS)
        .find(|id| !state.subscribers.iter().any(|s| s.id == *id))
        .ok_or(TimingThreadError::TooManySubscribers)?;

    if !state.alive {
        state.run += 1;
        let run = state.run;
        shared.store_time(walltime());
        let handle = thread::Builder::new()
            .name("stack-sampler-timing".into())
            .spawn(move || refresh_loop(shared, run))?;
        state.alive = true;
        state.handle = Some(handle);
        tracing::debug!(run, "timing thread started");
    }

    state.subscribers.push(Subscription { id, interval });

    let target = state.generation + 1;
    shared.wake.notify_all();
    while state.generation < target {
        state = shared
            .published
            .wait(state)
            .unwrap_or_else(PoisonError::into_inner);
    }

    Ok(TimingThreadSubscription { id })
}

/// Removes subscription `id`. Removing the last subscription stops the
/// thread and waits for it to exit.
pub fn unsubscribe(id: usize) -> Result<(), TimingThreadError> {
    let shared: &'static Shared = &TIMING_THREAD;
    let mut state = shared.lock();

    let index = state
        .subscribers
        .iter()
        .position(|s| s.id == id)
        .ok_or(TimingThreadError::NotSubscribed)?;
    state.subscribers.swap_remove(index);

    let handle = if state.subscribers.is_empty() {
        state.alive = false;
        state.handle.take()
    } else {
        None
    };
    shared.wake.notify_all();
    drop(state);

    if let Some(handle) = handle {
        if handle.join().is_err() {
            tracing::warn!("timing thread panicked");
        }
        tracing::debug!("timing thread stopped");
    }
    Ok(())
}

// Tests that start, fill or stop the thread hold this, since the thread is
// shared by every test in the process.
#[cfg(test)]
static TEST_LOCK: Mutex<()> = Mutex::new(());

#[cfg(test)]
pub(crate) fn exclusive() -> MutexGuard<'static, ()> {
    TEST_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The most recently published timestamp, in seconds.
pub fn get_time() -> f64 {
    f64::from_bits(TIMING_THREAD.current_time.load(Ordering::Acquire))
}

/// The refresh interval in use, or `None` when the thread is not running.
pub fn get_interval() -> Option<Duration> {
    let state = TIMING_THREAD.lock();
    if state.alive {
        state.interval()
    } else {
        None
    }
}
