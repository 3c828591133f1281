// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Time sources for the sampler.
//!
//! All built-in clocks return seconds on the same monotonic time base, so a
//! timestamp read from one can be compared with a timestamp read from
//! another. A custom [`TimerFunc`] defines its own time base.

use std::rc::Rc;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod timing_thread;

use timing_thread::{TimingThreadError, TimingThreadSubscription};

/// A caller-supplied clock returning seconds.
pub type TimerFunc = Rc<dyn Fn() -> f64>;

/// The strategy used to read the current time while sampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerKind {
    /// The high-resolution monotonic clock.
    Walltime,
    /// A reduced-resolution monotonic clock that is cheaper to read.
    WalltimeCoarse,
    /// A timestamp refreshed by the shared background timing thread.
    WalltimeThread,
    /// A caller-supplied [`TimerFunc`].
    TimerFunc,
}

/// Errors building a [`Timer`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TimerError {
    /// [`TimerKind::TimerFunc`] was requested without a function.
    #[error("the timer_func timer needs a timer function")]
    MissingTimerFunc,
    /// The timing thread was requested while a custom timer function is set.
    #[error("the timing thread cannot be used together with a custom timer function")]
    TimingThreadWithTimerFunc,
    /// Subscribing to the timing thread failed.
    #[error(transparent)]
    TimingThread(#[from] TimingThreadError),
}

/// Picks the timer strategy for a sampling interval.
///
/// A custom timer function always wins, then the timing thread when
/// requested, then the coarse clock when its resolution fits within
/// `interval`, and finally the plain wall clock.
pub fn select_timer_kind(
    interval: Duration,
    use_timing_thread: bool,
    has_timer_func: bool,
) -> Result<TimerKind, TimerError> {
    if has_timer_func {
        if use_timing_thread {
            return Err(TimerError::TimingThreadWithTimerFunc);
        }
        return Ok(TimerKind::TimerFunc);
    }
    if use_timing_thread {
        return Ok(TimerKind::WalltimeThread);
    }
    match walltime_coarse_resolution() {
        Some(resolution) if resolution <= interval.as_secs_f64() => Ok(TimerKind::WalltimeCoarse),
        _ => Ok(TimerKind::Walltime),
    }
}

#[derive(Clone)]
enum Source {
    Walltime,
    Coarse,
    // held for its drop, which ends the subscription
    Thread {
        _subscription: Rc<TimingThreadSubscription>,
    },
    Func(TimerFunc),
}

/// A handle to one time source. Cloning shares the underlying source; a
/// timing-thread subscription ends when the last clone is dropped.
#[derive(Clone)]
pub struct Timer {
    kind: TimerKind,
    source: Source,
}

impl Timer {
    /// Builds a timer of the given kind. `interval` is the refresh interval
    /// requested from the timing thread.
    pub fn new(
        kind: TimerKind,
        interval: Duration,
        timer_func: Option<TimerFunc>,
    ) -> Result<Timer, TimerError> {
        let source = match kind {
            TimerKind::Walltime => Source::Walltime,
            TimerKind::WalltimeCoarse => Source::Coarse,
            TimerKind::WalltimeThread => {
                Source::Thread {
                    _subscription: Rc::new(timing_thread::subscribe(interval)?),
                }
            }
            TimerKind::TimerFunc => Source::Func(timer_func.ok_or(TimerError::MissingTimerFunc)?),
        };
        Ok(Timer { kind, source })
    }

    /// The high-resolution wall clock.
    pub fn walltime() -> Timer {
        Timer {
            kind: TimerKind::Walltime,
            source: Source::Walltime,
        }
    }

    /// A timer backed by `f`.
    pub fn from_func(f: TimerFunc) -> Timer {
        Timer {
            kind: TimerKind::TimerFunc,
            source: Source::Func(f),
        }
    }

    /// The strategy this timer reads.
    pub fn kind(&self) -> TimerKind {
        self.kind
    }

    /// The current time in seconds.
    #[inline]
    pub fn now(&self) -> f64 {
        match &self.source {
            Source::Walltime => walltime(),
            Source::Coarse => walltime_coarse(),
            Source::Thread { .. } => timing_thread::get_time(),
            Source::Func(f) => f(),
        }
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer").field("kind", &self.kind).finish()
    }
}

static EPOCH: LazyLock<Instant> = LazyLock::new(Instant::now);

#[cfg(target_os = "linux")]
fn clock_seconds(clock: libc::clockid_t) -> Option<f64> {
    let mut t = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `t` is a valid timespec for clock_gettime to write into.
    let res = unsafe { libc::clock_gettime(clock, &mut t) };
    (res == 0).then(|| t.tv_sec as f64 + t.tv_nsec as f64 * 1e-9)
}

#[cfg(target_os = "linux")]
fn monotonic() -> Option<f64> {
    clock_seconds(libc::CLOCK_MONOTONIC)
}

#[cfg(not(target_os = "linux"))]
fn monotonic() -> Option<f64> {
    None
}

#[cfg(target_os = "linux")]
fn monotonic_coarse() -> Option<f64> {
    clock_seconds(libc::CLOCK_MONOTONIC_COARSE)
}

#[cfg(not(target_os = "linux"))]
fn monotonic_coarse() -> Option<f64> {
    None
}

#[cfg(target_os = "linux")]
fn monotonic_coarse_resolution() -> Option<f64> {
    let mut res = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `res` is a valid timespec for clock_getres to write into.
    let status = unsafe { libc::clock_getres(libc::CLOCK_MONOTONIC_COARSE, &mut res) };
    (status == 0).then(|| res.tv_sec as f64 + res.tv_nsec as f64 * 1e-9)
}

#[cfg(not(target_os = "linux"))]
fn monotonic_coarse_resolution() -> Option<f64> {
    None
}

/// Seconds on the monotonic clock.
pub fn walltime() -> f64 {
    monotonic().unwrap_or_else(|| EPOCH.elapsed().as_secs_f64())
}

/// Seconds on the coarse monotonic clock, or [`walltime`] where there is
/// none.
pub fn walltime_coarse() -> f64 {
    monotonic_coarse().unwrap_or_else(walltime)
}

static COARSE_RESOLUTION: LazyLock<Option<f64>> = LazyLock::new(monotonic_coarse_resolution);

/// Resolution of the coarse clock in seconds, if this platform has one.
pub fn walltime_coarse_resolution() -> Option<f64> {
    *COARSE_RESOLUTION
}

const OVERHEAD_SAMPLE_CALLS: u32 = 10_000;

fn measure_overhead(clock: fn() -> f64) -> f64 {
    let start = Instant::now();
    for _ in 0..OVERHEAD_SAMPLE_CALLS {
        std::hint::black_box(clock());
    }
    start.elapsed().as_secs_f64() / f64::from(OVERHEAD_SAMPLE_CALLS)
}

static WALLTIME_OVERHEAD: LazyLock<f64> = LazyLock::new(|| measure_overhead(walltime));
static COARSE_OVERHEAD: LazyLock<Option<f64>> =
    LazyLock::new(|| walltime_coarse_resolution().map(|_| measure_overhead(walltime_coarse)));

/// Per-call cost in seconds of reading the clock behind `kind`, measured
/// once per process. Only the wall clocks are measured.
pub fn timer_overhead(kind: TimerKind) -> Option<f64> {
    match kind {
        TimerKind::Walltime => Some(*WALLTIME_OVERHEAD),
        TimerKind::WalltimeCoarse => *COARSE_OVERHEAD,
        TimerKind::WalltimeThread | TimerKind::TimerFunc => None,
    }
}
