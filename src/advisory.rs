// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! One-time warning about slow timers.
//!
//! When the plain wall clock costs more than [`OVERHEAD_THRESHOLD`] per
//! read, reading it on every frame event skews the profile towards code
//! that makes many calls. The warning is logged at most once per process
//! and can be silenced with `STACK_SAMPLER_IGNORE_OVERHEAD_WARNING=1`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::LazyLock;

use crate::timer::{timer_overhead, walltime_coarse_resolution, TimerKind};

/// Per-read timer cost, in seconds, above which the warning is logged.
pub const OVERHEAD_THRESHOLD: f64 = 300e-9;

const IGNORE_ENV_VAR: &str = "STACK_SAMPLER_IGNORE_OVERHEAD_WARNING";

static IGNORE_OVERHEAD_WARNING: LazyLock<bool> =
    LazyLock::new(|| ignore_flag_set(std::env::var(IGNORE_ENV_VAR).ok().as_deref()));

static HAS_WARNED: AtomicBool = AtomicBool::new(false);

/// Measured timer costs, in seconds per read.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TimerOverheads {
    /// Cost of [`TimerKind::Walltime`].
    pub walltime: Option<f64>,
    /// Cost of [`TimerKind::WalltimeCoarse`], if the platform has it.
    pub walltime_coarse: Option<f64>,
}

impl TimerOverheads {
    /// Measures (once per process) the costs of this platform's clocks.
    pub fn measure() -> TimerOverheads {
        TimerOverheads {
            walltime: timer_overhead(TimerKind::Walltime),
            walltime_coarse: timer_overhead(TimerKind::WalltimeCoarse),
        }
    }
}

/// Builds the warning for sampling with `kind`, or `None` when there is
/// nothing to warn about or not enough data to tell.
pub fn overhead_advisory(
    kind: TimerKind,
    overheads: &TimerOverheads,
    coarse_resolution: Option<f64>,
) -> Option<String> {
    if kind != TimerKind::Walltime {
        return None;
    }
    let overhead = overheads.walltime?;
    if overhead <= OVERHEAD_THRESHOLD {
        return None;
    }

    let mut parts = vec![
        format!(
            "the timer on this system has an overhead of {:.0}ns per read, \
             which is high enough to bias profiling results",
            overhead * 1e9
        ),
        "subscribing with the timing thread enabled reads the time from a shared \
         background thread instead, which is much cheaper"
            .to_owned(),
    ];

    if let (Some(coarse_overhead), Some(resolution)) = (overheads.walltime_coarse, coarse_resolution)
    {
        if coarse_overhead <= OVERHEAD_THRESHOLD {
            parts.push(format!(
                "alternatively, a sampling interval of at least {resolution}s lets the \
                 sampler use the coarse clock, which costs {:.0}ns per read",
                coarse_overhead * 1e9
            ));
        }
    }

    parts.push(format!("set {IGNORE_ENV_VAR}=1 to silence this warning"));
    Some(parts.join(". "))
}

fn ignore_flag_set(value: Option<&str>) -> bool {
    value == Some("1")
}

/// Logs the message built by `advisory` unless `ignore` is set or `latch`
/// shows it was already logged. Returns whether it logged.
fn warn_once(ignore: bool, latch: &AtomicBool, advisory: impl FnOnce() -> Option<String>) -> bool {
    if ignore || latch.load(Ordering::Relaxed) {
        return false;
    }
    let Some(message) = advisory() else {
        return false;
    };
    if latch.swap(true, Ordering::Relaxed) {
        return false;
    }
    tracing::warn!("{message}");
    true
}

/// Logs the overhead warning for `kind` if it applies and hasn't been
/// logged yet. Never fails.
pub(crate) fn check_timing_overhead(kind: TimerKind) {
    if kind != TimerKind::Walltime {
        return;
    }
    warn_once(*IGNORE_OVERHEAD_WARNING, &HAS_WARNED, || {
        overhead_advisory(kind, &TimerOverheads::measure(), walltime_coarse_resolution())
    });
}
