// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The per-thread profiling hook.
//!
//! A runtime integration calls [`profile`] on every frame event. When a
//! [`StatProfile`] is installed on the thread, it watches the async-context
//! marker, records the chain of coroutine returns that precedes a
//! suspension, and forwards an event to its [`HookTarget`] only once every
//! sampling interval. Most events therefore cost one clock read and a
//! comparison.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use crate::context::{ContextId, ContextMarker};
use crate::frame::{encode_frame, Frame};
use crate::timer::Timer;

const DEFAULT_INTERVAL: Duration = Duration::from_millis(1);

/// A frame event reported by the runtime.
///
/// The native-function variants carry the qualified name of the function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event<'a> {
    /// A function is being entered. The frame is the callee's.
    Call,
    /// A function is returning.
    Return,
    /// An exception was raised in the frame.
    Exception,
    /// A native function is about to be called.
    CCall(&'a str),
    /// A native function returned.
    CReturn(&'a str),
    /// A native function raised.
    CException(&'a str),
}

/// The running async context changed between two events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextChange {
    /// The marker value now visible.
    pub new: Option<ContextId>,
    /// The marker value seen at the previous event.
    pub old: Option<ContextId>,
    /// Descriptors of the coroutines that returned just before the change,
    /// innermost first.
    pub await_stack: Vec<String>,
}

/// Receives the events that pass the hook's filters.
pub trait HookTarget {
    /// The async context changed. `frame` is the frame that was running
    /// when the change was seen.
    fn context_changed(&self, frame: &dyn Frame, change: &ContextChange);

    /// A sampling interval has elapsed.
    fn sample(&self, frame: &dyn Frame, event: &Event<'_>);
}

/// The state of the hook installed on one thread.
pub struct StatProfile {
    target: Rc<dyn HookTarget>,
    interval: f64,
    timer: Timer,
    context_marker: Option<Rc<dyn ContextMarker>>,
    last_context_value: Option<ContextId>,
    await_stack: Vec<String>,
    last_invocation: f64,
}

impl StatProfile {
    /// A hook forwarding to `target` at most once per `interval`. A zero
    /// interval means 1ms.
    pub fn new(target: Rc<dyn HookTarget>, interval: Duration, timer: Timer) -> StatProfile {
        let interval = if interval.is_zero() {
            DEFAULT_INTERVAL
        } else {
            interval
        };
        // start the clock now so the first event doesn't sample immediately
        let last_invocation = timer.now();
        StatProfile {
            target,
            interval: interval.as_secs_f64(),
            timer,
            context_marker: None,
            last_context_value: None,
            await_stack: Vec::new(),
            last_invocation,
        }
    }

    /// Tracks `marker` and reports [`ContextChange`]s to the target.
    pub fn with_context_marker(mut self, marker: Rc<dyn ContextMarker>) -> StatProfile {
        self.last_context_value = marker.get();
        self.context_marker = Some(marker);
        self
    }

    fn on_event(&mut self, frame: &dyn Frame, event: &Event<'_>) -> Option<Pending> {
        let now = self.timer.now();

        let mut context_change = None;
        if let Some(marker) = &self.context_marker {
            let value = marker.get();
            if value != self.last_context_value {
                context_change = Some(ContextChange {
                    new: value,
                    old: self.last_context_value,
                    await_stack: self.await_stack.clone(),
                });
                self.last_context_value = value;
            }

            if *event == Event::Return && frame.is_coroutine() {
                self.await_stack.push(encode_frame(frame));
            } else {
                self.await_stack.clear();
            }
        }

        let sample = now >= self.last_invocation + self.interval;
        if sample {
            self.last_invocation = now;
        }

        (sample || context_change.is_some()).then(|| Pending {
            target: self.target.clone(),
            context_change,
            sample,
        })
    }
}

impl fmt::Debug for StatProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatProfile")
            .field("interval", &self.interval)
            .field("timer", &self.timer)
            .field("tracks_context", &self.context_marker.is_some())
            .field("last_invocation", &self.last_invocation)
            .finish()
    }
}

struct Pending {
    target: Rc<dyn HookTarget>,
    context_change: Option<ContextChange>,
    sample: bool,
}

thread_local! {
    static STAT_PROFILE: RefCell<Option<StatProfile>> = const { RefCell::new(None) };
}

/// Installs `profile` as this thread's hook.
///
/// There is one hook per thread: installing replaces whatever was installed
/// before, whoever installed it.
pub fn set_stat_profile(profile: StatProfile) {
    // dropped outside the slot borrow; its timer may need to unsubscribe
    let previous = STAT_PROFILE.replace(Some(profile));
    drop(previous);
}

/// Removes this thread's hook. Returns whether one was installed.
pub fn clear_stat_profile() -> bool {
    STAT_PROFILE.replace(None).is_some()
}

/// Whether a hook is installed on this thread.
pub fn is_installed() -> bool {
    STAT_PROFILE.with_borrow(Option::is_some)
}

/// Reports a frame event to this thread's hook. Does nothing when no hook
/// is installed.
///
/// Targets run after the hook state is released, so they may install or
/// clear the hook themselves.
pub fn profile(frame: &dyn Frame, event: Event<'_>) {
    let pending = STAT_PROFILE.with_borrow_mut(|slot| {
        slot.as_mut()
            .and_then(|profile| profile.on_event(frame, &event))
    });
    let Some(pending) = pending else {
        return;
    };

    if let Some(change) = &pending.context_change {
        // on a call the callee hasn't run yet, so the change happened in
        // the caller
        let change_frame = match (event, frame.back()) {
            (Event::Call, Some(parent)) => parent,
            _ => frame,
        };
        pending.target.context_changed(change_frame, change);
    }

    if pending.sample {
        pending.target.sample(frame, &event);
    }
}
