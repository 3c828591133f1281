// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The per-thread stack sampler.
//!
//! Each thread has one [`StackSampler`], reached through
//! [`StackSampler::current`]. Any number of targets can subscribe to it, each
//! with the interval it would like to be sampled at. The sampler installs
//! the thread's hook at the smallest of those intervals and hands every
//! sample to every subscriber, so several profilers can share one hook.
//!
//! ```
//! use std::rc::Rc;
//! use std::time::Duration;
//!
//! use stack_sampler::{AsyncState, SampleTarget, StackSampler, SubscribeOptions};
//!
//! # fn main() -> Result<(), stack_sampler::SamplerError> {
//! let target: Rc<dyn SampleTarget> =
//!     Rc::new(|stack: &[String], elapsed: f64, _: Option<&AsyncState>| {
//!         println!("{elapsed:.4}s in {:?}", stack.last());
//!     });
//!
//! let sampler = StackSampler::current();
//! sampler.subscribe(target.clone(), SubscribeOptions::new(Duration::from_millis(1)))?;
//! // ... the runtime reports frame events through `stack_sampler::profile` ...
//! sampler.unsubscribe(&target)?;
//! # Ok(())
//! # }
//! ```

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;

use thiserror::Error;

use crate::advisory::check_timing_overhead;
use crate::context::{ContextMarker, TaskLocalMarker};
use crate::frame::Frame;
use crate::hook::{
    clear_stat_profile, set_stat_profile, ContextChange, Event, HookTarget, StatProfile,
};
use crate::timer::{select_timer_kind, Timer, TimerError, TimerFunc, TimerKind};

mod call_stack;
mod subscriber;

pub use call_stack::build_call_stack;
pub use subscriber::{AsyncState, SampleTarget};

use subscriber::Subscriber;

/// Errors from [`StackSampler`] operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SamplerError {
    /// An async-bound subscriber already owns the running async context.
    #[error("there is already a profiler running in this async context")]
    AlreadyActiveInContext,
    /// The target passed to unsubscribe is not subscribed.
    #[error("the target is not subscribed to this thread's sampler")]
    SubscriberNotFound,
    /// Subscribers asked both for and against the timing thread.
    #[error("subscribers disagree on whether to use the timing thread")]
    ConflictingTimingThreadPreference,
    /// A zero sampling interval was requested.
    #[error("the sampling interval must be greater than zero")]
    InvalidInterval,
    /// The operation is only allowed while nothing is subscribed.
    #[error("cannot change the sampler configuration while targets are subscribed")]
    SamplingActive,
    /// The timer for the new configuration could not be built.
    #[error(transparent)]
    Timer(#[from] TimerError),
}

/// How a target wants to be sampled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOptions {
    interval: Duration,
    use_timing_thread: Option<bool>,
    use_async_context: bool,
}

impl SubscribeOptions {
    /// Options for sampling every `interval`, with no timing thread
    /// preference and not bound to an async context.
    pub fn new(interval: Duration) -> SubscribeOptions {
        SubscribeOptions {
            interval,
            use_timing_thread: None,
            use_async_context: false,
        }
    }

    /// Asks for (or against) the shared timing thread. All subscribers that
    /// express a preference on a thread must agree.
    pub fn with_timing_thread(mut self, use_timing_thread: bool) -> SubscribeOptions {
        self.use_timing_thread = Some(use_timing_thread);
        self
    }

    /// Binds the subscriber to the running async context, so its samples
    /// carry an [`AsyncState`]. Only one subscriber can be bound to a given
    /// context at a time.
    pub fn with_async_context(mut self, use_async_context: bool) -> SubscribeOptions {
        self.use_async_context = use_async_context;
        self
    }

    /// The requested sampling interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

struct SamplerState {
    subscribers: Vec<Subscriber>,
    current_sampling_interval: Option<Duration>,
    current_timer: Option<Timer>,
    last_profile_time: Option<f64>,
    timer_func: Option<TimerFunc>,
    context_marker: Rc<dyn ContextMarker>,
}

/// Handle to a thread's stack sampler. Clones refer to the same sampler.
#[derive(Clone)]
pub struct StackSampler {
    inner: Rc<RefCell<SamplerState>>,
}

thread_local! {
    static STACK_SAMPLER: StackSampler = StackSampler::new();
}

impl StackSampler {
    fn new() -> StackSampler {
        StackSampler {
            inner: Rc::new(RefCell::new(SamplerState {
                subscribers: Vec::new(),
                current_sampling_interval: None,
                current_timer: None,
                last_profile_time: None,
                timer_func: None,
                context_marker: Rc::new(TaskLocalMarker),
            })),
        }
    }

    /// This thread's sampler, created on first use.
    pub fn current() -> StackSampler {
        STACK_SAMPLER.with(StackSampler::clone)
    }

    /// Starts delivering samples to `target`.
    ///
    /// Fails without changing anything if the options conflict with the
    /// current subscribers or the configured timer.
    pub fn subscribe(
        &self,
        target: Rc<dyn SampleTarget>,
        options: SubscribeOptions,
    ) -> Result<(), SamplerError> {
        if options.interval.is_zero() {
            return Err(SamplerError::InvalidInterval);
        }

        let mut state = self.inner.borrow_mut();
        if options.use_async_context && state.context_marker.get().is_some() {
            return Err(SamplerError::AlreadyActiveInContext);
        }

        let subscriber = Subscriber::new(
            target,
            options.interval,
            options.use_timing_thread,
            options.use_async_context,
        );
        if options.use_async_context {
            state.context_marker.set(Some(subscriber.id));
        }
        state.subscribers.push(subscriber);

        if let Err(err) = self.update(&mut state) {
            state.subscribers.pop();
            if options.use_async_context {
                state.context_marker.set(None);
            }
            return Err(err);
        }
        Ok(())
    }

    /// Stops delivering samples to `target`. Targets are matched by
    /// identity, so pass the same `Rc` (or a clone of it) that was
    /// subscribed.
    ///
    /// Fails without changing anything if the timer for the remaining
    /// subscribers can't be built.
    pub fn unsubscribe(&self, target: &Rc<dyn SampleTarget>) -> Result<(), SamplerError> {
        let mut state = self.inner.borrow_mut();
        let index = state
            .subscribers
            .iter()
            .position(|s| s.is_target(target))
            .ok_or(SamplerError::SubscriberNotFound)?;

        let subscriber = state.subscribers.remove(index);
        let marker = state.context_marker.get();
        if subscriber.bound_to_async_context {
            // subscribe checked the marker was empty before claiming it
            state.context_marker.set(None);
        }

        if let Err(err) = self.update(&mut state) {
            state.subscribers.insert(index, subscriber);
            state.context_marker.set(marker);
            return Err(err);
        }
        Ok(())
    }

    /// Replaces the clock used for sampling. `None` goes back to the
    /// built-in clocks.
    pub fn set_timer_func(&self, timer_func: Option<TimerFunc>) -> Result<(), SamplerError> {
        let mut state = self.inner.borrow_mut();
        if !state.subscribers.is_empty() {
            return Err(SamplerError::SamplingActive);
        }
        state.timer_func = timer_func;
        Ok(())
    }

    /// Replaces the async-context marker, for runtimes that track tasks
    /// some other way than [`TaskLocalMarker`].
    pub fn set_context_marker(&self, marker: Rc<dyn ContextMarker>) -> Result<(), SamplerError> {
        let mut state = self.inner.borrow_mut();
        if !state.subscribers.is_empty() {
            return Err(SamplerError::SamplingActive);
        }
        state.context_marker = marker;
        Ok(())
    }

    /// The interval the hook is installed with, if sampling.
    pub fn current_sampling_interval(&self) -> Option<Duration> {
        self.inner.borrow().current_sampling_interval
    }

    /// The timer strategy in use, if sampling.
    pub fn current_timer_kind(&self) -> Option<TimerKind> {
        self.inner.borrow().current_timer.as_ref().map(Timer::kind)
    }

    /// Number of subscribed targets.
    pub fn subscriber_count(&self) -> usize {
        self.inner.borrow().subscribers.len()
    }

    /// Whether the hook is installed by this sampler.
    pub fn is_sampling(&self) -> bool {
        self.inner.borrow().current_sampling_interval.is_some()
    }

    fn update(&self, state: &mut SamplerState) -> Result<(), SamplerError> {
        let Some(min_interval) = state.subscribers.iter().map(|s| s.desired_interval).min() else {
            self.stop_sampling(state);
            return Ok(());
        };

        let mut preferences = state.subscribers.iter().filter_map(|s| s.use_timing_thread);
        let use_timing_thread = match preferences.next() {
            Some(first) if preferences.any(|p| p != first) => {
                return Err(SamplerError::ConflictingTimingThreadPreference)
            }
            Some(first) => first,
            None => false,
        };

        let kind = select_timer_kind(min_interval, use_timing_thread, state.timer_func.is_some())?;
        let current_kind = state.current_timer.as_ref().map(Timer::kind);
        if state.current_sampling_interval != Some(min_interval) || current_kind != Some(kind) {
            self.start_sampling(state, min_interval, kind)?;
        }
        Ok(())
    }

    fn start_sampling(
        &self,
        state: &mut SamplerState,
        interval: Duration,
        kind: TimerKind,
    ) -> Result<(), SamplerError> {
        check_timing_overhead(kind);
        let timer = Timer::new(kind, interval, state.timer_func.clone())?;

        if state.last_profile_time.is_none() {
            state.last_profile_time = Some(timer.now());
        }

        let hook = Rc::new(SamplerHook(Rc::downgrade(&self.inner)));
        set_stat_profile(
            StatProfile::new(hook, interval, timer.clone())
                .with_context_marker(state.context_marker.clone()),
        );

        state.current_sampling_interval = Some(interval);
        state.current_timer = Some(timer);
        tracing::debug!(
            ?interval,
            ?kind,
            subscribers = state.subscribers.len(),
            "sampling hook installed"
        );
        Ok(())
    }

    fn stop_sampling(&self, state: &mut SamplerState) {
        if state.current_sampling_interval.take().is_some() {
            clear_stat_profile();
            tracing::debug!("sampling hook removed");
        }
        state.current_timer = None;
        state.last_profile_time = None;
    }
}

impl fmt::Debug for StackSampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_borrow() {
            Ok(state) => f
                .debug_struct("StackSampler")
                .field("subscribers", &state.subscribers.len())
                .field("current_sampling_interval", &state.current_sampling_interval)
                .field("current_timer", &state.current_timer)
                .field("last_profile_time", &state.last_profile_time)
                .finish(),
            Err(_) => f.debug_struct("StackSampler").finish_non_exhaustive(),
        }
    }
}

// The installed hook only holds a weak reference, so the slot never keeps a
// sampler alive after its thread-local is gone.
struct SamplerHook(Weak<RefCell<SamplerState>>);

impl HookTarget for SamplerHook {
    fn context_changed(&self, frame: &dyn Frame, change: &ContextChange) {
        let Some(inner) = self.0.upgrade() else {
            return;
        };
        // events raised while the sampler itself is being updated are dropped
        let Ok(mut state) = inner.try_borrow_mut() else {
            return;
        };

        for subscriber in state.subscribers.iter_mut() {
            if !subscriber.bound_to_async_context {
                continue;
            }
            if change.old == Some(subscriber.id) {
                let mut stack = build_call_stack(Some(frame), None);
                let async_state = if change.await_stack.is_empty() {
                    AsyncState::OutOfContextUnknown(stack)
                } else {
                    // recorded innermost first
                    stack.extend(change.await_stack.iter().rev().cloned());
                    AsyncState::OutOfContextAwaited(stack)
                };
                subscriber.async_state = Some(Rc::new(async_state));
            } else if change.new == Some(subscriber.id) {
                subscriber.async_state = Some(Rc::new(AsyncState::InContext));
            }
        }
    }

    fn sample(&self, frame: &dyn Frame, event: &Event<'_>) {
        let Some(inner) = self.0.upgrade() else {
            return;
        };

        let (now, elapsed, call_stack, deliveries) = {
            let Ok(state) = inner.try_borrow() else {
                return;
            };
            let Some(timer) = &state.current_timer else {
                return;
            };
            let now = timer.now();
            let elapsed = now - state.last_profile_time.unwrap_or(now);
            let call_stack = build_call_stack(Some(frame), Some(event));
            let deliveries: Vec<_> = state
                .subscribers
                .iter()
                .map(|s| (s.target.clone(), s.async_state.clone()))
                .collect();
            (now, elapsed, call_stack, deliveries)
        };

        // targets may subscribe or unsubscribe from here
        for (target, async_state) in &deliveries {
            target.sample(&call_stack, elapsed, async_state.as_deref());
        }

        let Ok(mut state) = inner.try_borrow_mut() else {
            return;
        };
        if state.current_sampling_interval.is_some() {
            state.last_profile_time = Some(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::context::with_context;
    use crate::frame::encode_frame;
    use crate::hook::{is_installed, profile};
    use crate::testing::{ManualClock, Recorder, SimFrame};
    use crate::timer::timing_thread;

    // timestamps on a 1/512s grid so the arithmetic is exact
    const TICK: f64 = 1.0 / 512.0;
    const TICK_NANOS: u64 = 1_953_125;

    fn ticks(n: u32) -> Duration {
        Duration::from_nanos(u64::from(n) * TICK_NANOS)
    }

    fn at(n: u32) -> f64 {
        f64::from(n) * TICK
    }

    fn sampler_with_clock() -> (StackSampler, ManualClock) {
        let sampler = StackSampler::current();
        let clock = ManualClock::default();
        sampler.set_timer_func(Some(clock.timer_func())).unwrap();
        (sampler, clock)
    }

    fn millis(ms: u64) -> SubscribeOptions {
        SubscribeOptions::new(Duration::from_millis(ms))
    }

    #[test]
    fn test_installed_interval_is_minimum() {
        let (sampler, _clock) = sampler_with_clock();
        let fast = Recorder::new().target();
        let slow = Recorder::new().target();

        sampler.subscribe(slow.clone(), millis(50)).unwrap();
        assert_eq!(sampler.current_sampling_interval(), Some(Duration::from_millis(50)));
        sampler.subscribe(fast.clone(), millis(10)).unwrap();
        assert_eq!(sampler.current_sampling_interval(), Some(Duration::from_millis(10)));
        assert_eq!(sampler.subscriber_count(), 2);

        sampler.unsubscribe(&fast).unwrap();
        assert_eq!(sampler.current_sampling_interval(), Some(Duration::from_millis(50)));

        sampler.unsubscribe(&slow).unwrap();
        assert_eq!(sampler.current_sampling_interval(), None);
        assert_eq!(sampler.current_timer_kind(), None);
        assert!(!sampler.is_sampling());
        assert!(!is_installed());
    }

    #[test]
    fn test_no_samples_after_last_unsubscribe() {
        let (sampler, clock) = sampler_with_clock();
        let recorder = Recorder::new();
        let frame = SimFrame::new("work", "w.py", 1);

        sampler.subscribe(recorder.target(), millis(1)).unwrap();
        clock.set(1.0);
        profile(&*frame, Event::Return);
        assert_eq!(recorder.len(), 1);

        sampler.unsubscribe(&recorder.target()).unwrap();
        for _ in 0..10 {
            clock.advance(1.0);
            profile(&*frame, Event::Return);
        }
        assert_eq!(recorder.len(), 1);
    }

    #[test]
    fn test_double_unsubscribe() {
        let (sampler, _clock) = sampler_with_clock();
        let target = Recorder::new().target();
        sampler.subscribe(target.clone(), millis(1)).unwrap();
        sampler.unsubscribe(&target).unwrap();
        assert!(matches!(
            sampler.unsubscribe(&target),
            Err(SamplerError::SubscriberNotFound)
        ));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let (sampler, _clock) = sampler_with_clock();
        assert!(matches!(
            sampler.subscribe(Recorder::new().target(), SubscribeOptions::new(Duration::ZERO)),
            Err(SamplerError::InvalidInterval)
        ));
        assert_eq!(sampler.subscriber_count(), 0);
    }

    #[test]
    fn test_conflicting_timing_thread_preference_rolls_back() {
        let sampler = StackSampler::current();
        let first = Recorder::new().target();
        let second = Recorder::new().target();

        sampler
            .subscribe(first.clone(), millis(10).with_timing_thread(false))
            .unwrap();
        let err = sampler
            .subscribe(
                second.clone(),
                millis(1).with_timing_thread(true).with_async_context(true),
            )
            .unwrap_err();
        assert!(matches!(err, SamplerError::ConflictingTimingThreadPreference));

        assert_eq!(sampler.subscriber_count(), 1);
        assert_eq!(sampler.current_sampling_interval(), Some(Duration::from_millis(10)));
        assert_eq!(TaskLocalMarker.get(), None);
        assert!(matches!(
            sampler.unsubscribe(&second),
            Err(SamplerError::SubscriberNotFound)
        ));
        sampler.unsubscribe(&first).unwrap();
    }

    #[test]
    fn test_timing_thread_rejected_with_timer_func() {
        let (sampler, _clock) = sampler_with_clock();
        let err = sampler
            .subscribe(Recorder::new().target(), millis(1).with_timing_thread(true))
            .unwrap_err();
        assert!(matches!(
            err,
            SamplerError::Timer(TimerError::TimingThreadWithTimerFunc)
        ));
        assert_eq!(sampler.subscriber_count(), 0);
        assert!(!is_installed());
    }

    #[test]
    fn test_one_async_subscriber_per_context() {
        let (sampler, _clock) = sampler_with_clock();
        let first = Recorder::new();
        let second = Recorder::new();
        let bound = millis(1).with_async_context(true);

        sampler.subscribe(first.target(), bound).unwrap();
        assert!(TaskLocalMarker.get().is_some());
        assert!(matches!(
            sampler.subscribe(second.target(), bound),
            Err(SamplerError::AlreadyActiveInContext)
        ));
        assert_eq!(sampler.subscriber_count(), 1);

        // another context is free to bind its own
        with_context(None, || sampler.subscribe(second.target(), bound)).unwrap();
        assert_eq!(sampler.subscriber_count(), 2);

        sampler.unsubscribe(&first.target()).unwrap();
        assert_eq!(TaskLocalMarker.get(), None);
    }

    #[test]
    fn test_configuration_locked_while_subscribed() {
        let (sampler, clock) = sampler_with_clock();
        let target = Recorder::new().target();
        sampler.subscribe(target.clone(), millis(1)).unwrap();
        assert!(matches!(
            sampler.set_timer_func(None),
            Err(SamplerError::SamplingActive)
        ));
        assert!(matches!(
            sampler.set_context_marker(Rc::new(TaskLocalMarker)),
            Err(SamplerError::SamplingActive)
        ));
        assert_eq!(sampler.current_timer_kind(), Some(TimerKind::TimerFunc));

        sampler.unsubscribe(&target).unwrap();
        sampler.set_timer_func(Some(clock.timer_func())).unwrap();
    }

    #[test]
    fn test_samples_on_exact_grid() {
        let (sampler, clock) = sampler_with_clock();
        let recorder = Recorder::new();
        let main = SimFrame::new("main", "app.py", 1);
        let work = main.call("work", "app.py", 5);

        sampler
            .subscribe(recorder.target(), SubscribeOptions::new(ticks(10)))
            .unwrap();
        for n in 1..=2000 {
            clock.set(at(n));
            let event = if n % 2 == 0 { Event::Return } else { Event::Call };
            profile(&*work, event);
        }

        assert_eq!(recorder.len(), 200);
        assert!(recorder.samples.borrow().iter().all(|s| s.elapsed == at(10)));
        assert_eq!(recorder.total_elapsed(), at(2000));
        assert!(recorder
            .samples
            .borrow()
            .iter()
            .all(|s| s.async_state.is_none()));
    }

    #[test]
    fn test_samples_at_ten_millis_over_two_seconds() {
        let (sampler, clock) = sampler_with_clock();
        let recorder = Recorder::new();
        let frame = SimFrame::new("main", "app.py", 1).call("work", "app.py", 5);

        sampler.subscribe(recorder.target(), millis(10)).unwrap();
        for n in 1..=2000u32 {
            clock.set(f64::from(n) * 0.001);
            let event = if n % 2 == 0 { Event::Return } else { Event::Call };
            profile(&*frame, event);
        }

        let samples = recorder.len();
        assert!((181..=201).contains(&samples), "{samples} samples");
        let total = recorder.total_elapsed();
        assert!((total - 2.0).abs() <= 0.011 + 1e-9, "{total}");
    }

    #[test]
    fn test_elapsed_carries_over_reinstall() {
        let (sampler, clock) = sampler_with_clock();
        let first = Recorder::new();
        let second = Recorder::new();
        let frame = SimFrame::new("main", "app.py", 1);

        sampler
            .subscribe(first.target(), SubscribeOptions::new(ticks(10)))
            .unwrap();
        clock.set(at(10));
        profile(&*frame, Event::Return);

        clock.set(at(13));
        sampler
            .subscribe(second.target(), SubscribeOptions::new(ticks(4)))
            .unwrap();
        assert_eq!(sampler.current_sampling_interval(), Some(ticks(4)));

        clock.set(at(16));
        profile(&*frame, Event::Return);
        assert_eq!(first.len(), 1);

        clock.set(at(17));
        profile(&*frame, Event::Return);
        assert_eq!(first.total_elapsed(), at(17));
        assert_eq!(second.len(), 1);
        assert_eq!(second.total_elapsed(), at(7));
    }

    #[test]
    fn test_call_is_attributed_to_caller() {
        let (sampler, clock) = sampler_with_clock();
        let recorder = Recorder::new();
        let main = SimFrame::new("main", "app.py", 1);
        let callee = main.call("callee", "app.py", 9);

        sampler.subscribe(recorder.target(), millis(1)).unwrap();
        clock.set(1.0);
        profile(&*callee, Event::Call);

        let sample = recorder.last().unwrap();
        assert_eq!(sample.call_stack.last(), Some(&encode_frame(&*main)));
        assert_eq!(sample.call_stack, build_call_stack(Some(&*main), None));
    }

    #[test]
    fn test_native_return_is_sampled_as_builtin() {
        let (sampler, clock) = sampler_with_clock();
        let recorder = Recorder::new();
        let main = SimFrame::new("main", "app.py", 1);

        sampler.subscribe(recorder.target(), millis(1)).unwrap();
        clock.set(1.0);
        profile(&*main, Event::CReturn("len"));

        let sample = recorder.last().unwrap();
        assert_eq!(sample.call_stack.last().unwrap(), "len\0<built-in>\00");
    }

    #[test]
    fn test_async_round_trip() {
        let (sampler, clock) = sampler_with_clock();
        let bound = Recorder::new();
        let unbound = Recorder::new();
        sampler
            .subscribe(bound.target(), millis(1).with_async_context(true))
            .unwrap();
        sampler.subscribe(unbound.target(), millis(1)).unwrap();

        let main = SimFrame::new("main", "app.py", 1);
        let outer = SimFrame::builder("outer", "app.py", 10)
            .coroutine()
            .parent(&main)
            .build();
        let inner = SimFrame::builder("inner", "app.py", 20)
            .coroutine()
            .parent(&outer)
            .build();
        let other = SimFrame::new("other_task", "app.py", 30);

        // leave without awaiting
        with_context(None, || {
            clock.advance(1.0);
            profile(&*other, Event::Return);
        });
        assert_eq!(
            bound.last().unwrap().async_state,
            Some(AsyncState::OutOfContextUnknown(build_call_stack(
                Some(&*other),
                None
            )))
        );
        assert_eq!(unbound.last().unwrap().async_state, None);

        // come back
        clock.advance(1.0);
        profile(&*main, Event::Return);
        assert_eq!(bound.last().unwrap().async_state, Some(AsyncState::InContext));

        // suspend through two coroutines
        profile(&*inner, Event::Return);
        profile(&*outer, Event::Return);
        with_context(None, || {
            clock.advance(1.0);
            profile(&*main.call("run_once", "loop.py", 1), Event::Call);
        });
        let mut expected = build_call_stack(Some(&*main), None);
        expected.push(encode_frame(&*outer));
        expected.push(encode_frame(&*inner));
        assert_eq!(
            bound.last().unwrap().async_state,
            Some(AsyncState::OutOfContextAwaited(expected))
        );

        clock.advance(1.0);
        profile(&*main, Event::Return);
        assert_eq!(bound.last().unwrap().async_state, Some(AsyncState::InContext));
        assert_eq!(bound.len(), 4);
        assert_eq!(unbound.len(), 4);
    }

    #[test]
    fn test_uses_timing_thread_when_asked() {
        let _exclusive = timing_thread::exclusive();
        let sampler = StackSampler::current();
        let target = Recorder::new().target();
        sampler
            .subscribe(target.clone(), millis(1).with_timing_thread(true))
            .unwrap();
        assert_eq!(sampler.current_timer_kind(), Some(TimerKind::WalltimeThread));
        assert!(timing_thread::get_interval().is_some());
        sampler.unsubscribe(&target).unwrap();
        assert_eq!(sampler.current_timer_kind(), None);
    }

    #[test]
    fn test_timer_kind_change_reinstalls() {
        let _exclusive = timing_thread::exclusive();
        let sampler = StackSampler::current();
        let threaded = Recorder::new().target();
        let indifferent = Recorder::new().target();

        sampler
            .subscribe(threaded.clone(), millis(10).with_timing_thread(true))
            .unwrap();
        sampler.subscribe(indifferent.clone(), millis(10)).unwrap();
        assert_eq!(sampler.current_timer_kind(), Some(TimerKind::WalltimeThread));

        sampler.unsubscribe(&threaded).unwrap();
        assert_eq!(sampler.current_sampling_interval(), Some(Duration::from_millis(10)));
        assert!(matches!(
            sampler.current_timer_kind(),
            Some(TimerKind::Walltime | TimerKind::WalltimeCoarse)
        ));
        sampler.unsubscribe(&indifferent).unwrap();
        assert_eq!(timing_thread::get_interval(), None);
    }

    #[test]
    fn test_failed_unsubscribe_changes_nothing() {
        let _exclusive = timing_thread::exclusive();
        let sampler = StackSampler::current();
        let fast = Recorder::new().target();
        let slow = Recorder::new().target();
        sampler
            .subscribe(fast.clone(), millis(1).with_timing_thread(true))
            .unwrap();
        sampler
            .subscribe(
                slow.clone(),
                millis(10).with_timing_thread(true).with_async_context(true),
            )
            .unwrap();
        let marker = TaskLocalMarker.get();

        // leave no room for the timer the 10ms interval would need
        let mut filler = Vec::new();
        while let Ok(subscription) = timing_thread::subscribe(Duration::from_secs(1)) {
            filler.push(subscription);
        }

        let err = sampler.unsubscribe(&fast).unwrap_err();
        assert!(matches!(
            err,
            SamplerError::Timer(TimerError::TimingThread(
                timing_thread::TimingThreadError::TooManySubscribers
            ))
        ));
        assert_eq!(sampler.subscriber_count(), 2);
        assert_eq!(sampler.current_sampling_interval(), Some(Duration::from_millis(1)));
        assert_eq!(TaskLocalMarker.get(), marker);

        drop(filler);
        sampler.unsubscribe(&fast).unwrap();
        assert_eq!(sampler.current_sampling_interval(), Some(Duration::from_millis(10)));
        assert_eq!(TaskLocalMarker.get(), marker);

        sampler.unsubscribe(&slow).unwrap();
        assert_eq!(TaskLocalMarker.get(), None);
        assert_eq!(timing_thread::get_interval(), None);
    }

    #[test]
    fn test_stale_context_is_not_mistaken_for_new_subscriber() {
        let (sampler, clock) = sampler_with_clock();
        let bound = millis(1).with_async_context(true);
        let frame = SimFrame::new("task", "app.py", 1);

        let first = Recorder::new();
        sampler.subscribe(first.target(), bound).unwrap();
        // a task spawned now keeps this value after the profiler is gone
        let stale = TaskLocalMarker.get();
        sampler.unsubscribe(&first.target()).unwrap();
        drop(first);

        let second = Recorder::new();
        sampler.subscribe(second.target(), bound).unwrap();
        assert_ne!(TaskLocalMarker.get(), stale);

        with_context(stale, || {
            clock.advance(1.0);
            profile(&*frame, Event::Return);
        });
        assert_eq!(
            second.last().unwrap().async_state,
            Some(AsyncState::OutOfContextUnknown(build_call_stack(
                Some(&*frame),
                None
            )))
        );
    }

    #[test]
    fn test_target_may_unsubscribe_while_sampled() {
        let (sampler, clock) = sampler_with_clock();
        let me: Rc<RefCell<Option<Rc<dyn SampleTarget>>>> = Rc::default();
        let target: Rc<dyn SampleTarget> = Rc::new({
            let me = me.clone();
            let sampler = sampler.clone();
            move |_: &[String], _: f64, _: Option<&AsyncState>| {
                if let Some(me) = me.borrow_mut().take() {
                    sampler.unsubscribe(&me).unwrap();
                }
            }
        });
        *me.borrow_mut() = Some(target.clone());

        sampler.subscribe(target, millis(1)).unwrap();
        clock.set(1.0);
        profile(&*SimFrame::new("f", "f.py", 1), Event::Return);

        assert!(!sampler.is_sampling());
        assert!(!is_installed());
        assert!(me.borrow().is_none());
    }
}
