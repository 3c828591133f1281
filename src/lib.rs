// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![deny(missing_docs)]

//! ## stack-sampler
//! A statistical call-stack sampler for dynamic language runtimes.
//!
//! The runtime reports every function call and return to [`profile`]. Most
//! of those events are dropped after one clock read; once per sampling
//! interval the sampler walks the stack, encodes each frame into a compact
//! descriptor string, and hands the stack, together with the time elapsed
//! since the previous sample, to every subscribed [`SampleTarget`].
//!
//! ### Usage
//!
//! A runtime integration implements [`Frame`] for its frame objects and
//! calls [`profile`] from its tracing hook. Profilers subscribe to the
//! thread's [`StackSampler`]:
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
//!         println!("{} frames, {elapsed:.4}s", stack.len());
//!     });
//!
//! let sampler = StackSampler::current();
//! sampler.subscribe(
//!     target.clone(),
//!     SubscribeOptions::new(Duration::from_millis(1)).with_timing_thread(true),
//! )?;
//! // ... run the profiled code ...
//! sampler.unsubscribe(&target)?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Timers
//!
//! Each event reads the clock, so the timer matters. The sampler picks one
//! of the [`TimerKind`]s: a custom function set with
//! [`StackSampler::set_timer_func`], the shared [timing thread] when a
//! subscriber asks for it, the coarse monotonic clock when its resolution
//! fits within the interval, or the precise monotonic clock. If the precise
//! clock is slow on this machine a warning is logged once; set
//! `STACK_SAMPLER_IGNORE_OVERHEAD_WARNING=1` to silence it.
//!
//! [timing thread]: timer::timing_thread
//!
//! ### Async contexts
//!
//! A subscriber bound to an async context (see
//! [`SubscribeOptions::with_async_context`]) also learns, on every sample,
//! whether its task is the one running and, if not, where it was suspended.
//! Tasks are told apart with a [`context::ContextMarker`]; the default one
//! expects each task's future to be wrapped with [`context::contextual`].
//!
//! #### Sample program
//!
//! ```notrust
//! RUST_LOG=debug cargo run --example simulated -- --interval 5ms
//! ```

pub mod advisory;
pub mod context;
pub mod frame;
pub mod hook;
pub mod sampler;
pub mod timer;

#[cfg(test)]
mod testing;

pub use frame::Frame;
pub use hook::{profile, Event};
pub use sampler::{AsyncState, SampleTarget, SamplerError, StackSampler, SubscribeOptions};
pub use timer::TimerKind;
