// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::rc::Rc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::context::ContextId;

/// Receives samples from a [`StackSampler`](super::StackSampler).
///
/// `call_stack` holds frame descriptors from the root (the thread) to the
/// leaf, and `elapsed` is the time in seconds since the previous sample on
/// this thread. `async_state` is `Some` only for subscribers bound to an
/// async context.
pub trait SampleTarget {
    /// Handles one sample.
    fn sample(&self, call_stack: &[String], elapsed: f64, async_state: Option<&AsyncState>);
}

impl<F> SampleTarget for F
where
    F: Fn(&[String], f64, Option<&AsyncState>),
{
    fn sample(&self, call_stack: &[String], elapsed: f64, async_state: Option<&AsyncState>) {
        self(call_stack, elapsed, async_state)
    }
}

/// Whether a bound subscriber's context is the one running, and if not,
/// what it was doing when it stopped running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "info", rename_all = "snake_case")]
pub enum AsyncState {
    /// The subscriber's context is running on this thread.
    InContext,
    /// The context suspended on an await. Holds the call stack at the
    /// suspension, extended with the chain of awaited coroutines.
    OutOfContextAwaited(Vec<String>),
    /// The context stopped running without an observed await. Holds the
    /// call stack at the moment of the change.
    OutOfContextUnknown(Vec<String>),
}

impl AsyncState {
    /// The stack recorded when the context stopped running.
    pub fn stack(&self) -> Option<&[String]> {
        match self {
            AsyncState::InContext => None,
            AsyncState::OutOfContextAwaited(stack) | AsyncState::OutOfContextUnknown(stack) => {
                Some(stack)
            }
        }
    }
}

pub(crate) struct Subscriber {
    pub(crate) target: Rc<dyn SampleTarget>,
    // what the context marker holds while this subscriber is bound
    pub(crate) id: ContextId,
    pub(crate) desired_interval: Duration,
    pub(crate) use_timing_thread: Option<bool>,
    pub(crate) bound_to_async_context: bool,
    // shared with in-flight fan-outs, replaced rather than mutated
    pub(crate) async_state: Option<Rc<AsyncState>>,
}

impl Subscriber {
    pub(crate) fn new(
        target: Rc<dyn SampleTarget>,
        desired_interval: Duration,
        use_timing_thread: Option<bool>,
        bound_to_async_context: bool,
    ) -> Subscriber {
        Subscriber {
            id: ContextId::unique(),
            target,
            desired_interval,
            use_timing_thread,
            bound_to_async_context,
            async_state: bound_to_async_context.then(|| Rc::new(AsyncState::InContext)),
        }
    }

    /// Whether this subscriber delivers to `target`. Compared by address,
    /// which can't be reused while the subscriber holds the `Rc`.
    pub(crate) fn is_target(&self, target: &Rc<dyn SampleTarget>) -> bool {
        std::ptr::addr_eq(Rc::as_ptr(&self.target), Rc::as_ptr(target))
    }
}
