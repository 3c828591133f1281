// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The async-context marker.
//!
//! The sampler tells logical tasks apart by reading a marker whose value is
//! the identity of the profiler bound to the running task (or `None`). When
//! the value read at one event differs from the value read at the previous
//! event, execution has moved to a different task.
//!
//! The default marker, [`TaskLocalMarker`], lives in a thread-local cell.
//! Executors give each task its own copy of the value by wrapping the task's
//! future with [`contextual`]:
//!
//! ```
//! # async fn task_body() {}
//! let task = stack_sampler::context::contextual(task_body());
//! // spawn `task` on a single-threaded executor
//! # drop(task);
//! ```

use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identity of a bound profiler, compared by equality only.
///
/// Ids are never reused within a process, so a task still carrying the id
/// of a profiler that has gone away can't be mistaken for a newer one.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

impl ContextId {
    /// A fresh identity, distinct from every other one in this process.
    pub fn unique() -> ContextId {
        ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Debug for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContextId({})", self.0)
    }
}

/// A cell holding the profiler identity of the running logical context.
pub trait ContextMarker {
    /// The value visible to the code running right now.
    fn get(&self) -> Option<ContextId>;

    /// Replaces the value for the running context.
    fn set(&self, value: Option<ContextId>);
}

thread_local! {
    static CURRENT: Cell<Option<ContextId>> = const { Cell::new(None) };
}

/// Marker stored in a thread-local cell and carried per task by
/// [`Contextual`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TaskLocalMarker;

impl ContextMarker for TaskLocalMarker {
    fn get(&self) -> Option<ContextId> {
        CURRENT.get()
    }

    fn set(&self, value: Option<ContextId>) {
        CURRENT.set(value);
    }
}

/// Runs `f` with the marker set to `value`, restoring the previous value
/// afterwards. Changes made by `f` are discarded.
pub fn with_context<R>(value: Option<ContextId>, f: impl FnOnce() -> R) -> R {
    struct Restore(Option<ContextId>);
    impl Drop for Restore {
        fn drop(&mut self) {
            CURRENT.set(self.0);
        }
    }

    let _restore = Restore(CURRENT.replace(value));
    f()
}

/// A future that carries its own copy of the marker value.
///
/// The value is swapped into the thread-local cell for the duration of each
/// poll, and whatever the future leaves in it is kept for the next poll.
#[must_use = "futures do nothing unless polled"]
pub struct Contextual<F> {
    inner: Pin<Box<F>>,
    value: Option<ContextId>,
}

/// Wraps `future`, snapshotting the current marker value.
pub fn contextual<F: Future>(future: F) -> Contextual<F> {
    Contextual {
        inner: Box::pin(future),
        value: CURRENT.get(),
    }
}

impl<F: Future> Future for Contextual<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<F::Output> {
        let this = self.get_mut();
        let outer = CURRENT.replace(this.value);
        let result = this.inner.as_mut().poll(cx);
        this.value = CURRENT.replace(outer);
        result
    }
}

impl<F> fmt::Debug for Contextual<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Contextual").field("value", &self.value).finish()
    }
}
