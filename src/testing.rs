// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Simulated runtime frames and a hand-driven clock for tests.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::frame::Frame;
use crate::sampler::{AsyncState, SampleTarget};
use crate::timer::TimerFunc;

#[derive(Debug, Default)]
pub(crate) struct SimFrame {
    name: String,
    qualified_name: Option<String>,
    file: String,
    first_line: u32,
    line: Option<u32>,
    class_name: Option<String>,
    hidden: bool,
    coroutine: bool,
    parent: Option<Rc<SimFrame>>,
}

impl SimFrame {
    pub(crate) fn new(name: &str, file: &str, first_line: u32) -> Rc<SimFrame> {
        Self::builder(name, file, first_line).build()
    }

    pub(crate) fn builder(name: &str, file: &str, first_line: u32) -> SimFrameBuilder {
        SimFrameBuilder {
            frame: SimFrame {
                name: name.into(),
                file: file.into(),
                first_line,
                ..Default::default()
            },
        }
    }

    /// A frame called from `self`.
    pub(crate) fn call(self: &Rc<Self>, name: &str, file: &str, first_line: u32) -> Rc<SimFrame> {
        Self::builder(name, file, first_line).parent(self).build()
    }
}

impl Frame for SimFrame {
    fn function_name(&self) -> &str {
        &self.name
    }

    fn qualified_name(&self) -> &str {
        self.qualified_name.as_deref().unwrap_or(&self.name)
    }

    fn file_name(&self) -> &str {
        &self.file
    }

    fn first_line(&self) -> u32 {
        self.first_line
    }

    fn line(&self) -> Option<u32> {
        self.line
    }

    fn class_name(&self) -> Option<&str> {
        self.class_name.as_deref()
    }

    fn is_hidden(&self) -> bool {
        self.hidden
    }

    fn is_coroutine(&self) -> bool {
        self.coroutine
    }

    fn back(&self) -> Option<&dyn Frame> {
        self.parent.as_deref().map(|f| f as &dyn Frame)
    }
}

pub(crate) struct SimFrameBuilder {
    frame: SimFrame,
}

impl SimFrameBuilder {
    pub(crate) fn qualified_name(mut self, name: &str) -> Self {
        self.frame.qualified_name = Some(name.into());
        self
    }

    pub(crate) fn class_name(mut self, name: &str) -> Self {
        self.frame.class_name = Some(name.into());
        self
    }

    pub(crate) fn line(mut self, line: u32) -> Self {
        self.frame.line = Some(line);
        self
    }

    pub(crate) fn hidden(mut self) -> Self {
        self.frame.hidden = true;
        self
    }

    pub(crate) fn coroutine(mut self) -> Self {
        self.frame.coroutine = true;
        self
    }

    pub(crate) fn parent(mut self, parent: &Rc<SimFrame>) -> Self {
        self.frame.parent = Some(parent.clone());
        self
    }

    pub(crate) fn build(self) -> Rc<SimFrame> {
        Rc::new(self.frame)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone, Default)]
pub(crate) struct ManualClock(Rc<Cell<f64>>);

impl ManualClock {
    pub(crate) fn set(&self, now: f64) {
        self.0.set(now);
    }

    pub(crate) fn advance(&self, seconds: f64) {
        self.0.set(self.0.get() + seconds);
    }

    pub(crate) fn timer_func(&self) -> TimerFunc {
        let now = self.0.clone();
        Rc::new(move || now.get())
    }
}

/// One sample as seen by a [`Recorder`].
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RecordedSample {
    pub(crate) call_stack: Vec<String>,
    pub(crate) elapsed: f64,
    pub(crate) async_state: Option<AsyncState>,
}

/// A subscriber target that keeps everything it is given.
#[derive(Debug, Default)]
pub(crate) struct Recorder {
    pub(crate) samples: RefCell<Vec<RecordedSample>>,
}

impl Recorder {
    pub(crate) fn new() -> Rc<Recorder> {
        Rc::new(Recorder::default())
    }

    pub(crate) fn len(&self) -> usize {
        self.samples.borrow().len()
    }

    pub(crate) fn total_elapsed(&self) -> f64 {
        self.samples.borrow().iter().map(|s| s.elapsed).sum()
    }

    pub(crate) fn last(&self) -> Option<RecordedSample> {
        self.samples.borrow().last().cloned()
    }

    pub(crate) fn target(self: &Rc<Self>) -> Rc<dyn SampleTarget> {
        self.clone()
    }
}

impl SampleTarget for Recorder {
    fn sample(&self, call_stack: &[String], elapsed: f64, async_state: Option<&AsyncState>) {
        self.samples.borrow_mut().push(RecordedSample {
            call_stack: call_stack.to_vec(),
            elapsed,
            async_state: async_state.cloned(),
        });
    }
}
