// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::frame::{builtin_frame_descriptor, encode_frame, thread_frame_descriptor, Frame};
use crate::hook::Event;

/// Builds the call stack for a sample, root first.
///
/// The first descriptor identifies the thread. On [`Event::Call`] the stack
/// ends at the caller, because the callee hasn't run yet; after a native
/// function returns or raises, a `<built-in>` descriptor for it is the leaf.
/// Without an event, the stack is walked from `frame` as is.
pub fn build_call_stack(frame: Option<&dyn Frame>, event: Option<&Event<'_>>) -> Vec<String> {
    let mut call_stack = Vec::new();
    let mut frame = frame;

    match event {
        Some(Event::Call) => frame = frame.and_then(|f| f.back()),
        Some(Event::CReturn(name) | Event::CException(name)) => {
            call_stack.push(builtin_frame_descriptor(name))
        }
        _ => {}
    }

    while let Some(f) = frame {
        call_stack.push(encode_frame(f));
        frame = f.back();
    }

    call_stack.push(thread_frame_descriptor());

    // walked leaf to root
    call_stack.reverse();
    call_stack
}
