// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Runtime frames and the descriptor strings they are encoded into.
//!
//! A frame descriptor is an opaque, hashable string of the form
//! `name \0 file \0 first_line` followed by zero or more attributes. Each
//! attribute starts with [`ATTRIBUTES_SEP`] and a one-character marker:
//!
//! * `c<name>` - the class of the `self`/`cls` argument
//! * `l<line>` - the line currently executing
//! * `h1` - the frame asked to be hidden from reports

use std::cell::Cell;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

/// Separates the name, file and first line of a descriptor.
pub const IDENTIFIER_SEP: char = '\x00';
/// Introduces each attribute of a descriptor.
pub const ATTRIBUTES_SEP: char = '\x01';

const ATTRIBUTE_MARKER_CLASS_NAME: char = 'c';
const ATTRIBUTE_MARKER_LINE_NUMBER: char = 'l';
const ATTRIBUTE_MARKER_HIDDEN: char = 'h';

const BUILTIN_FILE_MARKER: &str = "<built-in>";
const THREAD_FILE_MARKER: &str = "<thread>";

/// One frame of the profiled runtime's call stack.
///
/// Runtime integrations implement this for their own frame objects. Only
/// [`Frame::function_name`], [`Frame::file_name`], [`Frame::first_line`]
/// and [`Frame::back`] are required.
pub trait Frame {
    /// The bare name of the function's code object.
    fn function_name(&self) -> &str;

    /// The qualified name (e.g. `Class.method`), used when the code object
    /// knows it. Defaults to [`Frame::function_name`].
    fn qualified_name(&self) -> &str {
        self.function_name()
    }

    /// The file the code was defined in.
    fn file_name(&self) -> &str;

    /// The line the code object starts on.
    fn first_line(&self) -> u32;

    /// The line currently executing, if known.
    fn line(&self) -> Option<u32> {
        None
    }

    /// The class name of the first `self` or `cls` argument, if any.
    fn class_name(&self) -> Option<&str> {
        None
    }

    /// Whether the frame has marked itself as hidden from reports.
    fn is_hidden(&self) -> bool {
        false
    }

    /// Whether the code object was declared as an asynchronous function.
    fn is_coroutine(&self) -> bool {
        false
    }

    /// The calling frame, or `None` at the top of the stack.
    fn back(&self) -> Option<&dyn Frame>;
}

/// Encodes a frame into its descriptor string.
pub fn encode_frame(frame: &dyn Frame) -> String {
    let mut out = String::with_capacity(64);
    let _ = write!(
        out,
        "{}{IDENTIFIER_SEP}{}{IDENTIFIER_SEP}{}",
        frame.qualified_name(),
        frame.file_name(),
        frame.first_line()
    );
    if let Some(class_name) = frame.class_name() {
        let _ = write!(out, "{ATTRIBUTES_SEP}{ATTRIBUTE_MARKER_CLASS_NAME}{class_name}");
    }
    if let Some(line) = frame.line().filter(|line| *line >= 1) {
        let _ = write!(out, "{ATTRIBUTES_SEP}{ATTRIBUTE_MARKER_LINE_NUMBER}{line}");
    }
    if frame.is_hidden() {
        let _ = write!(out, "{ATTRIBUTES_SEP}{ATTRIBUTE_MARKER_HIDDEN}1");
    }
    out
}

/// The synthetic leaf descriptor for time spent in a native function.
pub fn builtin_frame_descriptor(qualified_name: &str) -> String {
    format!("{qualified_name}{IDENTIFIER_SEP}{BUILTIN_FILE_MARKER}{IDENTIFIER_SEP}0")
}

/// The synthetic root descriptor identifying the current OS thread.
pub fn thread_frame_descriptor() -> String {
    let thread = std::thread::current();
    let name = thread.name().unwrap_or("<unnamed>");
    format!(
        "{name}{IDENTIFIER_SEP}{THREAD_FILE_MARKER}{IDENTIFIER_SEP}{}",
        current_thread_ident()
    )
}

static NEXT_THREAD_IDENT: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Numeric identity of this thread, assigned on first use.
    static THREAD_IDENT: Cell<u64> = const { Cell::new(0) };
}

/// A small, stable, process-unique number for the current thread.
pub fn current_thread_ident() -> u64 {
    THREAD_IDENT.with(|ident| {
        if ident.get() == 0 {
            ident.set(NEXT_THREAD_IDENT.fetch_add(1, Ordering::Relaxed));
        }
        ident.get()
    })
}

/// Splits a descriptor into its identifier and its attribute strings
/// (each still carrying its marker character).
pub fn parse_frame_info(frame_info: &str) -> (&str, Vec<&str>) {
    match frame_info.split_once(ATTRIBUTES_SEP) {
        None => (frame_info, Vec::new()),
        Some((identifier, attributes)) => (identifier, attributes.split(ATTRIBUTES_SEP).collect()),
    }
}

/// The identifier part of a descriptor, without attributes.
pub fn frame_info_identifier(frame_info: &str) -> &str {
    match frame_info.find(ATTRIBUTES_SEP) {
        Some(index) => &frame_info[..index],
        None => frame_info,
    }
}

/// Typed view of the attributes carried by a descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameAttributes<'a> {
    /// Value of the `c` attribute.
    pub class_name: Option<&'a str>,
    /// Value of the `l` attribute.
    pub line_number: Option<u32>,
    /// Whether an `h1` attribute is present.
    pub hidden: bool,
}

impl<'a> FrameAttributes<'a> {
    /// Decodes the attributes of `frame_info`. Unknown markers are ignored.
    pub fn parse(frame_info: &'a str) -> Self {
        let (_, attributes) = parse_frame_info(frame_info);
        let mut result = FrameAttributes::default();
        for attribute in attributes {
            let mut chars = attribute.chars();
            let marker = chars.next();
            let value = chars.as_str();
            match marker {
                Some(ATTRIBUTE_MARKER_CLASS_NAME) => result.class_name = Some(value),
                Some(ATTRIBUTE_MARKER_LINE_NUMBER) => result.line_number = value.parse().ok(),
                Some(ATTRIBUTE_MARKER_HIDDEN) => result.hidden = value == "1",
                _ => {}
            }
        }
        result
    }
}
