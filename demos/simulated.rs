// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use stack_sampler::frame::{frame_info_identifier, IDENTIFIER_SEP};
use stack_sampler::timer::walltime;
use stack_sampler::{
    profile, AsyncState, Event, Frame, SampleTarget, StackSampler, SubscribeOptions,
};

pub fn set_up_tracing() {
    use tracing_subscriber::{prelude::*, EnvFilter};

    let format = tracing_subscriber::fmt::layer().pretty();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    tracing_subscriber::registry()
        .with(format)
        .with(filter)
        .init();
}

/// Samples a simulated request handler and prints the hottest stacks
#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "1ms")]
    #[clap(value_parser = humantime::parse_duration)]
    interval: Duration,
    #[arg(long, default_value_t = 2000)]
    requests: u32,
    /// Burn real time instead of advancing a simulated clock
    #[arg(long)]
    wall_clock: bool,
    /// Read the time from the shared timing thread (needs --wall-clock)
    #[arg(long)]
    timing_thread: bool,
    #[arg(long, default_value_t = 8)]
    top: usize,
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

struct Function {
    name: &'static str,
    file: &'static str,
    line: u32,
    cost_us: u32,
    builtin: Option<&'static str>,
    callees: &'static [usize],
}

const fn function(
    name: &'static str,
    file: &'static str,
    line: u32,
    cost_us: u32,
    builtin: Option<&'static str>,
    callees: &'static [usize],
) -> Function {
    Function {
        name,
        file,
        line,
        cost_us,
        builtin,
        callees,
    }
}

// indexes into this table are the call graph
const FUNCTIONS: &[Function] = &[
    function("serve", "app.py", 1, 5, None, &[1, 2]),
    function("parse_request", "http.py", 40, 30, Some("bytes.decode"), &[]),
    function("handle", "app.py", 12, 10, None, &[3, 4]),
    function("query", "db.py", 88, 120, None, &[5]),
    function("render", "views.py", 7, 60, Some("str.join"), &[]),
    function("fetch_rows", "db.py", 130, 200, Some("socket.recv"), &[]),
];

struct DemoFrame {
    function: &'static Function,
    parent: Option<Rc<DemoFrame>>,
}

impl Frame for DemoFrame {
    fn function_name(&self) -> &str {
        self.function.name
    }

    fn file_name(&self) -> &str {
        self.function.file
    }

    fn first_line(&self) -> u32 {
        self.function.line
    }

    fn back(&self) -> Option<&dyn Frame> {
        self.parent.as_deref().map(|f| f as &dyn Frame)
    }
}

struct Workload {
    clock: Option<Rc<Cell<f64>>>,
    rng: StdRng,
    events: u64,
}

impl Workload {
    fn spend(&self, micros: u32) {
        let seconds = f64::from(micros) * 1e-6;
        match &self.clock {
            Some(clock) => clock.set(clock.get() + seconds),
            None => {
                let until = walltime() + seconds;
                while walltime() < until {
                    std::hint::spin_loop();
                }
            }
        }
    }

    fn event(&mut self, frame: &DemoFrame, event: Event<'_>) {
        self.events += 1;
        profile(frame, event);
    }

    fn run(&mut self, index: usize, parent: Option<&Rc<DemoFrame>>) {
        let function = &FUNCTIONS[index];
        let frame = Rc::new(DemoFrame {
            function,
            parent: parent.cloned(),
        });

        self.event(&frame, Event::Call);
        self.spend(function.cost_us);
        if let Some(builtin) = function.builtin {
            self.event(&frame, Event::CCall(builtin));
            let native_us = self.rng.random_range(0..=function.cost_us);
            self.spend(native_us);
            self.event(&frame, Event::CReturn(builtin));
        }
        for &callee in function.callees {
            if self.rng.random_bool(0.8) {
                self.run(callee, Some(&frame));
            }
        }
        self.event(&frame, Event::Return);
    }
}

fn collapse(call_stack: &[String]) -> String {
    call_stack
        .iter()
        .skip(1)
        .map(|descriptor| {
            let identifier = frame_info_identifier(descriptor);
            identifier
                .split(IDENTIFIER_SEP)
                .next()
                .unwrap_or(identifier)
        })
        .collect::<Vec<_>>()
        .join(";")
}

pub fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    set_up_tracing();

    let sampler = StackSampler::current();
    let clock = (!args.wall_clock).then(|| Rc::new(Cell::new(0.0)));
    if let Some(clock) = &clock {
        let clock = clock.clone();
        sampler.set_timer_func(Some(Rc::new(move || clock.get())))?;
    }

    let stacks: Rc<RefCell<HashMap<String, f64>>> = Rc::default();
    let target: Rc<dyn SampleTarget> = Rc::new({
        let stacks = stacks.clone();
        move |call_stack: &[String], elapsed: f64, _: Option<&AsyncState>| {
            *stacks.borrow_mut().entry(collapse(call_stack)).or_default() += elapsed;
        }
    });

    let mut options = SubscribeOptions::new(args.interval);
    if args.timing_thread {
        options = options.with_timing_thread(true);
    }
    sampler.subscribe(target.clone(), options)?;
    tracing::info!(
        interval = ?sampler.current_sampling_interval(),
        timer = ?sampler.current_timer_kind(),
        "sampling started"
    );

    let mut workload = Workload {
        clock,
        rng: StdRng::seed_from_u64(args.seed),
        events: 0,
    };
    for _ in 0..args.requests {
        workload.run(0, None);
    }

    sampler.unsubscribe(&target)?;
    tracing::info!(events = workload.events, "sampling stopped");

    let stacks = stacks.borrow();
    let total: f64 = stacks.values().sum();
    let mut hottest: Vec<_> = stacks.iter().collect();
    hottest.sort_by(|a, b| b.1.total_cmp(a.1));
    println!("{total:.3}s sampled across {} stacks", stacks.len());
    for (stack, seconds) in hottest.into_iter().take(args.top) {
        println!("{:6.2}%  {stack}", seconds / total * 100.0);
    }
    Ok(())
}
