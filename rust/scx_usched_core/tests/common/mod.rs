// Copyright (c) Andrea Righi <andrea.righi@linux.dev>

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

#![allow(dead_code)]

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use scx_usched_core::sim::SimKernel;
use scx_usched_core::FairnessEngine;
use scx_usched_core::ManualClock;
use scx_usched_core::SchedError;
use scx_usched_core::Scheduler;
use scx_usched_core::SchedulerConfig;
use scx_usched_core::VruntimePolicy;

pub type SimScheduler = Scheduler<VruntimePolicy<ManualClock>>;

/// Initialize logging; only the first call in the process has effect.
pub fn setup_test() {
    let _ = simplelog::TestLogger::init(
        simplelog::LevelFilter::Debug,
        simplelog::ConfigBuilder::new().build(),
    );
}

pub fn config() -> SchedulerConfig {
    SchedulerConfig {
        idle_timeout: Some(Duration::from_millis(10)),
        stats_interval: None,
        ..Default::default()
    }
}

/// Attach a scheduler to `kernel`, using the simulated clock for the policy.
pub fn try_attach(
    kernel: &SimKernel,
    link: scx_usched_core::KernelLink,
    shutdown: Arc<AtomicBool>,
) -> Result<SimScheduler, SchedError> {
    let config = config();
    let policy =
        VruntimePolicy::with_engine(FairnessEngine::with_clock(config.fairness(), kernel.clock()));
    Scheduler::init(link, &kernel.topology(), policy, config, shutdown)
}

pub fn setup(nr_cpus: usize, capacity: usize) -> (SimKernel, SimScheduler) {
    setup_test();
    let (kernel, link) = SimKernel::new(nr_cpus, capacity);
    let sched = try_attach(&kernel, link, Arc::new(AtomicBool::new(false))).unwrap();
    (kernel, sched)
}

/// One simulated round: the kernel steps, then the scheduler handles everything it received.
pub fn round(kernel: &mut SimKernel, sched: &mut SimScheduler) {
    kernel.step();
    while sched.schedule().unwrap() {}
}

pub fn rounds(kernel: &mut SimKernel, sched: &mut SimScheduler, n: usize) {
    for _ in 0..n {
        round(kernel, sched);
    }
}
