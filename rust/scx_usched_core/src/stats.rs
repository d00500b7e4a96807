// Copyright (c) Andrea Righi <andrea.righi@linux.dev>

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::io::Write;

use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

use crate::control_block::ControlBlock;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    /// Number of online CPUs
    pub nr_cpus: u64,
    /// Amount of tasks currently running
    pub nr_running: u64,
    /// Amount of tasks queued to the user-space scheduler
    pub nr_queued: u64,
    /// Amount of tasks in the user-space scheduler waiting to be dispatched
    pub nr_scheduled: u64,
    /// Number of task dispatched by the user-space scheduler
    pub nr_user_dispatches: u64,
    /// Number of task dispatched directly by the kernel
    pub nr_kernel_dispatches: u64,
    /// Number of cancelled dispatches
    pub nr_cancel_dispatches: u64,
    /// Number of dispatches bounced to another DSQ
    pub nr_bounce_dispatches: u64,
    /// Number of failed dispatches
    pub nr_failed_dispatches: u64,
    /// Number of scheduler congestion events
    pub nr_sched_congested: u64,
    /// Amount of tasks tracked by the scheduling policy
    pub nr_tasks: u64,
    /// Global vruntime watermark
    pub min_vruntime: u64,
    /// Number of tasks sent to the dispatched ring buffer
    pub nr_dispatched: u64,
    /// Number of queued records dropped because malformed
    pub nr_malformed: u64,
    /// Number of CPU selections that fell back to any CPU because of an error
    pub nr_placement_errors: u64,
    /// Number of tasks that could not be sent to the dispatched ring buffer
    pub nr_dispatch_errors: u64,
}

impl Metrics {
    /// Fill the counters maintained by the BPF component.
    pub fn with_control_block(self, cb: &ControlBlock) -> Self {
        Self {
            nr_cpus: cb.nr_online_cpus,
            nr_running: cb.nr_running,
            nr_queued: cb.nr_queued,
            nr_scheduled: cb.nr_scheduled,
            nr_user_dispatches: cb.nr_user_dispatches,
            nr_kernel_dispatches: cb.nr_kernel_dispatches,
            nr_cancel_dispatches: cb.nr_cancel_dispatches,
            nr_bounce_dispatches: cb.nr_bounce_dispatches,
            nr_failed_dispatches: cb.nr_failed_dispatches,
            nr_sched_congested: cb.nr_sched_congested,
            ..self
        }
    }

    pub fn format<W: Write>(&self, w: &mut W) -> Result<()> {
        writeln!(
            w,
            "[{}] tasks -> r: {:>2}/{:<2} w: {:<2}/{:<2} t: {:<4} | vrt: {:<12} | dispatch -> u: {:<5} k: {:<5} c: {:<5} b: {:<5} f: {:<5} | cg: {:<5} | err -> m: {} p: {} d: {}",
            crate::SCHEDULER_NAME,
            self.nr_running,
            self.nr_cpus,
            self.nr_queued,
            self.nr_scheduled,
            self.nr_tasks,
            self.min_vruntime,
            self.nr_user_dispatches,
            self.nr_kernel_dispatches,
            self.nr_cancel_dispatches,
            self.nr_bounce_dispatches,
            self.nr_failed_dispatches,
            self.nr_sched_congested,
            self.nr_malformed,
            self.nr_placement_errors,
            self.nr_dispatch_errors,
        )?;
        Ok(())
    }

    /// Event counters accumulated since `rhs`; gauges are taken from `self`.
    pub fn delta(&self, rhs: &Self) -> Self {
        Self {
            nr_user_dispatches: self.nr_user_dispatches.saturating_sub(rhs.nr_user_dispatches),
            nr_kernel_dispatches: self
                .nr_kernel_dispatches
                .saturating_sub(rhs.nr_kernel_dispatches),
            nr_cancel_dispatches: self
                .nr_cancel_dispatches
                .saturating_sub(rhs.nr_cancel_dispatches),
            nr_bounce_dispatches: self
                .nr_bounce_dispatches
                .saturating_sub(rhs.nr_bounce_dispatches),
            nr_failed_dispatches: self
                .nr_failed_dispatches
                .saturating_sub(rhs.nr_failed_dispatches),
            nr_sched_congested: self.nr_sched_congested.saturating_sub(rhs.nr_sched_congested),
            nr_dispatched: self.nr_dispatched.saturating_sub(rhs.nr_dispatched),
            nr_malformed: self.nr_malformed.saturating_sub(rhs.nr_malformed),
            nr_placement_errors: self
                .nr_placement_errors
                .saturating_sub(rhs.nr_placement_errors),
            nr_dispatch_errors: self.nr_dispatch_errors.saturating_sub(rhs.nr_dispatch_errors),
            ..self.clone()
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
