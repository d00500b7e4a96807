// Copyright (c) Andrea Righi <andrea.righi@linux.dev>

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! vruntime-based fairness.
//!
//! Each task accumulates virtual runtime proportionally to the CPU time it consumed, scaled by its
//! static priority (weight). The global `min_vruntime` watermark advances with every decision and
//! it is used as a floor: a task's vruntime can never fall more than `slice * latency_weight`
//! behind it, so sleeping tasks can only bank a limited amount of credit. Tasks that voluntarily
//! release the CPU often (interactive tasks) get a bigger latency weight and therefore a bigger
//! budget.
//!
//! The engine owns the per-task state (TaskInfoMap) and the watermark; nothing else writes them.

use std::collections::HashMap;

use log::debug;

use crate::clock::Clock;
use crate::clock::MonotonicClock;
use crate::clock::NSEC_PER_SEC;
use crate::clock::NSEC_PER_USEC;
use crate::control_block::ControlBlock;
use crate::wire::QueuedTask;

/// Upper bound of the voluntary context switch rate (per second) and of the latency weight.
pub const MAX_LATENCY_WEIGHT: u64 = 1000;

/// Default time slice (5ms).
pub const SLICE_NS_DEFAULT: u64 = 5000 * NSEC_PER_USEC;

/// Minimum time slice (0.5ms).
pub const SLICE_NS_MIN: u64 = 500 * NSEC_PER_USEC;

/// Default amount of decisions after which a task that was never seen again is forgotten.
pub const EVICT_AFTER_CYCLES: u64 = 1 << 20;

// Stale tasks are looked for every SWEEP_INTERVAL decisions.
const SWEEP_INTERVAL: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FairnessConfig {
    pub slice_ns: u64,           // Default time slice (in ns)
    pub slice_ns_min: u64,       // Minimum time slice (in ns)
    pub evict_after_cycles: u64, // Forget tasks not seen for this many decisions (0 = never)
}

impl Default for FairnessConfig {
    fn default() -> Self {
        Self {
            slice_ns: SLICE_NS_DEFAULT,
            slice_ns_min: SLICE_NS_MIN,
            evict_after_cycles: EVICT_AFTER_CYCLES,
        }
    }
}

// Exponential moving average with a 1/4 decay.
fn calc_avg(old_val: u64, new_val: u64) -> u64 {
    (old_val - (old_val >> 2)) + (new_val >> 2)
}

// Per-task scheduling state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    sum_exec_runtime: u64, // total cpu time used by the task
    vruntime: u64,         // total vruntime of the task
    avg_nvcsw: u64,        // smoothed voluntary context switches per second
    nvcsw: u64,            // voluntary context switches at the last sample
    nvcsw_ts: u64,         // timestamp of the last sample
    last_seen: u64,        // decision cycle of the last update
    zero_weight: bool,     // a zero weight was already reported for this task
}

impl TaskInfo {
    pub fn sum_exec_runtime(&self) -> u64 {
        self.sum_exec_runtime
    }

    pub fn vruntime(&self) -> u64 {
        self.vruntime
    }

    pub fn avg_nvcsw(&self) -> u64 {
        self.avg_nvcsw
    }

    pub fn nvcsw(&self) -> u64 {
        self.nvcsw
    }

    pub fn nvcsw_ts(&self) -> u64 {
        self.nvcsw_ts
    }

    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    /// Latency weight of the task for an enqueue with (or without) the wakeup flag.
    pub fn latency_weight(&self, wakeup: bool) -> u64 {
        let multiplier = if wakeup { 2 } else { 1 };
        self.avg_nvcsw.min(MAX_LATENCY_WEIGHT) * multiplier + 1
    }
}

/// Time slice and virtual deadline assigned to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SliceDecision {
    pub slice_ns: u64,
    pub vtime: u64,
}

pub struct FairnessEngine<C: Clock = MonotonicClock> {
    config: FairnessConfig,
    clock: C,
    tasks: HashMap<i32, TaskInfo>, // map pids to the corresponding task information
    min_vruntime: u64,             // Keep track of the minimum vruntime across all tasks
    nr_decisions: u64,             // Total amount of decisions taken
    nr_evicted: u64,               // Tasks forgotten by the stale task sweep
}

impl FairnessEngine<MonotonicClock> {
    pub fn new(config: FairnessConfig) -> Self {
        Self::with_clock(config, MonotonicClock::new())
    }
}

impl<C: Clock> FairnessEngine<C> {
    pub fn with_clock(config: FairnessConfig, clock: C) -> Self {
        Self {
            config,
            clock,
            tasks: HashMap::new(),
            min_vruntime: 0,
            nr_decisions: 0,
            nr_evicted: 0,
        }
    }

    pub fn config(&self) -> &FairnessConfig {
        &self.config
    }

    /// Global vruntime watermark.
    pub fn min_vruntime(&self) -> u64 {
        self.min_vruntime
    }

    /// Amount of tasks currently tracked.
    pub fn nr_tasks(&self) -> usize {
        self.tasks.len()
    }

    pub fn nr_decisions(&self) -> u64 {
        self.nr_decisions
    }

    pub fn nr_evicted(&self) -> u64 {
        self.nr_evicted
    }

    pub fn task(&self, pid: i32) -> Option<&TaskInfo> {
        self.tasks.get(&pid)
    }

    // Scale time slice based on the amount of tasks that are waiting in the scheduler's queue (plus
    // the one being placed), but make sure to assign at least slice_ns_min.
    pub fn time_slice(&self, cb: &ControlBlock) -> u64 {
        let nr_waiting = cb.nr_waiting().saturating_add(1);
        (self.config.slice_ns / nr_waiting).max(self.config.slice_ns_min)
    }

    /// Evaluate the time slice and the deadline of a task, updating its vruntime and the global
    /// watermark.
    ///
    /// This method implements the main task ordering logic of the scheduler.
    pub fn decide(&mut self, task: &QueuedTask, cb: &ControlBlock) -> SliceDecision {
        let now = self.clock.now_ns();
        let slice_ns = self.time_slice(cb);
        let cycle = self.nr_decisions;

        // Get task information if the task is already stored in the task map, otherwise create a
        // new entry for it, starting from the current watermark.
        let min_vruntime = self.min_vruntime;
        let task_info = self.tasks.entry(task.pid).or_insert_with(|| TaskInfo {
            sum_exec_runtime: task.sum_exec_runtime,
            vruntime: min_vruntime,
            avg_nvcsw: 0,
            nvcsw: task.nvcsw,
            nvcsw_ts: now,
            last_seen: cycle,
            zero_weight: false,
        });
        task_info.last_seen = cycle;

        // Refresh the voluntary context switch rate once per second.
        let delta_t = now.saturating_sub(task_info.nvcsw_ts);
        if delta_t >= NSEC_PER_SEC {
            let delta_nvcsw = task.nvcsw.saturating_sub(task_info.nvcsw);
            let rate = (delta_nvcsw.saturating_mul(NSEC_PER_SEC) / delta_t).min(MAX_LATENCY_WEIGHT);
            task_info.avg_nvcsw = calc_avg(task_info.avg_nvcsw, rate);
            task_info.nvcsw = task.nvcsw;
            task_info.nvcsw_ts = now;
        }
        let latency_weight = task_info.latency_weight(task.is_wakeup());

        // Evaluate used task time slice, never charging more than the assigned slice.
        let used = task
            .sum_exec_runtime
            .saturating_sub(task_info.sum_exec_runtime)
            .min(slice_ns);
        task_info.sum_exec_runtime = task.sum_exec_runtime;

        // Re-align the task's vruntime to the watermark: the amount of vruntime budget an idle
        // task can accumulate depends on its latency weight.
        let floor = min_vruntime.saturating_sub(slice_ns.saturating_mul(latency_weight));
        if task_info.vruntime < floor {
            task_info.vruntime = floor;
        }

        let weight = if task.weight == 0 {
            if !task_info.zero_weight {
                debug!("pid {} has zero weight, using 1", task.pid);
                task_info.zero_weight = true;
            }
            1
        } else {
            task.weight
        };
        let vslice = used.saturating_mul(100) / weight;
        task_info.vruntime = task_info.vruntime.saturating_add(vslice);
        let vtime = task_info.vruntime;

        self.min_vruntime = self.min_vruntime.saturating_add(vslice);
        self.nr_decisions += 1;
        if self.nr_decisions % SWEEP_INTERVAL == 0 {
            self.sweep();
        }

        SliceDecision { slice_ns, vtime }
    }

    /// Forget an exiting task.
    pub fn task_exited(&mut self, pid: i32) -> bool {
        self.tasks.remove(&pid).is_some()
    }

    /// Forget all the tasks not seen in the last `evict_after_cycles` decisions, returning how
    /// many were removed.
    pub fn sweep(&mut self) -> usize {
        let evict_after = self.config.evict_after_cycles;
        if evict_after == 0 {
            return 0;
        }
        let now = self.nr_decisions;
        let before = self.tasks.len();
        self.tasks
            .retain(|_, info| now.saturating_sub(info.last_seen) < evict_after);
        let evicted = before - self.tasks.len();
        if evicted > 0 {
            debug!("evicted {} stale tasks", evicted);
            self.nr_evicted += evicted as u64;
        }
        evicted
    }
}
