// Copyright (c) Andrea Righi <andrea.righi@linux.dev>

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! In-process stand-in for the BPF component.
//!
//! [`SimKernel`] plays the kernel side of every interface the scheduler uses: it queues runnable
//! tasks to the queued ring buffer, consumes dispatched tasks into a vtime-ordered dispatch
//! queue, runs them on a fixed amount of CPUs, updates the shared counters and answers the
//! CPU selection and sibling registration programs.
//!
//! Time is simulated: every [`SimKernel::step`] advances a [`ManualClock`] (shared with the
//! scheduler's policy) by the longest slice executed in that step. Each task alternates a CPU
//! burst and a voluntary sleep; a task with no sleep is a CPU hog.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use anyhow::anyhow;
use anyhow::Result;
use crossbeam::channel::TrySendError;
use log::debug;

use crate::clock::Clock;
use crate::clock::ManualClock;
use crate::control_block::ControlBlock;
use crate::control_block::LocalControlBlock;
use crate::exit_info::ExitInfo;
use crate::exit_info::ScxExitKind;
use crate::kernel::CpuSelector;
use crate::kernel::ExitInfoSource;
use crate::kernel::KernelLink;
use crate::topology::CacheLevel;
use crate::topology::CacheTopology;
use crate::transport;
use crate::transport::KernelEnd;
use crate::wire::DispatchedTask;
use crate::wire::DomainArg;
use crate::wire::QueuedTask;
use crate::wire::TaskCpuArg;
use crate::wire::SCX_ENQ_WAKEUP;

/// Slice used by the simulated dispatcher when a task is dispatched with slice_ns == 0.
pub const SIM_SLICE_DEFAULT: u64 = 20_000_000;

// Time advanced by a step where no task ran.
const SIM_IDLE_TICK: u64 = 1_000_000;

// -EBUSY, returned by the CPU selection program when no idle CPU is available.
const EBUSY: i32 = -16;

/// Kernel sched_prio_to_weight table, nice -20..19.
const SCHED_PRIO_TO_WEIGHT: [u64; 40] = [
    /* -20 */ 88761, 71755, 56483, 46273, 36291, /* -15 */ 29154, 23254, 18705, 14949,
    11916, /* -10 */ 9548, 7620, 6100, 4904, 3906, /*  -5 */ 3121, 2501, 1991, 1586,
    1277, /*   0 */ 1024, 820, 655, 526, 423, /*   5 */ 335, 272, 215, 172, 137,
    /*  10 */ 110, 87, 70, 56, 45, /*  15 */ 36, 29, 23, 18, 15,
];

/// Weight seen by sched_ext for a nice value (cgroup-weight space, 100 = nice 0).
pub fn nice_to_weight(nice: i8) -> u64 {
    let weight = SCHED_PRIO_TO_WEIGHT[(nice.clamp(-20, 19) + 20) as usize];
    ((weight * 100 + 512) / 1024).clamp(1, 10000)
}

/// Definition of a simulated task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimTask {
    pub pid: i32,
    pub weight: u64,
    pub burst_ns: u64, // CPU time consumed before each voluntary sleep
    pub sleep_ns: u64, // sleep length (0 = never sleeps)
}

impl SimTask {
    /// CPU-bound task at nice 0.
    pub fn hog(pid: i32) -> Self {
        Self {
            pid,
            weight: 100,
            burst_ns: u64::MAX,
            sleep_ns: 0,
        }
    }

    /// Task that runs `burst_ns` and then sleeps `sleep_ns`, at nice 0.
    pub fn periodic(pid: i32, burst_ns: u64, sleep_ns: u64) -> Self {
        Self {
            pid,
            weight: 100,
            burst_ns: burst_ns.max(1),
            sleep_ns,
        }
    }

    pub fn weight(mut self, weight: u64) -> Self {
        self.weight = weight;
        self
    }

    pub fn nice(self, nice: i8) -> Self {
        self.weight(nice_to_weight(nice))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    Sleeping { until: u64 },
    Runnable,
    Queued,
    Dispatched,
}

#[derive(Debug, Clone)]
struct SimTaskState {
    def: SimTask,
    state: TaskState,
    wakeup: bool, // next enqueue is a wakeup
    sum_exec_runtime: u64,
    nvcsw: u64,
    burst_left: u64,
    cpu: i32,
    cpumask_cnt: u64,
    nr_dispatches: u64,
    last_dispatch: Option<DispatchedTask>,
}

/// Statistics of a single [`SimKernel::step`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepStats {
    pub nr_enqueued: usize,   // tasks sent to the queued ring buffer
    pub nr_congested: usize,  // tasks that found the queued ring buffer full
    pub nr_dispatched: usize, // dispatched records consumed
    pub nr_cancelled: usize,  // dispatches dropped because of a stale cpumask
    pub nr_ran: usize,        // tasks executed
    pub elapsed_ns: u64,      // simulated time advanced
}

// State shared with the program / exit info handles given to the scheduler.
#[derive(Debug, Default)]
struct SimControl {
    no_idle: bool,                  // CPU selection never finds an idle CPU
    fail_select: bool,              // CPU selection program fails to run
    fail_sibling: Option<u32>,      // return value of the sibling registration program
    registrations: Vec<DomainArg>,  // sibling registrations received
    nr_select_calls: u64,           // CPU selection requests received
    exit: ExitInfo,                 // exit state published to the scheduler
}

fn lock(control: &Mutex<SimControl>) -> MutexGuard<'_, SimControl> {
    control.lock().unwrap_or_else(|e| e.into_inner())
}

struct SimCpuSelector {
    control: Arc<Mutex<SimControl>>,
}

impl CpuSelector for SimCpuSelector {
    fn select_cpu(&mut self, arg: &TaskCpuArg) -> Result<u32> {
        let mut control = lock(&self.control);
        control.nr_select_calls += 1;
        if control.fail_select {
            return Err(anyhow!("rs_select_cpu: test run failed"));
        }
        if control.no_idle || arg.cpu < 0 {
            return Ok(EBUSY as u32);
        }
        Ok(arg.cpu as u32)
    }

    fn enable_sibling_cpu(&mut self, arg: &DomainArg) -> Result<u32> {
        let mut control = lock(&self.control);
        control.registrations.push(*arg);
        Ok(control.fail_sibling.unwrap_or(0))
    }
}

struct SimExitInfo {
    control: Arc<Mutex<SimControl>>,
}

impl ExitInfoSource for SimExitInfo {
    fn exit_info(&mut self) -> Result<ExitInfo> {
        Ok(lock(&self.control).exit.clone())
    }

    fn detach(&mut self) -> Result<()> {
        let mut control = lock(&self.control);
        if !control.exit.exited() {
            control.exit = ExitInfo {
                kind: ScxExitKind::Unreg as i32,
                exit_code: 0,
                reason: Some("unregistered from user space".into()),
                msg: None,
            };
        }
        Ok(())
    }
}

pub struct SimKernel {
    nr_cpus: usize,
    end: KernelEnd,
    cb: LocalControlBlock,
    clock: ManualClock,
    control: Arc<Mutex<SimControl>>,
    tasks: BTreeMap<i32, SimTaskState>,
    runq: BTreeMap<(u64, u64), DispatchedTask>, // dispatched tasks ordered by (vtime, seq)
    seq: u64,
}

impl SimKernel {
    /// Create a simulated BPF component with `nr_cpus` CPUs and ring buffers of `capacity`
    /// records, returning the link to hand over to the scheduler.
    pub fn new(nr_cpus: usize, capacity: usize) -> (Self, KernelLink) {
        let (transport, end) = transport::channel(capacity);
        let cb = LocalControlBlock::new(ControlBlock::SIZE);
        cb.update_with(|cb| cb.nr_online_cpus = nr_cpus as u64);
        let control = Arc::new(Mutex::new(SimControl::default()));

        let link = KernelLink {
            transport,
            control_block: Some(Box::new(cb.clone())),
            cpu_selector: Some(Box::new(SimCpuSelector {
                control: control.clone(),
            })),
            exit_info: Box::new(SimExitInfo {
                control: control.clone(),
            }),
        };

        (
            Self {
                nr_cpus: nr_cpus.max(1),
                end,
                cb,
                clock: ManualClock::new(0),
                control,
                tasks: BTreeMap::new(),
                runq: BTreeMap::new(),
                seq: 0,
            },
            link,
        )
    }

    /// Simulated time source, to be shared with the scheduler's policy.
    pub fn clock(&self) -> ManualClock {
        self.clock.clone()
    }

    pub fn now(&self) -> u64 {
        self.clock.now_ns()
    }

    pub fn nr_cpus(&self) -> usize {
        self.nr_cpus
    }

    /// Topology with pairs of SMT siblings sharing an L2 and a single L3.
    pub fn topology(&self) -> CacheTopology {
        let cpus: Vec<usize> = (0..self.nr_cpus).collect();
        let mut groups: Vec<(CacheLevel, Vec<usize>)> = cpus
            .chunks(2)
            .map(|pair| (CacheLevel::L2, pair.to_vec()))
            .collect();
        groups.push((CacheLevel::L3, cpus));
        CacheTopology::from_groups(groups)
    }

    /// Snapshot of the shared counters.
    pub fn control_block(&self) -> ControlBlock {
        self.cb.snapshot()
    }

    pub fn add_task(&mut self, def: SimTask) {
        let pid = def.pid;
        let cpu = (pid.unsigned_abs() as usize % self.nr_cpus) as i32;
        self.tasks.insert(
            pid,
            SimTaskState {
                burst_left: def.burst_ns,
                def,
                state: TaskState::Runnable,
                wakeup: true,
                sum_exec_runtime: 0,
                nvcsw: 0,
                cpu,
                cpumask_cnt: 0,
                nr_dispatches: 0,
                last_dispatch: None,
            },
        );
    }

    /// Terminate a task, notifying the scheduler through an exit record.
    pub fn exit_task(&mut self, pid: i32) -> bool {
        if self.tasks.remove(&pid).is_none() {
            return false;
        }
        self.runq.retain(|_, task| task.pid != pid);
        let record = QueuedTask {
            pid,
            cpu: -1,
            ..Default::default()
        };
        if self.end.queued.try_send(record.to_bytes().to_vec()).is_ok() {
            self.cb.update_with(|cb| cb.nr_queued += 1);
        }
        true
    }

    /// Change the affinity of a task: dispatches carrying the previous generation are cancelled.
    pub fn set_affinity_changed(&mut self, pid: i32) {
        if let Some(task) = self.tasks.get_mut(&pid) {
            task.cpumask_cnt += 1;
        }
    }

    /// Publish an exit condition, as the BPF component does when it gets unregistered.
    pub fn exit(&self, kind: ScxExitKind, exit_code: i64, reason: &str) {
        lock(&self.control).exit = ExitInfo {
            kind: kind as i32,
            exit_code,
            reason: Some(reason.into()),
            msg: None,
        };
    }

    pub fn set_no_idle(&self, no_idle: bool) {
        lock(&self.control).no_idle = no_idle;
    }

    pub fn set_select_failure(&self, fail: bool) {
        lock(&self.control).fail_select = fail;
    }

    /// Make the sibling registration program return `ret` (None = success).
    pub fn set_sibling_failure(&self, ret: Option<u32>) {
        lock(&self.control).fail_sibling = ret;
    }

    pub fn registrations(&self) -> Vec<DomainArg> {
        lock(&self.control).registrations.clone()
    }

    pub fn nr_select_calls(&self) -> u64 {
        lock(&self.control).nr_select_calls
    }

    pub fn runtime(&self, pid: i32) -> Option<u64> {
        self.tasks.get(&pid).map(|t| t.sum_exec_runtime)
    }

    pub fn nvcsw(&self, pid: i32) -> Option<u64> {
        self.tasks.get(&pid).map(|t| t.nvcsw)
    }

    pub fn nr_dispatches(&self, pid: i32) -> Option<u64> {
        self.tasks.get(&pid).map(|t| t.nr_dispatches)
    }

    pub fn last_dispatch(&self, pid: i32) -> Option<&DispatchedTask> {
        self.tasks.get(&pid).and_then(|t| t.last_dispatch.as_ref())
    }

    fn enqueue_runnable(&mut self, now: u64, stats: &mut StepStats) {
        for (pid, task) in self.tasks.iter_mut() {
            if let TaskState::Sleeping { until } = task.state {
                if until <= now {
                    task.state = TaskState::Runnable;
                    task.wakeup = true;
                }
            }
            if task.state != TaskState::Runnable {
                continue;
            }
            let record = QueuedTask {
                pid: *pid,
                cpu: task.cpu,
                flags: if task.wakeup { SCX_ENQ_WAKEUP } else { 0 },
                sum_exec_runtime: task.sum_exec_runtime,
                nvcsw: task.nvcsw,
                weight: task.def.weight,
                slice: 0,
                vtime: 0,
                cpumask_cnt: task.cpumask_cnt,
            };
            match self.end.queued.try_send(record.to_bytes().to_vec()) {
                Ok(()) => {
                    task.state = TaskState::Queued;
                    task.wakeup = false;
                    self.cb.update_with(|cb| cb.nr_queued += 1);
                    stats.nr_enqueued += 1;
                }
                Err(TrySendError::Full(_)) => {
                    self.cb.update_with(|cb| cb.nr_sched_congested += 1);
                    stats.nr_congested += 1;
                }
                // Nobody is listening anymore.
                Err(TrySendError::Disconnected(_)) => break,
            }
        }
    }

    fn consume_dispatched(&mut self, stats: &mut StepStats) {
        while let Ok(record) = self.end.dispatched.try_recv() {
            stats.nr_dispatched += 1;
            let Ok(dispatched) = DispatchedTask::from_bytes(&record) else {
                self.cb.update_with(|cb| cb.nr_failed_dispatches += 1);
                continue;
            };
            let Some(task) = self.tasks.get_mut(&dispatched.pid) else {
                // Task exited in the meantime.
                self.cb.update_with(|cb| cb.nr_failed_dispatches += 1);
                continue;
            };
            if task.state != TaskState::Queued {
                self.cb.update_with(|cb| cb.nr_failed_dispatches += 1);
                continue;
            }
            if dispatched.cpumask_cnt != task.cpumask_cnt {
                // Affinity changed after the task was queued: enqueue it again.
                debug!("pid {}: stale cpumask, dispatch cancelled", dispatched.pid);
                task.state = TaskState::Runnable;
                stats.nr_cancelled += 1;
                self.cb.update_with(|cb| cb.nr_cancel_dispatches += 1);
                continue;
            }
            task.state = TaskState::Dispatched;
            task.nr_dispatches += 1;
            task.last_dispatch = Some(dispatched.clone());
            self.cb.update_with(|cb| cb.nr_user_dispatches += 1);
            self.runq.insert((dispatched.vtime, self.seq), dispatched);
            self.seq += 1;
        }
    }

    fn run_tasks(&mut self, now: u64, stats: &mut StepStats) {
        let mut elapsed = 0;
        let mut nr_running = 0;

        for cpu in 0..self.nr_cpus {
            let Some((_, dispatched)) = self.runq.pop_first() else {
                break;
            };
            let Some(task) = self.tasks.get_mut(&dispatched.pid) else {
                continue;
            };
            let slice = match dispatched.slice_ns {
                0 => SIM_SLICE_DEFAULT,
                slice => slice,
            };
            let ran = slice.min(task.burst_left);
            task.sum_exec_runtime = task.sum_exec_runtime.saturating_add(ran);
            task.burst_left -= ran;
            task.cpu = cpu as i32;
            if task.burst_left == 0 {
                // Voluntary context switch.
                task.nvcsw += 1;
                task.burst_left = task.def.burst_ns;
                task.state = TaskState::Sleeping {
                    until: now + ran + task.def.sleep_ns,
                };
            } else {
                task.state = TaskState::Runnable;
            }
            elapsed = elapsed.max(ran);
            nr_running += 1;
        }

        stats.nr_ran = nr_running;
        stats.elapsed_ns = if elapsed == 0 { SIM_IDLE_TICK } else { elapsed };
        self.cb.update_with(|cb| cb.nr_running = nr_running as u64);
    }

    /// Advance the simulation by one scheduling round:
    ///
    ///  - wake up the tasks whose sleep expired and queue all the runnable tasks
    ///  - consume the tasks dispatched by the scheduler
    ///  - run up to nr_cpus dispatched tasks, in vtime order, for their time slice
    pub fn step(&mut self) -> StepStats {
        let now = self.clock.now_ns();
        let mut stats = StepStats::default();

        self.enqueue_runnable(now, &mut stats);
        self.consume_dispatched(&mut stats);
        self.run_tasks(now, &mut stats);
        self.clock.advance(stats.elapsed_ns);

        stats
    }
}
