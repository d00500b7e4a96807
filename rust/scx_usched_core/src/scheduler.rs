// Copyright (c) Andrea Righi <andrea.righi@linux.dev>

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Main scheduling loop.
//!
//! Each cycle drains the tasks queued by the BPF component into the policy's pool, picks one
//! task, assigns a CPU, a time slice and a deadline to it, and sends it back to the BPF
//! dispatcher. The loop runs on a single thread, which is the only writer of the policy state.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use anyhow::Result;
use log::debug;
use log::info;
use log::warn;

use crate::control_block::ControlBlock;
use crate::control_block::SharedControlBlock;
use crate::error::SchedError;
use crate::error::TransportError;
use crate::exit_info::ExitInfo;
use crate::fairness::FairnessConfig;
use crate::fairness::EVICT_AFTER_CYCLES;
use crate::fairness::SLICE_NS_DEFAULT;
use crate::fairness::SLICE_NS_MIN;
use crate::kernel::ExitInfoSource;
use crate::kernel::KernelLink;
use crate::placement::PlacementAdvisor;
use crate::policy::SchedulingPolicy;
use crate::policy::VruntimePolicy;
use crate::stats::Metrics;
use crate::topology::CacheTopology;
use crate::transport::Transport;
use crate::wire::DispatchedTask;
use crate::wire::RL_CPU_ANY;
use crate::SCHEDULER_NAME;

// How often the exit state of the BPF component is checked.
const EXIT_CHECK_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub slice_ns: u64,                    // Default time slice (in ns)
    pub slice_ns_min: u64,                // Minimum time slice (in ns)
    pub evict_after_cycles: u64,          // Forget tasks not seen for this many decisions
    pub idle_timeout: Option<Duration>,   // Max wait for new tasks when idle (None = forever)
    pub stats_interval: Option<Duration>, // Statistics reporting interval (None = disabled)
    pub stats_json: bool,                 // Report statistics as JSON
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            slice_ns: SLICE_NS_DEFAULT,
            slice_ns_min: SLICE_NS_MIN,
            evict_after_cycles: EVICT_AFTER_CYCLES,
            idle_timeout: Some(EXIT_CHECK_INTERVAL),
            stats_interval: Some(Duration::from_secs(1)),
            stats_json: false,
        }
    }
}

impl SchedulerConfig {
    pub fn fairness(&self) -> FairnessConfig {
        FairnessConfig {
            slice_ns: self.slice_ns,
            slice_ns_min: self.slice_ns_min,
            evict_after_cycles: self.evict_after_cycles,
        }
    }
}

pub struct Scheduler<P: SchedulingPolicy = VruntimePolicy> {
    transport: Transport,               // queued / dispatched ring buffers
    control_block: SharedControlBlock,  // counters shared with the BPF component
    placement: PlacementAdvisor,        // BPF idle CPU selection
    exit_info: Box<dyn ExitInfoSource>, // BPF exit state
    policy: P,                          // scheduling policy
    config: SchedulerConfig,
    shutdown: Arc<AtomicBool>,
    nr_dispatched: u64,       // tasks sent to the BPF dispatcher
    nr_placement_errors: u64, // CPU selections that fell back to RL_CPU_ANY
    nr_dispatch_errors: u64,  // tasks dropped because the dispatched queue was full
    prev_metrics: Metrics,    // last reported statistics
}

impl<P: SchedulingPolicy> Scheduler<P> {
    pub fn init(
        link: KernelLink,
        topo: &CacheTopology,
        policy: P,
        config: SchedulerConfig,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self, SchedError> {
        let KernelLink {
            transport,
            control_block,
            cpu_selector,
            exit_info,
        } = link;

        // Let the BPF component know who the user-space scheduler is, so that it is never
        // scheduled through the ring buffers.
        let mut control_block = SharedControlBlock::new(control_block);
        control_block.register_scheduler_pid(std::process::id())?;

        // Initialize cache domains.
        let mut placement = PlacementAdvisor::new(cpu_selector);
        placement.register_sibling_domains(topo)?;

        info!(
            "{} scheduler attached (slice={}us slice_min={}us)",
            SCHEDULER_NAME,
            config.slice_ns / 1000,
            config.slice_ns_min / 1000
        );

        Ok(Self {
            transport,
            control_block,
            placement,
            exit_info,
            policy,
            config,
            shutdown,
            nr_dispatched: 0,
            nr_placement_errors: 0,
            nr_dispatch_errors: 0,
            prev_metrics: Metrics::default(),
        })
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    // Update nr_scheduled to notify the dispatcher how many tasks are still waiting in the
    // scheduler, so that it stops waking us up when nothing is left.
    fn notify_complete(&mut self, nr_pending: u64) {
        if let Err(err) = self.control_block.notify_completion(nr_pending) {
            debug!("failed to update nr_scheduled: {}", err);
        }
    }

    /// Run one scheduling cycle: returns `Ok(false)` if there was nothing to dispatch.
    pub fn schedule(&mut self) -> Result<bool, SchedError> {
        self.policy
            .drain_queued_tasks(&mut self.transport, &mut self.control_block)?;

        let Some(task) = self.policy.select_queued_task() else {
            self.notify_complete(0);
            return Ok(false);
        };

        // Pick a CPU, falling back to the first CPU available.
        let cpu = match self.policy.select_cpu(&mut self.placement, &task) {
            Ok(cpu) => cpu,
            Err(err) => {
                debug!("pid {}: {}", task.pid, err);
                self.nr_placement_errors += 1;
                RL_CPU_ANY
            }
        };

        let cb = match self.control_block.read_snapshot() {
            Ok(cb) => cb,
            Err(err) => {
                debug!("failed to read the control block: {}", err);
                ControlBlock::default()
            }
        };
        let decision = self.policy.determine_time_slice(&task, &cb);

        let mut dispatched_task = DispatchedTask::new(&task);
        dispatched_task.cpu = cpu;
        dispatched_task.slice_ns = decision.slice_ns;
        dispatched_task.vtime = decision.vtime;

        // Send task to the BPF dispatcher (a full queue drops this task only).
        match self.transport.dispatch(dispatched_task.to_bytes().to_vec()) {
            Ok(()) => self.nr_dispatched += 1,
            Err(TransportError::Full) => {
                warn!("pid {}: dispatch queue full, task skipped", task.pid);
                self.nr_dispatch_errors += 1;
            }
            Err(err) => return Err(err.into()),
        }

        self.notify_complete(self.policy.pool_count());

        // Yield to avoid using too much CPU from the scheduler itself.
        thread::yield_now();

        Ok(true)
    }

    pub fn metrics(&self) -> Metrics {
        let cb = self.control_block.read_snapshot().unwrap_or_default();
        Metrics {
            nr_tasks: self.policy.nr_tasks(),
            min_vruntime: self.policy.min_vruntime(),
            nr_dispatched: self.nr_dispatched,
            nr_malformed: self.policy.nr_malformed(),
            nr_placement_errors: self.nr_placement_errors,
            nr_dispatch_errors: self.nr_dispatch_errors,
            ..Default::default()
        }
        .with_control_block(&cb)
    }

    // Print internal scheduler statistics (fetched from the BPF part and from the policy).
    fn print_stats(&mut self) {
        let metrics = self.metrics();
        let delta = metrics.delta(&self.prev_metrics);

        if self.config.stats_json {
            match delta.to_json() {
                Ok(json) => info!("{}", json),
                Err(err) => warn!("failed to encode statistics: {}", err),
            }
        } else {
            let mut buf = vec![];
            if delta.format(&mut buf).is_ok() {
                info!("{}", String::from_utf8_lossy(&buf).trim_end());
            }
        }
        if delta.nr_sched_congested > 0 {
            warn!(
                "scheduler congested: {} events in the last interval",
                delta.nr_sched_congested
            );
        }
        self.prev_metrics = metrics;

        log::logger().flush();
    }

    fn exited(&mut self) -> bool {
        match self.exit_info.exit_info() {
            Ok(uei) => uei.exited(),
            Err(err) => {
                warn!("failed to read exit info: {:#}", err);
                false
            }
        }
    }

    /// Schedule tasks until shutdown is requested or the BPF component exits, then unregister
    /// the scheduler and report the exit state.
    pub fn run(&mut self) -> Result<ExitInfo> {
        let mut prev_stats = Instant::now();
        let mut prev_check = Instant::now();

        while !self.shutdown.load(Ordering::Relaxed) {
            if prev_check.elapsed() >= EXIT_CHECK_INTERVAL {
                if self.exited() {
                    break;
                }
                prev_check = Instant::now();
            }

            // Call the main scheduler body, sleeping when there is nothing to do.
            if !self.schedule()? {
                self.transport
                    .block_until_ready(self.config.idle_timeout, &self.shutdown)?;
            }

            if let Some(interval) = self.config.stats_interval {
                if prev_stats.elapsed() >= interval {
                    self.print_stats();
                    prev_stats = Instant::now();
                }
            }
        }
        // Dump scheduler statistics before exiting
        self.print_stats();

        self.exit_info
            .detach()
            .context("Failed to detach the BPF scheduler")?;
        let uei = self
            .exit_info
            .exit_info()
            .context("Failed to read exit info")?;
        uei.report()?;

        Ok(uei)
    }
}

// Unregister the scheduler.
impl<P: SchedulingPolicy> Drop for Scheduler<P> {
    fn drop(&mut self) {
        info!("Unregister {} scheduler", SCHEDULER_NAME);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use anyhow::anyhow;

    use crate::clock::ManualClock;
    use crate::control_block::LocalControlBlock;
    use crate::error::ControlBlockError;
    use crate::fairness::FairnessEngine;
    use crate::kernel::ControlBlockMap;
    use crate::kernel::CpuSelector;
    use crate::topology::CacheLevel;
    use crate::transport;
    use crate::transport::KernelEnd;
    use crate::wire::DomainArg;
    use crate::wire::QueuedTask;
    use crate::wire::TaskCpuArg;

    struct Running;

    impl ExitInfoSource for Running {
        fn exit_info(&mut self) -> Result<ExitInfo> {
            Ok(ExitInfo::default())
        }
    }

    struct NoIdle;

    impl CpuSelector for NoIdle {
        fn select_cpu(&mut self, _arg: &TaskCpuArg) -> Result<u32> {
            Ok(-16i32 as u32)
        }

        fn enable_sibling_cpu(&mut self, _arg: &DomainArg) -> Result<u32> {
            Err(anyhow!("program not loaded"))
        }
    }

    fn link(
        capacity: usize,
        cb: Option<&LocalControlBlock>,
        selector: Option<Box<dyn CpuSelector>>,
    ) -> (KernelLink, KernelEnd) {
        let (transport, kernel) = transport::channel(capacity);
        (
            KernelLink {
                transport,
                control_block: cb.map(|cb| Box::new(cb.clone()) as Box<dyn ControlBlockMap>),
                cpu_selector: selector,
                exit_info: Box::new(Running),
            },
            kernel,
        )
    }

    fn policy() -> VruntimePolicy<ManualClock> {
        VruntimePolicy::with_engine(FairnessEngine::with_clock(
            FairnessConfig::default(),
            ManualClock::new(0),
        ))
    }

    fn scheduler(link: KernelLink) -> Scheduler<VruntimePolicy<ManualClock>> {
        Scheduler::init(
            link,
            &CacheTopology::default(),
            policy(),
            SchedulerConfig::default(),
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap()
    }

    fn queued(pid: i32, runtime: u64) -> Vec<u8> {
        QueuedTask {
            pid,
            cpu: 2,
            sum_exec_runtime: runtime,
            weight: 100,
            cpumask_cnt: 9,
            ..Default::default()
        }
        .to_bytes()
        .to_vec()
    }

    #[test]
    fn test_init_registers_pid() {
        let local = LocalControlBlock::new(ControlBlock::SIZE);
        let (link, _kernel) = link(8, Some(&local), None);
        let _sched = scheduler(link);
        assert_eq!(local.snapshot().usersched_pid, std::process::id());
    }

    #[test]
    fn test_init_without_control_block() {
        let (link, _kernel) = link(8, None, None);
        let res = Scheduler::init(
            link,
            &CacheTopology::default(),
            policy(),
            SchedulerConfig::default(),
            Arc::new(AtomicBool::new(false)),
        );
        assert!(matches!(
            res,
            Err(SchedError::ControlBlock(ControlBlockError::Unavailable))
        ));
    }

    #[test]
    fn test_init_topology_failure() {
        let local = LocalControlBlock::new(ControlBlock::SIZE);
        let (link, _kernel) = link(8, Some(&local), Some(Box::new(NoIdle)));
        let topo = CacheTopology::from_groups(vec![(CacheLevel::L2, vec![0, 1])]);
        let res = Scheduler::init(
            link,
            &topo,
            policy(),
            SchedulerConfig::default(),
            Arc::new(AtomicBool::new(false)),
        );
        assert!(matches!(res, Err(SchedError::Topology(_))));
    }

    #[test]
    fn test_schedule_idle() {
        let local = LocalControlBlock::new(ControlBlock::SIZE);
        let (link, _kernel) = link(8, Some(&local), None);
        let mut sched = scheduler(link);
        local.update_with(|cb| cb.nr_scheduled = 5);

        assert!(!sched.schedule().unwrap());
        assert_eq!(local.snapshot().nr_scheduled, 0);
    }

    #[test]
    fn test_schedule_dispatches_in_order() {
        let local = LocalControlBlock::new(ControlBlock::SIZE);
        let (link, kernel) = link(8, Some(&local), Some(Box::new(NoIdle)));
        let mut sched = scheduler(link);
        local.update_with(|cb| cb.nr_queued = 2);
        kernel.queued.send(queued(1, 0)).unwrap();
        kernel.queued.send(queued(2, 0)).unwrap();

        assert!(sched.schedule().unwrap());
        let snap = local.snapshot();
        assert_eq!(snap.nr_queued, 0);
        assert_eq!(snap.nr_scheduled, 1);

        let d = DispatchedTask::from_bytes(&kernel.dispatched.try_recv().unwrap()).unwrap();
        assert_eq!(d.pid, 1);
        assert_eq!(d.cpu, RL_CPU_ANY);
        assert_eq!(d.cpumask_cnt, 9);
        assert_eq!(d.slice_ns, SLICE_NS_DEFAULT);

        assert!(sched.schedule().unwrap());
        let d = DispatchedTask::from_bytes(&kernel.dispatched.try_recv().unwrap()).unwrap();
        assert_eq!(d.pid, 2);
        // One task was still pending at the end of the previous cycle.
        assert_eq!(d.slice_ns, SLICE_NS_DEFAULT / 2);
        assert_eq!(local.snapshot().nr_scheduled, 0);

        assert!(!sched.schedule().unwrap());
        let m = sched.metrics();
        assert_eq!(m.nr_dispatched, 2);
        assert_eq!(m.nr_placement_errors, 0);
        assert_eq!(m.nr_tasks, 2);
    }

    #[test]
    fn test_schedule_degraded() {
        // No control block snapshot is possible after init and no CPU selection program: tasks
        // are still dispatched, with the default slice on any CPU.
        let local = LocalControlBlock::new(ControlBlock::SIZE);
        let (link, kernel) = link(8, Some(&local), None);
        let mut sched = scheduler(link);
        sched.control_block = SharedControlBlock::new(None);
        kernel.queued.send(queued(1, 0)).unwrap();

        assert!(sched.schedule().unwrap());
        let d = DispatchedTask::from_bytes(&kernel.dispatched.try_recv().unwrap()).unwrap();
        assert_eq!(d.cpu, RL_CPU_ANY);
        assert_eq!(d.slice_ns, SLICE_NS_DEFAULT);
        assert_eq!(sched.metrics().nr_placement_errors, 1);
    }

    #[test]
    fn test_schedule_dispatch_full() {
        let local = LocalControlBlock::new(ControlBlock::SIZE);
        let (link, kernel) = link(1, Some(&local), None);
        let mut sched = scheduler(link);
        kernel.queued.send(queued(1, 0)).unwrap();
        assert!(sched.schedule().unwrap());
        kernel.queued.send(queued(2, 0)).unwrap();
        // The dispatched queue is still holding pid 1.
        assert!(sched.schedule().unwrap());
        assert_eq!(sched.metrics().nr_dispatch_errors, 1);
        assert_eq!(sched.metrics().nr_dispatched, 1);
    }

    #[test]
    fn test_schedule_disconnected() {
        let local = LocalControlBlock::new(ControlBlock::SIZE);
        let (link, kernel) = link(8, Some(&local), None);
        let mut sched = scheduler(link);
        drop(kernel);
        assert!(matches!(
            sched.schedule(),
            Err(SchedError::Transport(TransportError::Disconnected))
        ));
    }

    #[test]
    fn test_run_shutdown() {
        let local = LocalControlBlock::new(ControlBlock::SIZE);
        let (link, _kernel) = link(8, Some(&local), None);
        let shutdown = Arc::new(AtomicBool::new(true));
        let mut sched = Scheduler::init(
            link,
            &CacheTopology::default(),
            policy(),
            SchedulerConfig::default(),
            shutdown,
        )
        .unwrap();
        let uei = sched.run().unwrap();
        assert!(!uei.exited());
    }
}
