// Copyright (c) Andrea Righi <andrea.righi@linux.dev>

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Scheduling policies.
//!
//! A policy decides which queued task runs next, where and for how long. The control loop only
//! moves records around; any policy implementing [`SchedulingPolicy`] can be plugged into a
//! [`crate::Scheduler`] at construction time. [`VruntimePolicy`] is the default one.

use std::collections::VecDeque;

use log::debug;
use log::warn;

use crate::clock::Clock;
use crate::clock::MonotonicClock;
use crate::control_block::ControlBlock;
use crate::control_block::SharedControlBlock;
use crate::error::PlacementError;
use crate::error::TransportError;
use crate::fairness::FairnessConfig;
use crate::fairness::FairnessEngine;
use crate::fairness::SliceDecision;
use crate::placement::PlacementAdvisor;
use crate::transport::Transport;
use crate::wire::QueuedTask;

pub trait SchedulingPolicy {
    /// Move all the tasks currently queued by the BPF component into the policy's pool,
    /// returning how many runnable tasks were added.
    fn drain_queued_tasks(
        &mut self,
        transport: &mut Transport,
        cb: &mut SharedControlBlock,
    ) -> Result<usize, TransportError>;

    /// Pick the next task to dispatch, if any.
    fn select_queued_task(&mut self) -> Option<QueuedTask>;

    /// Pick the target CPU of a task (RL_CPU_ANY for any CPU).
    fn select_cpu(
        &mut self,
        advisor: &mut PlacementAdvisor,
        task: &QueuedTask,
    ) -> Result<i32, PlacementError>;

    /// Assign a time slice and a deadline to a task.
    fn determine_time_slice(&mut self, task: &QueuedTask, cb: &ControlBlock) -> SliceDecision;

    /// Amount of tasks still waiting in the pool.
    fn pool_count(&self) -> u64;

    /// Amount of tasks the policy keeps state for.
    fn nr_tasks(&self) -> u64 {
        0
    }

    /// Global vruntime watermark, for policies that have one.
    fn min_vruntime(&self) -> u64 {
        0
    }

    /// Records dropped because they could not be decoded.
    fn nr_malformed(&self) -> u64 {
        0
    }
}

/// Result of a [`drain_queued`] pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainOutcome {
    pub nr_tasks: usize,     // runnable tasks received
    pub nr_exited: usize,    // exit notifications received
    pub nr_malformed: usize, // records dropped
}

/// Consume all the records available in the queued ring buffer.
///
/// Runnable tasks are passed to `enqueue`, exit notifications to `exited`. Every record consumed
/// is accounted in the shared `nr_queued` counter, which is reset once the queue is empty.
pub fn drain_queued(
    transport: &mut Transport,
    cb: &mut SharedControlBlock,
    mut enqueue: impl FnMut(QueuedTask),
    mut exited: impl FnMut(i32),
) -> Result<DrainOutcome, TransportError> {
    let mut outcome = DrainOutcome::default();

    loop {
        match transport.try_dequeue()? {
            Some(record) => {
                if let Err(err) = cb.decrement_queued_count() {
                    debug!("failed to update nr_queued: {}", err);
                }
                match QueuedTask::from_bytes(&record) {
                    // Check for exiting tasks (cpu < 0) and forget them.
                    Ok(task) if task.is_exiting() => {
                        exited(task.pid);
                        outcome.nr_exited += 1;
                    }
                    Ok(task) => {
                        enqueue(task);
                        outcome.nr_tasks += 1;
                    }
                    Err(err) => {
                        warn!("dropping queued record: {}", err);
                        outcome.nr_malformed += 1;
                    }
                }
            }
            None => {
                // Queued tasks are drained, but there may still be some work left to do in the
                // scheduler.
                if let Err(err) = cb.set_queued_count(0) {
                    debug!("failed to reset nr_queued: {}", err);
                }
                break;
            }
        }
    }

    Ok(outcome)
}

/// Default policy: FIFO pool, BPF idle CPU selection, vruntime-based slice and deadline.
pub struct VruntimePolicy<C: Clock = MonotonicClock> {
    pool: VecDeque<QueuedTask>,
    engine: FairnessEngine<C>,
    nr_malformed: u64,
}

impl VruntimePolicy<MonotonicClock> {
    pub fn new(config: FairnessConfig) -> Self {
        Self::with_engine(FairnessEngine::new(config))
    }
}

impl Default for VruntimePolicy<MonotonicClock> {
    fn default() -> Self {
        Self::new(FairnessConfig::default())
    }
}

impl<C: Clock> VruntimePolicy<C> {
    pub fn with_engine(engine: FairnessEngine<C>) -> Self {
        Self {
            pool: VecDeque::new(),
            engine,
            nr_malformed: 0,
        }
    }

    pub fn engine(&self) -> &FairnessEngine<C> {
        &self.engine
    }
}

impl<C: Clock> SchedulingPolicy for VruntimePolicy<C> {
    fn drain_queued_tasks(
        &mut self,
        transport: &mut Transport,
        cb: &mut SharedControlBlock,
    ) -> Result<usize, TransportError> {
        let pool = &mut self.pool;
        let engine = &mut self.engine;
        let outcome = drain_queued(
            transport,
            cb,
            |task| pool.push_back(task),
            |pid| {
                engine.task_exited(pid);
            },
        )?;
        self.nr_malformed += outcome.nr_malformed as u64;

        Ok(outcome.nr_tasks)
    }

    fn select_queued_task(&mut self) -> Option<QueuedTask> {
        self.pool.pop_front()
    }

    fn select_cpu(
        &mut self,
        advisor: &mut PlacementAdvisor,
        task: &QueuedTask,
    ) -> Result<i32, PlacementError> {
        advisor.select_cpu(task)
    }

    fn determine_time_slice(&mut self, task: &QueuedTask, cb: &ControlBlock) -> SliceDecision {
        self.engine.decide(task, cb)
    }

    fn pool_count(&self) -> u64 {
        self.pool.len() as u64
    }

    fn nr_tasks(&self) -> u64 {
        self.engine.nr_tasks() as u64
    }

    fn min_vruntime(&self) -> u64 {
        self.engine.min_vruntime()
    }

    fn nr_malformed(&self) -> u64 {
        self.nr_malformed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::clock::ManualClock;
    use crate::control_block::LocalControlBlock;
    use crate::transport;

    fn queued(pid: i32, cpu: i32) -> Vec<u8> {
        QueuedTask {
            pid,
            cpu,
            weight: 100,
            ..Default::default()
        }
        .to_bytes()
        .to_vec()
    }

    fn policy() -> VruntimePolicy<ManualClock> {
        VruntimePolicy::with_engine(FairnessEngine::with_clock(
            FairnessConfig::default(),
            ManualClock::new(0),
        ))
    }

    #[test]
    fn test_drain_fifo() {
        let (mut transport, kernel) = transport::channel(16);
        let local = LocalControlBlock::new(ControlBlock::SIZE);
        let mut cb = SharedControlBlock::new(Some(Box::new(local.clone())));
        local.update_with(|cb| cb.nr_queued = 3);
        for pid in [3, 1, 2] {
            kernel.queued.send(queued(pid, 0)).unwrap();
        }

        let mut policy = policy();
        assert_eq!(policy.drain_queued_tasks(&mut transport, &mut cb).unwrap(), 3);
        assert_eq!(policy.pool_count(), 3);
        assert_eq!(local.snapshot().nr_queued, 0);

        let order: Vec<i32> = std::iter::from_fn(|| policy.select_queued_task())
            .map(|t| t.pid)
            .collect();
        assert_eq!(order, vec![3, 1, 2]);
        assert_eq!(policy.pool_count(), 0);
    }

    #[test]
    fn test_drain_exit_and_malformed() {
        let (mut transport, kernel) = transport::channel(16);
        let mut cb = SharedControlBlock::new(None);
        let mut policy = policy();

        kernel.queued.send(queued(7, 1)).unwrap();
        policy.drain_queued_tasks(&mut transport, &mut cb).unwrap();
        let task = policy.select_queued_task().unwrap();
        policy.determine_time_slice(&task, &ControlBlock::default());
        assert_eq!(policy.nr_tasks(), 1);

        kernel.queued.send(queued(7, -1)).unwrap();
        kernel.queued.send(vec![0u8; 10]).unwrap();
        kernel.queued.send(queued(8, 2)).unwrap();
        // The control block is not mapped: counters are not updated, tasks still flow.
        assert_eq!(policy.drain_queued_tasks(&mut transport, &mut cb).unwrap(), 1);
        assert_eq!(policy.nr_tasks(), 0);
        assert_eq!(policy.nr_malformed(), 1);
        assert_eq!(policy.select_queued_task().unwrap().pid, 8);
    }

    #[test]
    fn test_drain_disconnected() {
        let (mut transport, kernel) = transport::channel(16);
        let mut cb = SharedControlBlock::new(None);
        kernel.queued.send(queued(1, 0)).unwrap();
        drop(kernel);

        let mut n = 0;
        let res = drain_queued(&mut transport, &mut cb, |_| n += 1, |_| {});
        assert_eq!(res, Err(TransportError::Disconnected));
        assert_eq!(n, 1);
    }
}
