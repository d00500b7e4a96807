// Copyright (c) Andrea Righi <andrea.righi@linux.dev>

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Records exchanged with the BPF component.
//!
//! Every record is a fixed-size little-endian image of the corresponding C struct in the BPF
//! interface header. Offsets are spelled out explicitly: the layout is a contract with the kernel
//! side and must never depend on the host's native struct layout.

use crate::error::LayoutError;

/// Dispatch the task on any CPU.
///
/// The task will be dispatched to the global shared DSQ and it will run on the first CPU
/// available.
pub const RL_CPU_ANY: i32 = 1 << 20;

/// Enqueue flag set by the kernel when the task is being woken up.
pub const SCX_ENQ_WAKEUP: u64 = 1;

fn get_i32(buf: &[u8], off: usize) -> i32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    i32::from_le_bytes(b)
}

fn get_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

fn put_i32(buf: &mut [u8], off: usize, val: i32) {
    buf[off..off + 4].copy_from_slice(&val.to_le_bytes());
}

fn put_u64(buf: &mut [u8], off: usize, val: u64) {
    buf[off..off + 8].copy_from_slice(&val.to_le_bytes());
}

fn check_len(record: &'static str, buf: &[u8], expected: usize) -> Result<(), LayoutError> {
    if buf.len() < expected {
        return Err(LayoutError {
            record,
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

// Task queued for scheduling from the BPF component (see queued_task_ctx).
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct QueuedTask {
    pub pid: i32,              // pid that uniquely identifies a task
    pub cpu: i32,              // CPU where the task is running (< 0: task is exiting)
    pub flags: u64,            // task enqueue flags
    pub sum_exec_runtime: u64, // Total cpu time
    pub nvcsw: u64,            // Total amount of voluntary context switches
    pub weight: u64,           // Task static priority
    pub slice: u64,            // Time slice budget
    pub vtime: u64,            // Current vruntime
    pub cpumask_cnt: u64,      // cpumask generation counter
}

impl QueuedTask {
    pub const SIZE: usize = 64;

    /// Decode a record received from the queued ring buffer.
    ///
    /// Records longer than [`QueuedTask::SIZE`] are accepted and the trailing bytes ignored.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, LayoutError> {
        check_len("queued_task_ctx", buf, Self::SIZE)?;

        Ok(Self {
            pid: get_i32(buf, 0),
            cpu: get_i32(buf, 4),
            flags: get_u64(buf, 8),
            sum_exec_runtime: get_u64(buf, 16),
            nvcsw: get_u64(buf, 24),
            weight: get_u64(buf, 32),
            slice: get_u64(buf, 40),
            vtime: get_u64(buf, 48),
            cpumask_cnt: get_u64(buf, 56),
        })
    }

    /// Kernel-side encoding, used by the simulator.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        put_i32(&mut buf, 0, self.pid);
        put_i32(&mut buf, 4, self.cpu);
        put_u64(&mut buf, 8, self.flags);
        put_u64(&mut buf, 16, self.sum_exec_runtime);
        put_u64(&mut buf, 24, self.nvcsw);
        put_u64(&mut buf, 32, self.weight);
        put_u64(&mut buf, 40, self.slice);
        put_u64(&mut buf, 48, self.vtime);
        put_u64(&mut buf, 56, self.cpumask_cnt);
        buf
    }

    pub fn is_wakeup(&self) -> bool {
        self.flags & SCX_ENQ_WAKEUP != 0
    }

    /// The kernel reports exiting tasks with a negative CPU.
    pub fn is_exiting(&self) -> bool {
        self.cpu < 0
    }
}

// Task queued for dispatching to the BPF component (see dispatched_task_ctx).
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct DispatchedTask {
    pub pid: i32,         // pid that uniquely identifies a task
    pub cpu: i32,         // target CPU selected by the scheduler (RL_CPU_ANY = any CPU)
    pub flags: u64,       // special dispatch flags
    pub slice_ns: u64,    // time slice assigned to the task (0 = default)
    pub vtime: u64,       // task deadline / vruntime
    pub cpumask_cnt: u64, // cpumask generation counter (copied from the queued task)
}

impl DispatchedTask {
    pub const SIZE: usize = 40;

    // Create a DispatchedTask from a QueuedTask.
    //
    // A dispatched task should be always originated from a QueuedTask (there is no reason to
    // dispatch a task if it wasn't queued to the scheduler earlier).
    pub fn new(task: &QueuedTask) -> Self {
        DispatchedTask {
            pid: task.pid,
            cpu: task.cpu,
            flags: task.flags,
            cpumask_cnt: task.cpumask_cnt,
            slice_ns: 0, // use default time slice
            vtime: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        put_i32(&mut buf, 0, self.pid);
        put_i32(&mut buf, 4, self.cpu);
        put_u64(&mut buf, 8, self.flags);
        put_u64(&mut buf, 16, self.slice_ns);
        put_u64(&mut buf, 24, self.vtime);
        put_u64(&mut buf, 32, self.cpumask_cnt);
        buf
    }

    /// Kernel-side decoding, used by the simulator.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, LayoutError> {
        check_len("dispatched_task_ctx", buf, Self::SIZE)?;

        Ok(Self {
            pid: get_i32(buf, 0),
            cpu: get_i32(buf, 4),
            flags: get_u64(buf, 8),
            slice_ns: get_u64(buf, 16),
            vtime: get_u64(buf, 24),
            cpumask_cnt: get_u64(buf, 32),
        })
    }
}

/// Context passed to the `rs_select_cpu` program (see task_cpu_arg).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskCpuArg {
    pub pid: i32,
    pub cpu: i32,
    pub flags: u64,
}

impl TaskCpuArg {
    pub const SIZE: usize = 16;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        put_i32(&mut buf, 0, self.pid);
        put_i32(&mut buf, 4, self.cpu);
        put_u64(&mut buf, 8, self.flags);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, LayoutError> {
        check_len("task_cpu_arg", buf, Self::SIZE)?;
        Ok(Self {
            pid: get_i32(buf, 0),
            cpu: get_i32(buf, 4),
            flags: get_u64(buf, 8),
        })
    }
}

impl From<&QueuedTask> for TaskCpuArg {
    fn from(task: &QueuedTask) -> Self {
        Self {
            pid: task.pid,
            cpu: task.cpu,
            flags: task.flags,
        }
    }
}

/// Context passed to the `enable_sibling_cpu` program (see domain_arg).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainArg {
    pub lvl_id: i32,
    pub cpu_id: i32,
    pub sibling_cpu_id: i32,
}

impl DomainArg {
    pub const SIZE: usize = 12;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        put_i32(&mut buf, 0, self.lvl_id);
        put_i32(&mut buf, 4, self.cpu_id);
        put_i32(&mut buf, 8, self.sibling_cpu_id);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, LayoutError> {
        check_len("domain_arg", buf, Self::SIZE)?;
        Ok(Self {
            lvl_id: get_i32(buf, 0),
            cpu_id: get_i32(buf, 4),
            sibling_cpu_id: get_i32(buf, 8),
        })
    }
}
