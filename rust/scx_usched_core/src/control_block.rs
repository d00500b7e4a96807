// Copyright (c) Andrea Righi <andrea.righi@linux.dev>

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Global counters shared with the BPF component (the .bss section).
//!
//! Both sides write these counters. Every update done here is a snapshot read followed by a
//! full write-back, not an atomic operation: a kernel-side update landing between the two steps
//! is lost. The BPF component treats the counters as hints (wakeup throttling, statistics), so
//! the race is tolerated rather than fixed; changing it would require changing the map layout.

use std::sync::Arc;
use std::sync::Mutex;

use anyhow::anyhow;
use anyhow::Result;

use crate::error::ControlBlockError;
use crate::error::LayoutError;
use crate::kernel::ControlBlockMap;

/// Snapshot of the shared counters (see struct bss in the BPF interface).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ControlBlock {
    pub usersched_pid: u32,        // pid of the user-space scheduler
    pub nr_queued: u64,            // tasks queued to the user-space scheduler
    pub nr_scheduled: u64,         // tasks waiting in the user-space scheduler
    pub nr_running: u64,           // tasks currently running
    pub nr_online_cpus: u64,       // online CPUs
    pub nr_user_dispatches: u64,   // tasks dispatched by the user-space scheduler
    pub nr_kernel_dispatches: u64, // tasks dispatched directly by the kernel
    pub nr_cancel_dispatches: u64, // dispatches cancelled (stale cpumask)
    pub nr_bounce_dispatches: u64, // dispatches bounced to the shared DSQ
    pub nr_failed_dispatches: u64, // failed dispatches
    pub nr_sched_congested: u64,   // scheduler congestion events
}

impl ControlBlock {
    pub const SIZE: usize = 88;

    const FIELDS: usize = 10;

    pub fn from_bytes(buf: &[u8]) -> Result<Self, LayoutError> {
        if buf.len() < Self::SIZE {
            return Err(LayoutError {
                record: "bss",
                expected: Self::SIZE,
                actual: buf.len(),
            });
        }
        let mut pid = [0u8; 4];
        pid.copy_from_slice(&buf[0..4]);
        let mut fields = [0u64; Self::FIELDS];
        for (i, field) in fields.iter_mut().enumerate() {
            let mut b = [0u8; 8];
            let off = 8 + i * 8;
            b.copy_from_slice(&buf[off..off + 8]);
            *field = u64::from_le_bytes(b);
        }

        Ok(Self {
            usersched_pid: u32::from_le_bytes(pid),
            nr_queued: fields[0],
            nr_scheduled: fields[1],
            nr_running: fields[2],
            nr_online_cpus: fields[3],
            nr_user_dispatches: fields[4],
            nr_kernel_dispatches: fields[5],
            nr_cancel_dispatches: fields[6],
            nr_bounce_dispatches: fields[7],
            nr_failed_dispatches: fields[8],
            nr_sched_congested: fields[9],
        })
    }

    /// Overlay the counters on top of `buf`, leaving any trailing bytes untouched.
    pub fn write_to(&self, buf: &mut [u8]) -> Result<(), LayoutError> {
        if buf.len() < Self::SIZE {
            return Err(LayoutError {
                record: "bss",
                expected: Self::SIZE,
                actual: buf.len(),
            });
        }
        let fields = [
            self.nr_queued,
            self.nr_scheduled,
            self.nr_running,
            self.nr_online_cpus,
            self.nr_user_dispatches,
            self.nr_kernel_dispatches,
            self.nr_cancel_dispatches,
            self.nr_bounce_dispatches,
            self.nr_failed_dispatches,
            self.nr_sched_congested,
        ];
        buf[0..4].copy_from_slice(&self.usersched_pid.to_le_bytes());
        for (i, field) in fields.iter().enumerate() {
            let off = 8 + i * 8;
            buf[off..off + 8].copy_from_slice(&field.to_le_bytes());
        }
        Ok(())
    }

    /// Total amount of tasks waiting for a scheduling decision.
    pub fn nr_waiting(&self) -> u64 {
        self.nr_queued.saturating_add(self.nr_scheduled)
    }
}

/// Operations on the shared control block.
pub struct SharedControlBlock {
    map: Option<Box<dyn ControlBlockMap>>,
}

impl SharedControlBlock {
    pub fn new(map: Option<Box<dyn ControlBlockMap>>) -> Self {
        Self { map }
    }

    pub fn is_available(&self) -> bool {
        self.map.is_some()
    }

    fn lookup(&self) -> Result<Vec<u8>, ControlBlockError> {
        let map = self.map.as_ref().ok_or(ControlBlockError::Unavailable)?;
        map.lookup()
            .map_err(|e| ControlBlockError::Access(format!("{:#}", e)))
    }

    pub fn read_snapshot(&self) -> Result<ControlBlock, ControlBlockError> {
        Ok(ControlBlock::from_bytes(&self.lookup()?)?)
    }

    pub fn write_snapshot(&mut self, cb: &ControlBlock) -> Result<(), ControlBlockError> {
        let mut value = self.lookup()?;
        cb.write_to(&mut value)?;
        let map = self.map.as_mut().ok_or(ControlBlockError::Unavailable)?;
        map.update(&value)
            .map_err(|e| ControlBlockError::Access(format!("{:#}", e)))
    }

    fn modify(&mut self, f: impl FnOnce(&mut ControlBlock)) -> Result<(), ControlBlockError> {
        let mut cb = self.read_snapshot()?;
        f(&mut cb);
        self.write_snapshot(&cb)
    }

    /// Tell the BPF component which pid belongs to the user-space scheduler.
    pub fn register_scheduler_pid(&mut self, pid: u32) -> Result<(), ControlBlockError> {
        self.modify(|cb| cb.usersched_pid = pid)
    }

    /// Account one task consumed from the queued ring buffer (never below zero).
    pub fn decrement_queued_count(&mut self) -> Result<(), ControlBlockError> {
        self.modify(|cb| cb.nr_queued = cb.nr_queued.saturating_sub(1))
    }

    pub fn set_queued_count(&mut self, nr_queued: u64) -> Result<(), ControlBlockError> {
        self.modify(|cb| cb.nr_queued = nr_queued)
    }

    // Notify the BPF component that the user-space scheduler has completed its scheduling cycle,
    // updating the amount tasks that are still pending.
    //
    // The BPF component keeps waking up the user-space scheduler while nr_scheduled > 0, so this
    // must be called at the end of every cycle, with 0 when nothing is left.
    pub fn notify_completion(&mut self, nr_pending: u64) -> Result<(), ControlBlockError> {
        self.modify(|cb| cb.nr_scheduled = nr_pending)
    }
}

/// In-process control block, shared between a simulated BPF component and the scheduler.
#[derive(Clone)]
pub struct LocalControlBlock {
    value: Arc<Mutex<Vec<u8>>>,
}

impl LocalControlBlock {
    /// Create a zeroed block of `size` bytes (at least [`ControlBlock::SIZE`]).
    pub fn new(size: usize) -> Self {
        Self {
            value: Arc::new(Mutex::new(vec![0; size.max(ControlBlock::SIZE)])),
        }
    }

    pub fn snapshot(&self) -> ControlBlock {
        let value = self.value.lock().unwrap_or_else(|e| e.into_inner());
        ControlBlock::from_bytes(&value).unwrap_or_default()
    }

    /// Kernel-side update of the counters.
    pub fn update_with(&self, f: impl FnOnce(&mut ControlBlock)) {
        let mut value = self.value.lock().unwrap_or_else(|e| e.into_inner());
        let mut cb = ControlBlock::from_bytes(&value).unwrap_or_default();
        f(&mut cb);
        // The buffer is never shorter than ControlBlock::SIZE.
        let _ = cb.write_to(&mut value);
    }
}

impl ControlBlockMap for LocalControlBlock {
    fn lookup(&self) -> Result<Vec<u8>> {
        let value = self
            .value
            .lock()
            .map_err(|_| anyhow!("control block lock poisoned"))?;
        Ok(value.clone())
    }

    fn update(&mut self, new: &[u8]) -> Result<()> {
        let mut value = self
            .value
            .lock()
            .map_err(|_| anyhow!("control block lock poisoned"))?;
        if new.len() != value.len() {
            return Err(anyhow!(
                "control block size mismatch: {} != {}",
                new.len(),
                value.len()
            ));
        }
        value.copy_from_slice(new);
        Ok(())
    }
}
