// Copyright (c) Andrea Righi <andrea.righi@linux.dev>

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Capabilities provided by the BPF component.
//!
//! The scheduler never talks to libbpf directly: a backend (the libbpf loader of the scheduler
//! binary, or the in-process simulator) implements these traits and hands them over in a
//! [`KernelLink`].

use anyhow::Result;

use crate::exit_info::ExitInfo;
use crate::transport::Transport;
use crate::wire::DomainArg;
use crate::wire::TaskCpuArg;

/// Entry points used for task placement.
pub trait CpuSelector {
    /// Run the CPU selection program and return its raw return value.
    ///
    /// The program returns a CPU id, or a negative error code that shows up here as a value
    /// greater than `i32::MAX`.
    fn select_cpu(&mut self, arg: &TaskCpuArg) -> Result<u32>;

    /// Add `sibling_cpu_id` to the cache domain of `cpu_id` at level `lvl_id`.
    ///
    /// Returns the raw program return value (0 on success).
    fn enable_sibling_cpu(&mut self, arg: &DomainArg) -> Result<u32>;
}

/// Raw access to the BPF .bss value.
pub trait ControlBlockMap {
    fn lookup(&self) -> Result<Vec<u8>>;
    fn update(&mut self, value: &[u8]) -> Result<()>;
}

/// Access to the user exit info record of the BPF component.
pub trait ExitInfoSource {
    fn exit_info(&mut self) -> Result<ExitInfo>;

    /// Unregister the BPF scheduler, so that the exit info reflects the final state.
    fn detach(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Everything the scheduler needs from an attached BPF component.
///
/// `control_block` and `cpu_selector` are optional: a missing map or program is reported by the
/// corresponding component as unavailable.
pub struct KernelLink {
    pub transport: Transport,
    pub control_block: Option<Box<dyn ControlBlockMap>>,
    pub cpu_selector: Option<Box<dyn CpuSelector>>,
    pub exit_info: Box<dyn ExitInfoSource>,
}
