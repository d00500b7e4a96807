// Copyright (c) Andrea Righi <andrea.righi@linux.dev>

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use log::debug;
use log::info;

use crate::error::PlacementError;
use crate::error::TopologyRegistrationError;
use crate::kernel::CpuSelector;
use crate::topology::CacheLevel;
use crate::topology::CacheTopology;
use crate::wire::DomainArg;
use crate::wire::QueuedTask;
use crate::wire::TaskCpuArg;
use crate::wire::RL_CPU_ANY;

/// CPU selection on top of the BPF idle CPU selection logic.
pub struct PlacementAdvisor {
    selector: Option<Box<dyn CpuSelector>>,
}

impl PlacementAdvisor {
    pub fn new(selector: Option<Box<dyn CpuSelector>>) -> Self {
        Self { selector }
    }

    pub fn is_available(&self) -> bool {
        self.selector.is_some()
    }

    // Pick an idle CPU for the target PID, using the BPF component.
    //
    // A negative error code returned by the program (no idle CPU available) maps to RL_CPU_ANY:
    // the task is then dispatched to the first CPU that becomes available.
    pub fn select_cpu(&mut self, task: &QueuedTask) -> Result<i32, PlacementError> {
        let selector = self.selector.as_mut().ok_or(PlacementError::Unavailable)?;
        let ret = selector
            .select_cpu(&TaskCpuArg::from(task))
            .map_err(|e| PlacementError::Failed(format!("{:#}", e)))?;

        Ok(i32::try_from(ret).unwrap_or(RL_CPU_ANY))
    }

    /// Add `sibling` to the `level` cache domain of `cpu`.
    pub fn register_sibling(
        &mut self,
        level: CacheLevel,
        cpu: usize,
        sibling: usize,
    ) -> Result<(), TopologyRegistrationError> {
        let err = |reason: String| TopologyRegistrationError {
            level,
            cpu,
            sibling,
            reason,
        };
        let selector = self
            .selector
            .as_mut()
            .ok_or_else(|| err("sibling registration program not found".into()))?;
        let arg = DomainArg {
            lvl_id: level.id(),
            cpu_id: i32::try_from(cpu).map_err(|_| err("CPU id out of range".into()))?,
            sibling_cpu_id: i32::try_from(sibling)
                .map_err(|_| err("sibling CPU id out of range".into()))?,
        };
        match selector.enable_sibling_cpu(&arg) {
            Ok(0) => Ok(()),
            Ok(ret) => Err(err(format!("program returned {}", ret as i32))),
            Err(e) => Err(err(format!("{:#}", e))),
        }
    }

    /// Register all the L2 and L3 cache domains: every CPU in a group is a sibling of every CPU
    /// in the same group, itself included.
    pub fn register_sibling_domains(
        &mut self,
        topo: &CacheTopology,
    ) -> Result<usize, TopologyRegistrationError> {
        let mut nr_pairs = 0;
        for level in CacheLevel::ALL {
            for cpus in topo.groups(level) {
                for &cpu in cpus {
                    for &sibling in cpus {
                        self.register_sibling(level, cpu, sibling)?;
                        nr_pairs += 1;
                    }
                }
                debug!("{} cache domain {:?} registered", level, cpus);
            }
        }
        info!("{} cache domain sibling pairs registered", nr_pairs);

        Ok(nr_pairs)
    }
}
