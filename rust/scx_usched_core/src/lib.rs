// Copyright (c) Andrea Righi <andrea.righi@linux.dev>

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Decision core of a sched_ext scheduler running in user space.
//!
//! The BPF component queues runnable tasks to the `queued` ring buffer; the [`Scheduler`] drains
//! them, asks its [`SchedulingPolicy`] for a CPU, a time slice and a deadline, and sends the
//! result back through the `dispatched` ring buffer. Everything the scheduler needs from the BPF
//! side is abstracted by the traits in [`kernel`], implemented by a libbpf backend or by the
//! in-process [`sim::SimKernel`].

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const SCHEDULER_NAME: &str = "UserSched";

pub mod clock;
pub mod control_block;
pub mod error;
pub mod exit_info;
pub mod fairness;
pub mod kernel;
pub mod placement;
pub mod policy;
pub mod scheduler;
pub mod sim;
pub mod stats;
pub mod topology;
pub mod transport;
pub mod wire;

pub use clock::Clock;
pub use clock::ManualClock;
pub use clock::MonotonicClock;
pub use control_block::ControlBlock;
pub use control_block::LocalControlBlock;
pub use control_block::SharedControlBlock;
pub use error::ControlBlockError;
pub use error::LayoutError;
pub use error::PlacementError;
pub use error::SchedError;
pub use error::TopologyRegistrationError;
pub use error::TransportError;
pub use exit_info::ExitInfo;
pub use exit_info::ScxExitKind;
pub use fairness::FairnessConfig;
pub use fairness::FairnessEngine;
pub use fairness::SliceDecision;
pub use kernel::ControlBlockMap;
pub use kernel::CpuSelector;
pub use kernel::ExitInfoSource;
pub use kernel::KernelLink;
pub use placement::PlacementAdvisor;
pub use policy::SchedulingPolicy;
pub use policy::VruntimePolicy;
pub use scheduler::Scheduler;
pub use scheduler::SchedulerConfig;
pub use stats::Metrics;
pub use topology::CacheLevel;
pub use topology::CacheTopology;
pub use transport::Transport;
pub use wire::DispatchedTask;
pub use wire::QueuedTask;
pub use wire::RL_CPU_ANY;
