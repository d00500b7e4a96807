// Copyright (c) Andrea Righi <andrea.righi@linux.dev>

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
#[cfg(feature = "bpf")]
mod bpf;

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use log::info;
use log::warn;

use scx_usched_core::clock::Clock;
use scx_usched_core::clock::NSEC_PER_USEC;
use scx_usched_core::sim::SimKernel;
use scx_usched_core::sim::SimTask;
use scx_usched_core::transport::RING_CAPACITY;
use scx_usched_core::CacheTopology;
use scx_usched_core::ExitInfo;
use scx_usched_core::FairnessEngine;
use scx_usched_core::KernelLink;
use scx_usched_core::Scheduler;
use scx_usched_core::SchedulerConfig;
use scx_usched_core::ScxExitKind;
use scx_usched_core::VruntimePolicy;
use scx_usched_core::SCHEDULER_NAME;

const VERSION: &str = env!("CARGO_PKG_VERSION");

// Upper bound of the time slice options (10s).
const SLICE_US_MAX: u64 = 10_000_000;

/// scx_usched: sched_ext scheduler with a user-space vruntime policy
///
/// The BPF component queues every runnable task to user space, where a vruntime-based policy
/// decides the target CPU, the time slice and the deadline of each task, and sends it back to
/// the BPF dispatcher.
///
/// - the time slice shrinks as more tasks are waiting (down to slice_us_min)
///
/// - the used CPU time, scaled by the task's static priority (weight), determines the vruntime
///
/// - tasks that often release the CPU voluntarily (interactive tasks) are allowed to lag behind
///   the global vruntime more than CPU-bound tasks, so they run sooner after a wakeup
///
/// Without a BPF object (or when built without the `bpf` feature) the scheduler can drive an
/// in-process simulated kernel with `--simulate`, which is useful to observe the policy.
#[derive(Debug, Parser)]
struct Opts {
    /// Scheduling slice duration in microseconds.
    #[clap(short = 's', long, default_value = "5000")]
    slice_us: u64,

    /// Scheduling minimum slice duration in microseconds.
    #[clap(short = 'S', long, default_value = "500")]
    slice_us_min: u64,

    /// Forget about tasks that have not been seen for this many scheduling decisions (0 = never).
    #[clap(long, default_value = "1048576")]
    evict_after: u64,

    /// Report statistics every N seconds (0 = disabled).
    #[clap(long, default_value = "1.0")]
    stats: f64,

    /// Report statistics as JSON.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    stats_json: bool,

    /// BPF object implementing the kernel side of the scheduler.
    #[clap(short = 'o', long, default_value = "main.bpf.o")]
    bpf_object: PathBuf,

    /// Drive a simulated kernel instead of attaching to the real one.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    simulate: bool,

    /// Number of simulated CPUs.
    #[clap(long, default_value = "4")]
    sim_cpus: usize,

    /// Number of simulated tasks (a mix of CPU hogs and interactive tasks).
    #[clap(long, default_value = "8")]
    sim_tasks: usize,

    /// Stop the simulation after N seconds (run until interrupted if not specified).
    #[clap(long)]
    sim_duration: Option<f64>,

    /// Enable verbose output.
    #[clap(short = 'v', long, action = clap::ArgAction::SetTrue)]
    verbose: bool,

    /// Print scheduler version and exit.
    #[clap(short = 'V', long, action = clap::ArgAction::SetTrue)]
    version: bool,
}

// Seconds to duration, 0 meaning "not set".
fn seconds_arg(name: &str, secs: f64) -> Result<Option<Duration>> {
    if secs == 0.0 {
        return Ok(None);
    }
    Duration::try_from_secs_f64(secs)
        .map(Some)
        .with_context(|| format!("Invalid {}: {}", name, secs))
}

impl Opts {
    fn config(&self) -> Result<SchedulerConfig> {
        if self.slice_us == 0 || self.slice_us > SLICE_US_MAX {
            bail!(
                "Invalid --slice-us {}: must be between 1 and {}",
                self.slice_us,
                SLICE_US_MAX
            );
        }
        if self.slice_us_min > self.slice_us {
            bail!(
                "--slice-us-min ({}) must not exceed --slice-us ({})",
                self.slice_us_min,
                self.slice_us
            );
        }
        Ok(SchedulerConfig {
            slice_ns: self.slice_us * NSEC_PER_USEC,
            slice_ns_min: self.slice_us_min * NSEC_PER_USEC,
            evict_after_cycles: self.evict_after,
            stats_interval: seconds_arg("--stats", self.stats)?,
            stats_json: self.stats_json,
            ..Default::default()
        })
    }

    fn sim_duration(&self) -> Result<Option<Duration>> {
        match self.sim_duration {
            Some(secs) => seconds_arg("--sim-duration", secs),
            None => Ok(None),
        }
    }
}

// Initialize the scheduler, then let the BPF component start scheduling through it (`attach`)
// and run until exit.
fn run_scheduler<C: Clock>(
    link: KernelLink,
    topo: &CacheTopology,
    clock: C,
    config: SchedulerConfig,
    shutdown: &Arc<AtomicBool>,
    attach: impl FnOnce() -> Result<()>,
) -> Result<ExitInfo> {
    let policy = VruntimePolicy::with_engine(FairnessEngine::with_clock(config.fairness(), clock));
    let mut sched = Scheduler::init(link, topo, policy, config, shutdown.clone())
        .context("Failed to initialize the scheduler")?;
    attach()?;
    sched.run()
}

// Simulated workload: every other task is a CPU hog, the others are interactive tasks with
// different burst lengths and priorities.
fn sim_workload(nr_tasks: usize) -> Vec<SimTask> {
    (0..nr_tasks)
        .map(|i| {
            let pid = i as i32 + 1;
            let nice = (i % 3) as i8 * 5 - 5;
            if i % 2 == 0 {
                SimTask::hog(pid).nice(nice)
            } else {
                let burst_ns = 200_000 * (i as u64 + 1);
                SimTask::periodic(pid, burst_ns, 4_000_000).nice(nice)
            }
        })
        .collect()
}

fn spawn_sim(
    mut kernel: SimKernel,
    duration: Option<Duration>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<SimKernel> {
    thread::spawn(move || {
        let start = Instant::now();
        let mut expired = false;
        while !stop.load(Ordering::Relaxed) {
            kernel.step();
            if !expired && duration.is_some_and(|d| start.elapsed() >= d) {
                kernel.exit(ScxExitKind::UnregKern, 0, "simulation completed");
                expired = true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        kernel
    })
}

fn run_simulation(opts: &Opts, shutdown: &Arc<AtomicBool>) -> Result<ExitInfo> {
    let config = opts.config()?;
    let duration = opts.sim_duration()?;
    let (mut kernel, link) = SimKernel::new(opts.sim_cpus.max(1), RING_CAPACITY);
    for task in sim_workload(opts.sim_tasks) {
        kernel.add_task(task);
    }
    info!(
        "Simulating {} CPUs, {} tasks",
        kernel.nr_cpus(),
        opts.sim_tasks
    );
    let topo = kernel.topology();
    let clock = kernel.clock();

    let stop = Arc::new(AtomicBool::new(false));
    let sim = spawn_sim(kernel, duration, stop.clone());

    let res = run_scheduler(link, &topo, clock, config, shutdown, || Ok(()));

    stop.store(true, Ordering::Relaxed);
    match sim.join() {
        Ok(kernel) => info!(
            "Simulation stopped after {}ms of simulated time",
            kernel.now() / 1_000_000
        ),
        Err(_) => warn!("simulated kernel panicked"),
    }
    res
}

#[cfg(feature = "bpf")]
fn run_bpf(opts: &Opts, shutdown: &Arc<AtomicBool>) -> Result<ExitInfo> {
    use scx_usched_core::clock::MonotonicClock;

    let config = opts.config()?;
    let topo = CacheTopology::discover().context("Failed to read the CPU topology")?;
    let (link, ops, _pollers) = bpf::load(&opts.bpf_object)?;
    run_scheduler(
        link,
        &topo,
        MonotonicClock::default(),
        config,
        shutdown,
        || ops.attach(),
    )
}

#[cfg(not(feature = "bpf"))]
fn run_bpf(_opts: &Opts, _shutdown: &Arc<AtomicBool>) -> Result<ExitInfo> {
    anyhow::bail!(
        "{} was built without BPF support (enable the `bpf` feature), use --simulate",
        SCHEDULER_NAME
    )
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    if opts.version {
        println!(
            "{} version {} - scx_usched_core {}",
            SCHEDULER_NAME,
            VERSION,
            scx_usched_core::VERSION
        );
        return Ok(());
    }

    let loglevel = if opts.verbose {
        simplelog::LevelFilter::Debug
    } else {
        simplelog::LevelFilter::Info
    };

    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        loglevel,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    loop {
        let uei = if opts.simulate {
            run_simulation(&opts, &shutdown)?
        } else {
            run_bpf(&opts, &shutdown)?
        };
        if !uei.should_restart() {
            break;
        }
        info!("Restarting {} scheduler", SCHEDULER_NAME);
    }

    Ok(())
}
