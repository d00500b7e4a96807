// Copyright (c) Andrea Righi <andrea.righi@linux.dev>

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use scx_usched_core::exit_info::SCX_ECODE_ACT_RESTART;
use scx_usched_core::fairness::SLICE_NS_DEFAULT;
use scx_usched_core::fairness::SLICE_NS_MIN;
use scx_usched_core::sim::SimKernel;
use scx_usched_core::sim::SimTask;
use scx_usched_core::*;

mod common;

/// Two CPU hogs with the same weight on one CPU share it evenly.
#[test]
fn test_equal_weight_sharing() {
    let (mut kernel, mut sched) = common::setup(1, 64);
    kernel.add_task(SimTask::hog(1));
    kernel.add_task(SimTask::hog(2));

    common::rounds(&mut kernel, &mut sched, 200);

    let rt1 = kernel.runtime(1).unwrap();
    let rt2 = kernel.runtime(2).unwrap();
    eprintln!("t1 runtime: {rt1}ns, t2 runtime: {rt2}ns");
    assert!(rt1 > 0, "task 1 got no runtime");
    assert!(rt2 > 0, "task 2 got no runtime");

    let ratio = rt1 as f64 / rt2 as f64;
    assert!(
        (0.8..=1.25).contains(&ratio),
        "expected ~equal runtime ratio, got {ratio:.3} (rt1={rt1}, rt2={rt2})"
    );
}

/// Nobody starves with a mix of hogs, interactive tasks and different priorities, and the
/// watermark only moves forward.
#[test]
fn test_mixed_workload() {
    let (mut kernel, mut sched) = common::setup(4, 256);
    kernel.add_task(SimTask::hog(1));
    kernel.add_task(SimTask::hog(2).nice(-5));
    kernel.add_task(SimTask::hog(3).nice(10));
    kernel.add_task(SimTask::hog(4).weight(0));
    for pid in 5..=8 {
        kernel.add_task(SimTask::periodic(pid, 300_000, 2_000_000));
    }
    kernel.add_task(SimTask::periodic(9, 10_000_000, 50_000_000).nice(5));

    let mut prev = 0;
    for _ in 0..500 {
        common::round(&mut kernel, &mut sched);
        let watermark = sched.policy().engine().min_vruntime();
        assert!(watermark >= prev, "watermark went backwards");
        prev = watermark;

        for pid in 1..=9 {
            if let Some(d) = kernel.last_dispatch(pid) {
                assert!(
                    (SLICE_NS_MIN..=SLICE_NS_DEFAULT).contains(&d.slice_ns),
                    "pid {pid}: slice {} out of bounds",
                    d.slice_ns
                );
            }
        }
    }

    for pid in 1..=9 {
        assert!(kernel.runtime(pid).unwrap() > 0, "pid {pid} starved");
    }
    assert!(kernel.nvcsw(5).unwrap() > 10);
    assert_eq!(sched.policy().engine().nr_tasks(), 9);

    let m = sched.metrics();
    assert_eq!(m.nr_cpus, 4);
    assert_eq!(m.nr_malformed, 0);
    assert_eq!(m.nr_dispatch_errors, 0);
    // The last dispatches may still be in flight.
    assert!(m.nr_user_dispatches > 0);
    assert!(m.nr_dispatched >= m.nr_user_dispatches);
}

/// A task sleeping for a long time only banks a bounded amount of vruntime credit.
#[test]
fn test_sleeper_fairness_floor() {
    let (mut kernel, mut sched) = common::setup(1, 64);
    kernel.add_task(SimTask::hog(1));
    kernel.add_task(SimTask::periodic(2, 1_000_000, 2_000_000_000));

    let mut last_seen = None;
    let mut nr_checks = 0;
    let mut max_watermark = 0;
    for _ in 0..1000 {
        let watermark = sched.policy().engine().min_vruntime();
        common::round(&mut kernel, &mut sched);

        let engine = sched.policy().engine();
        let sleeper = engine.task(2).unwrap();
        if last_seen == Some(sleeper.last_seen()) {
            continue;
        }
        last_seen = Some(sleeper.last_seen());

        // Decided in this round, as a wakeup.
        let budget = SLICE_NS_DEFAULT * sleeper.latency_weight(true);
        assert!(
            sleeper.vruntime() >= watermark.saturating_sub(budget),
            "sleeper vruntime {} too far behind {}",
            sleeper.vruntime(),
            watermark
        );
        nr_checks += 1;
        max_watermark = max_watermark.max(watermark);
    }

    // The sleeper woke up at least once after the hog pushed the watermark away.
    assert!(nr_checks >= 2, "sleeper decided {nr_checks} times");
    assert!(max_watermark > 100 * SLICE_NS_DEFAULT);
}

#[test]
fn test_exit_notification_evicts_task() {
    let (mut kernel, mut sched) = common::setup(1, 64);
    kernel.add_task(SimTask::hog(1));
    kernel.add_task(SimTask::hog(2));
    common::rounds(&mut kernel, &mut sched, 10);
    assert_eq!(sched.policy().engine().nr_tasks(), 2);

    assert!(kernel.exit_task(1));
    common::rounds(&mut kernel, &mut sched, 10);
    assert_eq!(sched.policy().engine().nr_tasks(), 1);
    assert!(sched.policy().engine().task(1).is_none());
    assert!(kernel.runtime(2).unwrap() > 0);
}

#[test]
fn test_stale_dispatch_is_requeued() {
    let (mut kernel, mut sched) = common::setup(1, 64);
    kernel.add_task(SimTask::hog(1));
    common::rounds(&mut kernel, &mut sched, 3);

    // The task was just dispatched with the old cpumask generation.
    kernel.set_affinity_changed(1);
    let before = kernel.runtime(1).unwrap();
    common::rounds(&mut kernel, &mut sched, 5);

    assert_eq!(kernel.control_block().nr_cancel_dispatches, 1);
    assert!(kernel.runtime(1).unwrap() > before);
    assert_eq!(kernel.last_dispatch(1).unwrap().cpumask_cnt, 1);
}

#[test]
fn test_placement() {
    let (mut kernel, mut sched) = common::setup(4, 64);
    kernel.add_task(SimTask::hog(3));
    common::rounds(&mut kernel, &mut sched, 2);
    // The simulated program keeps the previous CPU.
    assert_eq!(kernel.last_dispatch(3).unwrap().cpu, 3);

    kernel.set_no_idle(true);
    common::rounds(&mut kernel, &mut sched, 2);
    assert_eq!(kernel.last_dispatch(3).unwrap().cpu, RL_CPU_ANY);
    assert_eq!(sched.metrics().nr_placement_errors, 0);

    // A failing program is not fatal either.
    kernel.set_select_failure(true);
    let before = kernel.runtime(3).unwrap();
    common::rounds(&mut kernel, &mut sched, 4);
    assert_eq!(kernel.last_dispatch(3).unwrap().cpu, RL_CPU_ANY);
    assert!(sched.metrics().nr_placement_errors > 0);
    assert!(kernel.runtime(3).unwrap() > before);
    assert!(kernel.nr_select_calls() > 0);
}

#[test]
fn test_topology_registration() {
    let (kernel, _sched) = common::setup(4, 64);
    let registrations = kernel.registrations();
    // L2: {0, 1} {2, 3}, L3: {0, 1, 2, 3}.
    assert_eq!(registrations.len(), 4 + 4 + 16);
    assert!(registrations
        .iter()
        .any(|arg| arg.lvl_id == 3 && arg.cpu_id == 3 && arg.sibling_cpu_id == 0));
    assert!(registrations
        .iter()
        .any(|arg| arg.lvl_id == 2 && arg.cpu_id == 2 && arg.sibling_cpu_id == 2));
}

#[test]
fn test_topology_registration_failure() {
    common::setup_test();
    let (kernel, link) = SimKernel::new(2, 64);
    kernel.set_sibling_failure(Some(-22i32 as u32));
    let res = common::try_attach(&kernel, link, Arc::new(AtomicBool::new(false)));
    match res {
        Err(SchedError::Topology(err)) => {
            assert_eq!(err.level, CacheLevel::L2);
            assert!(err.to_string().contains("-22"), "{}", err);
        }
        Err(err) => panic!("unexpected error: {err}"),
        Ok(_) => panic!("registration failure ignored"),
    }
}

#[test]
fn test_congestion() {
    let (mut kernel, mut sched) = common::setup(2, 4);
    for pid in 1..=16 {
        kernel.add_task(SimTask::hog(pid));
    }
    common::rounds(&mut kernel, &mut sched, 50);

    assert!(kernel.control_block().nr_sched_congested > 0);
    assert!(kernel.runtime(1).unwrap() > 0);
    assert_eq!(sched.metrics().nr_dispatch_errors, 0);
}

// Run the scheduler against a simulated kernel stepping in its own thread, publishing an exit
// condition after a while.
fn run_until_exit(
    kind: ScxExitKind,
    exit_code: i64,
    reason: &'static str,
) -> anyhow::Result<ExitInfo> {
    common::setup_test();
    let (mut kernel, link) = SimKernel::new(2, 64);
    for pid in 1..=4 {
        kernel.add_task(SimTask::periodic(pid, 2_000_000, 1_000_000));
    }
    let config = SchedulerConfig {
        idle_timeout: Some(Duration::from_millis(10)),
        stats_interval: Some(Duration::from_millis(20)),
        stats_json: true,
        ..Default::default()
    };
    let policy =
        VruntimePolicy::with_engine(FairnessEngine::with_clock(config.fairness(), kernel.clock()));
    let mut sched = Scheduler::init(
        link,
        &kernel.topology(),
        policy,
        config,
        Arc::new(AtomicBool::new(false)),
    )
    .unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let stop_sim = stop.clone();
    let sim = thread::spawn(move || {
        let mut steps = 0u64;
        while !stop_sim.load(Ordering::Relaxed) {
            kernel.step();
            steps += 1;
            if steps == 50 {
                kernel.exit(kind, exit_code, reason);
            }
            thread::sleep(Duration::from_millis(1));
        }
        kernel
    });

    let res = sched.run();
    stop.store(true, Ordering::Relaxed);
    let kernel = sim.join().unwrap();
    assert!(kernel.runtime(1).unwrap() > 0);
    assert!(sched.metrics().nr_dispatched > 0);

    res
}

#[test]
fn test_run_stops_on_kernel_exit() {
    let uei = run_until_exit(ScxExitKind::UnregKern, 0, "unregistered from the main kernel")
        .unwrap();
    assert_eq!(uei.kind, ScxExitKind::UnregKern as i32);
    assert!(!uei.should_restart());
}

#[test]
fn test_run_restart_request() {
    let uei = run_until_exit(
        ScxExitKind::UnregBpf,
        SCX_ECODE_ACT_RESTART,
        "CPU hotplug event detected",
    )
    .unwrap();
    assert!(uei.should_restart());
}

#[test]
fn test_run_error_exit() {
    let err = run_until_exit(ScxExitKind::ErrorStall, 0, "runnable task stall").unwrap_err();
    assert!(err.to_string().contains("runnable task stall"), "{err}");
}

#[test]
fn test_run_shutdown() {
    common::setup_test();
    let (mut kernel, link) = SimKernel::new(1, 64);
    kernel.add_task(SimTask::hog(1));
    let shutdown = Arc::new(AtomicBool::new(false));
    let mut sched = common::try_attach(&kernel, link, shutdown.clone()).unwrap();

    let flag = shutdown.clone();
    let sim = thread::spawn(move || {
        for _ in 0..20 {
            kernel.step();
            thread::sleep(Duration::from_millis(1));
        }
        flag.store(true, Ordering::Relaxed);
        kernel
    });

    let uei = sched.run().unwrap();
    let _kernel = sim.join().unwrap();
    // Unregistered by the scheduler itself.
    assert_eq!(uei.kind, ScxExitKind::Unreg as i32);
    assert!(!uei.should_restart());
}
