// Copyright (c) Andrea Righi <andrea.righi@linux.dev>

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! libbpf backend.
//!
//! The BPF object is expected to provide:
//!
//!  - a `queued` BPF_MAP_TYPE_RINGBUF and a `dispatched` BPF_MAP_TYPE_USER_RINGBUF,
//!  - the shared counters at the beginning of its `.bss` section,
//!  - the user exit info record at the beginning of its `.data` section,
//!  - the `rs_select_cpu` and `enable_sibling_cpu` syscall programs,
//!  - a single struct_ops map.
//!
//! Two poller threads move records between the BPF ring buffers and the bounded channels of the
//! scheduler transport, so that the scheduler itself never touches libbpf on its hot path. When
//! a channel or a ring is full the pollers wait, so that records are never lost.
//!
//! Loading and attaching are separate steps: the struct_ops map must be attached only after the
//! scheduler has registered its pid and the cache domains.

use std::cell::RefCell;
use std::ffi::OsStr;
use std::path::Path;
use std::rc::Rc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use crossbeam::channel::RecvTimeoutError;
use libbpf_rs::Link;
use libbpf_rs::MapCore;
use libbpf_rs::MapFlags;
use libbpf_rs::MapHandle;
use libbpf_rs::MapType;
use libbpf_rs::Object;
use libbpf_rs::ObjectBuilder;
use libbpf_rs::ProgramInput;
use libbpf_rs::RingBufferBuilder;
use libbpf_rs::UserRingBuffer;
use log::info;
use log::warn;

use scx_usched_core::exit_info::ExitInfo;
use scx_usched_core::kernel::ControlBlockMap;
use scx_usched_core::kernel::CpuSelector;
use scx_usched_core::kernel::ExitInfoSource;
use scx_usched_core::kernel::KernelLink;
use scx_usched_core::transport;
use scx_usched_core::transport::retry_until_stopped;
use scx_usched_core::transport::KernelEnd;
use scx_usched_core::transport::RING_CAPACITY;
use scx_usched_core::wire::DomainArg;
use scx_usched_core::wire::TaskCpuArg;

// Defined in <linux/sched.h>, not exported by libc.
const SCHED_EXT: i32 = 7;

const POLL_TIMEOUT: Duration = Duration::from_millis(100);

// Wait between attempts to reserve room in the dispatched ring.
const RESERVE_RETRY: Duration = Duration::from_micros(100);

type SharedObject = Rc<RefCell<Object>>;
type SharedLink = Rc<RefCell<Option<Link>>>;

fn find_map(obj: &Object, name: &str) -> Result<MapHandle> {
    let map = obj
        .maps()
        .find(|map| map.name() == OsStr::new(name))
        .ok_or_else(|| anyhow!("BPF map {} not found", name))?;
    MapHandle::try_from(&map).with_context(|| format!("Failed to open BPF map {}", name))
}

// Look up the single value of an array map (global data sections are single-entry arrays).
fn lookup_value(map: &MapHandle) -> Result<Vec<u8>> {
    map.lookup(&0u32.to_ne_bytes(), MapFlags::ANY)?
        .ok_or_else(|| anyhow!("empty BPF map {}", map.name().to_string_lossy()))
}

fn test_run(obj: &SharedObject, name: &str, mut ctx: Vec<u8>) -> Result<u32> {
    let mut obj = obj.borrow_mut();
    let mut prog = obj
        .progs_mut()
        .find(|prog| prog.name() == OsStr::new(name))
        .ok_or_else(|| anyhow!("BPF program {} not found", name))?;
    let input = ProgramInput {
        context_in: Some(&mut ctx),
        ..Default::default()
    };
    let out = prog
        .test_run(input)
        .with_context(|| format!("Failed to run BPF program {}", name))?;
    Ok(out.return_value)
}

struct BpfCpuSelector {
    obj: SharedObject,
}

impl CpuSelector for BpfCpuSelector {
    fn select_cpu(&mut self, arg: &TaskCpuArg) -> Result<u32> {
        test_run(&self.obj, "rs_select_cpu", arg.to_bytes().to_vec())
    }

    fn enable_sibling_cpu(&mut self, arg: &DomainArg) -> Result<u32> {
        test_run(&self.obj, "enable_sibling_cpu", arg.to_bytes().to_vec())
    }
}

struct BssMap {
    map: MapHandle,
}

impl ControlBlockMap for BssMap {
    fn lookup(&self) -> Result<Vec<u8>> {
        lookup_value(&self.map)
    }

    fn update(&mut self, value: &[u8]) -> Result<()> {
        self.map
            .update(&0u32.to_ne_bytes(), value, MapFlags::ANY)
            .context("Failed to update .bss")
    }
}

struct BpfExitInfo {
    data: MapHandle,
    link: SharedLink,
    // Keep the object alive until the struct_ops link is gone.
    _obj: SharedObject,
}

impl ExitInfoSource for BpfExitInfo {
    fn exit_info(&mut self) -> Result<ExitInfo> {
        let value = lookup_value(&self.data)?;
        Ok(ExitInfo::from_bytes(&value)?)
    }

    fn detach(&mut self) -> Result<()> {
        if let Some(link) = self.link.borrow_mut().take() {
            link.detach().context("Failed to detach struct_ops")?;
        }
        Ok(())
    }
}

/// The struct_ops map of a loaded BPF object, not attached yet.
pub struct StructOps {
    obj: SharedObject,
    link: SharedLink,
}

impl StructOps {
    /// Start scheduling through the BPF component.
    pub fn attach(&self) -> Result<()> {
        let mut obj = self.obj.borrow_mut();
        let mut ops = obj
            .maps_mut()
            .find(|map| map.map_type() == MapType::StructOps)
            .ok_or_else(|| anyhow!("No struct_ops map found"))?;
        let link = ops
            .attach_struct_ops()
            .context("Failed to attach struct_ops")?;
        *self.link.borrow_mut() = Some(link);
        info!("BPF scheduler attached");
        Ok(())
    }
}

/// Ring buffer poller threads; stopped and joined on drop.
pub struct Pollers {
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl Drop for Pollers {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("ring buffer poller panicked");
            }
        }
    }
}

// Kernel -> user: copy every record of the `queued` RINGBUF into the queued channel. When the
// channel is full the callback waits, leaving the backpressure to the ring buffer.
fn spawn_queued_poller(
    map: MapHandle,
    end: Arc<KernelEnd>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let res = (|| -> Result<()> {
            let mut builder = RingBufferBuilder::new();
            let cb_stop = stop.clone();
            builder.add(&map, move |data: &[u8]| {
                match end.enqueue(data.to_vec(), &cb_stop) {
                    Ok(true) => 0,
                    Ok(false) | Err(_) => -1,
                }
            })?;
            let rb = builder.build()?;
            while !stop.load(Ordering::Relaxed) {
                rb.poll(POLL_TIMEOUT)?;
            }
            Ok(())
        })();
        if let Err(err) = res {
            if !stop.load(Ordering::Relaxed) {
                warn!("queued poller stopped: {:#}", err);
            }
        }
    })
}

// User -> kernel: submit every record of the dispatched channel to the `dispatched`
// USER_RINGBUF, waiting for room when the ring is full.
fn spawn_dispatched_poller(
    map: MapHandle,
    end: Arc<KernelEnd>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let res = (|| -> Result<()> {
            let urb = UserRingBuffer::new(&map)?;
            while !stop.load(Ordering::Relaxed) {
                let record = match end.dispatched.recv_timeout(POLL_TIMEOUT) {
                    Ok(record) => record,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                };
                let Some(mut sample) =
                    retry_until_stopped(&stop, RESERVE_RETRY, || urb.reserve(record.len()))
                else {
                    break;
                };
                sample.copy_from_slice(&record);
                urb.submit(sample)?;
            }
            Ok(())
        })();
        if let Err(err) = res {
            warn!("dispatched poller stopped: {:#}", err);
        }
    })
}

fn lock_memory() -> Result<()> {
    // Lock all the memory to prevent page faults that could trigger potential deadlocks during
    // scheduling.
    let res = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
    if res != 0 {
        bail!("mlockall failed: {}", std::io::Error::last_os_error());
    }
    Ok(())
}

// Make the calling thread a SCHED_EXT task, so that the BPF component can recognize it.
fn use_sched_ext() -> Result<()> {
    let param = libc::sched_param { sched_priority: 0 };
    let res = unsafe { libc::sched_setscheduler(0, SCHED_EXT, &param) };
    if res != 0 {
        bail!(
            "Failed to switch to SCHED_EXT: {}",
            std::io::Error::last_os_error()
        );
    }
    Ok(())
}

/// Load the BPF object at `path`, returning the kernel link for the scheduler, the struct_ops
/// to attach once the scheduler is initialized and the poller threads feeding it.
pub fn load(path: &Path) -> Result<(KernelLink, StructOps, Pollers)> {
    let obj = ObjectBuilder::default()
        .open_file(path)
        .with_context(|| format!("Failed to open BPF object {}", path.display()))?
        .load()
        .context("Failed to load BPF program")?;
    info!("BPF object loaded ({})", path.display());

    lock_memory()?;
    use_sched_ext()?;

    let bss = find_map(&obj, ".bss").or_else(|_| find_map(&obj, "main.bss"))?;
    let data = find_map(&obj, ".data").or_else(|_| find_map(&obj, "main.data"))?;
    let queued = find_map(&obj, "queued")?;
    let dispatched = find_map(&obj, "dispatched")?;

    let obj = Rc::new(RefCell::new(obj));
    let struct_ops_link = Rc::new(RefCell::new(None));

    let (transport, kernel_end) = transport::channel(RING_CAPACITY);
    let kernel_end = Arc::new(kernel_end);
    let stop = Arc::new(AtomicBool::new(false));
    let pollers = Pollers {
        stop: stop.clone(),
        handles: vec![
            spawn_queued_poller(queued, kernel_end.clone(), stop.clone()),
            spawn_dispatched_poller(dispatched, kernel_end, stop),
        ],
    };

    let link = KernelLink {
        transport,
        control_block: Some(Box::new(BssMap { map: bss })),
        cpu_selector: Some(Box::new(BpfCpuSelector { obj: obj.clone() })),
        exit_info: Box::new(BpfExitInfo {
            data,
            link: struct_ops_link.clone(),
            _obj: obj.clone(),
        }),
    };
    let ops = StructOps {
        obj,
        link: struct_ops_link,
    };
    Ok((link, ops, pollers))
}
