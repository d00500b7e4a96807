// Copyright (c) Andrea Righi <andrea.righi@linux.dev>

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Bounded record channels between the scheduler and the BPF ring buffers.
//!
//! The kernel-managed ring buffers are bridged by pollers (or by the simulator) holding the
//! [`KernelEnd`]; the control loop holds the [`Transport`]. Each direction is a
//! single-producer/single-consumer FIFO with a bounded capacity, which provides backpressure
//! towards the producer.

use std::fmt::Display;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use crossbeam::channel;
use crossbeam::channel::Receiver;
use crossbeam::channel::RecvTimeoutError;
use crossbeam::channel::SendTimeoutError;
use crossbeam::channel::Sender;
use crossbeam::channel::TryRecvError;
use log::debug;

use crate::error::TransportError;

/// Maximum amount of in-flight records per direction.
pub const RING_CAPACITY: usize = 4096;

// Granularity used to re-check the shutdown flag while waiting for records.
const POLL_SLICE: Duration = Duration::from_millis(10);

// How long a dispatch may wait for room in the outbound queue.
const DISPATCH_TIMEOUT: Duration = Duration::from_millis(100);

/// Scheduler side of the channels.
pub struct Transport {
    queued: Receiver<Vec<u8>>,
    dispatched: Sender<Vec<u8>>,
    // Record received by block_until_ready() and not consumed yet.
    stash: Option<Vec<u8>>,
}

/// Kernel side of the channels: producer of queued records, consumer of dispatched ones.
pub struct KernelEnd {
    pub queued: Sender<Vec<u8>>,
    pub dispatched: Receiver<Vec<u8>>,
}

/// Create a connected [`Transport`] / [`KernelEnd`] pair, `capacity` records per direction.
pub fn channel(capacity: usize) -> (Transport, KernelEnd) {
    let (queued_tx, queued_rx) = channel::bounded(capacity);
    let (dispatched_tx, dispatched_rx) = channel::bounded(capacity);

    (
        Transport {
            queued: queued_rx,
            dispatched: dispatched_tx,
            stash: None,
        },
        KernelEnd {
            queued: queued_tx,
            dispatched: dispatched_rx,
        },
    )
}

impl KernelEnd {
    /// Hand a queued record to the scheduler, waiting for room in the channel.
    ///
    /// The record is never dropped: returns `Ok(false)` only if `stop` was set before there was
    /// room for it.
    pub fn enqueue(
        &self,
        mut record: Vec<u8>,
        stop: &AtomicBool,
    ) -> Result<bool, TransportError> {
        loop {
            match self.queued.send_timeout(record, POLL_SLICE) {
                Ok(()) => return Ok(true),
                Err(SendTimeoutError::Timeout(r)) => {
                    if stop.load(Ordering::Relaxed) {
                        return Ok(false);
                    }
                    record = r;
                }
                Err(SendTimeoutError::Disconnected(_)) => return Err(TransportError::Disconnected),
            }
        }
    }
}

/// Call `f` until it succeeds, sleeping `interval` between attempts; `None` if `stop` is set
/// first.
///
/// Used by the pollers for operations that fail while the kernel ring is momentarily full.
pub fn retry_until_stopped<T, E: Display>(
    stop: &AtomicBool,
    interval: Duration,
    mut f: impl FnMut() -> Result<T, E>,
) -> Option<T> {
    let mut nr_failures = 0u64;
    loop {
        match f() {
            Ok(val) => return Some(val),
            Err(err) => {
                if nr_failures == 0 {
                    debug!("ring buffer busy, retrying: {}", err);
                }
                nr_failures += 1;
            }
        }
        if stop.load(Ordering::Relaxed) {
            return None;
        }
        thread::sleep(interval);
    }
}

impl Transport {
    /// Receive the next queued record without blocking.
    pub fn try_dequeue(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        if let Some(record) = self.stash.take() {
            return Ok(Some(record));
        }
        match self.queued.try_recv() {
            Ok(record) => Ok(Some(record)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(TransportError::Disconnected),
        }
    }

    /// Wait until a queued record is available, without consuming it.
    ///
    /// Returns `Ok(true)` if the next [`Transport::try_dequeue`] will return a record,
    /// `Ok(false)` if `timeout` expired or `shutdown` was raised first. A `None` timeout waits
    /// until a record arrives or shutdown is requested.
    pub fn block_until_ready(
        &mut self,
        timeout: Option<Duration>,
        shutdown: &AtomicBool,
    ) -> Result<bool, TransportError> {
        if self.stash.is_some() {
            return Ok(true);
        }
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            if shutdown.load(Ordering::Relaxed) {
                return Ok(false);
            }
            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        // Still give a chance to a record that is already there.
                        return match self.queued.try_recv() {
                            Ok(record) => {
                                self.stash = Some(record);
                                Ok(true)
                            }
                            Err(TryRecvError::Empty) => Ok(false),
                            Err(TryRecvError::Disconnected) => Err(TransportError::Disconnected),
                        };
                    }
                    (deadline - now).min(POLL_SLICE)
                }
                None => POLL_SLICE,
            };
            match self.queued.recv_timeout(wait) {
                Ok(record) => {
                    self.stash = Some(record);
                    return Ok(true);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(TransportError::Disconnected),
            }
        }
    }

    /// Send a record to the dispatched queue.
    pub fn dispatch(&self, record: Vec<u8>) -> Result<(), TransportError> {
        match self.dispatched.send_timeout(record, DISPATCH_TIMEOUT) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(TransportError::Full),
            Err(SendTimeoutError::Disconnected(_)) => Err(TransportError::Disconnected),
        }
    }

    /// Amount of queued records waiting to be consumed.
    pub fn nr_queued(&self) -> usize {
        self.queued.len() + self.stash.is_some() as usize
    }

    /// Amount of dispatched records not yet drained by the kernel side.
    pub fn nr_dispatched(&self) -> usize {
        self.dispatched.len()
    }
}
