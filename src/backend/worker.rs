//! Stage Worker Runtime
//!
//! Each stage runs its [`StageWorker`] on a dedicated thread spawned by its
//! [`StageHost`](crate::backend::StageHost). The runtime loop:
//!
//! - drains [`HostMessage`]s (control requests and the stop request)
//! - calls [`StageWorker::on_tick`]
//! - forwards control sheet updates, dirty state and profiling figures to
//!   the host as [`WorkerMessage`]s
//!
//! Worker code runs under `catch_unwind`. A panic ends the thread with a
//! [`WorkerMessage::Crashed`] instead of taking the process down.
//!
//! # Packet flow
//!
//! Most stages share one tick shape, implemented by [`PacketPump`]: with no
//! result pending, read one packet with a short timeout and transform it;
//! with a result pending, write it unless the output is full, otherwise
//! sleep briefly and try again next tick. At most one packet is in flight
//! per stage.
//!
//! A transform that runs out of arena space leaves its packet stalled in the
//! pump. The next tick retries the same packet before reading any new input,
//! so a full heap throttles the stage instead of degrading its output.

use crate::backend::connection::Connection;
use crate::backend::packet::ConnectionPacket;
use crate::backend::state::WorkerState;
use crate::backend::weak_heap::{HeapError, WeakHeap};
use crate::config::WorkerTiming;
use crate::control::{SheetRequest, SheetSchema, SheetUpdate, WorkerSheet};
use crate::error::Result;
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Interval between process-time reports to the host
pub const PROFILE_REPORT_INTERVAL: Duration = Duration::from_millis(500);

/// Samples kept for the rolling process-time average
const PROFILE_WINDOW: usize = 32;

/// Message sent from the host to a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HostMessage {
    /// Forwarded control sheet request
    Sheet(SheetRequest),
    /// Finish the current tick and stop
    Stop,
}

/// Message sent from a worker to its host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkerMessage {
    /// `on_start` completed
    Started,
    /// Authoritative control sheet change
    Sheet(SheetUpdate),
    /// State changed and should be persisted
    SaveState(WorkerState),
    /// Rolling average of per-packet processing time
    ProcessTime(Duration),
    /// `on_start` returned an error; the worker has exited
    Failed(String),
    /// The worker panicked; the worker has exited
    Crashed(String),
    /// Clean shutdown completed
    Stopped,
}

/// What a stage does inside its worker thread.
pub trait StageWorker: Send {
    /// Register callbacks and adjust the sheet. All fields are enabled
    /// before this is called.
    fn on_start(&mut self, ctx: &mut StageContext<'_>) -> Result<()>;

    /// One bounded unit of work. Must return within a few milliseconds.
    fn on_tick(&mut self, ctx: &mut StageContext<'_>);

    /// Called once after the stop request, before the worker reports
    /// `Stopped`.
    fn on_stop(&mut self, _ctx: &mut StageContext<'_>) {}
}

/// Rolling average of processing time.
#[derive(Debug, Default)]
pub struct ProfileTimer {
    started: Option<Instant>,
    samples: VecDeque<Duration>,
}

impl ProfileTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self) {
        self.started = Some(Instant::now());
    }

    /// Close the sample opened by [`ProfileTimer::start`]. Ignored if none
    /// is open.
    pub fn stop(&mut self) {
        if let Some(start) = self.started.take() {
            if self.samples.len() == PROFILE_WINDOW {
                self.samples.pop_front();
            }
            self.samples.push_back(start.elapsed());
        }
    }

    pub fn average(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let total: Duration = self.samples.iter().sum();
        Some(total / self.samples.len() as u32)
    }
}

/// What a stage can reach from inside its callbacks.
pub struct StageContext<'a> {
    name: &'a str,
    pub sheet: &'a mut WorkerSheet,
    profile: &'a mut ProfileTimer,
}

impl<'a> StageContext<'a> {
    pub fn new(name: &'a str, sheet: &'a mut WorkerSheet, profile: &'a mut ProfileTimer) -> Self {
        Self { name, sheet, profile }
    }

    pub fn name(&self) -> &str {
        self.name
    }

    pub fn start_profile_timing(&mut self) {
        self.profile.start();
    }

    pub fn stop_profile_timing(&mut self) {
        self.profile.stop();
    }
}

/// Two-phase consume/produce tick shared by the transforming stages.
pub struct PacketPump {
    input: Connection,
    output: Connection,
    heap: Arc<WeakHeap>,
    timing: WorkerTiming,
    pending: Option<ConnectionPacket>,
    stalled: Option<ConnectionPacket>,
}

impl PacketPump {
    pub fn new(input: Connection, output: Connection, heap: Arc<WeakHeap>, timing: WorkerTiming) -> Self {
        Self {
            input,
            output,
            heap,
            timing,
            pending: None,
            stalled: None,
        }
    }

    /// A transformed packet is waiting for room on the output.
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// A packet is waiting for arena space to be transformed again.
    pub fn is_stalled(&self) -> bool {
        self.stalled.is_some()
    }

    /// Run one tick. `process` runs on a freshly read packet, or again on a
    /// stalled one. [`HeapError::OutOfArena`] stalls the packet for a retry;
    /// any other error is logged and the packet goes on as processed so far.
    pub fn tick<F>(&mut self, ctx: &mut StageContext<'_>, process: F)
    where
        F: FnOnce(&mut ConnectionPacket) -> std::result::Result<(), HeapError>,
    {
        if self.pending.is_none() {
            let next = self.stalled.take().or_else(|| {
                self.input.read(self.timing.read_timeout).map(|mut packet| {
                    packet.assign_weak_heap(&self.heap);
                    packet
                })
            });
            if let Some(mut packet) = next {
                ctx.start_profile_timing();
                let outcome = process(&mut packet);
                ctx.stop_profile_timing();
                match outcome {
                    Ok(()) => self.pending = Some(packet),
                    Err(e @ HeapError::OutOfArena { .. }) => {
                        tracing::debug!("{}: frame {} stalled: {}", ctx.name(), packet.frame_id(), e);
                        self.stalled = Some(packet);
                        std::thread::sleep(self.timing.backpressure_sleep);
                        return;
                    }
                    Err(e) => {
                        tracing::warn!("{}: frame {} passed on incomplete: {}", ctx.name(), packet.frame_id(), e);
                        self.pending = Some(packet);
                    }
                }
            }
        }
        self.try_write();
    }

    fn try_write(&mut self) {
        if self.pending.is_none() {
            return;
        }
        if self.output.is_full(self.timing.output_queue_depth) {
            std::thread::sleep(self.timing.backpressure_sleep);
        } else if let Some(packet) = self.pending.take() {
            self.output.write(packet);
        }
    }

    /// Hand over the held result at shutdown. Written if the output has
    /// room, otherwise dropped, which releases its heap references.
    /// Returns whether it was written.
    pub fn flush_pending(&mut self, stage: &str) -> bool {
        if let Some(packet) = self.stalled.take() {
            tracing::debug!(
                "{}: discarding frame {} on stop, still waiting for arena space",
                stage,
                packet.frame_id()
            );
        }
        let Some(packet) = self.pending.take() else {
            return false;
        };
        if self.output.is_full(self.timing.output_queue_depth) {
            tracing::debug!(
                "{}: discarding pending frame {} on stop, output full",
                stage,
                packet.frame_id()
            );
            false
        } else {
            self.output.write(packet);
            true
        }
    }
}

/// Channels the host keeps for a running worker.
pub struct WorkerHandle {
    pub(crate) tx: Sender<HostMessage>,
    pub(crate) rx: Receiver<WorkerMessage>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn send(&self, msg: HostMessage) -> bool {
        self.tx.send(msg).is_ok()
    }

    pub fn try_recv(&self) -> std::result::Result<WorkerMessage, TryRecvError> {
        self.rx.try_recv()
    }

    /// Wait for the thread to exit.
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Worker thread exited abnormally");
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.tx.send(HostMessage::Stop);
            let _ = thread.join();
        }
    }
}

/// Spawn `worker` on its own thread with a sheet restored from `state`.
pub fn spawn_worker(
    name: &str,
    worker: Box<dyn StageWorker>,
    schema: &SheetSchema,
    state: WorkerState,
) -> Result<WorkerHandle> {
    let (host_tx, host_rx) = unbounded();
    let (worker_tx, worker_rx) = unbounded();
    let sheet = WorkerSheet::new(schema, state);
    let thread_name = name.to_string();

    let thread = std::thread::Builder::new()
        .name(format!("stage-{}", name))
        .spawn(move || run_worker(thread_name, worker, sheet, host_rx, worker_tx))?;

    Ok(WorkerHandle {
        tx: host_tx,
        rx: worker_rx,
        thread: Some(thread),
    })
}

fn run_worker(
    name: String,
    mut worker: Box<dyn StageWorker>,
    mut sheet: WorkerSheet,
    rx: Receiver<HostMessage>,
    tx: Sender<WorkerMessage>,
) {
    let crash_tx = tx.clone();
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        worker_loop(&name, worker.as_mut(), &mut sheet, &rx, &tx)
    }));
    if let Err(payload) = outcome {
        let message = panic_message(payload.as_ref());
        tracing::error!("Stage {} crashed: {}", name, message);
        let _ = crash_tx.send(WorkerMessage::Crashed(message));
    }
}

fn worker_loop(
    name: &str,
    worker: &mut dyn StageWorker,
    sheet: &mut WorkerSheet,
    rx: &Receiver<HostMessage>,
    tx: &Sender<WorkerMessage>,
) {
    let mut profile = ProfileTimer::new();
    sheet.enable_all();
    {
        let mut ctx = StageContext::new(name, sheet, &mut profile);
        if let Err(e) = worker.on_start(&mut ctx) {
            tracing::error!("Stage {} failed to start: {}", name, e);
            let _ = tx.send(WorkerMessage::Failed(e.to_string()));
            return;
        }
    }
    flush_to_host(sheet, tx);
    let _ = tx.send(WorkerMessage::Started);
    tracing::debug!("Stage {} worker loop running", name);

    let mut last_report = Instant::now();
    'run: loop {
        loop {
            match rx.try_recv() {
                Ok(HostMessage::Sheet(request)) => {
                    if let Err(e) = sheet.handle_request(request) {
                        tracing::debug!("{}: control request ignored: {}", name, e);
                    }
                }
                Ok(HostMessage::Stop) | Err(TryRecvError::Disconnected) => break 'run,
                Err(TryRecvError::Empty) => break,
            }
        }

        {
            let mut ctx = StageContext::new(name, sheet, &mut profile);
            worker.on_tick(&mut ctx);
        }
        flush_to_host(sheet, tx);

        if last_report.elapsed() >= PROFILE_REPORT_INTERVAL {
            if let Some(avg) = profile.average() {
                let _ = tx.send(WorkerMessage::ProcessTime(avg));
            }
            last_report = Instant::now();
        }
    }

    {
        let mut ctx = StageContext::new(name, sheet, &mut profile);
        worker.on_stop(&mut ctx);
    }
    sheet.disable_all();
    flush_to_host(sheet, tx);
    let _ = tx.send(WorkerMessage::Stopped);
}

fn flush_to_host(sheet: &mut WorkerSheet, tx: &Sender<WorkerMessage>) {
    for update in sheet.take_updates() {
        let _ = tx.send(WorkerMessage::Sheet(update));
    }
    if let Some(state) = sheet.take_dirty_state() {
        let _ = tx.send(WorkerMessage::SaveState(state));
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
