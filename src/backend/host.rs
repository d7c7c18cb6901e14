//! Supervising side of a stage.
//!
//! A [`StageHost`] owns one worker thread, the host mirror of its control
//! sheet and its slot in the state database. Start and stop are requests;
//! the embedding application keeps calling [`StageHost::process_messages`]
//! until the status settles.
//!
//! A worker that panics is restarted with its last persisted state, up to
//! the configured restart budget. After that the stage stays stopped and
//! keeps the crash message in [`StageHost::last_error`].

use crate::backend::db::BackendDb;
use crate::backend::state::WorkerState;
use crate::backend::worker::{spawn_worker, HostMessage, StageWorker, WorkerHandle, WorkerMessage};
use crate::control::{HostSheet, SheetSchema};
use crate::error::{LiveError, Result};
use crossbeam_channel::TryRecvError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Builds a fresh worker for every (re)start.
pub type WorkerFactory = Box<dyn FnMut() -> Result<Box<dyn StageWorker>> + Send>;

/// Lifecycle of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageStatus {
    Stopped,
    Starting,
    Started,
    Stopping,
}

impl StageStatus {
    pub fn is_transient(self) -> bool {
        matches!(self, StageStatus::Starting | StageStatus::Stopping)
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StageStatus::Stopped => "stopped",
            StageStatus::Starting => "starting",
            StageStatus::Started => "started",
            StageStatus::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

pub struct StageHost {
    name: String,
    schema: SheetSchema,
    sheet: HostSheet,
    db: BackendDb,
    factory: WorkerFactory,
    worker: Option<WorkerHandle>,
    status: StageStatus,
    avg_process_time: Option<Duration>,
    restarts: u32,
    max_restarts: u32,
    last_error: Option<String>,
}

impl StageHost {
    pub fn new(
        name: impl Into<String>,
        schema: SheetSchema,
        db: BackendDb,
        factory: WorkerFactory,
        max_restarts: u32,
    ) -> Self {
        let sheet = HostSheet::new(&schema);
        Self {
            name: name.into(),
            schema,
            sheet,
            db,
            factory,
            worker: None,
            status: StageStatus::Stopped,
            avg_process_time: None,
            restarts: 0,
            max_restarts,
            last_error: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> StageStatus {
        self.status
    }

    pub fn is_starting(&self) -> bool {
        self.status == StageStatus::Starting
    }

    pub fn is_started(&self) -> bool {
        self.status == StageStatus::Started
    }

    pub fn is_stopping(&self) -> bool {
        self.status == StageStatus::Stopping
    }

    pub fn is_stopped(&self) -> bool {
        self.status == StageStatus::Stopped
    }

    /// Control sheet mirror.
    pub fn sheet(&self) -> &HostSheet {
        &self.sheet
    }

    pub fn sheet_mut(&mut self) -> &mut HostSheet {
        &mut self.sheet
    }

    /// Average per-packet processing time last reported by the worker.
    pub fn avg_process_time(&self) -> Option<Duration> {
        self.avg_process_time
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Automatic restarts since the last explicit start.
    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    fn on_off_key(&self) -> String {
        format!("{}:on_off", self.name)
    }

    /// Request a start. Only acts on a stopped stage.
    pub fn start(&mut self) -> Result<()> {
        if !self.is_stopped() {
            tracing::debug!("{}: start ignored while {}", self.name, self.status);
            return Ok(());
        }
        self.restarts = 0;
        self.last_error = None;
        self.spawn()
    }

    fn spawn(&mut self) -> Result<()> {
        let state: WorkerState = self.db.get(&self.name).unwrap_or_default();
        let worker = match (self.factory)() {
            Ok(w) => w,
            Err(e) => {
                self.last_error = Some(e.to_string());
                return Err(e.with_context(format!("Failed to build stage {}", self.name)));
            }
        };
        let handle = spawn_worker(&self.name, worker, &self.schema, state)
            .map_err(|e| LiveError::stage(&self.name, e.to_string()))?;
        self.worker = Some(handle);
        self.status = StageStatus::Starting;
        tracing::info!("{}: starting", self.name);
        Ok(())
    }

    /// Request a stop. Only acts on a started stage.
    ///
    /// Requests already accepted by the mirror reach the worker ahead of the
    /// stop, and the mirror refuses further changes from here on.
    pub fn stop(&mut self) {
        if !self.is_started() {
            tracing::debug!("{}: stop ignored while {}", self.name, self.status);
            return;
        }
        self.forward_requests();
        match &self.worker {
            Some(worker) if worker.send(HostMessage::Stop) => {
                self.sheet.disable_all();
                self.status = StageStatus::Stopping;
                tracing::info!("{}: stopping", self.name);
            }
            _ => self.mark_stopped(),
        }
    }

    /// Hand every queued control request to the worker, oldest first.
    fn forward_requests(&mut self) {
        let Some(worker) = &self.worker else {
            return;
        };
        for request in self.sheet.take_requests() {
            if !worker.send(HostMessage::Sheet(request.clone())) {
                tracing::warn!(
                    "{}: worker gone, request for '{}' not delivered",
                    self.name,
                    request.field()
                );
            }
        }
    }

    /// Relay control traffic and advance the lifecycle. Call at a steady
    /// interval; never blocks on the worker.
    pub fn process_messages(&mut self) {
        self.forward_requests();

        loop {
            let msg = match &self.worker {
                Some(worker) => worker.try_recv(),
                None => return,
            };
            match msg {
                Ok(msg) => {
                    if !self.handle_message(msg) {
                        return;
                    }
                }
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => {
                    let expected = self.status == StageStatus::Stopping;
                    if expected {
                        self.mark_stopped();
                    } else {
                        self.handle_crash("worker exited unexpectedly".to_string());
                    }
                    return;
                }
            }
        }
    }

    /// Returns false once the worker is gone.
    fn handle_message(&mut self, msg: WorkerMessage) -> bool {
        match msg {
            WorkerMessage::Started => {
                self.status = StageStatus::Started;
                tracing::info!("{}: started", self.name);
            }
            WorkerMessage::Sheet(update) => {
                if let Err(e) = self.sheet.apply_update(update) {
                    tracing::warn!("{}: bad sheet update: {}", self.name, e);
                }
            }
            WorkerMessage::SaveState(state) => self.db.put(&self.name, &state),
            WorkerMessage::ProcessTime(avg) => self.avg_process_time = Some(avg),
            WorkerMessage::Stopped => {
                self.mark_stopped();
                return false;
            }
            WorkerMessage::Failed(message) => {
                tracing::error!("{}: failed to start: {}", self.name, message);
                self.last_error = Some(message);
                self.mark_stopped();
                return false;
            }
            WorkerMessage::Crashed(message) => {
                self.handle_crash(message);
                return false;
            }
        }
        true
    }

    fn mark_stopped(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.join();
        }
        self.sheet.disable_all();
        self.avg_process_time = None;
        if self.status != StageStatus::Stopped {
            tracing::info!("{}: stopped", self.name);
        }
        self.status = StageStatus::Stopped;
    }

    fn handle_crash(&mut self, message: String) {
        let was_stopping = self.status == StageStatus::Stopping;
        self.last_error = Some(message.clone());
        self.mark_stopped();
        if was_stopping {
            return;
        }
        if self.restarts >= self.max_restarts {
            tracing::error!(
                "{}: crashed ({}), restart budget of {} used up",
                self.name,
                message,
                self.max_restarts
            );
            return;
        }
        self.restarts += 1;
        tracing::warn!(
            "{}: crashed ({}), restarting ({}/{})",
            self.name,
            message,
            self.restarts,
            self.max_restarts
        );
        if let Err(e) = self.spawn() {
            tracing::error!("{}: restart failed: {}", self.name, e);
        }
    }

    /// Remember whether the stage is running.
    pub fn save_on_off_state(&self) {
        let on = matches!(self.status, StageStatus::Started | StageStatus::Starting);
        self.db.put(&self.on_off_key(), &on);
    }

    /// Start the stage if it was running when last saved. Stages with no
    /// saved on/off state start too.
    pub fn restore_on_off_state(&mut self) -> Result<()> {
        let on = self.db.get::<bool>(&self.on_off_key()).unwrap_or(true);
        if on {
            self.start()
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for StageHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageHost")
            .field("name", &self.name)
            .field("status", &self.status)
            .field("restarts", &self.restarts)
            .finish()
    }
}
