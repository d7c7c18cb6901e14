//! Frame source stage.
//!
//! Captures frames at the configured rate and writes them to the (possibly
//! shared) source connection. When the re-emit signal is delivered it
//! re-publishes the last captured image under a fresh [`FrameId`] instead of
//! waiting for the next capture.

use super::models::FrameCapture;
use super::{StageDeps, FRAME_IMAGE_NAME};
use crate::backend::{
    Connection, ConnectionPacket, FrameId, ImageRef, ProducerId, SignalListener, StageContext,
    StageWorker, StateValue, WeakHeap,
};
use crate::config::WorkerTiming;
use crate::control::{ChoiceConfig, FieldConfig, NumberConfig, SheetError, SheetSchema};
use crate::error::Result;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const NAME: &str = "CameraSource";

pub fn schema(resolutions: &[String]) -> std::result::Result<SheetSchema, SheetError> {
    SheetSchema::builder()
        .switch("resolution", ChoiceConfig::new(resolutions.iter().cloned()), Some(0))
        .number("fps", NumberConfig::new(1.0, 240.0, 1.0), 30.0)
        .signal("open_settings")
        .signal("load_settings")
        .signal("save_settings")
        .build()
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CameraCommand {
    SetResolution(Option<usize>),
    OpenSettings,
    LoadSettings,
    SaveSettings,
}

/// Keeps one heap reference on the last captured image.
struct HeldImage {
    heap: Arc<WeakHeap>,
    image: ImageRef,
}

impl HeldImage {
    fn retain(heap: &Arc<WeakHeap>, image: ImageRef) -> Option<Self> {
        heap.retain(image.handle).ok()?;
        Some(Self {
            heap: heap.clone(),
            image,
        })
    }
}

impl Drop for HeldImage {
    fn drop(&mut self) {
        if let Err(e) = self.heap.release(self.image.handle) {
            tracing::warn!("{}: failed to release last frame: {}", NAME, e);
        }
    }
}

pub struct CameraSourceWorker {
    capture: Box<dyn FrameCapture>,
    output: Connection,
    heap: Arc<WeakHeap>,
    timing: WorkerTiming,
    producer: ProducerId,
    seq: u64,
    reemit: SignalListener,
    reemit_requested: bool,
    held: Option<HeldImage>,
    pending: Option<ConnectionPacket>,
    next_capture: Instant,
    commands_tx: Sender<CameraCommand>,
    commands_rx: Receiver<CameraCommand>,
}

impl CameraSourceWorker {
    pub fn new(deps: &StageDeps, capture: Box<dyn FrameCapture>, output: Connection, producer: ProducerId) -> Self {
        let (commands_tx, commands_rx) = unbounded();
        Self {
            capture,
            output,
            heap: deps.heap.clone(),
            timing: deps.timing,
            producer,
            seq: 0,
            reemit: deps.reemit.subscribe(),
            reemit_requested: false,
            held: None,
            pending: None,
            next_capture: Instant::now(),
            commands_tx,
            commands_rx,
        }
    }

    fn next_packet(&mut self) -> ConnectionPacket {
        let mut packet = ConnectionPacket::new(&self.heap, FrameId::next());
        packet.set_origin(self.producer, self.seq);
        self.seq += 1;
        packet
    }

    fn reemit_last(&mut self) -> Option<ConnectionPacket> {
        let image = self.held.as_ref()?.image;
        let mut packet = self.next_packet();
        if let Err(e) = packet.share_image(FRAME_IMAGE_NAME, image) {
            tracing::debug!("{}: cannot re-emit last frame: {}", NAME, e);
            return None;
        }
        packet.set_frame_image_name(FRAME_IMAGE_NAME);
        Some(packet)
    }

    fn capture_new(&mut self) -> Option<ConnectionPacket> {
        let frame = self.capture.capture()?;
        let mut packet = self.next_packet();
        if let Err(e) = packet.set_image(FRAME_IMAGE_NAME, &frame) {
            // A live source does not hold frames for a full arena: the frame
            // is dropped and the next capture, at the normal rate, tries again.
            tracing::debug!("{}: dropping captured frame: {}", NAME, e);
            return None;
        }
        packet.set_frame_image_name(FRAME_IMAGE_NAME);
        self.held = packet
            .image_ref(FRAME_IMAGE_NAME)
            .and_then(|r| HeldImage::retain(&self.heap, r));
        Some(packet)
    }

    fn handle_commands(&mut self, ctx: &mut StageContext<'_>) {
        while let Ok(cmd) = self.commands_rx.try_recv() {
            match cmd {
                CameraCommand::SetResolution(Some(index)) => self.capture.set_resolution(index),
                CameraCommand::SetResolution(None) => {}
                CameraCommand::OpenSettings => {
                    if !self.capture.open_settings() {
                        tracing::info!("{}: capture device has no settings dialog", NAME);
                    }
                }
                CameraCommand::SaveSettings => {
                    let resolution = ctx.sheet.selection("resolution").map_or(-1, |i| i as i64);
                    let fps = ctx.sheet.number("fps").unwrap_or(30.0);
                    ctx.sheet.store_extra("saved_resolution", StateValue::Int(resolution));
                    ctx.sheet.store_extra("saved_fps", StateValue::Float(fps));
                    tracing::info!("{}: settings saved", NAME);
                }
                CameraCommand::LoadSettings => {
                    let saved_res = ctx.sheet.state().int("saved_resolution");
                    let saved_fps = ctx.sheet.state().float("saved_fps");
                    if let Some(res) = saved_res {
                        if let Err(e) = ctx.sheet.set_selection("resolution", usize::try_from(res).ok()) {
                            tracing::warn!("{}: cannot restore saved resolution: {}", NAME, e);
                        }
                    }
                    if let Some(fps) = saved_fps {
                        if let Err(e) = ctx.sheet.set_number("fps", fps) {
                            tracing::warn!("{}: cannot restore saved fps: {}", NAME, e);
                        }
                    }
                    if saved_res.is_none() && saved_fps.is_none() {
                        tracing::info!("{}: no saved settings", NAME);
                    }
                }
            }
        }
    }
}

impl StageWorker for CameraSourceWorker {
    fn on_start(&mut self, ctx: &mut StageContext<'_>) -> Result<()> {
        let resolutions = self.capture.resolutions();
        ctx.sheet
            .set_config("resolution", FieldConfig::Switch(ChoiceConfig::new(resolutions)))?;
        if let Some(index) = ctx.sheet.selection("resolution") {
            self.capture.set_resolution(index);
        }

        let tx = self.commands_tx.clone();
        ctx.sheet.call_on_change("resolution", move |v| {
            let _ = tx.send(CameraCommand::SetResolution(v.as_selection()));
        })?;
        for (field, cmd) in [
            ("open_settings", CameraCommand::OpenSettings),
            ("load_settings", CameraCommand::LoadSettings),
            ("save_settings", CameraCommand::SaveSettings),
        ] {
            let tx = self.commands_tx.clone();
            ctx.sheet.call_on_change(field, move |_| {
                let _ = tx.send(cmd);
            })?;
        }
        self.next_capture = Instant::now();
        Ok(())
    }

    fn on_tick(&mut self, ctx: &mut StageContext<'_>) {
        self.handle_commands(ctx);
        self.reemit_requested |= self.reemit.take();

        if self.pending.is_none() {
            let now = Instant::now();
            if self.reemit_requested {
                self.reemit_requested = false;
                self.pending = self.reemit_last();
            }
            if self.pending.is_none() && now >= self.next_capture {
                let fps = ctx.sheet.number("fps").unwrap_or(30.0).max(1.0);
                self.next_capture = now + Duration::from_secs_f64(1.0 / fps);
                ctx.start_profile_timing();
                self.pending = self.capture_new();
                ctx.stop_profile_timing();
            }
        }

        match self.pending.take() {
            Some(packet) if self.output.is_full(self.timing.output_queue_depth) => {
                self.pending = Some(packet);
                std::thread::sleep(self.timing.backpressure_sleep);
            }
            Some(packet) => self.output.write(packet),
            None => {
                let until_next = self.next_capture.saturating_duration_since(Instant::now());
                std::thread::sleep(until_next.min(self.timing.read_timeout));
            }
        }
    }

    fn on_stop(&mut self, _ctx: &mut StageContext<'_>) {
        if let Some(packet) = self.pending.take() {
            if self.output.is_full(self.timing.output_queue_depth) {
                tracing::debug!("{}: discarding pending frame {} on stop", NAME, packet.frame_id());
            } else {
                self.output.write(packet);
            }
        }
        self.held = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ReemitSignal, WorkerState};
    use crate::backend::worker::ProfileTimer;
    use crate::control::WorkerSheet;
    use crate::stages::models::{MockFrameCapture, SyntheticCapture};
    use crate::types::FrameImage;

    fn deps() -> StageDeps {
        StageDeps {
            heap: Arc::new(WeakHeap::new(4 * 1024 * 1024)),
            reemit: ReemitSignal::new(),
            timing: WorkerTiming {
                read_timeout: Duration::from_millis(1),
                backpressure_sleep: Duration::from_millis(1),
                output_queue_depth: 1,
            },
        }
    }

    fn sheet(capture: &dyn FrameCapture) -> WorkerSheet {
        let mut sheet = WorkerSheet::new(&schema(&capture.resolutions()).unwrap(), WorkerState::new());
        sheet.enable_all();
        sheet
    }

    #[test]
    fn test_emits_frames_in_sequence() {
        let deps = deps();
        let out = Connection::new("sources");
        let capture = SyntheticCapture::new();
        let mut sheet = sheet(&capture);
        let mut worker = CameraSourceWorker::new(&deps, Box::new(capture), out.clone(), ProducerId(2));
        let mut profile = ProfileTimer::new();
        let mut ctx = StageContext::new(NAME, &mut sheet, &mut profile);
        worker.on_start(&mut ctx).unwrap();
        ctx.sheet.set_number("fps", 240.0).unwrap();

        worker.on_tick(&mut ctx);
        let first = out.try_read().unwrap();
        assert_eq!(first.producer(), ProducerId(2));
        assert_eq!(first.seq(), 0);
        assert!(first.frame_image().is_some());

        std::thread::sleep(Duration::from_millis(5));
        worker.on_tick(&mut ctx);
        let second = out.try_read().unwrap();
        assert_eq!(second.seq(), 1);
    }

    #[test]
    fn test_reemit_republishes_same_handle_with_new_id() {
        let deps = deps();
        let out = Connection::new("sources");
        let mut capture = MockFrameCapture::new();
        capture.expect_resolutions().returning(|| vec!["1x1".to_string()]);
        capture.expect_set_resolution().return_const(());
        capture
            .expect_capture()
            .times(1)
            .returning(|| Some(FrameImage::filled(4, 4, 3, 9)));
        let mut sheet = sheet(&capture);
        let mut worker = CameraSourceWorker::new(&deps, Box::new(capture), out.clone(), ProducerId(0));
        let mut profile = ProfileTimer::new();
        let mut ctx = StageContext::new(NAME, &mut sheet, &mut profile);
        worker.on_start(&mut ctx).unwrap();
        ctx.sheet.set_number("fps", 1.0).unwrap();

        worker.on_tick(&mut ctx);
        let first = out.try_read().unwrap();
        let handle = first.image_ref(FRAME_IMAGE_NAME).unwrap().handle;
        let first_id = first.frame_id();
        drop(first);

        deps.reemit.send();
        deps.reemit.deliver();
        worker.on_tick(&mut ctx);
        let again = out.try_read().unwrap();
        assert_eq!(again.image_ref(FRAME_IMAGE_NAME).unwrap().handle, handle);
        assert_ne!(again.frame_id(), first_id);
        assert_eq!(again.seq(), 1);
        assert_eq!(again.frame_image().unwrap().data()[0], 9);
    }

    #[test]
    fn test_backpressure_holds_frame() {
        let deps = deps();
        let out = Connection::new("sources");
        let capture = SyntheticCapture::new();
        let mut sheet = sheet(&capture);
        let mut worker = CameraSourceWorker::new(&deps, Box::new(capture), out.clone(), ProducerId(0));
        let mut profile = ProfileTimer::new();
        let mut ctx = StageContext::new(NAME, &mut sheet, &mut profile);
        worker.on_start(&mut ctx).unwrap();
        ctx.sheet.set_number("fps", 240.0).unwrap();

        worker.on_tick(&mut ctx);
        std::thread::sleep(Duration::from_millis(5));
        worker.on_tick(&mut ctx);
        assert_eq!(out.len(), 1);
        assert!(worker.pending.is_some());

        worker.on_stop(&mut ctx);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_save_and_load_settings() {
        let deps = deps();
        let out = Connection::new("sources");
        let capture = SyntheticCapture::new();
        let mut sheet = sheet(&capture);
        let mut worker = CameraSourceWorker::new(&deps, Box::new(capture), out, ProducerId(0));
        let mut profile = ProfileTimer::new();
        let mut ctx = StageContext::new(NAME, &mut sheet, &mut profile);
        worker.on_start(&mut ctx).unwrap();

        ctx.sheet.set_number("fps", 12.0).unwrap();
        ctx.sheet.set_value("save_settings", crate::control::FieldValue::Signal).unwrap();
        worker.handle_commands(&mut ctx);
        ctx.sheet.set_number("fps", 60.0).unwrap();
        ctx.sheet.set_value("load_settings", crate::control::FieldValue::Signal).unwrap();
        worker.handle_commands(&mut ctx);
        assert_eq!(ctx.sheet.number("fps"), Some(12.0));
    }

    #[test]
    fn test_load_settings_without_saved_resolution_restores_fps() {
        let deps = deps();
        let capture = SyntheticCapture::new();
        let mut sheet = sheet(&capture);
        let mut worker = CameraSourceWorker::new(&deps, Box::new(capture), Connection::new("sources"), ProducerId(0));
        let mut profile = ProfileTimer::new();
        let mut ctx = StageContext::new(NAME, &mut sheet, &mut profile);
        worker.on_start(&mut ctx).unwrap();

        ctx.sheet.set_selection("resolution", None).unwrap();
        ctx.sheet.set_number("fps", 24.0).unwrap();
        ctx.sheet.set_value("save_settings", crate::control::FieldValue::Signal).unwrap();
        worker.handle_commands(&mut ctx);
        assert_eq!(ctx.sheet.state().int("saved_resolution"), Some(-1));

        ctx.sheet.set_selection("resolution", Some(1)).unwrap();
        ctx.sheet.set_number("fps", 60.0).unwrap();
        ctx.sheet.set_value("load_settings", crate::control::FieldValue::Signal).unwrap();
        worker.handle_commands(&mut ctx);
        assert_eq!(ctx.sheet.selection("resolution"), None);
        assert_eq!(ctx.sheet.number("fps"), Some(24.0));
    }

    #[test]
    fn test_full_heap_drops_frame_and_next_capture_goes_out() {
        let mut deps = deps();
        deps.heap = Arc::new(WeakHeap::new(64));
        let out = Connection::new("sources");
        let mut capture = MockFrameCapture::new();
        capture.expect_resolutions().returning(|| vec!["4x4".to_string()]);
        capture.expect_set_resolution().return_const(());
        capture
            .expect_capture()
            .times(2)
            .returning(|| Some(FrameImage::filled(4, 4, 3, 1)));
        let mut sheet = sheet(&capture);
        let mut worker = CameraSourceWorker::new(&deps, Box::new(capture), out.clone(), ProducerId(0));
        let mut profile = ProfileTimer::new();
        let mut ctx = StageContext::new(NAME, &mut sheet, &mut profile);
        worker.on_start(&mut ctx).unwrap();
        ctx.sheet.set_number("fps", 240.0).unwrap();

        let blocker = deps.heap.store(&[0u8; 40]).unwrap();
        worker.on_tick(&mut ctx);
        assert!(out.is_empty());
        assert!(worker.pending.is_none());
        assert!(worker.held.is_none());

        deps.heap.release(blocker).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        worker.on_tick(&mut ctx);
        let packet = out.try_read().unwrap();
        assert_eq!(packet.seq(), 1);
        assert!(packet.frame_image().is_some());
    }
}
