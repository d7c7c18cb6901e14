//! Terminal stage: picks one image out of each packet, holds it back for
//! `target_delay` milliseconds and presents it to a [`FrameSink`],
//! optionally saving it as a PNG sequence.

use super::models::FrameSink;
use super::{reemit_on_change, StageDeps};
use crate::backend::{Connection, ConnectionPacket, FrameId, ReemitSignal, StageContext, StageWorker, WeakHeap};
use crate::config::WorkerTiming;
use crate::control::{ChoiceConfig, NumberConfig, SheetError, SheetSchema};
use crate::error::{LiveError, Result};
use crate::types::FrameImage;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const NAME: &str = "StreamOutput";

/// Choices of the `source_type` switch, in index order.
pub const SOURCE_TYPES: [&str; 3] = ["merged_frame", "aligned_face", "source_frame"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    MergedFrame,
    AlignedFace,
    SourceFrame,
}

impl SourceType {
    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(SourceType::MergedFrame),
            1 => Some(SourceType::AlignedFace),
            2 => Some(SourceType::SourceFrame),
            _ => None,
        }
    }
}

pub fn schema() -> std::result::Result<SheetSchema, SheetError> {
    SheetSchema::builder()
        .switch("source_type", ChoiceConfig::new(SOURCE_TYPES), Some(0))
        .number("aligned_face_id", NumberConfig::new(0.0, 16.0, 1.0), 0.0)
        .flag("save_sequence", false)
        .number("target_delay", NumberConfig::new(0.0, 1000.0, 1.0), 0.0)
        .build()
}

/// Pick the image to show. A packet without a merged image falls back to
/// its source frame.
pub fn select_image(packet: &ConnectionPacket, source: SourceType, face_id: usize) -> Option<FrameImage> {
    match source {
        SourceType::MergedFrame => packet
            .merged_image_name()
            .and_then(|n| packet.get_image(n))
            .or_else(|| packet.frame_image()),
        SourceType::AlignedFace => {
            let face = packet.get_face_list().get(face_id)?;
            packet.get_image(face.face_align_image_name.as_deref()?)
        }
        SourceType::SourceFrame => packet.frame_image(),
    }
}

/// Write `image` as `<dir>/<frame_id>.png`. Colour frames are stored BGR
/// and are swapped to RGB on the way out.
pub fn save_png(dir: &Path, frame_id: FrameId, image: &FrameImage) -> Result<PathBuf> {
    let path = dir.join(format!("{}.png", frame_id));
    let (color, data) = match image.channels() {
        1 => (image::ColorType::L8, image.data().to_vec()),
        3 => {
            let mut rgb = image.data().to_vec();
            rgb.chunks_exact_mut(3).for_each(|px| px.swap(0, 2));
            (image::ColorType::Rgb8, rgb)
        }
        4 => {
            let mut rgba = image.data().to_vec();
            rgba.chunks_exact_mut(4).for_each(|px| px.swap(0, 2));
            (image::ColorType::Rgba8, rgba)
        }
        n => return Err(LiveError::stage(NAME, format!("cannot save {}-channel image", n))),
    };
    std::fs::create_dir_all(dir)?;
    image::save_buffer(&path, &data, image.width(), image.height(), color)
        .map_err(|e| LiveError::stage(NAME, format!("saving {}: {}", path.display(), e)))?;
    Ok(path)
}

struct Delayed {
    due: Instant,
    frame_id: FrameId,
    image: FrameImage,
}

pub struct StreamOutputWorker {
    sink: Box<dyn FrameSink>,
    input: Connection,
    heap: Arc<WeakHeap>,
    timing: WorkerTiming,
    reemit: ReemitSignal,
    sequence_dir: PathBuf,
    save_sequence: bool,
    buffer: VecDeque<Delayed>,
}

impl StreamOutputWorker {
    pub fn new(deps: &StageDeps, sink: Box<dyn FrameSink>, input: Connection, sequence_dir: PathBuf) -> Self {
        Self {
            sink,
            input,
            heap: deps.heap.clone(),
            timing: deps.timing,
            reemit: deps.reemit.clone(),
            sequence_dir,
            save_sequence: false,
            buffer: VecDeque::new(),
        }
    }

    fn present(&mut self, item: Delayed) {
        self.sink.present(item.frame_id, &item.image);
        if self.save_sequence {
            if let Err(e) = save_png(&self.sequence_dir, item.frame_id, &item.image) {
                tracing::warn!("{}: {}", NAME, e);
            }
        }
    }

    fn present_due(&mut self, now: Instant) {
        while self.buffer.front().is_some_and(|d| d.due <= now) {
            if let Some(item) = self.buffer.pop_front() {
                self.present(item);
            }
        }
    }
}

impl StageWorker for StreamOutputWorker {
    fn on_start(&mut self, ctx: &mut StageContext<'_>) -> Result<()> {
        reemit_on_change(
            ctx.sheet,
            &self.reemit,
            &["source_type", "aligned_face_id", "save_sequence", "target_delay"],
        )?;
        Ok(())
    }

    fn on_tick(&mut self, ctx: &mut StageContext<'_>) {
        let source = ctx
            .sheet
            .selection("source_type")
            .and_then(SourceType::from_index);
        let face_id = ctx.sheet.number("aligned_face_id").unwrap_or(0.0) as usize;
        let delay = Duration::from_millis(ctx.sheet.number("target_delay").unwrap_or(0.0) as u64);
        self.save_sequence = ctx.sheet.flag("save_sequence").unwrap_or(false);

        if let Some(mut packet) = self.input.read(self.timing.read_timeout) {
            packet.assign_weak_heap(&self.heap);
            ctx.start_profile_timing();
            let image = source.and_then(|s| select_image(&packet, s, face_id));
            ctx.stop_profile_timing();
            if let Some(image) = image {
                self.buffer.push_back(Delayed {
                    due: Instant::now() + delay,
                    frame_id: packet.frame_id(),
                    image,
                });
            }
        }
        self.present_due(Instant::now());
    }

    fn on_stop(&mut self, _ctx: &mut StageContext<'_>) {
        while let Some(item) = self.buffer.pop_front() {
            self.present(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::worker::ProfileTimer;
    use crate::backend::{FaceInfo, WorkerState};
    use crate::control::WorkerSheet;
    use crate::stages::models::CollectingSink;
    use crate::stages::{FRAME_IMAGE_NAME, MODIFIED_IMAGE_NAME};
    use tempfile::TempDir;

    fn deps() -> StageDeps {
        StageDeps {
            heap: Arc::new(WeakHeap::new(1024 * 1024)),
            reemit: ReemitSignal::new(),
            timing: WorkerTiming {
                read_timeout: Duration::from_millis(1),
                backpressure_sleep: Duration::from_millis(1),
                output_queue_depth: 1,
            },
        }
    }

    fn frame_packet(heap: &Arc<WeakHeap>) -> ConnectionPacket {
        let mut p = ConnectionPacket::new(heap, FrameId::next());
        p.set_image(FRAME_IMAGE_NAME, &FrameImage::filled(4, 4, 3, 10)).unwrap();
        p.set_frame_image_name(FRAME_IMAGE_NAME);
        p
    }

    #[test]
    fn test_select_image_per_source() {
        let heap = Arc::new(WeakHeap::new(1024 * 1024));
        let mut p = frame_packet(&heap);

        let merged = select_image(&p, SourceType::MergedFrame, 0).unwrap();
        assert_eq!(merged.pixel(0, 0), Some(&[10u8, 10, 10][..]));
        assert!(select_image(&p, SourceType::AlignedFace, 0).is_none());

        p.set_image(MODIFIED_IMAGE_NAME, &FrameImage::filled(2, 2, 3, 50)).unwrap();
        p.set_merged_image_name(MODIFIED_IMAGE_NAME);
        p.set_image("aligned", &FrameImage::filled(3, 3, 3, 70)).unwrap();
        p.add_face(FaceInfo {
            face_align_image_name: Some("aligned".to_string()),
            ..Default::default()
        });

        assert_eq!(select_image(&p, SourceType::MergedFrame, 0).unwrap().width(), 2);
        assert_eq!(select_image(&p, SourceType::AlignedFace, 0).unwrap().width(), 3);
        assert!(select_image(&p, SourceType::AlignedFace, 1).is_none());
        assert_eq!(select_image(&p, SourceType::SourceFrame, 0).unwrap().width(), 4);
    }

    #[test]
    fn test_save_png_swaps_to_rgb() {
        let dir = TempDir::new().unwrap();
        let img = FrameImage::new(1, 1, 3, vec![1, 2, 3]).unwrap();
        let path = save_png(dir.path(), FrameId(7), &img).unwrap();
        assert_eq!(path.file_name().unwrap(), "00000007.png");

        let loaded = image::open(&path).unwrap().to_rgb8();
        assert_eq!(loaded.get_pixel(0, 0).0, [3, 2, 1]);
    }

    #[test]
    fn test_presents_immediately_without_delay() {
        let deps = deps();
        let input = Connection::new("in");
        let sink = CollectingSink::new();
        let dir = TempDir::new().unwrap();
        let mut worker = StreamOutputWorker::new(&deps, Box::new(sink.clone()), input.clone(), dir.path().to_path_buf());
        let mut sheet = WorkerSheet::new(&schema().unwrap(), WorkerState::new());
        sheet.enable_all();

        let packet = frame_packet(&deps.heap);
        let id = packet.frame_id();
        input.write(packet);

        let mut profile = ProfileTimer::new();
        let mut ctx = StageContext::new(NAME, &mut sheet, &mut profile);
        worker.on_start(&mut ctx).unwrap();
        worker.on_tick(&mut ctx);
        assert_eq!(sink.frame_ids(), vec![id]);
        assert!(profile.average().is_some());
    }

    #[test]
    fn test_delay_holds_frames_until_stop() {
        let deps = deps();
        let input = Connection::new("in");
        let sink = CollectingSink::new();
        let dir = TempDir::new().unwrap();
        let mut worker = StreamOutputWorker::new(&deps, Box::new(sink.clone()), input.clone(), dir.path().to_path_buf());
        let mut sheet = WorkerSheet::new(&schema().unwrap(), WorkerState::new());
        sheet.enable_all();
        sheet.set_number("target_delay", 1000.0).unwrap();
        sheet.set_flag("save_sequence", true).unwrap();

        input.write(frame_packet(&deps.heap));
        input.write(frame_packet(&deps.heap));

        let mut profile = ProfileTimer::new();
        let mut ctx = StageContext::new(NAME, &mut sheet, &mut profile);
        worker.on_tick(&mut ctx);
        worker.on_tick(&mut ctx);
        assert!(sink.is_empty());

        worker.on_stop(&mut ctx);
        assert_eq!(sink.len(), 2);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }
}
