//! Editing stage: applies the goatee/smile edits to each aligned face and
//! publishes the result as the packet's merged image.

use super::models::{FaceEdits, FaceEditor};
use super::{reemit_on_change, StageDeps, MODIFIED_IMAGE_NAME};
use crate::backend::{
    Connection, ConnectionPacket, HeapError, PacketPump, ReemitSignal, StageContext, StageWorker,
};
use crate::control::{NumberConfig, SheetError, SheetSchema};
use crate::error::Result;

pub const NAME: &str = "FaceModifier";

pub fn schema() -> std::result::Result<SheetSchema, SheetError> {
    SheetSchema::builder()
        .number(
            "goatee",
            NumberConfig::new(-30.0, 30.0, 1.0).with_instant_update(true),
            0.0,
        )
        .number(
            "smile",
            NumberConfig::new(-30.0, 30.0, 1.0).with_instant_update(true),
            0.0,
        )
        .build()
}

fn modify_faces(
    editor: &mut dyn FaceEditor,
    packet: &mut ConnectionPacket,
    edits: &FaceEdits,
) -> std::result::Result<(), HeapError> {
    let names: Vec<String> = packet
        .get_face_list()
        .iter()
        .filter_map(|f| f.face_align_image_name.clone())
        .collect();

    for name in names {
        let Some(face) = packet.get_image(&name) else {
            continue;
        };
        let modified = editor.edit(&face, edits);
        packet.set_image(MODIFIED_IMAGE_NAME, &modified)?;
        packet.set_merged_image_name(MODIFIED_IMAGE_NAME);
    }
    Ok(())
}

pub struct FaceModifierWorker {
    editor: Box<dyn FaceEditor>,
    pump: PacketPump,
    reemit: ReemitSignal,
}

impl FaceModifierWorker {
    pub fn new(deps: &StageDeps, editor: Box<dyn FaceEditor>, input: Connection, output: Connection) -> Self {
        Self {
            editor,
            pump: PacketPump::new(input, output, deps.heap.clone(), deps.timing),
            reemit: deps.reemit.clone(),
        }
    }
}

impl StageWorker for FaceModifierWorker {
    fn on_start(&mut self, ctx: &mut StageContext<'_>) -> Result<()> {
        reemit_on_change(ctx.sheet, &self.reemit, &["goatee", "smile"])?;
        Ok(())
    }

    fn on_tick(&mut self, ctx: &mut StageContext<'_>) {
        let edits = FaceEdits {
            goatee: ctx.sheet.number("goatee").unwrap_or(0.0) as f32,
            smile: ctx.sheet.number("smile").unwrap_or(0.0) as f32,
        };
        let editor = self.editor.as_mut();
        self.pump.tick(ctx, |packet| modify_faces(editor, packet, &edits));
    }

    fn on_stop(&mut self, _ctx: &mut StageContext<'_>) {
        self.pump.flush_pending(NAME);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::worker::ProfileTimer;
    use crate::backend::{FaceInfo, FrameId, WeakHeap, WorkerState};
    use crate::config::WorkerTiming;
    use crate::control::WorkerSheet;
    use crate::stages::models::{IntensityEditor, MockFaceEditor};
    use crate::types::FrameImage;
    use std::sync::Arc;
    use std::time::Duration;

    fn aligned_packet(heap: &Arc<WeakHeap>) -> ConnectionPacket {
        let mut p = ConnectionPacket::new(heap, FrameId::next());
        p.set_image("face_0", &FrameImage::filled(8, 8, 3, 100)).unwrap();
        p.add_face(FaceInfo {
            face_align_image_name: Some("face_0".to_string()),
            ..Default::default()
        });
        p
    }

    #[test]
    fn test_edits_aligned_face_into_merged_image() {
        let heap = Arc::new(WeakHeap::new(1024 * 1024));
        let mut packet = aligned_packet(&heap);
        let edits = FaceEdits { goatee: 0.0, smile: 20.0 };
        modify_faces(&mut IntensityEditor, &mut packet, &edits).unwrap();

        assert_eq!(packet.merged_image_name(), Some(MODIFIED_IMAGE_NAME));
        let merged = packet.get_image(MODIFIED_IMAGE_NAME).unwrap();
        assert_eq!(merged.pixel(0, 0), Some(&[100u8, 100, 100][..]));
        assert_eq!(merged.pixel(0, 7), Some(&[120u8, 120, 120][..]));
    }

    #[test]
    fn test_faces_without_alignment_are_skipped() {
        let heap = Arc::new(WeakHeap::new(1024 * 1024));
        let mut packet = ConnectionPacket::new(&heap, FrameId::next());
        packet.add_face(FaceInfo::default());
        let mut editor = MockFaceEditor::new();
        editor.expect_edit().never();
        modify_faces(&mut editor, &mut packet, &FaceEdits::default()).unwrap();
        assert!(packet.merged_image_name().is_none());
    }

    #[test]
    fn test_worker_reads_sheet_values() {
        let deps = StageDeps {
            heap: Arc::new(WeakHeap::new(1024 * 1024)),
            reemit: ReemitSignal::new(),
            timing: WorkerTiming {
                read_timeout: Duration::from_millis(1),
                backpressure_sleep: Duration::from_millis(1),
                output_queue_depth: 1,
            },
        };
        let input = Connection::new("in");
        let output = Connection::new("out");
        let mut editor = MockFaceEditor::new();
        editor
            .expect_edit()
            .withf(|_, e| e.goatee == 5.0 && e.smile == 0.0)
            .times(1)
            .returning(|face, _| face.clone());
        let mut worker = FaceModifierWorker::new(&deps, Box::new(editor), input.clone(), output.clone());
        let mut sheet = WorkerSheet::new(&schema().unwrap(), WorkerState::new());
        sheet.enable_all();

        let mut profile = ProfileTimer::new();
        let mut ctx = StageContext::new(NAME, &mut sheet, &mut profile);
        worker.on_start(&mut ctx).unwrap();
        ctx.sheet.set_number("goatee", 5.0).unwrap();
        assert!(deps.reemit.is_pending());

        input.write(aligned_packet(&deps.heap));
        worker.on_tick(&mut ctx);
        assert!(output.try_read().unwrap().merged_image_name().is_some());
    }

    #[test]
    fn test_worker_retries_edit_when_heap_is_full() {
        let heap = Arc::new(WeakHeap::new(512));
        let deps = StageDeps {
            heap: heap.clone(),
            reemit: ReemitSignal::new(),
            timing: WorkerTiming {
                read_timeout: Duration::from_millis(1),
                backpressure_sleep: Duration::from_millis(1),
                output_queue_depth: 1,
            },
        };
        let input = Connection::new("in");
        let output = Connection::new("out");
        let mut worker = FaceModifierWorker::new(&deps, Box::new(IntensityEditor), input.clone(), output.clone());
        let mut sheet = WorkerSheet::new(&schema().unwrap(), WorkerState::new());
        sheet.enable_all();
        input.write(aligned_packet(&heap));
        let blocker = heap.store(&[0u8; 200]).unwrap();

        let mut profile = ProfileTimer::new();
        let mut ctx = StageContext::new(NAME, &mut sheet, &mut profile);
        worker.on_start(&mut ctx).unwrap();
        worker.on_tick(&mut ctx);
        assert!(output.is_empty());
        assert!(worker.pump.is_stalled());

        heap.release(blocker).unwrap();
        worker.on_tick(&mut ctx);
        let out = output.try_read().unwrap();
        assert_eq!(out.merged_image_name(), Some(MODIFIED_IMAGE_NAME));
        assert_eq!(out.get_image(MODIFIED_IMAGE_NAME), out.get_image("face_0"));
    }
}
