//! Face detection stage: fills the packet's face list with one
//! [`FaceInfo`](crate::backend::FaceInfo) per detected face, largest first.

use super::models::FaceDetect;
use super::{reemit_on_change, StageDeps};
use crate::backend::{Connection, FaceInfo, PacketPump, ReemitSignal, StageContext, StageWorker};
use crate::control::{ChoiceConfig, NumberConfig, SheetError, SheetSchema};
use crate::error::Result;

pub const NAME: &str = "FaceDetector";

pub fn schema(detectors: &[String]) -> std::result::Result<SheetSchema, SheetError> {
    SheetSchema::builder()
        .switch(
            "detector_type",
            ChoiceConfig::new(detectors.iter().cloned()).with_none_choice("none"),
            Some(0),
        )
        .number("threshold", NumberConfig::new(0.01, 1.0, 0.01), 0.5)
        .number("max_faces", NumberConfig::new(1.0, 16.0, 1.0), 1.0)
        .build()
}

pub struct FaceDetectorWorker {
    detectors: Vec<(String, Box<dyn FaceDetect>)>,
    pump: PacketPump,
    reemit: ReemitSignal,
}

impl FaceDetectorWorker {
    pub fn new(
        deps: &StageDeps,
        detectors: Vec<(String, Box<dyn FaceDetect>)>,
        input: Connection,
        output: Connection,
    ) -> Self {
        Self {
            detectors,
            pump: PacketPump::new(input, output, deps.heap.clone(), deps.timing),
            reemit: deps.reemit.clone(),
        }
    }
}

impl StageWorker for FaceDetectorWorker {
    fn on_start(&mut self, ctx: &mut StageContext<'_>) -> Result<()> {
        reemit_on_change(ctx.sheet, &self.reemit, &["detector_type", "threshold", "max_faces"])?;
        Ok(())
    }

    fn on_tick(&mut self, ctx: &mut StageContext<'_>) {
        let selected = ctx.sheet.selection("detector_type");
        let threshold = ctx.sheet.number("threshold").unwrap_or(0.5) as f32;
        let max_faces = ctx.sheet.number("max_faces").unwrap_or(1.0) as usize;
        let detector = selected.and_then(|i| self.detectors.get_mut(i));

        self.pump.tick(ctx, |packet| {
            let Some((_, detector)) = detector else {
                return Ok(());
            };
            let Some(frame) = packet.frame_image() else {
                return Ok(());
            };
            let mut rects = detector.detect(&frame, threshold, max_faces);
            rects.sort_by(|a, b| b.area().total_cmp(&a.area()));
            rects.truncate(max_faces);
            tracing::trace!("{}: {} face(s) in frame {}", NAME, rects.len(), packet.frame_id());
            packet.set_face_list(rects.into_iter().map(FaceInfo::from_rect).collect());
            Ok(())
        });
    }

    fn on_stop(&mut self, _ctx: &mut StageContext<'_>) {
        self.pump.flush_pending(NAME);
    }
}
