//! Alignment stage: cuts an aligned crop and a landmark mask for every
//! face that has landmarks.

use super::models::{CutParams, FaceCutter};
use super::{reemit_on_change, StageDeps};
use crate::backend::{
    Connection, ConnectionPacket, HeapError, PacketPump, ReemitSignal, StageContext, StageWorker,
};
use crate::control::{NumberConfig, SheetError, SheetSchema, WorkerSheet};
use crate::error::Result;
use crate::types::{FaceLandmarks, FrameImage};

pub const NAME: &str = "FaceAligner";

pub fn schema() -> std::result::Result<SheetSchema, SheetError> {
    SheetSchema::builder()
        .number(
            "face_coverage",
            NumberConfig::new(0.1, 4.0, 0.1).with_decimals(1).with_instant_update(true),
            2.2,
        )
        .number(
            "resolution",
            NumberConfig::new(16.0, 1024.0, 16.0).with_instant_update(true),
            224.0,
        )
        .flag("exclude_moving_parts", true)
        .flag("head_mode", false)
        .number(
            "x_offset",
            NumberConfig::new(-1.0, 1.0, 0.01).with_decimals(2).with_instant_update(true),
            0.0,
        )
        .number(
            "y_offset",
            NumberConfig::new(-1.0, 1.0, 0.01).with_decimals(2).with_instant_update(true),
            0.0,
        )
        .build()
}

/// Single-channel mask, 255 inside the landmarks' bounding box.
pub fn landmarks_mask(landmarks: &FaceLandmarks, width: u32, height: u32) -> FrameImage {
    let mut mask = FrameImage::filled(width, height, 1, 0);
    let Some(rect) = landmarks.bounding_rect() else {
        return mask;
    };
    let x0 = rect.left.max(0.0) as u32;
    let y0 = rect.top.max(0.0) as u32;
    let x1 = (rect.right.ceil().max(0.0) as u32).min(width);
    let y1 = (rect.bottom.ceil().max(0.0) as u32).min(height);
    let data = mask.data_mut();
    for y in y0..y1 {
        for x in x0..x1 {
            data[(y * width + x) as usize] = 255;
        }
    }
    mask
}

fn cut_params(sheet: &WorkerSheet) -> CutParams {
    CutParams {
        coverage: sheet.number("face_coverage").unwrap_or(2.2) as f32,
        resolution: sheet.number("resolution").unwrap_or(224.0) as u32,
        exclude_moving_parts: sheet.flag("exclude_moving_parts").unwrap_or(true),
        head_yaw: None,
        x_offset: sheet.number("x_offset").unwrap_or(0.0) as f32,
        y_offset: sheet.number("y_offset").unwrap_or(0.0) as f32,
    }
}

/// Cut every marked face. When the heap cannot hold a crop or mask, the
/// images stored so far are removed again and the face list is left as it
/// was, so the whole packet can be retried.
fn align_faces(
    cutter: &dyn FaceCutter,
    packet: &mut ConnectionPacket,
    params: CutParams,
    head_mode: bool,
) -> std::result::Result<(), HeapError> {
    let Some(frame_name) = packet.frame_image_name().map(str::to_string) else {
        return Ok(());
    };
    let Some(frame) = packet.get_image(&frame_name) else {
        return Ok(());
    };

    let mut faces = packet.get_face_list().to_vec();
    let mut stored: Vec<String> = Vec::new();
    for (face_id, face) in faces.iter_mut().enumerate() {
        let Some(landmarks) = face.face_landmarks.as_ref() else {
            continue;
        };
        let head_yaw = if head_mode {
            face.face_pose.map(|p| p.as_radians().1)
        } else {
            None
        };
        let params = CutParams { head_yaw, ..params };
        let Some((aligned, mat)) = cutter.cut(&frame, landmarks, &params) else {
            continue;
        };
        let aligned_landmarks = landmarks.transform(&mat);
        let mask = landmarks_mask(&aligned_landmarks, aligned.width(), aligned.height());

        let image_name = format!("{}_{}_aligned", frame_name, face_id);
        let mask_name = format!("{}_{}_aligned_lmrks_mask", frame_name, face_id);
        for (name, image) in [(&image_name, &aligned), (&mask_name, &mask)] {
            if let Err(e) = packet.set_image(name.clone(), image) {
                for name in &stored {
                    packet.remove_image(name);
                }
                return Err(e);
            }
            stored.push(name.clone());
        }
        face.face_resolution = Some(params.resolution);
        face.face_align_image_name = Some(image_name);
        face.face_align_mask_name = Some(mask_name);
        face.image_to_align_mat = Some(mat);
        face.face_align_landmarks = Some(aligned_landmarks);
    }
    packet.set_face_list(faces);
    Ok(())
}

pub struct FaceAlignerWorker {
    cutter: Box<dyn FaceCutter>,
    pump: PacketPump,
    reemit: ReemitSignal,
}

impl FaceAlignerWorker {
    pub fn new(deps: &StageDeps, cutter: Box<dyn FaceCutter>, input: Connection, output: Connection) -> Self {
        Self {
            cutter,
            pump: PacketPump::new(input, output, deps.heap.clone(), deps.timing),
            reemit: deps.reemit.clone(),
        }
    }
}

impl StageWorker for FaceAlignerWorker {
    fn on_start(&mut self, ctx: &mut StageContext<'_>) -> Result<()> {
        reemit_on_change(
            ctx.sheet,
            &self.reemit,
            &[
                "face_coverage",
                "resolution",
                "exclude_moving_parts",
                "head_mode",
                "x_offset",
                "y_offset",
            ],
        )?;
        Ok(())
    }

    fn on_tick(&mut self, ctx: &mut StageContext<'_>) {
        let params = cut_params(ctx.sheet);
        let head_mode = ctx.sheet.flag("head_mode").unwrap_or(false);
        let cutter = self.cutter.as_ref();
        self.pump
            .tick(ctx, |packet| align_faces(cutter, packet, params, head_mode));
    }

    fn on_stop(&mut self, _ctx: &mut StageContext<'_>) {
        self.pump.flush_pending(NAME);
    }
}
