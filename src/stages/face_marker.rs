//! Landmark stage: adds landmarks and a pose estimate to every detected
//! face, optionally averaged over the last few frames.

use super::models::FaceLandmarker;
use super::{reemit_on_change, StageDeps};
use crate::backend::{Connection, PacketPump, ReemitSignal, StageContext, StageWorker};
use crate::control::{ChoiceConfig, NumberConfig, SheetError, SheetSchema};
use crate::error::Result;
use crate::types::{FaceLandmarks, FacePose};
use std::collections::VecDeque;

pub const NAME: &str = "FaceMarker";

pub fn schema(markers: &[String]) -> std::result::Result<SheetSchema, SheetError> {
    SheetSchema::builder()
        .switch(
            "marker_type",
            ChoiceConfig::new(markers.iter().cloned()).with_none_choice("none"),
            Some(0),
        )
        .number("marker_coverage", NumberConfig::new(0.1, 3.0, 0.1), 1.4)
        .number("temporal_smoothing", NumberConfig::new(1.0, 50.0, 1.0), 1.0)
        .build()
}

/// Rough yaw from where the nose (third point) sits between the eyes
/// (first two points), in degrees.
pub fn estimate_pose(landmarks: &FaceLandmarks) -> Option<FacePose> {
    let [l_eye, r_eye, nose] = [landmarks.points.first()?, landmarks.points.get(1)?, landmarks.points.get(2)?];
    let eye_dist = r_eye[0] - l_eye[0];
    if eye_dist.abs() < f32::EPSILON {
        return None;
    }
    let mid_x = (l_eye[0] + r_eye[0]) * 0.5;
    let yaw = ((nose[0] - mid_x) / eye_dist * 90.0).clamp(-90.0, 90.0);
    let roll = (r_eye[1] - l_eye[1]).atan2(eye_dist).to_degrees();
    Some(FacePose {
        pitch: 0.0,
        yaw,
        roll,
    })
}

/// Per-face moving average of landmark sets.
#[derive(Debug, Default)]
struct Smoother {
    history: Vec<VecDeque<FaceLandmarks>>,
}

impl Smoother {
    fn smooth(&mut self, face_index: usize, landmarks: FaceLandmarks, window: usize) -> FaceLandmarks {
        if self.history.len() <= face_index {
            self.history.resize_with(face_index + 1, VecDeque::new);
        }
        let history = &mut self.history[face_index];
        if history.front().is_some_and(|h| h.len() != landmarks.len()) {
            history.clear();
        }
        history.push_back(landmarks);
        while history.len() > window.max(1) {
            history.pop_front();
        }

        let n = history.len() as f32;
        let mut points = vec![[0.0f32; 2]; history[0].len()];
        for lm in history.iter() {
            for (acc, p) in points.iter_mut().zip(&lm.points) {
                acc[0] += p[0] / n;
                acc[1] += p[1] / n;
            }
        }
        FaceLandmarks::new(points)
    }

    fn truncate(&mut self, faces: usize) {
        self.history.truncate(faces);
    }
}

pub struct FaceMarkerWorker {
    markers: Vec<(String, Box<dyn FaceLandmarker>)>,
    pump: PacketPump,
    reemit: ReemitSignal,
    smoother: Smoother,
}

impl FaceMarkerWorker {
    pub fn new(
        deps: &StageDeps,
        markers: Vec<(String, Box<dyn FaceLandmarker>)>,
        input: Connection,
        output: Connection,
    ) -> Self {
        Self {
            markers,
            pump: PacketPump::new(input, output, deps.heap.clone(), deps.timing),
            reemit: deps.reemit.clone(),
            smoother: Smoother::default(),
        }
    }
}

impl StageWorker for FaceMarkerWorker {
    fn on_start(&mut self, ctx: &mut StageContext<'_>) -> Result<()> {
        reemit_on_change(
            ctx.sheet,
            &self.reemit,
            &["marker_type", "marker_coverage", "temporal_smoothing"],
        )?;
        Ok(())
    }

    fn on_tick(&mut self, ctx: &mut StageContext<'_>) {
        let selected = ctx.sheet.selection("marker_type");
        let coverage = ctx.sheet.number("marker_coverage").unwrap_or(1.4) as f32;
        let window = ctx.sheet.number("temporal_smoothing").unwrap_or(1.0) as usize;
        let marker = selected.and_then(|i| self.markers.get_mut(i));
        let smoother = &mut self.smoother;

        self.pump.tick(ctx, |packet| {
            let Some((_, marker)) = marker else {
                return Ok(());
            };
            let Some(frame) = packet.frame_image() else {
                return Ok(());
            };
            let faces = packet.face_list_mut();
            smoother.truncate(faces.len());
            for (index, face) in faces.iter_mut().enumerate() {
                let Some(rect) = face.face_rect else {
                    continue;
                };
                let Some(landmarks) = marker.mark(&frame, &rect, coverage) else {
                    continue;
                };
                let landmarks = smoother.smooth(index, landmarks, window);
                face.face_pose = estimate_pose(&landmarks);
                face.face_landmarks = Some(landmarks);
            }
            Ok(())
        });
    }

    fn on_stop(&mut self, _ctx: &mut StageContext<'_>) {
        self.pump.flush_pending(NAME);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::worker::ProfileTimer;
    use crate::backend::{ConnectionPacket, FaceInfo, FrameId, WeakHeap, WorkerState};
    use crate::config::WorkerTiming;
    use crate::control::WorkerSheet;
    use crate::stages::models::{MockFaceLandmarker, RectMarker};
    use crate::stages::FRAME_IMAGE_NAME;
    use crate::types::{FaceRect, FrameImage};
    use std::sync::Arc;
    use std::time::Duration;

    fn deps() -> StageDeps {
        StageDeps {
            heap: Arc::new(WeakHeap::new(1024 * 1024)),
            reemit: ReemitSignal::new(),
            timing: WorkerTiming {
                read_timeout: Duration::from_millis(1),
                backpressure_sleep: Duration::from_millis(1),
                output_queue_depth: 4,
            },
        }
    }

    fn packet(heap: &Arc<WeakHeap>, faces: Vec<FaceInfo>) -> ConnectionPacket {
        let mut p = ConnectionPacket::new(heap, FrameId::next());
        p.set_image(FRAME_IMAGE_NAME, &FrameImage::filled(8, 8, 3, 0)).unwrap();
        p.set_frame_image_name(FRAME_IMAGE_NAME);
        p.set_face_list(faces);
        p
    }

    #[test]
    fn test_pose_from_centered_nose_is_frontal() {
        let lm = FaceLandmarks::new(vec![[30.0, 35.0], [70.0, 35.0], [50.0, 55.0]]);
        let pose = estimate_pose(&lm).unwrap();
        assert_eq!(pose.yaw, 0.0);
        assert_eq!(pose.roll, 0.0);
        assert!(estimate_pose(&FaceLandmarks::new(vec![[0.0, 0.0]])).is_none());
    }

    #[test]
    fn test_smoother_averages_window() {
        let mut s = Smoother::default();
        s.smooth(0, FaceLandmarks::new(vec![[0.0, 0.0]]), 2);
        let out = s.smooth(0, FaceLandmarks::new(vec![[10.0, 4.0]]), 2);
        assert_eq!(out.points, vec![[5.0, 2.0]]);
        let out = s.smooth(0, FaceLandmarks::new(vec![[20.0, 4.0]]), 2);
        assert_eq!(out.points, vec![[15.0, 4.0]]);
        let out = s.smooth(0, FaceLandmarks::new(vec![[1.0, 1.0], [2.0, 2.0]]), 2);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_marks_faces_with_rects_and_skips_others() {
        let deps = deps();
        let input = Connection::new("in");
        let output = Connection::new("out");
        let mut worker = FaceMarkerWorker::new(
            &deps,
            vec![("rect".to_string(), Box::new(RectMarker) as Box<dyn FaceLandmarker>)],
            input.clone(),
            output.clone(),
        );
        let mut sheet = WorkerSheet::new(&schema(&["rect".to_string()]).unwrap(), WorkerState::new());
        sheet.enable_all();
        input.write(packet(
            &deps.heap,
            vec![FaceInfo::from_rect(FaceRect::new(0.0, 0.0, 8.0, 8.0)), FaceInfo::default()],
        ));

        let mut profile = ProfileTimer::new();
        let mut ctx = StageContext::new(NAME, &mut sheet, &mut profile);
        worker.on_start(&mut ctx).unwrap();
        worker.on_tick(&mut ctx);

        let out = output.try_read().unwrap();
        let faces = out.get_face_list();
        assert!(faces[0].face_landmarks.is_some());
        assert!(faces[0].face_pose.is_some());
        assert!(faces[1].face_landmarks.is_none());
    }

    #[test]
    fn test_marker_failure_keeps_face() {
        let deps = deps();
        let input = Connection::new("in");
        let output = Connection::new("out");
        let mut mock = MockFaceLandmarker::new();
        mock.expect_mark().returning(|_, _, _| None);
        let mut worker = FaceMarkerWorker::new(
            &deps,
            vec![("mock".to_string(), Box::new(mock) as Box<dyn FaceLandmarker>)],
            input.clone(),
            output.clone(),
        );
        let mut sheet = WorkerSheet::new(&schema(&["mock".to_string()]).unwrap(), WorkerState::new());
        input.write(packet(&deps.heap, vec![FaceInfo::from_rect(FaceRect::new(0.0, 0.0, 4.0, 4.0))]));

        let mut profile = ProfileTimer::new();
        let mut ctx = StageContext::new(NAME, &mut sheet, &mut profile);
        worker.on_tick(&mut ctx);
        let out = output.try_read().unwrap();
        assert_eq!(out.get_face_list().len(), 1);
        assert!(out.get_face_list()[0].face_landmarks.is_none());
    }
}
