//! Pluggable algorithms behind the stages.
//!
//! The pipeline only depends on these traits. The built-in implementations
//! are deliberately simple so the whole pipeline can run headless and be
//! tested without capture devices or neural networks.

use crate::backend::FrameId;
use crate::types::{AffineMat, FaceLandmarks, FaceRect, FrameImage};
use parking_lot::Mutex;
use std::sync::Arc;

/// Source of raw frames.
#[cfg_attr(test, mockall::automock)]
pub trait FrameCapture: Send {
    /// Grab the next frame, or `None` if none is available right now.
    fn capture(&mut self) -> Option<FrameImage>;

    /// Human-readable names of the supported resolutions.
    fn resolutions(&self) -> Vec<String>;

    fn set_resolution(&mut self, index: usize);

    /// Show the device's own settings dialog. Returns false when the
    /// device has none.
    fn open_settings(&mut self) -> bool {
        false
    }
}

/// Face bounding box detector.
#[cfg_attr(test, mockall::automock)]
pub trait FaceDetect: Send {
    fn detect(&mut self, frame: &FrameImage, threshold: f32, max_faces: usize) -> Vec<FaceRect>;
}

/// Landmark regressor working inside a detected rect.
#[cfg_attr(test, mockall::automock)]
pub trait FaceLandmarker: Send {
    /// `coverage` scales the rect before the landmarks are placed.
    fn mark(&mut self, frame: &FrameImage, rect: &FaceRect, coverage: f32) -> Option<FaceLandmarks>;
}

/// Inputs of one face cut.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CutParams {
    pub coverage: f32,
    pub resolution: u32,
    pub exclude_moving_parts: bool,
    /// Head yaw in radians when head mode is on.
    pub head_yaw: Option<f32>,
    pub x_offset: f32,
    pub y_offset: f32,
}

/// Crops an aligned face out of a frame.
#[cfg_attr(test, mockall::automock)]
pub trait FaceCutter: Send {
    /// Returns the aligned image and the frame-to-aligned transform.
    fn cut(&self, frame: &FrameImage, landmarks: &FaceLandmarks, params: &CutParams) -> Option<(FrameImage, AffineMat)>;
}

/// Edit strengths; zero is neutral.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FaceEdits {
    pub goatee: f32,
    pub smile: f32,
}

impl FaceEdits {
    pub fn is_neutral(&self) -> bool {
        self.goatee == 0.0 && self.smile == 0.0
    }
}

/// Edits an aligned face image.
#[cfg_attr(test, mockall::automock)]
pub trait FaceEditor: Send {
    fn edit(&mut self, face: &FrameImage, edits: &FaceEdits) -> FrameImage;
}

/// Final consumer of output frames.
#[cfg_attr(test, mockall::automock)]
pub trait FrameSink: Send {
    fn present(&mut self, frame_id: FrameId, image: &FrameImage);
}

// ==================== Built-in capture ====================

const SYNTHETIC_RESOLUTIONS: [(u32, u32); 3] = [(320, 240), (640, 480), (160, 120)];

/// Generates a dark gradient with a bright square drifting across it.
#[derive(Debug, Clone)]
pub struct SyntheticCapture {
    width: u32,
    height: u32,
    frame_index: u64,
}

impl SyntheticCapture {
    pub fn new() -> Self {
        let (width, height) = SYNTHETIC_RESOLUTIONS[0];
        Self {
            width,
            height,
            frame_index: 0,
        }
    }
}

impl Default for SyntheticCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCapture for SyntheticCapture {
    fn capture(&mut self) -> Option<FrameImage> {
        let (w, h) = (self.width, self.height);
        let side = (w.min(h) / 3).max(1);
        let travel = (w - side).max(1);
        let x0 = ((self.frame_index * 4) % travel as u64) as u32;
        let y0 = (h - side) / 2;
        self.frame_index += 1;

        let mut data = Vec::with_capacity((w * h * 3) as usize);
        for y in 0..h {
            for x in 0..w {
                let inside = x >= x0 && x < x0 + side && y >= y0 && y < y0 + side;
                let v = if inside { 230 } else { ((x + y) % 64) as u8 };
                data.extend_from_slice(&[v, v, v]);
            }
        }
        FrameImage::new(w, h, 3, data)
    }

    fn resolutions(&self) -> Vec<String> {
        SYNTHETIC_RESOLUTIONS
            .iter()
            .map(|(w, h)| format!("{}x{}", w, h))
            .collect()
    }

    fn set_resolution(&mut self, index: usize) {
        if let Some(&(w, h)) = SYNTHETIC_RESOLUTIONS.get(index) {
            self.width = w;
            self.height = h;
        }
    }
}

// ==================== Built-in detectors ====================

/// Never finds a face.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDetector;

impl FaceDetect for NullDetector {
    fn detect(&mut self, _frame: &FrameImage, _threshold: f32, _max_faces: usize) -> Vec<FaceRect> {
        Vec::new()
    }
}

/// Always reports the same rects.
#[derive(Debug, Default, Clone)]
pub struct FixedDetector {
    rects: Vec<FaceRect>,
}

impl FixedDetector {
    pub fn new(rects: Vec<FaceRect>) -> Self {
        Self { rects }
    }
}

impl FaceDetect for FixedDetector {
    fn detect(&mut self, _frame: &FrameImage, _threshold: f32, max_faces: usize) -> Vec<FaceRect> {
        self.rects.iter().take(max_faces).copied().collect()
    }
}

/// Bounding box of every pixel brighter than `threshold`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BrightRegionDetector;

impl FaceDetect for BrightRegionDetector {
    fn detect(&mut self, frame: &FrameImage, threshold: f32, max_faces: usize) -> Vec<FaceRect> {
        if max_faces == 0 {
            return Vec::new();
        }
        let limit = (threshold.clamp(0.0, 1.0) * 255.0) as u8;
        let mut bounds: Option<(u32, u32, u32, u32)> = None;
        for y in 0..frame.height() {
            for x in 0..frame.width() {
                let bright = frame.pixel(x, y).is_some_and(|px| px[0] > limit);
                if bright {
                    bounds = Some(match bounds {
                        None => (x, y, x, y),
                        Some((l, t, r, b)) => (l.min(x), t.min(y), r.max(x), b.max(y)),
                    });
                }
            }
        }
        bounds
            .map(|(l, t, r, b)| FaceRect::new(l as f32, t as f32, (r + 1) as f32, (b + 1) as f32))
            .into_iter()
            .collect()
    }
}

// ==================== Built-in marker ====================

/// Places five landmarks (two eyes, nose, two mouth corners) at fixed
/// proportions of the scaled rect.
#[derive(Debug, Default, Clone, Copy)]
pub struct RectMarker;

const RECT_MARKER_LAYOUT: [[f32; 2]; 5] = [[0.3, 0.35], [0.7, 0.35], [0.5, 0.55], [0.35, 0.75], [0.65, 0.75]];

impl FaceLandmarker for RectMarker {
    fn mark(&mut self, _frame: &FrameImage, rect: &FaceRect, coverage: f32) -> Option<FaceLandmarks> {
        let r = rect.scaled(1.0 / coverage.max(0.01));
        if r.area() <= 0.0 {
            return None;
        }
        let points = RECT_MARKER_LAYOUT
            .iter()
            .map(|[u, v]| [r.left + u * r.width(), r.top + v * r.height()])
            .collect();
        Some(FaceLandmarks::new(points))
    }
}

// ==================== Built-in cutter ====================

/// Square, axis-aligned crop around the landmarks.
#[derive(Debug, Default, Clone, Copy)]
pub struct BoxCutter;

impl FaceCutter for BoxCutter {
    fn cut(&self, frame: &FrameImage, landmarks: &FaceLandmarks, params: &CutParams) -> Option<(FrameImage, AffineMat)> {
        let mut bounds = landmarks.bounding_rect()?;
        if params.exclude_moving_parts {
            // Mouth and jaw sit in the lower third.
            bounds.bottom = bounds.top + bounds.height() * (2.0 / 3.0);
        }
        let size = bounds.width().max(bounds.height()).max(1.0) * params.coverage;
        let (mut cx, mut cy) = bounds.center();
        cx += params.x_offset * size;
        cy += params.y_offset * size;
        if let Some(yaw) = params.head_yaw {
            cx += yaw.sin() * size * 0.25;
        }

        let resolution = params.resolution.max(1);
        let scale = resolution as f32 / size;
        let mat = AffineMat::scale_translate(scale, -(cx - size * 0.5) * scale, -(cy - size * 0.5) * scale);
        let inverse = mat.invert()?;
        Some((frame.warp_nearest(&inverse, resolution, resolution), mat))
    }
}

// ==================== Built-in editor ====================

/// Shifts brightness of the lower face: `smile` over the bottom half,
/// `goatee` over the bottom quarter. Neutral edits return the input as is.
#[derive(Debug, Default, Clone, Copy)]
pub struct IntensityEditor;

impl FaceEditor for IntensityEditor {
    fn edit(&mut self, face: &FrameImage, edits: &FaceEdits) -> FrameImage {
        if edits.is_neutral() {
            return face.clone();
        }
        let mut out = face.clone();
        let (w, h, c) = (face.width() as usize, face.height() as usize, face.channels() as usize);
        let data = out.data_mut();
        for y in h / 2..h {
            let mut delta = edits.smile;
            if y >= h * 3 / 4 {
                delta -= edits.goatee;
            }
            let row = &mut data[y * w * c..(y + 1) * w * c];
            for v in row.iter_mut() {
                *v = (*v as f32 + delta).clamp(0.0, 255.0) as u8;
            }
        }
        out
    }
}

// ==================== Built-in sinks ====================

/// Discards frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl FrameSink for NullSink {
    fn present(&mut self, _frame_id: FrameId, _image: &FrameImage) {}
}

/// Keeps every presented frame. Clones share the same buffer.
#[derive(Debug, Default, Clone)]
pub struct CollectingSink {
    frames: Arc<Mutex<Vec<(FrameId, FrameImage)>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    pub fn frame_ids(&self) -> Vec<FrameId> {
        self.frames.lock().iter().map(|(id, _)| *id).collect()
    }

    pub fn take(&self) -> Vec<(FrameId, FrameImage)> {
        std::mem::take(&mut *self.frames.lock())
    }
}

impl FrameSink for CollectingSink {
    fn present(&mut self, frame_id: FrameId, image: &FrameImage) {
        self.frames.lock().push((frame_id, image.clone()));
    }
}
