//! Core data types for FaceFilter Live
//!
//! This module contains the image and face geometry types shared by the
//! pipeline stages and the pluggable model traits.
//!
//! # Main Types
//!
//! - [`FrameImage`] - Interleaved 8-bit image (gray, BGR or BGRA)
//! - [`FaceRect`] - Detected face bounding box in frame pixel coordinates
//! - [`FacePose`] - Head rotation estimate in degrees
//! - [`FaceLandmarks`] - Ordered landmark points
//! - [`AffineMat`] - 2x3 affine transform between frame and aligned space

use serde::{Deserialize, Serialize};

/// Interleaved 8-bit image buffer.
///
/// Images live in the shared heap while they travel through the pipeline;
/// this type is the decoded, owned view a stage works on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameImage {
    width: u32,
    height: u32,
    channels: u8,
    data: Vec<u8>,
}

impl FrameImage {
    /// Wrap raw bytes. Returns `None` when `data` does not match the dimensions.
    pub fn new(width: u32, height: u32, channels: u8, data: Vec<u8>) -> Option<Self> {
        let expected = width as usize * height as usize * channels as usize;
        if channels == 0 || data.len() != expected {
            return None;
        }
        Some(Self {
            width,
            height,
            channels,
            data,
        })
    }

    /// Create an image with every byte set to `value`.
    pub fn filled(width: u32, height: u32, channels: u8, value: u8) -> Self {
        let len = width as usize * height as usize * channels.max(1) as usize;
        Self {
            width,
            height,
            channels: channels.max(1),
            data: vec![value; len],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Size of the pixel data in bytes.
    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Pixel at `(x, y)`, or `None` outside the image.
    pub fn pixel(&self, x: u32, y: u32) -> Option<&[u8]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let c = self.channels as usize;
        let start = (y as usize * self.width as usize + x as usize) * c;
        Some(&self.data[start..start + c])
    }

    /// Sample the image through an inverse affine map with nearest-neighbour
    /// lookup. Pixels that land outside the source are black.
    pub fn warp_nearest(&self, inverse: &AffineMat, width: u32, height: u32) -> FrameImage {
        let c = self.channels as usize;
        let mut out = FrameImage::filled(width, height, self.channels, 0);
        for y in 0..height {
            for x in 0..width {
                let (sx, sy) = inverse.apply(x as f32 + 0.5, y as f32 + 0.5);
                if sx < 0.0 || sy < 0.0 {
                    continue;
                }
                if let Some(px) = self.pixel(sx as u32, sy as u32) {
                    let dst = (y as usize * width as usize + x as usize) * c;
                    out.data[dst..dst + c].copy_from_slice(px);
                }
            }
        }
        out
    }
}

/// Face bounding box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceRect {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl FaceRect {
    pub fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn width(&self) -> f32 {
        (self.right - self.left).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.bottom - self.top).max(0.0)
    }

    pub fn center(&self) -> (f32, f32) {
        (
            (self.left + self.right) * 0.5,
            (self.top + self.bottom) * 0.5,
        )
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Grow or shrink around the center by `factor`.
    pub fn scaled(&self, factor: f32) -> FaceRect {
        let (cx, cy) = self.center();
        let hw = self.width() * factor * 0.5;
        let hh = self.height() * factor * 0.5;
        FaceRect::new(cx - hw, cy - hh, cx + hw, cy + hh)
    }
}

/// Head rotation estimate in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FacePose {
    pub pitch: f32,
    pub yaw: f32,
    pub roll: f32,
}

impl FacePose {
    /// `(pitch, yaw, roll)` in radians.
    pub fn as_radians(&self) -> (f32, f32, f32) {
        (
            self.pitch.to_radians(),
            self.yaw.to_radians(),
            self.roll.to_radians(),
        )
    }
}

/// Ordered set of landmark points in some coordinate space.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FaceLandmarks {
    pub points: Vec<[f32; 2]>,
}

impl FaceLandmarks {
    pub fn new(points: Vec<[f32; 2]>) -> Self {
        Self { points }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Tight bounding box of all points.
    pub fn bounding_rect(&self) -> Option<FaceRect> {
        let first = self.points.first()?;
        let mut rect = FaceRect::new(first[0], first[1], first[0], first[1]);
        for p in &self.points[1..] {
            rect.left = rect.left.min(p[0]);
            rect.top = rect.top.min(p[1]);
            rect.right = rect.right.max(p[0]);
            rect.bottom = rect.bottom.max(p[1]);
        }
        Some(rect)
    }

    /// Map every point through `mat`.
    pub fn transform(&self, mat: &AffineMat) -> FaceLandmarks {
        FaceLandmarks {
            points: self
                .points
                .iter()
                .map(|p| {
                    let (x, y) = mat.apply(p[0], p[1]);
                    [x, y]
                })
                .collect(),
        }
    }
}

/// 2x3 affine transform: `x' = a*x + b*y + c`, `y' = d*x + e*y + f`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AffineMat(pub [f32; 6]);

impl AffineMat {
    pub const IDENTITY: AffineMat = AffineMat([1.0, 0.0, 0.0, 0.0, 1.0, 0.0]);

    /// Uniform scale followed by translation.
    pub fn scale_translate(scale: f32, tx: f32, ty: f32) -> Self {
        AffineMat([scale, 0.0, tx, 0.0, scale, ty])
    }

    pub fn apply(&self, x: f32, y: f32) -> (f32, f32) {
        let m = &self.0;
        (m[0] * x + m[1] * y + m[2], m[3] * x + m[4] * y + m[5])
    }

    /// Inverse transform, or `None` when the matrix is singular.
    pub fn invert(&self) -> Option<AffineMat> {
        let [a, b, c, d, e, f] = self.0;
        let det = a * e - b * d;
        if det.abs() < f32::EPSILON {
            return None;
        }
        let inv = 1.0 / det;
        let ia = e * inv;
        let ib = -b * inv;
        let id = -d * inv;
        let ie = a * inv;
        Some(AffineMat([
            ia,
            ib,
            -(ia * c + ib * f),
            id,
            ie,
            -(id * c + ie * f),
        ]))
    }
}
