//! Concrete pipeline stages
//!
//! `CameraSource -> FaceDetector -> FaceMarker -> FaceAligner -> FaceModifier -> StreamOutput`
//!
//! Each module provides the stage's control sheet schema and its
//! [`StageWorker`](crate::backend::StageWorker). The algorithms themselves
//! sit behind the traits in [`models`].

pub mod camera_source;
pub mod face_aligner;
pub mod face_detector;
pub mod face_marker;
pub mod face_modifier;
pub mod models;
pub mod stream_output;

pub use camera_source::CameraSourceWorker;
pub use face_aligner::FaceAlignerWorker;
pub use face_detector::FaceDetectorWorker;
pub use face_marker::FaceMarkerWorker;
pub use face_modifier::FaceModifierWorker;
pub use stream_output::StreamOutputWorker;

use crate::backend::{ReemitSignal, WeakHeap};
use crate::config::WorkerTiming;
use crate::control::{SheetError, WorkerSheet};
use std::sync::Arc;

/// Name under which the frame image travels in a packet.
pub const FRAME_IMAGE_NAME: &str = "source_frame";

/// Name of the merged output image written by the modifier.
pub const MODIFIED_IMAGE_NAME: &str = "modified_image";

/// Shared resources every stage worker is built with.
#[derive(Debug, Clone)]
pub struct StageDeps {
    pub heap: Arc<WeakHeap>,
    pub reemit: ReemitSignal,
    pub timing: WorkerTiming,
}

/// Send the re-emit signal whenever one of `fields` changes.
pub(crate) fn reemit_on_change(
    sheet: &mut WorkerSheet,
    reemit: &ReemitSignal,
    fields: &[&str],
) -> Result<(), SheetError> {
    for field in fields {
        let signal = reemit.clone();
        sheet.call_on_change(field, move |_| signal.send())?;
    }
    Ok(())
}
