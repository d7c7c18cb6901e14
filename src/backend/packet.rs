//! The unit of transport between stages.
//!
//! A [`ConnectionPacket`] carries a frame id, a map of named image variants
//! whose pixels live in the shared [`WeakHeap`], and the ordered list of
//! [`FaceInfo`] records built up by the detector, marker and aligner.
//!
//! A packet owns one heap reference per image it names. Replacing an image
//! or dropping the packet releases those references, so buffers stay valid
//! until the last reader is done with them.

use crate::backend::id::{FrameId, HeapHandle, ProducerId};
use crate::backend::weak_heap::{HeapError, WeakHeap};
use crate::types::{AffineMat, FaceLandmarks, FacePose, FaceRect, FrameImage};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Location and shape of an image stored in the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    /// [`WeakHeap::id`] of the heap holding the pixels.
    pub heap_id: u64,
    pub handle: HeapHandle,
    pub width: u32,
    pub height: u32,
    pub channels: u8,
}

/// Per-face metadata accumulated along the pipeline.
///
/// Each stage fills the fields it computes and leaves the rest alone. A
/// stage that needs a field which is still `None` skips that face.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FaceInfo {
    pub face_rect: Option<FaceRect>,
    pub face_pose: Option<FacePose>,
    pub face_landmarks: Option<FaceLandmarks>,
    pub face_align_image_name: Option<String>,
    pub face_align_landmarks: Option<FaceLandmarks>,
    pub face_align_mask_name: Option<String>,
    pub image_to_align_mat: Option<AffineMat>,
    pub face_resolution: Option<u32>,
}

impl FaceInfo {
    pub fn from_rect(rect: FaceRect) -> Self {
        Self {
            face_rect: Some(rect),
            ..Default::default()
        }
    }
}

/// Frame handle, named images and face list travelling between stages.
#[derive(Debug)]
pub struct ConnectionPacket {
    frame_id: FrameId,
    producer: ProducerId,
    seq: u64,
    frame_image_name: Option<String>,
    merged_image_name: Option<String>,
    images: BTreeMap<String, ImageRef>,
    faces: Vec<FaceInfo>,
    heap: Option<Arc<WeakHeap>>,
}

impl ConnectionPacket {
    /// Create an empty packet bound to `heap`.
    pub fn new(heap: &Arc<WeakHeap>, frame_id: FrameId) -> Self {
        Self {
            frame_id,
            producer: ProducerId::default(),
            seq: 0,
            frame_image_name: None,
            merged_image_name: None,
            images: BTreeMap::new(),
            faces: Vec::new(),
            heap: Some(heap.clone()),
        }
    }

    /// Bind the packet to the shared heap. Idempotent.
    pub fn assign_weak_heap(&mut self, heap: &Arc<WeakHeap>) {
        if self.heap.is_none() {
            self.heap = Some(heap.clone());
        }
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    pub fn producer(&self) -> ProducerId {
        self.producer
    }

    /// Per-producer sequence number.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn set_origin(&mut self, producer: ProducerId, seq: u64) {
        self.producer = producer;
        self.seq = seq;
    }

    pub fn frame_image_name(&self) -> Option<&str> {
        self.frame_image_name.as_deref()
    }

    pub fn set_frame_image_name(&mut self, name: impl Into<String>) {
        self.frame_image_name = Some(name.into());
    }

    pub fn merged_image_name(&self) -> Option<&str> {
        self.merged_image_name.as_deref()
    }

    pub fn set_merged_image_name(&mut self, name: impl Into<String>) {
        self.merged_image_name = Some(name.into());
    }

    pub fn image_names(&self) -> impl Iterator<Item = &str> {
        self.images.keys().map(String::as_str)
    }

    pub fn image_ref(&self, name: &str) -> Option<ImageRef> {
        self.images.get(name).copied()
    }

    /// Decode the named image from the heap.
    ///
    /// Returns `None` when the name is unknown, the packet has no heap, or
    /// the handle is no longer valid.
    pub fn get_image(&self, name: &str) -> Option<FrameImage> {
        let heap = self.heap.as_ref()?;
        let r = self.images.get(name)?;
        match heap.read(r.handle) {
            Ok(bytes) => FrameImage::new(r.width, r.height, r.channels, bytes),
            Err(e) => {
                tracing::warn!("Image '{}' unreadable: {}", name, e);
                None
            }
        }
    }

    /// The frame image, if the packet names one.
    pub fn frame_image(&self) -> Option<FrameImage> {
        self.frame_image_name().and_then(|n| self.get_image(n))
    }

    /// Store `image` in the heap under `name`, replacing any previous image.
    ///
    /// Fails with [`HeapError::OutOfArena`] when the heap is full; the packet
    /// is left unchanged in that case.
    pub fn set_image(&mut self, name: impl Into<String>, image: &FrameImage) -> Result<(), HeapError> {
        let heap = match &self.heap {
            Some(h) => h.clone(),
            None => return Err(HeapError::Unbound),
        };
        let handle = heap.store(image.data())?;
        let r = ImageRef {
            heap_id: heap.id(),
            handle,
            width: image.width(),
            height: image.height(),
            channels: image.channels(),
        };
        if let Some(old) = self.images.insert(name.into(), r) {
            release_logged(&heap, old.handle);
        }
        Ok(())
    }

    /// Reference an image that already lives in this packet's heap. Takes a
    /// new reference on the handle.
    pub fn share_image(&mut self, name: impl Into<String>, image: ImageRef) -> Result<(), HeapError> {
        let heap = match &self.heap {
            Some(h) => h.clone(),
            None => return Err(HeapError::Unbound),
        };
        if image.heap_id != heap.id() {
            return Err(HeapError::ForeignHandle(image.handle));
        }
        heap.retain(image.handle)?;
        if let Some(old) = self.images.insert(name.into(), image) {
            release_logged(&heap, old.handle);
        }
        Ok(())
    }

    /// Forget the named image and release its heap reference.
    pub fn remove_image(&mut self, name: &str) -> bool {
        let Some(r) = self.images.remove(name) else {
            return false;
        };
        if let Some(heap) = &self.heap {
            release_logged(heap, r.handle);
        }
        true
    }

    pub fn get_face_list(&self) -> &[FaceInfo] {
        &self.faces
    }

    pub fn face_list_mut(&mut self) -> &mut Vec<FaceInfo> {
        &mut self.faces
    }

    pub fn set_face_list(&mut self, faces: Vec<FaceInfo>) {
        self.faces = faces;
    }

    pub fn add_face(&mut self, face: FaceInfo) {
        self.faces.push(face);
    }
}

impl Drop for ConnectionPacket {
    fn drop(&mut self) {
        if let Some(heap) = &self.heap {
            for r in self.images.values() {
                release_logged(heap, r.handle);
            }
        }
    }
}

fn release_logged(heap: &WeakHeap, handle: HeapHandle) {
    if let Err(e) = heap.release(handle) {
        tracing::warn!("Failed to release image {:?}: {}", handle, e);
    }
}
