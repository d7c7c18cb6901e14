//! Test data builders for creating test objects

use facefilter_live::backend::{ConnectionPacket, FaceInfo, FrameId, WeakHeap};
use facefilter_live::stages::FRAME_IMAGE_NAME;
use facefilter_live::types::{FaceRect, FrameImage};
use std::sync::Arc;

/// Builder for packets carrying a frame image and faces
pub struct PacketBuilder {
    heap: Arc<WeakHeap>,
    frame: FrameImage,
    faces: Vec<FaceInfo>,
}

impl PacketBuilder {
    pub fn new(heap: &Arc<WeakHeap>) -> Self {
        Self {
            heap: heap.clone(),
            frame: FrameImage::filled(64, 48, 3, 40),
            faces: Vec::new(),
        }
    }

    pub fn frame(mut self, frame: FrameImage) -> Self {
        self.frame = frame;
        self
    }

    pub fn face(mut self, rect: FaceRect) -> Self {
        self.faces.push(FaceInfo::from_rect(rect));
        self
    }

    pub fn build(self) -> ConnectionPacket {
        let mut packet = ConnectionPacket::new(&self.heap, FrameId::next());
        packet
            .set_image(FRAME_IMAGE_NAME, &self.frame)
            .expect("test heap too small");
        packet.set_frame_image_name(FRAME_IMAGE_NAME);
        packet.set_face_list(self.faces);
        packet
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_builder() {
        let heap = Arc::new(WeakHeap::new(1024 * 1024));
        let packet = PacketBuilder::new(&heap)
            .face(FaceRect::new(0.0, 0.0, 10.0, 10.0))
            .build();

        assert_eq!(packet.get_face_list().len(), 1);
        assert_eq!(packet.frame_image().unwrap().width(), 64);
        assert_eq!(heap.live_allocations(), 1);
    }
}
