//! Backend pipeline mechanism
//!
//! Everything a stage needs to run in isolation and exchange frames with
//! its neighbours:
//!
//! - [`WeakHeap`] - fixed-capacity arena holding frame pixels, addressed by
//!   [`HeapHandle`] with reference counting
//! - [`ConnectionPacket`] - frame id, named images and per-face metadata
//! - [`Connection`] - packet queue with visible backpressure (`is_full`)
//! - [`ReemitSignal`] - request to re-publish the last frame
//! - [`BackendDb`] - asynchronously flushed per-stage [`WorkerState`] store
//! - [`StageWorker`] / [`StageHost`] - worker thread runtime and its
//!   supervisor
//!
//! # Example
//!
//! ```ignore
//! use facefilter_live::backend::{Connection, StageHost};
//!
//! let mut host = StageHost::new("FaceDetector", schema, db.clone(), factory, 3);
//! host.start()?;
//! while host.is_starting() {
//!     host.process_messages();
//!     std::thread::sleep(std::time::Duration::from_millis(5));
//! }
//! ```

pub mod connection;
pub mod db;
pub mod host;
pub mod id;
pub mod packet;
pub mod signal;
pub mod state;
pub mod weak_heap;
pub mod worker;

pub use connection::Connection;
pub use db::BackendDb;
pub use host::{StageHost, StageStatus, WorkerFactory};
pub use id::{FrameId, HeapHandle, ProducerId};
pub use packet::{ConnectionPacket, FaceInfo, ImageRef};
pub use signal::{ReemitSignal, SignalListener};
pub use state::{StateValue, WorkerState};
pub use weak_heap::{HeapError, WeakHeap};
pub use worker::{
    spawn_worker, HostMessage, PacketPump, ProfileTimer, StageContext, StageWorker, WorkerHandle,
    WorkerMessage,
};
