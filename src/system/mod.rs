//! Fusion engines and their threading.
//!
//! Every engine owns a bounded drop-oldest frame queue and one consumer thread.
//! Producers call `feed` and return immediately; the consumer projects each
//! frame, grows the tile grid when needed and merges. `prepare`, `draw` and
//! `save` run on the caller's thread against a snapshot of the session.

pub mod batch;
pub mod engine;
pub mod frame_queue;
pub mod incremental;
pub mod messages;
pub mod prepare;
pub mod shared_state;
pub mod worker;

pub use batch::SeamBatchFusion;
pub use engine::{FusionEngine, MapFusion};
pub use incremental::IncrementalFusion;
pub use messages::{FeedOutcome, Frame, FrameRejection};
pub use prepare::PrepareError;
pub use shared_state::{FusionStats, Session, SharedState};
