//! Seam-aware batch fusion.
//!
//! Frames are projected as they arrive and collected; one seam-cut multi-band
//! blend runs when the batch is full or a flush asks for it. The result is
//! written into the tile grid as flat tiles, after which the engine is
//! finished and refuses further frames.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use image::RgbImage;
use tracing::{debug, info, warn};

use crate::config::FusionConfig;
use crate::fusion::flat::{FlatCompositor, FlatTile};
use crate::fusion::seam::{BatchFrame, SeamBlender};
use crate::fusion::warp::{has_weight_in, tile_offset_in};
use crate::geometry::{CameraParameters, SE3};
use crate::mosaic::{MapLayout, TILE_SIZE};
use crate::render::{DrawStats, SaveSummary, TexturePolicy, TileRenderer, draw_session, save_session};

use super::engine::FusionEngine;
use super::frame_queue::{FrameReceiver, FrameSender, PushOutcome, frame_queue};
use super::messages::{FeedOutcome, Frame};
use super::prepare::{PrepareError, plan_session};
use super::shared_state::{FusionStats, Session, SharedState};
use super::worker::{FrameSink, project_onto, spawn_consumer};

/// How long `save` waits for a pending blend.
const BLEND_WAIT: Duration = Duration::from_secs(300);

const FLUSH_POLL: Duration = Duration::from_millis(1);

#[derive(Debug, Default)]
struct BatchControl {
    blend_requested: AtomicBool,
    finished: AtomicBool,
}

impl BatchControl {
    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

/// A projected frame and the layout it was projected against.
struct Collected {
    layout: Arc<MapLayout>,
    frame: BatchFrame,
}

/// Consumer-side half: collects projected frames and runs the blend.
struct BatchCollector {
    blender: SeamBlender,
    batch_size: usize,
    shared: Arc<SharedState<FlatTile>>,
    control: Arc<BatchControl>,
    pending: Vec<Collected>,
}

impl BatchCollector {
    fn blend(&mut self) {
        let Some(session) = self.shared.session() else {
            return;
        };
        let (current, stale): (Vec<Collected>, Vec<Collected>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|c| Arc::ptr_eq(&c.layout, &session.layout));
        if !stale.is_empty() {
            for _ in &stale {
                self.shared.record_stale_drop();
            }
            warn!("{} collected frames dropped: session replaced before the blend", stale.len());
        }
        let frames: Vec<BatchFrame> = current.into_iter().map(|c| c.frame).collect();
        let start = Instant::now();

        if let Some(mosaic) = self.blender.blend(&frames, &session.layout) {
            match self.shared.grow(&session, &mosaic.range) {
                Some(grid) => {
                    let mut written = 0;
                    for index in mosaic.range.iter() {
                        let Some((ox, oy)) = tile_offset_in(&mosaic.range, index) else {
                            continue;
                        };
                        if !has_weight_in(&mosaic.coverage, ox, oy, TILE_SIZE) {
                            continue;
                        }
                        let Some((_, tile)) = grid.tile_at(&session.arena, index, FlatTile::new) else {
                            continue;
                        };
                        let adopted = tile.lock().merge_from(&mosaic.image, &mosaic.coverage, ox, oy);
                        if adopted > 0 {
                            tile.mark_changed();
                            written += 1;
                        }
                    }
                    for _ in &frames {
                        self.shared.record_merged();
                    }
                    info!(
                        "Seam blend of {} frames wrote {} tiles in {:?}",
                        frames.len(),
                        written,
                        start.elapsed()
                    );
                }
                None => {
                    for _ in &frames {
                        self.shared.record_stale_drop();
                    }
                    warn!("Seam blend dropped: session replaced during blend");
                }
            }
        } else {
            info!("Seam blend finished with an empty batch");
        }
        self.control.finished.store(true, Ordering::SeqCst);
    }
}

impl FrameSink for BatchCollector {
    fn consume(&mut self, frame: Frame) {
        if self.control.is_finished() {
            self.shared.record_rejected();
            debug!("Frame arrived after the batch blend, dropped");
            return;
        }
        let Some(session) = self.shared.session() else {
            self.shared.record_rejected();
            return;
        };
        match project_onto(&session.layout, &frame) {
            Ok(projection) => self.pending.push(Collected {
                layout: Arc::clone(&session.layout),
                frame: BatchFrame {
                    image: frame.image,
                    projection,
                },
            }),
            Err(e) => {
                self.shared.record_rejected();
                warn!("Frame rejected: {}", e);
            }
        }
        if self.pending.len() >= self.batch_size {
            self.blend();
        }
    }

    fn tick(&mut self, queue: &FrameReceiver<Frame>) {
        if self.control.is_finished() || !self.control.blend_requested.load(Ordering::SeqCst) {
            return;
        }
        while let Ok(frame) = queue.try_recv() {
            self.consume(frame);
            queue.done();
        }
        if !self.control.is_finished() {
            self.blend();
        }
    }
}

pub struct SeamBatchFusion {
    config: FusionConfig,
    compositor: FlatCompositor,
    shared: Arc<SharedState<FlatTile>>,
    control: Arc<BatchControl>,
    queue: FrameSender<Frame>,
    consumer: Option<JoinHandle<()>>,
}

impl SeamBatchFusion {
    pub fn new(config: FusionConfig) -> Self {
        let config = config.validated();
        let shared = SharedState::new();
        let control = Arc::new(BatchControl::default());
        let (queue, receiver) = frame_queue(config.queue_size);
        let collector = BatchCollector {
            blender: SeamBlender::new(
                config.band_count,
                config.weight_exponent,
                config.seam_smoothing_radius,
            ),
            batch_size: config.batch_size,
            shared: Arc::clone(&shared),
            control: Arc::clone(&control),
            pending: Vec::new(),
        };
        let consumer = spawn_consumer(
            Arc::clone(&shared),
            receiver,
            Duration::from_millis(config.poll_interval_ms),
            collector,
        );
        info!("seam_batch fusion engine started (batch of {})", config.batch_size);
        Self {
            compositor: FlatCompositor::new(config.weight_exponent),
            config,
            shared,
            control,
            queue,
            consumer: Some(consumer),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.control.is_finished()
    }

    pub fn session(&self) -> Option<Session<FlatTile>> {
        self.shared.session()
    }

    fn consumer_alive(&self) -> bool {
        self.consumer.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn shutdown(&mut self) {
        self.shared.request_shutdown();
        if let Some(handle) = self.consumer.take() {
            let _ = handle.join();
        }
    }
}

impl FusionEngine for SeamBatchFusion {
    fn prepare(&self, plane: &SE3, camera: &CameraParameters, frames: &[Frame]) -> Result<(), PrepareError> {
        let plan = plan_session(plane, camera, frames, &self.config)?;
        self.shared.install(Session::new(plan.layout, plan.range));
        Ok(())
    }

    fn feed(&self, image: RgbImage, pose: SE3) -> FeedOutcome {
        if self.control.is_finished() {
            return FeedOutcome::Finished;
        }
        if !self.shared.is_prepared() {
            return FeedOutcome::NotPrepared;
        }
        if self.shared.is_shutdown_requested() {
            return FeedOutcome::Disconnected;
        }
        let outcome = match self.queue.push(Frame::new(image, pose)) {
            PushOutcome::Enqueued => FeedOutcome::Enqueued,
            PushOutcome::DroppedOldest => {
                self.shared.record_evicted();
                FeedOutcome::EnqueuedDroppedOldest
            }
            PushOutcome::Disconnected => FeedOutcome::Disconnected,
        };
        if outcome.is_accepted() {
            self.shared.record_fed();
        }
        outcome
    }

    fn draw(&self, renderer: &mut dyn TileRenderer) -> DrawStats {
        let Some(session) = self.shared.session() else {
            return DrawStats::default();
        };
        let policy = TexturePolicy {
            alpha_test: self.config.alpha_test,
            background: self.config.background,
        };
        let budget = Duration::from_millis(self.config.upload_budget_ms);
        draw_session(&self.compositor, &session, policy, budget, renderer)
    }

    fn save(&self, path: &Path) -> Result<SaveSummary> {
        if !self.shared.is_prepared() {
            bail!("session not prepared");
        }
        if !self.flush(BLEND_WAIT) {
            bail!("seam blend did not complete");
        }
        let Some(session) = self.shared.session() else {
            bail!("session not prepared");
        };
        save_session(&self.compositor, &session, self.config.background, path)
    }

    fn queue_size(&self) -> usize {
        self.queue.len()
    }

    /// Request the blend and wait for it to complete.
    fn flush(&self, timeout: Duration) -> bool {
        if !self.shared.is_prepared() {
            return false;
        }
        self.control.blend_requested.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + timeout;
        loop {
            if self.control.is_finished() {
                return true;
            }
            if Instant::now() >= deadline || !self.consumer_alive() {
                return false;
            }
            thread::sleep(FLUSH_POLL);
        }
    }

    fn stats(&self) -> FusionStats {
        self.shared.stats()
    }

    fn set_paused(&self, paused: bool) {
        self.shared.set_pause_requested(paused);
        if paused {
            while !self.shared.is_consumer_paused() && self.consumer_alive() {
                thread::sleep(FLUSH_POLL);
            }
        }
    }
}

impl Drop for SeamBatchFusion {
    fn drop(&mut self) {
        self.shutdown();
    }
}
