//! Incremental fusion: every frame is merged into the tile grid as soon as the
//! consumer takes it off the queue.

use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use image::RgbImage;
use tracing::{debug, info, warn};

use crate::config::FusionConfig;
use crate::fusion::warp::footprint_range;
use crate::fusion::{Compositor, FrameInput, TileTarget};
use crate::geometry::{CameraParameters, SE3};
use crate::render::{DrawStats, SaveSummary, TexturePolicy, TileRenderer, draw_session, save_session};

use super::engine::FusionEngine;
use super::frame_queue::{FrameSender, PushOutcome, frame_queue};
use super::messages::{FeedOutcome, Frame, FrameRejection};
use super::prepare::{PrepareError, plan_session};
use super::shared_state::{FusionStats, Session, SharedState};
use super::worker::{FrameSink, project_onto, spawn_consumer};

const FLUSH_POLL: Duration = Duration::from_millis(1);

/// Consumer-side half: projects, grows the grid and merges.
struct FrameMerger<C: Compositor> {
    compositor: Arc<C>,
    shared: Arc<SharedState<C::TileData>>,
}

impl<C: Compositor> FrameMerger<C> {
    /// Merge one frame. Returns the number of tiles it changed.
    fn fuse(&self, frame: &Frame) -> Result<usize, FrameRejection> {
        let session = self.shared.session().ok_or(FrameRejection::NotPrepared)?;
        let layout = &session.layout;
        let projection = project_onto(layout, frame)?;

        let footprint = footprint_range(&projection, layout);
        let grid = if session.grid.covers(&footprint) {
            Arc::clone(&session.grid)
        } else {
            self.shared
                .grow(&session, &footprint)
                .ok_or(FrameRejection::StaleGrid)?
        };

        let prepared = self
            .compositor
            .prepare_frame(&FrameInput {
                image: &frame.image,
                projection: &projection,
                layout,
            })
            .map_err(|e| FrameRejection::Compositor(format!("{:#}", e)))?;

        let targets: Vec<TileTarget<C::TileData>> = footprint
            .iter()
            .filter(|index| self.compositor.touches(&prepared, *index))
            .filter_map(|index| {
                grid.tile_at(&session.arena, index, || self.compositor.new_tile(index))
                    .map(|(_, tile)| (index, tile))
            })
            .collect();

        // A re-prepare may have replaced the grid since the snapshot.
        if !self.shared.is_current(&grid) {
            return Err(FrameRejection::StaleGrid);
        }
        let changed = self.compositor.merge(&prepared, &targets);

        // Neighbour-aware textures borrow border coefficients from adjacent
        // tiles, so those textures are stale too.
        if changed > 0 && self.compositor.wants_neighbors() {
            for (index, tile) in &targets {
                if !tile.is_covered() {
                    continue;
                }
                for neighbor in grid.neighbors(&session.arena, *index).into_iter().flatten() {
                    if neighbor.is_covered() {
                        neighbor.invalidate();
                    }
                }
            }
        }
        Ok(changed)
    }
}

impl<C: Compositor> FrameSink for FrameMerger<C> {
    fn consume(&mut self, frame: Frame) {
        let start = Instant::now();
        match self.fuse(&frame) {
            Ok(changed) => {
                self.shared.record_merged();
                debug!(
                    "Merged frame into {} tiles ({}) in {:?}",
                    changed,
                    self.compositor.name(),
                    start.elapsed()
                );
            }
            Err(FrameRejection::StaleGrid) => {
                self.shared.record_stale_drop();
                warn!("Frame dropped: grid replaced during merge");
            }
            Err(e) => {
                self.shared.record_rejected();
                warn!("Frame rejected: {}", e);
            }
        }
    }
}

/// Flat, multi-band and device strategies, monomorphised per compositor.
pub struct IncrementalFusion<C: Compositor> {
    config: FusionConfig,
    compositor: Arc<C>,
    shared: Arc<SharedState<C::TileData>>,
    queue: FrameSender<Frame>,
    consumer: Option<JoinHandle<()>>,
}

impl<C: Compositor> IncrementalFusion<C> {
    pub fn new(compositor: C, config: FusionConfig) -> Self {
        let config = config.validated();
        let compositor = Arc::new(compositor);
        let shared = SharedState::new();
        let (queue, receiver) = frame_queue(config.queue_size);
        let merger = FrameMerger {
            compositor: Arc::clone(&compositor),
            shared: Arc::clone(&shared),
        };
        let consumer = spawn_consumer(
            Arc::clone(&shared),
            receiver,
            Duration::from_millis(config.poll_interval_ms),
            merger,
        );
        info!("{} fusion engine started", compositor.name());
        Self {
            config,
            compositor,
            shared,
            queue,
            consumer: Some(consumer),
        }
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// Snapshot of the current session.
    pub fn session(&self) -> Option<Session<C::TileData>> {
        self.shared.session()
    }

    fn texture_policy(&self) -> TexturePolicy {
        TexturePolicy {
            alpha_test: self.config.alpha_test,
            background: self.config.background,
        }
    }

    fn consumer_alive(&self) -> bool {
        self.consumer.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the consumer thread and wait for it.
    pub fn shutdown(&mut self) {
        self.shared.request_shutdown();
        if let Some(handle) = self.consumer.take() {
            let _ = handle.join();
        }
    }
}

impl<C: Compositor> FusionEngine for IncrementalFusion<C> {
    fn prepare(&self, plane: &SE3, camera: &CameraParameters, frames: &[Frame]) -> Result<(), PrepareError> {
        let plan = plan_session(plane, camera, frames, &self.config)?;
        self.shared.install(Session::new(plan.layout, plan.range));
        Ok(())
    }

    fn feed(&self, image: RgbImage, pose: SE3) -> FeedOutcome {
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
        let budget = Duration::from_millis(self.config.upload_budget_ms);
        draw_session(&*self.compositor, &session, self.texture_policy(), budget, renderer)
    }

    fn save(&self, path: &Path) -> Result<SaveSummary> {
        let Some(session) = self.shared.session() else {
            bail!("session not prepared");
        };
        save_session(&*self.compositor, &session, self.config.background, path)
    }

    fn queue_size(&self) -> usize {
        self.queue.len()
    }

    fn flush(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.queue.outstanding() == 0 {
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

impl<C: Compositor> Drop for IncrementalFusion<C> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
