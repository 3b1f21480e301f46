//! State shared between the feeding thread, the fusion consumer and readers.
//!
//! The session (layout, grid, arena) sits behind one `RwLock`. Readers copy
//! the three pointers out under a shared lock; `prepare` and grid growth take
//! the exclusive lock only for the pointer swap. Tile contents are guarded by
//! each tile's own lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::info;

use crate::mosaic::{MapLayout, TileArena, TileGrid, TileRange};

/// One prepared fusion session.
pub struct Session<D> {
    pub layout: Arc<MapLayout>,
    pub grid: Arc<TileGrid>,
    pub arena: Arc<TileArena<D>>,
}

impl<D> Session<D> {
    pub fn new(layout: MapLayout, range: TileRange) -> Self {
        Self {
            layout: Arc::new(layout),
            grid: Arc::new(TileGrid::new(range)),
            arena: Arc::new(TileArena::new()),
        }
    }
}

impl<D> Clone for Session<D> {
    fn clone(&self) -> Self {
        Self {
            layout: Arc::clone(&self.layout),
            grid: Arc::clone(&self.grid),
            arena: Arc::clone(&self.arena),
        }
    }
}

/// Counters reported by `FusionEngine::stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FusionStats {
    pub fed: u64,
    pub merged: u64,
    pub evicted: u64,
    pub rejected: u64,
    pub stale_drops: u64,
    pub tiles: usize,
}

#[derive(Debug, Default)]
struct StatsInner {
    fed: AtomicU64,
    merged: AtomicU64,
    evicted: AtomicU64,
    rejected: AtomicU64,
    stale_drops: AtomicU64,
}

pub struct SharedState<D> {
    session: RwLock<Option<Session<D>>>,

    /// Request the consumer thread to exit.
    shutdown_requested: AtomicBool,

    /// Request the consumer to stop taking frames; frames keep queueing.
    pause_requested: AtomicBool,

    /// Set by the consumer while it honours a pause request.
    consumer_paused: AtomicBool,

    stats: StatsInner,
}

impl<D> SharedState<D> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of the current session.
    pub fn session(&self) -> Option<Session<D>> {
        self.session.read().clone()
    }

    pub fn is_prepared(&self) -> bool {
        self.session.read().is_some()
    }

    /// Replace the whole session.
    pub fn install(&self, session: Session<D>) {
        *self.session.write() = Some(session);
    }

    /// True if `grid` is still the published grid.
    pub fn is_current(&self, grid: &Arc<TileGrid>) -> bool {
        self.session
            .read()
            .as_ref()
            .is_some_and(|s| Arc::ptr_eq(&s.grid, grid))
    }

    /// Grow the grid of `seen` to cover `target` and publish it.
    ///
    /// Returns the grid covering `target`, or `None` if the session was
    /// replaced since `seen` was taken.
    pub fn grow(&self, seen: &Session<D>, target: &TileRange) -> Option<Arc<TileGrid>> {
        let mut guard = self.session.write();
        let current = guard.as_mut()?;
        if !Arc::ptr_eq(&current.arena, &seen.arena) {
            return None;
        }
        let Some(grown) = current.grid.spread(target) else {
            return Some(Arc::clone(&current.grid));
        };
        info!(
            "Grid grown from {} to {} tiles ({:?})",
            current.grid.range().len(),
            grown.range().len(),
            grown.range()
        );
        current.grid = Arc::new(grown);
        Some(Arc::clone(&current.grid))
    }

    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    pub fn set_pause_requested(&self, value: bool) {
        self.pause_requested.store(value, Ordering::SeqCst);
    }

    pub fn should_pause(&self) -> bool {
        self.pause_requested.load(Ordering::SeqCst)
    }

    pub fn set_consumer_paused(&self, value: bool) {
        self.consumer_paused.store(value, Ordering::SeqCst);
    }

    pub fn is_consumer_paused(&self) -> bool {
        self.consumer_paused.load(Ordering::SeqCst)
    }

    pub fn record_fed(&self) {
        self.stats.fed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evicted(&self) {
        self.stats.evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_merged(&self) {
        self.stats.merged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.stats.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_drop(&self) {
        self.stats.stale_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> FusionStats {
        FusionStats {
            fed: self.stats.fed.load(Ordering::Relaxed),
            merged: self.stats.merged.load(Ordering::Relaxed),
            evicted: self.stats.evicted.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
            stale_drops: self.stats.stale_drops.load(Ordering::Relaxed),
            tiles: self.session.read().as_ref().map_or(0, |s| s.arena.len()),
        }
    }
}

impl<D> Default for SharedState<D> {
    fn default() -> Self {
        Self {
            session: RwLock::new(None),
            shutdown_requested: AtomicBool::new(false),
            pause_requested: AtomicBool::new(false),
            consumer_paused: AtomicBool::new(false),
            stats: StatsInner::default(),
        }
    }
}
