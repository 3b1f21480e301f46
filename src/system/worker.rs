//! The fusion consumer thread.
//!
//! One loop serves every strategy: it honours shutdown and pause requests,
//! waits for a frame with a timeout so the flags are checked at least once per
//! poll interval, and hands each frame to a [`FrameSink`].

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use tracing::info;

use crate::fusion::warp::footprint_range;
use crate::geometry::{GroundProjection, project_frame};
use crate::mosaic::MapLayout;

use super::frame_queue::FrameReceiver;
use super::messages::{Frame, FrameRejection};
use super::shared_state::SharedState;

const PAUSE_POLL: Duration = Duration::from_millis(2);

/// Receives the frames taken off the queue, in FIFO order.
pub trait FrameSink: Send + 'static {
    fn consume(&mut self, frame: Frame);

    /// Called once per loop iteration before waiting for the next frame.
    fn tick(&mut self, _queue: &FrameReceiver<Frame>) {}
}

pub fn spawn_consumer<D, S>(
    shared: Arc<SharedState<D>>,
    queue: FrameReceiver<Frame>,
    poll_interval: Duration,
    sink: S,
) -> JoinHandle<()>
where
    D: Send + 'static,
    S: FrameSink,
{
    thread::spawn(move || {
        info!("Fusion consumer started");
        run(&shared, &queue, poll_interval, sink);
        info!("Fusion consumer stopped");
    })
}

fn run<D, S: FrameSink>(
    shared: &SharedState<D>,
    queue: &FrameReceiver<Frame>,
    poll_interval: Duration,
    mut sink: S,
) {
    loop {
        if shared.is_shutdown_requested() {
            break;
        }

        if shared.should_pause() {
            shared.set_consumer_paused(true);
            while shared.should_pause() && !shared.is_shutdown_requested() {
                thread::sleep(PAUSE_POLL);
            }
            shared.set_consumer_paused(false);
            continue;
        }

        sink.tick(queue);

        match queue.recv_timeout(poll_interval) {
            Ok(frame) => {
                sink.consume(frame);
                queue.done();
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// Check a frame against the session camera and project it onto the plane.
pub fn project_onto(layout: &MapLayout, frame: &Frame) -> Result<GroundProjection, FrameRejection> {
    let expected = (layout.camera.width, layout.camera.height);
    let actual = frame.image.dimensions();
    if actual != expected {
        return Err(FrameRejection::ImageSize { expected, actual });
    }
    let t_plane_cam = layout.to_plane(&frame.pose);
    let projection = project_frame(&layout.camera, &t_plane_cam)?;
    if let Some(limit) = layout.max_frame_span {
        let range = footprint_range(&projection, layout);
        let span = range.cols().max(range.rows());
        if span > limit {
            return Err(FrameRejection::FootprintTooLarge { span, limit });
        }
    }
    Ok(projection)
}
