use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rust_mapfusion::config::FusionConfig;
use rust_mapfusion::io::AerialDataset;
use rust_mapfusion::system::{FeedOutcome, FusionEngine, MapFusion};
#[cfg(feature = "viz")]
use rust_mapfusion::viz::RerunTileViewer;

const FLUSH_TIMEOUT: Duration = Duration::from_secs(600);

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let Some(dataset_path) = args.next() else {
        bail!("usage: rust-mapfusion <dataset_dir> [config.yaml] [output.png]");
    };
    let config = match args.next() {
        Some(path) => FusionConfig::from_yaml_file(&path)?,
        None => FusionConfig::default(),
    }
    .validated();
    let output = PathBuf::from(args.next().unwrap_or_else(|| "mosaic.png".to_string()));

    let dataset = AerialDataset::new(&dataset_path)?;
    let engine = MapFusion::new(config.clone());
    info!("Fusing {} frames with {:?}", dataset.len(), engine.mode());

    let initial = (0..dataset.len().min(config.batch_size))
        .map(|i| dataset.frame(i))
        .collect::<Result<Vec<_>>>()?;
    engine
        .prepare(&dataset.plane, &dataset.camera, &initial)
        .context("Failed to prepare session")?;
    drop(initial);

    #[cfg(feature = "viz")]
    let mut viewer = RerunTileViewer::new("rust-mapfusion")?;

    let start = Instant::now();
    for i in 0..dataset.len() {
        let image = match dataset.image(i) {
            Ok(image) => image,
            Err(e) => {
                warn!("Skipping frame {}: {:#}", i, e);
                continue;
            }
        };
        // Hold the producer instead of letting the queue evict.
        while engine.queue_size() >= config.queue_size {
            thread::sleep(Duration::from_millis(1));
        }

        let entry = &dataset.entries[i];
        match engine.feed(image, entry.pose) {
            FeedOutcome::Finished => {
                info!("Batch blend complete after {} frames", i);
                break;
            }
            FeedOutcome::Disconnected => bail!("Fusion consumer stopped unexpectedly"),
            _ => {}
        }

        #[cfg(feature = "viz")]
        {
            viewer.set_time(entry.timestamp_ns);
            viewer.log_camera_position(&entry.pose.translation);
            engine.draw(&mut viewer);
            viewer.finish_frame();
            viewer.log_stats(&engine.stats(), engine.queue_size());
        }

        if i % 100 == 0 {
            let stats = engine.stats();
            info!(
                "Frame {}: {} merged, {} rejected, {} tiles, queue {}",
                i,
                stats.merged,
                stats.rejected,
                stats.tiles,
                engine.queue_size()
            );
        }
    }

    if !engine.flush(FLUSH_TIMEOUT) {
        warn!("Flush timed out; saving what has been fused");
    }
    let stats = engine.stats();
    info!(
        "Fused {} of {} fed frames ({} evicted, {} rejected, {} stale) in {:?}",
        stats.merged,
        stats.fed,
        stats.evicted,
        stats.rejected,
        stats.stale_drops,
        start.elapsed()
    );

    let summary = engine.save(&output)?;
    println!(
        "Wrote {}x{} mosaic to {} covering x [{:.2}, {:.2}], y [{:.2}, {:.2}]",
        summary.width,
        summary.height,
        output.display(),
        summary.covered.min.x,
        summary.covered.max.x,
        summary.covered.min.y,
        summary.covered.max.y
    );
    Ok(())
}
