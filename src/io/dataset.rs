use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use csv::ReaderBuilder;
use image::RgbImage;
use nalgebra::Vector3;
use serde::Deserialize;
use tracing::info;

use crate::geometry::{CameraParameters, SE3};
use crate::system::Frame;

#[derive(Debug, Clone)]
pub struct PoseEntry {
    pub timestamp_ns: u64,
    pub filename: String,
    /// `T_world_cam`.
    pub pose: SE3,
}

/// camera.yaml format
#[derive(Debug, Deserialize)]
struct CameraYaml {
    width: u32,
    height: u32,
    fx: f64,
    fy: f64,
    cx: f64,
    cy: f64,
    /// `T_world_plane` as [tx, ty, tz, qw, qx, qy, qz]; identity when absent.
    #[serde(default)]
    plane: Option<Vec<f64>>,
}

/// A flight: camera calibration, ground plane, and posed images.
///
/// ```text
/// <root>/camera.yaml
/// <root>/poses.csv     timestamp_ns,filename,tx,ty,tz,qw,qx,qy,qz
/// <root>/images/<filename>
/// ```
#[derive(Debug)]
pub struct AerialDataset {
    root: PathBuf,
    pub camera: CameraParameters,
    pub plane: SE3,
    pub entries: Vec<PoseEntry>,
}

impl AerialDataset {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let (camera, plane) = load_camera(&root.join("camera.yaml"))?;
        let entries = load_pose_list(root.join("poses.csv"))?;
        if entries.is_empty() {
            bail!("No frames listed in {}", root.join("poses.csv").display());
        }
        info!("Loaded {} posed frames from {:?}", entries.len(), root);
        Ok(Self {
            root,
            camera,
            plane,
            entries,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn image(&self, idx: usize) -> Result<RgbImage> {
        let entry = self
            .entries
            .get(idx)
            .with_context(|| format!("No frame at index {}", idx))?;
        let path = self.root.join("images").join(&entry.filename);
        let image = image::open(&path).with_context(|| format!("Failed to read image {:?}", path))?;
        Ok(image.to_rgb8())
    }

    pub fn frame(&self, idx: usize) -> Result<Frame> {
        let image = self.image(idx)?;
        Ok(Frame::new(image, self.entries[idx].pose))
    }
}

fn load_camera(path: &Path) -> Result<(CameraParameters, SE3)> {
    let yaml: CameraYaml = serde_yaml::from_reader(
        File::open(path).with_context(|| format!("Failed to open {:?}", path))?,
    )
    .with_context(|| format!("Failed to parse {:?}", path))?;

    let camera = CameraParameters::new(yaml.width, yaml.height, yaml.fx, yaml.fy, yaml.cx, yaml.cy);
    let plane = match yaml.plane.as_deref() {
        None => SE3::identity(),
        Some(data) => pose_from(data)?,
    };
    Ok((camera, plane))
}

/// `[tx, ty, tz, qw, qx, qy, qz]`, quaternion w-first.
fn pose_from(data: &[f64]) -> Result<SE3> {
    if data.len() != 7 {
        bail!("Expected 7 elements [tx, ty, tz, qw, qx, qy, qz], got {}", data.len());
    }
    let t = Vector3::new(data[0], data[1], data[2]);
    Ok(SE3::from_quaternion(data[3], data[4], data[5], data[6], t))
}

fn load_pose_list(csv_path: PathBuf) -> Result<Vec<PoseEntry>> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .from_path(&csv_path)
        .with_context(|| format!("Failed to open {}", csv_path.display()))?;

    let mut entries = Vec::new();
    for (line, rec) in rdr.records().enumerate() {
        let rec = rec?;
        if rec.len() < 9 {
            continue;
        }
        let ts: u64 = rec[0]
            .trim()
            .parse()
            .with_context(|| format!("Bad timestamp on row {}", line + 1))?;
        let filename = rec[1].trim().to_string();
        let mut values = [0.0f64; 7];
        for (i, v) in values.iter_mut().enumerate() {
            *v = rec[i + 2]
                .trim()
                .parse()
                .with_context(|| format!("Bad pose value on row {}", line + 1))?;
        }
        entries.push(PoseEntry {
            timestamp_ns: ts,
            filename,
            pose: pose_from(&values)?,
        });
    }
    Ok(entries)
}
