#![recursion_limit = "256"]

//! Per-batch image-quality metrics for novel-view-synthesis evaluation, plus
//! aggregation of those metrics by camera-difficulty bucket.

pub mod difficulty;
pub mod summarize;

use burn::prelude::Backend;
use burn::tensor::{ElementConversion, Tensor};
use glam::Vec3;
use lpips::LpipsModel;
use parallax_dataset::{Camera, FrameData};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::trace_span;

use crate::difficulty::camera_difficulty;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Batch carries no ground truth images.")]
    MissingGroundTruth,

    #[error("Batch has no frames.")]
    EmptyBatch,

    #[error("Render resolution {render:?} does not match ground truth {gt:?}.")]
    ResolutionMismatch { render: [usize; 2], gt: [usize; 2] },
}

/// A model's rendered output for a batch. Frame 0 is the evaluation target.
#[derive(Debug, Clone)]
pub struct NvsRender<B: Backend> {
    /// [N, H, W, 3] color render.
    pub image: Tensor<B, 4>,
    /// Optional [N, H, W, 1] rendered depth.
    pub depth: Option<Tensor<B, 4>>,
    /// Optional [N, H, W, 1] rendered foreground mask.
    pub mask: Option<Tensor<B, 4>>,
}

impl<B: Backend> NvsRender<B> {
    /// Severs any autodiff graph, so evaluation never aliases training state.
    pub fn detached(self) -> Self {
        Self {
            image: self.image.detach(),
            depth: self.depth.map(Tensor::detach),
            mask: self.mask.map(Tensor::detach),
        }
    }
}

/// Metrics computed for one batch, keyed by metric name.
#[derive(Debug, Clone)]
pub struct BatchEvalResult {
    pub category: String,
    pub sequence: String,
    pub camera_difficulty: f32,
    pub metrics: BTreeMap<String, f64>,
}

/// Compare a render against the batch's ground truth target frame.
///
/// Ground truth is composited over `bg_color` using the foreground
/// probability when present. The camera difficulty of the target is measured
/// against `source_cameras` when given, else against the batch's own
/// known-frame cameras.
pub fn eval_batch<B: Backend>(
    frame_data: &FrameData<B>,
    render: &NvsRender<B>,
    bg_color: Vec3,
    lpips: &LpipsModel<B>,
    source_cameras: Option<&[Camera]>,
) -> Result<BatchEvalResult, MetricsError> {
    let _span = trace_span!("eval_batch").entered();

    let target_camera = frame_data.cameras.first().ok_or(MetricsError::EmptyBatch)?;
    let gt = frame_data
        .image_rgb
        .as_ref()
        .ok_or(MetricsError::MissingGroundTruth)?;

    let [_, h, w, _] = gt.dims();
    let [_, rh, rw, _] = render.image.dims();
    if (rh, rw) != (h, w) {
        return Err(MetricsError::ResolutionMismatch {
            render: [rh, rw],
            gt: [h, w],
        });
    }
    let device = gt.device();

    let fg = frame_data
        .fg_probability
        .as_ref()
        .map(|fg| fg.clone().slice([0..1]));

    // Composite the target over the background color.
    let gt_rgb = gt.clone().slice([0..1]);
    let gt_rgb = if let Some(fg) = &fg {
        let bg = Tensor::<B, 1>::from_floats([bg_color.x, bg_color.y, bg_color.z], &device)
            .reshape([1, 1, 1, 3]);
        gt_rgb * fg.clone() + bg * (fg.ones_like() - fg.clone())
    } else {
        gt_rgb
    };

    // Simulate an 8-bit roundtrip for fair comparison.
    let render_rgb = render.image.clone().slice([0..1]);
    let render_rgb = (render_rgb * 255.0).round() / 255.0;

    let mut metrics = BTreeMap::new();

    let diff_sq = (render_rgb.clone() - gt_rgb.clone()).powi_scalar(2);
    metrics.insert("psnr".to_owned(), psnr_from_mse(diff_sq.clone().mean()));
    metrics.insert(
        "rgb_l1".to_owned(),
        (render_rgb.clone() - gt_rgb.clone())
            .abs()
            .mean()
            .into_scalar()
            .elem(),
    );

    if let Some(fg) = &fg {
        // Mean over foreground pixels only; the indicator broadcasts over the
        // three color channels.
        let fg_sum = (fg.clone().sum() * 3.0).clamp_min(1.0);
        let mse_fg = (diff_sq * fg.clone()).sum() / fg_sum;
        metrics.insert("psnr_fg".to_owned(), psnr_from_mse(mse_fg));
    }

    if let (Some(gt_depth), Some(render_depth)) = (&frame_data.depth_map, &render.depth) {
        let gt_depth = gt_depth.clone().slice([0..1]);
        let render_depth = render_depth.clone().slice([0..1]);
        // Only pixels with a valid (positive) ground truth depth count, inside
        // the foreground when a mask exists.
        let mut valid = gt_depth.clone().greater_elem(0.0).float();
        if let Some(fg) = &fg {
            valid = valid * fg.clone().greater_elem(0.5).float();
        }
        let abs = (render_depth - gt_depth).abs() * valid.clone();
        let depth_abs = abs.sum() / valid.sum().clamp_min(1.0);
        metrics.insert("depth_abs_fg".to_owned(), depth_abs.into_scalar().elem());
    }

    if let (Some(fg), Some(render_mask)) = (&fg, &render.mask) {
        let gt_bin = fg.clone().greater_elem(0.5).float();
        let render_bin = render_mask.clone().slice([0..1]).greater_elem(0.5).float();
        let intersection = (gt_bin.clone() * render_bin.clone()).sum();
        let union = (gt_bin.clone() + render_bin.clone() - gt_bin * render_bin).sum();
        // Two empty masks count as a perfect match.
        let iou = (intersection + 1e-6) / (union + 1e-6);
        metrics.insert("mask_iou".to_owned(), iou.into_scalar().elem());
    }

    metrics.insert(
        "lpips".to_owned(),
        lpips.lpips(render_rgb, gt_rgb).into_scalar().elem(),
    );

    let difficulty = match source_cameras {
        Some(sources) => camera_difficulty(target_camera, sources),
        None => camera_difficulty(target_camera, &frame_data.known_cameras()),
    };

    Ok(BatchEvalResult {
        category: frame_data.category.clone(),
        sequence: frame_data.sequence.clone(),
        camera_difficulty: difficulty,
        metrics,
    })
}

fn psnr_from_mse<B: Backend>(mse: Tensor<B, 1>) -> f64 {
    (mse.recip().log() * 10.0 / std::f32::consts::LN_10)
        .into_scalar()
        .elem()
}
