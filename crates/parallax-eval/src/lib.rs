#![recursion_limit = "256"]

//! Evaluation of a trained novel-view-synthesis model on a held-out dataset:
//! mask what the model must not see, render, score, aggregate by camera
//! difficulty, and optionally dump the summary to disk.

pub mod model;

pub use model::{EvaluationMode, NvsModel};

use burn::prelude::Backend;
use glam::Vec3;
use indicatif::{ProgressBar, ProgressStyle};
use lpips::LpipsConfig;
use parallax_dataset::{Camera, FrameData};
use parallax_metrics::summarize::{
    MetricsRecord, pretty_print_nvs_metrics, summarize_nvs_eval_results,
};
use parallax_metrics::{MetricsError, eval_batch};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Filename of the dumped summary, under the experiment directory.
pub const RESULTS_FILE: &str = "results_test.json";

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("Cannot dump results to json without an experiment directory.")]
    MissingExpDir,

    #[error("Failed to compute batch metrics.")]
    Metrics(#[from] MetricsError),

    /// A model or dataloader failure, passed through unmodified.
    #[error(transparent)]
    Source(#[from] anyhow::Error),

    #[error("Failed to write results.")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode results.")]
    Json(#[from] serde_json::Error),
}

/// Output options for an evaluation run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Write the summary to `<exp_dir>/results_test.json`.
    pub dump_to_json: bool,
    /// Root experiment directory. Required when dumping.
    pub exp_dir: Option<PathBuf>,
    /// Training epoch being evaluated, stored in each dumped record.
    pub epoch: Option<u32>,
}

/// Evaluates a trained model over a test dataloader.
#[derive(Debug, Clone)]
pub struct Evaluator {
    /// Low/medium breaks dividing camera difficulties into three buckets.
    pub camera_difficulty_bin_breaks: (f32, f32),
    pub is_multisequence: bool,
}

impl Default for Evaluator {
    fn default() -> Self {
        Self {
            camera_difficulty_bin_breaks: (0.97, 0.98),
            is_multisequence: false,
        }
    }
}

impl Evaluator {
    /// Run the model over every batch of `dataloader` and summarize the
    /// resulting metrics.
    ///
    /// `all_train_cameras` is used as the source-camera set in the
    /// single-sequence regime; a multisequence run always scores difficulty
    /// against each batch's own known cameras. The LPIPS model is built once
    /// on `device`.
    pub fn run<B, M, I>(
        &self,
        model: &M,
        dataloader: I,
        all_train_cameras: Option<&[Camera]>,
        device: &B::Device,
        options: &RunOptions,
    ) -> Result<Vec<MetricsRecord>, EvalError>
    where
        B: Backend,
        M: NvsModel<B>,
        I: IntoIterator<Item = anyhow::Result<FrameData<B>>>,
    {
        if options.dump_to_json && options.exp_dir.is_none() {
            return Err(EvalError::MissingExpDir);
        }

        let lpips = LpipsConfig::new().init::<B>(device);

        log::info!("Evaluating model ...");
        let progress = ProgressBar::new_spinner().with_style(
            ProgressStyle::with_template("{spinner:.blue} {pos} batches evaluated")
                .expect("Invalid indicatif config"),
        );

        let source_cameras = if self.is_multisequence {
            // Scored against the batch's own known cameras.
            None
        } else {
            all_train_cameras
        };

        let mut per_batch = vec![];
        for batch in dataloader {
            let frame_data = batch?;
            // Hide the unknown images so the model cannot use them.
            let eval_frame_data = frame_data.masked_for_eval();
            let render = model
                .render(&eval_frame_data, EvaluationMode::Evaluation)?
                .detached();
            per_batch.push(eval_batch(
                &frame_data,
                &render,
                Vec3::ZERO,
                &lpips,
                source_cameras,
            )?);
            progress.inc(1);
        }
        progress.finish_and_clear();
        log::info!("Evaluated {} batches.", per_batch.len());

        let mut results = summarize_nvs_eval_results(
            &per_batch,
            self.is_multisequence,
            self.camera_difficulty_bin_breaks,
        );
        pretty_print_nvs_metrics(&results);

        if options.dump_to_json {
            let exp_dir = options.exp_dir.as_deref().ok_or(EvalError::MissingExpDir)?;
            dump_to_json(&mut results, exp_dir, options.epoch)?;
        }

        Ok(results)
    }
}

fn dump_to_json(
    results: &mut [MetricsRecord],
    exp_dir: &Path,
    epoch: Option<u32>,
) -> Result<(), EvalError> {
    if let Some(epoch) = epoch {
        for record in results.iter_mut() {
            record.eval_epoch = Some(i64::from(epoch));
        }
    }
    let path = exp_dir.join(RESULTS_FILE);
    let file = std::fs::File::create(&path)?;
    serde_json::to_writer(std::io::BufWriter::new(file), &*results)?;
    log::info!("Wrote evaluation results to {path:?}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use burn::backend::NdArray;
    use burn::tensor::{Tensor, TensorData};
    use glam::{Quat, Vec2};
    use parallax_dataset::FrameType;
    use parallax_metrics::NvsRender;
    use std::path::PathBuf;

    type B = NdArray;

    const RES: usize = 16;

    /// Renders a constant gray image, and records that it only ever saw
    /// masked batches.
    struct FlatModel {
        value: f32,
    }

    impl NvsModel<B> for FlatModel {
        fn render(
            &self,
            frames: &FrameData<B>,
            mode: EvaluationMode,
        ) -> anyhow::Result<NvsRender<B>> {
            assert_eq!(mode, EvaluationMode::Evaluation, "evaluator sets the mode");
            // The target frame must have been hidden from us.
            let rgb = frames.image_rgb.as_ref().expect("batch has images");
            let target: Vec<f32> = rgb
                .clone()
                .slice([0..1])
                .into_data()
                .to_vec()
                .expect("f32 data");
            assert!(
                target.iter().all(|&v| v == 0.0),
                "model saw unmasked target pixels"
            );
            Ok(NvsRender {
                image: Tensor::ones([1, RES, RES, 3], &rgb.device()) * self.value,
                depth: None,
                mask: None,
            })
        }
    }

    fn camera(angle: f32) -> Camera {
        Camera::new(
            Vec3::new(angle.sin(), 0.0, angle.cos()) * 2.0,
            Quat::from_rotation_y(angle),
            Vec2::splat(0.8),
            Vec2::splat(0.5),
        )
    }

    fn batch(category: &str, value: f32, target_angle: f32) -> anyhow::Result<FrameData<B>> {
        let device = Default::default();
        let target: Vec<f32> = vec![value; RES * RES * 3];
        let source: Vec<f32> = vec![value * 0.5; RES * RES * 3];
        let rgb = Tensor::cat(
            vec![
                Tensor::from_data(TensorData::new(target, [1, RES, RES, 3]), &device),
                Tensor::from_data(TensorData::new(source, [1, RES, RES, 3]), &device),
            ],
            0,
        );
        Ok(FrameData {
            image_rgb: Some(rgb),
            depth_map: None,
            fg_probability: None,
            mask_crop: None,
            frame_type: vec![FrameType::TestUnseen, FrameType::TrainKnown],
            cameras: vec![camera(target_angle), camera(0.0)],
            image_paths: vec![
                PathBuf::from("frame_000.png"),
                PathBuf::from("frame_001.png"),
            ],
            category: category.to_owned(),
            sequence: "seq_0".to_owned(),
        })
    }

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("parallax_eval_{}_{name}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
        dir
    }

    #[test]
    fn dump_without_exp_dir_is_a_config_error() {
        let device = Default::default();
        let evaluator = Evaluator::default();
        let options = RunOptions {
            dump_to_json: true,
            exp_dir: None,
            epoch: Some(3),
        };
        let res = evaluator.run(
            &FlatModel { value: 0.5 },
            vec![batch("mug", 0.8, 0.05)],
            None,
            &device,
            &options,
        );
        assert!(
            matches!(res, Err(EvalError::MissingExpDir)),
            "dumping without an experiment directory must fail"
        );
    }

    #[test]
    fn run_masks_batches_and_summarizes() {
        let device = Default::default();
        let evaluator = Evaluator::default();
        let results = evaluator
            .run(
                &FlatModel { value: 0.5 },
                vec![batch("mug", 0.8, 0.05), batch("mug", 0.6, 0.1)],
                None,
                &device,
                &RunOptions::default(),
            )
            .expect("evaluation should succeed");

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].category, "mug");
        assert_eq!(results[0].subset, "easy");
        assert!(results[0].metrics.contains_key("psnr"));
        assert!(results[0].metrics.contains_key("lpips"));
        assert!(results[0].eval_epoch.is_none());
    }

    #[test]
    fn dumped_records_carry_the_epoch() {
        let device = Default::default();
        let evaluator = Evaluator::default();
        let exp_dir = test_dir("epoch");
        let options = RunOptions {
            dump_to_json: true,
            exp_dir: Some(exp_dir.clone()),
            epoch: Some(7),
        };
        let results = evaluator
            .run(
                &FlatModel { value: 0.5 },
                vec![batch("mug", 0.8, 0.05), batch("bowl", 0.4, 2.8)],
                None,
                &device,
                &options,
            )
            .expect("evaluation should succeed");
        assert!(!results.is_empty());

        let dumped = std::fs::read_to_string(exp_dir.join(RESULTS_FILE))
            .expect("results file should be written");
        let parsed: serde_json::Value =
            serde_json::from_str(&dumped).expect("results should be json");
        let records = parsed.as_array().expect("results should be a list");
        assert_eq!(records.len(), results.len());
        for record in records {
            assert_eq!(record["eval_epoch"], 7, "every record carries the epoch");
        }
        let _ = std::fs::remove_dir_all(&exp_dir);
    }

    #[test]
    fn dump_without_epoch_leaves_records_untagged() {
        let device = Default::default();
        let evaluator = Evaluator::default();
        let exp_dir = test_dir("no_epoch");
        let options = RunOptions {
            dump_to_json: true,
            exp_dir: Some(exp_dir.clone()),
            epoch: None,
        };
        evaluator
            .run(
                &FlatModel { value: 0.5 },
                vec![batch("mug", 0.8, 0.05)],
                None,
                &device,
                &options,
            )
            .expect("evaluation should succeed");

        let dumped = std::fs::read_to_string(exp_dir.join(RESULTS_FILE))
            .expect("results file should be written");
        let parsed: serde_json::Value =
            serde_json::from_str(&dumped).expect("results should be json");
        for record in parsed.as_array().expect("results should be a list") {
            assert!(
                record.get("eval_epoch").is_none(),
                "no epoch given, no tag expected"
            );
        }
        let _ = std::fs::remove_dir_all(&exp_dir);
    }

    #[test]
    fn summary_ignores_batch_order() {
        let device = Default::default();
        let evaluator = Evaluator::default();
        let batches = |reversed: bool| {
            let mut all = vec![
                batch("mug", 0.8, 0.05),
                batch("mug", 0.6, 0.1),
                batch("bowl", 0.4, 2.9),
            ];
            if reversed {
                all.reverse();
            }
            all
        };
        let model = FlatModel { value: 0.5 };
        let forward = evaluator
            .run(&model, batches(false), None, &device, &RunOptions::default())
            .expect("evaluation should succeed");
        let backward = evaluator
            .run(&model, batches(true), None, &device, &RunOptions::default())
            .expect("evaluation should succeed");

        assert_eq!(forward.len(), backward.len());
        for (a, b) in forward.iter().zip(&backward) {
            assert_eq!(a.category, b.category);
            assert_eq!(a.subset, b.subset);
            for (name, value) in &a.metrics {
                assert_approx_eq!(value, b.metrics[name], 1e-6);
            }
        }
    }

    #[test]
    fn model_errors_propagate() {
        struct FailingModel;
        impl NvsModel<B> for FailingModel {
            fn render(
                &self,
                _frames: &FrameData<B>,
                _mode: EvaluationMode,
            ) -> anyhow::Result<NvsRender<B>> {
                anyhow::bail!("device lost")
            }
        }
        let device = Default::default();
        let evaluator = Evaluator::default();
        let res = evaluator.run(
            &FailingModel,
            vec![batch("mug", 0.8, 0.05)],
            None,
            &device,
            &RunOptions::default(),
        );
        assert!(
            matches!(res, Err(EvalError::Source(_))),
            "model failures pass through"
        );
    }
}
