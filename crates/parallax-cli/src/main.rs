#![recursion_limit = "256"]

//! Evaluate pre-rendered novel-view-synthesis outputs against a dataset
//! manifest.

use anyhow::Context;
use burn::prelude::Backend;
use clap::Parser;
use parallax_dataset::FrameData;
use parallax_dataset::manifest::{Manifest, alpha_to_tensor, image_to_tensor};
use parallax_eval::{EvaluationMode, Evaluator, NvsModel, RunOptions};
use parallax_metrics::NvsRender;
use std::path::{Path, PathBuf};

type EvalBackend = burn::backend::NdArray;

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Parallax - evaluate novel-view-synthesis renders against held-out data"
)]
struct Cli {
    /// Dataset manifest (json). Frame paths are relative to its directory.
    manifest: PathBuf,

    /// Directory with one rendered image per batch, named after the target
    /// frame's file stem.
    #[arg(long)]
    renders: PathBuf,

    /// Root experiment directory for dumped results.
    #[arg(long)]
    exp_dir: Option<PathBuf>,

    /// Write the summary to <exp-dir>/results_test.json.
    #[arg(long, default_value = "false")]
    dump_json: bool,

    /// Training epoch being evaluated, stored in the dumped records.
    #[arg(long)]
    epoch: Option<u32>,

    /// Score camera difficulty per batch instead of against the full
    /// training camera set.
    #[arg(long, default_value = "false")]
    multisequence: bool,

    /// Camera-difficulty break between the easy and medium buckets.
    #[arg(long, default_value = "0.97")]
    bin_break_low: f32,

    /// Camera-difficulty break between the medium and hard buckets.
    #[arg(long, default_value = "0.98")]
    bin_break_high: f32,
}

/// Model seam over renders that already exist on disk.
struct PrerenderedModel {
    renders: PathBuf,
}

impl<B: Backend> NvsModel<B> for PrerenderedModel {
    fn render(&self, frames: &FrameData<B>, _mode: EvaluationMode) -> anyhow::Result<NvsRender<B>> {
        let target = frames
            .image_paths
            .first()
            .context("Batch has no target frame")?;
        let stem = target
            .file_stem()
            .with_context(|| format!("No file stem for target frame {target:?}"))?;
        let path = self.renders.join(stem).with_extension("png");
        let img = image::open(&path).with_context(|| format!("Failed to open render {path:?}"))?;

        let gt = frames.image_rgb.as_ref().context("Batch has no images")?;
        let device = gt.device();
        let [_, h, w, _] = gt.dims();
        if (img.height() as usize, img.width() as usize) != (h, w) {
            anyhow::bail!(
                "Render {path:?} is {}x{}, dataset images are {w}x{h}",
                img.width(),
                img.height()
            );
        }

        Ok(NvsRender {
            image: image_to_tensor(&img, &device),
            depth: None,
            mask: alpha_to_tensor(&img, &device),
        })
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let manifest = Manifest::load(&cli.manifest)
        .with_context(|| format!("Failed to load manifest {:?}", cli.manifest))?;
    let root = cli
        .manifest
        .parent()
        .unwrap_or(Path::new("."))
        .to_path_buf();
    log::info!(
        "Loaded manifest with {} batches from {:?}.",
        manifest.batches.len(),
        cli.manifest
    );

    let device = Default::default();
    let model = PrerenderedModel {
        renders: cli.renders,
    };
    let evaluator = Evaluator {
        camera_difficulty_bin_breaks: (cli.bin_break_low, cli.bin_break_high),
        is_multisequence: cli.multisequence,
    };
    let train_cameras = manifest.train_cameras();

    let batches = manifest
        .frame_batches::<EvalBackend>(&root, &device)
        .map(|batch| batch.map_err(anyhow::Error::from));

    let options = RunOptions {
        dump_to_json: cli.dump_json,
        exp_dir: cli.exp_dir,
        epoch: cli.epoch,
    };
    let results = evaluator.run(&model, batches, Some(&train_cameras), &device, &options)?;

    log::info!("Summarized {} result records.", results.len());
    Ok(())
}
