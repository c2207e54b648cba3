use burn::prelude::Backend;
use parallax_dataset::FrameData;
use parallax_metrics::NvsRender;

/// Whether the model is being called as part of training or evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationMode {
    Training,
    Evaluation,
}

/// A trained novel-view-synthesis model.
///
/// In [`EvaluationMode::Evaluation`] the batch passed in has the pixel data
/// of unseen frames zeroed out, and the model must synthesize the target
/// frame from the remaining source views alone.
pub trait NvsModel<B: Backend> {
    fn render(&self, frames: &FrameData<B>, mode: EvaluationMode) -> anyhow::Result<NvsRender<B>>;
}
