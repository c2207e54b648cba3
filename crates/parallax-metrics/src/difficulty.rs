//! Camera-difficulty scoring: how far a target viewpoint sits from the views
//! the model was given.

use parallax_dataset::Camera;

/// Difficulty of synthesizing `target` given `sources`, in [0, 1].
///
/// The best cosine between the target's optical axis and any source axis is
/// mapped to a 0-1 similarity; difficulty is one minus that. With no sources
/// at all the target counts as maximally difficult.
pub fn camera_difficulty(target: &Camera, sources: &[Camera]) -> f32 {
    let target_dir = target.look_dir();
    let best = sources
        .iter()
        .map(|source| 0.5 * (1.0 + target_dir.dot(source.look_dir())))
        .fold(None, |best: Option<f32>, sim| {
            Some(best.map_or(sim, |b| b.max(sim)))
        });
    match best {
        Some(similarity) => (1.0 - similarity).clamp(0.0, 1.0),
        None => 1.0,
    }
}

/// Stratification bucket for a difficulty value, given the two bin breaks.
pub fn difficulty_bucket(difficulty: f32, bin_breaks: (f32, f32)) -> &'static str {
    if difficulty < bin_breaks.0 {
        "easy"
    } else if difficulty < bin_breaks.1 {
        "medium"
    } else {
        "hard"
    }
}
