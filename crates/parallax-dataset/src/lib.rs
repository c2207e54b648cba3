#![recursion_limit = "256"]

pub mod manifest;

use burn::prelude::Backend;
use burn::tensor::Tensor;
use glam::{Quat, Vec2, Vec3};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Role of a frame within an evaluation batch.
///
/// "Known" frames may be shown to the model at evaluation time, "unseen"
/// frames are the held-out targets the model has to synthesize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    TrainKnown,
    TestKnown,
    TestUnseen,
}

impl FrameType {
    pub fn is_known(self) -> bool {
        !matches!(self, Self::TestUnseen)
    }
}

/// Camera pose and intrinsics, in normalized image coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Camera {
    pub position: Vec3,
    pub rotation: Quat,
    /// Focal length, normalized by image size.
    pub focal: Vec2,
    /// Principal point in 0-1 UV coordinates.
    pub center_uv: Vec2,
}

impl Camera {
    pub fn new(position: Vec3, rotation: Quat, focal: Vec2, center_uv: Vec2) -> Self {
        Self {
            position,
            rotation,
            focal,
            center_uv,
        }
    }

    /// The direction the camera is looking in (-Z in camera space).
    pub fn look_dir(&self) -> Vec3 {
        self.rotation * Vec3::NEG_Z
    }
}

/// One batch of frames, as produced by a dataloader.
///
/// Image tensors are NHWC like the rest of the codebase: `image_rgb` is
/// [N, H, W, 3], the single-channel fields are [N, H, W, 1]. Frame 0 is the
/// evaluation target, the remaining frames are source views.
#[derive(Debug, Clone)]
pub struct FrameData<B: Backend> {
    pub image_rgb: Option<Tensor<B, 4>>,
    pub depth_map: Option<Tensor<B, 4>>,
    pub fg_probability: Option<Tensor<B, 4>>,
    pub mask_crop: Option<Tensor<B, 4>>,
    pub frame_type: Vec<FrameType>,
    pub cameras: Vec<Camera>,
    pub image_paths: Vec<PathBuf>,
    pub category: String,
    pub sequence: String,
}

impl<B: Backend> FrameData<B> {
    pub fn num_frames(&self) -> usize {
        self.frame_type.len()
    }

    /// Cameras of the frames the model is allowed to see.
    pub fn known_cameras(&self) -> Vec<Camera> {
        self.frame_type
            .iter()
            .zip(&self.cameras)
            .filter(|(frame_type, _)| frame_type.is_known())
            .map(|(_, camera)| camera.clone())
            .collect()
    }

    /// Copy of this batch with the pixel data of unseen frames zeroed out, so
    /// the model cannot peek at them at evaluation time.
    ///
    /// Exactly `image_rgb`, `depth_map`, `fg_probability` and `mask_crop` are
    /// masked; a field that is `None` stays `None`. Everything else carries
    /// over unchanged.
    pub fn masked_for_eval(&self) -> Self {
        let tensor_fields = [
            &self.image_rgb,
            &self.depth_map,
            &self.fg_probability,
            &self.mask_crop,
        ];
        let Some(device) = tensor_fields
            .into_iter()
            .flatten()
            .next()
            .map(|t| t.device())
        else {
            // Nothing to mask.
            return self.clone();
        };

        let known: Vec<f32> = self
            .frame_type
            .iter()
            .map(|frame_type| if frame_type.is_known() { 1.0 } else { 0.0 })
            .collect();
        // Broadcasts against [N, H, W, C].
        let is_known = Tensor::<B, 1>::from_floats(known.as_slice(), &device).reshape([
            self.num_frames(),
            1,
            1,
            1,
        ]);
        let masked = |field: &Option<Tensor<B, 4>>| {
            field.as_ref().map(|t| t.clone() * is_known.clone())
        };

        Self {
            image_rgb: masked(&self.image_rgb),
            depth_map: masked(&self.depth_map),
            fg_probability: masked(&self.fg_probability),
            mask_crop: masked(&self.mask_crop),
            frame_type: self.frame_type.clone(),
            cameras: self.cameras.clone(),
            image_paths: self.image_paths.clone(),
            category: self.category.clone(),
            sequence: self.sequence.clone(),
        }
    }
}
