//! JSON manifest describing evaluation batches, and the loader that turns it
//! into [`FrameData`] tensors.

use crate::{Camera, FrameData, FrameType};
use burn::prelude::Backend;
use burn::tensor::{Tensor, TensorData};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("IO error while loading dataset.")]
    Io(#[from] std::io::Error),

    #[error("Error decoding JSON manifest.")]
    Json(#[from] serde_json::Error),

    #[error("Error decoding image {path}.")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("Batch {index} has no frames.")]
    EmptyBatch { index: usize },

    #[error("Frames in batch {index} have mismatched resolutions.")]
    MismatchedResolution { index: usize },
}

/// One frame of a batch: paths on disk plus its camera and role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameEntry {
    pub image: PathBuf,
    /// Optional crop/valid-region mask image.
    #[serde(default)]
    pub mask: Option<PathBuf>,
    pub frame_type: FrameType,
    pub camera: Camera,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEntry {
    pub category: String,
    pub sequence: String,
    pub frames: Vec<FrameEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub batches: Vec<BatchEntry>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self, DatasetError> {
        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    /// All cameras of frames marked known, across the whole manifest.
    pub fn train_cameras(&self) -> Vec<Camera> {
        self.batches
            .iter()
            .flat_map(|batch| &batch.frames)
            .filter(|frame| frame.frame_type.is_known())
            .map(|frame| frame.camera.clone())
            .collect()
    }

    /// Lazily load every batch, relative to `root`.
    pub fn frame_batches<'a, B: Backend>(
        &'a self,
        root: &'a Path,
        device: &'a B::Device,
    ) -> impl Iterator<Item = Result<FrameData<B>, DatasetError>> + 'a {
        self.batches
            .iter()
            .enumerate()
            .map(move |(index, batch)| batch.load_frame_data(index, root, device))
    }
}

impl BatchEntry {
    /// Decode all frame images of this batch and stack them into tensors.
    ///
    /// An alpha channel, when any frame has one, becomes `fg_probability`
    /// (frames without alpha count as fully foreground). Mask images fill
    /// `mask_crop` the same way. The manifest carries no depth data.
    pub fn load_frame_data<B: Backend>(
        &self,
        index: usize,
        root: &Path,
        device: &B::Device,
    ) -> Result<FrameData<B>, DatasetError> {
        if self.frames.is_empty() {
            return Err(DatasetError::EmptyBatch { index });
        }

        let mut rgbs = Vec::with_capacity(self.frames.len());
        let mut alphas = Vec::with_capacity(self.frames.len());
        let mut masks = Vec::with_capacity(self.frames.len());
        let mut image_paths = Vec::with_capacity(self.frames.len());
        let mut resolution = None;

        for frame in &self.frames {
            let path = root.join(&frame.image);
            let img = open_image(&path)?;
            let dims = (img.height() as usize, img.width() as usize);
            match resolution {
                None => resolution = Some(dims),
                Some(res) if res != dims => {
                    return Err(DatasetError::MismatchedResolution { index });
                }
                Some(_) => {}
            }

            rgbs.push(image_to_tensor::<B>(&img, device));
            alphas.push(alpha_to_tensor::<B>(&img, device));

            let mask = match &frame.mask {
                Some(rel) => {
                    let mask_path = root.join(rel);
                    let mask_img = open_image(&mask_path)?;
                    if (mask_img.height() as usize, mask_img.width() as usize) != dims {
                        return Err(DatasetError::MismatchedResolution { index });
                    }
                    Some(luma_to_tensor::<B>(&mask_img, device))
                }
                None => None,
            };
            masks.push(mask);
            image_paths.push(path);
        }

        let (h, w) = resolution.expect("at least one frame was loaded");

        Ok(FrameData {
            image_rgb: Some(Tensor::cat(rgbs, 0)),
            depth_map: None,
            fg_probability: stack_optional(alphas, h, w, device),
            mask_crop: stack_optional(masks, h, w, device),
            frame_type: self.frames.iter().map(|f| f.frame_type).collect(),
            cameras: self.frames.iter().map(|f| f.camera.clone()).collect(),
            image_paths,
            category: self.category.clone(),
            sequence: self.sequence.clone(),
        })
    }
}

fn open_image(path: &Path) -> Result<DynamicImage, DatasetError> {
    image::open(path).map_err(|source| DatasetError::Image {
        path: path.to_path_buf(),
        source,
    })
}

/// Image as a [1, H, W, 3] tensor with 0-1 values.
pub fn image_to_tensor<B: Backend>(img: &DynamicImage, device: &B::Device) -> Tensor<B, 4> {
    let (h, w) = (img.height() as usize, img.width() as usize);
    let rgb = img.to_rgb32f().into_raw();
    Tensor::from_data(TensorData::new(rgb, [1, h, w, 3]), device)
}

/// Alpha channel as a [1, H, W, 1] tensor, or `None` for opaque formats.
pub fn alpha_to_tensor<B: Backend>(
    img: &DynamicImage,
    device: &B::Device,
) -> Option<Tensor<B, 4>> {
    if !img.color().has_alpha() {
        return None;
    }
    let (h, w) = (img.height() as usize, img.width() as usize);
    let alpha: Vec<f32> = img
        .to_rgba32f()
        .into_raw()
        .chunks_exact(4)
        .map(|px| px[3])
        .collect();
    Some(Tensor::from_data(
        TensorData::new(alpha, [1, h, w, 1]),
        device,
    ))
}

/// Grayscale image as a [1, H, W, 1] tensor with 0-1 values.
pub fn luma_to_tensor<B: Backend>(img: &DynamicImage, device: &B::Device) -> Tensor<B, 4> {
    let (h, w) = (img.height() as usize, img.width() as usize);
    let luma = img.to_luma32f().into_raw();
    Tensor::from_data(TensorData::new(luma, [1, h, w, 1]), device)
}

/// Stack per-frame [1, H, W, 1] tensors, treating missing ones as all-ones.
/// Returns `None` when no frame carries the channel at all.
fn stack_optional<B: Backend>(
    tensors: Vec<Option<Tensor<B, 4>>>,
    h: usize,
    w: usize,
    device: &B::Device,
) -> Option<Tensor<B, 4>> {
    if tensors.iter().all(Option::is_none) {
        return None;
    }
    let filled = tensors
        .into_iter()
        .map(|t| t.unwrap_or_else(|| Tensor::ones([1, h, w, 1], device)))
        .collect();
    Some(Tensor::cat(filled, 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_manifest_json() {
        let json = r#"{
            "batches": [{
                "category": "mug",
                "sequence": "seq_0",
                "frames": [
                    {
                        "image": "images/frame_000.png",
                        "frame_type": "test_unseen",
                        "camera": {
                            "position": [0.0, 0.0, 2.0],
                            "rotation": [0.0, 0.0, 0.0, 1.0],
                            "focal": [0.8, 0.8],
                            "center_uv": [0.5, 0.5]
                        }
                    },
                    {
                        "image": "images/frame_001.png",
                        "mask": "masks/frame_001.png",
                        "frame_type": "train_known",
                        "camera": {
                            "position": [1.0, 0.0, 2.0],
                            "rotation": [0.0, 0.0, 0.0, 1.0],
                            "focal": [0.8, 0.8],
                            "center_uv": [0.5, 0.5]
                        }
                    }
                ]
            }]
        }"#;
        let manifest: Manifest = serde_json::from_str(json).expect("manifest should parse");
        assert_eq!(manifest.batches.len(), 1);
        let batch = &manifest.batches[0];
        assert_eq!(batch.category, "mug");
        assert_eq!(batch.frames[0].frame_type, FrameType::TestUnseen);
        assert!(batch.frames[0].mask.is_none());
        assert!(batch.frames[1].mask.is_some());
        assert_eq!(manifest.train_cameras().len(), 1);
    }

    #[test]
    fn empty_batch_is_rejected() {
        type B = burn::backend::NdArray;
        let batch = BatchEntry {
            category: "mug".to_owned(),
            sequence: "seq_0".to_owned(),
            frames: vec![],
        };
        let device = Default::default();
        let res = batch.load_frame_data::<B>(3, Path::new("."), &device);
        assert!(
            matches!(res, Err(DatasetError::EmptyBatch { index: 3 })),
            "empty batch should be a dataset error"
        );
    }

    #[test]
    fn stack_optional_fills_missing_with_ones() {
        type B = burn::backend::NdArray;
        let device = Default::default();
        let half = Tensor::<B, 4>::ones([1, 2, 2, 1], &device) * 0.5;
        let stacked = stack_optional(vec![Some(half), None], 2, 2, &device)
            .expect("one channel present should produce a tensor");
        let values = stacked.into_data().to_vec::<f32>().expect("f32 data");
        assert_eq!(values, vec![0.5, 0.5, 0.5, 0.5, 1.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn stack_optional_without_channels_is_none() {
        type B = burn::backend::NdArray;
        let device: <B as Backend>::Device = Default::default();
        assert!(stack_optional::<B>(vec![None, None], 2, 2, &device).is_none());
    }
}
