#![recursion_limit = "256"]

//! Learned perceptual image patch similarity (LPIPS) on a VGG-16 feature
//! trunk. Distances are sums over stages of channel-weighted squared feature
//! differences, with features unit-normalized along the channel dimension.

use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{MaxPool2d, MaxPool2dConfig};
use burn::nn::{Initializer, PaddingConfig2d, Relu};
use burn::tensor::backend::Backend;
use burn::tensor::{Device, Tensor};
use std::f64::consts::SQRT_2;

/// The five VGG-16 stages: (conv count, output channels).
const VGG_STAGES: [(usize, usize); 5] = [(2, 64), (2, 128), (3, 256), (3, 512), (3, 512)];

#[derive(Module, Debug)]
struct ConvRelu<B: Backend> {
    conv: Conv2d<B>,
    relu: Relu,
}

impl<B: Backend> ConvRelu<B> {
    fn init(in_channels: usize, out_channels: usize, device: &Device<B>) -> Self {
        let initializer = Initializer::KaimingNormal {
            gain: SQRT_2,
            fan_out_only: true,
        };
        let conv = Conv2dConfig::new([in_channels, out_channels], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_bias(false)
            .with_initializer(initializer)
            .init(device);
        Self {
            conv,
            relu: Relu::new(),
        }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.relu.forward(self.conv.forward(input))
    }
}

/// A run of 3x3 conv+relu layers at one resolution.
#[derive(Module, Debug)]
struct VggStage<B: Backend> {
    convs: Vec<ConvRelu<B>>,
}

impl<B: Backend> VggStage<B> {
    fn init(num_convs: usize, in_channels: usize, out_channels: usize, device: &Device<B>) -> Self {
        let convs = (0..num_convs)
            .map(|i| {
                let input = if i == 0 { in_channels } else { out_channels };
                ConvRelu::init(input, out_channels, device)
            })
            .collect();
        Self { convs }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut cur = input;
        for conv in &self.convs {
            cur = conv.forward(cur);
        }
        cur
    }
}

#[derive(Module, Debug)]
pub struct LpipsModel<B: Backend> {
    stages: Vec<VggStage<B>>,
    /// Learned 1x1 channel weights per stage, the calibration heads of LPIPS.
    heads: Vec<Conv2d<B>>,
    pool: MaxPool2d,
}

impl<B: Backend> LpipsModel<B> {
    /// Feature maps per stage, taken before each max pool as in the original
    /// LPIPS. Input is NCHW.
    fn features(&self, input: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        let mut cur = input;
        let mut features = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            cur = stage.forward(cur);
            features.push(cur.clone());
            cur = self.pool.forward(cur);
        }
        features
    }

    /// Perceptual distance per image pair, shape [N]. Images are NHWC with
    /// 0-1 values.
    pub fn lpips(&self, imgs_a: Tensor<B, 4>, imgs_b: Tensor<B, 4>) -> Tensor<B, 1> {
        let [n, _, _, _] = imgs_a.dims();

        // NHWC to NCHW, scaled to the -1 to 1 range VGG was trained on.
        let imgs_a = imgs_a.permute([0, 3, 1, 2]) * 2.0 - 1.0;
        let imgs_b = imgs_b.permute([0, 3, 1, 2]) * 2.0 - 1.0;

        let feats_a = self.features(imgs_a);
        let feats_b = self.features(imgs_b);

        let mut total: Option<Tensor<B, 1>> = None;
        for ((a, b), head) in feats_a.into_iter().zip(feats_b).zip(&self.heads) {
            let diff = (unit_normalize(a) - unit_normalize(b)).powi_scalar(2);
            // Channel weighting, then spatial mean.
            let weighted = head.forward(diff);
            let stage_dist = weighted.mean_dim(3).mean_dim(2).reshape([n]);
            total = Some(match total {
                Some(sum) => sum + stage_dist,
                None => stage_dist,
            });
        }
        total.expect("lpips model has at least one stage")
    }
}

/// Scale features to unit L2 norm along the channel dimension (NCHW).
fn unit_normalize<B: Backend>(features: Tensor<B, 4>) -> Tensor<B, 4> {
    let norm = features
        .clone()
        .powi_scalar(2)
        .sum_dim(1)
        .add_scalar(1e-10)
        .sqrt();
    features / norm
}

#[derive(Config, Debug)]
pub struct LpipsConfig {}

impl LpipsConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> LpipsModel<B> {
        let mut stages = Vec::with_capacity(VGG_STAGES.len());
        let mut heads = Vec::with_capacity(VGG_STAGES.len());
        let mut in_channels = 3;
        for (num_convs, out_channels) in VGG_STAGES {
            stages.push(VggStage::init(num_convs, in_channels, out_channels, device));
            // Without a calibration file the heads default to a uniform
            // channel average.
            let head = Conv2dConfig::new([out_channels, 1], [1, 1])
                .with_bias(false)
                .with_initializer(Initializer::Constant {
                    value: 1.0 / out_channels as f64,
                })
                .init(device);
            heads.push(head);
            in_channels = out_channels;
        }

        LpipsModel {
            stages,
            heads,
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        }
    }
}
