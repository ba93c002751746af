//! Burn models for triplet embedding training.
//!
//! This crate defines the network used by the trainer:
//! - `Backbone`: a convolutional feature extractor selected by name from a small zoo.
//! - `TripletNet`: backbone + global average pool (embedding) + linear class head (logits).
//!
//! One `TripletNet::forward` call produces both the embedding and the class logits from a
//! single feature map, so query/positive/negative images share every weight.
//!
//! ## Design Note
//! Architectures are described by `StageSpec` lists rather than separate module types, which
//! keeps the record layout identical across zoo entries and lets `load_pretrained` work for
//! every name.

use std::path::Path;

use burn::module::{Ignored, Module};
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, Linear, LinearConfig, PaddingConfig2d};
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use burn::tensor::activation::{relu, silu};
use burn::tensor::{backend::Backend, Tensor};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("unknown model name \"{name}\". Available models are: {available}")]
    UnknownModel { name: String, available: String },
    #[error("model needs at least one class, got {0}")]
    NoClasses(usize),
    #[error("failed to load weights from {path}: {message}")]
    Load { path: String, message: String },
    #[error("failed to save weights to {path}: {message}")]
    Save { path: String, message: String },
}

/// Named architectures in the zoo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackboneKind {
    ConvNetS,
    ConvNetM,
    ResNetLite,
    RexNetLite,
}

/// One downsampling (or refining) stage of a backbone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageSpec {
    pub channels: usize,
    pub stride: usize,
    pub residual: bool,
}

const fn stage(channels: usize, stride: usize, residual: bool) -> StageSpec {
    StageSpec {
        channels,
        stride,
        residual,
    }
}

impl BackboneKind {
    pub const ALL: [BackboneKind; 4] = [
        BackboneKind::ConvNetS,
        BackboneKind::ConvNetM,
        BackboneKind::ResNetLite,
        BackboneKind::RexNetLite,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            BackboneKind::ConvNetS => "convnet_s",
            BackboneKind::ConvNetM => "convnet_m",
            BackboneKind::ResNetLite => "resnet_lite",
            BackboneKind::RexNetLite => "rexnet_lite",
        }
    }

    /// Resolve a zoo name. `rexnet_150` is accepted as an alias of `rexnet_lite`.
    pub fn from_name(name: &str) -> Result<Self, ModelError> {
        let lowered = name.trim().to_ascii_lowercase();
        if lowered == "rexnet_150" {
            return Ok(BackboneKind::RexNetLite);
        }
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.name() == lowered)
            .ok_or_else(|| ModelError::UnknownModel {
                name: name.to_string(),
                available: Self::available_names(),
            })
    }

    pub fn available_names() -> String {
        Self::ALL
            .iter()
            .map(|k| k.name())
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn stages(&self) -> Vec<StageSpec> {
        match self {
            BackboneKind::ConvNetS => vec![
                stage(16, 2, false),
                stage(32, 2, false),
                stage(64, 2, false),
            ],
            BackboneKind::ConvNetM => vec![
                stage(32, 2, false),
                stage(64, 2, false),
                stage(128, 2, false),
                stage(128, 1, false),
            ],
            BackboneKind::ResNetLite => vec![
                stage(32, 2, false),
                stage(64, 2, true),
                stage(128, 2, true),
                stage(256, 2, true),
            ],
            // Slowly widening channels, in the spirit of ReXNet.
            BackboneKind::RexNetLite => vec![
                stage(16, 2, false),
                stage(27, 2, true),
                stage(38, 1, true),
                stage(50, 2, true),
                stage(61, 1, true),
                stage(72, 2, true),
            ],
        }
    }

    /// Embedding dimension (channels of the last stage).
    pub fn feature_dim(&self) -> usize {
        self.stages().last().map(|s| s.channels).unwrap_or(3)
    }
}

impl std::fmt::Display for BackboneKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn conv3x3<B: Backend>(
    in_ch: usize,
    out_ch: usize,
    stride: usize,
    bias: bool,
    device: &B::Device,
) -> Conv2d<B> {
    Conv2dConfig::new([in_ch, out_ch], [3, 3])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .with_bias(bias)
        .init(device)
}

/// conv3x3 → BN → ReLU, optionally followed by a second conv and a residual shortcut.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv: Conv2d<B>,
    norm: BatchNorm<B, 2>,
    refine: Option<Conv2d<B>>,
    refine_norm: Option<BatchNorm<B, 2>>,
    shortcut: Option<Conv2d<B>>,
}

impl<B: Backend> ConvBlock<B> {
    pub fn new(in_ch: usize, spec: StageSpec, device: &B::Device) -> Self {
        let stride = spec.stride.max(1);
        let conv = conv3x3(in_ch, spec.channels, stride, false, device);
        let norm = BatchNormConfig::new(spec.channels).init(device);
        let (refine, refine_norm, shortcut) = if spec.residual {
            let refine = conv3x3(spec.channels, spec.channels, 1, false, device);
            let refine_norm = BatchNormConfig::new(spec.channels).init(device);
            let shortcut = if in_ch != spec.channels || stride != 1 {
                Some(
                    Conv2dConfig::new([in_ch, spec.channels], [1, 1])
                        .with_stride([stride, stride])
                        .with_padding(PaddingConfig2d::Valid)
                        .with_bias(false)
                        .init(device),
                )
            } else {
                None
            };
            (Some(refine), Some(refine_norm), shortcut)
        } else {
            (None, None, None)
        };
        Self {
            conv,
            norm,
            refine,
            refine_norm,
            shortcut,
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = relu(self.norm.forward(self.conv.forward(input.clone())));
        match (&self.refine, &self.refine_norm) {
            (Some(refine), Some(norm)) => {
                let y = norm.forward(refine.forward(x));
                let skip = match &self.shortcut {
                    Some(proj) => proj.forward(input),
                    None => input,
                };
                relu(y + skip)
            }
            _ => x,
        }
    }
}

/// Convolutional feature extractor: `[B, 3, H, W]` → `[B, C, h, w]`.
#[derive(Module, Debug)]
pub struct Backbone<B: Backend> {
    /// Optional 3→3 conv + SiLU input stem.
    adapter: Option<Conv2d<B>>,
    blocks: Vec<ConvBlock<B>>,
    out_channels: usize,
}

impl<B: Backend> Backbone<B> {
    pub fn new(kind: BackboneKind, conv_input: bool, device: &B::Device) -> Self {
        let adapter = conv_input.then(|| conv3x3(3, 3, 1, false, device));
        let mut blocks = Vec::new();
        let mut in_ch = 3;
        for spec in kind.stages() {
            blocks.push(ConvBlock::new(in_ch, spec, device));
            in_ch = spec.channels;
        }
        Self {
            adapter,
            blocks,
            out_channels: in_ch,
        }
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn has_adapter(&self) -> bool {
        self.adapter.is_some()
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = match &self.adapter {
            Some(conv) => silu(conv.forward(input)),
            None => input,
        };
        for block in &self.blocks {
            x = block.forward(x);
        }
        x
    }
}

#[derive(Debug, Clone)]
pub struct TripletNetConfig {
    pub backbone: BackboneKind,
    pub num_classes: usize,
    pub conv_input: bool,
}

impl TripletNetConfig {
    pub fn new(backbone: BackboneKind, num_classes: usize) -> Self {
        Self {
            backbone,
            num_classes,
            conv_input: false,
        }
    }

    pub fn from_name(name: &str, num_classes: usize) -> Result<Self, ModelError> {
        Ok(Self::new(BackboneKind::from_name(name)?, num_classes))
    }

    pub fn with_conv_input(mut self, conv_input: bool) -> Self {
        self.conv_input = conv_input;
        self
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<TripletNet<B>, ModelError> {
        if self.num_classes == 0 {
            return Err(ModelError::NoClasses(self.num_classes));
        }
        let backbone = Backbone::new(self.backbone, self.conv_input, device);
        let head = LinearConfig::new(backbone.out_channels(), self.num_classes).init(device);
        tracing::debug!(
            model = %self.backbone,
            classes = self.num_classes,
            embedding_dim = backbone.out_channels(),
            "built triplet net"
        );
        Ok(TripletNet {
            backbone,
            head,
            num_classes: self.num_classes,
            kind: Ignored(self.backbone),
        })
    }
}

/// Embedding and class logits for one image batch.
#[derive(Debug, Clone)]
pub struct EmbeddingOutput<B: Backend> {
    /// Globally pooled features, `[B, C]`.
    pub embeddings: Tensor<B, 2>,
    /// Class scores, `[B, K]`.
    pub logits: Tensor<B, 2>,
}

#[derive(Module, Debug)]
pub struct TripletNet<B: Backend> {
    backbone: Backbone<B>,
    head: Linear<B>,
    num_classes: usize,
    kind: Ignored<BackboneKind>,
}

impl<B: Backend> TripletNet<B> {
    pub fn kind(&self) -> BackboneKind {
        self.kind.0
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn embedding_dim(&self) -> usize {
        self.backbone.out_channels()
    }

    pub fn config(&self) -> TripletNetConfig {
        TripletNetConfig::new(self.kind(), self.num_classes)
            .with_conv_input(self.backbone.has_adapter())
    }

    /// Copy with its own batch-norm running statistics. `clone()` shares them with `self`,
    /// so train-mode forwards on a clone move the original's statistics too.
    pub fn fork(&self, device: &B::Device) -> Result<Self, ModelError> {
        Ok(self
            .config()
            .init(device)?
            .load_record(self.clone().into_record()))
    }

    pub fn forward_features(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        self.backbone.forward(images)
    }

    pub fn forward_head(&self, feature_map: Tensor<B, 4>) -> Tensor<B, 2> {
        self.head.forward(global_avg_pool(feature_map))
    }

    pub fn forward(&self, images: Tensor<B, 4>) -> EmbeddingOutput<B> {
        let fm = self.forward_features(images);
        let embeddings = global_avg_pool(fm);
        let logits = self.head.forward(embeddings.clone());
        EmbeddingOutput { embeddings, logits }
    }

    pub fn load_pretrained<P: AsRef<Path>>(
        self,
        path: P,
        device: &B::Device,
    ) -> Result<Self, ModelError> {
        let path = path.as_ref();
        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        let model = self
            .load_file(path, &recorder, device)
            .map_err(|e| ModelError::Load {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
        tracing::info!("loaded weights from {}", path.display());
        Ok(model)
    }

    pub fn save_weights<P: AsRef<Path>>(&self, path: P) -> Result<(), ModelError> {
        let path = path.as_ref();
        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        self.clone()
            .save_file(path, &recorder)
            .map_err(|e| ModelError::Save {
                path: path.display().to_string(),
                message: e.to_string(),
            })
    }
}

/// `[B, C, h, w]` → `[B, C]` by averaging over the spatial dims.
pub fn global_avg_pool<B: Backend>(feature_map: Tensor<B, 4>) -> Tensor<B, 2> {
    let [batch, channels, _, _] = feature_map.dims();
    feature_map
        .mean_dim(3)
        .mean_dim(2)
        .reshape([batch, channels])
}

pub mod prelude {
    pub use super::{
        Backbone, BackboneKind, EmbeddingOutput, ModelError, TripletNet, TripletNetConfig,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type B = NdArray<f32>;

    #[test]
    fn forward_shapes_for_every_zoo_entry() {
        let device = Default::default();
        for kind in BackboneKind::ALL {
            let net = TripletNetConfig::new(kind, 5).init::<B>(&device).unwrap();
            let images = Tensor::<B, 4>::zeros([2, 3, 32, 32], &device);
            let out = net.forward(images);
            assert_eq!(out.embeddings.dims(), [2, kind.feature_dim()], "{kind}");
            assert_eq!(out.logits.dims(), [2, 5], "{kind}");
        }
    }

    #[test]
    fn conv_input_adapter_keeps_shapes() {
        let device = Default::default();
        let net = TripletNetConfig::new(BackboneKind::ConvNetS, 3)
            .with_conv_input(true)
            .init::<B>(&device)
            .unwrap();
        let out = net.forward(Tensor::<B, 4>::ones([1, 3, 16, 16], &device));
        assert_eq!(out.embeddings.dims(), [1, 64]);
        assert_eq!(out.logits.dims(), [1, 3]);
    }

    #[test]
    fn head_matches_split_forward() {
        let device = Default::default();
        let net = TripletNetConfig::new(BackboneKind::ConvNetS, 4)
            .init::<B>(&device)
            .unwrap();
        let images = Tensor::<B, 4>::ones([1, 3, 16, 16], &device);
        let joint = net.forward(images.clone()).logits;
        let split = net.forward_head(net.forward_features(images));
        let diff: f32 = (joint - split).abs().sum().into_scalar();
        assert!(diff < 1e-5);
    }

    #[test]
    fn fork_keeps_running_stats_separate() {
        use burn::backend::Autodiff;
        use burn::module::AutodiffModule;
        use burn::tensor::Distribution;
        type AD = Autodiff<B>;

        let device = Default::default();
        let net = TripletNetConfig::new(BackboneKind::ConvNetS, 3)
            .with_conv_input(true)
            .init::<AD>(&device)
            .unwrap();
        let fixed = Tensor::<B, 4>::ones([1, 3, 16, 16], &device);
        let eval_logits = |n: &TripletNet<AD>| {
            n.valid()
                .forward(fixed.clone())
                .logits
                .into_data()
                .to_vec::<f32>()
                .unwrap()
        };
        let before = eval_logits(&net);

        let fork = TripletNet::fork(&net, &device).unwrap();
        assert!(fork.config().conv_input);
        assert_eq!(eval_logits(&fork), before);
        for i in 0..5 {
            let x = Tensor::<AD, 4>::random(
                [2, 3, 16, 16],
                Distribution::Normal(i as f64, 2.0),
                &device,
            );
            let _ = fork.forward(x);
        }
        assert_eq!(eval_logits(&net), before);
    }

    #[test]
    fn unknown_name_lists_available_models() {
        let err = BackboneKind::from_name("vit_giant").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("vit_giant"));
        assert!(msg.contains("resnet_lite"));
    }

    #[test]
    fn rexnet_150_alias_resolves() {
        assert_eq!(
            BackboneKind::from_name("rexnet_150").unwrap(),
            BackboneKind::RexNetLite
        );
        assert_eq!(
            BackboneKind::from_name("ConvNet_M").unwrap(),
            BackboneKind::ConvNetM
        );
    }

    #[test]
    fn zero_classes_rejected() {
        let device = Default::default();
        assert!(TripletNetConfig::new(BackboneKind::ConvNetS, 0)
            .init::<B>(&device)
            .is_err());
    }
}
