//! Run configuration shared by the CLIs and the training loop.

use anyhow::Context;
use clap::ValueEnum;
use models::BackboneKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use triplet_dataset::TripletBatch;

use burn::tensor::{backend::Backend, Int, Tensor};

use crate::loss::LossMode;
use crate::schedule::MultiStepLr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizerKind {
    Adam,
    #[serde(rename = "SGD")]
    Sgd,
}

impl OptimizerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptimizerKind::Adam => "Adam",
            OptimizerKind::Sgd => "SGD",
        }
    }

    /// Decay actually applied: the configured value, else AdamW's 0.01 and none for SGD.
    pub fn weight_decay(self, configured: Option<f64>) -> Option<f32> {
        match (self, configured) {
            (_, Some(wd)) => Some(wd as f32),
            (OptimizerKind::Adam, None) => Some(0.01),
            (OptimizerKind::Sgd, None) => None,
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OptimizerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "adam" | "adamw" => Ok(OptimizerKind::Adam),
            "sgd" => Ok(OptimizerKind::Sgd),
            _ => anyhow::bail!("Unknown optimizer: \"{s}\" (expected Adam or SGD)"),
        }
    }
}

/// Which label index feeds cross-entropy and top-k.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelSpace {
    Product,
    Category,
}

impl LabelSpace {
    pub fn as_str(&self) -> &'static str {
        match self {
            LabelSpace::Product => "product",
            LabelSpace::Category => "category",
        }
    }

    pub fn labels<B: Backend>(&self, batch: &TripletBatch<B>) -> (Tensor<B, 1, Int>, Vec<usize>) {
        match self {
            LabelSpace::Product => (batch.products.clone(), batch.product_ids.clone()),
            LabelSpace::Category => (batch.categories.clone(), batch.category_ids.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub model_name: String,
    pub optimizer_name: String,
    pub learning_rate: f64,
    pub weight_decay: Option<f64>,
    pub batch_size: usize,
    pub input_size: u32,
    pub epochs: usize,
    pub patience: usize,
    pub lr_milestones: Vec<usize>,
    pub lr_gamma: f64,
    pub seed: u64,
    pub lr_find: bool,
    pub only_feature_embeddings: bool,
    pub only_target_labels: bool,
    pub label_space: LabelSpace,
    pub conv_input: bool,
    pub margin: f32,
    pub augment: bool,
    pub log_every_n_steps: usize,
    pub save_path: PathBuf,
    pub split_manifest: PathBuf,
    pub ims_path: Option<PathBuf>,
    pub results_dir: PathBuf,
    pub metrics_out: Option<PathBuf>,
    pub pretrained: Option<PathBuf>,
    pub pretrained_checkpoint: Option<PathBuf>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            model_name: "rexnet_150".into(),
            optimizer_name: "Adam".into(),
            learning_rate: 1e-3,
            weight_decay: None,
            batch_size: 64,
            input_size: 224,
            epochs: 300,
            patience: 10,
            lr_milestones: MultiStepLr::default_milestones(),
            lr_gamma: 0.01,
            seed: 42,
            lr_find: true,
            only_feature_embeddings: true,
            only_target_labels: true,
            label_space: LabelSpace::Product,
            conv_input: false,
            margin: crate::loss::DEFAULT_MARGIN,
            augment: true,
            log_every_n_steps: 15,
            save_path: PathBuf::from("saved_models"),
            split_manifest: PathBuf::from("data/splits.json"),
            ims_path: None,
            results_dir: PathBuf::from("results"),
            metrics_out: None,
            pretrained: None,
            pretrained_checkpoint: None,
        }
    }
}

impl TrainConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("writing {}", path.display()))
    }

    pub fn loss_mode(&self) -> anyhow::Result<LossMode> {
        LossMode::new(self.only_feature_embeddings, self.only_target_labels)
    }

    pub fn optimizer(&self) -> anyhow::Result<OptimizerKind> {
        self.optimizer_name.parse()
    }

    pub fn backbone(&self) -> anyhow::Result<BackboneKind> {
        Ok(BackboneKind::from_name(&self.model_name)?)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.loss_mode()?;
        self.optimizer()?;
        self.backbone()?;
        if self.batch_size == 0 {
            anyhow::bail!("batch size must be positive");
        }
        if self.input_size < 8 {
            anyhow::bail!("input size must be at least 8, got {}", self.input_size);
        }
        if self.epochs == 0 {
            anyhow::bail!("epochs must be positive");
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            anyhow::bail!("learning rate must be positive, got {}", self.learning_rate);
        }
        if !(self.lr_gamma.is_finite() && self.lr_gamma > 0.0) {
            anyhow::bail!("lr gamma must be positive, got {}", self.lr_gamma);
        }
        if self.log_every_n_steps == 0 {
            anyhow::bail!("log_every_n_steps must be positive");
        }
        Ok(())
    }

    /// `{model}_{optimizer}_{lr}`.
    pub fn save_name(&self) -> String {
        format!(
            "{}_{}_{}",
            self.model_name, self.optimizer_name, self.learning_rate
        )
    }

    pub fn run_dir(&self) -> PathBuf {
        self.save_path.join(self.save_name())
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.run_dir().join("checkpoints")
    }

    /// `lr={lr}-gamma={gamma}-{milestones}`.
    pub fn run_name(&self, lr: f64) -> String {
        format!("lr={lr}-gamma={}-{:?}", self.lr_gamma, self.lr_milestones)
    }

    pub fn scheduler(&self, base_lr: f64) -> MultiStepLr {
        MultiStepLr::new(base_lr, self.lr_milestones.clone(), self.lr_gamma)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = TrainConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.backbone().unwrap(), BackboneKind::RexNetLite);
        assert_eq!(cfg.optimizer().unwrap(), OptimizerKind::Adam);
        assert_eq!(cfg.save_name(), "rexnet_150_Adam_0.001");
        assert_eq!(
            cfg.checkpoint_dir(),
            PathBuf::from("saved_models/rexnet_150_Adam_0.001/checkpoints")
        );
        assert_eq!(
            cfg.run_name(0.5),
            "lr=0.5-gamma=0.01-[5, 10, 15, 20, 25, 30, 35, 40, 45, 50, 55, 60, 65, 70]"
        );
    }

    #[test]
    fn unknown_optimizer_and_model_rejected() {
        let cfg = TrainConfig {
            optimizer_name: "RMSprop".into(),
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("Unknown optimizer"), "{err}");

        let cfg = TrainConfig {
            model_name: "vit_huge".into(),
            ..Default::default()
        };
        assert!(cfg.validate().unwrap_err().to_string().contains("vit_huge"));
        assert_eq!("sgd".parse::<OptimizerKind>().unwrap(), OptimizerKind::Sgd);
    }

    #[test]
    fn weight_decay_defaults_follow_optimizer() {
        let cfg = TrainConfig::default();
        assert_eq!(cfg.weight_decay, None);
        assert_eq!(OptimizerKind::Adam.weight_decay(cfg.weight_decay), Some(0.01));
        assert_eq!(OptimizerKind::Sgd.weight_decay(cfg.weight_decay), None);
        assert_eq!(OptimizerKind::Sgd.weight_decay(Some(1e-4)), Some(1e-4));
        assert_eq!(OptimizerKind::Adam.weight_decay(Some(0.0)), Some(0.0));
    }

    #[test]
    fn no_loss_rejected() {
        let cfg = TrainConfig {
            only_feature_embeddings: false,
            only_target_labels: false,
            ..Default::default()
        };
        assert!(cfg
            .validate()
            .unwrap_err()
            .to_string()
            .starts_with("Please choose at least one loss function"));
    }

    #[test]
    fn config_roundtrips_through_json() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("run").join("hparams.json");
        let cfg = TrainConfig {
            label_space: LabelSpace::Category,
            lr_find: false,
            ..Default::default()
        };
        cfg.save(&path).unwrap();
        let back = TrainConfig::load(&path).unwrap();
        assert_eq!(back.label_space, LabelSpace::Category);
        assert!(!back.lr_find);
        assert_eq!(back.lr_milestones, cfg.lr_milestones);

        // Missing keys fall back to defaults.
        fs::write(&path, r#"{"model_name":"convnet_s"}"#).unwrap();
        let partial = TrainConfig::load(&path).unwrap();
        assert_eq!(partial.model_name, "convnet_s");
        assert_eq!(partial.patience, 10);
    }
}
