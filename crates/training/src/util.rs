use burn::backend::Autodiff;
use burn::module::AutodiffModule;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::{AdamWConfig, Optimizer, SgdConfig};
use burn::tensor::backend::Backend;
use clap::{Parser, ValueEnum};
use models::{TripletNet, TripletNetConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use triplet_dataset::{LoaderConfig, RoleTransforms, Split, SplitManifest, TripletLoader};

use crate::callbacks::MetricsSink;
use crate::config::{LabelSpace, OptimizerKind, TrainConfig};
use crate::metrics::EvalMetrics;
use crate::schedule::LrFinderConfig;
use crate::trainer::{FitOptions, FitReport, Trainer};
use crate::TrainBackend;

pub type ADBackend = Autodiff<TrainBackend>;

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum BackendKind {
    NdArray,
    Wgpu,
}

#[derive(Parser, Debug)]
#[command(
    name = "train",
    about = "Train a triplet cosine-embedding network with optional cross-entropy"
)]
pub struct TrainArgs {
    /// JSON config; when given it replaces the run flags below.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Directory for run folders (hparams, checkpoints).
    #[arg(long, default_value = "saved_models")]
    pub save_path: PathBuf,
    #[arg(long, default_value_t = 64)]
    pub batch_size: usize,
    /// Image root; overrides the manifest's `root`.
    #[arg(long)]
    pub ims_path: Option<PathBuf>,
    /// Split manifest (train/val/test JSON).
    #[arg(long, default_value = "data/splits.json")]
    pub split_manifest: PathBuf,
    /// Square input side in pixels.
    #[arg(long, default_value_t = 224)]
    pub input_size: u32,
    /// Backbone name from the model zoo.
    #[arg(long, default_value = "rexnet_150")]
    pub model_name: String,
    /// Adam or SGD.
    #[arg(long, default_value = "Adam")]
    pub optimizer_name: String,
    #[arg(long, default_value_t = 1e-3)]
    pub learning_rate: f64,
    /// Defaults to 0.01 for Adam and no decay for SGD.
    #[arg(long)]
    pub weight_decay: Option<f64>,
    /// Use the triplet (cosine embedding) loss.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub only_feature_embeddings: bool,
    /// Use the cross-entropy loss on class logits.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub only_target_labels: bool,
    #[arg(long, value_enum, default_value_t = LabelSpace::Product)]
    pub label_space: LabelSpace,
    /// Maximum number of epochs.
    #[arg(long, default_value_t = 300)]
    pub epochs: usize,
    /// Early-stopping patience in epochs.
    #[arg(long, default_value_t = 10)]
    pub patience: usize,
    /// Epochs at which the learning rate is multiplied by `--lr-gamma`.
    #[arg(long, value_delimiter = ',', default_value = "5,10,15,20,25,30,35,40,45,50,55,60,65,70")]
    pub lr_milestones: Vec<usize>,
    #[arg(long, default_value_t = 0.01)]
    pub lr_gamma: f64,
    #[arg(long, default_value_t = 42)]
    pub seed: u64,
    /// Skip the LR range test and train with `--learning-rate`.
    #[arg(long)]
    pub no_lr_find: bool,
    /// Disable train-time augmentation (resize only).
    #[arg(long)]
    pub no_augment: bool,
    /// Prepend a 3x3 conv stem to the backbone.
    #[arg(long)]
    pub conv_input: bool,
    #[arg(long, default_value_t = crate::loss::DEFAULT_MARGIN)]
    pub margin: f32,
    #[arg(long, default_value_t = 15)]
    pub log_every_n_steps: usize,
    /// Backend to use (ndarray or wgpu if enabled).
    #[arg(long, value_enum, default_value_t = BackendKind::NdArray)]
    pub backend: BackendKind,
    /// Append per-step/epoch metrics as JSONL.
    #[arg(long)]
    pub metrics_out: Option<PathBuf>,
    /// Weights to initialise the network from before training.
    #[arg(long)]
    pub pretrained: Option<PathBuf>,
    /// Trained weights; when the file exists training is skipped and only the test runs.
    #[arg(long)]
    pub pretrained_checkpoint: Option<PathBuf>,
    #[arg(long, default_value = "results")]
    pub results_dir: PathBuf,
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl TrainArgs {
    pub fn to_config(&self) -> anyhow::Result<TrainConfig> {
        if let Some(path) = &self.config {
            tracing::info!("loading config from {}", path.display());
            return TrainConfig::load(path);
        }
        Ok(TrainConfig {
            model_name: self.model_name.clone(),
            optimizer_name: self.optimizer_name.clone(),
            learning_rate: self.learning_rate,
            weight_decay: self.weight_decay,
            batch_size: self.batch_size,
            input_size: self.input_size,
            epochs: self.epochs,
            patience: self.patience,
            lr_milestones: self.lr_milestones.clone(),
            lr_gamma: self.lr_gamma,
            seed: self.seed,
            lr_find: !self.no_lr_find,
            only_feature_embeddings: self.only_feature_embeddings,
            only_target_labels: self.only_target_labels,
            label_space: self.label_space,
            conv_input: self.conv_input,
            margin: self.margin,
            augment: !self.no_augment,
            log_every_n_steps: self.log_every_n_steps,
            save_path: self.save_path.clone(),
            split_manifest: self.split_manifest.clone(),
            ims_path: self.ims_path.clone(),
            results_dir: self.results_dir.clone(),
            metrics_out: self.metrics_out.clone(),
            pretrained: self.pretrained.clone(),
            pretrained_checkpoint: self.pretrained_checkpoint.clone(),
        })
    }
}

pub fn init_tracing(level: &str) {
    let filter = level
        .parse::<tracing_subscriber::filter::LevelFilter>()
        .unwrap_or(tracing_subscriber::filter::LevelFilter::INFO);
    // A subscriber may already be installed (tests, embedding binaries).
    let _ = tracing_subscriber::fmt()
        .with_max_level(filter)
        .with_target(false)
        .try_init();
}

pub fn validate_backend_choice(kind: BackendKind) -> anyhow::Result<()> {
    let built_wgpu = cfg!(feature = "backend-wgpu");
    match (kind, built_wgpu) {
        (BackendKind::Wgpu, false) => {
            anyhow::bail!("backend-wgpu feature not enabled; rebuild with --features backend-wgpu or choose ndarray backend")
        }
        (BackendKind::NdArray, true) => {
            tracing::warn!("built with backend-wgpu; training will still use the WGPU backend despite --backend ndarray");
        }
        _ => {}
    }
    Ok(())
}

/// Test-phase numbers as written to the results file.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TestResults {
    pub test_loss: f32,
    pub test_sim_scores: f32,
    pub test_top1: f32,
    pub test_top3: f32,
}

impl From<&EvalMetrics> for TestResults {
    fn from(m: &EvalMetrics) -> Self {
        Self {
            test_loss: m.loss,
            test_sim_scores: m.cos_sims,
            test_top1: m.top1,
            test_top3: m.top3,
        }
    }
}

/// `{dir}/{model}_{optimizer}_{lr}_{loss}_{top1}_{top3}_results.json`, named with the
/// configured rate even when the LR finder tuned it.
pub fn results_path(dir: &Path, cfg: &TrainConfig, results: &TestResults) -> PathBuf {
    dir.join(format!(
        "{}_{}_{}_{:.4}_{:.4}_{:.4}_results.json",
        cfg.model_name,
        cfg.optimizer_name,
        cfg.learning_rate,
        results.test_loss,
        results.test_top1,
        results.test_top3
    ))
}

pub fn write_results(path: &Path, results: &TestResults) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, serde_json::to_string_pretty(results)?)
        .map_err(|e| anyhow::anyhow!("failed to write results to {}: {e}", path.display()))
}

pub fn load_manifest(path: &Path, ims_path: Option<&Path>) -> anyhow::Result<SplitManifest> {
    let manifest = SplitManifest::load(path)
        .map_err(|e| anyhow::anyhow!("failed to load split manifest {}: {e}", path.display()))?;
    Ok(match ims_path {
        Some(root) => manifest.with_root(root),
        None => manifest,
    })
}

pub fn num_classes(manifest: &SplitManifest, label_space: LabelSpace) -> usize {
    match label_space {
        LabelSpace::Product => manifest.num_products(),
        LabelSpace::Category => manifest.num_categories(),
    }
}

/// Unshuffled loader over one split with resize-only transforms.
pub fn eval_loader(
    manifest: &SplitManifest,
    split: Split,
    batch_size: usize,
    input_size: u32,
    seed: u64,
) -> anyhow::Result<TripletLoader> {
    let cfg = LoaderConfig {
        batch_size,
        shuffle: false,
        drop_last: false,
        random_pairs: false,
        seed: Some(seed),
    };
    let size = (input_size, input_size);
    Ok(TripletLoader::new(
        manifest.index(split)?,
        cfg,
        RoleTransforms::plain(size),
    )?)
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub learning_rate: f64,
    pub test: EvalMetrics,
    pub results_path: PathBuf,
    pub fit: Option<FitReport>,
}

pub fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    validate_backend_choice(args.backend)?;
    let cfg = args.to_config()?;
    let outcome = train_and_test(&cfg)?;
    println!(
        "test_loss {:.4}  test_sim_scores {:.4}  test_top1 {:.4}  test_top3 {:.4}",
        outcome.test.loss, outcome.test.cos_sims, outcome.test.top1, outcome.test.top3
    );
    println!("results written to {}", outcome.results_path.display());
    Ok(())
}

/// Full run: (LR find, fit, best checkpoint) then test, results file, hparams.
pub fn train_and_test(cfg: &TrainConfig) -> anyhow::Result<RunOutcome> {
    cfg.validate()?;
    let loss_mode = cfg.loss_mode()?;
    let optimizer = cfg.optimizer()?;
    let backbone = cfg.backbone()?;
    tracing::info!(
        model = backbone.name(),
        optimizer = %optimizer,
        loss = loss_mode.describe(),
        label_space = cfg.label_space.as_str(),
        "starting run {}",
        cfg.save_name()
    );

    let device = <ADBackend as Backend>::Device::default();
    <ADBackend as Backend>::seed(cfg.seed);

    let manifest = load_manifest(&cfg.split_manifest, cfg.ims_path.as_deref())?;
    let classes = num_classes(&manifest, cfg.label_space);
    let size = (cfg.input_size, cfg.input_size);
    let mut test_loader = eval_loader(&manifest, Split::Test, cfg.batch_size, cfg.input_size, cfg.seed)?;

    let run_dir = cfg.run_dir();
    fs::create_dir_all(&run_dir)?;
    cfg.save(&run_dir.join("hparams.json"))?;

    let sink = MetricsSink::new(cfg.metrics_out.clone(), cfg.run_name(cfg.learning_rate));
    let trainer = Trainer::<ADBackend>::new(loss_mode, cfg.margin, cfg.label_space, sink, device);
    let net_cfg = TripletNetConfig::new(backbone, classes).with_conv_input(cfg.conv_input);

    if let Some(ckpt) = cfg.pretrained_checkpoint.as_ref().filter(|p| p.exists()) {
        tracing::info!("trained weights found at {}; skipping training", ckpt.display());
        let model = net_cfg
            .init::<TrainBackend>(trainer.device())?
            .load_pretrained(ckpt, trainer.device())?;
        let test = trainer.test(&model, &mut test_loader)?;
        let path = finish_results(cfg, &test)?;
        return Ok(RunOutcome {
            learning_rate: cfg.learning_rate,
            test,
            results_path: path,
            fit: None,
        });
    }
    if let Some(ckpt) = &cfg.pretrained_checkpoint {
        tracing::warn!("no checkpoint at {}; training from scratch", ckpt.display());
    }

    let transforms = if cfg.augment {
        RoleTransforms::sketch_default(size)
    } else {
        RoleTransforms::plain(size)
    };
    let train_cfg = LoaderConfig {
        batch_size: cfg.batch_size,
        shuffle: true,
        drop_last: true,
        random_pairs: true,
        seed: Some(cfg.seed),
    };
    let mut train_loader = TripletLoader::new(manifest.index(Split::Train)?, train_cfg, transforms)?;
    let mut val_loader = eval_loader(&manifest, Split::Val, cfg.batch_size, cfg.input_size, cfg.seed)?;
    tracing::info!(
        train = train_loader.len(),
        val = val_loader.len(),
        test = test_loader.len(),
        classes,
        "loaded splits"
    );

    let mut model = net_cfg.init::<ADBackend>(trainer.device())?;
    if let Some(path) = &cfg.pretrained {
        model = model.load_pretrained(path, trainer.device())?;
    }

    let weight_decay = optimizer.weight_decay(cfg.weight_decay);
    tracing::info!(?weight_decay, "optimizer weight decay");
    let (model, report, lr) = match optimizer {
        OptimizerKind::Adam => fit_with(cfg, &trainer, model, &mut train_loader, &mut val_loader, || {
            AdamWConfig::new()
                .with_weight_decay(weight_decay.unwrap_or(0.0))
                .init::<ADBackend, TripletNet<ADBackend>>()
        })?,
        OptimizerKind::Sgd => fit_with(cfg, &trainer, model, &mut train_loader, &mut val_loader, || {
            SgdConfig::new()
                .with_weight_decay(weight_decay.map(WeightDecayConfig::new))
                .init::<ADBackend, TripletNet<ADBackend>>()
        })?,
    };

    let test_model = match &report.best_checkpoint {
        Some(path) => net_cfg
            .init::<TrainBackend>(trainer.device())?
            .load_pretrained(path, trainer.device())?,
        None => model.valid(),
    };
    let test = trainer.test(&test_model, &mut test_loader)?;
    let path = finish_results(cfg, &test)?;
    Ok(RunOutcome {
        learning_rate: lr,
        test,
        results_path: path,
        fit: Some(report),
    })
}

fn fit_with<O, F>(
    cfg: &TrainConfig,
    trainer: &Trainer<ADBackend>,
    model: TripletNet<ADBackend>,
    train: &mut TripletLoader,
    val: &mut TripletLoader,
    make_optim: F,
) -> anyhow::Result<(TripletNet<ADBackend>, FitReport, f64)>
where
    O: Optimizer<TripletNet<ADBackend>, ADBackend>,
    F: Fn() -> O,
{
    let mut lr = cfg.learning_rate;
    if cfg.lr_find {
        let sweep = trainer.find_lr(&model, make_optim(), train, LrFinderConfig::default())?;
        match sweep.suggestion() {
            Some(suggested) => {
                tracing::info!("lr finder suggests {suggested:e} (configured {lr:e})");
                lr = suggested;
            }
            None => tracing::warn!("lr finder produced no suggestion; keeping {lr:e}"),
        }
    }
    let opts = FitOptions {
        epochs: cfg.epochs,
        patience: cfg.patience,
        log_every_n_steps: cfg.log_every_n_steps,
        checkpoint_dir: cfg.checkpoint_dir(),
    };
    let (model, report) = trainer.fit(model, make_optim(), cfg.scheduler(lr), train, val, &opts)?;
    tracing::info!(
        epochs = report.epochs_run,
        stopped_early = report.stopped_early,
        best_val_top1 = report.best_val_top1.unwrap_or(f64::NAN),
        "training finished"
    );
    Ok((model, report, lr))
}

fn finish_results(cfg: &TrainConfig, test: &EvalMetrics) -> anyhow::Result<PathBuf> {
    let results = TestResults::from(test);
    let path = results_path(&cfg.results_dir, cfg, &results);
    write_results(&path, &results)?;
    tracing::info!("results saved to {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_map_onto_config() {
        let args = TrainArgs::parse_from([
            "train",
            "--model-name",
            "convnet_s",
            "--optimizer-name",
            "SGD",
            "--only-target-labels",
            "false",
            "--lr-milestones",
            "2,4",
            "--no-lr-find",
            "--label-space",
            "category",
        ]);
        let cfg = args.to_config().unwrap();
        assert_eq!(cfg.model_name, "convnet_s");
        assert_eq!(cfg.optimizer().unwrap(), OptimizerKind::Sgd);
        assert!(cfg.only_feature_embeddings);
        assert!(!cfg.only_target_labels);
        assert_eq!(cfg.lr_milestones, vec![2, 4]);
        assert!(!cfg.lr_find);
        assert_eq!(cfg.label_space, LabelSpace::Category);
        assert_eq!(cfg.epochs, 300);
        assert_eq!(cfg.seed, 42);
        assert_eq!(cfg.weight_decay, None);
    }

    #[test]
    fn default_milestones_match_schedule() {
        let args = TrainArgs::parse_from(["train"]);
        assert_eq!(
            args.lr_milestones,
            crate::schedule::MultiStepLr::default_milestones()
        );
    }

    #[test]
    fn results_file_name_encodes_run() {
        let cfg = TrainConfig {
            model_name: "convnet_s".into(),
            ..Default::default()
        };
        let r = TestResults {
            test_loss: 0.5,
            test_sim_scores: 0.9,
            test_top1: 0.25,
            test_top3: 0.75,
        };
        let p = results_path(Path::new("results"), &cfg, &r);
        assert_eq!(
            p,
            PathBuf::from("results/convnet_s_Adam_0.001_0.5000_0.2500_0.7500_results.json")
        );
    }

    #[test]
    fn wgpu_requires_feature() {
        if !cfg!(feature = "backend-wgpu") {
            assert!(validate_backend_choice(BackendKind::Wgpu).is_err());
        }
        assert!(validate_backend_choice(BackendKind::NdArray).is_ok());
    }
}
