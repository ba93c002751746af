//! Fit / validate / test loop for the triplet network.

use std::path::PathBuf;

use burn::module::AutodiffModule;
use burn::optim::{GradientsParams, Optimizer};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{Int, Tensor};
use models::{EmbeddingOutput, TripletNet};
use serde::Serialize;
use serde_json::json;
use triplet_dataset::{TripletBatch, TripletLoader};

use crate::callbacks::{BestCheckpoint, EarlyStopping, MetricsSink, MonitorMode};
use crate::config::LabelSpace;
use crate::loss::{LossBreakdown, LossMode, TripletCriterion};
use crate::metrics::{cosine_similarity_rows, topk_hits, EvalMetrics, MetricAccumulator};
use crate::schedule::{LrFinderConfig, LrFinderResult, LrRangeTest, MultiStepLr};

/// Monitored by checkpointing and early stopping.
pub const MONITOR: &str = "val_top1";

/// Shared-weight forward of the three roles plus the labels in use.
pub struct RoleForward<B: Backend> {
    pub query: EmbeddingOutput<B>,
    pub positive: EmbeddingOutput<B>,
    pub negative: EmbeddingOutput<B>,
    pub labels: Tensor<B, 1, Int>,
    pub label_ids: Vec<usize>,
}

pub fn forward_roles<B: Backend>(
    model: &TripletNet<B>,
    batch: &TripletBatch<B>,
    label_space: LabelSpace,
) -> RoleForward<B> {
    let (labels, label_ids) = label_space.labels(batch);
    RoleForward {
        query: model.forward(batch.queries.clone()),
        positive: model.forward(batch.positives.clone()),
        negative: model.forward(batch.negatives.clone()),
        labels,
        label_ids,
    }
}

fn to_host<B: Backend>(t: Tensor<B, 2>) -> Vec<f32> {
    t.into_data().to_vec::<f32>().unwrap_or_default()
}

/// Query/positive similarities and top-1/top-3 hits for one forward.
pub fn retrieval_stats<B: Backend>(fw: &RoleForward<B>) -> (Vec<f32>, (usize, usize)) {
    let [_, dim] = fw.query.embeddings.dims();
    let [_, classes] = fw.query.logits.dims();
    let q = to_host(fw.query.embeddings.clone());
    let p = to_host(fw.positive.embeddings.clone());
    let sims = cosine_similarity_rows(&q, &p, dim);
    let logits = to_host(fw.query.logits.clone());
    (sims, topk_hits(&logits, classes, &fw.label_ids))
}

#[derive(Debug, Clone)]
pub struct StepStats {
    pub loss: LossBreakdown,
    pub similarities: Vec<f32>,
    pub hits: (usize, usize),
}

/// Mean loss and metrics over every batch of `loader` (one epoch).
pub fn evaluate<B: Backend>(
    model: &TripletNet<B>,
    criterion: &TripletCriterion<B>,
    loader: &mut TripletLoader,
    label_space: LabelSpace,
    device: &B::Device,
) -> anyhow::Result<EvalMetrics> {
    let mut acc = MetricAccumulator::new();
    while let Some(batch) = loader.next_batch::<B>(device)? {
        let fw = forward_roles(model, &batch, label_space);
        let loss = criterion
            .forward(&fw.query, &fw.positive, &fw.negative, fw.labels.clone())
            .breakdown();
        tracing::debug!(
            triplet = ?loss.triplet,
            cross_entropy = ?loss.cross_entropy,
            total = loss.total,
            "val batch loss"
        );
        let (sims, hits) = retrieval_stats(&fw);
        acc.push(loss.total, &sims, hits);
    }
    loader.reset();
    if acc.batches() == 0 {
        anyhow::bail!(
            "evaluation split produced no batches (batch size {})",
            loader.batch_size()
        );
    }
    Ok(acc.finish())
}

/// Gather the whole split first, then score it as one set.
pub fn test_gathered<B: Backend>(
    model: &TripletNet<B>,
    criterion: &TripletCriterion<B>,
    loader: &mut TripletLoader,
    label_space: LabelSpace,
    device: &B::Device,
) -> anyhow::Result<EvalMetrics> {
    let mut q_emb = Vec::new();
    let mut q_logits = Vec::new();
    let mut p_emb = Vec::new();
    let mut p_logits = Vec::new();
    let mut n_emb = Vec::new();
    let mut n_logits = Vec::new();
    let mut labels = Vec::new();
    let mut label_ids = Vec::new();
    while let Some(batch) = loader.next_batch::<B>(device)? {
        let fw = forward_roles(model, &batch, label_space);
        q_emb.push(fw.query.embeddings);
        q_logits.push(fw.query.logits);
        p_emb.push(fw.positive.embeddings);
        p_logits.push(fw.positive.logits);
        n_emb.push(fw.negative.embeddings);
        n_logits.push(fw.negative.logits);
        labels.push(fw.labels);
        label_ids.extend(fw.label_ids);
    }
    loader.reset();
    if labels.is_empty() {
        anyhow::bail!("test split produced no batches");
    }

    let fw = RoleForward {
        query: EmbeddingOutput {
            embeddings: Tensor::cat(q_emb, 0),
            logits: Tensor::cat(q_logits, 0),
        },
        positive: EmbeddingOutput {
            embeddings: Tensor::cat(p_emb, 0),
            logits: Tensor::cat(p_logits, 0),
        },
        negative: EmbeddingOutput {
            embeddings: Tensor::cat(n_emb, 0),
            logits: Tensor::cat(n_logits, 0),
        },
        labels: Tensor::cat(labels, 0),
        label_ids,
    };
    // Mean-reduced terms over the gathered set equal the mean per-sample loss.
    let loss = criterion
        .forward(&fw.query, &fw.positive, &fw.negative, fw.labels.clone())
        .breakdown();
    let (sims, hits) = retrieval_stats(&fw);
    let mut acc = MetricAccumulator::new();
    acc.push(loss.total, &sims, hits);
    Ok(acc.finish())
}

#[derive(Debug, Clone)]
pub struct FitOptions {
    pub epochs: usize,
    pub patience: usize,
    pub log_every_n_steps: usize,
    pub checkpoint_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub lr: f64,
    pub train_loss: f32,
    pub val: EvalMetrics,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FitReport {
    pub epochs_run: usize,
    pub stopped_early: bool,
    pub best_checkpoint: Option<PathBuf>,
    pub best_val_top1: Option<f64>,
    pub history: Vec<EpochRecord>,
}

pub struct Trainer<B: AutodiffBackend> {
    device: B::Device,
    label_space: LabelSpace,
    criterion: TripletCriterion<B>,
    eval_criterion: TripletCriterion<B::InnerBackend>,
    sink: MetricsSink,
}

impl<B: AutodiffBackend> Trainer<B> {
    pub fn new(
        mode: LossMode,
        margin: f32,
        label_space: LabelSpace,
        sink: MetricsSink,
        device: B::Device,
    ) -> Self {
        Self {
            criterion: TripletCriterion::new(mode, &device).with_margin(margin),
            eval_criterion: TripletCriterion::new(mode, &device).with_margin(margin),
            device,
            label_space,
            sink,
        }
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn eval_criterion(&self) -> &TripletCriterion<B::InnerBackend> {
        &self.eval_criterion
    }

    pub fn sink(&self) -> &MetricsSink {
        &self.sink
    }

    /// One optimisation step; returns the updated model.
    pub fn train_step<O>(
        &self,
        model: TripletNet<B>,
        optim: &mut O,
        batch: &TripletBatch<B>,
        lr: f64,
    ) -> (TripletNet<B>, StepStats)
    where
        O: Optimizer<TripletNet<B>, B>,
    {
        let fw = forward_roles(&model, batch, self.label_space);
        let out = self
            .criterion
            .forward(&fw.query, &fw.positive, &fw.negative, fw.labels.clone());
        let (similarities, hits) = retrieval_stats(&fw);
        let stats = StepStats {
            loss: out.breakdown(),
            similarities,
            hits,
        };
        let grads = GradientsParams::from_grads(out.total.backward(), &model);
        (optim.step(lr, model, grads), stats)
    }

    /// LR range test on a fork of `model`; `model` itself (weights and batch-norm
    /// statistics) is left as it was. Pass a fresh optimizer.
    pub fn find_lr<O>(
        &self,
        model: &TripletNet<B>,
        mut optim: O,
        loader: &mut TripletLoader,
        cfg: LrFinderConfig,
    ) -> anyhow::Result<LrFinderResult>
    where
        O: Optimizer<TripletNet<B>, B>,
    {
        let mut model = model.fork(&self.device)?;
        let mut sweep = LrRangeTest::new(cfg);
        while let Some(lr) = sweep.next_lr() {
            let batch = match loader.next_batch::<B>(&self.device)? {
                Some(batch) => batch,
                None => {
                    loader.reset();
                    loader.next_batch::<B>(&self.device)?.ok_or_else(|| {
                        anyhow::anyhow!("training split yields no full batch for the lr finder")
                    })?
                }
            };
            let (next, stats) = self.train_step(model, &mut optim, &batch, lr);
            model = next;
            sweep.record(stats.loss.total as f64);
        }
        loader.reset();
        let result = sweep.finish();
        self.sink.log(
            "lr_find",
            json!({ "lrs": result.lrs, "losses": result.losses }),
        );
        Ok(result)
    }

    pub fn validate(
        &self,
        model: &TripletNet<B::InnerBackend>,
        loader: &mut TripletLoader,
    ) -> anyhow::Result<EvalMetrics> {
        evaluate(model, &self.eval_criterion, loader, self.label_space, &self.device)
    }

    pub fn test(
        &self,
        model: &TripletNet<B::InnerBackend>,
        loader: &mut TripletLoader,
    ) -> anyhow::Result<EvalMetrics> {
        let metrics = test_gathered(
            model,
            &self.eval_criterion,
            loader,
            self.label_space,
            &self.device,
        )?;
        self.sink.log(
            "test",
            json!({
                "test_loss": metrics.loss,
                "test_sim_scores": metrics.cos_sims,
                "test_top1": metrics.top1,
                "test_top3": metrics.top3,
            }),
        );
        Ok(metrics)
    }

    /// Train until `epochs` or early stop, keeping the best checkpoint by `val_top1`.
    pub fn fit<O>(
        &self,
        mut model: TripletNet<B>,
        mut optim: O,
        mut scheduler: MultiStepLr,
        train: &mut TripletLoader,
        val: &mut TripletLoader,
        opts: &FitOptions,
    ) -> anyhow::Result<(TripletNet<B>, FitReport)>
    where
        O: Optimizer<TripletNet<B>, B>,
    {
        let mut early = EarlyStopping::new(MONITOR, MonitorMode::Max, opts.patience);
        let mut best = BestCheckpoint::new(&opts.checkpoint_dir, MonitorMode::Max);
        let mut report = FitReport::default();
        let mut global_step = 0usize;
        let log_every = opts.log_every_n_steps.max(1);

        for epoch in 0..opts.epochs {
            let lr = scheduler.current();
            self.sink.log("lr", json!({ "epoch": epoch, "lr": lr }));

            let mut train_acc = MetricAccumulator::new();
            while let Some(batch) = train.next_batch::<B>(&self.device)? {
                let (next, stats) = self.train_step(model, &mut optim, &batch, lr);
                model = next;
                global_step += 1;
                train_acc.push(stats.loss.total, &stats.similarities, stats.hits);
                if global_step % log_every == 0 {
                    tracing::info!(epoch, step = global_step, loss = stats.loss.total, "train");
                    self.sink.log(
                        "step",
                        json!({
                            "epoch": epoch,
                            "step": global_step,
                            "train_loss": stats.loss.total,
                            "triplet_loss": stats.loss.triplet,
                            "ce_loss": stats.loss.cross_entropy,
                        }),
                    );
                }
            }
            train.reset();
            if train_acc.batches() == 0 {
                anyhow::bail!(
                    "training split yields no full batch of size {}",
                    train.batch_size()
                );
            }
            let train_metrics = train_acc.finish();
            let val_metrics = self.validate(&model.valid(), val)?;

            tracing::info!(
                epoch,
                lr,
                train_loss = train_metrics.loss,
                val_loss = val_metrics.loss,
                cos_sims = val_metrics.cos_sims,
                val_top1 = val_metrics.top1,
                val_top3 = val_metrics.top3,
                "epoch finished"
            );
            self.sink.log(
                "epoch",
                json!({
                    "epoch": epoch,
                    "lr": lr,
                    "train_loss": train_metrics.loss,
                    "train_top1": train_metrics.top1,
                    "val_loss": val_metrics.loss,
                    "cos_sims": val_metrics.cos_sims,
                    "val_top1": val_metrics.top1,
                    "val_top3": val_metrics.top3,
                }),
            );

            let monitored = val_metrics.top1 as f64;
            best.update(epoch, monitored, &val_metrics, |path| {
                model.save_weights(path)?;
                Ok(())
            })?;
            report.history.push(EpochRecord {
                epoch,
                lr,
                train_loss: train_metrics.loss,
                val: val_metrics,
            });
            report.epochs_run = epoch + 1;

            let stop = early.update(epoch, monitored);
            scheduler.step();
            if stop {
                report.stopped_early = true;
                break;
            }
        }

        report.best_checkpoint = best.best_path().map(|p| p.to_path_buf());
        report.best_val_top1 = best.best();
        Ok((model, report))
    }
}
