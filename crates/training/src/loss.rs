//! Cosine-embedding triplet loss and the optional cross-entropy term.

use burn::nn::loss::{CrossEntropyLoss, CrossEntropyLossConfig};
use burn::tensor::{backend::Backend, Int, Tensor};
use models::EmbeddingOutput;
use serde::{Deserialize, Serialize};

/// Margin applied to dissimilar pairs.
pub const DEFAULT_MARGIN: f32 = 0.5;

/// Added to squared magnitudes before the cosine division.
const MAGNITUDE_EPS: f64 = 1e-12;

/// Pair target for [`cosine_embedding_loss`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairTarget {
    /// `1 - cos(x1, x2)`.
    Similar,
    /// `max(0, cos(x1, x2) - margin)`.
    Dissimilar,
}

/// Which loss terms are summed into the total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LossMode {
    pub triplet: bool,
    pub cross_entropy: bool,
}

impl LossMode {
    pub fn new(triplet: bool, cross_entropy: bool) -> anyhow::Result<Self> {
        if !triplet && !cross_entropy {
            anyhow::bail!(
                "Please choose at least one loss function: triplet (--only-feature-embeddings) \
                 or crossentropy (--only-target-labels)"
            );
        }
        Ok(Self {
            triplet,
            cross_entropy,
        })
    }

    pub fn describe(&self) -> &'static str {
        match (self.triplet, self.cross_entropy) {
            (true, true) => "triplet + crossentropy",
            (true, false) => "triplet",
            (false, true) => "crossentropy",
            (false, false) => "none",
        }
    }
}

impl Default for LossMode {
    fn default() -> Self {
        Self {
            triplet: true,
            cross_entropy: true,
        }
    }
}

/// Row-wise cosine of two `[B, D]` tensors, `[B]`.
pub fn embedding_cosine<B: Backend>(x1: Tensor<B, 2>, x2: Tensor<B, 2>) -> Tensor<B, 1> {
    let [batch, _] = x1.dims();
    let dot = (x1.clone() * x2.clone()).sum_dim(1);
    let mag1 = (x1.clone() * x1).sum_dim(1).add_scalar(MAGNITUDE_EPS);
    let mag2 = (x2.clone() * x2).sum_dim(1).add_scalar(MAGNITUDE_EPS);
    (dot / (mag1 * mag2).sqrt()).reshape([batch])
}

/// Unreduced cosine-embedding loss, `[B]`.
pub fn cosine_embedding_loss_per_sample<B: Backend>(
    x1: Tensor<B, 2>,
    x2: Tensor<B, 2>,
    target: PairTarget,
    margin: f32,
) -> Tensor<B, 1> {
    let cos = embedding_cosine(x1, x2);
    match target {
        PairTarget::Similar => cos.neg().add_scalar(1.0),
        PairTarget::Dissimilar => cos.sub_scalar(margin).clamp_min(0.0),
    }
}

/// Mean-reduced cosine-embedding loss, `[1]`.
pub fn cosine_embedding_loss<B: Backend>(
    x1: Tensor<B, 2>,
    x2: Tensor<B, 2>,
    target: PairTarget,
    margin: f32,
) -> Tensor<B, 1> {
    cosine_embedding_loss_per_sample(x1, x2, target, margin).mean()
}

/// Loss tensors for one step. `total` is what gets backpropagated.
#[derive(Debug, Clone)]
pub struct LossOutput<B: Backend> {
    pub total: Tensor<B, 1>,
    pub triplet: Option<Tensor<B, 1>>,
    pub cross_entropy: Option<Tensor<B, 1>>,
}

/// Host copy of a [`LossOutput`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LossBreakdown {
    pub total: f32,
    pub triplet: Option<f32>,
    pub cross_entropy: Option<f32>,
}

impl<B: Backend> LossOutput<B> {
    pub fn breakdown(&self) -> LossBreakdown {
        LossBreakdown {
            total: scalar(self.total.clone()),
            triplet: self.triplet.clone().map(scalar),
            cross_entropy: self.cross_entropy.clone().map(scalar),
        }
    }
}

/// First element of a tensor as `f32` (0.0 when empty).
pub fn scalar<B: Backend>(t: Tensor<B, 1>) -> f32 {
    t.into_data()
        .to_vec::<f32>()
        .unwrap_or_default()
        .into_iter()
        .next()
        .unwrap_or(0.0)
}

/// Sums the enabled loss terms for a (query, positive, negative) forward.
///
/// The negative's logits never enter the cross-entropy term.
pub struct TripletCriterion<B: Backend> {
    mode: LossMode,
    margin: f32,
    ce: CrossEntropyLoss<B>,
}

impl<B: Backend> TripletCriterion<B> {
    pub fn new(mode: LossMode, device: &B::Device) -> Self {
        Self {
            mode,
            margin: DEFAULT_MARGIN,
            ce: CrossEntropyLossConfig::new().init(device),
        }
    }

    pub fn with_margin(mut self, margin: f32) -> Self {
        self.margin = margin;
        self
    }

    pub fn mode(&self) -> LossMode {
        self.mode
    }

    pub fn margin(&self) -> f32 {
        self.margin
    }

    pub fn forward(
        &self,
        query: &EmbeddingOutput<B>,
        positive: &EmbeddingOutput<B>,
        negative: &EmbeddingOutput<B>,
        labels: Tensor<B, 1, Int>,
    ) -> LossOutput<B> {
        let triplet = self.mode.triplet.then(|| {
            cosine_embedding_loss(
                query.embeddings.clone(),
                positive.embeddings.clone(),
                PairTarget::Similar,
                self.margin,
            ) + cosine_embedding_loss(
                query.embeddings.clone(),
                negative.embeddings.clone(),
                PairTarget::Dissimilar,
                self.margin,
            )
        });
        let cross_entropy = self.mode.cross_entropy.then(|| {
            self.ce.forward(query.logits.clone(), labels.clone())
                + self.ce.forward(positive.logits.clone(), labels)
        });
        let total = match (&triplet, &cross_entropy) {
            (Some(t), Some(c)) => t.clone() + c.clone(),
            (Some(t), None) => t.clone(),
            (None, Some(c)) => c.clone(),
            // LossMode::new rejects the empty combination.
            (None, None) => query.embeddings.clone().sum().mul_scalar(0.0),
        };
        LossOutput {
            total,
            triplet,
            cross_entropy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::TensorData;
    use burn_ndarray::NdArray;

    type B = NdArray<f32>;

    fn rows(data: Vec<f32>, n: usize, d: usize) -> Tensor<B, 2> {
        Tensor::from_data(TensorData::new(data, [n, d]), &Default::default())
    }

    fn labels(ids: Vec<i64>) -> Tensor<B, 1, Int> {
        let n = ids.len();
        Tensor::from_data(TensorData::new(ids, [n]), &Default::default())
    }

    fn output(emb: Tensor<B, 2>, logits: Tensor<B, 2>) -> EmbeddingOutput<B> {
        EmbeddingOutput {
            embeddings: emb,
            logits,
        }
    }

    #[test]
    fn empty_mode_is_rejected() {
        let err = LossMode::new(false, false).unwrap_err();
        assert!(err.to_string().starts_with("Please choose at least one loss function"));
        assert!(LossMode::new(true, false).is_ok());
        assert!(LossMode::new(false, true).is_ok());
    }

    #[test]
    fn similar_pair_loss_is_one_minus_cos() {
        let a = rows(vec![1.0, 0.0, 1.0, 0.0], 2, 2);
        let b = rows(vec![1.0, 0.0, 0.0, 1.0], 2, 2);
        let per = cosine_embedding_loss_per_sample(a.clone(), b.clone(), PairTarget::Similar, 0.5)
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        assert!(per[0].abs() < 1e-5);
        assert!((per[1] - 1.0).abs() < 1e-5);
        let mean = scalar(cosine_embedding_loss(a, b, PairTarget::Similar, 0.5));
        assert!((mean - 0.5).abs() < 1e-5);
    }

    #[test]
    fn dissimilar_pair_loss_applies_margin() {
        // cos = 1.0 → 0.5 ; cos = 0.0 → 0 ; cos = -1 → 0
        let a = rows(vec![1.0, 0.0, 1.0, 0.0, 1.0, 0.0], 3, 2);
        let b = rows(vec![2.0, 0.0, 0.0, 3.0, -1.0, 0.0], 3, 2);
        let per = cosine_embedding_loss_per_sample(a, b, PairTarget::Dissimilar, 0.5)
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        assert!((per[0] - 0.5).abs() < 1e-5);
        assert!(per[1].abs() < 1e-6);
        assert!(per[2].abs() < 1e-6);
    }

    #[test]
    fn zero_vectors_do_not_produce_nan() {
        let a = rows(vec![0.0, 0.0], 1, 2);
        let cos = scalar(embedding_cosine(a.clone(), a));
        assert!(cos.is_finite());
    }

    #[test]
    fn criterion_sums_enabled_terms() {
        let device = Default::default();
        let q = output(rows(vec![1.0, 0.0], 1, 2), rows(vec![4.0, 0.0, 0.0], 1, 3));
        let p = output(rows(vec![1.0, 0.0], 1, 2), rows(vec![4.0, 0.0, 0.0], 1, 3));
        let n = output(rows(vec![0.0, 1.0], 1, 2), rows(vec![0.0, 0.0, 9.0], 1, 3));

        let triplet_only = TripletCriterion::<B>::new(LossMode::new(true, false).unwrap(), &device);
        let out = triplet_only.forward(&q, &p, &n, labels(vec![0])).breakdown();
        assert!(out.total.abs() < 1e-5);
        assert!(out.cross_entropy.is_none());

        let both = TripletCriterion::<B>::new(LossMode::default(), &device);
        let out = both.forward(&q, &p, &n, labels(vec![2])).breakdown();
        let t = out.triplet.unwrap();
        let c = out.cross_entropy.unwrap();
        assert!(c > 1.0, "wrong label should cost, got {c}");
        assert!((out.total - (t + c)).abs() < 1e-4);
        assert!(out.total >= 0.0);
    }
}
