//! Retrieval metrics computed on host copies of embeddings and logits.

use serde::Serialize;

/// Lower bound on each vector norm in [`cosine_similarity_rows`].
pub const SIMILARITY_EPS: f32 = 1e-6;
/// Rescaling parameters used for the reported `cos_sims` score.
pub const CONFIDENCE_EPS: f32 = 5.0;
pub const CONFIDENCE_ALPHA: f32 = 1.0;
/// Scores below this use the low branch of [`SimilarityMode::ForPositive`].
pub const CONFIDENCE_THRESHOLD: f32 = 0.3;

/// Per-row cosine similarity of two row-major `[n, dim]` buffers.
pub fn cosine_similarity_rows(a: &[f32], b: &[f32], dim: usize) -> Vec<f32> {
    if dim == 0 {
        return Vec::new();
    }
    a.chunks_exact(dim)
        .zip(b.chunks_exact(dim))
        .map(|(x, y)| {
            let dot: f32 = x.iter().zip(y).map(|(u, v)| u * v).sum();
            let nx = x.iter().map(|u| u * u).sum::<f32>().sqrt().max(SIMILARITY_EPS);
            let ny = y.iter().map(|v| v * v).sum::<f32>().sqrt().max(SIMILARITY_EPS);
            dot / (nx * ny)
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimilarityMode {
    ForPositive,
    ForNegative,
}

/// Map a raw cosine score onto the hand-tuned confidence scale.
///
/// `ForPositive` switches branch at [`CONFIDENCE_THRESHOLD`]; the two branches do not meet
/// there.
pub fn rescale_similarity(score: f32, eps: f32, alpha: f32, mode: SimilarityMode) -> f32 {
    match mode {
        SimilarityMode::ForPositive if score < CONFIDENCE_THRESHOLD => {
            (score + eps) / (eps + eps * alpha)
        }
        SimilarityMode::ForPositive => (score + eps) / (eps + alpha),
        SimilarityMode::ForNegative => (score + alpha / eps) / (2.0 * eps),
    }
}

/// [`rescale_similarity`] with the default parameters, positive pairs.
pub fn confidence(score: f32) -> f32 {
    rescale_similarity(
        score,
        CONFIDENCE_EPS,
        CONFIDENCE_ALPHA,
        SimilarityMode::ForPositive,
    )
}

/// Indices of the `k` largest values, best first. Ties keep the lower index; NaN ranks last.
pub fn topk_indices(row: &[f32], k: usize) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..row.len()).collect();
    idx.sort_by(|&a, &b| {
        let (x, y) = (row[a], row[b]);
        match (x.is_nan(), y.is_nan()) {
            (true, true) => a.cmp(&b),
            (true, false) => std::cmp::Ordering::Greater,
            (false, true) => std::cmp::Ordering::Less,
            (false, false) => y.total_cmp(&x).then(a.cmp(&b)),
        }
    });
    idx.truncate(k.min(row.len()));
    idx
}

/// Top-1 and top-3 hit counts for row-major `[n, num_classes]` logits.
pub fn topk_hits(logits: &[f32], num_classes: usize, labels: &[usize]) -> (usize, usize) {
    if num_classes == 0 {
        return (0, 0);
    }
    let mut top1 = 0;
    let mut top3 = 0;
    for (row, &label) in logits.chunks_exact(num_classes).zip(labels) {
        let best = topk_indices(row, 3);
        if best.first() == Some(&label) {
            top1 += 1;
        }
        if best.contains(&label) {
            top3 += 1;
        }
    }
    (top1, top3)
}

/// Evaluation summary for one pass over a split.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct EvalMetrics {
    pub loss: f32,
    /// Mean raw query/positive cosine similarity.
    pub mean_similarity: f32,
    /// Per-batch `confidence(batch mean similarity)`, averaged over batches.
    pub cos_sims: f32,
    pub top1: f32,
    pub top3: f32,
    pub samples: usize,
}

/// Running sums over the batches of an epoch.
#[derive(Debug, Clone, Default)]
pub struct MetricAccumulator {
    loss_sum: f64,
    batches: usize,
    similarity_sum: f64,
    confidence_sum: f64,
    top1: usize,
    top3: usize,
    samples: usize,
}

impl MetricAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one batch: its mean loss, per-sample similarities and top-k hit counts.
    pub fn push(&mut self, loss: f32, similarities: &[f32], hits: (usize, usize)) {
        self.loss_sum += loss as f64;
        self.batches += 1;
        let batch_sum = similarities.iter().map(|s| *s as f64).sum::<f64>();
        if !similarities.is_empty() {
            let batch_mean = (batch_sum / similarities.len() as f64) as f32;
            self.confidence_sum += confidence(batch_mean) as f64;
        }
        self.similarity_sum += batch_sum;
        self.samples += similarities.len();
        self.top1 += hits.0;
        self.top3 += hits.1;
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    /// Batch-averaged loss and confidence; similarity and accuracy averaged over samples.
    pub fn finish(&self) -> EvalMetrics {
        if self.batches == 0 || self.samples == 0 {
            return EvalMetrics::default();
        }
        let n = self.samples as f64;
        let batches = self.batches as f64;
        EvalMetrics {
            loss: (self.loss_sum / batches) as f32,
            mean_similarity: (self.similarity_sum / n) as f32,
            cos_sims: (self.confidence_sum / batches) as f32,
            top1: (self.top1 as f64 / n) as f32,
            top3: (self.top3 as f64 / n) as f32,
            samples: self.samples,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_rows_match_hand_values() {
        let a = [1.0, 0.0, 1.0, 1.0, 0.0, 0.0];
        let b = [2.0, 0.0, -1.0, -1.0, 1.0, 1.0];
        let s = cosine_similarity_rows(&a, &b, 2);
        assert!((s[0] - 1.0).abs() < 1e-6);
        assert!((s[1] + 1.0).abs() < 1e-6);
        assert_eq!(s[2], 0.0);
    }

    #[test]
    fn rescale_branches_follow_formulas() {
        let below = rescale_similarity(0.2, 5.0, 1.0, SimilarityMode::ForPositive);
        assert!((below - 5.2 / 10.0).abs() < 1e-6);
        let above = rescale_similarity(0.3, 5.0, 1.0, SimilarityMode::ForPositive);
        assert!((above - 5.3 / 6.0).abs() < 1e-6);
        let neg = rescale_similarity(0.5, 5.0, 1.0, SimilarityMode::ForNegative);
        assert!((neg - 0.7 / 10.0).abs() < 1e-6);
        // The two positive branches disagree right at the switch.
        let just_below = confidence(0.299_999);
        assert!(above - just_below > 0.3);
    }

    #[test]
    fn topk_orders_and_clamps() {
        assert_eq!(topk_indices(&[0.1, 0.9, 0.5, 0.9], 3), vec![1, 3, 2]);
        assert_eq!(topk_indices(&[0.2, f32::NAN], 3), vec![0, 1]);
        assert_eq!(topk_indices(&[], 3), Vec::<usize>::new());
    }

    #[test]
    fn topk_hits_top1_never_exceeds_top3() {
        let logits = [
            0.9, 0.1, 0.0, 0.0, // label 0: top1
            0.1, 0.2, 0.3, 0.4, // label 1: rank 3
            0.4, 0.3, 0.2, 0.1, // label 3: miss
        ];
        let (t1, t3) = topk_hits(&logits, 4, &[0, 1, 3]);
        assert_eq!((t1, t3), (1, 2));
        // Two classes: top-3 degenerates to "any".
        let (t1, t3) = topk_hits(&[0.2, 0.8], 2, &[0]);
        assert_eq!((t1, t3), (0, 1));
    }

    #[test]
    fn accumulator_averages() {
        let mut acc = MetricAccumulator::new();
        assert_eq!(acc.finish(), EvalMetrics::default());
        acc.push(1.0, &[1.0, 0.0], (2, 2));
        acc.push(3.0, &[0.5, 0.5], (0, 1));
        let m = acc.finish();
        assert!((m.loss - 2.0).abs() < 1e-6);
        assert!((m.mean_similarity - 0.5).abs() < 1e-6);
        assert!((m.cos_sims - confidence(0.5)).abs() < 1e-6);
        assert!((m.top1 - 0.5).abs() < 1e-6);
        assert!((m.top3 - 0.75).abs() < 1e-6);
        assert!(m.top1 <= m.top3);
        assert_eq!(m.samples, 4);
    }

    #[test]
    fn confidence_is_averaged_per_batch() {
        let mut acc = MetricAccumulator::new();
        acc.push(1.0, &[0.1, 0.3], (0, 0));
        acc.push(1.0, &[0.4, 0.6], (0, 0));
        let m = acc.finish();
        assert!((m.mean_similarity - 0.35).abs() < 1e-6);
        let expected = (confidence(0.2) + confidence(0.5)) / 2.0;
        assert!((m.cos_sims - expected).abs() < 1e-6);
        assert!((m.cos_sims - 0.7183).abs() < 1e-4);
        assert!((m.cos_sims - confidence(0.35)).abs() > 0.1);
    }
}
