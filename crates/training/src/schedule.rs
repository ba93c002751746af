//! Learning-rate control: per-epoch multi-step decay and the LR range test.

use serde::{Deserialize, Serialize};

/// Epoch-indexed step decay: `lr(e) = base * gamma^(#milestones <= e)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiStepLr {
    base_lr: f64,
    milestones: Vec<usize>,
    gamma: f64,
    epoch: usize,
}

impl MultiStepLr {
    pub fn new(base_lr: f64, mut milestones: Vec<usize>, gamma: f64) -> Self {
        milestones.sort_unstable();
        milestones.dedup();
        Self {
            base_lr,
            milestones,
            gamma,
            epoch: 0,
        }
    }

    /// `[5, 10, ..., 70]`.
    pub fn default_milestones() -> Vec<usize> {
        (1..=14).map(|i| i * 5).collect()
    }

    pub fn base_lr(&self) -> f64 {
        self.base_lr
    }

    pub fn milestones(&self) -> &[usize] {
        &self.milestones
    }

    pub fn gamma(&self) -> f64 {
        self.gamma
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn lr_at(&self, epoch: usize) -> f64 {
        let passed = self.milestones.iter().filter(|m| **m <= epoch).count();
        self.base_lr * self.gamma.powi(passed as i32)
    }

    pub fn current(&self) -> f64 {
        self.lr_at(self.epoch)
    }

    /// Advance one epoch and return the new rate.
    pub fn step(&mut self) -> f64 {
        let before = self.current();
        self.epoch += 1;
        let lr = self.current();
        if lr != before {
            tracing::info!(epoch = self.epoch, lr, "learning rate decayed");
        }
        lr
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LrFinderConfig {
    pub min_lr: f64,
    pub max_lr: f64,
    pub num_steps: usize,
    /// Exponential smoothing factor for the recorded loss.
    pub beta: f64,
    /// Stop once the smoothed loss exceeds `divergence * best`.
    pub divergence: f64,
    pub skip_begin: usize,
    pub skip_end: usize,
}

impl Default for LrFinderConfig {
    fn default() -> Self {
        Self {
            min_lr: 1e-8,
            max_lr: 1.0,
            num_steps: 100,
            beta: 0.98,
            divergence: 4.0,
            skip_begin: 10,
            skip_end: 1,
        }
    }
}

impl LrFinderConfig {
    /// Exponential interpolation between `min_lr` and `max_lr`; the last step
    /// lands on `max_lr`.
    pub fn lr_at(&self, step: usize) -> f64 {
        let r = step as f64 / self.num_steps.saturating_sub(1).max(1) as f64;
        self.min_lr * (self.max_lr / self.min_lr).powf(r)
    }
}

/// Drives one LR range test: hand out a rate, feed back the step's loss.
#[derive(Debug, Clone)]
pub struct LrRangeTest {
    cfg: LrFinderConfig,
    step: usize,
    avg_loss: f64,
    best_loss: f64,
    lrs: Vec<f64>,
    losses: Vec<f64>,
    diverged: bool,
}

impl LrRangeTest {
    pub fn new(cfg: LrFinderConfig) -> Self {
        Self {
            cfg,
            step: 0,
            avg_loss: 0.0,
            best_loss: f64::INFINITY,
            lrs: Vec::new(),
            losses: Vec::new(),
            diverged: false,
        }
    }

    /// Rate for the next step, or `None` when the sweep is over.
    pub fn next_lr(&self) -> Option<f64> {
        if self.diverged || self.step >= self.cfg.num_steps {
            None
        } else {
            Some(self.cfg.lr_at(self.step))
        }
    }

    /// Record the raw loss of the step run at [`Self::next_lr`].
    pub fn record(&mut self, loss: f64) {
        let Some(lr) = self.next_lr() else {
            return;
        };
        let beta = self.cfg.beta;
        self.avg_loss = beta * self.avg_loss + (1.0 - beta) * loss;
        let smoothed = self.avg_loss / (1.0 - beta.powi(self.step as i32 + 1));

        if self.step > 1 && smoothed > self.cfg.divergence * self.best_loss {
            tracing::info!(step = self.step, lr, smoothed, "lr finder: loss diverged");
            self.diverged = true;
            return;
        }
        if smoothed < self.best_loss || self.step == 1 {
            self.best_loss = smoothed;
        }
        self.lrs.push(lr);
        self.losses.push(smoothed);
        self.step += 1;
    }

    pub fn finish(self) -> LrFinderResult {
        LrFinderResult {
            lrs: self.lrs,
            losses: self.losses,
            skip_begin: self.cfg.skip_begin,
            skip_end: self.cfg.skip_end,
        }
    }
}

/// Recorded sweep: rates with their smoothed losses.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LrFinderResult {
    pub lrs: Vec<f64>,
    pub losses: Vec<f64>,
    skip_begin: usize,
    skip_end: usize,
}

impl LrFinderResult {
    pub fn new(lrs: Vec<f64>, losses: Vec<f64>) -> Self {
        let cfg = LrFinderConfig::default();
        Self {
            lrs,
            losses,
            skip_begin: cfg.skip_begin,
            skip_end: cfg.skip_end,
        }
    }

    /// Rate at the steepest descent of the smoothed loss, ignoring the first `skip_begin`
    /// and last `skip_end` points. `None` with fewer than two usable points.
    pub fn suggestion(&self) -> Option<f64> {
        let end = self.losses.len().checked_sub(self.skip_end)?;
        if end <= self.skip_begin {
            return None;
        }
        let window: Vec<(usize, f64)> = (self.skip_begin..end)
            .filter(|i| self.losses[*i].is_finite())
            .map(|i| (i, self.losses[i]))
            .collect();
        if window.len() < 2 {
            return None;
        }
        let grads = gradient(&window.iter().map(|(_, l)| *l).collect::<Vec<_>>());
        let (best, _) = grads
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(b.1))?;
        self.lrs.get(window[best].0).copied()
    }
}

/// Central differences inside, one-sided at the ends.
fn gradient(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    (0..n)
        .map(|i| match i {
            0 => values[1] - values[0],
            i if i == n - 1 => values[n - 1] - values[n - 2],
            i => (values[i + 1] - values[i - 1]) / 2.0,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multistep_is_piecewise_constant_and_non_increasing() {
        let mut s = MultiStepLr::new(1.0, MultiStepLr::default_milestones(), 0.01);
        assert_eq!(s.milestones().first(), Some(&5));
        assert_eq!(s.milestones().last(), Some(&70));
        let mut prev = s.current();
        assert_eq!(prev, 1.0);
        for epoch in 1..80 {
            let lr = s.step();
            assert!(lr <= prev);
            match epoch {
                1..=4 => assert_eq!(lr, 1.0),
                5..=9 => assert!((lr - 0.01).abs() < 1e-15),
                10..=14 => assert!((lr - 1e-4).abs() < 1e-18),
                _ => {}
            }
            prev = lr;
        }
        assert_eq!(s.epoch(), 79);
    }

    #[test]
    fn finder_sweep_is_exponential() {
        let cfg = LrFinderConfig::default();
        assert_eq!(cfg.lr_at(0), 1e-8);
        let last = cfg.lr_at(cfg.num_steps - 1);
        assert!((last - cfg.max_lr).abs() < 1e-9);
        let step = (cfg.lr_at(1) / cfg.lr_at(0)).log10();
        assert!((step - 8.0 / 99.0).abs() < 1e-9);
        let rates: Vec<f64> = (0..cfg.num_steps).map(|i| cfg.lr_at(i)).collect();
        assert!(rates.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn finder_stops_on_divergence() {
        let mut t = LrRangeTest::new(LrFinderConfig {
            beta: 0.0,
            ..Default::default()
        });
        for _ in 0..5 {
            t.record(1.0);
        }
        assert!(t.next_lr().is_some());
        t.record(10.0);
        assert!(t.next_lr().is_none());
        assert_eq!(t.finish().losses.len(), 5);
    }

    #[test]
    fn finder_runs_all_steps_on_flat_loss() {
        let mut t = LrRangeTest::new(LrFinderConfig::default());
        while t.next_lr().is_some() {
            t.record(2.0);
        }
        let res = t.finish();
        assert_eq!(res.lrs.len(), 100);
        assert!(res.losses.iter().all(|l| (l - 2.0).abs() < 1e-9));
    }

    #[test]
    fn suggestion_picks_steepest_descent() {
        let lrs: Vec<f64> = (0..20).map(|i| i as f64).collect();
        let mut losses = vec![5.0; 20];
        // Drop between index 14 and 15, outside the skipped head.
        for l in losses.iter_mut().skip(15) {
            *l = 1.0;
        }
        // Steeper drop inside the skipped head is ignored.
        losses[2] = -100.0;
        let res = LrFinderResult::new(lrs, losses);
        let s = res.suggestion().unwrap();
        assert!(s == 14.0 || s == 15.0, "got {s}");
    }

    #[test]
    fn suggestion_needs_two_points() {
        let res = LrFinderResult::new(vec![1.0; 11], vec![1.0; 11]);
        assert_eq!(res.suggestion(), None);
        let res = LrFinderResult::new(vec![1.0; 13], vec![1.0; 13]);
        assert!(res.suggestion().is_some());
    }
}
