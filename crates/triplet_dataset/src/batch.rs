//! Triplet sampling and Burn batch assembly.

use crate::aug::{to_chw, RoleTransforms};
use crate::types::{DatasetError, DatasetResult, IndexedTriplet, Role, TripletSample};
use burn::tensor::{backend::Backend, Int, Tensor, TensorData};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub batch_size: usize,
    /// Reshuffle the sample order every epoch.
    pub shuffle: bool,
    /// Drop the last partial batch.
    pub drop_last: bool,
    /// Draw positives/negatives at random; otherwise pick them deterministically per index.
    pub random_pairs: bool,
    /// Seed for shuffling, pair sampling and augmentation.
    pub seed: Option<u64>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            shuffle: true,
            drop_last: true,
            random_pairs: true,
            seed: None,
        }
    }
}

/// One collated batch. Image tensors are `[B, 3, H, W]`.
#[derive(Debug, Clone)]
pub struct TripletBatch<B: Backend> {
    pub queries: Tensor<B, 4>,
    pub positives: Tensor<B, 4>,
    pub negatives: Tensor<B, 4>,
    pub categories: Tensor<B, 1, Int>,
    pub products: Tensor<B, 1, Int>,
    /// Host copies of the labels for metric computation.
    pub category_ids: Vec<usize>,
    pub product_ids: Vec<usize>,
}

impl<B: Backend> TripletBatch<B> {
    pub fn len(&self) -> usize {
        self.product_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.product_ids.is_empty()
    }
}

/// Iterates a split in (optionally shuffled) triplet batches, one epoch at a time.
pub struct TripletLoader {
    triplets: Vec<IndexedTriplet>,
    /// Every image of the split with its product index; negatives are drawn from here.
    pool: Vec<(PathBuf, usize)>,
    order: Vec<usize>,
    cursor: usize,
    epoch: u64,
    base_seed: u64,
    cfg: LoaderConfig,
    transforms: RoleTransforms,
    load_time: Duration,
}

impl TripletLoader {
    pub fn new(
        triplets: Vec<IndexedTriplet>,
        cfg: LoaderConfig,
        transforms: RoleTransforms,
    ) -> DatasetResult<Self> {
        if triplets.is_empty() {
            return Err(DatasetError::Other("cannot build a loader over zero triplets".into()));
        }
        if cfg.batch_size == 0 {
            return Err(DatasetError::Other("batch size must be positive".into()));
        }
        let mut pool = Vec::new();
        for t in &triplets {
            pool.push((t.query.clone(), t.product));
            for p in &t.positives {
                pool.push((p.clone(), t.product));
            }
        }
        pool.sort();
        pool.dedup();
        let first = pool[0].1;
        if pool.iter().all(|(_, p)| *p == first) {
            return Err(DatasetError::Other(
                "all images belong to one product; negatives cannot be sampled".into(),
            ));
        }
        let base_seed = cfg
            .seed
            .unwrap_or_else(|| rand::rng().random::<u64>());
        let order = (0..triplets.len()).collect();
        let mut loader = Self {
            triplets,
            pool,
            order,
            cursor: 0,
            epoch: 0,
            base_seed,
            cfg,
            transforms,
            load_time: Duration::ZERO,
        };
        loader.reshuffle();
        Ok(loader)
    }

    /// Number of triplets in the split.
    pub fn len(&self) -> usize {
        self.triplets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triplets.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.cfg.batch_size
    }

    /// Batches yielded per epoch.
    pub fn num_batches(&self) -> usize {
        let n = self.triplets.len();
        let b = self.cfg.batch_size;
        if self.cfg.drop_last {
            n / b
        } else {
            n.div_ceil(b)
        }
    }

    pub fn transforms(&self) -> &RoleTransforms {
        &self.transforms
    }

    pub fn triplets(&self) -> &[IndexedTriplet] {
        &self.triplets
    }

    /// Rewind for the next epoch (reshuffling when enabled).
    pub fn reset(&mut self) {
        if self.load_time > Duration::ZERO {
            tracing::debug!(
                epoch = self.epoch,
                load_ms = self.load_time.as_millis() as u64,
                "loader epoch finished"
            );
        }
        self.epoch += 1;
        self.cursor = 0;
        self.load_time = Duration::ZERO;
        self.reshuffle();
    }

    fn reshuffle(&mut self) {
        self.order = (0..self.triplets.len()).collect();
        if self.cfg.shuffle {
            let mut rng = rand::rngs::StdRng::seed_from_u64(self.base_seed ^ self.epoch);
            self.order.shuffle(&mut rng);
        }
    }

    fn sample_seed(&self, index: usize) -> u64 {
        // splitmix-style mixing so neighbouring indices get unrelated streams.
        let mut z = self
            .base_seed
            .wrapping_add(self.epoch.wrapping_mul(0x9E37_79B9_7F4A_7C15))
            .wrapping_add((index as u64).wrapping_mul(0xBF58_476D_1CE4_E5B9));
        z = (z ^ (z >> 30)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    /// Choose (positive, negative) paths for a triplet.
    pub fn pick_pair(&self, index: usize, rng: &mut dyn rand::RngCore) -> (PathBuf, PathBuf) {
        let t = &self.triplets[index];
        let positive = if t.positives.is_empty() {
            t.query.clone()
        } else if self.cfg.random_pairs {
            t.positives[rng.random_range(0..t.positives.len())].clone()
        } else {
            t.positives[0].clone()
        };
        let candidates: Vec<&PathBuf> = self
            .pool
            .iter()
            .filter(|(_, p)| *p != t.product)
            .map(|(path, _)| path)
            .collect();
        let negative = if self.cfg.random_pairs {
            candidates[rng.random_range(0..candidates.len())].clone()
        } else {
            candidates[index % candidates.len()].clone()
        };
        (positive, negative)
    }

    fn load_sample(&self, index: usize) -> DatasetResult<TripletSample> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(self.sample_seed(index));
        let t = &self.triplets[index];
        let (pos_path, neg_path) = self.pick_pair(index, &mut rng);
        let query = self.load_role(&t.query, Role::Query, &mut rng)?;
        let positive = self.load_role(&pos_path, Role::Positive, &mut rng)?;
        let negative = self.load_role(&neg_path, Role::Negative, &mut rng)?;
        let (width, height) = self.transforms.target_size();
        Ok(TripletSample {
            query_chw: query,
            positive_chw: positive,
            negative_chw: negative,
            width,
            height,
            category: t.category,
            product: t.product,
        })
    }

    fn load_role(
        &self,
        path: &Path,
        role: Role,
        rng: &mut dyn rand::RngCore,
    ) -> DatasetResult<Vec<f32>> {
        let img = image::open(path)
            .map_err(|source| DatasetError::Image {
                path: path.to_path_buf(),
                source,
            })?
            .to_rgb8();
        let out = self.transforms.for_role(role).apply(img, rng);
        Ok(to_chw(&out))
    }

    /// Next batch of the current epoch, or `None` once the epoch is exhausted.
    pub fn next_batch<B: Backend>(
        &mut self,
        device: &B::Device,
    ) -> DatasetResult<Option<TripletBatch<B>>> {
        let n = self.order.len();
        if self.cursor >= n {
            return Ok(None);
        }
        let end = (self.cursor + self.cfg.batch_size).min(n);
        if self.cfg.drop_last && end - self.cursor < self.cfg.batch_size {
            self.cursor = n;
            return Ok(None);
        }
        let indices: Vec<usize> = self.order[self.cursor..end].to_vec();
        self.cursor = end;

        let started = Instant::now();
        let samples = indices
            .par_iter()
            .map(|&i| self.load_sample(i))
            .collect::<DatasetResult<Vec<_>>>()?;
        self.load_time += started.elapsed();

        Ok(Some(collate(&samples, device)?))
    }
}

/// Stack samples into a `TripletBatch`.
pub fn collate<B: Backend>(
    samples: &[TripletSample],
    device: &B::Device,
) -> DatasetResult<TripletBatch<B>> {
    let first = samples
        .first()
        .ok_or_else(|| DatasetError::Other("cannot collate empty batch".into()))?;
    let (width, height) = (first.width as usize, first.height as usize);
    let per_image = 3 * width * height;
    let batch = samples.len();

    let mut queries = Vec::with_capacity(batch * per_image);
    let mut positives = Vec::with_capacity(batch * per_image);
    let mut negatives = Vec::with_capacity(batch * per_image);
    let mut category_ids = Vec::with_capacity(batch);
    let mut product_ids = Vec::with_capacity(batch);
    for s in samples {
        if s.width as usize != width || s.height as usize != height {
            return Err(DatasetError::Other(format!(
                "image dimensions differ within batch: {}x{}, expected {}x{}",
                s.width, s.height, width, height
            )));
        }
        for buf in [&s.query_chw, &s.positive_chw, &s.negative_chw] {
            if buf.len() != per_image {
                return Err(DatasetError::Other(format!(
                    "sample buffer has {} values, expected {per_image}",
                    buf.len()
                )));
            }
        }
        queries.extend_from_slice(&s.query_chw);
        positives.extend_from_slice(&s.positive_chw);
        negatives.extend_from_slice(&s.negative_chw);
        category_ids.push(s.category);
        product_ids.push(s.product);
    }

    let shape = [batch, 3, height, width];
    let labels = |ids: &[usize]| {
        Tensor::<B, 1, Int>::from_data(
            TensorData::new(ids.iter().map(|&v| v as i64).collect::<Vec<_>>(), [batch]),
            device,
        )
    };
    Ok(TripletBatch {
        queries: Tensor::<B, 4>::from_data(TensorData::new(queries, shape), device),
        positives: Tensor::<B, 4>::from_data(TensorData::new(positives, shape), device),
        negatives: Tensor::<B, 4>::from_data(TensorData::new(negatives, shape), device),
        categories: labels(&category_ids),
        products: labels(&product_ids),
        category_ids,
        product_ids,
    })
}
