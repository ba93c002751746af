//! Triplet dataset utilities for embedding training.
//!
//! This crate provides:
//! - Split manifests (train/val/test with global category/product label spaces)
//! - Directory splitting into a manifest
//! - Per-role augmentation (query sketches vs. product photos)
//! - Seeded triplet sampling and Burn-compatible batch iteration

pub mod aug;
pub mod batch;
pub mod manifest;
pub mod types;

pub use aug::{RoleTransform, RoleTransformBuilder, RoleTransforms};
pub use batch::{collate, LoaderConfig, TripletBatch, TripletLoader};
pub use manifest::{build_manifest_from_dir, SplitRatios};
pub use types::*;
