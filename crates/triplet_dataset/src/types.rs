//! Core types, error definitions, and data structures for triplet_dataset.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

pub type DatasetResult<T> = Result<T, DatasetError>;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("image decode error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("manifest validation failed at {path}: {msg}")]
    Validation { path: PathBuf, msg: String },
    #[error("{split} split is empty")]
    EmptySplit { split: Split },
    #[error("{split} split has a single product; negatives cannot be sampled")]
    NoNegatives { split: Split },
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Val,
    Test,
}

impl Split {
    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Val => "val",
            Split::Test => "test",
        }
    }
}

impl std::fmt::Display for Split {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Split {
    type Err = DatasetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "train" => Ok(Split::Train),
            "val" | "valid" | "validation" => Ok(Split::Val),
            "test" => Ok(Split::Test),
            other => Err(DatasetError::Other(format!("unknown split \"{other}\""))),
        }
    }
}

/// Image role inside a triplet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Query,
    Positive,
    Negative,
}

/// One manifest entry: a query image plus the images of the same product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripletRecord {
    /// Query image path, relative to the manifest root.
    pub query: String,
    /// Images of the same product. Empty means the query doubles as its own positive.
    #[serde(default)]
    pub positives: Vec<String>,
    pub category: String,
    pub product: String,
}

/// Train/val/test listing with global label spaces (the "trainval json").
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SplitManifest {
    /// Image root; relative paths resolve against the manifest's directory.
    #[serde(default)]
    pub root: Option<PathBuf>,
    pub categories: Vec<String>,
    pub products: Vec<String>,
    #[serde(default)]
    pub train: Vec<TripletRecord>,
    #[serde(default)]
    pub val: Vec<TripletRecord>,
    #[serde(default)]
    pub test: Vec<TripletRecord>,
}

/// Manifest record with resolved paths and label indices.
#[derive(Debug, Clone)]
pub struct IndexedTriplet {
    pub query: PathBuf,
    pub positives: Vec<PathBuf>,
    pub category: usize,
    pub product: usize,
}

/// Decoded, augmented triplet in CHW layout normalized to [0, 1].
#[derive(Debug, Clone)]
pub struct TripletSample {
    pub query_chw: Vec<f32>,
    pub positive_chw: Vec<f32>,
    pub negative_chw: Vec<f32>,
    pub width: u32,
    pub height: u32,
    pub category: usize,
    pub product: usize,
}
