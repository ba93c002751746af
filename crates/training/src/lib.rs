#![recursion_limit = "256"]

pub mod callbacks;
pub mod config;
pub mod loss;
pub mod metrics;
pub mod schedule;
pub mod trainer;
pub mod util;

pub use callbacks::{BestCheckpoint, EarlyStopping, MetricsSink, MonitorMode};
pub use config::{LabelSpace, OptimizerKind, TrainConfig};
pub use loss::{cosine_embedding_loss, LossBreakdown, LossMode, PairTarget, TripletCriterion};
pub use metrics::{rescale_similarity, topk_hits, EvalMetrics, SimilarityMode};
pub use models::{BackboneKind, TripletNet, TripletNetConfig};
pub use schedule::{LrFinderConfig, LrFinderResult, LrRangeTest, MultiStepLr};
pub use trainer::{evaluate, test_gathered, FitOptions, FitReport, Trainer};
pub use util::{run_train, train_and_test, TrainArgs};
/// Backend alias for training/eval (NdArray by default; WGPU if enabled).
#[cfg(feature = "backend-wgpu")]
pub type TrainBackend = burn_wgpu::Wgpu<f32>;
#[cfg(not(feature = "backend-wgpu"))]
pub type TrainBackend = burn_ndarray::NdArray<f32>;
