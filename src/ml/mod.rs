pub mod inference;
pub mod ml_model;
pub mod training;

pub use inference::{PredictionResult, Predictor};
pub use ml_model::{load_and_normalize_image, ModelConfig, SpectrogramCnn};
pub use training::{
    discover_classes, model_to_bytes, train_model, EpochMetrics, SpectrogramBatch, SpectrogramBatcher,
    SpectrogramDataset, SpectrogramItem, TrainingReport,
};
