pub mod inference;
pub mod ml_model;
pub mod preprocess;
pub mod registry;
pub mod training;

pub use inference::{
    decide, rank_top_k, softmax, InferenceEngine, PredictionResult, TopPrediction,
    UNCERTAIN_MESSAGE,
};
pub use ml_model::{RetinaCnn, RetinaCnnConfig, IMAGE_SIZE, IN_CHANNELS};
pub use preprocess::{ImagePreprocessor, ImageTensor, PreprocessMode, IMAGENET_MEAN, IMAGENET_STD};
pub use registry::{ClassRegistry, DEFAULT_CLASS_LABELS};
pub use training::{
    train_model, EpochMetrics, RetinaDataset, RetinaItem, Trainer, TrainingConfig,
    TrainingOutcome, TrainingReport,
};
