pub mod config;
pub mod inference_config;
pub mod model_metadata;
pub mod model_storage;

pub use config::{AppConfig, DeviceType, ModelSettings, ServerSettings, TrainingSettings};
pub use inference_config::{InferenceConfig, UNCERTAIN_LABEL};
pub use model_metadata::{CheckpointMetadata, CHECKPOINT_FORMAT_VERSION};
pub use model_storage::{
    load_checkpoint, load_metadata, load_model_with_metadata, save_checkpoint,
    save_model_with_metadata, validate_metadata,
};
