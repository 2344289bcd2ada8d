use serde::Serialize;

use crate::ml::ClassRegistry;
use crate::model::DeviceType;
use crate::server::worker::InferenceWorker;

/// モデル名（/status で報告）
pub const MODEL_NAME: &str = "RetinaCNN";

/// ハンドラ間で共有する状態
#[derive(Clone)]
pub struct ServerState {
    pub worker: InferenceWorker,
    pub registry: ClassRegistry,
    pub device: DeviceType,
}

impl ServerState {
    pub fn new(worker: InferenceWorker, registry: ClassRegistry, device: DeviceType) -> Self {
        Self {
            worker,
            registry,
            device,
        }
    }

    /// 現在の状態のスナップショット
    pub fn status(&self) -> StatusReport {
        let metadata = self.worker.metadata();
        StatusReport {
            model: MODEL_NAME.to_string(),
            device: self.device.to_string(),
            classes: self.registry.labels().to_vec(),
            ready: self.worker.is_alive(),
            trained_at: metadata.map(|m| m.trained_at.clone()),
            num_epochs: metadata.map(|m| m.num_epochs),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub model: String,
    pub device: String,
    pub classes: Vec<String>,
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trained_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_epochs: Option<u32>,
}
