//! アプリケーション設定管理モジュール
//!
//! 計算デバイス、チェックポイントの場所、学習・推論・サーバー設定を
//! JSON形式で保存・読み込みします。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::ml::{RetinaCnnConfig, TrainingConfig};
use crate::model::inference_config::InferenceConfig;

/// 計算デバイスの種類
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    Wgpu,
    /// NdArray (CPU) バックエンド
    #[default]
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// チェックポイント（tar.gz）のパス
    pub checkpoint_path: PathBuf,
    /// クラスごとのサブディレクトリを持つデータセットのパス
    pub dataset_dir: PathBuf,
    /// 入力画像サイズ
    pub image_size: usize,
    /// ドロップアウト率
    pub dropout: f64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            checkpoint_path: PathBuf::from("models/retina_cnn.tar.gz"),
            dataset_dir: PathBuf::from("retinal-samples"),
            image_size: 224,
            dropout: 0.5,
        }
    }
}

impl ModelSettings {
    /// クラス数を与えてアーキテクチャ設定を作る
    pub fn architecture(&self, num_classes: usize) -> RetinaCnnConfig {
        RetinaCnnConfig::new(num_classes)
            .with_image_size(self.image_size)
            .with_dropout(self.dropout)
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSettings {
    /// エポック数
    pub num_epochs: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// 学習率
    pub learning_rate: f64,
    /// ランダムシード
    pub seed: u64,
    /// 検証データの割合（0で分割しない）
    #[serde(default)]
    pub validation_ratio: f32,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            num_epochs: 10,
            batch_size: 32,
            learning_rate: 1e-3,
            seed: 42,
            validation_ratio: 0.0,
        }
    }
}

impl TrainingSettings {
    pub fn to_training_config(&self) -> TrainingConfig {
        TrainingConfig::new()
            .with_num_epochs(self.num_epochs)
            .with_batch_size(self.batch_size)
            .with_learning_rate(self.learning_rate)
            .with_seed(self.seed)
            .with_validation_ratio(self.validation_ratio)
    }
}

/// HTTPサーバー設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// CORSで許可するオリジン
    pub allowed_origins: Vec<String>,
    /// 1リクエストあたりの推論の締め切り（秒、未設定で無制限）
    #[serde(default)]
    pub predict_timeout_secs: Option<u64>,
    /// 推論キューの長さ
    pub queue_capacity: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            allowed_origins: vec![
                "http://127.0.0.1:3000".to_string(),
                "http://localhost:3000".to_string(),
            ],
            predict_timeout_secs: Some(30),
            queue_capacity: 64,
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// 計算デバイスの種類
    pub device_type: DeviceType,
    /// モデル設定
    pub model: ModelSettings,
    /// トレーニング設定
    pub training: TrainingSettings,
    /// 推論ポリシー
    #[serde(default)]
    pub inference: InferenceConfig,
    /// サーバー設定
    #[serde(default)]
    pub server: ServerSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("retina_config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// 設定を読み込む、存在しないか壊れている場合はデフォルト設定を返す
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if path.exists() {
            match Self::load(path) {
                Ok(config) => {
                    tracing::info!("設定ファイルを読み込みました: {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "設定ファイルの読み込みに失敗しました ({}): {}。デフォルト設定を使用します",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            }
        } else {
            tracing::info!("設定ファイルが存在しません。デフォルト設定を使用します");
            Self::default()
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 設定情報をログに出力
    pub fn log_summary(&self) {
        tracing::info!("計算デバイス: {}", self.device_type);
        tracing::info!("チェックポイント: {}", self.model.checkpoint_path.display());
        tracing::info!("データセット: {}", self.model.dataset_dir.display());
        tracing::info!(
            "学習: エポック数 {}, バッチサイズ {}, 学習率 {}, シード {}",
            self.training.num_epochs,
            self.training.batch_size,
            self.training.learning_rate,
            self.training.seed
        );
        tracing::info!(
            "推論: 信頼度しきい値 {}, top-k {}",
            self.inference.confidence_threshold,
            self.inference.top_k
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.device_type, DeviceType::Cpu);
        assert_eq!(config.model.image_size, 224);
        assert_eq!(config.training.num_epochs, 10);
        assert_eq!(config.training.batch_size, 32);
        assert_eq!(config.inference.confidence_threshold, 0.65);
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = AppConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: AppConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(config.device_type, deserialized.device_type);
        assert_eq!(config.training.seed, deserialized.training.seed);
        assert_eq!(config.server.port, deserialized.server.port);
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let json = r#"{
            "device_type": "Wgpu",
            "model": {
                "checkpoint_path": "m.tar.gz",
                "dataset_dir": "data",
                "image_size": 224,
                "dropout": 0.5
            },
            "training": {
                "num_epochs": 3,
                "batch_size": 4,
                "learning_rate": 0.01,
                "seed": 1
            }
        }"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.device_type, DeviceType::Wgpu);
        assert_eq!(config.training.validation_ratio, 0.0);
        assert_eq!(config.inference.top_k, 3);
        assert_eq!(config.server.port, 8000);
    }

    #[test]
    fn test_load_or_default_with_broken_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        let config = AppConfig::load_or_default(&path);
        assert_eq!(config.training.num_epochs, 10);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = AppConfig::default();
        config.training.num_epochs = 7;
        config.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded.training.num_epochs, 7);
    }

    #[test]
    fn test_architecture_from_settings() {
        let arch = ModelSettings::default().architecture(4);
        assert_eq!(arch.num_classes, 4);
        assert_eq!(arch.flattened_size(), 100_352);
    }

    #[test]
    fn test_device_type_display() {
        assert_eq!(format!("{}", DeviceType::Wgpu), "WGPU (GPU)");
        assert_eq!(format!("{}", DeviceType::Cpu), "CPU (NdArray)");
    }
}
