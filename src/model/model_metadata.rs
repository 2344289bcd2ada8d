//! チェックポイントメタデータの定義
//!
//! tar.gz形式で保存される情報：
//! - metadata.json: このメタデータ（JSON形式）
//! - model.bin: モデルの重み（バイナリ）

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::ml::RetinaCnnConfig;

/// チェックポイント形式のバージョン
///
/// 層の構成や重みの保存形式を変えたら上げる。
pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

/// チェックポイントメタデータ
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// 形式バージョン
    pub format_version: u32,

    /// 学習に使ったアーキテクチャ設定
    pub architecture: RetinaCnnConfig,

    /// 学習時のクラスラベル（出力インデックス順）
    pub class_labels: Vec<String>,

    /// 学習エポック数
    pub num_epochs: u32,

    /// 最終エポックの平均損失
    #[serde(default)]
    pub final_loss: Option<f64>,

    /// 最終エポックの学習精度（%）
    #[serde(default)]
    pub final_accuracy: Option<f64>,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

impl CheckpointMetadata {
    /// 新しいメタデータを作成
    pub fn new(architecture: RetinaCnnConfig, class_labels: Vec<String>, num_epochs: u32) -> Self {
        Self {
            format_version: CHECKPOINT_FORMAT_VERSION,
            architecture,
            class_labels,
            num_epochs,
            final_loss: None,
            final_accuracy: None,
            trained_at: chrono::Local::now().to_rfc3339(),
        }
    }

    /// 最終エポックの指標を記録
    pub fn with_final_metrics(mut self, loss: f64, accuracy: f64) -> Self {
        self.final_loss = Some(loss);
        self.final_accuracy = Some(accuracy);
        self
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize metadata from JSON")
    }

    /// メタデータをログに出力
    pub fn log_info(&self) {
        tracing::info!("=== チェックポイントメタデータ ===");
        tracing::info!("形式バージョン: {}", self.format_version);
        tracing::info!("クラス: {}", self.class_labels.join(", "));
        tracing::info!(
            "入力サイズ: {}x{}, 基本チャネル数: {}, 隠れ層: {}, ドロップアウト: {}",
            self.architecture.image_size,
            self.architecture.image_size,
            self.architecture.base_channels,
            self.architecture.hidden_size,
            self.architecture.dropout
        );
        tracing::info!("学習エポック数: {}", self.num_epochs);
        if let (Some(loss), Some(acc)) = (self.final_loss, self.final_accuracy) {
            tracing::info!("最終損失: {:.4}, 最終精度: {:.2}%", loss, acc);
        }
        tracing::info!("学習日時: {}", self.trained_at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_round_trip_keeps_architecture() {
        let arch = RetinaCnnConfig::new(4).with_image_size(64);
        let metadata = CheckpointMetadata::new(arch, vec!["a".into(), "b".into()], 3)
            .with_final_metrics(0.25, 91.5);

        let json = metadata.to_json_string().unwrap();
        let parsed = CheckpointMetadata::from_json_string(&json).unwrap();

        assert_eq!(parsed.format_version, CHECKPOINT_FORMAT_VERSION);
        assert_eq!(parsed.architecture, metadata.architecture);
        assert_eq!(parsed.class_labels, vec!["a", "b"]);
        assert_eq!(parsed.final_accuracy, Some(91.5));
    }

    #[test]
    fn test_from_invalid_json_fails() {
        assert!(CheckpointMetadata::from_json_string("{}").is_err());
    }
}
