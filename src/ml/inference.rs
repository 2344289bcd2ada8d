//! モデル推論機能
//!
//! 確率分布から上位候補と最終判定を作る処理は純粋関数として分けてあり、
//! モデルなしでもテストできます。

use std::path::Path;

use burn::tensor::backend::Backend;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::ml::ml_model::{RetinaCnn, RetinaCnnConfig};
use crate::ml::preprocess::{ImagePreprocessor, ImageTensor};
use crate::ml::registry::ClassRegistry;
use crate::model::{load_checkpoint, CheckpointMetadata, InferenceConfig, UNCERTAIN_LABEL};

/// 確信度が低いときのメッセージ
pub const UNCERTAIN_MESSAGE: &str =
    "Image does not appear to contain a recognizable retina pattern.";

/// 上位候補
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopPrediction {
    pub class: String,
    pub confidence: f64,
}

/// 1枚の画像に対する判定結果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionResult {
    /// 報告するラベル（しきい値未満なら "uncertain"）
    pub prediction: String,
    /// 最大確率（小数第4位で丸め）
    pub confidence: f64,
    /// 確率の降順（丸めない）。ゲートの結果によらず本来のラベル
    pub top_predictions: Vec<TopPrediction>,
    pub message: String,
    pub timestamp: String,
    #[serde(skip)]
    pub class_index: usize,
}

impl PredictionResult {
    pub fn is_uncertain(&self) -> bool {
        self.prediction == UNCERTAIN_LABEL
    }
}

/// 数値的に安定なソフトマックス
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// 確率の降順に並べたインデックスの先頭 k 件
///
/// 同じ確率のクラスはインデックスの小さい順。
pub fn rank_top_k(probabilities: &[f32], k: usize) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..probabilities.len()).collect();
    indices.sort_by(|&a, &b| probabilities[b].total_cmp(&probabilities[a]));
    indices.truncate(k);
    indices
}

fn round4(value: f32) -> f64 {
    (value as f64 * 10_000.0).round() / 10_000.0
}

/// 確率分布から最終判定を作る
pub fn decide(
    probabilities: &[f32],
    registry: &ClassRegistry,
    config: &InferenceConfig,
) -> Result<PredictionResult> {
    if probabilities.len() != registry.len() {
        return Err(Error::inference(format!(
            "出力の長さ {} がクラス数 {} と一致しません",
            probabilities.len(),
            registry.len()
        )));
    }
    if probabilities.iter().any(|p| !p.is_finite()) {
        return Err(Error::inference("確率に有限でない値が含まれています"));
    }

    let ranked = rank_top_k(probabilities, config.effective_top_k(registry.len()));
    let label_of = |index: usize| {
        registry
            .label(index)
            .map(str::to_string)
            .ok_or_else(|| Error::inference(format!("クラスID {} にラベルがありません", index)))
    };

    let top_predictions = ranked
        .iter()
        .map(|&index| {
            Ok(TopPrediction {
                class: label_of(index)?,
                confidence: probabilities[index] as f64,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let class_index = ranked
        .first()
        .copied()
        .ok_or_else(|| Error::inference("候補がありません"))?;
    let confidence = probabilities[class_index];
    let label = label_of(class_index)?;

    let (prediction, message) = if config.passes(confidence) {
        let message = format!(
            "Detected {} with {:.2}% confidence.",
            label,
            confidence as f64 * 100.0
        );
        (label, message)
    } else {
        (UNCERTAIN_LABEL.to_string(), UNCERTAIN_MESSAGE.to_string())
    };

    Ok(PredictionResult {
        prediction,
        confidence: round4(confidence),
        top_predictions,
        message,
        timestamp: chrono::Local::now().to_rfc3339(),
        class_index,
    })
}

/// 推論エンジン
///
/// 推論用バックエンド（自動微分なし）で動くため、ドロップアウトは常に無効です。
pub struct InferenceEngine<B: Backend> {
    model: RetinaCnn<B>,
    registry: ClassRegistry,
    preprocessor: ImagePreprocessor,
    config: InferenceConfig,
    metadata: Option<CheckpointMetadata>,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    /// チェックポイントを読み込んで推論エンジンを初期化
    pub fn load(
        checkpoint: &Path,
        registry: ClassRegistry,
        expected: &RetinaCnnConfig,
        config: InferenceConfig,
        device: B::Device,
    ) -> Result<Self> {
        let (model, metadata) = load_checkpoint::<B>(checkpoint, expected, &registry, &device)?;
        metadata.log_info();

        let mut engine = Self::from_model(model, registry, config, device)?;
        engine.preprocessor = ImagePreprocessor::new(metadata.architecture.image_size as u32);
        engine.metadata = Some(metadata);
        Ok(engine)
    }

    /// 読み込み済みのモデルから初期化
    pub fn from_model(
        model: RetinaCnn<B>,
        registry: ClassRegistry,
        config: InferenceConfig,
        device: B::Device,
    ) -> Result<Self> {
        if model.num_classes() != registry.len() {
            return Err(Error::CheckpointMismatch(format!(
                "モデルの出力クラス数 {} がクラス数 {} と一致しません",
                model.num_classes(),
                registry.len()
            )));
        }

        Ok(Self {
            model,
            registry,
            preprocessor: ImagePreprocessor::default(),
            config,
            metadata: None,
            device,
        })
    }

    /// モデルへの入力画像サイズを指定
    pub fn with_image_size(mut self, image_size: u32) -> Self {
        self.preprocessor = ImagePreprocessor::new(image_size);
        self
    }

    pub fn registry(&self) -> &ClassRegistry {
        &self.registry
    }

    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    pub fn metadata(&self) -> Option<&CheckpointMetadata> {
        self.metadata.as_ref()
    }

    pub fn preprocessor(&self) -> &ImagePreprocessor {
        &self.preprocessor
    }

    /// 前処理済みテンソルを分類
    pub fn predict(&self, tensor: &ImageTensor) -> Result<PredictionResult> {
        let expected = self.preprocessor.image_size() as usize;
        if tensor.size() != expected {
            return Err(Error::inference(format!(
                "入力サイズ {} はモデルの入力サイズ {} と一致しません",
                tensor.size(),
                expected
            )));
        }

        let logits = self
            .model
            .forward(tensor.to_batch::<B>(&self.device))
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| Error::inference(format!("出力テンソルの読み出しに失敗しました: {:?}", e)))?;

        let probabilities = softmax(&logits);
        let result = decide(&probabilities, &self.registry, &self.config)?;

        tracing::debug!(
            "推論結果: {} ({:.4}), 上位: {:?}",
            result.prediction,
            result.confidence,
            result.top_predictions
        );

        Ok(result)
    }

    /// 画像バイト列をデコードして分類
    pub fn predict_bytes(&self, bytes: &[u8]) -> Result<PredictionResult> {
        let image = ImagePreprocessor::decode(bytes)?;
        let tensor = self.preprocessor.prepare_eval(&image)?;
        self.predict(&tensor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{cpu_device, CpuBackend};
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    fn four_labels() -> ClassRegistry {
        ClassRegistry::from_labels(["cataract", "diabetic-retinopathy", "glaucoma", "normal"]).unwrap()
    }

    fn tiny_engine() -> InferenceEngine<CpuBackend> {
        let device = cpu_device();
        let model = RetinaCnnConfig::new(4)
            .with_image_size(16)
            .with_base_channels(4)
            .with_hidden_size(8)
            .init::<CpuBackend>(&device)
            .unwrap();
        InferenceEngine::from_model(model, four_labels(), InferenceConfig::default(), device)
            .unwrap()
            .with_image_size(16)
    }

    fn png_bytes() -> Vec<u8> {
        let img = RgbImage::from_fn(30, 24, |x, y| Rgb([(x * 8) as u8, (y * 10) as u8, 90]));
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png).unwrap();
        bytes
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let probs = softmax(&[2.0, 1.0, 0.1, -3.0]);
        let sum: f32 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(probs.iter().all(|p| (0.0..=1.0).contains(p)));
        assert!(probs[0] > probs[1] && probs[1] > probs[2]);
    }

    #[test]
    fn test_softmax_large_logits_stay_finite() {
        let probs = softmax(&[1000.0, 999.0]);
        assert!(probs.iter().all(|p| p.is_finite()));
    }

    #[test]
    fn test_rank_top_k_breaks_ties_by_index() {
        assert_eq!(rank_top_k(&[0.2, 0.4, 0.2, 0.2], 3), vec![1, 0, 2]);
        assert_eq!(rank_top_k(&[0.5, 0.5], 3), vec![0, 1]);
    }

    #[test]
    fn test_confident_prediction() {
        let result = decide(&[0.70, 0.10, 0.12, 0.08], &four_labels(), &InferenceConfig::default())
            .unwrap();

        assert_eq!(result.prediction, "cataract");
        assert_eq!(result.confidence, 0.7);
        assert!(!result.is_uncertain());
        let expected = [("cataract", 0.70), ("glaucoma", 0.12), ("diabetic-retinopathy", 0.10)];
        assert_eq!(result.top_predictions.len(), expected.len());
        for (p, (class, confidence)) in result.top_predictions.iter().zip(expected) {
            assert_eq!(p.class, class);
            assert!((p.confidence - confidence).abs() < 1e-6);
        }
        assert_eq!(result.message, "Detected cataract with 70.00% confidence.");
    }

    #[test]
    fn test_top_k_keeps_unrounded_probabilities() {
        let registry = ClassRegistry::from_labels(["a", "b", "c"]).unwrap();
        let result = decide(&[0.33336, 0.33333, 0.33331], &registry, &InferenceConfig::default())
            .unwrap();

        let confidences: Vec<f64> = result.top_predictions.iter().map(|p| p.confidence).collect();
        assert!(confidences.windows(2).all(|w| w[0] > w[1]));
        assert!((confidences[0] - 0.33336).abs() < 1e-6);
        // 全体の確信度だけは4桁に丸める
        assert_eq!(result.confidence, 0.3334);
    }

    #[test]
    fn test_low_confidence_is_uncertain() {
        let result = decide(&[0.40, 0.35, 0.15, 0.10], &four_labels(), &InferenceConfig::default())
            .unwrap();

        assert_eq!(result.prediction, UNCERTAIN_LABEL);
        assert_eq!(result.message, UNCERTAIN_MESSAGE);
        assert_eq!(result.confidence, 0.4);
        assert_eq!(result.class_index, 0);
        // 上位候補は本来のラベルのまま
        assert_eq!(result.top_predictions[0].class, "cataract");
        assert_eq!(result.top_predictions.len(), 3);
    }

    #[test]
    fn test_threshold_boundary() {
        let registry = four_labels();
        let config = InferenceConfig::default();

        let at = decide(&[0.65, 0.15, 0.1, 0.1], &registry, &config).unwrap();
        assert_eq!(at.prediction, "cataract");

        let below = decide(&[0.6499, 0.1501, 0.1, 0.1], &registry, &config).unwrap();
        assert_eq!(below.prediction, UNCERTAIN_LABEL);
    }

    #[test]
    fn test_top_k_limited_by_class_count() {
        let registry = ClassRegistry::from_labels(["a", "b"]).unwrap();
        let result = decide(&[0.1, 0.9], &registry, &InferenceConfig::default()).unwrap();

        assert_eq!(result.top_predictions.len(), 2);
        assert_eq!(result.prediction, "b");
    }

    #[test]
    fn test_length_mismatch_is_inference_error() {
        let result = decide(&[0.5, 0.5], &four_labels(), &InferenceConfig::default());
        assert!(matches!(result, Err(Error::Inference { .. })));
    }

    #[test]
    fn test_predict_bytes_is_idempotent() {
        let engine = tiny_engine();
        let bytes = png_bytes();

        let first = engine.predict_bytes(&bytes).unwrap();
        let second = engine.predict_bytes(&bytes).unwrap();

        assert_eq!(first.prediction, second.prediction);
        assert_eq!(first.confidence, second.confidence);
        assert_eq!(first.top_predictions, second.top_predictions);
        assert_eq!(first.top_predictions.len(), 3);
    }

    #[test]
    fn test_predict_bytes_rejects_garbage() {
        let engine = tiny_engine();
        let result = engine.predict_bytes(b"definitely not an image");
        assert!(matches!(result, Err(Error::InvalidImage(_))));
    }

    #[test]
    fn test_predict_rejects_wrong_tensor_size() {
        let engine = tiny_engine();
        let tensor = ImageTensor::from_vec(vec![0.0; 3 * 8 * 8], 8).unwrap();
        assert!(matches!(engine.predict(&tensor), Err(Error::Inference { .. })));
    }

    #[test]
    fn test_engine_rejects_class_count_mismatch() {
        let device = cpu_device();
        let model = RetinaCnnConfig::new(3)
            .with_image_size(16)
            .with_base_channels(4)
            .with_hidden_size(8)
            .init::<CpuBackend>(&device)
            .unwrap();
        let result =
            InferenceEngine::from_model(model, four_labels(), InferenceConfig::default(), device);
        assert!(matches!(result, Err(Error::CheckpointMismatch(_))));
    }
}
