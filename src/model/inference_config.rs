//! 推論時の判定ポリシー設定

use serde::{Deserialize, Serialize};

/// 信頼度しきい値の既定値（この値ちょうどは「確信あり」）
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.65;

/// 上位候補数の既定値
pub const DEFAULT_TOP_K: usize = 3;

/// 確信度が低い場合に報告するラベル
pub const UNCERTAIN_LABEL: &str = "uncertain";

/// 推論ポリシー
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// これ未満の確率は "uncertain" として報告する
    pub confidence_threshold: f32,
    /// 報告する上位候補数（クラス数で頭打ち）
    pub top_k: usize,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            top_k: DEFAULT_TOP_K,
        }
    }
}

impl InferenceConfig {
    /// 実際に返す上位候補数
    pub fn effective_top_k(&self, num_classes: usize) -> usize {
        self.top_k.min(num_classes)
    }

    /// しきい値を満たすか（境界値を含む）
    pub fn passes(&self, confidence: f32) -> bool {
        confidence >= self.confidence_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_is_inclusive() {
        let config = InferenceConfig::default();
        assert!(config.passes(0.65));
        assert!(!config.passes(0.6499));
        assert!(config.passes(1.0));
    }

    #[test]
    fn test_effective_top_k() {
        let config = InferenceConfig::default();
        assert_eq!(config.effective_top_k(4), 3);
        assert_eq!(config.effective_top_k(2), 2);
    }
}
