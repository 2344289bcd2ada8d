//! クラスラベル一覧
//!
//! ラベルの並び順がモデル出力のインデックスを決めます。学習時と推論時で
//! 同じ順序である必要があります。

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// データセットディレクトリが無い場合の既定ラベル
pub const DEFAULT_CLASS_LABELS: [&str; 4] =
    ["cataract", "diabetic-retinopathy", "glaucoma", "normal"];

/// 順序付き・重複なしのクラスラベル一覧
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClassRegistry {
    labels: Vec<String>,
}

impl ClassRegistry {
    /// ラベル一覧から作成（空・重複はエラー）
    pub fn from_labels<I, S>(labels: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let labels: Vec<String> = labels.into_iter().map(Into::into).collect();

        if labels.is_empty() {
            return Err(Error::Configuration("クラスラベルが1つもありません".to_string()));
        }
        for (i, label) in labels.iter().enumerate() {
            if labels[..i].contains(label) {
                return Err(Error::Configuration(format!(
                    "クラスラベルが重複しています: {}",
                    label
                )));
            }
        }

        Ok(Self { labels })
    }

    /// データセットディレクトリの直下サブディレクトリ名から作成
    ///
    /// ファイルシステムの列挙順ではなく辞書順に並べます。ディレクトリが
    /// 存在しない場合は既定の4ラベルを使います。
    pub fn build(dataset_dir: &Path) -> Result<Self> {
        if !dataset_dir.is_dir() {
            // 既定ラベルは学習済みチェックポイントの順序と一致する保証が無い
            tracing::warn!(
                "データセットディレクトリが見つかりません ({})。既定のクラス一覧を使用します: {}",
                dataset_dir.display(),
                DEFAULT_CLASS_LABELS.join(", ")
            );
            return Self::default_labels();
        }

        let mut labels = Vec::new();
        for entry in std::fs::read_dir(dataset_dir)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| {
                    Error::Configuration(format!("不正なディレクトリ名: {}", path.display()))
                })?
                .to_string();
            labels.push(name);
        }
        labels.sort();

        if labels.is_empty() {
            return Err(Error::Configuration(format!(
                "クラスディレクトリがありません: {}",
                dataset_dir.display()
            )));
        }

        tracing::info!("クラスを検出しました: {}", labels.join(", "));
        Self::from_labels(labels)
    }

    /// 既定の4ラベル
    pub fn default_labels() -> Result<Self> {
        Self::from_labels(DEFAULT_CLASS_LABELS)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// インデックスからラベルを取得
    pub fn label(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    /// ラベルからインデックスを取得
    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.labels.iter().position(|l| l == label)
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_sorts_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["normal", "cataract", "glaucoma", "dr"] {
            std::fs::create_dir(dir.path().join(name)).unwrap();
        }
        // ファイルはラベルにならない
        std::fs::write(dir.path().join("README.txt"), "x").unwrap();

        let registry = ClassRegistry::build(dir.path()).unwrap();

        assert_eq!(registry.labels(), ["cataract", "dr", "glaucoma", "normal"]);
        assert_eq!(registry.index_of("glaucoma"), Some(2));
        assert_eq!(registry.label(3), Some("normal"));
        assert_eq!(registry.label(4), None);
    }

    #[test]
    fn test_missing_directory_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ClassRegistry::build(&dir.path().join("missing")).unwrap();

        assert_eq!(registry.labels(), DEFAULT_CLASS_LABELS);
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn test_empty_directory_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ClassRegistry::build(dir.path()).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_duplicates_and_empty_are_rejected() {
        assert!(ClassRegistry::from_labels(["a", "b", "a"]).is_err());
        assert!(ClassRegistry::from_labels(Vec::<String>::new()).is_err());
    }

    #[test]
    fn test_serializes_as_plain_list() {
        let registry = ClassRegistry::from_labels(["x", "y"]).unwrap();
        assert_eq!(serde_json::to_string(&registry).unwrap(), r#"["x","y"]"#);
    }
}
