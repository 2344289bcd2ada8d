//! エラー型の定義
//!
//! 起動時エラー（設定・チェックポイント不一致）とリクエスト単位のエラー
//! （不正画像・推論失敗）を区別します。

use thiserror::Error;

/// ライブラリ全体のエラー型
#[derive(Error, Debug)]
pub enum Error {
    /// 空のデータセット、空のクラス一覧など（起動時に致命的）
    #[error("設定エラー: {0}")]
    Configuration(String),

    /// デコードできない、または不正な画像入力（リクエスト単位）
    #[error("不正な画像: {0}")]
    InvalidImage(String),

    /// チェックポイントと現在のアーキテクチャが一致しない（起動時に致命的）
    #[error("チェックポイント不一致: {0}")]
    CheckpointMismatch(String),

    /// 前処理・順伝播中の想定外の失敗（原因を保持）
    #[error("推論エラー: {message}")]
    Inference {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// アーカイブの破損や重みのデコード失敗
    #[error("チェックポイントエラー: {0}")]
    Checkpoint(String),

    #[error("IOエラー: {0}")]
    Io(#[from] std::io::Error),

    #[error("シリアライズエラー: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// 原因なしの推論エラー
    pub fn inference(message: impl Into<String>) -> Self {
        Error::Inference {
            message: message.into(),
            source: None,
        }
    }

    /// 原因付きの推論エラー
    pub fn inference_with<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Inference {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// リクエスト単位のエラーかどうか（サービスを停止させない）
    pub fn is_per_request(&self) -> bool {
        matches!(self, Error::InvalidImage(_) | Error::Inference { .. })
    }
}

impl From<image::ImageError> for Error {
    fn from(err: image::ImageError) -> Self {
        Error::InvalidImage(err.to_string())
    }
}

/// ライブラリ用のResult型
pub type Result<T> = std::result::Result<T, Error>;
