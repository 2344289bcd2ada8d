//! 推論ワーカー
//!
//! モデルは専用スレッドの中で読み込み、そのスレッドだけが触ります。
//! リクエストは有界キューで受け取り、結果は oneshot チャネルで返します。

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::time::Duration;

use burn::tensor::backend::Backend;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};
use crate::ml::{ClassRegistry, InferenceEngine, PredictionResult, RetinaCnnConfig};
use crate::model::{CheckpointMetadata, InferenceConfig};

/// ワーカーの起動設定
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub checkpoint_path: PathBuf,
    pub registry: ClassRegistry,
    pub architecture: RetinaCnnConfig,
    pub inference: InferenceConfig,
    pub queue_capacity: usize,
    pub timeout: Option<Duration>,
}

struct PredictJob {
    bytes: Vec<u8>,
    reply: oneshot::Sender<Result<PredictionResult>>,
}

/// 推論ワーカーへのハンドル（複製して共有できる）
#[derive(Clone)]
pub struct InferenceWorker {
    sender: mpsc::Sender<PredictJob>,
    timeout: Option<Duration>,
    metadata: Option<CheckpointMetadata>,
}

impl InferenceWorker {
    /// ワーカースレッドを起動し、モデルの読み込み完了を待つ
    ///
    /// 読み込みに失敗した場合はそのエラーを返し、スレッドは終了します。
    pub async fn spawn<B, F>(settings: WorkerSettings, make_device: F) -> Result<Self>
    where
        B: Backend,
        F: FnOnce() -> B::Device + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel::<PredictJob>(settings.queue_capacity.max(1));
        let (ready_tx, ready_rx) = oneshot::channel::<Result<Option<CheckpointMetadata>>>();
        let timeout = settings.timeout;

        std::thread::Builder::new()
            .name("inference-worker".to_string())
            .spawn(move || {
                // バックエンドのデバイスはこのスレッド内で初期化する
                let device = make_device();
                let engine = match InferenceEngine::<B>::load(
                    &settings.checkpoint_path,
                    settings.registry,
                    &settings.architecture,
                    settings.inference,
                    device,
                ) {
                    Ok(engine) => engine,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                let _ = ready_tx.send(Ok(engine.metadata().cloned()));
                run_loop(&engine, receiver);
                tracing::info!("推論ワーカーを終了しました");
            })
            .map_err(|e| Error::inference_with("推論ワーカーを起動できません", e))?;

        let metadata = ready_rx
            .await
            .map_err(|_| Error::inference("推論ワーカーが起動中に停止しました"))??;

        tracing::info!("推論ワーカーの準備ができました");

        Ok(Self {
            sender,
            timeout,
            metadata,
        })
    }

    /// 読み込んだチェックポイントのメタデータ
    pub fn metadata(&self) -> Option<&CheckpointMetadata> {
        self.metadata.as_ref()
    }

    /// ワーカーがまだリクエストを受け付けているか
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }

    /// 画像バイト列を推論キューへ送り、結果を待つ
    pub async fn predict(&self, bytes: Vec<u8>) -> Result<PredictionResult> {
        let request = async {
            let (reply, response) = oneshot::channel();
            self.sender
                .send(PredictJob { bytes, reply })
                .await
                .map_err(|_| Error::inference("推論ワーカーが停止しています"))?;
            response
                .await
                .map_err(|_| Error::inference("推論ワーカーが応答せずに終了しました"))?
        };

        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, request).await.map_err(|_| {
                Error::inference(format!("推論が {} 秒以内に完了しませんでした", limit.as_secs()))
            })?,
            None => request.await,
        }
    }
}

fn run_loop<B: Backend>(engine: &InferenceEngine<B>, mut receiver: mpsc::Receiver<PredictJob>) {
    while let Some(job) = receiver.blocking_recv() {
        // 呼び出し側が待つのをやめていれば計算しない
        if job.reply.is_closed() {
            continue;
        }

        let result = catch_unwind(AssertUnwindSafe(|| engine.predict_bytes(&job.bytes)))
            .unwrap_or_else(|panic| {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "不明なエラー".to_string());
                tracing::error!("推論中にパニックが発生しました: {}", detail);
                Err(Error::inference(format!("推論中に内部エラーが発生しました: {}", detail)))
            });

        let _ = job.reply.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{cpu_device, CpuBackend};
    use crate::model::{save_checkpoint, CheckpointMetadata};
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    fn tiny_config() -> RetinaCnnConfig {
        RetinaCnnConfig::new(2)
            .with_image_size(16)
            .with_base_channels(4)
            .with_hidden_size(8)
    }

    fn settings(dir: &std::path::Path) -> WorkerSettings {
        let config = tiny_config();
        let model = config.init::<CpuBackend>(&cpu_device()).unwrap();
        let metadata = CheckpointMetadata::new(config.clone(), vec!["a".into(), "b".into()], 1);
        let path = save_checkpoint(&dir.join("model"), &metadata, &model).unwrap();

        WorkerSettings {
            checkpoint_path: path,
            registry: ClassRegistry::from_labels(["a", "b"]).unwrap(),
            architecture: config,
            inference: InferenceConfig::default(),
            queue_capacity: 4,
            timeout: Some(Duration::from_secs(30)),
        }
    }

    fn png_bytes() -> Vec<u8> {
        let img = RgbImage::from_pixel(24, 24, Rgb([120, 40, 10]));
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png).unwrap();
        bytes
    }

    #[tokio::test]
    async fn test_worker_serves_predictions() {
        let dir = tempfile::tempdir().unwrap();
        let worker = InferenceWorker::spawn::<CpuBackend, _>(settings(dir.path()), cpu_device)
            .await
            .unwrap();

        assert!(worker.is_alive());
        assert!(worker.metadata().is_some());

        let result = worker.predict(png_bytes()).await.unwrap();
        assert_eq!(result.top_predictions.len(), 2);
    }

    #[tokio::test]
    async fn test_bad_image_does_not_stop_worker() {
        let dir = tempfile::tempdir().unwrap();
        let worker = InferenceWorker::spawn::<CpuBackend, _>(settings(dir.path()), cpu_device)
            .await
            .unwrap();

        let bad = worker.predict(b"garbage".to_vec()).await;
        assert!(matches!(bad, Err(Error::InvalidImage(_))));

        assert!(worker.predict(png_bytes()).await.is_ok());
    }

    #[tokio::test]
    async fn test_startup_error_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path());
        settings.registry = ClassRegistry::from_labels(["a", "b", "c"]).unwrap();

        let result = InferenceWorker::spawn::<CpuBackend, _>(settings, cpu_device).await;
        assert!(matches!(result, Err(Error::CheckpointMismatch(_))));
    }
}
