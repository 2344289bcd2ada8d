//! モデル学習
//!
//! エポックごとにデータセットをシャッフルし、バッチを順番に処理します。
//! バッチ i の更新はバッチ i+1 の勾配計算より前に反映されます。

use std::path::{Path, PathBuf};

use burn::{
    config::Config,
    data::dataset::Dataset,
    module::AutodiffModule,
    optim::{AdamConfig, GradientsParams, Optimizer},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor,
    },
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::error::Error;
use crate::ml::ml_model::{RetinaCnn, RetinaCnnConfig, IN_CHANNELS};
use crate::ml::preprocess::{ImagePreprocessor, PreprocessMode};
use crate::ml::registry::ClassRegistry;
use crate::model::{save_checkpoint, CheckpointMetadata};

/// 学習対象とする画像拡張子
const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

/// 学習設定
#[derive(Config, Debug)]
pub struct TrainingConfig {
    /// エポック数
    #[config(default = 10)]
    pub num_epochs: usize,
    /// バッチサイズ
    #[config(default = 32)]
    pub batch_size: usize,
    /// 学習率
    #[config(default = 1e-3)]
    pub learning_rate: f64,
    /// シャッフルとデータ拡張の乱数シード
    #[config(default = 42)]
    pub seed: u64,
    /// 検証用に取り分ける割合（0で分割しない）
    #[config(default = 0.0)]
    pub validation_ratio: f32,
}

/// 学習データセット（パスのリストのみ保持）
#[derive(Debug, Clone)]
pub struct RetinaDataset {
    samples: Vec<(PathBuf, usize)>, // (画像パス, クラスID)
    class_names: Vec<String>,
}

/// データセットアイテム（画像パスのみ保持）
#[derive(Clone, Debug)]
pub struct RetinaItem {
    pub path: PathBuf,
    pub label: usize,
}

impl RetinaDataset {
    /// クラス一覧の順序でディレクトリから学習データを読み込む
    pub fn from_directory(
        data_dir: &Path,
        registry: &ClassRegistry,
    ) -> crate::error::Result<Self> {
        let mut samples = Vec::new();

        for (class_id, class_name) in registry.iter().enumerate() {
            let class_dir = data_dir.join(class_name);
            if !class_dir.is_dir() {
                tracing::warn!("クラスディレクトリが存在しません: {}", class_dir.display());
                continue;
            }

            let mut paths = Vec::new();
            for entry in std::fs::read_dir(&class_dir)? {
                let path = entry?.path();
                if path.is_file() && has_image_extension(&path) {
                    paths.push(path);
                }
            }
            // 列挙順をファイルシステムに依存させない
            paths.sort();

            tracing::info!("  クラス {}: {} ({} 枚)", class_id, class_name, paths.len());
            samples.extend(paths.into_iter().map(|p| (p, class_id)));
        }

        if samples.is_empty() {
            return Err(Error::Configuration(format!(
                "学習データが見つかりません: {}",
                data_dir.display()
            )));
        }

        tracing::info!(
            "{} クラスから {} 枚の画像を読み込みました",
            registry.len(),
            samples.len()
        );

        Ok(Self {
            samples,
            class_names: registry.labels().to_vec(),
        })
    }

    /// サンプル一覧から作成
    pub fn from_samples(
        samples: Vec<(PathBuf, usize)>,
        registry: &ClassRegistry,
    ) -> crate::error::Result<Self> {
        if let Some((path, label)) = samples.iter().find(|(_, l)| *l >= registry.len()) {
            return Err(Error::Configuration(format!(
                "クラスID {} は範囲外です: {}",
                label,
                path.display()
            )));
        }
        Ok(Self {
            samples,
            class_names: registry.labels().to_vec(),
        })
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    /// クラスごとの枚数
    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.class_names.len()];
        for (_, label) in &self.samples {
            counts[*label] += 1;
        }
        counts
    }

    /// データセットを学習用と検証用に分割
    pub fn split(self, train_ratio: f32, seed: u64) -> (Self, Self) {
        let mut samples = self.samples;
        let mut rng = StdRng::seed_from_u64(seed);
        samples.shuffle(&mut rng);

        let train_len = (samples.len() as f32 * train_ratio) as usize;
        let valid_samples = samples.split_off(train_len);

        (
            Self {
                samples,
                class_names: self.class_names.clone(),
            },
            Self {
                samples: valid_samples,
                class_names: self.class_names,
            },
        )
    }
}

impl Dataset<RetinaItem> for RetinaDataset {
    fn get(&self, index: usize) -> Option<RetinaItem> {
        let (path, label) = self.samples.get(index)?;
        Some(RetinaItem {
            path: path.clone(),
            label: *label,
        })
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct RetinaBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

/// エポックごとの指標
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochMetrics {
    /// 1始まりのエポック番号
    pub epoch: usize,
    /// バッチ平均損失の平均
    pub loss: f64,
    /// top-1 正解率（%）
    pub accuracy: f64,
    pub valid_loss: Option<f64>,
    pub valid_accuracy: Option<f64>,
}

/// 学習結果の指標一覧
#[derive(Debug, Clone, Default, Serialize)]
pub struct TrainingReport {
    pub epochs: Vec<EpochMetrics>,
}

impl TrainingReport {
    pub fn last(&self) -> Option<&EpochMetrics> {
        self.epochs.last()
    }
}

/// 学習済みモデルと指標
pub struct TrainingOutcome<B: AutodiffBackend> {
    pub model: RetinaCnn<B>,
    pub report: TrainingReport,
}

/// エポックの処理順（乱数源から毎回新しく引く）
pub fn epoch_order<R: Rng>(len: usize, rng: &mut R) -> Vec<usize> {
    let mut order: Vec<usize> = (0..len).collect();
    order.shuffle(rng);
    order
}

/// 学習ループ
pub struct Trainer<B: AutodiffBackend> {
    config: TrainingConfig,
    preprocessor: ImagePreprocessor,
    device: B::Device,
    rng: StdRng,
}

impl<B: AutodiffBackend> Trainer<B> {
    /// シードから乱数源を作って初期化
    pub fn new(config: TrainingConfig, preprocessor: ImagePreprocessor, device: B::Device) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self::with_rng(config, preprocessor, device, rng)
    }

    /// 乱数源を外から与えて初期化
    pub fn with_rng(
        config: TrainingConfig,
        preprocessor: ImagePreprocessor,
        device: B::Device,
        rng: StdRng,
    ) -> Self {
        Self {
            config,
            preprocessor,
            device,
            rng,
        }
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// 固定エポック数だけ学習し、最終状態のモデルを返す
    ///
    /// 早期終了やベストモデル選択は行いません。
    pub fn fit<F>(
        &mut self,
        model: RetinaCnn<B>,
        train: &RetinaDataset,
        valid: Option<&RetinaDataset>,
        mut on_epoch: F,
    ) -> crate::error::Result<TrainingOutcome<B>>
    where
        F: FnMut(&EpochMetrics),
    {
        if train.is_empty() {
            return Err(Error::Configuration("学習データセットが空です".to_string()));
        }
        if self.config.batch_size == 0 {
            return Err(Error::Configuration("バッチサイズは1以上である必要があります".to_string()));
        }
        if model.num_classes() != train.num_classes() {
            return Err(Error::Configuration(format!(
                "モデルの出力クラス数 {} がデータセットのクラス数 {} と一致しません",
                model.num_classes(),
                train.num_classes()
            )));
        }

        tracing::info!(
            "学習を開始します: エポック数 {}, バッチサイズ {}, 学習率 {}, 学習データ {} 枚",
            self.config.num_epochs,
            self.config.batch_size,
            self.config.learning_rate,
            train.len()
        );

        let device = self.device.clone();
        let mut optimizer = AdamConfig::new().init::<B, RetinaCnn<B>>();
        let mut model = model;
        let mut report = TrainingReport::default();

        for epoch in 1..=self.config.num_epochs {
            let order = epoch_order(train.len(), &mut self.rng);
            let num_batches = order.len().div_ceil(self.config.batch_size);

            let mut total_loss = 0.0;
            let mut correct = 0usize;
            let mut total = 0usize;

            for (batch_idx, indices) in order.chunks(self.config.batch_size).enumerate() {
                let batch = self.build_batch::<B>(train, indices, PreprocessMode::Train, &device)?;
                let output = model.forward_classification(batch.images, batch.targets);

                let loss_value: f64 = output.loss.clone().into_scalar().elem();
                total_loss += loss_value;
                correct += count_correct(output.output, output.targets);
                total += indices.len();

                let grads = output.loss.backward();
                let grads = GradientsParams::from_grads(grads, &model);
                model = optimizer.step(self.config.learning_rate, model, grads);

                tracing::debug!(
                    "  Batch {}/{}: loss = {:.4}, acc = {:.2}%",
                    batch_idx + 1,
                    num_batches,
                    loss_value,
                    100.0 * correct as f64 / total as f64
                );
            }

            let mut metrics = EpochMetrics {
                epoch,
                loss: total_loss / num_batches as f64,
                accuracy: 100.0 * correct as f64 / total as f64,
                valid_loss: None,
                valid_accuracy: None,
            };

            if let Some(valid) = valid.filter(|v| !v.is_empty()) {
                let (loss, accuracy) = self.evaluate(&model.valid(), valid)?;
                metrics.valid_loss = Some(loss);
                metrics.valid_accuracy = Some(accuracy);
            }

            match (metrics.valid_loss, metrics.valid_accuracy) {
                (Some(vl), Some(va)) => tracing::info!(
                    "Epoch [{}/{}] | Loss: {:.4} | Accuracy: {:.2}% | Val Loss: {:.4} | Val Accuracy: {:.2}%",
                    epoch,
                    self.config.num_epochs,
                    metrics.loss,
                    metrics.accuracy,
                    vl,
                    va
                ),
                _ => tracing::info!(
                    "Epoch [{}/{}] | Loss: {:.4} | Accuracy: {:.2}%",
                    epoch,
                    self.config.num_epochs,
                    metrics.loss,
                    metrics.accuracy
                ),
            }

            on_epoch(&metrics);
            report.epochs.push(metrics);
        }

        Ok(TrainingOutcome { model, report })
    }

    /// 検証データでの平均損失と正解率（%）
    fn evaluate(
        &mut self,
        model: &RetinaCnn<B::InnerBackend>,
        dataset: &RetinaDataset,
    ) -> crate::error::Result<(f64, f64)> {
        let device = self.device.clone();
        let indices: Vec<usize> = (0..dataset.len()).collect();
        let mut total_loss = 0.0;
        let mut num_batches = 0usize;
        let mut correct = 0usize;

        for chunk in indices.chunks(self.config.batch_size) {
            let batch =
                self.build_batch::<B::InnerBackend>(dataset, chunk, PreprocessMode::Eval, &device)?;
            let output = model.forward_classification(batch.images, batch.targets);
            total_loss += output.loss.into_scalar().elem::<f64>();
            correct += count_correct(output.output, output.targets);
            num_batches += 1;
        }

        Ok((
            total_loss / num_batches as f64,
            100.0 * correct as f64 / dataset.len() as f64,
        ))
    }

    /// 画像をロード・前処理して1回の転送でバッチ化
    fn build_batch<Bk: Backend>(
        &mut self,
        dataset: &RetinaDataset,
        indices: &[usize],
        mode: PreprocessMode,
        device: &Bk::Device,
    ) -> crate::error::Result<RetinaBatch<Bk>> {
        let size = self.preprocessor.image_size() as usize;
        let mut all_pixels = Vec::with_capacity(indices.len() * IN_CHANNELS * size * size);
        let mut targets = Vec::with_capacity(indices.len());

        for &index in indices {
            let item = dataset
                .get(index)
                .ok_or_else(|| Error::Configuration(format!("インデックス {} は範囲外です", index)))?;
            let image = ImagePreprocessor::open(&item.path)?;
            let tensor = self.preprocessor.prepare(&image, mode, &mut self.rng)?;
            all_pixels.extend_from_slice(tensor.as_slice());
            targets.push(item.label as i64);
        }

        let images = Tensor::<Bk, 1>::from_floats(all_pixels.as_slice(), device)
            .reshape([indices.len(), IN_CHANNELS, size, size]);
        let targets = Tensor::<Bk, 1, Int>::from_ints(targets.as_slice(), device);

        Ok(RetinaBatch { images, targets })
    }
}

/// top-1 予測が正解と一致した数
fn count_correct<B: Backend>(output: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    let [batch_size, _] = output.dims();
    let predictions = output.argmax(1).reshape([batch_size]);
    let correct: i64 = predictions.equal(targets).int().sum().into_scalar().elem();
    correct as usize
}

/// ディレクトリから学習してチェックポイントを保存
///
/// 戻り値はチェックポイントのパスと学習指標。
pub fn train_model<B, F>(
    data_dir: &Path,
    registry: &ClassRegistry,
    output_path: &Path,
    model_config: RetinaCnnConfig,
    training_config: TrainingConfig,
    device: B::Device,
    progress_callback: F,
) -> crate::error::Result<(PathBuf, TrainingReport)>
where
    B: AutodiffBackend,
    F: FnMut(&EpochMetrics),
{
    if model_config.num_classes != registry.len() {
        return Err(Error::Configuration(format!(
            "モデル設定のクラス数 {} がデータセットのクラス数 {} と一致しません",
            model_config.num_classes,
            registry.len()
        )));
    }

    let dataset = RetinaDataset::from_directory(data_dir, registry)?;
    let (train, valid) = if training_config.validation_ratio > 0.0 {
        let (train, valid) =
            dataset.split(1.0 - training_config.validation_ratio, training_config.seed);
        tracing::info!("学習データ: {} 枚, 検証データ: {} 枚", train.len(), valid.len());
        (train, Some(valid))
    } else {
        (dataset, None)
    };

    let model = model_config.init::<B>(&device)?;
    let num_epochs = training_config.num_epochs;
    let preprocessor = ImagePreprocessor::new(model_config.image_size as u32);
    let mut trainer = Trainer::<B>::new(training_config, preprocessor, device);

    let outcome = trainer.fit(model, &train, valid.as_ref(), progress_callback)?;

    let mut metadata =
        CheckpointMetadata::new(model_config, registry.labels().to_vec(), num_epochs as u32);
    if let Some(last) = outcome.report.last() {
        metadata = metadata.with_final_metrics(last.loss, last.accuracy);
    }

    let path = save_checkpoint(output_path, &metadata, &outcome.model.valid())?;
    Ok((path, outcome.report))
}
