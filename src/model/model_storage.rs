//! チェックポイントの永続化
//!
//! Tar.gz形式でモデルとメタデータを1ファイルに統合して保存・読み込みします。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（アーキテクチャ、クラスラベルなど）
//! - model.bin       - モデルの重み（層名をキーとするburnレコード、f32）

use anyhow::Context;
use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::backend::Backend,
};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tar::{Archive, Builder};

use crate::error::{Error, Result};
use crate::ml::{ClassRegistry, RetinaCnn, RetinaCnnConfig};
use crate::model::model_metadata::{CheckpointMetadata, CHECKPOINT_FORMAT_VERSION};

const METADATA_ENTRY: &str = "metadata.json";
const MODEL_ENTRY: &str = "model.bin";

/// 出力パスを `.tar.gz` に正規化
pub fn checkpoint_path(output_path: &Path) -> PathBuf {
    if output_path.extension().and_then(|s| s.to_str()) == Some("gz") {
        output_path.to_path_buf()
    } else {
        output_path.with_extension("tar.gz")
    }
}

/// メタデータと共にモデルバイナリをTar.gz形式で保存
pub fn save_model_with_metadata(
    output_path: &Path,
    metadata: &CheckpointMetadata,
    model_binary: &[u8],
) -> anyhow::Result<PathBuf> {
    let tar_gz_path = checkpoint_path(output_path);

    // 親ディレクトリが存在しない場合は作成
    if let Some(parent) = tar_gz_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create parent directory: {:?}", parent))?;
        }
    }

    let tar_gz_file = File::create(&tar_gz_path)
        .with_context(|| format!("Failed to create tar.gz file: {:?}", tar_gz_path))?;

    let encoder = GzEncoder::new(tar_gz_file, Compression::default());
    let mut tar_builder = Builder::new(encoder);

    let json_str = metadata.to_json_string()?;
    append_entry(&mut tar_builder, METADATA_ENTRY, json_str.as_bytes())?;
    append_entry(&mut tar_builder, MODEL_ENTRY, model_binary)?;

    // gzipストリームまで閉じる
    tar_builder
        .into_inner()
        .context("Failed to finalize tar archive")?
        .finish()
        .context("Failed to finalize gzip stream")?;

    Ok(tar_gz_path)
}

fn append_entry<W: std::io::Write>(
    builder: &mut Builder<W>,
    name: &str,
    bytes: &[u8],
) -> anyhow::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append(&header, bytes)
        .with_context(|| format!("Failed to add {} to tar", name))
}

/// Tar.gzからメタデータとモデルバイナリを読み込む
pub fn load_model_with_metadata(
    tar_gz_path: &Path,
) -> anyhow::Result<(CheckpointMetadata, Vec<u8>)> {
    let tar_gz_file = File::open(tar_gz_path)
        .with_context(|| format!("Failed to open tar.gz file: {:?}", tar_gz_path))?;

    let decoder = GzDecoder::new(tar_gz_file);
    let mut archive = Archive::new(decoder);

    let mut metadata_opt: Option<CheckpointMetadata> = None;
    let mut model_binary_opt: Option<Vec<u8>> = None;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_path_buf();

        match path.to_str() {
            Some(METADATA_ENTRY) => {
                let mut json_str = String::new();
                entry.read_to_string(&mut json_str)?;
                metadata_opt = Some(CheckpointMetadata::from_json_string(&json_str)?);
            }
            Some(MODEL_ENTRY) => {
                let mut buffer = Vec::new();
                entry.read_to_end(&mut buffer)?;
                model_binary_opt = Some(buffer);
            }
            _ => {}
        }
    }

    match (metadata_opt, model_binary_opt) {
        (Some(metadata), Some(binary)) => Ok((metadata, binary)),
        (None, _) => Err(anyhow::anyhow!("metadata.json not found in tar.gz archive")),
        (_, None) => Err(anyhow::anyhow!("model.bin not found in tar.gz archive")),
    }
}

/// Tar.gzからメタデータのみ読み込む
pub fn load_metadata(tar_gz_path: &Path) -> anyhow::Result<CheckpointMetadata> {
    let tar_gz_file = File::open(tar_gz_path)
        .with_context(|| format!("Failed to open tar.gz file: {:?}", tar_gz_path))?;

    let decoder = GzDecoder::new(tar_gz_file);
    let mut archive = Archive::new(decoder);

    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.to_str() == Some(METADATA_ENTRY) {
            let mut json_str = String::new();
            entry.read_to_string(&mut json_str)?;
            return CheckpointMetadata::from_json_string(&json_str);
        }
    }

    Err(anyhow::anyhow!("metadata.json not found in tar.gz archive"))
}

/// 学習済みモデルをチェックポイントとして保存
pub fn save_checkpoint<B: Backend>(
    output_path: &Path,
    metadata: &CheckpointMetadata,
    model: &RetinaCnn<B>,
) -> Result<PathBuf> {
    // CompactRecorderはf16で保存してしまうためFullPrecisionを使う
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let model_binary = recorder
        .record(model.clone().into_record(), ())
        .map_err(|e| Error::Checkpoint(format!("モデル重みのシリアライズエラー: {:?}", e)))?;

    let path = save_model_with_metadata(output_path, metadata, &model_binary)
        .map_err(|e| Error::Checkpoint(format!("{:#}", e)))?;

    tracing::info!(
        "チェックポイントを保存しました: {} ({:.2} MB)",
        path.display(),
        model_binary.len() as f64 / 1024.0 / 1024.0
    );
    Ok(path)
}

/// メタデータが現在のアーキテクチャとクラス一覧に適合するか検証
pub fn validate_metadata(
    metadata: &CheckpointMetadata,
    expected: &RetinaCnnConfig,
    registry: &ClassRegistry,
) -> Result<()> {
    if metadata.format_version != CHECKPOINT_FORMAT_VERSION {
        return Err(Error::CheckpointMismatch(format!(
            "形式バージョンが異なります: {} (期待: {})",
            metadata.format_version, CHECKPOINT_FORMAT_VERSION
        )));
    }

    if metadata.architecture.num_classes != registry.len() {
        return Err(Error::CheckpointMismatch(format!(
            "出力クラス数 {} がクラス一覧の長さ {} と一致しません",
            metadata.architecture.num_classes,
            registry.len()
        )));
    }

    if !metadata.architecture.same_architecture(expected) {
        return Err(Error::CheckpointMismatch(format!(
            "アーキテクチャが一致しません: チェックポイント {:?} / 現在 {:?}",
            metadata.architecture, expected
        )));
    }

    if metadata.class_labels != registry.labels() {
        // 数は一致するが名前が違う: インデックスと名前の対応がずれている可能性
        tracing::warn!(
            "チェックポイントのクラスラベル [{}] が現在のクラス一覧 [{}] と異なります",
            metadata.class_labels.join(", "),
            registry.labels().join(", ")
        );
    }

    Ok(())
}

/// チェックポイントを検証してモデルへ読み込む
///
/// 形状の不一致は暗黙に切り詰めず、`CheckpointMismatch` として失敗します。
pub fn load_checkpoint<B: Backend>(
    tar_gz_path: &Path,
    expected: &RetinaCnnConfig,
    registry: &ClassRegistry,
    device: &B::Device,
) -> Result<(RetinaCnn<B>, CheckpointMetadata)> {
    let (metadata, model_binary) = load_model_with_metadata(tar_gz_path)
        .map_err(|e| Error::Checkpoint(format!("{:#}", e)))?;

    validate_metadata(&metadata, expected, registry)?;

    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let record = recorder
        .load(model_binary, device)
        .map_err(|e| Error::Checkpoint(format!("モデル重みの読み込みエラー: {:?}", e)))?;

    // 推論用にドロップアウト率はチェックポイント側の値を引き継ぐ（順伝播には影響しない）
    let model = metadata.architecture.init::<B>(device)?.load_record(record);

    let actual = model.parameter_shapes();
    let wanted = expected.expected_shapes();
    if actual != wanted {
        let detail = actual
            .iter()
            .zip(wanted.iter())
            .filter(|(a, w)| a != w)
            .map(|((name, a), (_, w))| format!("{}: {:?} (期待: {:?})", name, a, w))
            .collect::<Vec<_>>()
            .join(", ");
        return Err(Error::CheckpointMismatch(format!(
            "重みの形状が一致しません: {}",
            detail
        )));
    }

    tracing::info!(
        "チェックポイントを読み込みました: {} ({} クラス, {} パラメータ)",
        tar_gz_path.display(),
        model.num_classes(),
        model.num_params()
    );

    Ok((model, metadata))
}
