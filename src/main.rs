//! 眼底画像分類器のコマンドラインツール
//!
//! - `train`: データセットから学習してチェックポイントを保存
//! - `serve`: 推論APIサーバーを起動
//! - `inspect`: チェックポイントのメタデータを表示
//! - `init-config`: 既定の設定ファイルを書き出す

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use burn::tensor::backend::AutodiffBackend;
use clap::{Parser, Subcommand, ValueEnum};

use retina_cnn_lib::backend::{cpu_device, resolve_device_type, CpuTrainingBackend};
#[cfg(feature = "wgpu")]
use retina_cnn_lib::backend::{gpu_device, GpuTrainingBackend};
use retina_cnn_lib::ml::{train_model, ClassRegistry};
use retina_cnn_lib::model::{load_metadata, AppConfig, DeviceType};
use retina_cnn_lib::{logging, server};

#[derive(Parser, Debug)]
#[command(name = "retina_cnn")]
#[command(version)]
#[command(about = "Retinal fundus image classifier")]
struct Cli {
    /// 設定ファイル（JSON）
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// 計算デバイス（設定ファイルの値を上書き）
    #[arg(long, global = true, value_enum)]
    device: Option<DeviceArg>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DeviceArg {
    Cpu,
    Wgpu,
}

impl From<DeviceArg> for DeviceType {
    fn from(arg: DeviceArg) -> Self {
        match arg {
            DeviceArg::Cpu => DeviceType::Cpu,
            DeviceArg::Wgpu => DeviceType::Wgpu,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// クラスごとのサブディレクトリを持つデータセットから学習する
    Train {
        /// データセットディレクトリ
        #[arg(short, long)]
        data_dir: Option<PathBuf>,
        /// 出力チェックポイント（.tar.gz）
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(long)]
        epochs: Option<usize>,
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long)]
        learning_rate: Option<f64>,
        #[arg(long)]
        seed: Option<u64>,
        /// 検証用に取り分ける割合（0〜1）
        #[arg(long)]
        validation_ratio: Option<f32>,
    },

    /// 推論APIサーバーを起動する
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(short, long)]
        port: Option<u16>,
        /// 読み込むチェックポイント
        #[arg(long)]
        checkpoint: Option<PathBuf>,
        /// クラス名の取得元ディレクトリ
        #[arg(short, long)]
        data_dir: Option<PathBuf>,
    },

    /// チェックポイントのメタデータを表示する
    Inspect {
        /// チェックポイント（省略時は設定ファイルの値）
        checkpoint: Option<PathBuf>,
    },

    /// 既定の設定ファイルを書き出す
    InitConfig {
        /// 既存のファイルを上書きする
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    logging::init();
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(AppConfig::default_path);
    let mut config = AppConfig::load_or_default(&config_path);
    if let Some(device) = cli.device {
        config.device_type = device.into();
    }

    match cli.command {
        Commands::Train {
            data_dir,
            output,
            epochs,
            batch_size,
            learning_rate,
            seed,
            validation_ratio,
        } => {
            if let Some(dir) = data_dir {
                config.model.dataset_dir = dir;
            }
            if let Some(path) = output {
                config.model.checkpoint_path = path;
            }
            if let Some(v) = epochs {
                config.training.num_epochs = v;
            }
            if let Some(v) = batch_size {
                config.training.batch_size = v;
            }
            if let Some(v) = learning_rate {
                config.training.learning_rate = v;
            }
            if let Some(v) = seed {
                config.training.seed = v;
            }
            if let Some(v) = validation_ratio {
                if !(0.0..1.0).contains(&v) {
                    bail!("validation-ratio は [0, 1) の範囲で指定してください: {}", v);
                }
                config.training.validation_ratio = v;
            }
            config.log_summary();
            train(&config)
        }
        Commands::Serve {
            host,
            port,
            checkpoint,
            data_dir,
        } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(path) = checkpoint {
                config.model.checkpoint_path = path;
            }
            if let Some(dir) = data_dir {
                config.model.dataset_dir = dir;
            }
            config.log_summary();

            let runtime = tokio::runtime::Runtime::new().context("非同期ランタイムの作成に失敗しました")?;
            runtime.block_on(server::serve(config))
        }
        Commands::Inspect { checkpoint } => {
            let path = checkpoint.unwrap_or_else(|| config.model.checkpoint_path.clone());
            inspect(&path)
        }
        Commands::InitConfig { force } => {
            if config_path.exists() && !force {
                bail!(
                    "{} は既に存在します（上書きするには --force を指定）",
                    config_path.display()
                );
            }
            AppConfig::default()
                .save(&config_path)
                .with_context(|| format!("{} に書き込めません", config_path.display()))?;
            tracing::info!("設定ファイルを書き出しました: {}", config_path.display());
            Ok(())
        }
    }
}

fn train(config: &AppConfig) -> Result<()> {
    match resolve_device_type(&config.device_type) {
        #[cfg(feature = "wgpu")]
        DeviceType::Wgpu => run_training::<GpuTrainingBackend>(config, gpu_device()),
        _ => run_training::<CpuTrainingBackend>(config, cpu_device()),
    }
}

fn run_training<B: AutodiffBackend>(config: &AppConfig, device: B::Device) -> Result<()> {
    let data_dir = &config.model.dataset_dir;
    let registry = ClassRegistry::build(data_dir).context("クラス一覧の構築に失敗しました")?;

    let (path, report) = train_model::<B, _>(
        data_dir,
        &registry,
        &config.model.checkpoint_path,
        config.model.architecture(registry.len()),
        config.training.to_training_config(),
        device,
        |metrics| {
            tracing::debug!("エポック {} 完了", metrics.epoch);
        },
    )
    .context("学習に失敗しました")?;

    if let Some(last) = report.last() {
        tracing::info!(
            "学習完了: 最終損失 {:.4}, 最終精度 {:.2}%",
            last.loss,
            last.accuracy
        );
    }
    tracing::info!("モデルを保存しました: {}", path.display());
    Ok(())
}

fn inspect(path: &Path) -> Result<()> {
    let metadata = load_metadata(path)
        .with_context(|| format!("メタデータを読み込めません: {}", path.display()))?;
    metadata.log_info();
    println!("{}", metadata.to_json_string()?);
    Ok(())
}
