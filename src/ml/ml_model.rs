//! 網膜画像分類CNNの定義
//!
//! アーキテクチャはチェックポイント互換性の一部です。層の形状を変える場合は
//! `CHECKPOINT_FORMAT_VERSION` も合わせて更新してください。

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::CrossEntropyLossConfig,
        pool::{MaxPool2d, MaxPool2dConfig},
        Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    tensor::{backend::Backend, Int, Tensor},
    train::ClassificationOutput,
};

use crate::error::Error;

/// 入力チャネル数（RGB）
pub const IN_CHANNELS: usize = 3;

/// 標準の入力画像サイズ
pub const IMAGE_SIZE: usize = 224;

/// プーリング段数（1段ごとに空間サイズが半分）
const POOL_STAGES: u32 = 3;

/// モデル設定
#[derive(Config, Debug, PartialEq)]
pub struct RetinaCnnConfig {
    /// 分類クラス数
    pub num_classes: usize,
    /// 入力画像サイズ（正方形、8の倍数）
    #[config(default = 224)]
    pub image_size: usize,
    /// 1段目の畳み込みチャネル数（2段目は2倍、3段目は4倍）
    #[config(default = 32)]
    pub base_channels: usize,
    /// 全結合隠れ層の幅
    #[config(default = 256)]
    pub hidden_size: usize,
    /// ドロップアウト率（学習時のみ有効）
    #[config(default = 0.5)]
    pub dropout: f64,
}

impl RetinaCnnConfig {
    /// 各畳み込みブロックの (入力, 出力) チャネル
    pub fn conv_channels(&self) -> [[usize; 2]; 3] {
        let c = self.base_channels;
        [[IN_CHANNELS, c], [c, c * 2], [c * 2, c * 4]]
    }

    /// 3段プーリング後の特徴マップの一辺
    pub fn feature_map_size(&self) -> usize {
        self.image_size >> POOL_STAGES
    }

    /// Flatten後の特徴次元
    ///
    /// 224x224入力では 128 * 28 * 28 = 100,352
    pub fn flattened_size(&self) -> usize {
        let side = self.feature_map_size();
        self.base_channels * 4 * side * side
    }

    /// 構造上の不変条件を検証
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.num_classes == 0 {
            return Err(Error::Configuration("クラス数が0です".to_string()));
        }
        if self.image_size == 0 || self.image_size % (1 << POOL_STAGES) != 0 {
            return Err(Error::Configuration(format!(
                "入力サイズは8の正の倍数である必要があります: {}",
                self.image_size
            )));
        }
        if self.base_channels == 0 || self.hidden_size == 0 {
            return Err(Error::Configuration(
                "チャネル数と隠れ層の幅は1以上である必要があります".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::Configuration(format!(
                "ドロップアウト率は [0, 1) の範囲で指定してください: {}",
                self.dropout
            )));
        }
        Ok(())
    }

    /// 重み形状が一致するかどうか（ドロップアウト率は形状に影響しない）
    pub fn same_architecture(&self, other: &Self) -> bool {
        self.num_classes == other.num_classes
            && self.image_size == other.image_size
            && self.base_channels == other.base_channels
            && self.hidden_size == other.hidden_size
    }

    /// この設定が規定する層ごとの重み形状
    pub fn expected_shapes(&self) -> Vec<(&'static str, Vec<usize>)> {
        let [c1, c2, c3] = self.conv_channels();
        vec![
            ("conv1.weight", vec![c1[1], c1[0], 3, 3]),
            ("conv2.weight", vec![c2[1], c2[0], 3, 3]),
            ("conv3.weight", vec![c3[1], c3[0], 3, 3]),
            ("fc1.weight", vec![self.flattened_size(), self.hidden_size]),
            ("fc2.weight", vec![self.hidden_size, self.num_classes]),
        ]
    }

    /// モデルを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> crate::error::Result<RetinaCnn<B>> {
        self.validate()?;

        let [c1, c2, c3] = self.conv_channels();
        let d = self.flattened_size();

        tracing::debug!(
            "[Model] 入力 {}x{} -> 特徴 {} x {}x{} -> FC {} -> {} -> {}",
            self.image_size,
            self.image_size,
            c3[1],
            self.feature_map_size(),
            self.feature_map_size(),
            d,
            self.hidden_size,
            self.num_classes
        );

        Ok(RetinaCnn {
            conv1: conv3x3(c1, device),
            pool1: pool2x2(),
            conv2: conv3x3(c2, device),
            pool2: pool2x2(),
            conv3: conv3x3(c3, device),
            pool3: pool2x2(),
            fc1: LinearConfig::new(d, self.hidden_size).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            fc2: LinearConfig::new(self.hidden_size, self.num_classes).init(device),
            activation: Relu::new(),
        })
    }
}

/// 3x3, stride 1, padding 1（空間サイズを保つ）
fn conv3x3<B: Backend>(channels: [usize; 2], device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new(channels, [3, 3])
        .with_stride([1, 1])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .init(device)
}

/// 2x2, stride 2（空間サイズを半分に）
fn pool2x2() -> MaxPool2d {
    MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init()
}

/// 網膜画像分類用CNNモデル
///
/// # アーキテクチャ
/// - {Conv 3x3 (padding 1) + ReLU + MaxPool 2x2} x 3層 (3 -> 32 -> 64 -> 128)
/// - Flatten
/// - FC: d -> 256 + ReLU + Dropout(0.5)
/// - FC: 256 -> num_classes（ロジット）
#[derive(Module, Debug)]
pub struct RetinaCnn<B: Backend> {
    conv1: Conv2d<B>,
    pool1: MaxPool2d,
    conv2: Conv2d<B>,
    pool2: MaxPool2d,
    conv3: Conv2d<B>,
    pool3: MaxPool2d,

    fc1: Linear<B>,
    dropout: Dropout,
    fc2: Linear<B>,

    activation: Relu,
}

impl<B: Backend> RetinaCnn<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, size, size]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        let x = self.conv1.forward(images);
        let x = self.activation.forward(x);
        let x = self.pool1.forward(x);

        let x = self.conv2.forward(x);
        let x = self.activation.forward(x);
        let x = self.pool2.forward(x);

        let x = self.conv3.forward(x);
        let x = self.activation.forward(x);
        let x = self.pool3.forward(x);

        let [_, c, h, w] = x.dims();
        let x = x.reshape([batch_size, c * h * w]);

        let x = self.fc1.forward(x);
        let x = self.activation.forward(x);
        // 自動微分バックエンド上でのみマスクが掛かる
        let x = self.dropout.forward(x);

        self.fc2.forward(x)
    }

    /// 順伝播と損失計算（学習用）
    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        ClassificationOutput::new(loss, output, targets)
    }

    /// 出力クラス数
    pub fn num_classes(&self) -> usize {
        self.fc2.weight.val().dims()[1]
    }

    /// 実際に保持している層ごとの重み形状
    pub fn parameter_shapes(&self) -> Vec<(&'static str, Vec<usize>)> {
        vec![
            ("conv1.weight", self.conv1.weight.val().dims().to_vec()),
            ("conv2.weight", self.conv2.weight.val().dims().to_vec()),
            ("conv3.weight", self.conv3.weight.val().dims().to_vec()),
            ("fc1.weight", self.fc1.weight.val().dims().to_vec()),
            ("fc2.weight", self.fc2.weight.val().dims().to_vec()),
        ]
    }
}
