//! 画像からモデル入力テンソルへの前処理
//!
//! 学習時と推論時で同じリサイズ・正規化定数を使います。学習時のみ、
//! 正規化の前にランダムな左右反転と回転を加えます。

use burn::tensor::{backend::Backend, Tensor};
use image::{imageops::FilterType, DynamicImage, Rgb, RgbImage};
use rand::Rng;

use crate::error::{Error, Result};
use crate::ml::ml_model::IN_CHANNELS;

/// ImageNetの平均値（RGB）
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNetの標準偏差（RGB）
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// 左右反転の確率
const FLIP_PROBABILITY: f64 = 0.5;
/// 回転角の最大値（度、±）
const MAX_ROTATION_DEGREES: f32 = 10.0;

/// 前処理モード
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreprocessMode {
    /// データ拡張あり（確率的）
    Train,
    /// データ拡張なし（決定的）
    Eval,
}

/// 正規化済みの画像テンソル (C, H, W) の順で平坦化
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    data: Vec<f32>,
    size: usize,
}

impl ImageTensor {
    /// 平坦化データから作成（長さは 3 * size * size である必要がある）
    pub fn from_vec(data: Vec<f32>, size: usize) -> Result<Self> {
        let expected = IN_CHANNELS * size * size;
        if data.len() != expected {
            return Err(Error::inference(format!(
                "テンソル長が不正です: {} (期待: {})",
                data.len(),
                expected
            )));
        }
        Ok(Self { data, size })
    }

    /// [C, H, W]
    pub fn shape(&self) -> [usize; 3] {
        [IN_CHANNELS, self.size, self.size]
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// 単一画像をバッチ [1, 3, size, size] に変換
    pub fn to_batch<B: Backend>(&self, device: &B::Device) -> Tensor<B, 4> {
        Tensor::<B, 1>::from_floats(self.data.as_slice(), device)
            .reshape([1, IN_CHANNELS, self.size, self.size])
    }
}

/// 画像前処理器
#[derive(Debug, Clone)]
pub struct ImagePreprocessor {
    image_size: u32,
}

impl Default for ImagePreprocessor {
    fn default() -> Self {
        Self::new(crate::ml::ml_model::IMAGE_SIZE as u32)
    }
}

impl ImagePreprocessor {
    pub fn new(image_size: u32) -> Self {
        Self { image_size }
    }

    pub fn image_size(&self) -> u32 {
        self.image_size
    }

    /// バイト列を画像としてデコード
    pub fn decode(bytes: &[u8]) -> Result<DynamicImage> {
        let img = image::load_from_memory(bytes)?;
        check_dimensions(&img)?;
        Ok(img)
    }

    /// ファイルから画像を読み込む
    pub fn open(path: &std::path::Path) -> Result<DynamicImage> {
        let img = image::open(path)
            .map_err(|e| Error::InvalidImage(format!("{}: {}", path.display(), e)))?;
        check_dimensions(&img)?;
        Ok(img)
    }

    /// 画像を正規化テンソルに変換
    ///
    /// `Eval` モードでは `rng` は使われず、同じ画像に対して常に同じ結果を返します。
    pub fn prepare<R: Rng>(
        &self,
        image: &DynamicImage,
        mode: PreprocessMode,
        rng: &mut R,
    ) -> Result<ImageTensor> {
        let mut rgb = self.resize(image)?;

        if mode == PreprocessMode::Train {
            if rng.gen_bool(FLIP_PROBABILITY) {
                rgb = image::imageops::flip_horizontal(&rgb);
            }
            let angle = rng.gen_range(-MAX_ROTATION_DEGREES..=MAX_ROTATION_DEGREES);
            rgb = rotate(&rgb, angle);
        }

        Ok(normalize(&rgb))
    }

    /// 推論用の決定的な前処理
    pub fn prepare_eval(&self, image: &DynamicImage) -> Result<ImageTensor> {
        Ok(normalize(&self.resize(image)?))
    }

    /// 目標サイズへリサイズ（アスペクト比は保持しない）
    fn resize(&self, image: &DynamicImage) -> Result<RgbImage> {
        check_dimensions(image)?;
        Ok(image
            .resize_exact(self.image_size, self.image_size, FilterType::Triangle)
            .to_rgb8())
    }
}

fn check_dimensions(image: &DynamicImage) -> Result<()> {
    if image.width() == 0 || image.height() == 0 {
        return Err(Error::InvalidImage(format!(
            "画像サイズが不正です: {}x{}",
            image.width(),
            image.height()
        )));
    }
    Ok(())
}

/// [0,1] に変換後、チャネルごとに平均・標準偏差で正規化
fn normalize(img: &RgbImage) -> ImageTensor {
    let (width, height) = img.dimensions();
    let mut data = Vec::with_capacity(IN_CHANNELS * (width * height) as usize);

    for channel in 0..IN_CHANNELS {
        for y in 0..height {
            for x in 0..width {
                let value = img.get_pixel(x, y)[channel] as f32 / 255.0;
                data.push((value - IMAGENET_MEAN[channel]) / IMAGENET_STD[channel]);
            }
        }
    }

    ImageTensor {
        data,
        size: width as usize,
    }
}

/// 画像中心を軸に回転（正の角度で反時計回り）
///
/// 最近傍補間。範囲外は黒で埋める。
pub(crate) fn rotate(img: &RgbImage, angle_degrees: f32) -> RgbImage {
    let (width, height) = img.dimensions();
    let (sin_a, cos_a) = angle_degrees.to_radians().sin_cos();
    let cx = (width as f32 - 1.0) / 2.0;
    let cy = (height as f32 - 1.0) / 2.0;

    RgbImage::from_fn(width, height, |x, y| {
        let dx = x as f32 - cx;
        let dy = y as f32 - cy;
        // 出力座標から入力座標への逆写像
        let src_x = (cx + dx * cos_a - dy * sin_a).round();
        let src_y = (cy + dx * sin_a + dy * cos_a).round();

        if src_x < 0.0 || src_y < 0.0 || src_x >= width as f32 || src_y >= height as f32 {
            Rgb([0, 0, 0])
        } else {
            *img.get_pixel(src_x as u32, src_y as u32)
        }
    })
}
