//! 計算バックエンドの選択
//!
//! CPU (NdArray) は常に利用可能です。WGPU は `wgpu` フィーチャー有効時のみ。

use burn_autodiff::Autodiff;
use burn_ndarray::{NdArray, NdArrayDevice};

use crate::model::DeviceType;

/// CPUバックエンド（推論用）
pub type CpuBackend = NdArray<f32>;

/// CPUバックエンド（学習用、自動微分付き）
pub type CpuTrainingBackend = Autodiff<CpuBackend>;

/// GPUバックエンド（推論用）
#[cfg(feature = "wgpu")]
pub type GpuBackend = burn_wgpu::Wgpu;

/// GPUバックエンド（学習用、自動微分付き）
#[cfg(feature = "wgpu")]
pub type GpuTrainingBackend = Autodiff<GpuBackend>;

/// CPUデバイス
pub fn cpu_device() -> NdArrayDevice {
    NdArrayDevice::Cpu
}

/// GPUデバイス（最初のディスクリートGPU）
#[cfg(feature = "wgpu")]
pub fn gpu_device() -> burn_wgpu::WgpuDevice {
    burn_wgpu::WgpuDevice::DiscreteGpu(0)
}

/// 要求されたデバイスを、このビルドで利用可能なものに解決する
pub fn resolve_device_type(requested: &DeviceType) -> DeviceType {
    match requested {
        DeviceType::Cpu => DeviceType::Cpu,
        #[cfg(feature = "wgpu")]
        DeviceType::Wgpu => DeviceType::Wgpu,
        #[cfg(not(feature = "wgpu"))]
        DeviceType::Wgpu => {
            tracing::warn!("WGPUバックエンドはこのビルドに含まれていません。CPUを使用します");
            DeviceType::Cpu
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_is_always_available() {
        assert_eq!(resolve_device_type(&DeviceType::Cpu), DeviceType::Cpu);
    }

    #[cfg(not(feature = "wgpu"))]
    #[test]
    fn test_wgpu_falls_back_to_cpu_without_feature() {
        assert_eq!(resolve_device_type(&DeviceType::Wgpu), DeviceType::Cpu);
    }
}
