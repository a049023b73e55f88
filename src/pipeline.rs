//! 準備 → 学習 → 推論 の一括実行

use anyhow::anyhow;
use burn::backend::Autodiff;
use burn::tensor::{backend::AutodiffBackend, ElementConversion, Tensor};
use burn_ndarray::{NdArray, NdArrayDevice};
use burn_wgpu::{Wgpu, WgpuDevice};

use crate::dataset::{DatasetOrganizer, PreparationReport, Split};
use crate::error::{PipelineError, Result};
use crate::ml::{train_model, PredictionResult, Predictor, TrainingReport};
use crate::model::{AppConfig, DeviceType};

/// パイプライン全体の実行結果
#[derive(Debug, Clone)]
pub struct PipelineSummary {
    pub preparation: PreparationReport,
    pub training: TrainingReport,
    pub prediction: PredictionResult,
}

/// 設定に従ってパイプラインを実行
///
/// 計算デバイスは実行開始時に一度だけ選択し、学習と推論の両方で使います。
pub fn run_pipeline(config: &AppConfig) -> Result<PipelineSummary> {
    config.validate()?;
    config.log_summary();

    match resolve_device(config.device_type)? {
        DeviceType::Wgpu => run_with_backend::<Autodiff<Wgpu>>(config, &WgpuDevice::default()),
        DeviceType::Cpu | DeviceType::Auto => run_with_backend::<Autodiff<NdArray>>(config, &NdArrayDevice::Cpu),
    }
}

/// 設定のデバイス指定を実際に使うバックエンドに解決
///
/// `Auto` はGPUアダプタがあればWGPU、無ければCPUになります。
/// `Wgpu` を明示していてアダプタが無い場合はエラーです。
pub fn resolve_device(requested: DeviceType) -> Result<DeviceType> {
    let resolved = match requested {
        DeviceType::Cpu => DeviceType::Cpu,
        DeviceType::Wgpu if wgpu_available() => DeviceType::Wgpu,
        DeviceType::Wgpu => {
            return Err(PipelineError::Runtime(anyhow!(
                "device_type is Wgpu but no wgpu adapter is available"
            )))
        }
        DeviceType::Auto if wgpu_available() => DeviceType::Wgpu,
        DeviceType::Auto => {
            tracing::warn!("GPUアダプタが見つかりません。CPUで実行します");
            DeviceType::Cpu
        }
    };
    tracing::info!("使用デバイス: {}", resolved);
    Ok(resolved)
}

/// WGPUで小さなテンソルを確保できるか試す
///
/// アダプタが無いとburn-wgpuは初回確保時にpanicするため、ここで捕捉します。
fn wgpu_available() -> bool {
    let previous_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(|_| {}));
    let result = std::panic::catch_unwind(|| {
        let device = WgpuDevice::default();
        Tensor::<Wgpu, 1>::zeros([1], &device).into_scalar().elem::<f32>() == 0.0
    });
    std::panic::set_hook(previous_hook);
    matches!(result, Ok(true))
}

/// 指定バックエンドでパイプラインを実行
pub fn run_with_backend<B: AutodiffBackend>(config: &AppConfig, device: &B::Device) -> Result<PipelineSummary> {
    tracing::info!("=== 1/3 データセット準備 ===");
    let organizer = DatasetOrganizer::new(config)?;
    let preparation = organizer.rebuild()?;
    for class_name in preparation.classes_without_images(Split::Train) {
        tracing::warn!("クラス '{}' の学習画像がありません", class_name);
    }

    tracing::info!("=== 2/3 学習 ===");
    let training = train_model::<B>(config, device)?;
    if let Some(last) = training.final_metrics() {
        tracing::info!(
            "最終エポック: 学習損失 {:.4}, 学習 {} 枚 / 検証 {} 枚",
            last.train_loss,
            training.num_train_samples,
            training.num_valid_samples
        );
    }

    tracing::info!("=== 3/3 推論 ===");
    let predictor = Predictor::<B::InnerBackend>::load(config, device)?;
    predictor.class_layout_matches(&config.train_dir());
    let prediction = predictor.predict(&config.paths.predict_image)?;

    tracing::info!("'{}' の予測クラス: {}", config.paths.predict_image.display(), prediction.label);

    Ok(PipelineSummary {
        preparation,
        training,
        prediction,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_is_used_as_is() {
        assert_eq!(resolve_device(DeviceType::Cpu).unwrap(), DeviceType::Cpu);
    }

    #[test]
    fn test_default_device_resolves_without_panicking() {
        let resolved = resolve_device(AppConfig::default().device_type).unwrap();
        assert_ne!(resolved, DeviceType::Auto);
        assert_eq!(resolved == DeviceType::Wgpu, wgpu_available());
    }

    #[test]
    fn test_explicit_wgpu_without_adapter_is_an_error() {
        let result = resolve_device(DeviceType::Wgpu);
        if wgpu_available() {
            assert_eq!(result.unwrap(), DeviceType::Wgpu);
        } else {
            let err = result.unwrap_err();
            assert!(matches!(err, PipelineError::Runtime(_)));
            assert_eq!(err.exit_code(), 1);
        }
    }
}
