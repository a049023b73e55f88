//! アプリケーション設定管理モジュール
//!
//! パス、スペクトログラム、モデル、学習の各設定をJSON形式で保存・読み込みします。
//! 各コンポーネントはこの構造体を受け取り、グローバル定数には依存しません。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::PipelineError;

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DeviceType {
    /// GPUアダプタがあればWGPU、無ければCPU
    #[default]
    Auto,
    /// WGPU (GPU) バックエンド
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Auto => write!(f, "Auto (WGPU → CPU)"),
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// 入出力パス設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathSettings {
    /// クラスごとのサブフォルダにWAVを置くルート
    pub raw_root: PathBuf,
    /// スペクトログラム画像の出力ルート（train/validation）
    pub processed_root: PathBuf,
    /// チェックポイント保存先
    pub models_dir: PathBuf,
    /// チェックポイントファイル名
    pub checkpoint_name: String,
    /// 推論ステージで分類する画像
    pub predict_image: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            raw_root: PathBuf::from("data/raw"),
            processed_root: PathBuf::from("data/processed"),
            models_dir: PathBuf::from("models"),
            checkpoint_name: "spectrogram_cnn_v1.tar.gz".to_string(),
            predict_image: PathBuf::from("data/predict/sample.png"),
        }
    }
}

/// スペクトログラム生成設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpectrogramSettings {
    /// 出力画像の一辺（ピクセル）。CNN入力サイズを兼ねるため8の倍数
    pub image_size: u32,
    /// FFT窓長（サンプル数）
    pub fft_size: usize,
    /// 窓の重なり（サンプル数）
    pub overlap: usize,
    /// 表示するダイナミックレンジ（dB）
    pub dynamic_range_db: f32,
}

impl Default for SpectrogramSettings {
    fn default() -> Self {
        Self {
            image_size: 128,
            fft_size: 1024,
            overlap: 512,
            dynamic_range_db: 80.0,
        }
    }
}

impl SpectrogramSettings {
    /// フレーム間のホップ長
    ///
    /// `validate` 済みの設定では常に1以上です。
    pub fn hop_size(&self) -> usize {
        self.fft_size.saturating_sub(self.overlap)
    }

    /// 画像サイズとSTFTパラメータの前提条件を検証
    ///
    /// 3段のプーリングで入力が1/8になるため、画像サイズは8の倍数でなければ
    /// 全結合層の入力次元と一致しません。
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.image_size == 0 || self.image_size % 8 != 0 {
            return Err(PipelineError::InvalidConfig(format!(
                "image_size must be a positive multiple of 8, got {}",
                self.image_size
            )));
        }
        if self.fft_size == 0 || self.overlap >= self.fft_size {
            return Err(PipelineError::InvalidConfig(format!(
                "overlap ({}) must be smaller than fft_size ({})",
                self.overlap, self.fft_size
            )));
        }
        if !(self.dynamic_range_db > 0.0) {
            return Err(PipelineError::InvalidConfig(format!(
                "dynamic_range_db must be > 0, got {}",
                self.dynamic_range_db
            )));
        }
        Ok(())
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// ドロップアウト率（学習時のみ有効）
    pub dropout: f64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self { dropout: 0.5 }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSettings {
    /// エポック数
    pub num_epochs: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// 学習率
    pub learning_rate: f64,
    /// 検証データの割合
    pub validation_split: f64,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            num_epochs: 25,
            batch_size: 32,
            learning_rate: 1e-3,
            validation_split: 0.2,
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// 計算デバイスの種類
    #[serde(default)]
    pub device_type: DeviceType,
    /// パス設定
    #[serde(default)]
    pub paths: PathSettings,
    /// スペクトログラム設定
    #[serde(default)]
    pub spectrogram: SpectrogramSettings,
    /// モデル設定
    #[serde(default)]
    pub model: ModelSettings,
    /// トレーニング設定
    #[serde(default)]
    pub training: TrainingSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// 指定パスから設定を読み込む、存在しない・壊れている場合はデフォルト設定を返す
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("設定ファイルが存在しません。デフォルト設定を使用します");
            return Self::default();
        }
        match Self::load(path) {
            Ok(config) => {
                tracing::info!("設定ファイルを読み込みました: {}", path.display());
                config
            }
            Err(e) => {
                tracing::warn!(
                    "設定ファイルの読み込みに失敗しました ({}): {}。デフォルト設定を使用します",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 設定値の前提条件を検証
    pub fn validate(&self) -> Result<(), PipelineError> {
        self.spectrogram.validate()?;
        let split = self.training.validation_split;
        if !(0.0..1.0).contains(&split) {
            return Err(PipelineError::InvalidConfig(format!(
                "validation_split must be in [0, 1), got {}",
                split
            )));
        }
        if self.training.batch_size == 0 {
            return Err(PipelineError::InvalidConfig("batch_size must be > 0".to_string()));
        }
        if self.training.num_epochs == 0 {
            return Err(PipelineError::InvalidConfig("num_epochs must be > 0".to_string()));
        }
        if !(self.training.learning_rate > 0.0) {
            return Err(PipelineError::InvalidConfig(format!(
                "learning_rate must be > 0, got {}",
                self.training.learning_rate
            )));
        }
        if !(0.0..1.0).contains(&self.model.dropout) {
            return Err(PipelineError::InvalidConfig(format!(
                "dropout must be in [0, 1), got {}",
                self.model.dropout
            )));
        }
        Ok(())
    }

    /// 学習用画像ディレクトリ
    pub fn train_dir(&self) -> PathBuf {
        self.paths.processed_root.join("train")
    }

    /// 検証用画像ディレクトリ
    pub fn validation_dir(&self) -> PathBuf {
        self.paths.processed_root.join("validation")
    }

    /// チェックポイントのパス
    pub fn checkpoint_path(&self) -> PathBuf {
        self.paths.models_dir.join(&self.paths.checkpoint_name)
    }

    /// エポックごとの学習履歴CSVのパス
    pub fn history_path(&self) -> PathBuf {
        self.paths.models_dir.join("training_history.csv")
    }

    /// すべてのパスを指定ルート配下に置き換えた設定（テスト・一時実行用）
    pub fn rooted_at<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref();
        let mut config = Self::default();
        config.paths.raw_root = root.join("data/raw");
        config.paths.processed_root = root.join("data/processed");
        config.paths.models_dir = root.join("models");
        config.paths.predict_image = root.join("data/predict/sample.png");
        config
    }

    /// 設定情報をログに出力
    pub fn log_summary(&self) {
        tracing::info!("計算デバイス: {}", self.device_type);
        tracing::info!(
            "入力: {} / 出力: {} / モデル: {}",
            self.paths.raw_root.display(),
            self.paths.processed_root.display(),
            self.checkpoint_path().display()
        );
        tracing::info!(
            "画像サイズ: {}x{}, FFT: {} (overlap {})",
            self.spectrogram.image_size,
            self.spectrogram.image_size,
            self.spectrogram.fft_size,
            self.spectrogram.overlap
        );
        tracing::info!(
            "エポック数: {}, バッチサイズ: {}, 学習率: {}, 検証割合: {}",
            self.training.num_epochs,
            self.training.batch_size,
            self.training.learning_rate,
            self.training.validation_split
        );
    }
}
