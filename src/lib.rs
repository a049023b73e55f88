//! 音声クリップ分類パイプライン
//!
//! クラスごとのフォルダに置いたWAVファイルをスペクトログラム画像に変換し、
//! 小さなCNNで学習して、1枚の画像のクラスを予測します。
//!
//! - [`audio`]: WAV読み込みとスペクトログラム画像生成
//! - [`dataset`]: 学習・検証フォルダの構築
//! - [`ml`]: モデル定義、学習、推論
//! - [`model`]: 設定とチェックポイントの永続化

pub mod audio;
pub mod dataset;
pub mod error;
pub mod ml;
pub mod model;
pub mod pipeline;

pub use error::{ArtifactKind, PipelineError, Result};
pub use model::{AppConfig, DeviceType};
pub use pipeline::{run_pipeline, run_with_backend, PipelineSummary};
