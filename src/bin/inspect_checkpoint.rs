//! チェックポイントの内容を確認するためのバイナリ

use spectrogram_classifier::model::{load_model_with_metadata, print_metadata_info, AppConfig};
use std::path::PathBuf;

fn main() {
    tracing_subscriber::fmt().with_target(false).compact().init();

    // 引数が無ければ設定ファイルのチェックポイントを使う
    let model_path = match std::env::args().nth(1) {
        Some(arg) => PathBuf::from(arg),
        None => AppConfig::load_or_default(AppConfig::default_path()).checkpoint_path(),
    };

    tracing::info!("対象: {}", model_path.display());

    match load_model_with_metadata(&model_path) {
        Ok((metadata, model_binary)) => {
            print_metadata_info(&metadata);
            for (index, label) in metadata.class_labels.iter().enumerate() {
                tracing::info!("  {:>3}: {}", index, label);
            }
            tracing::info!("重みサイズ: {} bytes", model_binary.len());
        }
        Err(e) => {
            tracing::error!("チェックポイントを読み込めません: {:#}", e);
            std::process::exit(1);
        }
    }
}
