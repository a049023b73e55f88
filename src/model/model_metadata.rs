//! モデルメタデータの定義
//!
//! チェックポイント（tar.gz）に同梱され、推論時にクラス順序と入力サイズを復元します。
//! クラス順序は学習時に確定したものを保存し、推論側でディレクトリから再計算しません。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelMetadata {
    /// クラスラベル（インデックス順）
    /// 例: ["cat", "dog"]
    pub class_labels: Vec<String>,

    /// モデル入力サイズ（正方形の一辺）
    pub image_size: u32,

    /// 学習エポック数
    pub num_epochs: u32,

    /// バッチサイズ
    pub batch_size: u32,

    /// 学習率
    pub learning_rate: f64,

    /// 最終エポックの学習損失
    pub final_train_loss: f64,

    /// 最終エポックの検証精度（検証データが無い場合はNone）
    #[serde(default)]
    pub final_valid_accuracy: Option<f64>,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(
        class_labels: Vec<String>,
        image_size: u32,
        num_epochs: u32,
        batch_size: u32,
        learning_rate: f64,
        final_train_loss: f64,
        final_valid_accuracy: Option<f64>,
    ) -> Self {
        let trained_at = chrono::Local::now().to_rfc3339();

        Self {
            class_labels,
            image_size,
            num_epochs,
            batch_size,
            learning_rate,
            final_train_loss,
            final_valid_accuracy,
            trained_at,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.class_labels.len()
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize metadata from JSON")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_keeps_class_order() {
        let metadata = ModelMetadata::new(
            vec!["dog".to_string(), "cat".to_string()],
            128,
            25,
            32,
            1e-3,
            0.12,
            Some(0.9),
        );
        let json = metadata.to_json_string().unwrap();
        let parsed = ModelMetadata::from_json_string(&json).unwrap();
        assert_eq!(parsed.class_labels, vec!["dog", "cat"]);
        assert_eq!(parsed, metadata);
    }

    #[test]
    fn test_missing_accuracy_defaults_to_none() {
        let json = r#"{
            "class_labels": ["a"],
            "image_size": 64,
            "num_epochs": 1,
            "batch_size": 4,
            "learning_rate": 0.001,
            "final_train_loss": 0.5,
            "trained_at": "2024-01-01T00:00:00+00:00"
        }"#;
        let parsed = ModelMetadata::from_json_string(json).unwrap();
        assert_eq!(parsed.final_valid_accuracy, None);
        assert_eq!(parsed.num_classes(), 1);
    }
}
