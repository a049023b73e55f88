//! モデルメタデータを使用した推論設定
//!
//! 保存されたモデルメタデータを読み込んで推論に必要な情報を取得します。

use crate::model::model_metadata::ModelMetadata;

/// モデルメタデータから推論用情報を取得
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    /// 学習時に確定したクラスラベル（インデックス順）
    pub class_labels: Vec<String>,

    /// モデル入力解像度
    pub model_input_size: u32,
}

impl InferenceConfig {
    /// メタデータからInferenceConfigを作成
    pub fn from_metadata(metadata: &ModelMetadata) -> Self {
        Self {
            class_labels: metadata.class_labels.clone(),
            model_input_size: metadata.image_size,
        }
    }

    /// クラスインデックスからラベルを取得
    pub fn class_index_to_label(&self, index: usize) -> Option<String> {
        self.class_labels.get(index).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_label_mapping() {
        let metadata = ModelMetadata::new(
            vec!["cat".to_string(), "dog".to_string()],
            32,
            1,
            1,
            1e-3,
            0.0,
            None,
        );
        let config = InferenceConfig::from_metadata(&metadata);
        assert_eq!(config.class_index_to_label(1).as_deref(), Some("dog"));
        assert_eq!(config.class_index_to_label(2), None);
        assert_eq!(config.model_input_size, 32);
    }
}
