//! パイプライン全体のエラー定義
//!
//! 各ステージの致命的エラーを区別し、プロセス終了コードへ対応付けます。

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// 推論ステージで参照する成果物の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    /// 学習済みチェックポイント
    Checkpoint,
    /// 推論対象の画像
    Image,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactKind::Checkpoint => write!(f, "checkpoint"),
            ArtifactKind::Image => write!(f, "image"),
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Raw audio directory not found or empty: {}", .0.display())]
    MissingRawData(PathBuf),

    #[error("Train/validation directories not found under {}", .0.display())]
    MissingDataset(PathBuf),

    #[error("Class '{0}' has no training images")]
    EmptyClass(String),

    #[error("{kind} not found: {}", path.display())]
    MissingArtifact { kind: ArtifactKind, path: PathBuf },

    #[error(transparent)]
    Runtime(#[from] anyhow::Error),
}

impl PipelineError {
    /// 終了コード（失敗の種類ごとに固有）
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Runtime(_) => 1,
            PipelineError::InvalidConfig(_) => 2,
            PipelineError::MissingRawData(_) => 3,
            PipelineError::MissingDataset(_) => 4,
            PipelineError::EmptyClass(_) => 5,
            PipelineError::MissingArtifact { .. } => 6,
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::Runtime(e.into())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct() {
        let errors = [
            PipelineError::Runtime(anyhow::anyhow!("boom")),
            PipelineError::InvalidConfig("x".to_string()),
            PipelineError::MissingRawData(PathBuf::from("data/raw")),
            PipelineError::MissingDataset(PathBuf::from("data/processed")),
            PipelineError::EmptyClass("cat".to_string()),
            PipelineError::MissingArtifact {
                kind: ArtifactKind::Checkpoint,
                path: PathBuf::from("models/m.tar.gz"),
            },
        ];
        let mut codes: Vec<i32> = errors.iter().map(|e| e.exit_code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_missing_artifact_message() {
        let err = PipelineError::MissingArtifact {
            kind: ArtifactKind::Image,
            path: PathBuf::from("a/b.png"),
        };
        assert_eq!(err.to_string(), "image not found: a/b.png");
    }
}
