//! 生音声ツリーからスペクトログラム画像ツリーを構築
//!
//! `<raw>/<class>/*.wav` を `<processed>/{train,validation}/<class>/*.png` に変換します。
//! `rebuild` は出力を丸ごと削除してから作り直し、`update` は未変換のファイルのみ追加します。

use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::audio::{FileOutcome, SpectrogramGenerator};
use crate::error::{PipelineError, Result};
use crate::model::AppConfig;

/// データセットの分割
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Split {
    Train,
    Validation,
}

impl Split {
    pub const ALL: [Split; 2] = [Split::Train, Split::Validation];

    /// 出力ディレクトリ名
    pub fn dir_name(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Validation => "validation",
        }
    }
}

/// 1ファイル分の処理記録
#[derive(Debug, Clone)]
pub struct FileReport {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub split: Split,
    pub outcome: FileOutcome,
}

/// 1クラス分の処理記録
#[derive(Debug, Clone)]
pub struct ClassReport {
    pub class_name: String,
    pub files: Vec<FileReport>,
}

impl ClassReport {
    /// 指定分割で画像化できたファイル数
    pub fn converted(&self, split: Split) -> usize {
        self.files
            .iter()
            .filter(|f| f.split == split && f.outcome.is_success())
            .count()
    }

    pub fn skipped(&self) -> Vec<&FileReport> {
        self.files
            .iter()
            .filter(|f| matches!(f.outcome, FileOutcome::Skipped { .. }))
            .collect()
    }

    pub fn failed(&self) -> Vec<&FileReport> {
        self.files
            .iter()
            .filter(|f| matches!(f.outcome, FileOutcome::Failed { .. }))
            .collect()
    }
}

/// データ準備全体の処理記録
#[derive(Debug, Clone, Default)]
pub struct PreparationReport {
    pub classes: Vec<ClassReport>,
}

impl PreparationReport {
    pub fn class(&self, name: &str) -> Option<&ClassReport> {
        self.classes.iter().find(|c| c.class_name == name)
    }

    pub fn total_converted(&self) -> usize {
        self.classes
            .iter()
            .map(|c| c.converted(Split::Train) + c.converted(Split::Validation))
            .sum()
    }

    pub fn total_skipped(&self) -> usize {
        self.classes.iter().map(|c| c.skipped().len()).sum()
    }

    pub fn total_failed(&self) -> usize {
        self.classes.iter().map(|c| c.failed().len()).sum()
    }

    /// 指定分割で画像が1枚も無いクラス
    pub fn classes_without_images(&self, split: Split) -> Vec<&str> {
        self.classes
            .iter()
            .filter(|c| c.converted(split) == 0)
            .map(|c| c.class_name.as_str())
            .collect()
    }
}

/// 学習用に割り当てる件数
///
/// `floor(total * (1 - validation_split))` を基本とし、1件以上あるクラスでは
/// 学習側が空にならないよう最低1件を確保します。
pub fn train_split_len(total: usize, validation_split: f64) -> usize {
    if total == 0 {
        return 0;
    }
    // 0.8 * 10 のような積が 7.999.. に落ちるのを防ぐ
    let train = ((total as f64) * (1.0 - validation_split) + 1e-9).floor() as usize;
    train.clamp(1, total)
}

/// データセット構築器
pub struct DatasetOrganizer {
    raw_root: PathBuf,
    processed_root: PathBuf,
    validation_split: f64,
    generator: SpectrogramGenerator,
}

impl DatasetOrganizer {
    pub fn new(config: &AppConfig) -> Result<Self> {
        Ok(Self {
            raw_root: config.paths.raw_root.clone(),
            processed_root: config.paths.processed_root.clone(),
            validation_split: config.training.validation_split,
            generator: SpectrogramGenerator::new(config.spectrogram.clone())?,
        })
    }

    /// 出力ツリーを削除して全ファイルを変換し直す
    pub fn rebuild(&self) -> Result<PreparationReport> {
        self.check_raw_root()?;

        if self.processed_root.exists() {
            tracing::info!("既存の出力を削除します: {}", self.processed_root.display());
            fs::remove_dir_all(&self.processed_root)?;
        }

        let mut report = PreparationReport::default();
        for (class_name, class_dir) in self.list_classes()? {
            let files = list_wav_files(&class_dir)?;
            let train_len = train_split_len(files.len(), self.validation_split);
            report.classes.push(self.process_class(&class_name, files, train_len)?);
        }

        self.log_report(&report);
        Ok(report)
    }

    /// 既存の出力を残したまま、未変換のWAVのみを変換する
    ///
    /// どちらの分割にも同名PNGが無いファイルが対象です。
    /// 以前スキップ・失敗したファイルも再試行されます。
    /// 新規ファイルの振り分けは、既存分を含めたクラス全体の比率に合わせます。
    pub fn update(&self) -> Result<PreparationReport> {
        self.check_raw_root()?;

        let mut report = PreparationReport::default();
        for (class_name, class_dir) in self.list_classes()? {
            let existing = self.existing_outputs(&class_name)?;
            let files: Vec<PathBuf> = list_wav_files(&class_dir)?
                .into_iter()
                .filter(|p| {
                    file_stem(p)
                        .map(|stem| !existing.contains(stem))
                        .unwrap_or(false)
                })
                .collect();
            let train_len = existing.train_len_for(files.len(), self.validation_split);
            report.classes.push(self.process_class(&class_name, files, train_len)?);
        }

        self.log_report(&report);
        Ok(report)
    }

    fn check_raw_root(&self) -> Result<()> {
        let has_entries = self.raw_root.is_dir()
            && fs::read_dir(&self.raw_root)?.next().is_some();
        if !has_entries {
            return Err(PipelineError::MissingRawData(self.raw_root.clone()));
        }
        Ok(())
    }

    /// クラスディレクトリ一覧（名前順）
    fn list_classes(&self) -> Result<Vec<(String, PathBuf)>> {
        let mut classes = Vec::new();
        for entry in fs::read_dir(&self.raw_root)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => classes.push((name.to_string(), path.clone())),
                None => tracing::warn!("クラス名として使えないディレクトリを無視します: {}", path.display()),
            }
        }
        classes.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(classes)
    }

    fn existing_outputs(&self, class_name: &str) -> Result<ExistingOutputs> {
        let mut existing = ExistingOutputs::default();
        for split in Split::ALL {
            let dir = self.processed_root.join(split.dir_name()).join(class_name);
            if !dir.is_dir() {
                continue;
            }
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.extension().map_or(false, |e| e.eq_ignore_ascii_case("png")) {
                    if let Some(stem) = file_stem(&path) {
                        if existing.stems.insert(stem.to_string()) && split == Split::Train {
                            existing.train += 1;
                        }
                    }
                }
            }
        }
        Ok(existing)
    }

    /// 1クラスをシャッフルし、先頭 `train_len` 件を学習側として変換する
    fn process_class(&self, class_name: &str, mut files: Vec<PathBuf>, train_len: usize) -> Result<ClassReport> {
        files.shuffle(&mut rand::thread_rng());

        let (train_files, val_files) = files.split_at(train_len.min(files.len()));

        tracing::info!(
            "クラス '{}': {} 学習, {} 検証",
            class_name,
            train_files.len(),
            val_files.len()
        );

        let mut reports = Vec::with_capacity(files.len());
        for (split, split_files) in [(Split::Train, train_files), (Split::Validation, val_files)] {
            let dest_dir = self.processed_root.join(split.dir_name()).join(class_name);
            fs::create_dir_all(&dest_dir)?;

            for wav_path in split_files {
                let png_name = format!("{}.png", file_stem(wav_path).unwrap_or("unnamed"));
                let destination = dest_dir.join(png_name);
                let outcome = self.generator.generate(wav_path, &destination);
                reports.push(FileReport {
                    source: wav_path.clone(),
                    destination,
                    split,
                    outcome,
                });
            }
        }

        Ok(ClassReport {
            class_name: class_name.to_string(),
            files: reports,
        })
    }

    fn log_report(&self, report: &PreparationReport) {
        tracing::info!(
            "データ準備完了: {} 枚変換, {} スキップ, {} 失敗",
            report.total_converted(),
            report.total_skipped(),
            report.total_failed()
        );
        for class_name in report.classes_without_images(Split::Train) {
            tracing::warn!("クラス '{}' の学習画像が0枚です", class_name);
        }
    }
}

/// 出力済みPNGの一覧（クラス単位）
#[derive(Default)]
struct ExistingOutputs {
    stems: HashSet<String>,
    train: usize,
}

impl ExistingOutputs {
    fn contains(&self, stem: &str) -> bool {
        self.stems.contains(stem)
    }

    /// 新規 `new_files` 件のうち学習側に回す件数
    fn train_len_for(&self, new_files: usize, validation_split: f64) -> usize {
        let total = self.stems.len() + new_files;
        train_split_len(total, validation_split)
            .saturating_sub(self.train)
            .min(new_files)
    }
}

fn file_stem(path: &Path) -> Option<&str> {
    path.file_stem().and_then(|s| s.to_str())
}

/// クラスディレクトリ内のWAVファイル（名前順）
fn list_wav_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().map_or(false, |e| e.eq_ignore_ascii_case("wav")) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
