//! WAV → スペクトログラム画像変換
//!
//! 1ファイルの音声を、軸や余白のない固定サイズのグレースケールPNGに変換します。
//! 行0が最高周波数、列が時間方向です。

use image::imageops::{self, FilterType};
use image::{GrayImage, ImageBuffer, Luma};
use realfft::{RealFftPlanner, RealToComplex};
use std::path::Path;
use std::sync::Arc;

use crate::audio::loader::{read_wav, ConversionError};
use crate::error::PipelineError;
use crate::model::SpectrogramSettings;

/// 1ファイルの変換結果
#[derive(Debug, Clone, PartialEq)]
pub enum FileOutcome {
    /// 画像を書き出した
    Converted,
    /// 無音などで対象外（エラーではない）
    Skipped { reason: String },
    /// 読み込み・計算・書き込みのいずれかで失敗
    Failed { error: String },
}

impl FileOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, FileOutcome::Converted)
    }
}

fn hann_window(size: usize) -> Vec<f32> {
    if size == 1 {
        return vec![1.0];
    }
    (0..size)
        .map(|i| 0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / (size - 1) as f32).cos()))
        .collect()
}

/// スペクトログラム生成器
///
/// FFTプランと窓関数は生成時に一度だけ用意し、全ファイルで使い回します。
pub struct SpectrogramGenerator {
    settings: SpectrogramSettings,
    fft: Arc<dyn RealToComplex<f32>>,
    window: Vec<f32>,
}

impl SpectrogramGenerator {
    /// 設定を検証してFFTプランを作成
    pub fn new(settings: SpectrogramSettings) -> Result<Self, PipelineError> {
        settings.validate()?;

        let mut planner = RealFftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(settings.fft_size);
        let window = hann_window(settings.fft_size);
        Ok(Self {
            settings,
            fft,
            window,
        })
    }

    /// 変換を実行し、失敗はログに記録して結果として返す
    ///
    /// エラーは呼び出し元へ伝播しないため、他ファイルの処理は継続できます。
    pub fn generate(&self, wav_path: &Path, png_path: &Path) -> FileOutcome {
        match self.try_generate(wav_path, png_path) {
            Ok(true) => FileOutcome::Converted,
            Ok(false) => {
                tracing::debug!("無音ファイルをスキップ: {}", wav_path.display());
                FileOutcome::Skipped {
                    reason: "silent recording (peak amplitude is zero)".to_string(),
                }
            }
            Err(e) => {
                tracing::warn!("変換エラー {}: {}", wav_path.display(), e);
                FileOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    /// 変換を実行
    ///
    /// # 戻り値
    /// - `Ok(true)`: 画像を書き出した
    /// - `Ok(false)`: 無音のためスキップ（何も書き出さない）
    pub fn try_generate(&self, wav_path: &Path, png_path: &Path) -> Result<bool, ConversionError> {
        let audio = read_wav(wav_path)?;

        let samples = match audio.normalized() {
            Some(samples) => samples,
            None => return Ok(false),
        };

        let columns = self.compute_stft(&samples)?;
        let image = render_grayscale(
            &columns,
            self.settings.image_size,
            self.settings.dynamic_range_db,
        );
        image.save(png_path)?;

        Ok(true)
    }

    /// 短時間フーリエ変換の振幅列を計算
    ///
    /// 窓長に満たない信号はゼロ詰めして1フレームとして扱います。
    pub fn compute_stft(&self, samples: &[f32]) -> Result<Vec<Vec<f32>>, ConversionError> {
        let fft_size = self.settings.fft_size;
        let hop_size = self.settings.hop_size();

        let padded;
        let samples = if samples.len() < fft_size {
            let mut buf = samples.to_vec();
            buf.resize(fft_size, 0.0);
            padded = buf;
            padded.as_slice()
        } else {
            samples
        };

        let mut input = self.fft.make_input_vec();
        let mut spectrum = self.fft.make_output_vec();
        let total_cols = (samples.len() - fft_size) / hop_size + 1;
        let mut columns = Vec::with_capacity(total_cols);

        for col_i in 0..total_cols {
            let pos = col_i * hop_size;
            for (inp, (&s, &w)) in input
                .iter_mut()
                .zip(samples[pos..pos + fft_size].iter().zip(self.window.iter()))
            {
                *inp = s * w;
            }
            self.fft
                .process(&mut input, &mut spectrum)
                .map_err(|e| ConversionError::Fft(e.to_string()))?;
            columns.push(spectrum.iter().map(|c| c.norm()).collect());
        }

        Ok(columns)
    }
}

/// 振幅列をdBスケールのグレースケール画像に変換
///
/// 画像内の最大値を白、`最大値 - dynamic_range_db` 以下を黒とし、
/// `size x size` にリサイズします。
pub fn render_grayscale(columns: &[Vec<f32>], size: u32, dynamic_range_db: f32) -> GrayImage {
    let n_cols = columns.len();
    let n_bins = columns.first().map_or(0, |c| c.len());
    if n_cols == 0 || n_bins == 0 {
        return GrayImage::new(size, size);
    }

    let db: Vec<Vec<f32>> = columns
        .iter()
        .map(|col| {
            col.iter()
                .map(|&mag| 10.0 * (mag * mag).max(1e-20).log10())
                .collect()
        })
        .collect();

    let max_db = db.iter().flatten().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let min_db = db
        .iter()
        .flatten()
        .fold(f32::INFINITY, |a, &b| a.min(b))
        .max(max_db - dynamic_range_db);
    let range = max_db - min_db;

    let mut raw: GrayImage = ImageBuffer::new(n_cols as u32, n_bins as u32);
    for (x, col) in db.iter().enumerate() {
        for (bin, &value) in col.iter().enumerate() {
            let level = if range > 0.0 {
                ((value.clamp(min_db, max_db) - min_db) / range * 255.0).round() as u8
            } else {
                0
            };
            // 行0 = 最高周波数
            let y = (n_bins - 1 - bin) as u32;
            raw.put_pixel(x as u32, y, Luma([level]));
        }
    }

    imageops::resize(&raw, size, size, FilterType::Triangle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::{SampleFormat, WavSpec, WavWriter};
    use std::path::PathBuf;

    const SAMPLE_RATE: u32 = 16000;

    fn write_tone(path: &Path, freq: f32, len: usize) {
        let spec = WavSpec {
            channels: 1,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(path, spec).unwrap();
        for i in 0..len {
            let t = i as f32 / SAMPLE_RATE as f32;
            let v = (2.0 * std::f32::consts::PI * freq * t).sin() * 12000.0;
            writer.write_sample(v as i16).unwrap();
        }
        writer.finalize().unwrap();
    }

    fn write_silence(path: &Path, len: usize) {
        let spec = WavSpec {
            channels: 1,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(path, spec).unwrap();
        for _ in 0..len {
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();
    }

    fn generator(size: u32) -> SpectrogramGenerator {
        SpectrogramGenerator::new(SpectrogramSettings {
            image_size: size,
            ..SpectrogramSettings::default()
        })
        .unwrap()
    }

    #[test]
    fn test_overlap_not_below_fft_size_is_rejected() {
        for overlap in [1024, 4096] {
            let result = SpectrogramGenerator::new(SpectrogramSettings {
                overlap,
                ..SpectrogramSettings::default()
            });
            assert!(matches!(result, Err(PipelineError::InvalidConfig(_))));
        }
    }

    #[test]
    fn test_generates_square_single_channel_png() {
        let dir = tempfile::tempdir().unwrap();
        let wav = dir.path().join("tone.wav");
        let png = dir.path().join("tone.png");
        write_tone(&wav, 440.0, SAMPLE_RATE as usize);

        let outcome = generator(128).generate(&wav, &png);
        assert_eq!(outcome, FileOutcome::Converted);

        let img = image::open(&png).unwrap();
        assert_eq!(img.width(), 128);
        assert_eq!(img.height(), 128);
        assert_eq!(img.color(), image::ColorType::L8);
    }

    #[test]
    fn test_silent_file_is_skipped_without_output() {
        let dir = tempfile::tempdir().unwrap();
        let wav = dir.path().join("silence.wav");
        let png = dir.path().join("silence.png");
        write_silence(&wav, 4000);

        let outcome = generator(64).generate(&wav, &png);
        assert!(matches!(outcome, FileOutcome::Skipped { .. }));
        assert!(!outcome.is_success());
        assert!(!png.exists());
    }

    #[test]
    fn test_unreadable_file_is_failure_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        let wav = dir.path().join("garbage.wav");
        std::fs::write(&wav, b"garbage").unwrap();
        let png = dir.path().join("garbage.png");

        let outcome = generator(64).generate(&wav, &png);
        assert!(matches!(outcome, FileOutcome::Failed { .. }));
        assert!(!png.exists());

        let missing = generator(64).generate(&PathBuf::from("does/not/exist.wav"), &png);
        assert!(matches!(missing, FileOutcome::Failed { .. }));
    }

    #[test]
    fn test_stft_frame_count_and_bins() {
        let gen = generator(64);
        // 1024窓、512ホップ: (4096 - 1024) / 512 + 1 = 7
        let columns = gen.compute_stft(&vec![0.5; 4096]).unwrap();
        assert_eq!(columns.len(), 7);
        assert_eq!(columns[0].len(), 513);

        // 窓長より短い信号は1フレーム
        let short = gen.compute_stft(&vec![0.5; 100]).unwrap();
        assert_eq!(short.len(), 1);
    }

    #[test]
    fn test_low_tone_is_brighter_near_bottom() {
        let dir = tempfile::tempdir().unwrap();
        let low_wav = dir.path().join("low.wav");
        let high_wav = dir.path().join("high.wav");
        let low_png = dir.path().join("low.png");
        let high_png = dir.path().join("high.png");
        write_tone(&low_wav, 300.0, SAMPLE_RATE as usize);
        write_tone(&high_wav, 6000.0, SAMPLE_RATE as usize);

        let gen = generator(64);
        assert!(gen.generate(&low_wav, &low_png).is_success());
        assert!(gen.generate(&high_wav, &high_png).is_success());

        let row_mean = |img: &GrayImage, y: u32| -> f32 {
            (0..img.width()).map(|x| img.get_pixel(x, y)[0] as f32).sum::<f32>() / img.width() as f32
        };
        let brightest_row = |img: &GrayImage| -> u32 {
            (0..img.height())
                .max_by(|&a, &b| row_mean(img, a).partial_cmp(&row_mean(img, b)).unwrap())
                .unwrap()
        };

        let low = image::open(&low_png).unwrap().to_luma8();
        let high = image::open(&high_png).unwrap().to_luma8();
        // 行0が最高周波数なので、低い音ほど下（大きいy）に明るい行が来る
        assert!(brightest_row(&low) > brightest_row(&high));
    }

    #[test]
    fn test_render_constant_input_is_black() {
        let columns = vec![vec![1.0f32; 8]; 4];
        let img = render_grayscale(&columns, 16, 80.0);
        assert_eq!(img.dimensions(), (16, 16));
        assert!(img.pixels().all(|p| p[0] == 0));
    }
}
