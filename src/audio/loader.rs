//! WAVファイルの読み込み
//!
//! サンプルレートとPCMサンプルを読み込み、多チャンネルの場合は先頭チャンネルのみ残します。

use hound::{SampleFormat, WavReader};
use std::path::Path;
use thiserror::Error;

/// 1ファイル単位の変換エラー（致命的ではなく、呼び出し側で記録して続行する）
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("Failed to read WAV file: {0}")]
    Decode(#[from] hound::Error),

    #[error("Unsupported audio format: {0}")]
    Unsupported(String),

    #[error("FFT failed: {0}")]
    Fft(String),

    #[error("Failed to write image: {0}")]
    Image(#[from] image::ImageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct AudioSample {
    /// モノラル化済みのサンプル（整数PCMは [-1.0, 1.0) にスケール）
    pub samples: Vec<f32>,

    /// サンプルレート (Hz)
    pub sample_rate: u32,

    /// 元ファイルのチャンネル数
    pub source_channels: u16,
}

impl AudioSample {
    /// 最大絶対振幅
    pub fn peak(&self) -> f32 {
        self.samples.iter().fold(0.0f32, |acc, &s| acc.max(s.abs()))
    }

    /// 無音（最大振幅が0）かどうか
    pub fn is_silent(&self) -> bool {
        self.peak() == 0.0
    }

    /// 最大振幅で割って [-1.0, 1.0] に正規化したサンプル
    ///
    /// 無音の場合はNone
    pub fn normalized(&self) -> Option<Vec<f32>> {
        if self.is_silent() {
            return None;
        }
        let peak = self.peak();
        Some(self.samples.iter().map(|s| s / peak).collect())
    }
}

/// WAVファイルを読み込み、チャンネル0のみを取り出す
pub fn read_wav<P: AsRef<Path>>(path: P) -> Result<AudioSample, ConversionError> {
    let reader = WavReader::open(path.as_ref())?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (SampleFormat::Float, 32) => reader
            .into_samples::<f32>()
            .collect::<Result<Vec<_>, _>>()?,
        (SampleFormat::Int, bits @ (8 | 16 | 24 | 32)) => {
            let max_value = (1i64 << (bits - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_value))
                .collect::<Result<Vec<_>, _>>()?
        }
        (format, bits) => {
            return Err(ConversionError::Unsupported(format!(
                "{:?} {}-bit audio",
                format, bits
            )));
        }
    };

    // モノラル化: 平均ではなく先頭チャンネルを採用
    let samples = if channels > 1 {
        interleaved.iter().step_by(channels).copied().collect()
    } else {
        interleaved
    };

    Ok(AudioSample {
        samples,
        sample_rate: spec.sample_rate,
        source_channels: spec.channels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::{WavSpec, WavWriter};

    fn write_wav(path: &Path, channels: u16, frames: &[Vec<i16>]) {
        let spec = WavSpec {
            channels,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(path, spec).unwrap();
        for frame in frames {
            for &s in frame {
                writer.write_sample(s).unwrap();
            }
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_stereo_keeps_first_channel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        write_wav(&path, 2, &[vec![100, -200], vec![-300, 400], vec![500, 0]]);

        let audio = read_wav(&path).unwrap();
        assert_eq!(audio.source_channels, 2);
        assert_eq!(audio.samples.len(), 3);
        assert!((audio.samples[0] - 100.0 / 32768.0).abs() < 1e-7);
        assert!((audio.samples[1] + 300.0 / 32768.0).abs() < 1e-7);
        assert!((audio.samples[2] - 500.0 / 32768.0).abs() < 1e-7);
    }

    #[test]
    fn test_silent_first_channel_is_silent() {
        // チャンネル1に信号があってもチャンネル0が無音なら無音扱い
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("left_silent.wav");
        write_wav(&path, 2, &[vec![0, 1000], vec![0, -1000]]);

        let audio = read_wav(&path).unwrap();
        assert!(audio.is_silent());
        assert!(audio.normalized().is_none());
    }

    #[test]
    fn test_normalize_by_peak() {
        let audio = AudioSample {
            samples: vec![0.1, -0.5, 0.25],
            sample_rate: 8000,
            source_channels: 1,
        };
        let normalized = audio.normalized().unwrap();
        assert_eq!(normalized, vec![0.2, -1.0, 0.5]);
    }

    #[test]
    fn test_not_a_wav_is_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.wav");
        std::fs::write(&path, b"definitely not RIFF").unwrap();
        assert!(matches!(read_wav(&path), Err(ConversionError::Decode(_))));
    }
}
