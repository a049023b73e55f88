pub mod loader;
pub mod spectrogram;

pub use loader::{read_wav, AudioSample, ConversionError};
pub use spectrogram::{render_grayscale, FileOutcome, SpectrogramGenerator};
