use async_trait::async_trait;
use cadenza_core::operation::once;
use cadenza_core::{Backend, Chunk, ChunkStream, OpConfig, OpKind, OperationError};
use std::sync::Mutex;

use super::{ConfigReader, backend_error, failed, invalid};

const ID: &str = "pitch";
const MAX_SEMITONES: i64 = 24;
const MAX_CHANNELS: i64 = 64;

/// `filter_audio/pitch`: varispeed pitch shift of 16-bit PCM.
///
/// Audio is resampled by `2^(semitones/12)` and keeps its sample rate, so
/// raising pitch also shortens the clip.
#[derive(Debug, Default)]
pub struct PitchShift {
    semitones: Mutex<i64>,
}

impl PitchShift {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Resample interleaved 16-bit little-endian PCM by `factor` with linear
/// interpolation between neighbouring frames.
pub fn resample_pcm16(audio: &[u8], channels: usize, factor: f64) -> Vec<u8> {
    let Some(frame_bytes) = channels.checked_mul(2).filter(|bytes| *bytes > 0) else {
        return Vec::new();
    };
    let frames = audio.len() / frame_bytes;
    if frames == 0 || factor <= 0.0 {
        return Vec::new();
    }

    let sample = |frame: usize, channel: usize| -> f64 {
        let at = frame * frame_bytes + channel * 2;
        f64::from(i16::from_le_bytes([audio[at], audio[at + 1]]))
    };

    let out_frames = ((frames as f64) / factor).floor() as usize;
    let mut out = Vec::with_capacity(out_frames * frame_bytes);
    for j in 0..out_frames {
        let position = j as f64 * factor;
        let left = (position.floor() as usize).min(frames - 1);
        let right = (left + 1).min(frames - 1);
        let frac = position - left as f64;
        for channel in 0..channels {
            let value = sample(left, channel) * (1.0 - frac) + sample(right, channel) * frac;
            let clamped = value.round().clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16;
            out.extend_from_slice(&clamped.to_le_bytes());
        }
    }
    out
}

#[async_trait]
impl Backend for PitchShift {
    async fn configure(&self, config: &OpConfig) -> Result<(), OperationError> {
        let reader = ConfigReader::new(config, OpKind::FilterAudio, ID);
        if let Some(semitones) = reader.int("pitch_amount")? {
            if semitones.abs() > MAX_SEMITONES {
                return Err(invalid(
                    OpKind::FilterAudio,
                    ID,
                    format!("pitch_amount must be within ±{MAX_SEMITONES}, got {semitones}"),
                ));
            }
            *self.semitones.lock().unwrap_or_else(|e| e.into_inner()) = semitones;
        }
        Ok(())
    }

    async fn configuration(&self) -> OpConfig {
        let mut config = OpConfig::new();
        let semitones = *self.semitones.lock().unwrap_or_else(|e| e.into_inner());
        config.insert("pitch_amount".into(), semitones.into());
        config
    }

    fn generate(&self, input: Chunk) -> ChunkStream {
        let semitones = *self.semitones.lock().unwrap_or_else(|e| e.into_inner());
        let (Some(audio), Some(sr), Some(sw), Some(ch)) = (
            input.bytes("audio_bytes"),
            input.int("sr"),
            input.int("sw"),
            input.int("ch"),
        ) else {
            return failed(backend_error(OpKind::FilterAudio, ID, "incomplete audio chunk"));
        };

        if semitones == 0 {
            return once(input);
        }
        if sw != 2 {
            return failed(backend_error(
                OpKind::FilterAudio,
                ID,
                format!("unsupported sample width {sw}, expected 2"),
            ));
        }
        if !(1..=MAX_CHANNELS).contains(&ch) {
            return failed(backend_error(
                OpKind::FilterAudio,
                ID,
                format!("unsupported channel count {ch}, expected 1 to {MAX_CHANNELS}"),
            ));
        }

        let factor = 2f64.powf(semitones as f64 / 12.0);
        let shifted = resample_pcm16(audio, ch as usize, factor);
        once(
            Chunk::new()
                .with("audio_bytes", shifted)
                .with("sr", sr)
                .with("sw", sw)
                .with("ch", ch),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn pcm(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn octave_up_halves_length() {
        let input = pcm(&[0, 100, 200, 300, 400, 500, 600, 700]);
        let out = resample_pcm16(&input, 1, 2.0);
        assert_eq!(out, pcm(&[0, 200, 400, 600]));
    }

    #[test]
    fn stereo_frames_interpolate_per_channel() {
        let input = pcm(&[0, 1000, 100, 2000]);
        let out = resample_pcm16(&input, 2, 0.5);
        assert_eq!(out, pcm(&[0, 1000, 50, 1500, 100, 2000, 100, 2000]));
    }

    #[tokio::test]
    async fn configure_bounds_and_reports_amount() {
        let filter = PitchShift::new();
        let mut config = OpConfig::new();
        config.insert("pitch_amount".into(), 99.into());
        assert!(filter.configure(&config).await.is_err());

        config.insert("pitch_amount".into(), (-3).into());
        filter.configure(&config).await.unwrap();
        assert_eq!(filter.configuration().await["pitch_amount"], -3);
    }

    #[tokio::test]
    async fn rejects_non_16_bit_audio() {
        let filter = PitchShift::new();
        let mut config = OpConfig::new();
        config.insert("pitch_amount".into(), 12.into());
        filter.configure(&config).await.unwrap();

        let chunk = Chunk::new()
            .with("audio_bytes", vec![0u8; 8])
            .with("sr", 16_000i64)
            .with("sw", 4i64)
            .with("ch", 1i64);
        let result: Result<Vec<Chunk>, _> = filter.generate(chunk).try_collect().await;
        assert!(matches!(result, Err(OperationError::Backend { .. })));
    }

    #[tokio::test]
    async fn rejects_out_of_range_channel_counts() {
        let filter = PitchShift::new();
        let mut config = OpConfig::new();
        config.insert("pitch_amount".into(), 5.into());
        filter.configure(&config).await.unwrap();

        for ch in [0i64, -1, 65, i64::MAX] {
            let chunk = Chunk::new()
                .with("audio_bytes", vec![0u8; 8])
                .with("sr", 16_000i64)
                .with("sw", 2i64)
                .with("ch", ch);
            let result: Result<Vec<Chunk>, _> = filter.generate(chunk).try_collect().await;
            assert!(matches!(result, Err(OperationError::Backend { .. })), "ch = {ch}");
        }
    }

    #[test]
    fn zero_channels_resample_to_nothing() {
        assert!(resample_pcm16(&pcm(&[1, 2, 3, 4]), 0, 2.0).is_empty());
        assert!(resample_pcm16(&pcm(&[1, 2, 3, 4]), usize::MAX, 2.0).is_empty());
    }
}
