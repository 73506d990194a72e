//! Audio backend abstraction shared by the metronome and the waveform
//! pipeline.
//!
//! A backend owns the precise clock that beats are scheduled against, plays
//! [`SoundEvent`]s at absolute clock times and decodes encoded audio into
//! per-channel samples. Implementations shipped with the crate:
//!
//! - [`OfflineBackend`]: manually advanced clock, mixes everything it was
//!   given into a buffer.
//! - [`SystemBackend`]: silent, driven by the monotonic system clock.
//! - `DeviceBackend` (feature `device`): plays on the default output device.

#[cfg(feature = "device")]
mod device;
mod offline;
mod system;

use std::{io::Cursor, path::Path};

use crate::{MusicToolsError, Result, SoundEvent};

#[cfg(feature = "device")]
pub use device::DeviceBackend;
pub use offline::OfflineBackend;
pub use system::SystemBackend;

/// Lifecycle state of an audio backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Running,
    /// Clock and output paused; may be resumed.
    Suspended,
    /// Permanently shut down.
    Closed,
}

/// Sound-producing backend with its own monotonic clock.
pub trait AudioBackend: Send + Sync {
    /// Backend clock in fractional seconds. Never decreases.
    fn current_time(&self) -> f64;

    /// Rate, in Hz, at which the backend renders sound.
    fn sample_rate(&self) -> u32;

    fn state(&self) -> BackendState;

    /// Attempts to move a suspended backend back to [`BackendState::Running`].
    fn resume(&self) -> Result<()>;

    /// Queues a one-shot sound to start at `event.start` on the backend
    /// clock. Events whose start time already passed play immediately.
    fn schedule(&self, event: SoundEvent) -> Result<()>;

    /// Converts an encoded audio container into per-channel samples.
    fn decode(&self, bytes: &[u8]) -> Result<DecodedAudio> {
        decode_wav(bytes)
    }
}

/// Resumes the backend if it is suspended and fails when it cannot run.
pub fn ensure_running(backend: &dyn AudioBackend) -> Result<()> {
    match backend.state() {
        BackendState::Running => Ok(()),
        BackendState::Closed => Err(MusicToolsError::BackendUnavailable(
            "audio backend is closed".to_string(),
        )),
        BackendState::Suspended => {
            backend.resume()?;
            if backend.state() == BackendState::Running {
                Ok(())
            } else {
                Err(MusicToolsError::BackendUnavailable(
                    "audio backend did not resume".to_string(),
                ))
            }
        }
    }
}

/// Decoded audio, one sample vector per channel.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub sample_rate: u32,
    pub channels: Vec<Vec<f32>>,
}

impl DecodedAudio {
    /// Single-channel audio.
    pub fn mono(sample_rate: u32, samples: Vec<f32>) -> Self {
        Self {
            sample_rate,
            channels: vec![samples],
        }
    }

    /// Samples of one channel, `None` past the last channel.
    pub fn channel(&self, index: usize) -> Option<&[f32]> {
        self.channels.get(index).map(Vec::as_slice)
    }

    /// Number of samples per channel.
    pub fn frames(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            0.0
        } else {
            self.frames() as f64 / self.sample_rate as f64
        }
    }
}

/// Decodes a RIFF/WAVE byte buffer. Integer formats are normalised to
/// `[-1, 1]`, interleaved frames are split per channel.
pub fn decode_wav(bytes: &[u8]) -> Result<DecodedAudio> {
    let reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|err| MusicToolsError::DecodeFailure(err.to_string()))?;
    let spec = reader.spec();

    if spec.channels == 0 {
        return Err(MusicToolsError::DecodeFailure(
            "stream declares zero channels".to_string(),
        ));
    }

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<Vec<f32>, hound::Error>>()
            .map_err(|err| MusicToolsError::DecodeFailure(err.to_string()))?,
        hound::SampleFormat::Int => {
            let max_val = (1_i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .into_samples::<i32>()
                .map(|sample| sample.map(|value| value as f32 / max_val))
                .collect::<std::result::Result<Vec<f32>, hound::Error>>()
                .map_err(|err| MusicToolsError::DecodeFailure(err.to_string()))?
        }
    };

    let channel_count = spec.channels as usize;
    let mut channels = vec![Vec::with_capacity(interleaved.len() / channel_count); channel_count];
    for frame in interleaved.chunks_exact(channel_count) {
        for (channel, sample) in channels.iter_mut().zip(frame) {
            channel.push(*sample);
        }
    }

    Ok(DecodedAudio {
        sample_rate: spec.sample_rate,
        channels,
    })
}

/// Writes mono samples as 16-bit PCM.
pub fn write_wav(path: impl AsRef<Path>, sample_rate: u32, samples: &[f32]) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = hound::WavWriter::create(path, spec)?;
    for &sample in samples {
        writer.write_sample((sample.clamp(-1.0, 1.0) * 32767.0) as i16)?;
    }
    writer.finalize()?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Encodes interleaved 16-bit PCM into an in-memory WAV file.
    pub(crate) fn wav_bytes(channels: u16, sample_rate: u32, samples: &[f32]) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for &sample in samples {
                writer
                    .write_sample((sample.clamp(-1.0, 1.0) * 32767.0) as i16)
                    .unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn decodes_stereo_into_separate_channels() {
        let bytes = wav_bytes(2, 8_000, &[0.5, -0.25, 1.0, 0.0]);
        let decoded = decode_wav(&bytes).unwrap();

        assert_eq!(decoded.sample_rate, 8_000);
        assert_eq!(decoded.channels.len(), 2);
        assert_eq!(decoded.frames(), 2);
        let left = decoded.channel(0).unwrap();
        assert!((left[0] - 0.5).abs() < 1e-3);
        assert!((left[1] - 1.0).abs() < 1e-3);
        let right = decoded.channel(1).unwrap();
        assert!((right[0] + 0.25).abs() < 1e-3);
    }

    #[test]
    fn rejects_non_wav_bytes() {
        let err = decode_wav(b"definitely not audio").unwrap_err();
        assert!(matches!(err, MusicToolsError::DecodeFailure(_)));
    }

    #[test]
    fn duration_follows_sample_rate() {
        let decoded = DecodedAudio::mono(100, vec![0.0; 250]);
        assert!((decoded.duration_secs() - 2.5).abs() < 1e-9);
    }

    #[test]
    fn closed_backend_is_unavailable() {
        let backend = OfflineBackend::new(48_000);
        backend.close();
        let err = ensure_running(&backend).unwrap_err();
        assert!(matches!(err, MusicToolsError::BackendUnavailable(_)));
    }

    #[test]
    fn written_files_decode_again() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");
        write_wav(&path, 22_050, &[0.0, 0.5, -0.5, 2.0]).unwrap();

        let decoded = decode_wav(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(decoded.sample_rate, 22_050);
        let samples = decoded.channel(0).unwrap();
        assert!((samples[1] - 0.5).abs() < 1e-3);
        assert!((samples[3] - 1.0).abs() < 1e-3);
    }
}
