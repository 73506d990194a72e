//! Audible backend on the default output device, via `cpal`.
//!
//! The device callback is the clock: every frame it writes advances
//! [`DeviceBackend::current_time`], so clicks land on exact sample positions.
//! The stream lives on its own thread because `cpal::Stream` is not `Send` on
//! every platform.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc, Arc, Mutex, MutexGuard,
    },
    thread,
};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use super::{AudioBackend, BackendState};
use crate::{MusicToolsError, Result, SoundEvent};

/// A rendered click waiting for, or in the middle of, playback.
#[derive(Debug)]
struct Voice {
    start_frame: u64,
    samples: Vec<f32>,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Voices shared between the scheduler side and the device callback.
#[derive(Debug, Default)]
struct Mixer {
    voices: Vec<Voice>,
}

impl Mixer {
    /// Fills one output buffer that starts at `first_frame` and drops voices
    /// that have finished.
    fn process<T>(&mut self, output: &mut [T], channels: usize, first_frame: u64)
    where
        T: cpal::SizedSample + cpal::FromSample<f32>,
    {
        let channels = channels.max(1);
        for (offset, frame) in output.chunks_mut(channels).enumerate() {
            let position = first_frame + offset as u64;
            let mixed: f32 = self
                .voices
                .iter()
                .filter(|voice| voice.start_frame <= position && position < voice.end_frame())
                .map(|voice| voice.samples[(position - voice.start_frame) as usize])
                .sum();

            let value = T::from_sample(mixed.clamp(-1.0, 1.0));
            for channel in frame.iter_mut() {
                *channel = value;
            }
        }

        let frames = (output.len() / channels) as u64;
        self.voices.retain(|voice| voice.end_frame() > first_frame + frames);
    }
}

/// Backend that plays clicks on the system's default output device.
pub struct DeviceBackend {
    sample_rate: u32,
    frames: Arc<AtomicU64>,
    mixer: Arc<Mutex<Mixer>>,
    state: Mutex<BackendState>,
    shutdown: Mutex<Option<mpsc::Sender<()>>>,
}

impl DeviceBackend {
    /// Opens the default output device and starts its stream. The backend
    /// itself starts suspended, like [`super::SystemBackend`].
    pub fn open() -> Result<Self> {
        let frames = Arc::new(AtomicU64::new(0));
        let mixer = Arc::new(Mutex::new(Mixer::default()));
        let (ready_tx, ready_rx) = mpsc::channel::<Result<u32>>();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let stream_frames = frames.clone();
        let stream_mixer = mixer.clone();
        thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || {
                let stream = match open_stream(stream_frames, stream_mixer) {
                    Ok((stream, sample_rate)) => {
                        let _ = ready_tx.send(Ok(sample_rate));
                        stream
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                // Blocks until the backend is closed or dropped.
                let _ = shutdown_rx.recv();
                drop(stream);
            })?;

        let sample_rate = ready_rx.recv().map_err(|_| {
            MusicToolsError::BackendUnavailable("audio output thread exited".to_string())
        })??;

        Ok(Self {
            sample_rate,
            frames,
            mixer,
            state: Mutex::new(BackendState::Suspended),
            shutdown: Mutex::new(Some(shutdown_tx)),
        })
    }

    /// Stops the output stream for good.
    pub fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            *state = BackendState::Closed;
        }
        if let Ok(mut shutdown) = self.shutdown.lock() {
            if let Some(tx) = shutdown.take() {
                let _ = tx.send(());
            }
        }
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, BackendState>> {
        self.state
            .lock()
            .map_err(|_| MusicToolsError::msg("device backend has been poisoned"))
    }
}

impl Drop for DeviceBackend {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for DeviceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBackend")
            .field("sample_rate", &self.sample_rate)
            .field("time", &self.current_time())
            .finish()
    }
}

impl AudioBackend for DeviceBackend {
    fn current_time(&self) -> f64 {
        self.frames.load(Ordering::Acquire) as f64 / self.sample_rate as f64
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn state(&self) -> BackendState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(BackendState::Closed)
    }

    fn resume(&self) -> Result<()> {
        let mut state = self.lock_state()?;
        match *state {
            BackendState::Closed => Err(MusicToolsError::BackendUnavailable(
                "output device is closed".to_string(),
            )),
            BackendState::Suspended => {
                tracing::debug!("resuming output device");
                *state = BackendState::Running;
                Ok(())
            }
            BackendState::Running => Ok(()),
        }
    }

    fn schedule(&self, event: SoundEvent) -> Result<()> {
        let state = *self.lock_state()?;
        if state != BackendState::Running {
            return Err(MusicToolsError::BackendUnavailable(format!(
                "cannot schedule while {state:?}"
            )));
        }

        let now_frame = self.frames.load(Ordering::Acquire);
        let start_frame = ((event.start * self.sample_rate as f64).round().max(0.0) as u64).max(now_frame);
        let samples = event.render(self.sample_rate);

        self.mixer
            .lock()
            .map_err(|_| MusicToolsError::msg("device mixer has been poisoned"))?
            .voices
            .push(Voice { start_frame, samples });
        tracing::debug!(start_frame, kind = ?event.kind, "click queued on device");
        Ok(())
    }
}

fn open_stream(frames: Arc<AtomicU64>, mixer: Arc<Mutex<Mixer>>) -> Result<(cpal::Stream, u32)> {
    let host = cpal::default_host();
    tracing::info!(host = ?host.id(), "audio host");

    let device = host
        .default_output_device()
        .ok_or_else(|| MusicToolsError::BackendUnavailable("no output device found".to_string()))?;
    let config = device
        .default_output_config()
        .map_err(|err| MusicToolsError::BackendUnavailable(err.to_string()))?;

    let sample_rate = config.sample_rate().0;
    let channels = config.channels() as usize;
    let stream = match config.sample_format() {
        cpal::SampleFormat::F32 => build_stream::<f32>(&device, &config.into(), frames, mixer, channels),
        cpal::SampleFormat::I16 => build_stream::<i16>(&device, &config.into(), frames, mixer, channels),
        cpal::SampleFormat::U16 => build_stream::<u16>(&device, &config.into(), frames, mixer, channels),
        other => Err(MusicToolsError::BackendUnavailable(format!(
            "unsupported sample format {other:?}"
        ))),
    }?;

    stream
        .play()
        .map_err(|err| MusicToolsError::BackendUnavailable(err.to_string()))?;
    tracing::info!(sample_rate, channels, "audio stream started");
    Ok((stream, sample_rate))
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    frames: Arc<AtomicU64>,
    mixer: Arc<Mutex<Mixer>>,
    channels: usize,
) -> Result<cpal::Stream>
where
    T: cpal::SizedSample + cpal::FromSample<f32>,
{
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let first_frame = frames.load(Ordering::Acquire);
                match mixer.lock() {
                    Ok(mut mixer) => mixer.process(data, channels, first_frame),
                    Err(_) => data.fill(T::EQUILIBRIUM),
                }
                frames.fetch_add((data.len() / channels.max(1)) as u64, Ordering::Release);
            },
            |err| tracing::error!(%err, "audio stream error"),
            None,
        )
        .map_err(|err| MusicToolsError::BackendUnavailable(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn voices_are_mixed_at_their_start_frame() {
        let mut mixer = Mixer::default();
        mixer.voices.push(Voice {
            start_frame: 2,
            samples: vec![0.5, 0.25],
        });
        mixer.voices.push(Voice {
            start_frame: 3,
            samples: vec![0.5],
        });

        let mut out = vec![1.0_f32; 12];
        mixer.process(&mut out, 2, 0);

        assert_eq!(out, vec![0.0, 0.0, 0.0, 0.0, 0.5, 0.5, 0.75, 0.75, 0.0, 0.0, 0.0, 0.0]);
        assert!(mixer.voices.is_empty());
    }

    #[test]
    fn unfinished_voices_carry_over_to_the_next_buffer() {
        let mut mixer = Mixer::default();
        mixer.voices.push(Voice {
            start_frame: 3,
            samples: vec![0.1, 0.2, 0.3],
        });

        let mut first = vec![0.0_f32; 4];
        mixer.process(&mut first, 1, 0);
        assert_eq!(first, vec![0.0, 0.0, 0.0, 0.1]);
        assert_eq!(mixer.voices.len(), 1);

        let mut second = vec![0.0_f32; 4];
        mixer.process(&mut second, 1, 4);
        assert_eq!(second, vec![0.2, 0.3, 0.0, 0.0]);
        assert!(mixer.voices.is_empty());
    }
}
