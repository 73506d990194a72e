//! Core library for the Music Tools application.
//!
//! Two independent subsystems share one audio backend: a look-ahead
//! metronome that turns a tempo and accent pattern into precisely timed
//! clicks, and a waveform pipeline that reduces decoded audio to a peak
//! series incrementally and cancellably. Each module owns one subsystem; the
//! most used types are re-exported here.

pub mod audio;
pub mod config;
pub mod error;
pub mod metronome;
pub mod playback;
pub mod scheduler;
pub mod settings;
pub mod synth;
pub mod waveform;

#[cfg(feature = "device")]
pub use audio::DeviceBackend;
pub use audio::{AudioBackend, BackendState, DecodedAudio, OfflineBackend, SystemBackend};
pub use config::{AppConfig, MetronomeConfig, PlaybackConfig, WaveformConfig};
pub use error::{MusicToolsError, Result};
pub use metronome::{render_click_track, BeatDisplay, BeatDisplayUpdate, Metronome, NoDisplay};
pub use playback::{playback_rate, volume_gain};
pub use scheduler::{parse_tempo, BeatClockState, BeatEvent, SchedulerState};
pub use settings::{Settings, SettingsStore};
pub use synth::{synthesize, ClickKind, SoundEvent};
pub use waveform::{
    AudioSource, Extraction, PeakSeries, PeakUpdate, PipelineCoordinator, TrackId, TrackLibrary,
};
