use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{MusicToolsError, Result};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub metronome: MetronomeConfig,
    pub waveform: WaveformConfig,
    pub playback: PlaybackConfig,
}

impl AppConfig {
    /// Reads a JSON configuration file. Missing fields fall back to their
    /// defaults so partial files are accepted; inconsistent values are not.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.metronome.validate()?;
        self.waveform.validate()?;
        self.playback.validate()
    }
}

/// Timing parameters of the beat scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetronomeConfig {
    /// How far ahead of the backend clock beats are handed over, in seconds.
    pub lookahead_secs: f64,
    /// Wall-clock cadence of the scheduling pass, independent of tempo.
    pub poll_interval_ms: u64,
    /// How long an accented beat stays highlighted on the display.
    pub accent_highlight_ms: u64,
    pub min_bpm: f64,
    pub max_bpm: f64,
}

impl Default for MetronomeConfig {
    fn default() -> Self {
        Self {
            lookahead_secs: 0.1,
            poll_interval_ms: 25,
            accent_highlight_ms: 100,
            min_bpm: 1.0,
            max_bpm: 300.0,
        }
    }
}

impl MetronomeConfig {
    /// Checks that the tempo range is ordered and positive and that the
    /// look-ahead window is usable.
    pub fn validate(&self) -> Result<()> {
        if !(self.min_bpm.is_finite() && self.max_bpm.is_finite() && self.min_bpm > 0.0) {
            return Err(MusicToolsError::InvalidInput("tempo limits must be positive numbers"));
        }
        if self.min_bpm > self.max_bpm {
            return Err(MusicToolsError::InvalidInput("min_bpm must not exceed max_bpm"));
        }
        if !(self.lookahead_secs.is_finite() && self.lookahead_secs >= 0.0) {
            return Err(MusicToolsError::InvalidInput(
                "look-ahead window must be a non-negative number of seconds",
            ));
        }
        Ok(())
    }
}

/// Shape of the peak series produced by the waveform pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaveformConfig {
    pub total_chunks: usize,
    pub bars_per_chunk: usize,
    /// Number of chunks processed between explicit yields to the runtime.
    pub yield_every: usize,
}

impl WaveformConfig {
    /// Number of peaks in a completed series.
    pub fn total_bars(&self) -> usize {
        self.total_chunks * self.bars_per_chunk
    }

    pub fn validate(&self) -> Result<()> {
        if self.total_chunks == 0 || self.bars_per_chunk == 0 {
            return Err(MusicToolsError::InvalidInput(
                "waveform needs at least one chunk and one bar per chunk",
            ));
        }
        Ok(())
    }
}

impl Default for WaveformConfig {
    fn default() -> Self {
        Self {
            total_chunks: 50,
            bars_per_chunk: 40,
            yield_every: 5,
        }
    }
}

/// Limits of the tempo-matched playback speed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub min_rate: f64,
    pub max_rate: f64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            min_rate: 0.1,
            max_rate: 2.0,
        }
    }
}

impl PlaybackConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.min_rate.is_finite() && self.max_rate.is_finite() && self.min_rate > 0.0) {
            return Err(MusicToolsError::InvalidInput("playback rate limits must be positive numbers"));
        }
        if self.min_rate > self.max_rate {
            return Err(MusicToolsError::InvalidInput("min_rate must not exceed max_rate"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_produce_two_thousand_bars() {
        let config = AppConfig::default();
        assert_eq!(config.waveform.total_bars(), 2000);
        assert_eq!(config.metronome.poll_interval_ms, 25);
    }

    #[test]
    fn partial_file_keeps_remaining_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "metronome": { "lookahead_secs": 0.2 } }"#).unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.metronome.lookahead_secs, 0.2);
        assert_eq!(config.metronome.poll_interval_ms, 25);
        assert_eq!(config.waveform, WaveformConfig::default());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "not json").unwrap();

        assert!(AppConfig::load(&path).is_err());
    }

    #[test]
    fn inverted_ranges_are_rejected() {
        let dir = tempfile::tempdir().unwrap();

        let tempo = dir.path().join("tempo.json");
        std::fs::write(&tempo, r#"{ "metronome": { "min_bpm": 300, "max_bpm": 1 } }"#).unwrap();
        assert!(matches!(
            AppConfig::load(&tempo),
            Err(MusicToolsError::InvalidInput(_))
        ));

        let rate = dir.path().join("rate.json");
        std::fs::write(&rate, r#"{ "playback": { "min_rate": 2.0, "max_rate": 0.5 } }"#).unwrap();
        assert!(matches!(
            AppConfig::load(&rate),
            Err(MusicToolsError::InvalidInput(_))
        ));
    }

    #[test]
    fn empty_waveform_layout_is_rejected() {
        let config = WaveformConfig {
            total_chunks: 0,
            ..WaveformConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(AppConfig::default().validate().is_ok());
    }
}
