//! Look-ahead beat scheduling.
//!
//! The scheduler is polled on a coarse wall-clock cadence and hands out every
//! beat whose target time falls inside a short window ahead of the backend
//! clock. The audio backend, not the poll loop, performs the precise wait, so
//! poll jitter never reaches the audible timing.

use serde::{Deserialize, Serialize};

use crate::{config::MetronomeConfig, MusicToolsError, Result};

/// Live state of the beat clock.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BeatClockState {
    pub running: bool,
    /// Number of beats emitted since the last reset.
    pub beat_counter: u64,
    /// Backend-clock time of the next beat to emit.
    pub next_beat_time: f64,
    pub tempo_bpm: f64,
    /// Beats per accent cycle; 0 disables accents.
    pub accent_interval: u32,
}

impl BeatClockState {
    /// Seconds between beats at the current tempo.
    pub fn beat_interval(&self) -> f64 {
        60.0 / self.tempo_bpm
    }
}

/// One beat handed to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BeatEvent {
    pub scheduled_time: f64,
    pub sequence_number: u64,
    pub accented: bool,
}

impl BeatEvent {
    /// 1-based position of the beat within its accent cycle, or `None` when
    /// accents are disabled.
    pub fn beat_in_measure(&self, accent_interval: u32) -> Option<u32> {
        if accent_interval == 0 {
            return None;
        }
        Some((self.sequence_number % accent_interval as u64) as u32 + 1)
    }
}

/// Beat `beat` is accented when it starts an accent cycle.
pub fn is_accented(beat: u64, accent_interval: u32) -> bool {
    accent_interval != 0 && beat % accent_interval as u64 == 0
}

/// Rejects tempos that are not strictly positive finite numbers.
pub fn validate_tempo(tempo_bpm: f64) -> Result<f64> {
    if tempo_bpm.is_finite() && tempo_bpm > 0.0 {
        Ok(tempo_bpm)
    } else {
        Err(MusicToolsError::InvalidTempo(tempo_bpm))
    }
}

/// Parses user tempo input. Valid tempos are clamped into the configured
/// BPM range.
pub fn parse_tempo(input: &str, config: &MetronomeConfig) -> Result<f64> {
    config.validate()?;
    let value: f64 = input
        .trim()
        .parse()
        .map_err(|_| MusicToolsError::InvalidTempoInput(input.to_string()))?;
    let tempo = validate_tempo(value)?;
    Ok(tempo.clamp(config.min_bpm, config.max_bpm))
}

/// Synchronous core of the metronome: owns the [`BeatClockState`] and decides
/// which beats are due on every poll.
#[derive(Debug, Clone)]
pub struct SchedulerState {
    clock: BeatClockState,
    lookahead_secs: f64,
    min_bpm: f64,
    max_bpm: f64,
    display_epoch: u64,
}

impl SchedulerState {
    /// Creates a stopped scheduler with the default tempo range. The tempo
    /// is validated even though nothing runs yet.
    pub fn new(tempo_bpm: f64, accent_interval: u32, lookahead_secs: f64) -> Result<Self> {
        Self::with_config(
            tempo_bpm,
            accent_interval,
            &MetronomeConfig {
                lookahead_secs,
                ..MetronomeConfig::default()
            },
        )
    }

    /// Tempos outside `config.min_bpm..=config.max_bpm` are refused.
    pub fn with_config(tempo_bpm: f64, accent_interval: u32, config: &MetronomeConfig) -> Result<Self> {
        config.validate()?;
        let mut state = Self {
            clock: BeatClockState {
                running: false,
                beat_counter: 0,
                next_beat_time: 0.0,
                tempo_bpm: config.min_bpm,
                accent_interval,
            },
            lookahead_secs: config.lookahead_secs,
            min_bpm: config.min_bpm,
            max_bpm: config.max_bpm,
            display_epoch: 0,
        };
        state.clock.tempo_bpm = state.check_tempo(tempo_bpm)?;
        Ok(state)
    }

    fn check_tempo(&self, tempo_bpm: f64) -> Result<f64> {
        let tempo_bpm = validate_tempo(tempo_bpm)?;
        if tempo_bpm < self.min_bpm || tempo_bpm > self.max_bpm {
            return Err(MusicToolsError::InvalidTempo(tempo_bpm));
        }
        Ok(tempo_bpm)
    }

    pub fn clock(&self) -> &BeatClockState {
        &self.clock
    }

    pub fn is_running(&self) -> bool {
        self.clock.running
    }

    /// Width of the scheduling window ahead of the backend clock.
    pub fn lookahead_secs(&self) -> f64 {
        self.lookahead_secs
    }

    /// Changes whenever the beat numbering shown to the user is invalidated
    /// (start, accent change). Display updates captured under an older epoch
    /// must be discarded.
    pub fn display_epoch(&self) -> u64 {
        self.display_epoch
    }

    /// Re-anchors the clock at `now` and starts emitting beats. An invalid
    /// tempo leaves the state untouched.
    pub fn start(&mut self, now: f64, tempo_bpm: f64, accent_interval: u32) -> Result<()> {
        let tempo_bpm = self.check_tempo(tempo_bpm)?;

        self.clock = BeatClockState {
            running: true,
            beat_counter: 0,
            next_beat_time: now,
            tempo_bpm,
            accent_interval,
        };
        self.display_epoch += 1;
        Ok(())
    }

    /// Stops emission. Returns whether the scheduler was running.
    pub fn stop(&mut self) -> bool {
        std::mem::replace(&mut self.clock.running, false)
    }

    /// Applies from the next scheduling pass on; already emitted beats keep
    /// their times.
    pub fn set_tempo(&mut self, tempo_bpm: f64) -> Result<()> {
        self.clock.tempo_bpm = self.check_tempo(tempo_bpm)?;
        Ok(())
    }

    /// Restarts the accent cycle: the beat counter goes back to zero.
    pub fn set_accent_interval(&mut self, accent_interval: u32) {
        self.clock.accent_interval = accent_interval;
        self.clock.beat_counter = 0;
        self.display_epoch += 1;
    }

    /// Drains every beat due before `now + lookahead`, in time order.
    pub fn tick(&mut self, now: f64) -> Vec<BeatEvent> {
        let mut events = Vec::new();
        if !self.clock.running {
            return events;
        }

        let horizon = now + self.lookahead_secs;
        let beat_interval = self.clock.beat_interval();

        while self.clock.next_beat_time < horizon {
            let beat = self.clock.beat_counter;
            events.push(BeatEvent {
                scheduled_time: self.clock.next_beat_time,
                sequence_number: beat,
                accented: is_accented(beat, self.clock.accent_interval),
            });
            self.clock.beat_counter += 1;

            let next = self.clock.next_beat_time + beat_interval;
            // Interval below the clock's float resolution.
            if next <= self.clock.next_beat_time {
                tracing::warn!(time = self.clock.next_beat_time, beat_interval, "beat clock cannot advance, stopping");
                self.clock.running = false;
                break;
            }
            self.clock.next_beat_time = next;
        }

        events
    }
}
