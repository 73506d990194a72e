//! Waveform peak extraction.
//!
//! Audio is reduced to a fixed number of bars, each holding the largest
//! absolute sample of its window. Max-pooling keeps transients visible where
//! an average would smear them out. The work is split into chunks so the
//! [`pipeline`] can hand partial results to the renderer and yield between
//! chunks.

pub mod pipeline;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use serde::{Deserialize, Serialize};

pub use pipeline::{AudioSource, Extraction, PartialPeaks, PeakUpdate, PipelineCoordinator};

/// Opaque identifier of a track in the host's playlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrackId(pub u64);

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "track-{}", self.0)
    }
}

/// Completed, read-only peak data for a track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeakSeries {
    peaks: Vec<f32>,
    total_chunks: usize,
    bars_per_chunk: usize,
}

impl PeakSeries {
    pub(crate) fn new(peaks: Vec<f32>, total_chunks: usize, bars_per_chunk: usize) -> Self {
        Self {
            peaks,
            total_chunks,
            bars_per_chunk,
        }
    }

    /// Peak magnitudes in `[0, 1]`, one per bar, in time order.
    pub fn peaks(&self) -> &[f32] {
        &self.peaks
    }

    /// Number of bars, `total_chunks * bars_per_chunk` for a completed series.
    pub fn len(&self) -> usize {
        self.peaks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peaks.is_empty()
    }

    /// Chunks the series was produced in.
    pub fn total_chunks(&self) -> usize {
        self.total_chunks
    }

    pub fn bars_per_chunk(&self) -> usize {
        self.bars_per_chunk
    }
}

/// Splits `samples[start..end]` into `bars` equal windows and returns the
/// largest absolute sample of each, clamped to `[0, 1]`.
///
/// The window width is rounded down; trailing samples that do not fill a
/// whole window are ignored. Windows that end up empty yield `0.0`.
pub fn extract_peaks(samples: &[f32], start: usize, end: usize, bars: usize) -> Vec<f32> {
    let end = end.min(samples.len());
    let start = start.min(end);
    if bars == 0 {
        return Vec::new();
    }

    let samples_per_bar = (end - start) / bars;
    (0..bars)
        .map(|bar| {
            let bar_start = start + bar * samples_per_bar;
            let bar_end = (bar_start + samples_per_bar).min(end);
            samples[bar_start..bar_end]
                .iter()
                .fold(0.0_f32, |peak, sample| peak.max(sample.abs()))
                .min(1.0)
        })
        .collect()
}

/// One cancellable extraction run.
///
/// Clones share the same flag; cancelling any clone cancels the run.
#[derive(Debug, Clone)]
pub struct Generation {
    id: u64,
    owner: TrackId,
    cancelled: Arc<AtomicBool>,
}

impl Generation {
    pub(crate) fn new(id: u64, owner: TrackId) -> Self {
        Self {
            id,
            owner,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Sequence number handed out by the coordinator, unique per run.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Track this run extracts peaks for.
    pub fn owner(&self) -> TrackId {
        self.owner
    }

    /// Flags the run as cancelled. It stops at its next check and writes
    /// nothing further.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Waveform status of a single track record.
#[derive(Debug, Clone, PartialEq)]
pub enum WaveformState {
    /// No peaks yet and nothing running.
    Pending,
    /// Being extracted by the generation with this id.
    Generating(u64),
    Ready(PeakSeries),
}

/// Track records the pipeline reads and writes, plus the host's notion of
/// which track is currently active.
#[derive(Debug, Default)]
pub struct TrackLibrary {
    tracks: HashMap<TrackId, WaveformState>,
    active: Option<TrackId>,
}

impl TrackLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a track without a waveform. Existing records are kept.
    pub fn insert(&mut self, track: TrackId) {
        self.tracks.entry(track).or_insert(WaveformState::Pending);
    }

    /// Forgets a track. Clears the active track if it was this one.
    pub fn remove(&mut self, track: TrackId) -> Option<WaveformState> {
        if self.active == Some(track) {
            self.active = None;
        }
        self.tracks.remove(&track)
    }

    /// Only the active track's extraction makes progress.
    pub fn set_active(&mut self, track: Option<TrackId>) {
        self.active = track;
    }

    pub fn active(&self) -> Option<TrackId> {
        self.active
    }

    pub fn state(&self, track: TrackId) -> Option<&WaveformState> {
        self.tracks.get(&track)
    }

    /// Completed peaks of `track`, if extraction finished.
    pub fn waveform(&self, track: TrackId) -> Option<&PeakSeries> {
        match self.tracks.get(&track) {
            Some(WaveformState::Ready(series)) => Some(series),
            _ => None,
        }
    }

    pub fn is_ready(&self, track: TrackId) -> bool {
        self.waveform(track).is_some()
    }

    /// Drops any completed waveform so the track can be extracted again.
    pub fn reset(&mut self, track: TrackId) {
        if let Some(state) = self.tracks.get_mut(&track) {
            *state = WaveformState::Pending;
        }
    }

    pub(crate) fn mark_generating(&mut self, track: TrackId, generation: u64) {
        self.tracks
            .insert(track, WaveformState::Generating(generation));
    }

    /// Returns the track to `Pending` if `generation` still owns it.
    pub(crate) fn release(&mut self, track: TrackId, generation: u64) {
        if let Some(state) = self.tracks.get_mut(&track) {
            if *state == WaveformState::Generating(generation) {
                *state = WaveformState::Pending;
            }
        }
    }

    /// Stores the finished peaks if `generation` still owns the track.
    pub(crate) fn complete(&mut self, track: TrackId, generation: u64, series: PeakSeries) -> bool {
        match self.tracks.get_mut(&track) {
            Some(state) if *state == WaveformState::Generating(generation) => {
                *state = WaveformState::Ready(series);
                true
            }
            _ => false,
        }
    }
}
