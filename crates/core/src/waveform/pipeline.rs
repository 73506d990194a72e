//! Incremental, cancellable peak extraction.
//!
//! [`PipelineCoordinator`] hands out one [`Extraction`] at a time. Each call
//! to [`Extraction::next`] does a bounded amount of work and the sequence
//! checks its generation's cancellation flag and the active track before
//! every write, so a superseded run never touches the track record again.

use std::{
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard},
};

use super::{extract_peaks, Generation, PeakSeries, TrackId, TrackLibrary, WaveformState};
use crate::{
    audio::{AudioBackend, DecodedAudio},
    config::WaveformConfig,
    MusicToolsError, Result,
};

/// Encoded audio to extract a waveform from.
#[derive(Debug, Clone)]
pub enum AudioSource {
    Bytes(Arc<[u8]>),
    File(PathBuf),
}

impl AudioSource {
    async fn load(&self) -> Result<Arc<[u8]>> {
        match self {
            AudioSource::Bytes(bytes) => Ok(bytes.clone()),
            AudioSource::File(path) => Ok(tokio::fs::read(path).await?.into()),
        }
    }
}

impl From<Vec<u8>> for AudioSource {
    fn from(bytes: Vec<u8>) -> Self {
        AudioSource::Bytes(bytes.into())
    }
}

impl From<PathBuf> for AudioSource {
    fn from(path: PathBuf) -> Self {
        AudioSource::File(path)
    }
}

/// Peaks accumulated so far by a running extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialPeaks {
    /// Number of chunks processed, 1-based.
    pub chunks_done: usize,
    pub total_chunks: usize,
    pub progress_percent: u8,
    pub peaks: Vec<f32>,
}

/// Item produced by an [`Extraction`].
#[derive(Debug, Clone, PartialEq)]
pub enum PeakUpdate {
    Partial(PartialPeaks),
    /// Final series, already stored on the track.
    Completed(PeakSeries),
    /// Extraction gave up; the track keeps no waveform.
    Failed(String),
}

/// Lets other tasks on the runtime make progress before continuing.
pub async fn yield_to_scheduler() {
    tokio::task::yield_now().await;
}

/// Owns the single "current generation" slot. Starting an extraction cancels
/// whatever ran before it, for any track.
pub struct PipelineCoordinator {
    backend: Arc<dyn AudioBackend>,
    library: Arc<Mutex<TrackLibrary>>,
    config: WaveformConfig,
    current: Option<Generation>,
    generations: u64,
}

impl PipelineCoordinator {
    /// Fails if the configured layout has no chunks or no bars per chunk.
    pub fn new(
        backend: Arc<dyn AudioBackend>,
        library: Arc<Mutex<TrackLibrary>>,
        config: WaveformConfig,
    ) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            backend,
            library,
            config,
            current: None,
            generations: 0,
        })
    }

    /// Shared handle to the track records this coordinator writes.
    pub fn library(&self) -> Arc<Mutex<TrackLibrary>> {
        self.library.clone()
    }

    /// The most recently started generation, cancelled or not.
    pub fn current(&self) -> Option<&Generation> {
        self.current.as_ref()
    }

    /// Starts a new extraction for `track`, superseding any previous one.
    pub fn extract(&mut self, source: AudioSource, track: TrackId) -> Result<Extraction> {
        let mut library = lock(&self.library)?;

        if let Some(previous) = self.current.take() {
            previous.cancel();
            library.release(previous.owner(), previous.id());
            tracing::debug!(generation = previous.id(), track = %previous.owner(), "waveform generation superseded");
        }

        self.generations += 1;
        let generation = Generation::new(self.generations, track);
        library.mark_generating(track, generation.id());
        self.current = Some(generation.clone());
        drop(library);

        tracing::info!(generation = generation.id(), %track, "waveform extraction started");
        Ok(Extraction {
            generation,
            source,
            backend: self.backend.clone(),
            library: self.library.clone(),
            config: self.config.clone(),
            stage: Stage::Load,
        })
    }

    /// Starts an extraction unless the track already has peaks or is being
    /// extracted by the live generation.
    pub fn ensure_waveform(&mut self, source: AudioSource, track: TrackId) -> Result<Option<Extraction>> {
        {
            let library = lock(&self.library)?;
            match library.state(track) {
                Some(WaveformState::Ready(_)) => return Ok(None),
                Some(WaveformState::Generating(id))
                    if self
                        .current
                        .as_ref()
                        .is_some_and(|live| live.id() == *id && !live.is_cancelled()) =>
                {
                    return Ok(None)
                }
                _ => {}
            }
        }

        self.extract(source, track).map(Some)
    }

    /// Cancels the live generation, if any.
    pub fn cancel(&mut self) -> Result<()> {
        if let Some(previous) = self.current.take() {
            previous.cancel();
            lock(&self.library)?.release(previous.owner(), previous.id());
        }
        Ok(())
    }

    /// Forgets the track's waveform so it will be extracted again.
    pub fn reset(&mut self, track: TrackId) -> Result<()> {
        if self.current.as_ref().is_some_and(|live| live.owner() == track) {
            self.cancel()?;
        }
        lock(&self.library)?.reset(track);
        Ok(())
    }
}

impl std::fmt::Debug for PipelineCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineCoordinator")
            .field("config", &self.config)
            .field("current", &self.current)
            .finish()
    }
}

fn lock(library: &Arc<Mutex<TrackLibrary>>) -> Result<MutexGuard<'_, TrackLibrary>> {
    library
        .lock()
        .map_err(|_| MusicToolsError::msg("track library has been poisoned"))
}

enum Stage {
    Load,
    Chunks {
        samples: Vec<f32>,
        samples_per_chunk: usize,
        next_chunk: usize,
        peaks: Vec<f32>,
    },
    Finished,
}

/// Lazy sequence of [`PeakUpdate`]s for one generation.
///
/// Each call to [`Extraction::next`] processes at most one chunk. The
/// sequence ends after `Completed` or `Failed`, or silently as soon as the
/// generation is cancelled or its track stops being the active one.
pub struct Extraction {
    generation: Generation,
    source: AudioSource,
    backend: Arc<dyn AudioBackend>,
    library: Arc<Mutex<TrackLibrary>>,
    config: WaveformConfig,
    stage: Stage,
}

impl Extraction {
    /// The run this sequence belongs to.
    pub fn generation(&self) -> &Generation {
        &self.generation
    }

    pub fn track(&self) -> TrackId {
        self.generation.owner()
    }

    /// Processes the next step: loading and decoding first, then one chunk
    /// per call. `None` once the sequence is over.
    pub async fn next(&mut self) -> Option<PeakUpdate> {
        loop {
            match &mut self.stage {
                Stage::Finished => return None,
                Stage::Load => {
                    let bytes = match self.source.load().await {
                        Ok(bytes) => bytes,
                        Err(err) => return self.fail(err),
                    };
                    if self.superseded() {
                        return self.halt();
                    }

                    let decoded = match decode_off_thread(self.backend.clone(), bytes).await {
                        Ok(decoded) => decoded,
                        Err(err) => return self.fail(err),
                    };
                    if self.superseded() {
                        return self.halt();
                    }

                    let Some(samples) = decoded.channels.into_iter().next() else {
                        return self.fail(MusicToolsError::DecodeFailure(
                            "decoded audio has no channels".to_string(),
                        ));
                    };
                    tracing::debug!(track = %self.track(), samples = samples.len(), "decoded audio for waveform");

                    self.stage = Stage::Chunks {
                        samples_per_chunk: samples.len() / self.config.total_chunks,
                        samples,
                        next_chunk: 0,
                        peaks: Vec::with_capacity(self.config.total_bars()),
                    };
                }
                Stage::Chunks {
                    samples,
                    samples_per_chunk,
                    next_chunk,
                    peaks,
                } => {
                    if self.generation.is_cancelled()
                        || !track_is_active(&self.library, self.generation.owner())
                    {
                        return self.halt();
                    }

                    let total = self.config.total_chunks;
                    if *next_chunk == total {
                        let series = PeakSeries::new(std::mem::take(peaks), total, self.config.bars_per_chunk);
                        return self.finish(series);
                    }

                    let start = *next_chunk * *samples_per_chunk;
                    let end = (start + *samples_per_chunk).min(samples.len());
                    peaks.extend(extract_peaks(samples, start, end, self.config.bars_per_chunk));
                    *next_chunk += 1;

                    let update = PartialPeaks {
                        chunks_done: *next_chunk,
                        total_chunks: total,
                        progress_percent: ((*next_chunk * 100) as f64 / total as f64).round() as u8,
                        peaks: peaks.clone(),
                    };

                    if self.config.yield_every > 0 && update.chunks_done % self.config.yield_every == 0 {
                        yield_to_scheduler().await;
                        if self.superseded() {
                            return self.halt();
                        }
                    }

                    tracing::trace!(track = %self.track(), chunk = update.chunks_done, "waveform chunk ready");
                    return Some(PeakUpdate::Partial(update));
                }
            }
        }
    }

    fn superseded(&self) -> bool {
        self.generation.is_cancelled() || !track_is_active(&self.library, self.track())
    }

    fn halt(&mut self) -> Option<PeakUpdate> {
        self.stage = Stage::Finished;
        if let Ok(mut library) = self.library.lock() {
            library.release(self.track(), self.generation.id());
        }
        tracing::debug!(generation = self.generation.id(), track = %self.track(), "waveform extraction abandoned");
        None
    }

    fn fail(&mut self, err: MusicToolsError) -> Option<PeakUpdate> {
        if self.superseded() {
            return self.halt();
        }

        self.stage = Stage::Finished;
        if let Ok(mut library) = self.library.lock() {
            library.release(self.track(), self.generation.id());
        }
        tracing::warn!(%err, track = %self.track(), "waveform generation failed");
        Some(PeakUpdate::Failed(err.to_string()))
    }

    /// Stores the series on the track, checking ownership under the same
    /// lock as the write.
    fn finish(&mut self, series: PeakSeries) -> Option<PeakUpdate> {
        self.stage = Stage::Finished;
        let Ok(mut library) = self.library.lock() else {
            return None;
        };

        let track = self.track();
        if self.generation.is_cancelled() || library.active() != Some(track) {
            library.release(track, self.generation.id());
            return None;
        }
        if !library.complete(track, self.generation.id(), series.clone()) {
            return None;
        }

        tracing::info!(%track, bars = series.len(), "waveform ready");
        Some(PeakUpdate::Completed(series))
    }
}

/// Decoding a long file is CPU bound, so it runs on the blocking pool and
/// leaves the runtime free for the metronome and the host.
async fn decode_off_thread(backend: Arc<dyn AudioBackend>, bytes: Arc<[u8]>) -> Result<DecodedAudio> {
    tokio::task::spawn_blocking(move || backend.decode(&bytes))
        .await
        .map_err(|err| MusicToolsError::DecodeFailure(format!("decoder task failed: {err}")))?
}

fn track_is_active(library: &Mutex<TrackLibrary>, track: TrackId) -> bool {
    library
        .lock()
        .map(|library| library.active() == Some(track))
        .unwrap_or(false)
}

impl Drop for Extraction {
    /// An extraction abandoned by its caller gives the track back, so a later
    /// `ensure_waveform` starts over instead of waiting for it.
    fn drop(&mut self) {
        if matches!(self.stage, Stage::Finished) {
            return;
        }
        self.generation.cancel();
        if let Ok(mut library) = self.library.lock() {
            library.release(self.track(), self.generation.id());
        }
        tracing::debug!(generation = self.generation.id(), track = %self.track(), "waveform extraction dropped");
    }
}

impl std::fmt::Debug for Extraction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extraction")
            .field("generation", &self.generation)
            .field("source", &self.source)
            .finish()
    }
}
