//! Runtime driver for the beat scheduler.
//!
//! [`Metronome`] re-arms a poll task on a fixed wall-clock interval, hands
//! every due beat to the click synthesizer and schedules a coarse display
//! update for the moment the beat is heard. Display updates are best effort;
//! their delay never affects audio timing.

use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use tokio::{runtime::Handle, task::JoinHandle, time::MissedTickBehavior};

use crate::{
    audio::{ensure_running, AudioBackend, OfflineBackend},
    config::MetronomeConfig,
    synth, BeatClockState, BeatEvent, MusicToolsError, Result, SchedulerState,
};

/// What the beat indicator should show.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeatDisplayUpdate {
    /// Position within the accent cycle, 1-based.
    Beat { number_in_measure: u32, accented: bool },
    /// Accents disabled or metronome stopped.
    Neutral,
}

/// Host-side beat indicator.
pub trait BeatDisplay: Send + Sync {
    fn show(&self, update: BeatDisplayUpdate);

    /// Removes the accent highlight, if one is shown.
    fn clear_accent(&self);
}

/// Display that ignores every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDisplay;

impl BeatDisplay for NoDisplay {
    fn show(&self, _update: BeatDisplayUpdate) {}

    fn clear_accent(&self) {}
}

type SharedState = Arc<Mutex<SchedulerState>>;

/// Look-ahead metronome bound to an audio backend.
///
/// Must be started from within a tokio runtime; the poll loop and display
/// callbacks are spawned onto it.
pub struct Metronome {
    backend: Arc<dyn AudioBackend>,
    display: Arc<dyn BeatDisplay>,
    config: MetronomeConfig,
    state: SharedState,
    poll_task: Option<JoinHandle<()>>,
}

impl Metronome {
    /// Creates a stopped metronome. Fails on an out-of-range tempo or an
    /// inconsistent config.
    pub fn new(
        backend: Arc<dyn AudioBackend>,
        display: Arc<dyn BeatDisplay>,
        config: MetronomeConfig,
        tempo_bpm: f64,
        accent_interval: u32,
    ) -> Result<Self> {
        let state = SchedulerState::with_config(tempo_bpm, accent_interval, &config)?;
        Ok(Self {
            backend,
            display,
            config,
            state: Arc::new(Mutex::new(state)),
            poll_task: None,
        })
    }

    /// Copy of the current beat clock, for display purposes.
    pub fn snapshot(&self) -> Result<BeatClockState> {
        Ok(*lock(&self.state)?.clock())
    }

    /// Whether the poll task is armed.
    pub fn is_running(&self) -> bool {
        self.poll_task.is_some()
    }

    /// Starts (or restarts) the metronome at `tempo_bpm`. An invalid tempo is
    /// refused before anything changes.
    pub fn start(&mut self, tempo_bpm: f64, accent_interval: u32) -> Result<()> {
        let runtime = Handle::try_current()
            .map_err(|_| MusicToolsError::msg("metronome requires a tokio runtime"))?;

        if let Err(err) = ensure_running(self.backend.as_ref()) {
            tracing::warn!(%err, "starting metronome on an unavailable backend");
        }

        lock(&self.state)?.start(self.backend.current_time(), tempo_bpm, accent_interval)?;

        if let Some(task) = self.poll_task.take() {
            task.abort();
        }

        let poll_interval = Duration::from_millis(self.config.poll_interval_ms.max(1));
        let worker = PollWorker {
            backend: self.backend.clone(),
            display: self.display.clone(),
            state: self.state.clone(),
            highlight: Duration::from_millis(self.config.accent_highlight_ms),
        };
        self.poll_task = Some(runtime.spawn(worker.run(poll_interval)));

        tracing::info!(tempo_bpm, accent_interval, "metronome started");
        Ok(())
    }

    /// Stops the poll loop. Calling it while stopped does nothing.
    pub fn stop(&mut self) -> Result<()> {
        let was_running = lock(&self.state)?.stop();
        if let Some(task) = self.poll_task.take() {
            task.abort();
        }

        if was_running {
            self.display.clear_accent();
            self.display.show(BeatDisplayUpdate::Neutral);
            tracing::info!("metronome stopped");
        }
        Ok(())
    }

    /// Takes effect from the next scheduling pass.
    pub fn set_tempo(&mut self, tempo_bpm: f64) -> Result<()> {
        lock(&self.state)?.set_tempo(tempo_bpm)?;
        tracing::debug!(tempo_bpm, "tempo changed");
        Ok(())
    }

    /// Restarts the accent cycle and clears the beat indicator.
    pub fn set_accent_interval(&mut self, accent_interval: u32) -> Result<()> {
        lock(&self.state)?.set_accent_interval(accent_interval);
        self.display.clear_accent();
        self.display.show(BeatDisplayUpdate::Neutral);
        tracing::debug!(accent_interval, "accent interval changed");
        Ok(())
    }
}

impl Drop for Metronome {
    fn drop(&mut self) {
        if let Some(task) = self.poll_task.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Metronome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metronome")
            .field("config", &self.config)
            .field("running", &self.poll_task.is_some())
            .finish()
    }
}

fn lock(state: &SharedState) -> Result<MutexGuard<'_, SchedulerState>> {
    state
        .lock()
        .map_err(|_| MusicToolsError::msg("scheduler state has been poisoned"))
}

struct PollWorker {
    backend: Arc<dyn AudioBackend>,
    display: Arc<dyn BeatDisplay>,
    state: SharedState,
    highlight: Duration,
}

impl PollWorker {
    async fn run(self, poll_interval: Duration) {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let (events, epoch) = {
                let Ok(mut state) = lock(&self.state) else {
                    tracing::warn!("scheduler state poisoned, stopping poll loop");
                    return;
                };
                if !state.is_running() {
                    return;
                }
                if let Err(err) = ensure_running(self.backend.as_ref()) {
                    tracing::warn!(%err, "skipping scheduling pass");
                    continue;
                }
                (state.tick(self.backend.current_time()), state.display_epoch())
            };

            for event in events {
                tracing::debug!(
                    time = event.scheduled_time,
                    beat = event.sequence_number,
                    accented = event.accented,
                    "beat scheduled"
                );
                synth::submit(
                    self.backend.as_ref(),
                    synth::synthesize(event.scheduled_time, event.accented),
                );
                self.schedule_display(event, epoch);
            }
        }
    }

    fn schedule_display(&self, event: BeatEvent, epoch: u64) {
        let delay = (event.scheduled_time - self.backend.current_time()).max(0.0);
        let display = self.display.clone();
        let state = self.state.clone();
        let highlight = self.highlight;

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
            show_beat(&display, &state, event, epoch, highlight);
        });
    }
}

fn show_beat(
    display: &Arc<dyn BeatDisplay>,
    state: &SharedState,
    event: BeatEvent,
    epoch: u64,
    highlight: Duration,
) {
    let Ok(state) = lock(state) else {
        return;
    };
    let clock = *state.clock();
    let current_epoch = state.display_epoch();
    drop(state);

    if !clock.running || clock.accent_interval == 0 {
        display.clear_accent();
        display.show(BeatDisplayUpdate::Neutral);
        return;
    }
    // Numbering changed since this beat was scheduled.
    if current_epoch != epoch {
        return;
    }

    let Some(number_in_measure) = event.beat_in_measure(clock.accent_interval) else {
        return;
    };
    display.show(BeatDisplayUpdate::Beat {
        number_in_measure,
        accented: event.accented,
    });

    if event.accented {
        let display = display.clone();
        tokio::spawn(async move {
            tokio::time::sleep(highlight).await;
            display.clear_accent();
        });
    }
}

/// Renders `seconds` of clicks without real time passing: the scheduler is
/// polled on its usual cadence against an [`OfflineBackend`] clock and the
/// result is mixed down to mono.
pub fn render_click_track(
    tempo_bpm: f64,
    accent_interval: u32,
    seconds: f64,
    sample_rate: u32,
    config: &MetronomeConfig,
) -> Result<Vec<f32>> {
    if !(seconds.is_finite() && seconds >= 0.0) {
        return Err(MusicToolsError::InvalidInput(
            "click track length must be a finite, non-negative number of seconds",
        ));
    }

    let backend = OfflineBackend::new(sample_rate);
    let mut state = SchedulerState::with_config(tempo_bpm, accent_interval, config)?;
    state.start(backend.current_time(), tempo_bpm, accent_interval)?;

    let step = config.poll_interval_ms.max(1) as f64 / 1000.0;
    while backend.current_time() < seconds {
        for event in state.tick(backend.current_time()) {
            if event.scheduled_time < seconds {
                synth::submit(&backend, synth::synthesize(event.scheduled_time, event.accented));
            }
        }
        backend.advance(step);
    }

    tracing::debug!(clicks = backend.scheduled().len(), seconds, "click track rendered");
    backend.render(0.0, seconds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ClickKind;

    #[derive(Default)]
    struct RecordingDisplay {
        updates: Mutex<Vec<BeatDisplayUpdate>>,
        clears: Mutex<usize>,
    }

    impl RecordingDisplay {
        fn updates(&self) -> Vec<BeatDisplayUpdate> {
            self.updates.lock().unwrap().clone()
        }

        fn clears(&self) -> usize {
            *self.clears.lock().unwrap()
        }
    }

    impl BeatDisplay for RecordingDisplay {
        fn show(&self, update: BeatDisplayUpdate) {
            self.updates.lock().unwrap().push(update);
        }

        fn clear_accent(&self) {
            *self.clears.lock().unwrap() += 1;
        }
    }

    fn metronome(
        backend: &Arc<OfflineBackend>,
        display: &Arc<RecordingDisplay>,
        tempo: f64,
        accent: u32,
    ) -> Metronome {
        Metronome::new(
            backend.clone(),
            display.clone(),
            MetronomeConfig::default(),
            tempo,
            accent,
        )
        .unwrap()
    }

    fn starts(backend: &OfflineBackend) -> Vec<f64> {
        backend.scheduled().iter().map(|event| event.start).collect()
    }

    async fn settle(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn schedules_beats_against_the_backend_clock() {
        let backend = Arc::new(OfflineBackend::starting_at(48_000, 10.0));
        let display = Arc::new(RecordingDisplay::default());
        let mut metronome = metronome(&backend, &display, 120.0, 0);

        metronome.start(120.0, 0).unwrap();
        settle(1).await;
        assert_eq!(starts(&backend), vec![10.0]);

        backend.advance(0.45);
        settle(25).await;
        assert_eq!(starts(&backend), vec![10.0, 10.5]);

        backend.advance(0.5);
        settle(25).await;
        assert_eq!(starts(&backend), vec![10.0, 10.5, 11.0]);
        assert!(backend
            .scheduled()
            .iter()
            .all(|event| event.kind == ClickKind::Tap));

        metronome.stop().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn accented_beats_clap_and_update_the_display() {
        let backend = Arc::new(OfflineBackend::new(48_000));
        let display = Arc::new(RecordingDisplay::default());
        let mut metronome = metronome(&backend, &display, 240.0, 2);

        metronome.start(240.0, 2).unwrap();
        settle(1).await;
        backend.advance(0.2);
        settle(25).await;

        let kinds: Vec<ClickKind> = backend.scheduled().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![ClickKind::Clap, ClickKind::Tap]);

        settle(60).await;
        assert_eq!(
            display.updates(),
            vec![
                BeatDisplayUpdate::Beat {
                    number_in_measure: 1,
                    accented: true
                },
                BeatDisplayUpdate::Beat {
                    number_in_measure: 2,
                    accented: false
                },
            ]
        );

        metronome.stop().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_accents_show_neutral() {
        let backend = Arc::new(OfflineBackend::new(48_000));
        let display = Arc::new(RecordingDisplay::default());
        let mut metronome = metronome(&backend, &display, 60.0, 0);

        metronome.start(60.0, 0).unwrap();
        settle(1).await;

        assert_eq!(display.updates(), vec![BeatDisplayUpdate::Neutral]);
        metronome.stop().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_halts_emission_and_is_idempotent() {
        let backend = Arc::new(OfflineBackend::new(48_000));
        let display = Arc::new(RecordingDisplay::default());
        let mut metronome = metronome(&backend, &display, 120.0, 4);

        metronome.start(120.0, 4).unwrap();
        settle(1).await;
        metronome.stop().unwrap();
        metronome.stop().unwrap();
        assert!(!metronome.is_running());

        backend.advance(5.0);
        settle(200).await;
        assert_eq!(backend.scheduled().len(), 1);
        assert!(!metronome.snapshot().unwrap().running);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_reanchors_and_resets_counter() {
        let backend = Arc::new(OfflineBackend::new(48_000));
        let display = Arc::new(RecordingDisplay::default());
        let mut metronome = metronome(&backend, &display, 120.0, 4);

        metronome.start(120.0, 4).unwrap();
        settle(1).await;
        backend.advance(1.0);
        settle(25).await;
        assert!(metronome.snapshot().unwrap().beat_counter > 1);

        metronome.stop().unwrap();
        backend.advance(7.25);
        metronome.start(120.0, 4).unwrap();

        let clock = metronome.snapshot().unwrap();
        assert_eq!(clock.beat_counter, 0);
        assert_eq!(clock.next_beat_time, 8.25);
        metronome.stop().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn accent_change_resets_counter_and_clears_highlight() {
        let backend = Arc::new(OfflineBackend::new(48_000));
        let display = Arc::new(RecordingDisplay::default());
        let mut metronome = metronome(&backend, &display, 120.0, 4);

        metronome.start(120.0, 4).unwrap();
        settle(1).await;
        backend.advance(1.0);
        settle(25).await;

        let clears = display.clears();
        metronome.set_accent_interval(3).unwrap();
        let clock = metronome.snapshot().unwrap();
        assert_eq!(clock.beat_counter, 0);
        assert_eq!(clock.accent_interval, 3);
        assert!(display.clears() > clears);
        assert_eq!(display.updates().last(), Some(&BeatDisplayUpdate::Neutral));

        metronome.stop().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_tempo_is_refused() {
        let backend = Arc::new(OfflineBackend::new(48_000));
        let display = Arc::new(RecordingDisplay::default());
        let mut metronome = metronome(&backend, &display, 120.0, 0);

        assert!(matches!(
            metronome.start(0.0, 0),
            Err(MusicToolsError::InvalidTempo(_))
        ));
        assert!(!metronome.is_running());
        assert!(metronome.set_tempo(-1.0).is_err());
        assert_eq!(metronome.snapshot().unwrap().tempo_bpm, 120.0);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_backend_skips_cycles_without_stopping() {
        let backend = Arc::new(OfflineBackend::new(48_000));
        backend.close();
        let display = Arc::new(RecordingDisplay::default());
        let mut metronome = metronome(&backend, &display, 120.0, 0);

        metronome.start(120.0, 0).unwrap();
        settle(100).await;

        assert!(backend.scheduled().is_empty());
        assert!(metronome.is_running());
        assert_eq!(metronome.snapshot().unwrap().beat_counter, 0);
        metronome.stop().unwrap();
    }

    #[test]
    fn start_outside_a_runtime_is_an_error() {
        let backend = Arc::new(OfflineBackend::new(48_000));
        let display = Arc::new(RecordingDisplay::default());
        let mut metronome = metronome(&backend, &display, 120.0, 0);

        assert!(metronome.start(120.0, 0).is_err());
        assert!(!metronome.snapshot().unwrap().running);
    }

    #[test]
    fn click_track_places_clicks_on_the_beat_grid() {
        let rate = 8_000;
        let samples =
            render_click_track(120.0, 4, 2.0, rate, &MetronomeConfig::default()).unwrap();
        assert_eq!(samples.len(), 16_000);

        for beat in 0..4 {
            let start = beat * 4_000;
            assert!(samples[start..start + 400].iter().any(|s| s.abs() > 0.01), "beat {beat}");
            assert!(samples[start + 3_000..start + 4_000].iter().all(|s| *s == 0.0));
        }
    }

    #[test]
    fn click_track_length_must_be_finite() {
        let config = MetronomeConfig::default();
        for seconds in [f64::INFINITY, f64::NAN, -1.0] {
            assert!(matches!(
                render_click_track(120.0, 4, seconds, 8_000, &config),
                Err(MusicToolsError::InvalidInput(_))
            ));
        }
    }
}
