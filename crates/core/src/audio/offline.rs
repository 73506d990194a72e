//! Backend for tests and offline rendering.
//!
//! Time stands still until [`OfflineBackend::advance`] is called, which makes
//! scheduling deterministic, and every accepted event can be mixed into a
//! buffer afterwards.

use std::sync::{Mutex, MutexGuard};

use super::{AudioBackend, BackendState};
use crate::{MusicToolsError, Result, SoundEvent};

#[derive(Debug)]
struct OfflineInner {
    time: f64,
    state: BackendState,
    scheduled: Vec<SoundEvent>,
}

/// Backend whose clock only moves when told to.
///
/// Everything handed to [`AudioBackend::schedule`] is kept so it can be
/// inspected or mixed down with [`OfflineBackend::render`].
#[derive(Debug)]
pub struct OfflineBackend {
    sample_rate: u32,
    inner: Mutex<OfflineInner>,
}

impl OfflineBackend {
    /// Creates a running backend with its clock at zero.
    pub fn new(sample_rate: u32) -> Self {
        Self::starting_at(sample_rate, 0.0)
    }

    /// Creates a running backend with its clock at `time`.
    pub fn starting_at(sample_rate: u32, time: f64) -> Self {
        Self {
            sample_rate,
            inner: Mutex::new(OfflineInner {
                time,
                state: BackendState::Running,
                scheduled: Vec::new(),
            }),
        }
    }

    /// Moves the clock forward. Negative deltas are ignored.
    pub fn advance(&self, delta: f64) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.time += delta.max(0.0);
        }
    }

    /// Pauses a running backend; scheduling fails until it is resumed.
    pub fn suspend(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            if inner.state == BackendState::Running {
                inner.state = BackendState::Suspended;
            }
        }
    }

    /// Shuts the backend down for good.
    pub fn close(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.state = BackendState::Closed;
        }
    }

    /// Events accepted so far, in the order they were scheduled.
    pub fn scheduled(&self) -> Vec<SoundEvent> {
        self.inner
            .lock()
            .map(|inner| inner.scheduled.clone())
            .unwrap_or_default()
    }

    /// Mixes every scheduled event overlapping `[start, start + duration)`
    /// into a mono buffer.
    pub fn render(&self, start: f64, duration: f64) -> Result<Vec<f32>> {
        if duration < 0.0 {
            return Err(MusicToolsError::InvalidInput("render duration must not be negative"));
        }

        let rate = self.sample_rate as f64;
        let len = (duration * rate).round() as usize;
        let mut out = vec![0.0_f32; len];
        let events = self.lock()?.scheduled.clone();

        for event in events {
            if event.end() <= start || event.start >= start + duration {
                continue;
            }

            let offset = ((event.start - start) * rate).round() as i64;
            for (i, sample) in event.render(self.sample_rate).into_iter().enumerate() {
                let index = offset + i as i64;
                if index < 0 {
                    continue;
                }
                match out.get_mut(index as usize) {
                    Some(slot) => *slot += sample,
                    None => break,
                }
            }
        }

        Ok(out)
    }

    fn lock(&self) -> Result<MutexGuard<'_, OfflineInner>> {
        self.inner
            .lock()
            .map_err(|_| MusicToolsError::msg("offline backend has been poisoned"))
    }
}

impl AudioBackend for OfflineBackend {
    fn current_time(&self) -> f64 {
        self.inner.lock().map(|inner| inner.time).unwrap_or(0.0)
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn state(&self) -> BackendState {
        self.inner
            .lock()
            .map(|inner| inner.state)
            .unwrap_or(BackendState::Closed)
    }

    fn resume(&self) -> Result<()> {
        let mut inner = self.lock()?;
        match inner.state {
            BackendState::Closed => Err(MusicToolsError::BackendUnavailable(
                "offline backend is closed".to_string(),
            )),
            _ => {
                inner.state = BackendState::Running;
                Ok(())
            }
        }
    }

    fn schedule(&self, mut event: SoundEvent) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.state != BackendState::Running {
            return Err(MusicToolsError::BackendUnavailable(format!(
                "cannot schedule while {:?}",
                inner.state
            )));
        }
        if event.start < inner.time {
            let shift = inner.time - event.start;
            event.start = inner.time;
            for voice in &mut event.voices {
                voice.start += shift;
                voice.stop += shift;
            }
        }
        inner.scheduled.push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthesize;

    #[test]
    fn clock_only_moves_forward() {
        let backend = OfflineBackend::starting_at(48_000, 3.0);
        backend.advance(0.5);
        backend.advance(-10.0);
        assert!((backend.current_time() - 3.5).abs() < 1e-12);
    }

    #[test]
    fn suspended_backend_rejects_events_until_resumed() {
        let backend = OfflineBackend::new(48_000);
        backend.suspend();
        assert!(backend.schedule(synthesize(0.0, false)).is_err());

        backend.resume().unwrap();
        backend.schedule(synthesize(0.0, false)).unwrap();
        assert_eq!(backend.scheduled().len(), 1);
    }

    #[test]
    fn late_events_start_immediately() {
        let backend = OfflineBackend::starting_at(48_000, 2.0);
        backend.schedule(synthesize(1.5, false)).unwrap();

        let event = &backend.scheduled()[0];
        assert_eq!(event.start, 2.0);
        assert!((event.voices[0].stop - 2.09).abs() < 1e-9);
    }

    #[test]
    fn render_places_clicks_at_their_start_time() {
        let backend = OfflineBackend::new(1_000);
        backend.schedule(synthesize(0.5, false)).unwrap();

        let samples = backend.render(0.0, 1.0).unwrap();
        assert_eq!(samples.len(), 1_000);
        assert!(samples[..500].iter().all(|s| *s == 0.0));
        assert!(samples[500..590].iter().any(|s| s.abs() > 0.01));
        assert!(samples[600..].iter().all(|s| *s == 0.0));
    }
}
