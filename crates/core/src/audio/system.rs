//! Silent backend on the monotonic system clock.
//!
//! Nothing is played: accepted clicks are kept until their sound would have
//! ended, which is enough for a host that only needs beat timing, and for
//! machines without an output device.

use std::{
    sync::{Mutex, MutexGuard},
    time::Instant,
};

use super::{AudioBackend, BackendState};
use crate::{ClickKind, MusicToolsError, Result, SoundEvent};

#[derive(Debug)]
struct SystemInner {
    state: BackendState,
    /// Start, end and kind of clicks that have not finished sounding.
    scheduled: Vec<(f64, f64, ClickKind)>,
}

/// Backend clocked by the monotonic system clock.
///
/// Starts suspended, the way a freshly created output context does before
/// the first user gesture.
#[derive(Debug)]
pub struct SystemBackend {
    epoch: Instant,
    sample_rate: u32,
    inner: Mutex<SystemInner>,
}

impl SystemBackend {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            epoch: Instant::now(),
            sample_rate,
            inner: Mutex::new(SystemInner {
                state: BackendState::Suspended,
                scheduled: Vec::new(),
            }),
        }
    }

    /// Permanently shuts the backend down.
    pub fn close(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.state = BackendState::Closed;
        }
    }

    /// Start time and kind of the clicks still pending or sounding.
    pub fn scheduled(&self) -> Vec<(f64, ClickKind)> {
        let now = self.current_time();
        self.inner
            .lock()
            .map(|inner| {
                inner
                    .scheduled
                    .iter()
                    .filter(|(_, end, _)| *end > now)
                    .map(|(start, _, kind)| (*start, *kind))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, SystemInner>> {
        self.inner
            .lock()
            .map_err(|_| MusicToolsError::msg("system backend has been poisoned"))
    }
}

impl Default for SystemBackend {
    fn default() -> Self {
        Self::new(48_000)
    }
}

impl AudioBackend for SystemBackend {
    fn current_time(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
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
        if inner.state == BackendState::Closed {
            return Err(MusicToolsError::BackendUnavailable(
                "system backend is closed".to_string(),
            ));
        }
        if inner.state == BackendState::Suspended {
            tracing::debug!("resuming system backend");
            inner.state = BackendState::Running;
        }
        Ok(())
    }

    fn schedule(&self, event: SoundEvent) -> Result<()> {
        let now = self.current_time();
        let mut inner = self.lock()?;
        if inner.state != BackendState::Running {
            return Err(MusicToolsError::BackendUnavailable(format!(
                "cannot schedule while {:?}",
                inner.state
            )));
        }

        inner.scheduled.retain(|(_, end, _)| *end > now);

        let start = event.start.max(now);
        let end = start + (event.end() - event.start);
        tracing::debug!(start, kind = ?event.kind, lead = event.start - now, "click scheduled");
        inner.scheduled.push((start, end, event.kind));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{audio::ensure_running, synthesize};

    #[test]
    fn starts_suspended_and_resumes_on_demand() {
        let backend = SystemBackend::default();
        assert_eq!(backend.state(), BackendState::Suspended);

        ensure_running(&backend).unwrap();
        assert_eq!(backend.state(), BackendState::Running);
    }

    #[test]
    fn clock_is_monotonic() {
        let backend = SystemBackend::default();
        let first = backend.current_time();
        let second = backend.current_time();
        assert!(second >= first);
    }

    #[test]
    fn records_accepted_clicks() {
        let backend = SystemBackend::default();
        backend.resume().unwrap();
        let at = backend.current_time() + 1.0;
        backend.schedule(synthesize(at, true)).unwrap();

        let scheduled = backend.scheduled();
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0], (at, ClickKind::Clap));
    }

    #[test]
    fn finished_clicks_are_forgotten() {
        let backend = SystemBackend::default();
        backend.resume().unwrap();
        for _ in 0..3 {
            backend.schedule(synthesize(0.0, false)).unwrap();
        }
        assert_eq!(backend.scheduled().len(), 3);

        std::thread::sleep(std::time::Duration::from_millis(150));
        let later = backend.current_time() + 1.0;
        backend.schedule(synthesize(later, false)).unwrap();

        assert_eq!(backend.scheduled(), vec![(later, ClickKind::Tap)]);
        assert_eq!(backend.inner.lock().unwrap().scheduled.len(), 1);
    }

    #[test]
    fn closed_backend_cannot_resume() {
        let backend = SystemBackend::default();
        backend.close();
        assert!(backend.resume().is_err());
    }
}
