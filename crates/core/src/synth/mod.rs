//! Click synthesis for the metronome.
//!
//! [`synthesize`] describes the sound of a single beat as a small graph of
//! one-shot voices (oscillator or noise buffer, optional band-pass, gain
//! envelope). The description is handed to an [`AudioBackend`] which starts
//! it at the event's backend-clock time. Voices are created fresh for every
//! beat and never reused.

use std::f32::consts::TAU;

use biquad::{Biquad, Coefficients, DirectForm2Transposed, ToHertz, Type};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::audio::{ensure_running, AudioBackend};

pub const TAP_FREQUENCY: f32 = 800.0;
const TAP_PEAK_GAIN: f32 = 0.2;
const TAP_ATTACK: f64 = 0.005;
const TAP_DECAY: f64 = 0.08;
const TAP_DURATION: f64 = 0.09;

const CLAP_NOISE_DURATION: f64 = 0.15;
const CLAP_NOISE_GAIN: f32 = 0.4;
const CLAP_BAND_CENTER: f32 = 1000.0;
const CLAP_BAND_Q: f32 = 2.0;
const THUMP_FREQUENCY: f32 = 150.0;
const THUMP_GAIN: f32 = 0.3;
const THUMP_DURATION: f64 = 0.08;

/// Gain floor used in place of silence; exponential ramps cannot reach zero.
const SILENCE: f32 = 0.0001;

/// Which of the two click sounds an event carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClickKind {
    /// Plain beat: short triangle tone.
    Tap,
    /// Accented beat: filtered noise burst over a low sine thump.
    Clap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OscillatorShape {
    Sine,
    Triangle,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Source {
    Oscillator { shape: OscillatorShape, frequency: f32 },
    /// White noise buffer of `duration` seconds generated from `seed`.
    Noise { seed: u64, duration: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BandPass {
    pub frequency: f32,
    pub q: f32,
}

/// A single automation step of a gain envelope, in backend-clock seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Automation {
    SetValue { value: f32, time: f64 },
    ExponentialRamp { value: f32, time: f64 },
}

impl Automation {
    fn value(&self) -> f32 {
        match *self {
            Automation::SetValue { value, .. } | Automation::ExponentialRamp { value, .. } => value,
        }
    }

    fn time(&self) -> f64 {
        match *self {
            Automation::SetValue { time, .. } | Automation::ExponentialRamp { time, .. } => time,
        }
    }
}

/// Gain automation curve. Steps must be appended in time order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    steps: Vec<Automation>,
}

impl Envelope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_value_at(mut self, value: f32, time: f64) -> Self {
        self.steps.push(Automation::SetValue { value, time });
        self
    }

    pub fn exponential_ramp_to(mut self, value: f32, time: f64) -> Self {
        self.steps.push(Automation::ExponentialRamp { value, time });
        self
    }

    pub fn steps(&self) -> &[Automation] {
        &self.steps
    }

    /// Evaluates the curve at `time`. An exponential ramp interpolates
    /// geometrically from the previous step's value; after the last step the
    /// final value is held.
    pub fn value_at(&self, time: f64) -> f32 {
        let mut previous: Option<(f32, f64)> = None;

        for step in &self.steps {
            if time < step.time() {
                return match (step, previous) {
                    (Automation::ExponentialRamp { value, time: end }, Some((start_value, start)))
                        if start_value > 0.0 && *value > 0.0 && *end > start =>
                    {
                        let progress = ((time - start) / (end - start)) as f32;
                        start_value * (value / start_value).powf(progress)
                    }
                    (_, Some((start_value, _))) => start_value,
                    (_, None) => 1.0,
                };
            }
            previous = Some((step.value(), step.time()));
        }

        previous.map(|(value, _)| value).unwrap_or(1.0)
    }
}

/// One-shot sound producer with its own gain envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Voice {
    pub source: Source,
    pub filter: Option<BandPass>,
    pub envelope: Envelope,
    pub start: f64,
    pub stop: f64,
}

impl Voice {
    /// Renders the voice from `start` to `stop` at the given sample rate.
    pub fn render(&self, sample_rate: u32) -> Vec<f32> {
        let rate = sample_rate as f64;
        let len = ((self.stop - self.start).max(0.0) * rate).round() as usize;
        let mut out = vec![0.0; len];

        match self.source {
            Source::Oscillator { shape, frequency } => {
                for (i, sample) in out.iter_mut().enumerate() {
                    let phase = ((i as f64 / rate) * frequency as f64).fract() as f32;
                    *sample = match shape {
                        OscillatorShape::Sine => (phase * TAU).sin(),
                        OscillatorShape::Triangle => 1.0 - 4.0 * (phase - 0.5).abs(),
                    };
                }
            }
            Source::Noise { seed, duration } => {
                let mut rng = StdRng::seed_from_u64(seed);
                let noise_len = ((duration * rate) as usize).min(len);
                for sample in out.iter_mut().take(noise_len) {
                    *sample = rng.gen_range(-1.0..1.0);
                }
            }
        }

        if let Some(band) = self.filter {
            match Coefficients::<f32>::from_params(
                Type::BandPass,
                (sample_rate as f32).hz(),
                band.frequency.hz(),
                band.q,
            ) {
                Ok(coeffs) => {
                    let mut filter = DirectForm2Transposed::<f32>::new(coeffs);
                    for sample in out.iter_mut() {
                        *sample = filter.run(*sample);
                    }
                }
                Err(err) => {
                    tracing::warn!(?err, sample_rate, "band-pass unavailable, rendering unfiltered");
                }
            }
        }

        for (i, sample) in out.iter_mut().enumerate() {
            *sample *= self.envelope.value_at(self.start + i as f64 / rate);
        }

        out
    }
}

/// Synthesised sound for one beat, anchored at `start` on the backend clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoundEvent {
    pub start: f64,
    pub kind: ClickKind,
    pub voices: Vec<Voice>,
}

impl SoundEvent {
    /// Backend-clock time at which the last voice stops.
    pub fn end(&self) -> f64 {
        self.voices
            .iter()
            .map(|voice| voice.stop)
            .fold(self.start, f64::max)
    }

    /// Mixes every voice into a single buffer starting at `start`.
    pub fn render(&self, sample_rate: u32) -> Vec<f32> {
        let rate = sample_rate as f64;
        let len = ((self.end() - self.start) * rate).round() as usize;
        let mut out = vec![0.0; len];

        for voice in &self.voices {
            let offset = ((voice.start - self.start).max(0.0) * rate).round() as usize;
            for (i, sample) in voice.render(sample_rate).into_iter().enumerate() {
                if let Some(slot) = out.get_mut(offset + i) {
                    *slot += sample;
                }
            }
        }

        out
    }
}

/// Describes the click for a beat at `time`. Accented beats clap, all other
/// beats tap.
pub fn synthesize(time: f64, accented: bool) -> SoundEvent {
    if accented {
        clap(time)
    } else {
        tap(time)
    }
}

fn tap(time: f64) -> SoundEvent {
    let envelope = Envelope::new()
        .set_value_at(SILENCE, time)
        .exponential_ramp_to(TAP_PEAK_GAIN, time + TAP_ATTACK)
        .exponential_ramp_to(SILENCE, time + TAP_DECAY);

    SoundEvent {
        start: time,
        kind: ClickKind::Tap,
        voices: vec![Voice {
            source: Source::Oscillator {
                shape: OscillatorShape::Triangle,
                frequency: TAP_FREQUENCY,
            },
            filter: None,
            envelope,
            start: time,
            stop: time + TAP_DURATION,
        }],
    }
}

fn clap(time: f64) -> SoundEvent {
    let noise = Voice {
        source: Source::Noise {
            seed: time.to_bits(),
            duration: CLAP_NOISE_DURATION,
        },
        filter: Some(BandPass {
            frequency: CLAP_BAND_CENTER,
            q: CLAP_BAND_Q,
        }),
        envelope: Envelope::new()
            .set_value_at(CLAP_NOISE_GAIN, time)
            .exponential_ramp_to(0.01, time + 0.05)
            .exponential_ramp_to(SILENCE, time + CLAP_NOISE_DURATION),
        start: time,
        stop: time + CLAP_NOISE_DURATION,
    };

    let thump = Voice {
        source: Source::Oscillator {
            shape: OscillatorShape::Sine,
            frequency: THUMP_FREQUENCY,
        },
        filter: None,
        envelope: Envelope::new()
            .set_value_at(THUMP_GAIN, time)
            .exponential_ramp_to(SILENCE, time + THUMP_DURATION),
        start: time,
        stop: time + THUMP_DURATION,
    };

    SoundEvent {
        start: time,
        kind: ClickKind::Clap,
        voices: vec![noise, thump],
    }
}

/// Hands a click to the backend. Failures are logged and the click is
/// dropped; returns whether the backend accepted it.
pub fn submit(backend: &dyn AudioBackend, event: SoundEvent) -> bool {
    if let Err(err) = ensure_running(backend) {
        tracing::warn!(%err, time = event.start, "dropping click, backend not ready");
        return false;
    }

    let time = event.start;
    match backend.schedule(event) {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!(%err, time, "dropping click, backend rejected it");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::OfflineBackend;
    use realfft::RealFftPlanner;

    const RATE: u32 = 48_000;

    fn dominant_frequency(samples: &[f32], sample_rate: u32) -> f32 {
        let mut planner = RealFftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(samples.len());
        let mut input = samples.to_vec();
        let mut spectrum = fft.make_output_vec();
        fft.process(&mut input, &mut spectrum).unwrap();

        let (bin, _) = spectrum
            .iter()
            .enumerate()
            .skip(1)
            .fold((0, 0.0_f32), |best, (i, c)| {
                if c.norm() > best.1 {
                    (i, c.norm())
                } else {
                    best
                }
            });
        bin as f32 * sample_rate as f32 / samples.len() as f32
    }

    #[test]
    fn tap_envelope_peaks_at_five_ms_and_fades_by_eighty() {
        let event = synthesize(2.0, false);
        assert_eq!(event.kind, ClickKind::Tap);
        assert_eq!(event.voices.len(), 1);

        let envelope = &event.voices[0].envelope;
        assert!(envelope.value_at(2.0) < 0.001);
        assert!((envelope.value_at(2.005) - 0.2).abs() < 1e-6);
        assert!(envelope.value_at(2.0025) > envelope.value_at(2.001));
        assert!(envelope.value_at(2.08) <= 0.00011);
        assert!((event.end() - 2.09).abs() < 1e-9);
    }

    #[test]
    fn clap_voices_start_together() {
        let event = synthesize(4.5, true);
        assert_eq!(event.kind, ClickKind::Clap);
        assert_eq!(event.voices.len(), 2);
        assert!(event.voices.iter().all(|voice| voice.start == 4.5));
        assert!((event.end() - 4.65).abs() < 1e-9);

        let noise = &event.voices[0];
        assert!(matches!(noise.source, Source::Noise { .. }));
        assert!(noise.filter.is_some());
        assert!((noise.stop - 4.65).abs() < 1e-9);

        let thump = &event.voices[1];
        assert!((thump.stop - 4.58).abs() < 1e-9);
    }

    #[test]
    fn synthesis_is_deterministic() {
        assert_eq!(synthesize(1.25, true), synthesize(1.25, true));
        assert_eq!(
            synthesize(1.25, true).render(RATE),
            synthesize(1.25, true).render(RATE)
        );
    }

    #[test]
    fn tap_renders_at_tap_pitch() {
        let samples = synthesize(0.0, false).render(RATE);
        assert_eq!(samples.len(), (0.09 * RATE as f64).round() as usize);
        assert!(samples.iter().all(|s| s.abs() <= 0.2 + 1e-4));

        let frequency = dominant_frequency(&samples, RATE);
        assert!((frequency - TAP_FREQUENCY).abs() < 25.0, "{frequency}");
    }

    #[test]
    fn clap_noise_is_band_limited() {
        let event = synthesize(0.0, true);
        let noise = event.voices[0].render(RATE);
        let frequency = dominant_frequency(&noise, RATE);
        assert!((300.0..3000.0).contains(&frequency), "{frequency}");
    }

    #[test]
    fn envelope_holds_last_value() {
        let envelope = Envelope::new()
            .set_value_at(0.5, 1.0)
            .exponential_ramp_to(0.25, 2.0);
        assert_eq!(envelope.value_at(5.0), 0.25);
        assert!((envelope.value_at(1.5) - 0.5 * 0.5_f32.powf(0.5)).abs() < 1e-6);
    }

    #[test]
    fn submit_resumes_suspended_backend() {
        let backend = OfflineBackend::new(RATE);
        backend.suspend();

        assert!(submit(&backend, synthesize(0.0, false)));
        assert_eq!(backend.scheduled().len(), 1);
    }

    #[test]
    fn submit_drops_click_on_closed_backend() {
        let backend = OfflineBackend::new(RATE);
        backend.close();

        assert!(!submit(&backend, synthesize(0.0, true)));
        assert!(backend.scheduled().is_empty());
    }
}
