//! Tempo-matched playback speed.
//!
//! Speed is a plain playback-rate scalar: the ratio between the tempo a
//! recording was made at and the tempo the listener wants, clamped to what
//! the player supports. Pitch is not preserved.

use crate::config::PlaybackConfig;

/// Rate that makes a recording at `recorded_bpm` play at `target_bpm`.
/// Returns `None` unless both tempos are positive.
pub fn playback_rate(recorded_bpm: f64, target_bpm: f64, config: &PlaybackConfig) -> Option<f64> {
    if !(recorded_bpm > 0.0 && target_bpm > 0.0) || !(recorded_bpm.is_finite() && target_bpm.is_finite()) {
        return None;
    }

    // Lower bound applied last so an inverted range cannot panic.
    let rate = (target_bpm / recorded_bpm).min(config.max_rate).max(config.min_rate);
    tracing::debug!(recorded_bpm, target_bpm, rate, "tempo-matched playback rate");
    Some(rate)
}

/// Converts a 0-100 volume percentage into a linear gain.
pub fn volume_gain(percent: u8) -> f32 {
    f32::from(percent.min(100)) / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratio_of_target_to_recorded_tempo() {
        let rate = playback_rate(90.0, 120.0, &PlaybackConfig::default()).unwrap();
        assert!((rate - 4.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn clamps_into_supported_range() {
        let config = PlaybackConfig::default();
        assert_eq!(playback_rate(60.0, 240.0, &config), Some(2.0));
        assert_eq!(playback_rate(200.0, 10.0, &config), Some(0.1));
    }

    #[test]
    fn needs_both_tempos() {
        let config = PlaybackConfig::default();
        assert_eq!(playback_rate(0.0, 120.0, &config), None);
        assert_eq!(playback_rate(120.0, -1.0, &config), None);
        assert_eq!(playback_rate(f64::NAN, 120.0, &config), None);
    }

    #[test]
    fn volume_is_capped() {
        assert_eq!(volume_gain(50), 0.5);
        assert_eq!(volume_gain(250), 1.0);
    }

    #[test]
    fn inverted_limits_do_not_panic() {
        let config = PlaybackConfig {
            min_rate: 2.0,
            max_rate: 0.5,
        };
        assert_eq!(playback_rate(90.0, 120.0, &config), Some(2.0));
    }
}
