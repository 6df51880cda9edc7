//! Loudness metering for UI feedback.

/// Root-mean-square amplitude of a block of samples, clamped to `[0, 1]`.
///
/// An empty block reads as silence. Non-finite samples are skipped so a
/// single glitch from the device cannot poison the meter.
pub fn rms(samples: &[f32]) -> f32 {
    let (sum, count) = samples
        .iter()
        .filter(|s| s.is_finite())
        .fold((0.0f64, 0usize), |(sum, count), &s| {
            (sum + (s as f64) * (s as f64), count + 1)
        });
    if count == 0 {
        return 0.0;
    }
    ((sum / count as f64).sqrt() as f32).min(1.0)
}
