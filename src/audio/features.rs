//! Acoustic feature extraction.
//!
//! Computes seven descriptors from a mono waveform: MFCC mean, mel
//! spectrogram mean, spectral centroid, spectral contrast, RMS energy,
//! zero-crossing rate and YIN pitch. Each feature is computed through
//! [`safe_feature`], which maps any per-feature failure to the caller's
//! default so one bad feature never takes down the other six. Only a
//! degenerate signal (empty, unusable) fails the whole extraction.

use rustfft::{FftPlanner, num_complex::Complex};
use std::f64::consts::PI;
use tracing::warn;

const N_FFT: usize = 2048;
const HOP: usize = 512;
const N_MELS: usize = 128;
const N_MFCC: usize = 13;
/// Human-voice fundamental frequency band for YIN.
const PITCH_FMIN: f64 = 50.0;
const PITCH_FMAX: f64 = 300.0;

/// Fixed-size feature vector for one audio sample. Every field is always a
/// finite number; failed extraction is substituted with the default.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    /// Source label (filename or file id), for logging and reports.
    pub filename: String,
    pub mfcc_mean: f64,
    pub mel_spectrogram_mean: f64,
    pub spectral_centroid: f64,
    pub spectral_contrast: f64,
    pub rms_energy: f64,
    pub zero_crossing_rate: f64,
    pub pitch_mean: f64,
}

impl FeatureVector {
    pub fn values(&self) -> [(&'static str, f64); 7] {
        [
            ("mfcc_mean", self.mfcc_mean),
            ("mel_spectrogram_mean", self.mel_spectrogram_mean),
            ("spectral_centroid", self.spectral_centroid),
            ("spectral_contrast", self.spectral_contrast),
            ("rms_energy", self.rms_energy),
            ("zero_crossing_rate", self.zero_crossing_rate),
            ("pitch_mean", self.pitch_mean),
        ]
    }

    /// One feature per line, for prompt context and logs.
    pub fn describe(&self) -> String {
        self.values()
            .iter()
            .map(|(name, value)| format!("{name}: {value:.4}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug)]
pub enum FeatureError {
    EmptySignal,
    InvalidSampleRate(u32),
    TooShort { samples: usize, needed: usize },
}

impl std::fmt::Display for FeatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptySignal => write!(f, "empty audio signal"),
            Self::InvalidSampleRate(sr) => write!(f, "invalid sample rate {sr}"),
            Self::TooShort { samples, needed } => {
                write!(f, "signal too short: {samples} samples, need {needed}")
            }
        }
    }
}

impl std::error::Error for FeatureError {}

/// Extract all seven features from a mono waveform.
///
/// Whole-file failure (empty or unusable signal) is an error; individual
/// feature failures are logged and replaced by `default`.
pub fn extract_features(
    label: &str,
    samples: &[f32],
    sample_rate: u32,
    default: f64,
) -> Result<FeatureVector, FeatureError> {
    if samples.is_empty() {
        return Err(FeatureError::EmptySignal);
    }
    if sample_rate == 0 {
        return Err(FeatureError::InvalidSampleRate(sample_rate));
    }

    let signal: Vec<f64> = samples.iter().map(|&s| s as f64).collect();
    let sr = sample_rate as f64;

    // Shared spectrogram for the spectral features; each feature still maps
    // its own failures independently.
    let spectrogram = power_spectrogram(&signal);

    Ok(FeatureVector {
        filename: label.to_string(),
        mfcc_mean: safe_feature(label, "mfcc_mean", default, || {
            mfcc_frames(&spectrogram, sr)
        }),
        mel_spectrogram_mean: safe_feature(label, "mel_spectrogram_mean", default, || {
            mel_frames(&spectrogram, sr)
        }),
        spectral_centroid: safe_feature(label, "spectral_centroid", default, || {
            centroid_frames(&spectrogram, sr)
        }),
        spectral_contrast: safe_feature(label, "spectral_contrast", default, || {
            contrast_frames(&spectrogram, sr)
        }),
        rms_energy: safe_feature(label, "rms_energy", default, || rms_frames(&signal)),
        zero_crossing_rate: safe_feature(label, "zero_crossing_rate", default, || {
            zcr_frames(&signal)
        }),
        pitch_mean: safe_feature(label, "pitch_mean", default, || yin_frames(&signal, sr)),
    })
}

/// Run one feature computation, averaging its frame-wise output with
/// non-finite values replaced by `default`. Any error becomes `default`.
fn safe_feature<F>(label: &str, name: &str, default: f64, compute: F) -> f64
where
    F: FnOnce() -> Result<Vec<f64>, FeatureError>,
{
    match compute() {
        Ok(frames) => finite_mean(&frames, default),
        Err(e) => {
            warn!("{label}: feature '{name}' failed: {e}");
            default
        }
    }
}

fn finite_mean(frames: &[f64], default: f64) -> f64 {
    if frames.is_empty() {
        return default;
    }
    let sum: f64 = frames
        .iter()
        .map(|&v| if v.is_finite() { v } else { default })
        .sum();
    let mean = sum / frames.len() as f64;
    if mean.is_finite() { mean } else { default }
}

fn frame_starts(len: usize, frame: usize, hop: usize) -> Vec<usize> {
    if len < frame {
        vec![0]
    } else {
        (0..=(len - frame)).step_by(hop).collect()
    }
}

/// Copy one frame, zero-padded to `frame` samples at the signal tail.
fn frame_at(signal: &[f64], start: usize, frame: usize) -> Vec<f64> {
    let end = (start + frame).min(signal.len());
    let mut out = signal[start..end].to_vec();
    out.resize(frame, 0.0);
    out
}

/// Power spectrogram: one `N_FFT / 2 + 1`-bin row per frame, Hann-windowed.
fn power_spectrogram(signal: &[f64]) -> Vec<Vec<f64>> {
    let window: Vec<f64> = (0..N_FFT)
        .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f64 / N_FFT as f64).cos())
        .collect();

    let mut planner = FftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(N_FFT);

    frame_starts(signal.len(), N_FFT, HOP)
        .into_iter()
        .map(|start| {
            let frame = frame_at(signal, start, N_FFT);
            let mut buf: Vec<Complex<f64>> = frame
                .iter()
                .zip(&window)
                .map(|(&s, &w)| Complex::new(s * w, 0.0))
                .collect();
            fft.process(&mut buf);
            buf[..N_FFT / 2 + 1].iter().map(|c| c.norm_sqr()).collect()
        })
        .collect()
}

fn bin_frequency(bin: usize, sr: f64) -> f64 {
    bin as f64 * sr / N_FFT as f64
}

fn hz_to_mel(hz: f64) -> f64 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

fn mel_to_hz(mel: f64) -> f64 {
    700.0 * (10f64.powf(mel / 2595.0) - 1.0)
}

/// Triangular mel filterbank over the spectrogram bins.
fn mel_filterbank(sr: f64) -> Vec<Vec<f64>> {
    let n_bins = N_FFT / 2 + 1;
    let mel_max = hz_to_mel(sr / 2.0);
    let points: Vec<f64> = (0..N_MELS + 2)
        .map(|i| mel_to_hz(mel_max * i as f64 / (N_MELS + 1) as f64))
        .collect();

    (0..N_MELS)
        .map(|m| {
            let (lo, center, hi) = (points[m], points[m + 1], points[m + 2]);
            (0..n_bins)
                .map(|bin| {
                    let f = bin_frequency(bin, sr);
                    if f <= lo || f >= hi {
                        0.0
                    } else if f <= center {
                        (f - lo) / (center - lo)
                    } else {
                        (hi - f) / (hi - center)
                    }
                })
                .collect()
        })
        .collect()
}

/// Frame-wise mean mel energy.
fn mel_frames(spectrogram: &[Vec<f64>], sr: f64) -> Result<Vec<f64>, FeatureError> {
    if spectrogram.is_empty() {
        return Err(FeatureError::EmptySignal);
    }
    let filterbank = mel_filterbank(sr);

    Ok(spectrogram
        .iter()
        .map(|power| {
            let total: f64 = filterbank
                .iter()
                .map(|filter| filter.iter().zip(power).map(|(w, p)| w * p).sum::<f64>())
                .sum();
            total / N_MELS as f64
        })
        .collect())
}

/// Frame-wise mean of the first `N_MFCC` cepstral coefficients (DCT-II of
/// the log mel spectrum).
fn mfcc_frames(spectrogram: &[Vec<f64>], sr: f64) -> Result<Vec<f64>, FeatureError> {
    if spectrogram.is_empty() {
        return Err(FeatureError::EmptySignal);
    }
    let filterbank = mel_filterbank(sr);

    Ok(spectrogram
        .iter()
        .map(|power| {
            let log_mel: Vec<f64> = filterbank
                .iter()
                .map(|filter| {
                    let energy: f64 = filter.iter().zip(power).map(|(w, p)| w * p).sum();
                    (energy + 1e-10).ln()
                })
                .collect();

            let coeffs: f64 = (0..N_MFCC)
                .map(|k| {
                    log_mel
                        .iter()
                        .enumerate()
                        .map(|(n, &v)| {
                            v * (PI * k as f64 * (n as f64 + 0.5) / N_MELS as f64).cos()
                        })
                        .sum::<f64>()
                })
                .sum();
            coeffs / N_MFCC as f64
        })
        .collect())
}

/// Frame-wise magnitude-weighted mean frequency. Silent frames yield NaN,
/// which the aggregation replaces with the default.
fn centroid_frames(spectrogram: &[Vec<f64>], sr: f64) -> Result<Vec<f64>, FeatureError> {
    if spectrogram.is_empty() {
        return Err(FeatureError::EmptySignal);
    }

    Ok(spectrogram
        .iter()
        .map(|power| {
            let magnitude: Vec<f64> = power.iter().map(|p| p.sqrt()).collect();
            let total: f64 = magnitude.iter().sum();
            let weighted: f64 = magnitude
                .iter()
                .enumerate()
                .map(|(bin, &m)| bin_frequency(bin, sr) * m)
                .sum();
            weighted / total
        })
        .collect())
}

/// Frame-wise spectral contrast: log peak-to-valley ratio averaged over
/// octave-spaced bands.
fn contrast_frames(spectrogram: &[Vec<f64>], sr: f64) -> Result<Vec<f64>, FeatureError> {
    if spectrogram.is_empty() {
        return Err(FeatureError::EmptySignal);
    }

    let nyquist = sr / 2.0;
    let mut edges = vec![0.0, 200.0];
    while *edges.last().unwrap() * 2.0 < nyquist {
        let next = edges.last().unwrap() * 2.0;
        edges.push(next);
    }
    edges.push(nyquist);

    let bands: Vec<(usize, usize)> = edges
        .windows(2)
        .map(|pair| {
            let lo = (pair[0] * N_FFT as f64 / sr).floor() as usize;
            let hi = ((pair[1] * N_FFT as f64 / sr).ceil() as usize).min(N_FFT / 2 + 1);
            (lo, hi)
        })
        .filter(|(lo, hi)| hi > lo)
        .collect();

    Ok(spectrogram
        .iter()
        .map(|power| {
            let per_band: Vec<f64> = bands
                .iter()
                .map(|&(lo, hi)| {
                    let mut mags: Vec<f64> =
                        power[lo..hi].iter().map(|p| p.sqrt()).collect();
                    mags.sort_by(|a, b| a.total_cmp(b));
                    // top/bottom 2% of bins, at least one each
                    let k = ((mags.len() as f64 * 0.02).ceil() as usize).max(1);
                    let valley: f64 = mags[..k].iter().sum::<f64>() / k as f64;
                    let peak: f64 =
                        mags[mags.len() - k..].iter().sum::<f64>() / k as f64;
                    (peak + 1e-10).ln() - (valley + 1e-10).ln()
                })
                .collect();
            per_band.iter().sum::<f64>() / per_band.len() as f64
        })
        .collect())
}

fn rms_frames(signal: &[f64]) -> Result<Vec<f64>, FeatureError> {
    if signal.is_empty() {
        return Err(FeatureError::EmptySignal);
    }

    Ok(frame_starts(signal.len(), N_FFT, HOP)
        .into_iter()
        .map(|start| {
            let frame = frame_at(signal, start, N_FFT);
            (frame.iter().map(|s| s * s).sum::<f64>() / frame.len() as f64).sqrt()
        })
        .collect())
}

fn zcr_frames(signal: &[f64]) -> Result<Vec<f64>, FeatureError> {
    if signal.is_empty() {
        return Err(FeatureError::EmptySignal);
    }

    Ok(frame_starts(signal.len(), N_FFT, HOP)
        .into_iter()
        .map(|start| {
            let frame = frame_at(signal, start, N_FFT);
            let crossings = frame
                .windows(2)
                .filter(|pair| (pair[0] >= 0.0) != (pair[1] >= 0.0))
                .count();
            crossings as f64 / frame.len() as f64
        })
        .collect())
}

/// Frame-wise YIN fundamental frequency, bounded to the 50–300 Hz voice
/// band. The lag search range itself enforces the band, so returned values
/// never need clamping.
fn yin_frames(signal: &[f64], sr: f64) -> Result<Vec<f64>, FeatureError> {
    // Round inward so the reachable frequencies stay inside [FMIN, FMAX].
    let tau_min = (sr / PITCH_FMAX).ceil() as usize;
    let tau_max = (sr / PITCH_FMIN).floor() as usize;
    let needed = tau_max * 2;
    if signal.len() < needed {
        return Err(FeatureError::TooShort { samples: signal.len(), needed });
    }

    let frame_len = N_FFT.max(needed);
    let threshold = 0.1;

    Ok(frame_starts(signal.len(), frame_len, HOP)
        .into_iter()
        .map(|start| {
            let frame = frame_at(signal, start, frame_len);
            let window = frame_len - tau_max;

            // Cumulative-mean-normalized difference function.
            let mut cmnd = vec![1.0; tau_max + 1];
            let mut running_sum = 0.0;
            for tau in 1..=tau_max {
                let diff: f64 = (0..window)
                    .map(|j| {
                        let d = frame[j] - frame[j + tau];
                        d * d
                    })
                    .sum();
                running_sum += diff;
                cmnd[tau] = if running_sum > 0.0 {
                    diff * tau as f64 / running_sum
                } else {
                    1.0
                };
            }

            // First dip under the threshold, else the global minimum.
            let tau = (tau_min..=tau_max)
                .find(|&t| cmnd[t] < threshold)
                .unwrap_or_else(|| {
                    (tau_min..=tau_max)
                        .min_by(|&a, &b| cmnd[a].total_cmp(&cmnd[b]))
                        .unwrap_or(tau_min)
                });
            sr / tau as f64
        })
        .collect())
}
