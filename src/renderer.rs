use std::f64::consts::PI;

use nalgebra::Complex;
use rustfft::FftPlanner;

use crate::error::{ResonatorError, Result};

/// Lower bound on the modal damping ratio so undamped modes still decay
pub const MIN_DAMPING_RATIO: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderMethod {
    /// Run every mode through its biquad, sample by sample
    #[default]
    Recursive,
    /// Evaluate the closed-form damped sinusoid directly
    Analytic,
    /// Sum the spectra of the truncated mode responses and inverse FFT once
    Fft,
}

/// Physical description of a single rendered mode
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResonatorMode {
    /// Undamped natural frequency in Hz
    pub natural_frequency: f64,
    /// Damped frequency in Hz
    pub frequency: f64,
    pub damping_ratio: f64,
    /// Exponential decay rate σ = ζω in 1/s
    pub decay_rate: f64,
    /// Time for the envelope to fall by 60 dB, in seconds
    pub t60: f64,
    pub gain: f64,
}

impl ResonatorMode {
    /// Discrete pole of this mode at the given sample rate
    pub fn pole(&self, sample_rate: f64) -> Complex<f64> {
        let radius = (-self.decay_rate / sample_rate).exp();
        let angle = 2.0 * PI * self.frequency / sample_rate;
        Complex::from_polar(radius, angle)
    }
}

/// Rayleigh damping ratio `(α + βλ) / 2ω`, floored at [`MIN_DAMPING_RATIO`]
pub fn damping_ratio(eigenvalue: f64, alpha: f64, beta: f64) -> f64 {
    let omega = eigenvalue.sqrt();
    ((alpha + beta * eigenvalue) / (2.0 * omega)).max(MIN_DAMPING_RATIO)
}

/// Number of whole samples in `seconds` of audio, truncating any partial sample
pub fn length_in_samples(seconds: f64, sample_rate: f64) -> usize {
    (seconds * sample_rate) as usize
}

/// Damped frequency in Hz, zero for critically damped or overdamped modes
pub fn damped_frequency(eigenvalue: f64, damping_ratio: f64) -> f64 {
    if damping_ratio >= 1.0 {
        return 0.0;
    }
    eigenvalue.sqrt() * (1.0 - damping_ratio * damping_ratio).sqrt() / (2.0 * PI)
}

/// A two-pole resonator in transposed direct form II
#[derive(Debug, Clone)]
pub struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,

    z1: f64,
    z2: f64,
}

impl Biquad {
    /// `H(z) = g Im(p) z⁻¹ / (1 - 2 Re(p) z⁻¹ + |p|² z⁻²)`
    pub fn from_pole(pole: Complex<f64>, gain: f64) -> Biquad {
        Biquad {
            b0: 0.0,
            b1: gain * pole.im,
            b2: 0.0,
            a1: -2.0 * pole.re,
            a2: pole.norm_sqr(),
            z1: 0.0,
            z2: 0.0,
        }
    }

    pub fn process(&mut self, input: f64) -> f64 {
        let output = self.b0 * input + self.z1;
        self.z1 = self.b1 * input - self.a1 * output + self.z2;
        self.z2 = self.b2 * input - self.a2 * output;
        output
    }

    pub fn reset(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
    }

    /// Complex frequency response at `frequency` Hz
    pub fn response(&self, frequency: f64, sample_rate: f64) -> Complex<f64> {
        let z_inv = Complex::from_polar(1.0, -2.0 * PI * frequency / sample_rate);
        let z_inv2 = z_inv * z_inv;
        let numerator = z_inv * self.b1 + z_inv2 * self.b2 + self.b0;
        let denominator = z_inv * self.a1 + z_inv2 * self.a2 + 1.0;
        numerator / denominator
    }
}

/// Derives the renderable modes, skipping those that cannot ring at this
/// sample rate: non-positive eigenvalues, overdamped modes and modes at or
/// above Nyquist.
pub fn mode_parameters(
    eigenvalues: &[f64],
    mode_gains: &[f64],
    alpha: f64,
    beta: f64,
    sample_rate: f64,
) -> Result<Vec<ResonatorMode>> {
    if eigenvalues.len() != mode_gains.len() {
        return Err(ResonatorError::Input(format!(
            "Got {} eigenvalues but {} mode gains",
            eigenvalues.len(),
            mode_gains.len()
        )));
    }
    if !(sample_rate > 0.0) {
        return Err(ResonatorError::Input(format!(
            "Sample rate must be positive, got {sample_rate}"
        )));
    }

    let nyquist = sample_rate / 2.0;
    let modes = eigenvalues
        .iter()
        .zip(mode_gains)
        .filter(|(eigenvalue, _)| **eigenvalue > 0.0)
        .filter_map(|(&eigenvalue, &gain)| {
            let zeta = damping_ratio(eigenvalue, alpha, beta);
            if zeta >= 1.0 {
                return None;
            }
            let frequency = damped_frequency(eigenvalue, zeta);
            if frequency >= nyquist {
                return None;
            }
            let decay_rate = zeta * eigenvalue.sqrt();
            Some(ResonatorMode {
                natural_frequency: eigenvalue.sqrt() / (2.0 * PI),
                frequency,
                damping_ratio: zeta,
                decay_rate,
                t60: 1000f64.ln() / decay_rate,
                gain,
            })
        })
        .collect();

    Ok(modes)
}

pub fn render_modes(
    eigenvalues: &[f64],
    mode_gains: &[f64],
    alpha: f64,
    beta: f64,
    length_in_samples: usize,
    sample_rate: f64,
) -> Result<Vec<f32>> {
    render_modes_with(
        eigenvalues,
        mode_gains,
        alpha,
        beta,
        length_in_samples,
        sample_rate,
        RenderMethod::default(),
    )
}

/// Renders the impulse response of the modal bank
///
/// # Arguments
/// * `eigenvalues` - Mode eigenvalues `λ = ω²`
/// * `mode_gains` - Amplitude of each mode at the observation point
/// * `alpha` - Mass-proportional damping
/// * `beta` - Stiffness-proportional damping
/// * `length_in_samples` - Output length
/// * `sample_rate` - Output sample rate in Hz
/// * `method` - Recursive filtering, closed-form evaluation or FFT synthesis
pub fn render_modes_with(
    eigenvalues: &[f64],
    mode_gains: &[f64],
    alpha: f64,
    beta: f64,
    length_in_samples: usize,
    sample_rate: f64,
    method: RenderMethod,
) -> Result<Vec<f32>> {
    let modes = mode_parameters(eigenvalues, mode_gains, alpha, beta, sample_rate)?;
    let output = match method {
        RenderMethod::Recursive => render_recursive(&modes, length_in_samples, sample_rate),
        RenderMethod::Analytic => render_analytic(&modes, length_in_samples, sample_rate),
        RenderMethod::Fft => render_spectrum(&modes, length_in_samples, sample_rate),
    };

    Ok(output.into_iter().map(|s| s as f32).collect())
}

fn render_recursive(modes: &[ResonatorMode], length: usize, sample_rate: f64) -> Vec<f64> {
    let mut output = vec![0.0f64; length];
    for mode in modes {
        let mut filter = Biquad::from_pole(mode.pole(sample_rate), mode.gain);
        for (n, sample) in output.iter_mut().enumerate() {
            let impulse = if n == 0 { 1.0 } else { 0.0 };
            *sample += filter.process(impulse);
        }
    }
    output
}

fn render_analytic(modes: &[ResonatorMode], length: usize, sample_rate: f64) -> Vec<f64> {
    let mut output = vec![0.0f64; length];
    for mode in modes {
        let (radius, angle) = mode.pole(sample_rate).to_polar();
        for (n, sample) in output.iter_mut().enumerate() {
            let n = n as f64;
            *sample += mode.gain * radius.powf(n) * (n * angle).sin();
        }
    }
    output
}

/// Builds the exact DFT of every mode's response truncated to `length`
/// samples and transforms the sum back to the time domain.
///
/// The `N`-point DFT of `pⁿ` for `n < N` is `(1 - pᴺ) / (1 - p e^{-2πjk/N})`,
/// so no time aliasing is introduced.
fn render_spectrum(modes: &[ResonatorMode], length: usize, sample_rate: f64) -> Vec<f64> {
    if length == 0 {
        return Vec::new();
    }

    let n = length as f64;
    let mut spectrum = vec![Complex::new(0.0, 0.0); length];
    for mode in modes {
        let pole = mode.pole(sample_rate);
        let (radius, angle) = pole.to_polar();
        let tail = Complex::from_polar(radius.powf(n), angle * n);
        let scale = Complex::new(0.0, -0.5 * mode.gain);

        for (k, bin) in spectrum.iter_mut().enumerate() {
            let w = Complex::from_polar(1.0, -2.0 * PI * k as f64 / n);
            let rising = (1.0 - tail) / (1.0 - pole * w);
            let falling = (1.0 - tail.conj()) / (1.0 - pole.conj() * w);
            *bin += scale * (rising - falling);
        }
    }

    let mut planner = FftPlanner::<f64>::new();
    let ifft = planner.plan_fft_inverse(length);
    ifft.process(&mut spectrum);

    spectrum.iter().map(|c| c.re / n).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const SAMPLE_RATE: f64 = 44100.0;

    fn eigenvalue_for(frequency: f64) -> f64 {
        (2.0 * PI * frequency).powi(2)
    }

    #[test]
    fn peak_scales_linearly_with_gain() {
        let lambda = [eigenvalue_for(440.0)];
        let once = render_modes(&lambda, &[1.0], 5.0, 1e-7, 2048, SAMPLE_RATE).unwrap();
        let twice = render_modes(&lambda, &[2.5], 5.0, 1e-7, 2048, SAMPLE_RATE).unwrap();

        let peak = |s: &[f32]| s.iter().fold(0.0f32, |acc, v| acc.max(v.abs()));
        assert_relative_eq!(peak(&twice), 2.5 * peak(&once), max_relative = 1e-6);
        for (a, b) in once.iter().zip(&twice) {
            assert_relative_eq!(*b, 2.5 * a, epsilon = 1e-6);
        }
    }

    #[test]
    fn decay_envelope_follows_damping_ratio() {
        let lambda = eigenvalue_for(300.0);
        let (alpha, beta) = (20.0, 2e-6);
        let zeta = damping_ratio(lambda, alpha, beta);
        let sigma = zeta * lambda.sqrt();
        let omega_d = lambda.sqrt() * (1.0 - zeta * zeta).sqrt();

        let audio = render_modes(&[lambda], &[0.7], alpha, beta, 8000, SAMPLE_RATE).unwrap();
        for (n, sample) in audio.iter().enumerate() {
            let t = n as f64 / SAMPLE_RATE;
            let expected = 0.7 * (-sigma * t).exp() * (omega_d * t).sin();
            assert!(
                (*sample as f64 - expected).abs() < 1e-5,
                "sample {n}: {sample} vs {expected}"
            );
        }
    }

    #[test]
    fn all_render_methods_agree() {
        let eigenvalues: Vec<f64> = [110.0, 523.0, 1870.0, 6400.0]
            .iter()
            .map(|f| eigenvalue_for(*f))
            .collect();
        let gains = [0.3, -1.2, 0.8, 0.05];
        let render = |method| {
            render_modes_with(&eigenvalues, &gains, 3.0, 5e-7, 22050, SAMPLE_RATE, method).unwrap()
        };

        let recursive = render(RenderMethod::Recursive);
        let analytic = render(RenderMethod::Analytic);
        let fft = render(RenderMethod::Fft);
        assert_eq!(fft.len(), 22050);

        for ((a, b), c) in recursive.iter().zip(&analytic).zip(&fft) {
            assert!((a - b).abs() < 1e-5);
            assert!((a - c).abs() < 1e-5);
            assert!((b - c).abs() < 1e-5);
        }
    }

    #[test]
    fn fft_handles_odd_and_empty_lengths() {
        let lambda = [eigenvalue_for(750.0)];
        let fft = render_modes_with(&lambda, &[1.0], 40.0, 0.0, 1001, SAMPLE_RATE, RenderMethod::Fft)
            .unwrap();
        let analytic =
            render_modes_with(&lambda, &[1.0], 40.0, 0.0, 1001, SAMPLE_RATE, RenderMethod::Analytic)
                .unwrap();
        for (a, b) in fft.iter().zip(&analytic) {
            assert_relative_eq!(*a, *b, epsilon = 1e-6);
        }

        let empty =
            render_modes_with(&lambda, &[1.0], 40.0, 0.0, 0, SAMPLE_RATE, RenderMethod::Fft).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn partial_samples_are_truncated() {
        assert_eq!(length_in_samples(0.3, 16000.0), 4800);
        assert_eq!(length_in_samples(0.0016, 1000.0), 1);
        assert_eq!(length_in_samples(0.0, 44100.0), 0);
    }

    #[test]
    fn modes_above_nyquist_are_silent() {
        let lambda = [eigenvalue_for(30_000.0)];
        let audio = render_modes(&lambda, &[1.0], 1.0, 1e-8, 512, SAMPLE_RATE).unwrap();
        assert!(audio.iter().all(|s| *s == 0.0));

        let modes = mode_parameters(&lambda, &[1.0], 1.0, 1e-8, SAMPLE_RATE).unwrap();
        assert!(modes.is_empty());
    }

    #[test]
    fn overdamped_and_rigid_modes_are_skipped() {
        let modes = mode_parameters(
            &[0.0, eigenvalue_for(10.0), eigenvalue_for(1000.0)],
            &[1.0, 1.0, 1.0],
            1e4,
            0.0,
            SAMPLE_RATE,
        )
        .unwrap();
        assert_eq!(modes.len(), 1);
        assert_relative_eq!(modes[0].natural_frequency, 1000.0, max_relative = 1e-12);
    }

    #[test]
    fn zero_damping_is_floored() {
        let lambda = eigenvalue_for(1000.0);
        assert_eq!(damping_ratio(lambda, 0.0, 0.0), MIN_DAMPING_RATIO);

        let audio = render_modes(&[lambda], &[1.0], 0.0, 0.0, 44100, SAMPLE_RATE).unwrap();
        assert!(audio.iter().all(|s| s.is_finite() && s.abs() <= 1.0 + 1e-6));
    }

    #[test]
    fn mismatched_input_is_rejected() {
        assert!(matches!(
            render_modes(&[1.0, 2.0], &[1.0], 0.0, 0.0, 16, SAMPLE_RATE),
            Err(ResonatorError::Input(_))
        ));
        assert!(matches!(
            render_modes(&[1.0], &[1.0], 0.0, 0.0, 16, 0.0),
            Err(ResonatorError::Input(_))
        ));
    }

    #[test]
    fn biquad_response_peaks_at_resonance() {
        let mode = mode_parameters(&[eigenvalue_for(2000.0)], &[1.0], 10.0, 0.0, SAMPLE_RATE)
            .unwrap()[0];
        let filter = Biquad::from_pole(mode.pole(SAMPLE_RATE), 1.0);

        let at = |f: f64| filter.response(f, SAMPLE_RATE).norm();
        assert!(at(mode.frequency) > at(1000.0));
        assert!(at(mode.frequency) > at(4000.0));

        let dc = filter.response(0.0, SAMPLE_RATE);
        let p = mode.pole(SAMPLE_RATE);
        assert_relative_eq!(dc.re, p.im / (1.0 - 2.0 * p.re + p.norm_sqr()), max_relative = 1e-9);
        assert_relative_eq!(dc.im, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn reset_clears_state() {
        let mode = mode_parameters(&[eigenvalue_for(500.0)], &[1.0], 1.0, 0.0, SAMPLE_RATE)
            .unwrap()[0];
        let mut filter = Biquad::from_pole(mode.pole(SAMPLE_RATE), 1.0);
        let first: Vec<f64> = (0..8).map(|n| filter.process(if n == 0 { 1.0 } else { 0.0 })).collect();
        filter.reset();
        let second: Vec<f64> = (0..8).map(|n| filter.process(if n == 0 { 1.0 } else { 0.0 })).collect();
        assert_eq!(first, second);
    }
}
