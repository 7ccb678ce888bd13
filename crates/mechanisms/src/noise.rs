//! The Gaussian and exponential mechanisms.

use ndarray::Array1;
use rand::Rng;
use rand_distr::{Distribution, Normal};

use dpsynth_core::{Error, Result};

use crate::budget::BudgetTracker;

/// Release a noisy copy of `value` under a rho-zCDP Gaussian mechanism.
///
/// The charge is applied to the tracker before any noise is drawn, so a
/// rejected charge never leaks a measurement. Returns the noisy vector
/// together with the noise standard deviation actually used
/// (`sensitivity / sqrt(2 rho)`), which callers should record alongside
/// the measurement.
pub fn gaussian_mechanism<R: Rng>(
    value: &Array1<f64>,
    sensitivity: f64,
    rho: f64,
    budget: &mut BudgetTracker,
    rng: &mut R,
) -> Result<(Array1<f64>, f64)> {
    if !sensitivity.is_finite() || sensitivity <= 0.0 {
        return Err(Error::invalid("sensitivity must be finite and positive"));
    }
    budget.charge(rho)?;
    let sigma = sensitivity / (2.0 * rho).sqrt();
    let normal = Normal::new(0.0, sigma)
        .map_err(|e| Error::numerical(format!("gaussian mechanism: {e}")))?;
    let noisy = value.mapv(|v| v + normal.sample(rng));
    Ok((noisy, sigma))
}

/// Select a candidate index with the exponential mechanism.
///
/// Sampling weight is `exp(epsilon * score / (2 * sensitivity))`, computed
/// with max-subtraction for stability. A non-positive sensitivity means the
/// scores carry no signal, in which case the choice is uniform at random.
pub fn exponential_mechanism<R: Rng>(
    scores: &[f64],
    epsilon: f64,
    sensitivity: f64,
    rng: &mut R,
) -> Result<usize> {
    if scores.is_empty() {
        return Err(Error::invalid(
            "exponential mechanism needs at least one candidate",
        ));
    }
    if !epsilon.is_finite() || epsilon < 0.0 {
        return Err(Error::invalid("epsilon must be finite and non-negative"));
    }
    if sensitivity <= 0.0 {
        return Ok(rng.gen_range(0..scores.len()));
    }

    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let weights: Vec<f64> = scores
        .iter()
        .map(|&s| (0.5 * epsilon * (s - max) / sensitivity).exp())
        .collect();
    let total: f64 = weights.iter().sum();
    if !(total > 0.0) || !total.is_finite() {
        return Ok(rng.gen_range(0..scores.len()));
    }
    let mut u = rng.gen::<f64>() * total;
    for (i, w) in weights.iter().enumerate() {
        u -= w;
        if u <= 0.0 {
            return Ok(i);
        }
    }
    Ok(scores.len() - 1)
}
