//! Marginal loss functions built from noisy linear measurements.

use ndarray::{Array1, Array2};

use dpsynth_core::{Clique, CliqueVector, Error, Factor, Result};

/// The linear operator applied to a clique's flattened count vector.
#[derive(Clone, Debug)]
pub enum Query {
    /// The identity operator.
    Identity,
    /// An explicit matrix applied to the count vector.
    Matrix(Array2<f64>),
}

impl Query {
    /// Apply the operator.
    pub fn apply(&self, x: &Array1<f64>) -> Array1<f64> {
        match self {
            Query::Identity => x.clone(),
            Query::Matrix(m) => m.dot(x),
        }
    }

    /// Apply the transpose of the operator.
    pub fn apply_transpose(&self, r: &Array1<f64>) -> Array1<f64> {
        match self {
            Query::Identity => r.clone(),
            Query::Matrix(m) => m.t().dot(r),
        }
    }

    /// True when the operator acts as the identity on `x`.
    ///
    /// A matrix whose shape is incompatible with `x` cannot be checked and
    /// reports `false`.
    pub fn is_identity_on(&self, x: &Array1<f64>) -> bool {
        match self {
            Query::Identity => true,
            Query::Matrix(m) => {
                if m.nrows() != x.len() || m.ncols() != x.len() {
                    return false;
                }
                let applied = m.dot(x);
                applied
                    .iter()
                    .zip(x.iter())
                    .all(|(a, b)| (a - b).abs() <= 1e-8 * (1.0 + b.abs()))
            }
        }
    }
}

/// A noisy observation of one clique's count vector.
#[derive(Clone, Debug)]
pub struct LinearMeasurement {
    /// The noisy observed vector.
    pub noisy: Array1<f64>,
    /// The measured clique.
    pub clique: Clique,
    /// Standard deviation of the noise that was added.
    pub stddev: f64,
    /// The query operator relating counts to the observation.
    pub query: Query,
}

impl LinearMeasurement {
    /// An identity-query measurement.
    pub fn new(noisy: Array1<f64>, clique: Clique, stddev: f64) -> Self {
        Self {
            noisy,
            clique,
            stddev,
            query: Query::Identity,
        }
    }

    /// Replace the query operator.
    pub fn with_query(mut self, query: Query) -> Self {
        self.query = query;
        self
    }
}

/// Minimum-variance unbiased estimate of the record total.
///
/// Only measurements whose query is (observably) the identity contribute;
/// their sums are combined with inverse-variance weights and the result is
/// floored at one. With no usable measurement the estimate is exactly one.
pub fn minimum_variance_unbiased_total(measurements: &[LinearMeasurement]) -> f64 {
    let mut estimates = Vec::new();
    let mut variances = Vec::new();
    for m in measurements {
        if m.query.is_identity_on(&m.noisy) {
            estimates.push(m.noisy.sum());
            variances.push(m.stddev.powi(2) * m.noisy.len() as f64);
        }
    }
    if estimates.is_empty() {
        return 1.0;
    }
    let variance = 1.0 / variances.iter().map(|v| 1.0 / v).sum::<f64>();
    let estimate = variance
        * estimates
            .iter()
            .zip(variances.iter())
            .map(|(e, v)| e / v)
            .sum::<f64>();
    estimate.max(1.0)
}

/// A convex loss over the marginal polytope with an analytic gradient.
pub trait MarginalLoss {
    /// The cliques the loss touches.
    fn cliques(&self) -> &[Clique];

    /// Loss value at a marginal vector.
    fn value(&self, marginals: &CliqueVector) -> Result<f64>;

    /// Loss value and gradient; the gradient shares the marginal vector's
    /// key set.
    fn value_and_grad(&self, marginals: &CliqueVector) -> Result<(f64, CliqueVector)>;
}

/// Which residual norm a [`MeasurementLoss`] penalizes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Norm {
    /// Absolute-error loss with a sign subgradient.
    L1,
    /// Squared-error loss.
    L2,
}

/// The canonical loss over a list of linear measurements.
///
/// `L(μ) = Σ_M ||Q·vec(μ_cl) − y||² / (2σ)` for the L2 norm, or the
/// σ-weighted absolute error for L1. Gradients are routed to the first
/// stored clique (canonical order) covering each measurement.
#[derive(Clone, Debug)]
pub struct MeasurementLoss {
    measurements: Vec<LinearMeasurement>,
    norm: Norm,
    cliques: Vec<Clique>,
}

impl MeasurementLoss {
    /// Build the default (L2) measurement loss.
    pub fn new(measurements: Vec<LinearMeasurement>) -> Self {
        Self::with_norm(measurements, Norm::L2)
    }

    /// Build a measurement loss with an explicit norm.
    pub fn with_norm(measurements: Vec<LinearMeasurement>, norm: Norm) -> Self {
        let mut cliques: Vec<Clique> = measurements.iter().map(|m| m.clique.clone()).collect();
        cliques.sort();
        cliques.dedup();
        Self {
            measurements,
            norm,
            cliques,
        }
    }

    /// The wrapped measurements.
    pub fn measurements(&self) -> &[LinearMeasurement] {
        &self.measurements
    }

    fn term(&self, m: &LinearMeasurement, mu_cl: &Factor) -> (f64, Array1<f64>) {
        let x = mu_cl.datavector();
        let diff = &m.query.apply(&x) - &m.noisy;
        match self.norm {
            Norm::L2 => {
                let value = diff.dot(&diff) / (2.0 * m.stddev);
                let grad = m.query.apply_transpose(&diff).mapv(|g| g / m.stddev);
                (value, grad)
            }
            Norm::L1 => {
                let value = diff.iter().map(|d| d.abs()).sum::<f64>() / m.stddev;
                let sign = diff.mapv(f64::signum);
                let grad = m.query.apply_transpose(&sign).mapv(|g| g / m.stddev);
                (value, grad)
            }
        }
    }
}

impl MarginalLoss for MeasurementLoss {
    fn cliques(&self) -> &[Clique] {
        &self.cliques
    }

    fn value(&self, marginals: &CliqueVector) -> Result<f64> {
        let mut total = 0.0;
        for m in &self.measurements {
            let mu_cl = marginals.project(&m.clique)?;
            total += self.term(m, &mu_cl).0;
        }
        Ok(total)
    }

    fn value_and_grad(&self, marginals: &CliqueVector) -> Result<(f64, CliqueVector)> {
        let mut total = 0.0;
        let mut pieces = Vec::with_capacity(self.measurements.len());
        for m in &self.measurements {
            let covering = marginals
                .covering_clique(&m.clique)
                .ok_or_else(|| Error::Coverage {
                    clique: m.clique.to_string(),
                })?
                .clone();
            let stored = marginals.get(&covering).ok_or_else(|| Error::Coverage {
                clique: m.clique.to_string(),
            })?;
            let mu_cl = stored.project(&m.clique)?;
            let (value, grad_vec) = self.term(m, &mu_cl);
            total += value;
            let grad_factor = Factor::from_datavector(mu_cl.domain().clone(), grad_vec.to_vec())?;
            pieces.push((covering, grad_factor));
        }
        let mut grad = CliqueVector::zeros_like(marginals);
        grad.combine(&CliqueVector::from_entries(pieces));
        Ok((total, grad))
    }
}

/// Negative log-likelihood of target marginals: `−⟨m, log μ⟩`.
///
/// Used to fit maximum-likelihood potentials from an existing marginal
/// vector.
#[derive(Clone, Debug)]
pub struct NegativeLogLikelihood {
    target: CliqueVector,
    cliques: Vec<Clique>,
}

impl NegativeLogLikelihood {
    /// Build the loss for a target marginal vector.
    pub fn new(target: CliqueVector) -> Self {
        let cliques = target.cliques();
        Self { target, cliques }
    }
}

impl MarginalLoss for NegativeLogLikelihood {
    fn cliques(&self) -> &[Clique] {
        &self.cliques
    }

    fn value(&self, marginals: &CliqueVector) -> Result<f64> {
        Ok(-self.target.dot(&marginals.log()))
    }

    fn value_and_grad(&self, marginals: &CliqueVector) -> Result<(f64, CliqueVector)> {
        let value = self.value(marginals)?;
        let entries = marginals.iter().map(|(cl, mu)| {
            let target = match self.target.get(cl) {
                Some(t) => (t / mu).scale(-1.0),
                None => Factor::zeros(mu.domain().clone()),
            };
            (cl.clone(), target)
        });
        Ok((value, CliqueVector::from_entries(entries)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dpsynth_core::Domain;
    use ndarray::array;

    #[test]
    fn mvu_total_combines_identity_measurements() {
        let cl = Clique::single("a");
        let ms = vec![
            LinearMeasurement::new(array![100.0], cl.clone(), 2.0),
            LinearMeasurement::new(array![110.0], cl.clone(), 4.0),
        ];
        // Inverse-variance weighting of 100 (var 4) and 110 (var 16).
        let expected = (100.0 / 4.0 + 110.0 / 16.0) / (1.0 / 4.0 + 1.0 / 16.0);
        assert!((minimum_variance_unbiased_total(&ms) - expected).abs() < 1e-9);
        assert!((expected - 102.0).abs() < 1e-9);
    }

    #[test]
    fn mvu_total_defaults_to_one() {
        assert_eq!(minimum_variance_unbiased_total(&[]), 1.0);

        // Non-identity queries are skipped.
        let cl = Clique::single("a");
        let ms = vec![LinearMeasurement::new(array![5.0, 5.0], cl, 1.0)
            .with_query(Query::Matrix(array![[1.0, 1.0]]))];
        assert_eq!(minimum_variance_unbiased_total(&ms), 1.0);
    }

    #[test]
    fn mvu_total_is_floored_at_one() {
        let cl = Clique::single("a");
        let ms = vec![LinearMeasurement::new(array![-40.0, 2.0], cl, 1.0)];
        assert_eq!(minimum_variance_unbiased_total(&ms), 1.0);
    }

    #[test]
    fn l2_gradient_matches_finite_differences() {
        let dom = Domain::new(["a", "b"], vec![2, 2]).unwrap();
        let ab = Clique::new(["a", "b"]);
        let a = Clique::single("a");
        let ms = vec![LinearMeasurement::new(array![3.0, 1.0], a, 2.0)];
        let loss = MeasurementLoss::new(ms);

        let mu = CliqueVector::from_entries([(
            ab.clone(),
            Factor::from_datavector(dom.project(&ab).unwrap(), vec![1.0, 2.0, 3.0, 4.0]).unwrap(),
        )]);
        let (value, grad) = loss.value_and_grad(&mu).unwrap();
        assert!(value > 0.0);

        let eps = 1e-6;
        let base = loss.value(&mu).unwrap();
        let g = grad.get(&ab).unwrap().datavector();
        for i in 0..4 {
            let mut bumped = vec![1.0, 2.0, 3.0, 4.0];
            bumped[i] += eps;
            let mu2 = CliqueVector::from_entries([(
                ab.clone(),
                Factor::from_datavector(dom.project(&ab).unwrap(), bumped).unwrap(),
            )]);
            let fd = (loss.value(&mu2).unwrap() - base) / eps;
            assert!((g[i] - fd).abs() < 1e-4, "coord {i}: {} vs {fd}", g[i]);
        }
    }

    #[test]
    fn nll_gradient_is_ratio() {
        let dom = Domain::new(["a"], vec![2]).unwrap();
        let a = Clique::single("a");
        let target = CliqueVector::from_entries([(
            a.clone(),
            Factor::from_datavector(dom.clone(), vec![3.0, 1.0]).unwrap(),
        )]);
        let mu = CliqueVector::from_entries([(
            a.clone(),
            Factor::from_datavector(dom, vec![2.0, 2.0]).unwrap(),
        )]);
        let loss = NegativeLogLikelihood::new(target);
        let (value, grad) = loss.value_and_grad(&mu).unwrap();
        assert!((value - -(3.0 * 2.0f64.ln() + 1.0 * 2.0f64.ln())).abs() < 1e-12);
        let g = grad.get(&a).unwrap().datavector();
        assert!((g[0] - -1.5).abs() < 1e-12);
        assert!((g[1] - -0.5).abs() < 1e-12);
    }
}
