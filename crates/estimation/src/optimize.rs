//! Solvers for fitting graphical-model potentials to marginal losses.
//!
//! Four algorithms share one scaffold: resolve the loss input, initialize
//! potentials, build the inference oracle, run the per-algorithm step for a
//! fixed iteration count, and wrap the outcome in a [`GraphicalModel`].
//! Mirror descent is the recommended default; L-BFGS differentiates through
//! the oracle; dual averaging and interior gradient are accelerated
//! variants that need a gradient-Lipschitz constant.

use std::collections::VecDeque;

use dpsynth_core::{CliqueVector, Domain, Error, Result};

use crate::loss::{
    minimum_variance_unbiased_total, LinearMeasurement, MarginalLoss, MeasurementLoss,
    NegativeLogLikelihood,
};
use crate::model::GraphicalModel;
use crate::oracle::{MarginalOracle, MessagePassing};

/// The loss input accepted by every solver.
pub enum LossSpec {
    /// A list of noisy linear measurements (the common case); the record
    /// total is estimated from them when not supplied.
    Measurements(Vec<LinearMeasurement>),
    /// An arbitrary marginal loss; requires an explicit `known_total`.
    Custom(Box<dyn MarginalLoss>),
}

impl LossSpec {
    /// Wrap a custom marginal loss.
    pub fn custom(loss: impl MarginalLoss + 'static) -> Self {
        LossSpec::Custom(Box::new(loss))
    }
}

impl From<Vec<LinearMeasurement>> for LossSpec {
    fn from(measurements: Vec<LinearMeasurement>) -> Self {
        LossSpec::Measurements(measurements)
    }
}

/// Per-iteration information passed to an optional callback.
#[derive(Clone, Debug)]
pub struct CallbackArgs {
    /// One-based iteration number.
    pub step: usize,
    /// Loss value reported by the iteration.
    pub loss: f64,
}

/// Options shared by the solver entry points.
pub struct SolverOpts {
    /// Known or estimated number of records; required with a custom loss.
    pub known_total: Option<f64>,
    /// Initial potentials; zeros over the loss cliques when absent.
    pub potentials: Option<CliqueVector>,
    /// Number of iterations to run (exactly; there is no early exit).
    pub iters: usize,
    /// Fixed step size for mirror descent; line search when absent.
    pub stepsize: Option<f64>,
    /// History length for L-BFGS.
    pub memory: usize,
    /// Observer invoked after every iteration.
    pub callback: Option<Box<dyn FnMut(CallbackArgs)>>,
}

impl Default for SolverOpts {
    fn default() -> Self {
        Self {
            known_total: None,
            potentials: None,
            iters: 1000,
            stepsize: None,
            memory: 1,
            callback: None,
        }
    }
}

enum ActiveLoss<'a> {
    Measurements(MeasurementLoss),
    Custom(&'a dyn MarginalLoss),
}

impl ActiveLoss<'_> {
    fn as_dyn(&self) -> &dyn MarginalLoss {
        match self {
            ActiveLoss::Measurements(m) => m,
            ActiveLoss::Custom(c) => *c,
        }
    }
}

struct SolverContext<'a> {
    oracle: MessagePassing,
    loss: &'a dyn MarginalLoss,
    total: f64,
}

/// Resolve the tagged loss input into a canonical (loss, total, initial
/// potentials) triple.
fn resolve<'a>(
    domain: &Domain,
    loss: &'a LossSpec,
    known_total: Option<f64>,
    potentials: Option<CliqueVector>,
) -> Result<(ActiveLoss<'a>, f64, CliqueVector)> {
    let (active, total) = match loss {
        LossSpec::Measurements(ms) => {
            let total = known_total.unwrap_or_else(|| minimum_variance_unbiased_total(ms));
            (ActiveLoss::Measurements(MeasurementLoss::new(ms.clone())), total)
        }
        LossSpec::Custom(l) => {
            let total = known_total.ok_or_else(|| {
                Error::config("a custom marginal loss requires an explicit known_total")
            })?;
            (ActiveLoss::Custom(l.as_ref()), total)
        }
    };
    let potentials = match potentials {
        Some(p) => p,
        None => CliqueVector::zeros(domain, active.as_dyn().cliques())?,
    };
    Ok((active, total, potentials))
}

/// The shared solver scaffold: resolve, initialize, iterate sequentially,
/// wrap.
fn run_solver<S>(
    domain: &Domain,
    loss: &LossSpec,
    opts: SolverOpts,
    init: impl FnOnce(&SolverContext<'_>, CliqueVector) -> Result<S>,
    mut step: impl FnMut(&mut S, usize, &SolverContext<'_>) -> Result<f64>,
    finish: impl FnOnce(S, &SolverContext<'_>) -> Result<GraphicalModel>,
) -> Result<GraphicalModel> {
    let SolverOpts {
        known_total,
        potentials,
        iters,
        mut callback,
        ..
    } = opts;
    let (active, total, potentials) = resolve(domain, loss, known_total, potentials)?;
    let oracle = MessagePassing::new(domain, &potentials.cliques())?;
    let cx = SolverContext {
        oracle,
        loss: active.as_dyn(),
        total,
    };
    let mut state = init(&cx, potentials)?;
    for t in 1..=iters {
        let loss_val = step(&mut state, t, &cx)?;
        tracing::debug!(iteration = t, loss = loss_val, "solver iteration");
        if let Some(cb) = callback.as_mut() {
            cb(CallbackArgs {
                step: t,
                loss: loss_val,
            });
        }
    }
    finish(state, &cx)
}

struct MirrorState {
    theta: CliqueVector,
    alpha: f64,
}

/// Fit a model with the mirror descent algorithm (recommended).
///
/// A proximal first-order method over the marginal polytope. Without a
/// fixed step size, each iteration performs one Armijo sufficient-decrease
/// check: the candidate step is accepted only if
/// `L − L′ ≥ ½·α·⟨∇L, μ−μ′⟩`; on rejection the step size is halved and the
/// potentials are left unchanged for that iteration. The step size never
/// increases. With `iters = 0` the initial potentials are returned
/// untouched alongside their induced marginals.
pub fn mirror_descent(domain: &Domain, loss: &LossSpec, opts: SolverOpts) -> Result<GraphicalModel> {
    let stepsize = opts.stepsize;
    run_solver(
        domain,
        loss,
        opts,
        |_cx, potentials| {
            Ok(MirrorState {
                theta: potentials,
                alpha: stepsize.unwrap_or(2.0),
            })
        },
        move |st, _t, cx| {
            let mu = cx.oracle.marginals(&st.theta, cx.total)?;
            let (loss_val, grad) = cx.loss.value_and_grad(&mu)?;
            let theta2 = &st.theta - &grad.scale(st.alpha);
            if stepsize.is_some() {
                st.theta = theta2;
                return Ok(loss_val);
            }
            let mu2 = cx.oracle.marginals(&theta2, cx.total)?;
            let loss2 = cx.loss.value(&mu2)?;
            let sufficient_decrease = loss_val - loss2 >= 0.5 * st.alpha * grad.dot(&(&mu - &mu2));
            if sufficient_decrease {
                st.theta = theta2;
                Ok(loss2)
            } else {
                st.alpha *= 0.5;
                Ok(loss_val)
            }
        },
        |st, cx| {
            let marginals = cx.oracle.marginals(&st.theta, cx.total)?;
            Ok(GraphicalModel::new(st.theta, marginals, cx.total))
        },
    )
}

struct LbfgsState {
    theta: CliqueVector,
    history: VecDeque<(CliqueVector, CliqueVector, f64)>,
    prev: Option<(CliqueVector, CliqueVector)>,
    memory: usize,
}

fn theta_loss_and_grad(
    cx: &SolverContext<'_>,
    theta: &CliqueVector,
) -> Result<(f64, CliqueVector)> {
    let mu = cx.oracle.marginals(theta, cx.total)?;
    let (loss_val, dmu) = cx.loss.value_and_grad(&mu)?;
    let grad = cx.oracle.vjp(theta, cx.total, &dmu)?;
    Ok((loss_val, grad))
}

/// Fit a model by optimizing the potentials directly with L-BFGS.
///
/// Gradients are obtained by back-propagating the marginal loss through the
/// inference oracle. The composed objective is convex in the marginals but
/// generally not in the potentials, so convergence to the global optimum is
/// guaranteed only in the noiseless maximum-likelihood setting; in practice
/// it behaves well regardless.
pub fn lbfgs(domain: &Domain, loss: &LossSpec, opts: SolverOpts) -> Result<GraphicalModel> {
    let memory = opts.memory.max(1);
    run_solver(
        domain,
        loss,
        opts,
        |_cx, potentials| {
            Ok(LbfgsState {
                theta: potentials,
                history: VecDeque::new(),
                prev: None,
                memory,
            })
        },
        |st, _t, cx| {
            let (loss_val, grad) = theta_loss_and_grad(cx, &st.theta)?;
            if let Some((prev_theta, prev_grad)) = st.prev.take() {
                let s = &st.theta - &prev_theta;
                let y = &grad - &prev_grad;
                let sy = s.dot(&y);
                if sy > 1e-10 {
                    st.history.push_back((s, y, 1.0 / sy));
                    while st.history.len() > st.memory {
                        st.history.pop_front();
                    }
                }
            }

            // Two-loop recursion for the quasi-Newton direction.
            let mut q = grad.scale(1.0);
            let mut alphas = Vec::with_capacity(st.history.len());
            for (s, y, rho) in st.history.iter().rev() {
                let a = rho * s.dot(&q);
                q = &q - &y.scale(a);
                alphas.push(a);
            }
            let gamma = st
                .history
                .back()
                .map(|(s, y, _)| {
                    let yy = y.dot(y);
                    if yy > 0.0 {
                        s.dot(y) / yy
                    } else {
                        1.0
                    }
                })
                .unwrap_or(1.0);
            let mut r = q.scale(gamma);
            for ((s, y, rho), a) in st.history.iter().zip(alphas.iter().rev()) {
                let b = rho * y.dot(&r);
                r = &r + &s.scale(a - b);
            }
            let mut direction = r.scale(-1.0);
            let mut slope = grad.dot(&direction);
            if slope >= 0.0 {
                // Curvature information is unusable; fall back to steepest
                // descent.
                direction = grad.scale(-1.0);
                slope = -grad.dot(&grad);
            }

            // Backtracking Armijo line search.
            let c1 = 1e-4;
            let mut step_size = 1.0;
            for _ in 0..128 {
                let candidate = &st.theta + &direction.scale(step_size);
                let mu = cx.oracle.marginals(&candidate, cx.total)?;
                let candidate_loss = cx.loss.value(&mu)?;
                if candidate_loss <= loss_val + c1 * step_size * slope {
                    st.prev = Some((st.theta.clone(), grad));
                    st.theta = candidate;
                    return Ok(candidate_loss);
                }
                step_size *= 0.5;
            }
            st.prev = Some((st.theta.clone(), grad));
            Ok(loss_val)
        },
        |st, cx| {
            let marginals = cx.oracle.marginals(&st.theta, cx.total)?;
            Ok(GraphicalModel::new(st.theta, marginals, cx.total))
        },
    )
}

struct DualAveragingState {
    w: CliqueVector,
    v: CliqueVector,
    gbar: CliqueVector,
    theta: CliqueVector,
}

/// Fit a model with regularized dual averaging.
///
/// An accelerated proximal method requiring the Lipschitz constant of the
/// loss gradient. The returned model's marginals are the algorithm's
/// ergodic average `w`; the potentials are the final dual iterate, which
/// reproduces `w` only approximately.
pub fn dual_averaging(
    domain: &Domain,
    loss: &LossSpec,
    lipschitz: f64,
    opts: SolverOpts,
) -> Result<GraphicalModel> {
    if !lipschitz.is_finite() || lipschitz <= 0.0 {
        return Err(Error::invalid("lipschitz must be finite and positive"));
    }
    run_solver(
        domain,
        loss,
        opts,
        |cx, potentials| {
            let w = cx.oracle.marginals(&potentials, cx.total)?;
            Ok(DualAveragingState {
                v: w.clone(),
                gbar: CliqueVector::zeros_like(&w),
                theta: CliqueVector::zeros_like(&w),
                w,
            })
        },
        move |st, t, cx| {
            let c = 2.0 / (t as f64 + 1.0);
            let u = &st.w.scale(1.0 - c) + &st.v.scale(c);
            let (loss_val, grad) = cx.loss.value_and_grad(&u)?;
            st.gbar = &st.gbar.scale(1.0 - c) + &grad.scale(c);
            let t_f = t as f64;
            st.theta = st
                .gbar
                .scale(-t_f * (t_f + 1.0) / (4.0 * lipschitz) / cx.total);
            st.v = cx.oracle.marginals(&st.theta, cx.total)?;
            st.w = &st.w.scale(1.0 - c) + &st.v.scale(c);
            Ok(loss_val)
        },
        |st, cx| Ok(GraphicalModel::new(st.theta, st.w, cx.total)),
    )
}

struct InteriorGradientState {
    theta: CliqueVector,
    c: f64,
    x: CliqueVector,
    z: CliqueVector,
}

/// Fit a model with the interior gradient method.
///
/// An accelerated proximal method requiring the Lipschitz constant of the
/// loss gradient; the per-step combination coefficient is the positive root
/// of `a² = c·l·(1−a)`. As with dual averaging, the returned marginals are
/// the averaged iterate `x` and the potentials are the final θ.
pub fn interior_gradient(
    domain: &Domain,
    loss: &LossSpec,
    lipschitz: f64,
    opts: SolverOpts,
) -> Result<GraphicalModel> {
    if !lipschitz.is_finite() || lipschitz <= 0.0 {
        return Err(Error::invalid("lipschitz must be finite and positive"));
    }
    let l = 1.0 / lipschitz;
    run_solver(
        domain,
        loss,
        opts,
        |cx, potentials| {
            let x = cx.oracle.marginals(&potentials, cx.total)?;
            Ok(InteriorGradientState {
                theta: potentials,
                c: 1.0,
                z: x.clone(),
                x,
            })
        },
        move |st, _t, cx| {
            let cl = st.c * l;
            let a = ((cl * cl + 4.0 * cl).sqrt() - cl) / 2.0;
            let y = &st.x.scale(1.0 - a) + &st.z.scale(a);
            st.c *= 1.0 - a;
            let (loss_val, grad) = cx.loss.value_and_grad(&y)?;
            st.theta = &st.theta - &grad.scale(a / st.c / cx.total);
            st.z = cx.oracle.marginals(&st.theta, cx.total)?;
            st.x = &st.x.scale(1.0 - a) + &st.z.scale(a);
            Ok(loss_val)
        },
        |st, cx| Ok(GraphicalModel::new(st.theta, st.x, cx.total)),
    )
}

/// Fit maximum-likelihood potentials to a target marginal vector.
///
/// Minimizes the negative log-likelihood `−⟨m, log μ⟩` with the L-BFGS
/// solver under a fixed 150-iteration cap.
pub fn mle_from_marginals(marginals: &CliqueVector, known_total: f64) -> Result<GraphicalModel> {
    let domain = marginals.domain()?;
    let loss = LossSpec::custom(NegativeLogLikelihood::new(marginals.clone()));
    lbfgs(
        &domain,
        &loss,
        SolverOpts {
            known_total: Some(known_total),
            iters: 150,
            ..Default::default()
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use dpsynth_core::{Clique, Dataset, Domain};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn fixture() -> (Domain, Vec<LinearMeasurement>) {
        let domain = Domain::new(["a", "b", "c"], vec![2, 3, 2]).unwrap();
        let data = Dataset::from_rows(
            domain.clone(),
            vec![
                vec![0, 0, 0],
                vec![0, 1, 1],
                vec![1, 2, 1],
                vec![1, 1, 0],
                vec![0, 0, 0],
                vec![1, 2, 1],
                vec![0, 2, 1],
                vec![1, 0, 0],
            ],
        )
        .unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(23);
        let sigma = 0.5;
        let measurements = [Clique::new(["a", "b"]), Clique::new(["b", "c"])]
            .iter()
            .map(|cl| {
                let x = data.project(cl).unwrap().datavector();
                let noisy = x.mapv(|v| {
                    let n: f64 =
                        rand_distr::Distribution::sample(&rand_distr::StandardNormal, &mut rng);
                    v + sigma * n
                });
                LinearMeasurement::new(noisy, cl.clone(), sigma)
            })
            .collect();
        (domain, measurements)
    }

    fn loss_at(model: &GraphicalModel, measurements: &[LinearMeasurement]) -> f64 {
        MeasurementLoss::new(measurements.to_vec())
            .value(model.marginals())
            .unwrap()
    }

    #[test]
    fn zero_iterations_leave_potentials_unchanged() {
        let (domain, measurements) = fixture();
        let spec = LossSpec::from(measurements);
        let model = mirror_descent(
            &domain,
            &spec,
            SolverOpts {
                iters: 0,
                ..Default::default()
            },
        )
        .unwrap();

        for (_, theta) in model.potentials().iter() {
            assert!(theta.datavector().iter().all(|&v| v == 0.0));
        }
        // Zero potentials induce uniform marginals at the estimated total.
        for (_, f) in model.marginals().iter() {
            let total = model.total();
            let expected = total / f.size() as f64;
            for v in f.datavector().iter() {
                assert!((v - expected).abs() < 1e-9 * total.max(1.0));
            }
        }
    }

    #[test]
    fn mirror_descent_reduces_loss() {
        let (domain, measurements) = fixture();
        let spec = LossSpec::from(measurements.clone());
        let start = mirror_descent(
            &domain,
            &spec,
            SolverOpts {
                iters: 0,
                ..Default::default()
            },
        )
        .unwrap();
        let fitted = mirror_descent(
            &domain,
            &spec,
            SolverOpts {
                iters: 60,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(loss_at(&fitted, &measurements) < loss_at(&start, &measurements));
    }

    #[test]
    fn mirror_descent_accepts_fixed_stepsize() {
        let (domain, measurements) = fixture();
        let spec = LossSpec::from(measurements.clone());
        let fitted = mirror_descent(
            &domain,
            &spec,
            SolverOpts {
                iters: 40,
                stepsize: Some(0.1),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(loss_at(&fitted, &measurements).is_finite());
    }

    #[test]
    fn lbfgs_reduces_loss() {
        let (domain, measurements) = fixture();
        let spec = LossSpec::from(measurements.clone());
        let start = lbfgs(
            &domain,
            &spec,
            SolverOpts {
                iters: 0,
                ..Default::default()
            },
        )
        .unwrap();
        let fitted = lbfgs(
            &domain,
            &spec,
            SolverOpts {
                iters: 40,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(loss_at(&fitted, &measurements) < loss_at(&start, &measurements));
    }

    #[test]
    fn accelerated_solvers_reduce_loss() {
        let (domain, measurements) = fixture();
        let spec = LossSpec::from(measurements.clone());
        let start = mirror_descent(
            &domain,
            &spec,
            SolverOpts {
                iters: 0,
                ..Default::default()
            },
        )
        .unwrap();
        let start_loss = loss_at(&start, &measurements);
        // Gradient of the L2 measurement loss is (1/sigma)-Lipschitz.
        let lipschitz = 1.0 / 0.5;

        let da = dual_averaging(
            &domain,
            &spec,
            lipschitz,
            SolverOpts {
                iters: 80,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(loss_at(&da, &measurements) < start_loss);

        let ig = interior_gradient(
            &domain,
            &spec,
            lipschitz,
            SolverOpts {
                iters: 80,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(loss_at(&ig, &measurements) < start_loss);
    }

    #[test]
    fn custom_loss_requires_total() {
        let (domain, measurements) = fixture();
        let custom = LossSpec::custom(MeasurementLoss::new(measurements));
        let err = mirror_descent(&domain, &custom, SolverOpts::default());
        assert!(matches!(err, Err(Error::ConfigError { .. })));
    }

    #[test]
    fn callback_sees_every_iteration() {
        let (domain, measurements) = fixture();
        let spec = LossSpec::from(measurements);
        let seen = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let sink = seen.clone();
        let _ = mirror_descent(
            &domain,
            &spec,
            SolverOpts {
                iters: 7,
                callback: Some(Box::new(move |args| sink.borrow_mut().push(args.step))),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(*seen.borrow(), (1..=7).collect::<Vec<_>>());
    }

    #[test]
    fn mle_recovers_marginals() {
        let domain = Domain::new(["a", "b"], vec![2, 2]).unwrap();
        let cliques = vec![Clique::new(["a", "b"])];
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let theta = CliqueVector::normal(&domain, &cliques, &mut rng).unwrap();
        let oracle = MessagePassing::new(&domain, &cliques).unwrap();
        let target = oracle.marginals(&theta, 20.0).unwrap();

        let fitted = mle_from_marginals(&target, 20.0).unwrap();
        let mu = fitted.marginals();
        let mut l1 = 0.0;
        for (cl, f) in target.iter() {
            let g = mu.get(cl).unwrap().datavector();
            for (x, y) in f.datavector().iter().zip(g.iter()) {
                l1 += (x - y).abs();
            }
        }
        assert!(l1 < 2.0, "L1 distance {l1} too large");
    }
}
