//! Graphical-model estimation from marginal-based loss functions.
//!
//! This crate turns noisy marginal measurements into a fitted
//! [`GraphicalModel`]: junction-tree triangulation, exact (and
//! differentiable) marginal inference, marginal loss functions, a suite of
//! interchangeable solvers, and synthetic-row sampling from the result.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod junction_tree;
pub mod loss;
pub mod model;
pub mod optimize;
pub mod oracle;
pub mod synthetic;

pub use junction_tree::JunctionTree;
pub use loss::{
    minimum_variance_unbiased_total, LinearMeasurement, MarginalLoss, MeasurementLoss,
    NegativeLogLikelihood, Norm, Query,
};
pub use model::GraphicalModel;
pub use optimize::{
    dual_averaging, interior_gradient, lbfgs, mirror_descent, mle_from_marginals, CallbackArgs,
    LossSpec, SolverOpts,
};
pub use oracle::{MarginalOracle, MessagePassing};
pub use synthetic::from_marginals;

/// Common imports for downstream users.
pub mod prelude {
    pub use crate::{
        dual_averaging, from_marginals, interior_gradient, lbfgs, minimum_variance_unbiased_total,
        mirror_descent, mle_from_marginals, CallbackArgs, GraphicalModel, JunctionTree,
        LinearMeasurement, LossSpec, MarginalLoss, MarginalOracle, MeasurementLoss, MessagePassing,
        NegativeLogLikelihood, Norm, Query, SolverOpts,
    };
}
