//! Facade crate re-exporting the stable dpsynth API.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use dpsynth_core as core;
pub use dpsynth_estimation as estimation;
pub use dpsynth_mechanisms as mechanisms;

pub use dpsynth_core::{Clique, CliqueVector, Dataset, Domain, Error, Factor, Result};
pub use dpsynth_estimation::{
    dual_averaging, from_marginals, interior_gradient, lbfgs, minimum_variance_unbiased_total,
    mirror_descent, mle_from_marginals, CallbackArgs, GraphicalModel, JunctionTree,
    LinearMeasurement, LossSpec, MarginalLoss, MarginalOracle, MeasurementLoss, MessagePassing,
    NegativeLogLikelihood, Norm, Query, SolverOpts,
};
pub use dpsynth_mechanisms::{
    cdp_delta, cdp_rho, compile_workload, downward_closure, exponential_mechanism,
    filter_candidates, gaussian_mechanism, hypothetical_model_size, Aim, AimOptions, AimRun,
    BudgetTracker, Workload,
};

/// Convenience prelude covering the common building blocks.
pub mod prelude {
    pub use dpsynth_core::prelude::*;
    pub use dpsynth_estimation::prelude::*;
    pub use dpsynth_mechanisms::prelude::*;
}
