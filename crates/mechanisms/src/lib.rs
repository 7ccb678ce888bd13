//! Differentially-private mechanisms for synthetic-data generation.
//!
//! zCDP budget accounting, the Gaussian and exponential mechanisms,
//! workload compilation with model-size-aware candidate filtering, and the
//! AIM adaptive round loop that ties them together.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aim;
pub mod budget;
pub mod noise;
pub mod workload;

pub use aim::{Aim, AimOptions, AimRun};
pub use budget::{cdp_delta, cdp_rho, BudgetTracker};
pub use noise::{exponential_mechanism, gaussian_mechanism};
pub use workload::{
    compile_workload, downward_closure, filter_candidates, hypothetical_model_size, Workload,
};

/// Common imports for downstream users.
pub mod prelude {
    pub use crate::{
        cdp_delta, cdp_rho, compile_workload, downward_closure, exponential_mechanism,
        filter_candidates, gaussian_mechanism, hypothetical_model_size, Aim, AimOptions, AimRun,
        BudgetTracker, Workload,
    };
}
