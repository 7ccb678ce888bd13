//! Core types for differentially-private synthetic data generation.
//!
//! This crate provides the data model shared by the estimation and
//! mechanism crates: attribute domains, cliques, dense factors, datasets,
//! and the clique-vector algebra used to represent a high-dimensional
//! distribution through overlapping low-dimensional projections.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod clique;
pub mod clique_vector;
pub mod dataset;
pub mod domain;
pub mod error;
pub mod factor;

pub use clique::Clique;
pub use clique_vector::CliqueVector;
pub use dataset::Dataset;
pub use domain::Domain;
pub use error::{Error, Result};
pub use factor::Factor;

/// Common imports for downstream users.
pub mod prelude {
    pub use crate::{Clique, CliqueVector, Dataset, Domain, Error, Factor, Result};
}
