//! Error types shared across the dpsynth crates.

/// Errors that can occur while building or estimating models.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Two domains disagree on the cardinality of a shared attribute.
    #[error("domain mismatch: attribute `{attr}` has cardinality {left} vs {right}")]
    DomainMismatch {
        /// The conflicting attribute.
        attr: String,
        /// Cardinality on the left-hand side.
        left: usize,
        /// Cardinality on the right-hand side.
        right: usize,
    },

    /// An attribute was requested from a domain that does not contain it.
    #[error("unknown attribute `{attr}`")]
    UnknownAttribute {
        /// The missing attribute.
        attr: String,
    },

    /// No stored clique covers the requested projection.
    #[error("cannot project onto {clique}: no stored clique covers it")]
    Coverage {
        /// Rendered form of the uncovered clique.
        clique: String,
    },

    /// Invalid parameter provided.
    #[error("invalid parameter: {msg}")]
    InvalidParameters {
        /// Human-readable error description.
        msg: String,
    },

    /// Caller configuration error.
    #[error("configuration error: {msg}")]
    ConfigError {
        /// Human-readable error description.
        msg: String,
    },

    /// Numerical computation error.
    #[error("numerical error: {msg}")]
    NumericalError {
        /// Human-readable error description.
        msg: String,
    },

    /// A privacy-budget charge would exceed the configured total.
    #[error("privacy budget exhausted (requested rho={requested:.6}, remaining={remaining:.6})")]
    BudgetExhausted {
        /// The rho charge that was requested.
        requested: f64,
        /// The rho remaining before the charge.
        remaining: f64,
    },

    /// Malformed input data (CSV/JSON).
    #[error("parse error: {msg}")]
    ParseError {
        /// Human-readable error description.
        msg: String,
    },

    /// Underlying I/O failure.
    #[error("io error: {0}")]
    Io(
        /// The wrapped I/O error.
        #[from]
        std::io::Error,
    ),
}

/// Result type for dpsynth operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an invalid parameter error.
    pub fn invalid<S: Into<String>>(msg: S) -> Self {
        Self::InvalidParameters { msg: msg.into() }
    }

    /// Create a configuration error.
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::ConfigError { msg: msg.into() }
    }

    /// Create a numerical error.
    pub fn numerical<S: Into<String>>(msg: S) -> Self {
        Self::NumericalError { msg: msg.into() }
    }

    /// Create a parse error.
    pub fn parse<S: Into<String>>(msg: S) -> Self {
        Self::ParseError { msg: msg.into() }
    }
}
