//! The fitted graphical model.

use rand::Rng;

use dpsynth_core::{Clique, CliqueVector, Dataset, Domain, Factor, Result};

use crate::oracle::{MarginalOracle, MessagePassing};
use crate::synthetic;

/// An immutable bundle of potentials, induced marginals, and record total.
#[derive(Clone, Debug)]
pub struct GraphicalModel {
    potentials: CliqueVector,
    marginals: CliqueVector,
    total: f64,
}

impl GraphicalModel {
    /// Bundle fitted potentials with their marginals.
    pub fn new(potentials: CliqueVector, marginals: CliqueVector, total: f64) -> Self {
        Self {
            potentials,
            marginals,
            total,
        }
    }

    /// The log-linear parameters.
    pub fn potentials(&self) -> &CliqueVector {
        &self.potentials
    }

    /// The marginals induced by the potentials.
    pub fn marginals(&self) -> &CliqueVector {
        &self.marginals
    }

    /// The (known or estimated) number of records.
    pub fn total(&self) -> f64 {
        self.total
    }

    /// The model's domain (merge of the potentials' factor domains).
    pub fn domain(&self) -> Result<Domain> {
        self.potentials.domain()
    }

    /// The model's clique structure.
    pub fn cliques(&self) -> Vec<Clique> {
        self.potentials.cliques()
    }

    /// Marginal over an arbitrary clique.
    ///
    /// Returns the stored marginals' projection when a stored clique covers
    /// the query; otherwise falls back to exact inference by augmenting the
    /// clique structure with the query (zero potential) and re-running
    /// message passing.
    pub fn project(&self, clique: &Clique) -> Result<Factor> {
        if let Ok(f) = self.marginals.project(clique) {
            return Ok(f);
        }
        let domain = self.domain()?;
        let mut cliques = self.cliques();
        cliques.push(clique.clone());
        let oracle = MessagePassing::new(&domain, &cliques)?;
        oracle
            .marginals(&self.potentials, self.total)?
            .project(clique)
    }

    /// Sample synthetic rows from the model.
    ///
    /// `rows` defaults to the model's record total.
    pub fn synthetic_data<R: Rng>(&self, rows: Option<usize>, rng: &mut R) -> Result<Dataset> {
        let rows = rows.unwrap_or_else(|| self.total.round().max(1.0) as usize);
        synthetic::from_marginals(self, rows, rng)
    }
}
