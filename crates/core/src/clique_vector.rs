//! The clique-vector algebra.
//!
//! A [`CliqueVector`] is a mapping from cliques to factors representing
//! either the potentials or the marginals of one implicit joint
//! distribution, defined only through these low-dimensional projections.
//! It behaves as an algebraic vector: elementwise arithmetic across
//! matching keys, scalar broadcasting, and a dot product.
//!
//! Binary operations with another vector require identical key sets and
//! panic otherwise; a mismatch is a logic error in the caller, not a data
//! condition. Coverage misses and domain conflicts are reported as errors.

use std::collections::BTreeMap;

use rand::Rng;

use crate::clique::Clique;
use crate::dataset::Dataset;
use crate::domain::Domain;
use crate::error::{Error, Result};
use crate::factor::Factor;

/// A mapping from clique to factor, with vector-space operations.
#[derive(Clone, Debug)]
pub struct CliqueVector {
    factors: BTreeMap<Clique, Factor>,
}

impl CliqueVector {
    fn build(
        domain: &Domain,
        cliques: &[Clique],
        mut make: impl FnMut(Domain) -> Factor,
    ) -> Result<Self> {
        let mut factors = BTreeMap::new();
        for cl in cliques {
            let sub = domain.project(cl)?;
            factors.entry(cl.clone()).or_insert_with(|| make(sub));
        }
        Ok(Self { factors })
    }

    /// One zero factor per clique.
    pub fn zeros(domain: &Domain, cliques: &[Clique]) -> Result<Self> {
        Self::build(domain, cliques, Factor::zeros)
    }

    /// One all-ones factor per clique.
    pub fn ones(domain: &Domain, cliques: &[Clique]) -> Result<Self> {
        Self::build(domain, cliques, Factor::ones)
    }

    /// One uniform probability factor per clique.
    pub fn uniform(domain: &Domain, cliques: &[Clique]) -> Result<Self> {
        Self::build(domain, cliques, Factor::uniform)
    }

    /// One uniform(0, 1) random factor per clique.
    pub fn random<R: Rng>(domain: &Domain, cliques: &[Clique], rng: &mut R) -> Result<Self> {
        Self::build(domain, cliques, |d| Factor::random(d, rng))
    }

    /// One standard-normal random factor per clique.
    pub fn normal<R: Rng>(domain: &Domain, cliques: &[Clique], rng: &mut R) -> Result<Self> {
        Self::build(domain, cliques, |d| Factor::normal(d, rng))
    }

    /// Empirical marginals of a dataset, one per clique.
    pub fn from_data(data: &Dataset, cliques: &[Clique]) -> Result<Self> {
        let mut factors = BTreeMap::new();
        for cl in cliques {
            factors.insert(cl.clone(), data.project(cl)?);
        }
        Ok(Self { factors })
    }

    /// Assemble from explicit (clique, factor) entries; duplicate keys are
    /// accumulated by addition.
    pub fn from_entries(entries: impl IntoIterator<Item = (Clique, Factor)>) -> Self {
        let mut factors: BTreeMap<Clique, Factor> = BTreeMap::new();
        for (cl, f) in entries {
            match factors.entry(cl) {
                std::collections::btree_map::Entry::Occupied(mut slot) => {
                    slot.get_mut().add_assign(&f)
                }
                std::collections::btree_map::Entry::Vacant(slot) => {
                    slot.insert(f);
                }
            }
        }
        Self { factors }
    }

    /// Zero vector with the same keys and per-key domains as `other`.
    pub fn zeros_like(other: &CliqueVector) -> Self {
        let factors = other
            .factors
            .iter()
            .map(|(cl, f)| (cl.clone(), Factor::zeros(f.domain().clone())))
            .collect();
        Self { factors }
    }

    /// The merged domain of all stored factors; fails on cardinality
    /// conflicts between hand-assembled entries.
    pub fn domain(&self) -> Result<Domain> {
        let mut iter = self.factors.values();
        let first = iter
            .next()
            .ok_or_else(|| Error::invalid("empty clique vector has no domain"))?;
        let mut dom = first.domain().clone();
        for f in iter {
            dom = Domain::merge(&dom, f.domain())?;
        }
        Ok(dom)
    }

    /// The stored cliques, in canonical order.
    pub fn cliques(&self) -> Vec<Clique> {
        self.factors.keys().cloned().collect()
    }

    /// Number of stored cliques.
    pub fn len(&self) -> usize {
        self.factors.len()
    }

    /// True when no cliques are stored.
    pub fn is_empty(&self) -> bool {
        self.factors.is_empty()
    }

    /// Look up the factor stored for an exact clique key.
    pub fn get(&self, clique: &Clique) -> Option<&Factor> {
        self.factors.get(clique)
    }

    /// Iterate over (clique, factor) pairs in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = (&Clique, &Factor)> {
        self.factors.iter()
    }

    /// The first stored clique (in canonical order) covering `clique`.
    pub fn covering_clique(&self, clique: &Clique) -> Option<&Clique> {
        self.factors.keys().find(|cl| clique.is_subset_of(cl))
    }

    /// Project onto a clique covered by some stored key.
    ///
    /// When several stored cliques cover the query, the smallest (then
    /// lexicographically first) wins.
    pub fn project(&self, clique: &Clique) -> Result<Factor> {
        match self.covering_clique(clique) {
            Some(key) => self.factors[key].project(clique),
            None => Err(Error::Coverage {
                clique: clique.to_string(),
            }),
        }
    }

    /// Accumulate another vector into this one for warm-starting.
    ///
    /// Each of `other`'s factors is added into the first stored clique that
    /// covers it; factors with no covering clique are silently dropped so a
    /// smaller prior model can seed a larger potential set.
    pub fn combine(&mut self, other: &CliqueVector) {
        for (cl, f) in other.factors.iter() {
            let target = self
                .factors
                .keys()
                .find(|key| cl.is_subset_of(key))
                .cloned();
            if let Some(key) = target {
                if let Some(slot) = self.factors.get_mut(&key) {
                    slot.add_assign(f);
                }
            }
        }
    }

    /// Expand onto a larger clique set over `domain`, carrying this
    /// vector's content via [`CliqueVector::combine`].
    pub fn expand(&self, domain: &Domain, cliques: &[Clique]) -> Result<CliqueVector> {
        let mut out = CliqueVector::zeros(domain, cliques)?;
        out.combine(self);
        Ok(out)
    }

    /// Elementwise exponential.
    pub fn exp(&self) -> CliqueVector {
        self.map(|f| f.exp())
    }

    /// Elementwise natural logarithm.
    pub fn log(&self) -> CliqueVector {
        self.map(|f| f.log())
    }

    /// Scale every factor by a constant.
    pub fn scale(&self, c: f64) -> CliqueVector {
        self.map(|f| f.scale(c))
    }

    /// Normalize every factor to a target total.
    pub fn normalize(&self, total: f64, log: bool) -> CliqueVector {
        self.map(|f| f.normalize(total, log))
    }

    fn map(&self, f: impl Fn(&Factor) -> Factor) -> CliqueVector {
        let factors = self
            .factors
            .iter()
            .map(|(cl, fac)| (cl.clone(), f(fac)))
            .collect();
        CliqueVector { factors }
    }

    fn assert_same_keys(&self, other: &CliqueVector, op: &str) {
        if !self.factors.keys().eq(other.factors.keys()) {
            panic!("clique sets disagree in CliqueVector {op}");
        }
    }

    /// Sum over keys of the elementwise product reduced to a scalar.
    ///
    /// # Panics
    /// Panics when the key sets differ.
    pub fn dot(&self, other: &CliqueVector) -> f64 {
        self.assert_same_keys(other, "dot");
        self.factors
            .iter()
            .map(|(cl, f)| f.dot(&other.factors[cl]))
            .sum()
    }

    /// Sum of per-clique domain sizes (a memory-cost proxy).
    pub fn size(&self) -> usize {
        self.factors.values().map(Factor::size).sum()
    }
}

impl std::ops::Add<&CliqueVector> for &CliqueVector {
    type Output = CliqueVector;

    /// # Panics
    /// Panics when the key sets differ.
    fn add(self, rhs: &CliqueVector) -> CliqueVector {
        self.assert_same_keys(rhs, "addition");
        let factors = self
            .factors
            .iter()
            .map(|(cl, f)| (cl.clone(), f + &rhs.factors[cl]))
            .collect();
        CliqueVector { factors }
    }
}

impl std::ops::Sub<&CliqueVector> for &CliqueVector {
    type Output = CliqueVector;

    /// # Panics
    /// Panics when the key sets differ.
    fn sub(self, rhs: &CliqueVector) -> CliqueVector {
        self.assert_same_keys(rhs, "subtraction");
        let factors = self
            .factors
            .iter()
            .map(|(cl, f)| (cl.clone(), f - &rhs.factors[cl]))
            .collect();
        CliqueVector { factors }
    }
}
