//! Dense factors over attribute sub-domains.
//!
//! A factor stores one value per assignment of its domain's attributes,
//! axes in domain order. Binary operations align operands by attribute name
//! (merging domains and broadcasting), so factors over different but
//! compatible sub-domains compose freely.

use ndarray::{Array1, ArrayD, Dimension, IxDyn};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::clique::Clique;
use crate::domain::Domain;
use crate::error::{Error, Result};

/// A dense function over assignments to a sub-domain.
#[derive(Clone, Debug)]
pub struct Factor {
    domain: Domain,
    values: ArrayD<f64>,
}

impl Factor {
    /// Wrap an existing value table; shape must match the domain.
    pub fn from_values(domain: Domain, values: ArrayD<f64>) -> Result<Self> {
        if values.shape() != domain.shape() {
            return Err(Error::invalid(format!(
                "factor values of shape {:?} do not match domain shape {:?}",
                values.shape(),
                domain.shape()
            )));
        }
        Ok(Self { domain, values })
    }

    /// Build a factor from a flat (row-major) data vector.
    pub fn from_datavector(domain: Domain, data: Vec<f64>) -> Result<Self> {
        let values = ArrayD::from_shape_vec(IxDyn(domain.shape()), data)
            .map_err(|e| Error::invalid(format!("datavector: {e}")))?;
        Ok(Self { domain, values })
    }

    /// All-zero factor.
    pub fn zeros(domain: Domain) -> Self {
        let values = ArrayD::zeros(IxDyn(domain.shape()));
        Self { domain, values }
    }

    /// All-one factor.
    pub fn ones(domain: Domain) -> Self {
        Self::constant(domain, 1.0)
    }

    /// Constant factor.
    pub fn constant(domain: Domain, value: f64) -> Self {
        let values = ArrayD::from_elem(IxDyn(domain.shape()), value);
        Self { domain, values }
    }

    /// Uniform probability factor (sums to one).
    pub fn uniform(domain: Domain) -> Self {
        let size = domain.total_size().max(1);
        Self::constant(domain, 1.0 / size as f64)
    }

    /// Factor with independent uniform(0, 1) entries.
    pub fn random<R: Rng>(domain: Domain, rng: &mut R) -> Self {
        let size = domain.total_size();
        let data: Vec<f64> = (0..size).map(|_| rng.gen::<f64>()).collect();
        let values = ArrayD::from_shape_vec(IxDyn(domain.shape()), data)
            .unwrap_or_else(|_| ArrayD::zeros(IxDyn(domain.shape())));
        Self { domain, values }
    }

    /// Factor with independent standard-normal entries.
    pub fn normal<R: Rng>(domain: Domain, rng: &mut R) -> Self {
        let size = domain.total_size();
        let data: Vec<f64> = (0..size).map(|_| rng.sample(StandardNormal)).collect();
        let values = ArrayD::from_shape_vec(IxDyn(domain.shape()), data)
            .unwrap_or_else(|_| ArrayD::zeros(IxDyn(domain.shape())));
        Self { domain, values }
    }

    /// The factor's domain.
    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    /// The raw value table.
    pub fn values(&self) -> &ArrayD<f64> {
        &self.values
    }

    /// Number of cells.
    pub fn size(&self) -> usize {
        self.values.len()
    }

    /// Flatten to a 1-D vector in row-major domain order.
    pub fn datavector(&self) -> Array1<f64> {
        Array1::from_iter(self.values.iter().copied())
    }

    /// Sum of all cells.
    pub fn sum(&self) -> f64 {
        self.values.sum()
    }

    /// Elementwise exponential.
    pub fn exp(&self) -> Factor {
        Factor {
            domain: self.domain.clone(),
            values: self.values.mapv(f64::exp),
        }
    }

    /// Elementwise natural logarithm.
    pub fn log(&self) -> Factor {
        Factor {
            domain: self.domain.clone(),
            values: self.values.mapv(f64::ln),
        }
    }

    /// Add a constant to every cell.
    pub fn shift(&self, c: f64) -> Factor {
        Factor {
            domain: self.domain.clone(),
            values: self.values.mapv(|v| v + c),
        }
    }

    /// Scale every cell by a constant.
    pub fn scale(&self, c: f64) -> Factor {
        Factor {
            domain: self.domain.clone(),
            values: self.values.mapv(|v| v * c),
        }
    }

    /// Sum of the elementwise product with another factor.
    pub fn dot(&self, other: &Factor) -> f64 {
        (self * other).sum()
    }

    /// Positions of the clique's attributes within this factor's axes,
    /// together with the projected target domain.
    fn projection_plan(&self, clique: &Clique) -> Result<(Domain, Vec<usize>)> {
        let mut pos = Vec::with_capacity(clique.len());
        for attr in clique.iter() {
            let i = self
                .domain
                .index_of(attr)
                .ok_or_else(|| Error::UnknownAttribute {
                    attr: attr.to_string(),
                })?;
            pos.push(i);
        }
        let target = self.domain.project(clique)?;
        Ok((target, pos))
    }

    /// Marginalize onto a subset clique by summation.
    pub fn project(&self, clique: &Clique) -> Result<Factor> {
        let (target, pos) = self.projection_plan(clique)?;
        let mut out = ArrayD::zeros(IxDyn(target.shape()));
        let mut dst = vec![0usize; pos.len()];
        for (idx, &v) in self.values.indexed_iter() {
            let idx = idx.slice();
            for (j, &p) in pos.iter().enumerate() {
                dst[j] = idx[p];
            }
            out[&dst[..]] += v;
        }
        Ok(Factor {
            domain: target,
            values: out,
        })
    }

    /// Marginalize onto a subset clique in log space (stable log-sum-exp).
    pub fn logsumexp_onto(&self, clique: &Clique) -> Result<Factor> {
        let (target, pos) = self.projection_plan(clique)?;
        let mut mx = ArrayD::from_elem(IxDyn(target.shape()), f64::NEG_INFINITY);
        let mut dst = vec![0usize; pos.len()];
        for (idx, &v) in self.values.indexed_iter() {
            let idx = idx.slice();
            for (j, &p) in pos.iter().enumerate() {
                dst[j] = idx[p];
            }
            let slot = &mut mx[&dst[..]];
            if v > *slot {
                *slot = v;
            }
        }
        let mut acc = ArrayD::zeros(IxDyn(target.shape()));
        for (idx, &v) in self.values.indexed_iter() {
            let idx = idx.slice();
            for (j, &p) in pos.iter().enumerate() {
                dst[j] = idx[p];
            }
            let m = mx[&dst[..]];
            if m.is_finite() {
                acc[&dst[..]] += (v - m).exp();
            }
        }
        let values = ndarray::Zip::from(&mx)
            .and(&acc)
            .map_collect(|&m, &a: &f64| if m.is_finite() { m + a.ln() } else { m });
        Ok(Factor {
            domain: target,
            values,
        })
    }

    /// Log-sum-exp over every cell.
    pub fn logsumexp_all(&self) -> f64 {
        let m = self
            .values
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        if !m.is_finite() {
            return m;
        }
        m + self.values.iter().map(|&v| (v - m).exp()).sum::<f64>().ln()
    }

    /// Broadcast into a superset domain.
    pub fn expand(&self, target: &Domain) -> Result<Factor> {
        for (attr, &n) in self.domain.attrs().iter().zip(self.domain.shape()) {
            let m = target.cardinality(attr)?;
            if m != n {
                return Err(Error::DomainMismatch {
                    attr: attr.clone(),
                    left: n,
                    right: m,
                });
            }
        }
        let src_pos: Vec<Option<usize>> = target
            .attrs()
            .iter()
            .map(|a| self.domain.index_of(a))
            .collect();
        let mut out = ArrayD::zeros(IxDyn(target.shape()));
        let mut src = vec![0usize; self.domain.len()];
        for (idx, slot) in out.indexed_iter_mut() {
            let idx = idx.slice();
            for (axis, sp) in src_pos.iter().enumerate() {
                if let Some(s) = *sp {
                    src[s] = idx[axis];
                }
            }
            *slot = self.values[&src[..]];
        }
        Ok(Factor {
            domain: target.clone(),
            values: out,
        })
    }

    /// Normalize to a target total, in linear or log space.
    pub fn normalize(&self, total: f64, log: bool) -> Factor {
        if log {
            let shift = self.logsumexp_all();
            Factor {
                domain: self.domain.clone(),
                values: self.values.mapv(|v| v - shift + total.ln()),
            }
        } else {
            let s = self.sum();
            if s > 0.0 && s.is_finite() {
                self.scale(total / s)
            } else {
                Factor::constant(self.domain.clone(), total / self.size().max(1) as f64)
            }
        }
    }

    /// Add another factor in place (operand domains are aligned by name).
    pub fn add_assign(&mut self, other: &Factor) {
        *self = &*self + other;
    }

    fn zip_with(&self, other: &Factor, f: impl Fn(f64, f64) -> f64) -> Factor {
        let dom = match Domain::merge(&self.domain, &other.domain) {
            Ok(d) => d,
            Err(e) => panic!("factor domains disagree: {e}"),
        };
        let a = match self.expand(&dom) {
            Ok(a) => a,
            Err(e) => panic!("factor expansion failed: {e}"),
        };
        let b = match other.expand(&dom) {
            Ok(b) => b,
            Err(e) => panic!("factor expansion failed: {e}"),
        };
        let values = ndarray::Zip::from(&a.values)
            .and(&b.values)
            .map_collect(|&x, &y| f(x, y));
        Factor {
            domain: dom,
            values,
        }
    }
}

impl std::ops::Add<&Factor> for &Factor {
    type Output = Factor;

    fn add(self, rhs: &Factor) -> Factor {
        self.zip_with(rhs, |a, b| a + b)
    }
}

impl std::ops::Sub<&Factor> for &Factor {
    type Output = Factor;

    fn sub(self, rhs: &Factor) -> Factor {
        self.zip_with(rhs, |a, b| a - b)
    }
}

impl std::ops::Mul<&Factor> for &Factor {
    type Output = Factor;

    fn mul(self, rhs: &Factor) -> Factor {
        self.zip_with(rhs, |a, b| a * b)
    }
}

impl std::ops::Div<&Factor> for &Factor {
    type Output = Factor;

    fn div(self, rhs: &Factor) -> Factor {
        self.zip_with(rhs, |a, b| a / b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domain_ab() -> Domain {
        Domain::new(["a", "b"], vec![2, 3]).unwrap()
    }

    #[test]
    fn project_sums_out_axes() {
        let f = Factor::from_datavector(domain_ab(), (0..6).map(|v| v as f64).collect()).unwrap();
        let pa = f.project(&Clique::single("a")).unwrap();
        assert_eq!(pa.datavector().to_vec(), vec![3.0, 12.0]);
        let pb = f.project(&Clique::single("b")).unwrap();
        assert_eq!(pb.datavector().to_vec(), vec![3.0, 5.0, 7.0]);
        assert!(f.project(&Clique::single("zz")).is_err());
    }

    #[test]
    fn binary_ops_align_by_name() {
        let dom_ba = Domain::new(["b", "a"], vec![3, 2]).unwrap();
        let f = Factor::from_datavector(domain_ab(), vec![1.0; 6]).unwrap();
        let g = Factor::from_datavector(dom_ba, (0..6).map(|v| v as f64).collect()).unwrap();
        let h = &f + &g;
        // g[b=2, a=1] = 5 lands at h[a=1, b=2].
        assert_eq!(h.domain().attrs(), ["a", "b"]);
        let expected = 1.0 + 5.0;
        assert_eq!(h.values()[[1, 2]], expected);
    }

    #[test]
    fn expand_broadcasts() {
        let d = domain_ab();
        let fa = Factor::from_datavector(d.project(&Clique::single("a")).unwrap(), vec![1.0, 2.0])
            .unwrap();
        let big = fa.expand(&d).unwrap();
        assert_eq!(big.values()[[0, 2]], 1.0);
        assert_eq!(big.values()[[1, 0]], 2.0);
    }

    #[test]
    fn logsumexp_matches_direct_computation() {
        let f = Factor::from_datavector(domain_ab(), (0..6).map(|v| v as f64 / 2.0).collect())
            .unwrap();
        let lse = f.logsumexp_onto(&Clique::single("a")).unwrap();
        let direct = f.exp().project(&Clique::single("a")).unwrap().log();
        for (x, y) in lse.datavector().iter().zip(direct.datavector().iter()) {
            assert!((x - y).abs() < 1e-12);
        }
        let total = f.logsumexp_all();
        assert!((total - f.exp().sum().ln()).abs() < 1e-12);
    }

    #[test]
    fn normalize_targets_total() {
        let f = Factor::from_datavector(domain_ab(), (1..7).map(|v| v as f64).collect()).unwrap();
        assert!((f.normalize(10.0, false).sum() - 10.0).abs() < 1e-12);
        let log_norm = f.log().normalize(10.0, true);
        assert!((log_norm.exp().sum() - 10.0).abs() < 1e-9);
    }
}
