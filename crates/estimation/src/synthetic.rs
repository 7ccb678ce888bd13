//! Synthetic-row sampling from a fitted model.
//!
//! Exact ancestral sampling over the junction tree: the root clique's joint
//! marginal is sampled directly, then each child clique's new attributes
//! are sampled conditioned on the values already drawn for its separator.

use std::collections::HashMap;

use ndarray::Array2;
use rand::Rng;

use dpsynth_core::{Dataset, Error, Factor, Result};

use crate::model::GraphicalModel;
use crate::oracle::MessagePassing;

/// Sample `rows` synthetic records from the model's distribution.
pub fn from_marginals<R: Rng>(model: &GraphicalModel, rows: usize, rng: &mut R) -> Result<Dataset> {
    let domain = model.domain()?;
    let oracle = MessagePassing::new(&domain, &model.cliques())?;
    let beliefs = oracle.junction_marginals(model.potentials(), model.total())?;
    let tree = oracle.tree();

    let n_attrs = domain.len();
    let mut columns: Vec<Option<Vec<usize>>> = vec![None; n_attrs];

    for &node in tree.order() {
        let belief = &beliefs[node];
        let node_dom = belief.domain();

        // Split the node's axes into already-sampled (conditioning) axes
        // and new axes still to be drawn.
        let mut known_axes = Vec::new();
        let mut new_axes = Vec::new();
        let mut attr_cols = Vec::with_capacity(node_dom.len());
        for (axis, attr) in node_dom.attrs().iter().enumerate() {
            let col = domain
                .index_of(attr)
                .ok_or_else(|| Error::UnknownAttribute { attr: attr.clone() })?;
            attr_cols.push(col);
            if columns[col].is_some() {
                known_axes.push(axis);
            } else {
                new_axes.push(axis);
            }
        }
        if new_axes.is_empty() {
            continue;
        }
        let new_shape: Vec<usize> = new_axes.iter().map(|&a| node_dom.shape()[a]).collect();
        let new_size: usize = new_shape.iter().product();
        let values = cell_weights(belief);

        let mut new_cols: Vec<Vec<usize>> = vec![vec![0usize; rows]; new_axes.len()];

        if known_axes.is_empty() {
            // Root of a component: sample the joint directly.
            for r in 0..rows {
                let flat = sample_categorical(&values, rng);
                let idx = unravel(flat, node_dom.shape());
                for (j, &a) in new_axes.iter().enumerate() {
                    new_cols[j][r] = idx[a];
                }
            }
        } else {
            // Group rows by their conditioning assignment, then sample each
            // group from the matching slice of the belief.
            let mut groups: HashMap<Vec<usize>, Vec<usize>> = HashMap::new();
            for r in 0..rows {
                let key: Vec<usize> = known_axes
                    .iter()
                    .map(|&a| match &columns[attr_cols[a]] {
                        Some(col) => col[r],
                        None => 0,
                    })
                    .collect();
                groups.entry(key).or_default().push(r);
            }

            let mut full_idx = vec![0usize; node_dom.len()];
            for (key, members) in groups {
                for (&a, &v) in known_axes.iter().zip(key.iter()) {
                    full_idx[a] = v;
                }
                let mut weights = Vec::with_capacity(new_size);
                for flat in 0..new_size {
                    let idx = unravel(flat, &new_shape);
                    for (j, &a) in new_axes.iter().enumerate() {
                        full_idx[a] = idx[j];
                    }
                    weights.push(values[flatten(&full_idx, node_dom.shape())]);
                }
                for &r in &members {
                    let flat = sample_categorical(&weights, rng);
                    let idx = unravel(flat, &new_shape);
                    for (j, _) in new_axes.iter().enumerate() {
                        new_cols[j][r] = idx[j];
                    }
                }
            }
        }

        for (j, &a) in new_axes.iter().enumerate() {
            columns[attr_cols[a]] = Some(std::mem::take(&mut new_cols[j]));
        }
    }

    let mut records = Array2::zeros((rows, n_attrs));
    for (col, values) in columns.into_iter().enumerate() {
        let values = values.ok_or_else(|| {
            Error::numerical("an attribute was not covered by any junction-tree clique")
        })?;
        for (r, &v) in values.iter().enumerate() {
            records[[r, col]] = v;
        }
    }
    Dataset::new(domain, records)
}

/// Non-negative sampling weights from a belief's cells.
fn cell_weights(f: &Factor) -> Vec<f64> {
    f.datavector()
        .iter()
        .map(|&v| if v.is_finite() && v > 0.0 { v } else { 0.0 })
        .collect()
}

fn sample_categorical<R: Rng>(weights: &[f64], rng: &mut R) -> usize {
    let total: f64 = weights.iter().sum();
    if !(total > 0.0) || weights.is_empty() {
        if weights.is_empty() {
            return 0;
        }
        return rng.gen_range(0..weights.len());
    }
    let mut u = rng.gen::<f64>() * total;
    for (i, w) in weights.iter().enumerate() {
        u -= w;
        if u <= 0.0 {
            return i;
        }
    }
    weights.len() - 1
}

/// Row-major multi-index of a flat offset.
fn unravel(mut flat: usize, shape: &[usize]) -> Vec<usize> {
    let mut idx = vec![0usize; shape.len()];
    for j in (0..shape.len()).rev() {
        idx[j] = flat % shape[j];
        flat /= shape[j];
    }
    idx
}

/// Row-major flat offset of a multi-index.
fn flatten(idx: &[usize], shape: &[usize]) -> usize {
    let mut flat = 0usize;
    for (i, &v) in idx.iter().enumerate() {
        flat = flat * shape[i] + v;
    }
    flat
}
