//! Workload compilation and model-size-aware candidate filtering.

use std::collections::BTreeMap;

use dpsynth_core::{Clique, Domain, Result};
use dpsynth_estimation::{GraphicalModel, JunctionTree};

/// A weighted set of target cliques.
pub type Workload = Vec<(Clique, f64)>;

/// All non-empty subsets of the given cliques, in canonical order.
pub fn downward_closure(cliques: &[Clique]) -> Vec<Clique> {
    let mut out: std::collections::BTreeSet<Clique> = std::collections::BTreeSet::new();
    for cl in cliques {
        let attrs = cl.attrs();
        let n = attrs.len();
        for mask in 1u64..(1u64 << n) {
            let subset = (0..n).filter(|i| mask & (1 << i) != 0).map(|i| attrs[i].clone());
            out.insert(Clique::new(subset));
        }
    }
    out.into_iter().collect()
}

/// Score every candidate in the downward closure of the workload.
///
/// A candidate's score is the weight-scaled attribute overlap with each
/// workload clique, a proxy for how useful measuring the candidate is for
/// answering the workload. Duplicate workload cliques keep their last
/// weight.
pub fn compile_workload(workload: &[(Clique, f64)]) -> BTreeMap<Clique, f64> {
    let mut weights: BTreeMap<Clique, f64> = BTreeMap::new();
    for (cl, wt) in workload {
        weights.insert(cl.clone(), *wt);
    }
    let workload_cliques: Vec<Clique> = weights.keys().cloned().collect();
    downward_closure(&workload_cliques)
        .into_iter()
        .map(|candidate| {
            let score: f64 = weights
                .iter()
                .map(|(wcl, wt)| wt * candidate.intersection_size(wcl) as f64)
                .sum();
            (candidate, score)
        })
        .collect()
}

/// Junction-tree-estimated model size in megabytes for a clique structure.
pub fn hypothetical_model_size(domain: &Domain, cliques: &[Clique]) -> Result<f64> {
    Ok(JunctionTree::build(domain, cliques)?.size_mb())
}

/// Retain the candidates that are affordable to model.
///
/// A candidate survives when adding it to the model's cliques keeps the
/// triangulated model size within `size_limit` megabytes, or when it is
/// already covered by the downward closure of the model's cliques (free to
/// model). Sizes are computed against `domain` so candidates outside the
/// model's measured attributes remain scoreable.
pub fn filter_candidates(
    candidates: &BTreeMap<Clique, f64>,
    model: &GraphicalModel,
    domain: &Domain,
    size_limit: f64,
) -> Result<BTreeMap<Clique, f64>> {
    let model_cliques = model.cliques();
    let free: std::collections::BTreeSet<Clique> =
        downward_closure(&model_cliques).into_iter().collect();
    let mut out = BTreeMap::new();
    for (cl, &score) in candidates {
        let affordable = if free.contains(cl) {
            true
        } else {
            let mut cliques = model_cliques.clone();
            cliques.push(cl.clone());
            hypothetical_model_size(domain, &cliques)? <= size_limit
        };
        if affordable {
            out.insert(cl.clone(), score);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dpsynth_core::CliqueVector;
    use dpsynth_estimation::{MarginalOracle, MessagePassing};

    #[test]
    fn downward_closure_orders_by_size() {
        let closure = downward_closure(&[Clique::new(["a", "b"]), Clique::new(["b", "c"])]);
        assert_eq!(
            closure,
            vec![
                Clique::single("a"),
                Clique::single("b"),
                Clique::single("c"),
                Clique::new(["a", "b"]),
                Clique::new(["b", "c"]),
            ]
        );
    }

    #[test]
    fn workload_scores_count_weighted_overlap() {
        let workload = vec![(Clique::new(["a", "b"]), 1.0)];
        let scored = compile_workload(&workload);
        assert_eq!(scored.len(), 3);
        assert_eq!(scored[&Clique::single("a")], 1.0);
        assert_eq!(scored[&Clique::single("b")], 1.0);
        assert_eq!(scored[&Clique::new(["a", "b"])], 2.0);
    }

    #[test]
    fn hypothetical_size_counts_maximal_clique_cells() {
        let domain = Domain::new(["a", "b", "c"], vec![8, 8, 8]).unwrap();
        let cliques = [Clique::new(["a", "b"]), Clique::new(["b", "c"])];
        let mb = hypothetical_model_size(&domain, &cliques).unwrap();
        let expected = (64.0 + 64.0) * 8.0 / (1u64 << 20) as f64;
        assert!((mb - expected).abs() < 1e-12);
    }

    #[test]
    fn filtering_keeps_free_and_affordable_cliques() {
        let domain = Domain::new(["a", "b", "c"], vec![16, 16, 16]).unwrap();
        let model_cliques = vec![Clique::new(["a", "b"])];
        let theta = CliqueVector::zeros(&domain, &model_cliques).unwrap();
        let oracle = MessagePassing::new(&domain, &model_cliques).unwrap();
        let marginals = oracle.marginals(&theta, 1.0).unwrap();
        let model = GraphicalModel::new(theta, marginals, 1.0);

        let mut candidates = BTreeMap::new();
        candidates.insert(Clique::single("a"), 1.0);
        candidates.insert(Clique::new(["a", "c"]), 2.0);

        // A tiny limit only keeps the free clique (a) ⊆ (a, b).
        let tight = filter_candidates(&candidates, &model, &domain, 1e-6).unwrap();
        assert!(tight.contains_key(&Clique::single("a")));
        assert!(!tight.contains_key(&Clique::new(["a", "c"])));

        // A generous limit keeps everything.
        let loose = filter_candidates(&candidates, &model, &domain, 100.0).unwrap();
        assert_eq!(loose.len(), 2);
    }
}
