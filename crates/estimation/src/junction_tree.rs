//! Junction-tree construction over a clique structure.
//!
//! The tree serves two roles: message-passing support for exact marginal
//! inference, and a memory-cost oracle (the summed cell count of the
//! maximal cliques bounds the size of the calibrated model). Construction
//! is fully deterministic: greedy minimum-fill elimination with ties broken
//! by domain order, and a Kruskal spanning tree with ties broken by node
//! index.

use std::collections::VecDeque;

use dpsynth_core::{Clique, Domain, Error, Result};

/// A tree (forest, for disconnected structures) of maximal cliques.
#[derive(Clone, Debug)]
pub struct JunctionTree {
    domain: Domain,
    nodes: Vec<Clique>,
    node_domains: Vec<Domain>,
    parent: Vec<Option<usize>>,
    separator: Vec<Clique>,
    children: Vec<Vec<usize>>,
    order: Vec<usize>,
}

impl JunctionTree {
    /// Triangulate the clique structure over `domain` and assemble the tree.
    pub fn build(domain: &Domain, cliques: &[Clique]) -> Result<Self> {
        let n = domain.len();
        let mut adj = vec![vec![false; n]; n];
        for cl in cliques {
            let mut idxs = Vec::with_capacity(cl.len());
            for attr in cl.iter() {
                let i = domain
                    .index_of(attr)
                    .ok_or_else(|| Error::UnknownAttribute {
                        attr: attr.to_string(),
                    })?;
                idxs.push(i);
            }
            for (k, &i) in idxs.iter().enumerate() {
                for &j in &idxs[k + 1..] {
                    adj[i][j] = true;
                    adj[j][i] = true;
                }
            }
        }

        // Greedy minimum-fill elimination.
        let mut remaining = vec![true; n];
        let mut elim_cliques: Vec<Vec<usize>> = Vec::with_capacity(n);
        for _ in 0..n {
            let mut best: Option<(usize, usize, Vec<usize>)> = None;
            for v in 0..n {
                if !remaining[v] {
                    continue;
                }
                let nbrs: Vec<usize> = (0..n)
                    .filter(|&u| u != v && remaining[u] && adj[v][u])
                    .collect();
                let mut fill = 0usize;
                for (k, &i) in nbrs.iter().enumerate() {
                    for &j in &nbrs[k + 1..] {
                        if !adj[i][j] {
                            fill += 1;
                        }
                    }
                }
                match &best {
                    Some((best_fill, _, _)) if fill >= *best_fill => {}
                    _ => best = Some((fill, v, nbrs)),
                }
            }
            let (_, v, nbrs) = match best {
                Some(b) => b,
                None => break,
            };
            for (k, &i) in nbrs.iter().enumerate() {
                for &j in &nbrs[k + 1..] {
                    adj[i][j] = true;
                    adj[j][i] = true;
                }
            }
            remaining[v] = false;
            let mut members = nbrs;
            members.push(v);
            elim_cliques.push(members);
        }

        // Maximal cliques only, in canonical order.
        let attrs = domain.attrs();
        let mut candidates: Vec<Clique> = elim_cliques
            .into_iter()
            .map(|members| Clique::new(members.into_iter().map(|i| attrs[i].clone())))
            .collect();
        candidates.sort_by_key(|c| std::cmp::Reverse(c.len()));
        let mut nodes: Vec<Clique> = Vec::new();
        for c in candidates {
            if !nodes.iter().any(|kept| c.is_subset_of(kept)) {
                nodes.push(c);
            }
        }
        nodes.sort();

        // Maximum-weight spanning forest over separator sizes.
        let m = nodes.len();
        let mut edges: Vec<(usize, usize, usize)> = Vec::new();
        for i in 0..m {
            for j in i + 1..m {
                let w = nodes[i].intersection_size(&nodes[j]);
                if w > 0 {
                    edges.push((i, j, w));
                }
            }
        }
        edges.sort_by_key(|&(i, j, w)| (std::cmp::Reverse(w), i, j));
        let mut uf: Vec<usize> = (0..m).collect();
        fn find(uf: &mut Vec<usize>, x: usize) -> usize {
            if uf[x] != x {
                let root = find(uf, uf[x]);
                uf[x] = root;
            }
            uf[x]
        }
        let mut tree_adj: Vec<Vec<usize>> = vec![Vec::new(); m];
        for (i, j, _) in edges {
            let (ri, rj) = (find(&mut uf, i), find(&mut uf, j));
            if ri != rj {
                uf[ri] = rj;
                tree_adj[i].push(j);
                tree_adj[j].push(i);
            }
        }

        // Root each component at its smallest node and record a pre-order.
        let mut parent = vec![None; m];
        let mut separator = vec![Clique::new(Vec::<String>::new()); m];
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); m];
        let mut order = Vec::with_capacity(m);
        let mut visited = vec![false; m];
        for root in 0..m {
            if visited[root] {
                continue;
            }
            visited[root] = true;
            let mut queue = VecDeque::from([root]);
            while let Some(i) = queue.pop_front() {
                order.push(i);
                for &j in &tree_adj[i] {
                    if !visited[j] {
                        visited[j] = true;
                        parent[j] = Some(i);
                        separator[j] = nodes[j].intersection(&nodes[i]);
                        children[i].push(j);
                        queue.push_back(j);
                    }
                }
            }
        }

        let mut node_domains = Vec::with_capacity(m);
        for cl in &nodes {
            node_domains.push(domain.project(cl)?);
        }

        Ok(Self {
            domain: domain.clone(),
            nodes,
            node_domains,
            parent,
            separator,
            children,
            order,
        })
    }

    /// The domain the tree was built over.
    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    /// The maximal cliques, in canonical order.
    pub fn maximal_cliques(&self) -> &[Clique] {
        &self.nodes
    }

    /// Sub-domain of one maximal clique.
    pub fn node_domain(&self, i: usize) -> &Domain {
        &self.node_domains[i]
    }

    /// Number of tree nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when the tree has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Parent of a node, or `None` for component roots.
    pub fn parent(&self, i: usize) -> Option<usize> {
        self.parent[i]
    }

    /// Separator between a node and its parent (empty for roots).
    pub fn separator(&self, i: usize) -> &Clique {
        &self.separator[i]
    }

    /// Children of a node.
    pub fn children(&self, i: usize) -> &[usize] {
        &self.children[i]
    }

    /// Node indices in pre-order (every parent before its children).
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// Total cell count across maximal cliques.
    pub fn size_cells(&self) -> usize {
        self.node_domains.iter().map(Domain::total_size).sum()
    }

    /// Estimated model memory in megabytes (8 bytes per cell).
    pub fn size_mb(&self) -> f64 {
        self.size_cells() as f64 * 8.0 / (1 << 20) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domain() -> Domain {
        Domain::new(["a", "b", "c", "d"], vec![2, 3, 4, 5]).unwrap()
    }

    #[test]
    fn chain_structure_keeps_pairwise_cliques() {
        let d = domain();
        let cliques = [
            Clique::new(["a", "b"]),
            Clique::new(["b", "c"]),
            Clique::new(["c", "d"]),
        ];
        let tree = JunctionTree::build(&d, &cliques).unwrap();
        assert_eq!(tree.maximal_cliques(), &cliques);
        assert_eq!(tree.size_cells(), 6 + 12 + 20);
    }

    #[test]
    fn isolated_attributes_become_singletons() {
        let d = domain();
        let tree = JunctionTree::build(&d, &[Clique::new(["a", "b"])]).unwrap();
        let nodes = tree.maximal_cliques();
        assert!(nodes.contains(&Clique::single("c")));
        assert!(nodes.contains(&Clique::single("d")));
        assert!(nodes.contains(&Clique::new(["a", "b"])));
    }

    #[test]
    fn running_intersection_holds_on_a_cycle() {
        // A triangle of pairwise cliques triangulates into one 3-clique or a
        // structure whose separators connect all shared attributes.
        let d = Domain::new(["a", "b", "c"], vec![2, 2, 2]).unwrap();
        let cliques = [
            Clique::new(["a", "b"]),
            Clique::new(["b", "c"]),
            Clique::new(["a", "c"]),
        ];
        let tree = JunctionTree::build(&d, &cliques).unwrap();
        for cl in &cliques {
            assert!(
                tree.maximal_cliques().iter().any(|n| cl.is_subset_of(n)),
                "clique {cl} not covered"
            );
        }
    }

    #[test]
    fn preorder_visits_parents_first() {
        let d = domain();
        let cliques = [
            Clique::new(["a", "b"]),
            Clique::new(["b", "c"]),
            Clique::new(["c", "d"]),
        ];
        let tree = JunctionTree::build(&d, &cliques).unwrap();
        let mut seen = vec![false; tree.len()];
        for &i in tree.order() {
            if let Some(p) = tree.parent(i) {
                assert!(seen[p]);
            }
            seen[i] = true;
        }
    }

    #[test]
    fn unknown_attribute_is_rejected() {
        let d = domain();
        assert!(JunctionTree::build(&d, &[Clique::single("zz")]).is_err());
    }
}
