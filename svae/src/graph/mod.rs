//! Bayesian networks: variables wired into a DAG by links.
//!
//! A [`BayesNet`] is pure structure. It owns [`Variable`] declarations and
//! [`Edge`]s, validates them once at build time and keeps the edges in
//! topological order, so every evaluation pass can walk them front to back
//! without re-planning. All run-time behavior lives in [`engine`].

pub mod engine;
pub mod trace;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::links::{Link, Parent};
use crate::tensor::Number;
use crate::variable::Variable;

pub use engine::EvalOptions;
pub use trace::Trace;

/// Construction-time rejections. A built network is structurally sound, so
/// evaluation never re-checks any of these.
#[derive(thiserror::Error, Debug)]
pub enum GraphError {
    #[error("variable {0:?} is declared twice")]
    DuplicateVariable(String),
    #[error("edge targets unknown variable {0:?}")]
    UnknownTarget(String),
    #[error("edge into {target:?} names unknown parent {parent:?}")]
    UnknownParent { target: String, parent: String },
    #[error("variable {0:?} is targeted by more than one edge")]
    DuplicateTarget(String),
    #[error("variable {0:?} is observed-only and cannot be the target of an edge")]
    ObservedTarget(String),
    #[error("edges form a cycle through {0:?}")]
    Cycle(Vec<String>),
}

/// One conditional dependency: `parents -> target` through a link.
#[derive(Clone)]
pub struct Edge<N: Number> {
    target: String,
    parents: Vec<Parent>,
    link: Arc<dyn Link<N>>,
}

impl<N: Number> Edge<N> {
    pub fn new(target: impl Into<String>, parents: Vec<Parent>, link: Arc<dyn Link<N>>) -> Edge<N> {
        Edge {
            target: target.into(),
            parents,
            link,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn parents(&self) -> &[Parent] {
        &self.parents
    }

    pub fn link(&self) -> &dyn Link<N> {
        self.link.as_ref()
    }
}

impl<N: Number> fmt::Debug for Edge<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Edge")
            .field("target", &self.target)
            .field("parents", &self.parents)
            .field("link", &self.link.describe())
            .finish()
    }
}

/// A validated network. Edges are stored in topological order.
#[derive(Clone)]
pub struct BayesNet<N: Number> {
    variables: BTreeMap<String, Variable>,
    edges: Vec<Edge<N>>,
    by_target: BTreeMap<String, usize>,
}

impl<N: Number> BayesNet<N> {
    pub fn builder() -> BayesNetBuilder<N> {
        BayesNetBuilder {
            variables: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn variables(&self) -> &BTreeMap<String, Variable> {
        &self.variables
    }

    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.variables.get(name)
    }

    /// Edges in the order evaluation fires them.
    pub fn edges(&self) -> &[Edge<N>] {
        &self.edges
    }

    pub fn edge_into(&self, target: &str) -> Option<&Edge<N>> {
        self.by_target.get(target).map(|&i| &self.edges[i])
    }

    /// Variables no edge produces. These must arrive from outside or carry a
    /// prior.
    pub fn roots(&self) -> impl Iterator<Item = &Variable> {
        self.variables
            .values()
            .filter(|v| !self.by_target.contains_key(v.name()))
    }

    /// Flat views over every link's parameter groups, for norm reporting.
    pub fn parameters(&self) -> Vec<&[N]> {
        self.edges
            .iter()
            .flat_map(|e| e.link().parameters())
            .collect()
    }
}

impl<N: Number> fmt::Debug for BayesNet<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BayesNet")
            .field("variables", &self.variables.keys().collect::<Vec<_>>())
            .field("edges", &self.edges)
            .finish()
    }
}

/// Consuming builder; call [`build`](BayesNetBuilder::build) to validate.
pub struct BayesNetBuilder<N: Number> {
    variables: Vec<Variable>,
    edges: Vec<Edge<N>>,
}

impl<N: Number> BayesNetBuilder<N> {
    pub fn with_variable(mut self, variable: Variable) -> Self {
        self.variables.push(variable);
        self
    }

    pub fn with_edge(mut self, edge: Edge<N>) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn build(self) -> Result<BayesNet<N>, GraphError> {
        let mut variables = BTreeMap::new();
        for variable in self.variables {
            let name = variable.name().to_string();
            if variables.insert(name.clone(), variable).is_some() {
                return Err(GraphError::DuplicateVariable(name));
            }
        }

        let mut targeted = BTreeSet::new();
        for edge in &self.edges {
            let target = edge.target();
            let declared = variables
                .get(target)
                .ok_or_else(|| GraphError::UnknownTarget(target.to_string()))?;
            if declared.is_observed_only() {
                return Err(GraphError::ObservedTarget(target.to_string()));
            }
            if !targeted.insert(target.to_string()) {
                return Err(GraphError::DuplicateTarget(target.to_string()));
            }
            for parent in edge.parents() {
                if !variables.contains_key(&parent.name) {
                    return Err(GraphError::UnknownParent {
                        target: target.to_string(),
                        parent: parent.name.clone(),
                    });
                }
            }
        }

        // Stable Kahn ordering over edges: repeatedly fire the first declared
        // edge whose parents are all available. Non-targeted variables are
        // available from the start since evaluation realizes them before any
        // edge fires.
        let mut available: BTreeSet<String> = variables
            .keys()
            .filter(|name| !targeted.contains(*name))
            .cloned()
            .collect();
        let mut pending: Vec<Edge<N>> = self.edges;
        let mut ordered = Vec::with_capacity(pending.len());
        while !pending.is_empty() {
            let next = pending.iter().position(|edge| {
                edge.parents()
                    .iter()
                    .all(|parent| available.contains(&parent.name))
            });
            match next {
                Some(index) => {
                    let edge = pending.remove(index);
                    available.insert(edge.target().to_string());
                    ordered.push(edge);
                }
                None => {
                    let stuck = pending
                        .iter()
                        .map(|edge| edge.target().to_string())
                        .collect();
                    return Err(GraphError::Cycle(stuck));
                }
            }
        }

        let by_target = ordered
            .iter()
            .enumerate()
            .map(|(i, edge)| (edge.target().to_string(), i))
            .collect();
        Ok(BayesNet {
            variables,
            edges: ordered,
            by_target,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::links::AffineLink;
    use crate::variable::Family;

    fn gaussian(name: &str, dim: usize) -> Variable {
        Variable::new(name, Family::Gaussian { dim })
    }

    fn affine(in_dim: usize, out_dim: usize) -> Arc<dyn Link<f32>> {
        Arc::new(AffineLink::<f32>::seeded(in_dim, Family::Gaussian { dim: out_dim }, 0).unwrap())
    }

    #[test]
    fn edges_are_reordered_topologically() {
        // Declared bottom-up on purpose: x depends on z1, z1 on z2.
        let net = BayesNet::builder()
            .with_variable(gaussian("x", 2))
            .with_variable(gaussian("z1", 3))
            .with_variable(gaussian("z2", 4).observed())
            .with_edge(Edge::new("x", vec![Parent::new("z1")], affine(3, 2)))
            .with_edge(Edge::new("z1", vec![Parent::new("z2")], affine(4, 3)))
            .build()
            .unwrap();
        let order: Vec<&str> = net.edges().iter().map(|e| e.target()).collect();
        assert_eq!(order, vec!["z1", "x"]);
        assert!(net.edge_into("x").is_some());
        assert!(net.edge_into("z2").is_none());
    }

    #[test]
    fn roots_are_the_untargeted_variables() {
        let net = BayesNet::builder()
            .with_variable(gaussian("x", 2))
            .with_variable(gaussian("z", 3))
            .with_edge(Edge::new("x", vec![Parent::new("z")], affine(3, 2)))
            .build()
            .unwrap();
        let roots: Vec<&str> = net.roots().map(|v| v.name()).collect();
        assert_eq!(roots, vec!["z"]);
    }

    #[test]
    fn cycles_are_rejected_with_the_stuck_targets() {
        let err = BayesNet::<f32>::builder()
            .with_variable(gaussian("a", 2))
            .with_variable(gaussian("b", 2))
            .with_edge(Edge::new("a", vec![Parent::new("b")], affine(2, 2)))
            .with_edge(Edge::new("b", vec![Parent::new("a")], affine(2, 2)))
            .build()
            .unwrap_err();
        match err {
            GraphError::Cycle(stuck) => assert_eq!(stuck, vec!["a", "b"]),
            other => panic!("expected a cycle, got {other}"),
        }
    }

    #[test]
    fn observed_only_variables_cannot_be_targets() {
        let err = BayesNet::<f32>::builder()
            .with_variable(gaussian("x", 2).observed())
            .with_variable(gaussian("z", 3))
            .with_edge(Edge::new("x", vec![Parent::new("z")], affine(3, 2)))
            .build()
            .unwrap_err();
        assert!(matches!(err, GraphError::ObservedTarget(name) if name == "x"));
    }

    #[test]
    fn unknown_names_and_duplicate_targets_are_rejected() {
        let err = BayesNet::<f32>::builder()
            .with_variable(gaussian("x", 2))
            .with_edge(Edge::new("x", vec![Parent::new("ghost")], affine(3, 2)))
            .build()
            .unwrap_err();
        assert!(matches!(err, GraphError::UnknownParent { .. }));

        let err = BayesNet::<f32>::builder()
            .with_variable(gaussian("x", 2))
            .with_variable(gaussian("z", 3))
            .with_edge(Edge::new("x", vec![Parent::new("z")], affine(3, 2)))
            .with_edge(Edge::new("x", vec![Parent::new("z")], affine(3, 2)))
            .build()
            .unwrap_err();
        assert!(matches!(err, GraphError::DuplicateTarget(name) if name == "x"));
    }

    #[test]
    fn parameters_cover_every_edge() {
        let net = BayesNet::builder()
            .with_variable(gaussian("x", 2))
            .with_variable(gaussian("z", 3))
            .with_edge(Edge::new("x", vec![Parent::new("z")], affine(3, 2)))
            .build()
            .unwrap();
        // weight + bias from the single affine link
        assert_eq!(net.parameters().len(), 2);
        assert!(utils::l2_norm(net.parameters()) > 0.0);
    }
}
