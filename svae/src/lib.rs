//! Graph-structured variational autoencoders.
//!
//! A model is a pair of directed acyclic graphs over named random variables:
//! an inference graph mapping observations to latent posteriors, and a
//! generation graph mapping latents back to the data. Both are executed by
//! one engine that handles ancestral ordering, teacher forcing, posterior
//! planting, value substitution, importance sampling and recurrent state, so
//! a new topology is wired from [`Variable`]s, [`Link`]s and [`Edge`]s
//! instead of a new training loop. Criteria read the realized traces and
//! never re-run the graphs.
//!
//! ```
//! use std::collections::BTreeMap;
//!
//! use svae::config::ElboConfig;
//! use svae::testing::{ramp, seeded_rng};
//! use svae::variable::{Family, Prior};
//! use svae::{factory, training_step, Criterion, ForwardOptions, Scalar, TopologyConfig};
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = TopologyConfig::default()
//!     .with_observation_dim(3)
//!     .with_latent_dims(vec![2]);
//! let model = factory::hierarchical_vae(&config)?;
//!
//! let inputs = BTreeMap::from([("x".to_string(), ramp::<Scalar>(8, 3))]);
//! let outcome = model.forward(&inputs, &ForwardOptions::default(), &mut seeded_rng(0))?;
//!
//! let mut criteria: Vec<Box<dyn Criterion<Scalar>>> = vec![Box::new(
//!     ElboConfig::default().build(
//!         "elbo",
//!         ["z1"],
//!         ["x"],
//!         [("z1".to_string(), Prior::StandardGaussian, Family::Gaussian { dim: 2 })],
//!     ),
//! )];
//! let (loss, metrics) = training_step(&mut criteria, &outcome.step_state(0))?;
//! assert!(loss.is_finite());
//! assert!(metrics.contains_key("elbo/kl/z1"));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod criteria;
pub mod dist;
pub mod factory;
pub mod graph;
pub mod links;
pub mod model;
pub mod tensor;
pub mod testing;
pub mod variable;

pub use config::TopologyConfig;
pub use criteria::{Criterion, Metrics};
pub use graph::{BayesNet, Edge, EvalOptions, Trace};
pub use links::Link;
pub use model::{evaluation_step, training_step, ForwardOptions, ForwardOutcome, Model};
pub use variable::{Family, Prior, Variable};

/// Scalar type the factory-built models run over. Generic code is written
/// against [`tensor::Number`]; this is the concrete default.
pub type Scalar = f32;
