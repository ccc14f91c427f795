//! Serializable knobs for the topology factories and the training criteria.
//!
//! Configs are plain data: they validate themselves and build the richer
//! runtime objects, but hold no tensors or graphs. Missing JSON fields fall
//! back to the defaults, so a partial config file is enough to get a
//! runnable experiment.

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

use crate::criteria::{Elbo, IwElbo, Supervision};
use crate::variable::{Family, Prior};

fn default_observation_dim() -> usize {
    16
}

fn default_latent_dims() -> Vec<usize> {
    vec![8]
}

fn default_label_classes() -> usize {
    10
}

fn default_seed() -> u64 {
    7
}

fn default_weight() -> f64 {
    1.0
}

/// Shared sizing for every factory topology.
///
/// `latent_dims` is read top-down: hierarchical and QKV graphs give one
/// level per entry (QKV sizes its structure latent from the last), the flat
/// graph uses the first entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyConfig {
    #[serde(default = "default_observation_dim")]
    pub observation_dim: usize,
    #[serde(default = "default_latent_dims")]
    pub latent_dims: Vec<usize>,
    /// Class count of the supervised head in the dual topology.
    #[serde(default = "default_label_classes")]
    pub label_classes: usize,
    /// Seed for the factory-built link weights.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for TopologyConfig {
    fn default() -> TopologyConfig {
        TopologyConfig {
            observation_dim: default_observation_dim(),
            latent_dims: default_latent_dims(),
            label_classes: default_label_classes(),
            seed: default_seed(),
        }
    }
}

impl TopologyConfig {
    pub fn with_observation_dim(mut self, dim: usize) -> TopologyConfig {
        self.observation_dim = dim;
        self
    }

    pub fn with_latent_dims(mut self, dims: Vec<usize>) -> TopologyConfig {
        self.latent_dims = dims;
        self
    }

    pub fn with_label_classes(mut self, classes: usize) -> TopologyConfig {
        self.label_classes = classes;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> TopologyConfig {
        self.seed = seed;
        self
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.observation_dim > 0, "observation dimension must be positive");
        ensure!(
            !self.latent_dims.is_empty(),
            "at least one latent dimension is required"
        );
        ensure!(
            self.latent_dims.iter().all(|&d| d > 0),
            "latent dimensions must be positive, got {:?}",
            self.latent_dims
        );
        ensure!(self.label_classes > 1, "a supervised head needs at least two classes");
        Ok(())
    }
}

/// Knobs of the single-sample bound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElboConfig {
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Linear KL annealing window, in steps.
    #[serde(default)]
    pub anneal: Option<(usize, usize)>,
    /// Per-latent KL floor in nats.
    #[serde(default)]
    pub free_bits: Option<f64>,
}

impl Default for ElboConfig {
    fn default() -> ElboConfig {
        ElboConfig {
            weight: default_weight(),
            anneal: None,
            free_bits: None,
        }
    }
}

impl ElboConfig {
    /// Builds the criterion over the given member sets. Latents that should
    /// fall back to a declared prior are listed with their prior and family.
    pub fn build<L, O, S, T>(
        &self,
        name: impl Into<String>,
        latents: L,
        observations: O,
        declared_priors: impl IntoIterator<Item = (String, Prior, Family)>,
    ) -> Elbo
    where
        L: IntoIterator<Item = S>,
        S: Into<String>,
        O: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let mut elbo = Elbo::new(name, latents, observations).with_weight(self.weight);
        if let Some((start, end)) = self.anneal {
            elbo = elbo.with_anneal(start, end);
        }
        if let Some(nats) = self.free_bits {
            elbo = elbo.with_free_bits(nats);
        }
        for (name, prior, family) in declared_priors {
            elbo = elbo.with_declared_prior(name, prior, family);
        }
        elbo
    }
}

/// Knobs of the importance-weighted bound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IwElboConfig {
    #[serde(default = "default_weight")]
    pub weight: f64,
}

impl Default for IwElboConfig {
    fn default() -> IwElboConfig {
        IwElboConfig {
            weight: default_weight(),
        }
    }
}

impl IwElboConfig {
    pub fn build<L, O, S, T>(
        &self,
        name: impl Into<String>,
        latents: L,
        observations: O,
        declared_priors: impl IntoIterator<Item = (String, Prior, Family)>,
    ) -> IwElbo
    where
        L: IntoIterator<Item = S>,
        S: Into<String>,
        O: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let mut iw = IwElbo::new(name, latents, observations).with_weight(self.weight);
        for (name, prior, family) in declared_priors {
            iw = iw.with_declared_prior(name, prior, family);
        }
        iw
    }
}

/// Knobs of the label cross-entropy term.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisionConfig {
    #[serde(default = "default_weight")]
    pub weight: f64,
}

impl Default for SupervisionConfig {
    fn default() -> SupervisionConfig {
        SupervisionConfig {
            weight: default_weight(),
        }
    }
}

impl SupervisionConfig {
    pub fn build<I, S>(&self, name: impl Into<String>, targets: I) -> Supervision
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Supervision::new(name, targets).with_weight(self.weight)
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;
    use crate::criteria::Criterion;

    #[test]
    fn topology_round_trips_through_json() {
        let config = TopologyConfig::default()
            .with_observation_dim(24)
            .with_latent_dims(vec![12, 6])
            .with_seed(99);
        let json = serde_json::to_string(&config).unwrap();
        let back: TopologyConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let config: TopologyConfig = serde_json::from_str(r#"{"latent_dims": [4]}"#).unwrap();
        assert_eq!(config.latent_dims, vec![4]);
        assert_eq!(config.observation_dim, default_observation_dim());
        assert_eq!(config.seed, default_seed());

        let elbo: ElboConfig = serde_json::from_str(r#"{"anneal": [100, 200]}"#).unwrap();
        assert_eq!(elbo.weight, 1.0);
        assert_eq!(elbo.anneal, Some((100, 200)));
        assert_eq!(elbo.free_bits, None);
    }

    #[test]
    fn the_default_topology_is_valid() {
        assert!(TopologyConfig::default().validate().is_ok());
    }

    #[rstest]
    #[case::no_levels(TopologyConfig::default().with_latent_dims(Vec::new()))]
    #[case::zero_width_level(TopologyConfig::default().with_latent_dims(vec![8, 0]))]
    #[case::zero_observation(TopologyConfig::default().with_observation_dim(0))]
    #[case::single_class(TopologyConfig::default().with_label_classes(1))]
    fn invalid_topologies_are_rejected(#[case] config: TopologyConfig) {
        assert!(config.validate().is_err());
    }

    #[test]
    fn criterion_configs_carry_their_weights_through_build() {
        let elbo = ElboConfig {
            weight: 0.5,
            ..ElboConfig::default()
        }
        .build("elbo", ["z"], ["x"], Vec::new());
        assert_eq!(Criterion::<f32>::weight(&elbo), 0.5);

        let supervision = SupervisionConfig { weight: 2.0 }.build("labels", ["y"]);
        assert_eq!(Criterion::<f32>::weight(&supervision), 2.0);
    }
}
