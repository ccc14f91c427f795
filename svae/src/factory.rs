//! Ready-made model topologies.
//!
//! Each factory consumes a [`TopologyConfig`] and wires the crate's reference
//! links into a [`Model`]: a flat VAE with a recurrent decoder, an n-level
//! hierarchy with conditional priors, a QKV variant that feeds a key-role
//! latent to the decoder, and the dual clean/noise pair sharing a common
//! factor. Production links replace the reference ones through the same
//! [`Link`] trait without touching the wiring.

use std::sync::Arc;

use anyhow::Result;

use crate::config::TopologyConfig;
use crate::graph::{BayesNet, Edge};
use crate::links::{AffineLink, ElmanLink, Link, Parent, ParentRole};
use crate::model::Model;
use crate::variable::{Family, Prior, Variable};
use crate::Scalar;

fn affine(in_dim: usize, head: Family, seed: u64) -> Result<Arc<dyn Link<Scalar>>> {
    let link = AffineLink::<Scalar>::seeded(in_dim, head, seed)?;
    Ok(Arc::new(link))
}

fn gaussian(dim: usize) -> Family {
    Family::Gaussian { dim }
}

fn level_name(i: usize) -> String {
    format!("z{}", i + 1)
}

/// Flat VAE in the shape of the classic sentence autoencoder: one latent `z`
/// inferred from the observation, a recurrent decoder conditioned on `z` and
/// the previous chunk `x_prev`.
///
/// The generation graph therefore expects an `x_prev` input alongside the
/// batch; continuation across chunks goes through the decoder's carried
/// state. Only the first declared latent width is used.
pub fn flat_vae(config: &TopologyConfig) -> Result<Model<Scalar>> {
    config.validate()?;
    let obs = config.observation_dim;
    let latent = config.latent_dims[0];
    let seed = config.seed;

    let inference = BayesNet::builder()
        .with_variable(Variable::new("x", gaussian(obs)).observed())
        .with_variable(Variable::new("z", gaussian(latent)))
        .with_edge(Edge::new(
            "z",
            vec![Parent::new("x")],
            affine(obs, gaussian(latent), seed)?,
        ))
        .build()?;

    let decoder: Arc<dyn Link<Scalar>> =
        Arc::new(ElmanLink::<Scalar>::seeded(latent + obs, obs, gaussian(obs), seed + 1)?);
    let generative = BayesNet::builder()
        .with_variable(Variable::new("z", gaussian(latent)).with_prior(Prior::StandardGaussian))
        .with_variable(Variable::new("x_prev", gaussian(obs)).observed())
        .with_variable(Variable::new("x", gaussian(obs)).generated())
        .with_edge(Edge::new(
            "x",
            vec![Parent::new("z"), Parent::new("x_prev")],
            decoder,
        ))
        .build()?;
    Model::new("flat", inference, generative)
}

/// Hierarchical VAE over every entry of `latent_dims`: each level is inferred
/// directly from the observation, while generation chains conditional priors
/// downward from the top level and decodes the observation from all levels at
/// once. With a single declared level this degenerates to a static flat VAE.
pub fn hierarchical_vae(config: &TopologyConfig) -> Result<Model<Scalar>> {
    config.validate()?;
    let obs = config.observation_dim;
    let dims = &config.latent_dims;
    let seed = config.seed;

    let mut inference =
        BayesNet::builder().with_variable(Variable::new("x", gaussian(obs)).observed());
    for (i, &dim) in dims.iter().enumerate() {
        inference = inference
            .with_variable(Variable::new(level_name(i), gaussian(dim)))
            .with_edge(Edge::new(
                level_name(i),
                vec![Parent::new("x")],
                affine(obs, gaussian(dim), seed + i as u64)?,
            ));
    }
    let inference = inference.build()?;

    // only the top level carries an unconditional prior; every level below is
    // conditioned on the one above it
    let mut generative = BayesNet::builder().with_variable(
        Variable::new(level_name(0), gaussian(dims[0])).with_prior(Prior::StandardGaussian),
    );
    for (i, &dim) in dims.iter().enumerate().skip(1) {
        generative = generative
            .with_variable(Variable::new(level_name(i), gaussian(dim)))
            .with_edge(Edge::new(
                level_name(i),
                vec![Parent::new(level_name(i - 1))],
                affine(dims[i - 1], gaussian(dim), seed + 64 + i as u64)?,
            ));
    }
    let parents = (0..dims.len()).map(|i| Parent::new(level_name(i))).collect();
    let generative = generative
        .with_variable(Variable::new("x", gaussian(obs)).generated())
        .with_edge(Edge::new(
            "x",
            parents,
            affine(dims.iter().sum(), gaussian(obs), seed + 128)?,
        ))
        .build()?;
    Model::new("hierarchical", inference, generative)
}

/// Hierarchy plus a structure latent `zst` fed to the decoder under the key
/// role, while the levels enter as memory. The reference decoder concatenates
/// regardless of role; an attention link swapped in through [`Link`] reads
/// the same declarations.
pub fn qkv_vae(config: &TopologyConfig) -> Result<Model<Scalar>> {
    config.validate()?;
    let obs = config.observation_dim;
    let dims = &config.latent_dims;
    let zst_dim = dims[dims.len() - 1];
    let seed = config.seed;

    let mut inference =
        BayesNet::builder().with_variable(Variable::new("x", gaussian(obs)).observed());
    for (i, &dim) in dims.iter().enumerate() {
        inference = inference
            .with_variable(Variable::new(level_name(i), gaussian(dim)))
            .with_edge(Edge::new(
                level_name(i),
                vec![Parent::new("x")],
                affine(obs, gaussian(dim), seed + i as u64)?,
            ));
    }
    let inference = inference
        .with_variable(Variable::new("zst", gaussian(zst_dim)))
        .with_edge(Edge::new(
            "zst",
            vec![Parent::new("x")],
            affine(obs, gaussian(zst_dim), seed + 192)?,
        ))
        .build()?;

    let mut generative = BayesNet::builder().with_variable(
        Variable::new(level_name(0), gaussian(dims[0])).with_prior(Prior::StandardGaussian),
    );
    for (i, &dim) in dims.iter().enumerate().skip(1) {
        generative = generative
            .with_variable(Variable::new(level_name(i), gaussian(dim)))
            .with_edge(Edge::new(
                level_name(i),
                vec![Parent::new(level_name(i - 1))],
                affine(dims[i - 1], gaussian(dim), seed + 64 + i as u64)?,
            ));
    }
    let mut parents: Vec<Parent> = (0..dims.len())
        .map(|i| Parent::new(level_name(i)).with_role(ParentRole::Memory))
        .collect();
    parents.push(Parent::new("zst").with_role(ParentRole::Key));
    let generative = generative
        .with_variable(Variable::new("zst", gaussian(zst_dim)).with_prior(Prior::StandardGaussian))
        .with_variable(Variable::new("x", gaussian(obs)).generated())
        .with_edge(Edge::new(
            "x",
            parents,
            affine(dims.iter().sum::<usize>() + zst_dim, gaussian(obs), seed + 128)?,
        ))
        .build()?;
    Model::new("qkv", inference, generative)
}

/// The clean/noise pair: both models observe the same kind of batch and share
/// a common factor `zcom`, the clean side adds a private `zcl` plus a
/// supervised label head `y`, the noise side adds a private `zno`. Alignment
/// of `zcom` across the pair is the caller's business (substitute the clean
/// sample and plant its statistics when evaluating the noise side).
///
/// Returns `(clean, noise)`. The two models never share initial weights.
pub fn dual_normalization(config: &TopologyConfig) -> Result<(Model<Scalar>, Model<Scalar>)> {
    config.validate()?;
    let obs = config.observation_dim;
    let com_dim = config.latent_dims[0];
    let side_dim = config.latent_dims[config.latent_dims.len() - 1];
    let classes = config.label_classes;
    let seed = config.seed;

    let clean_inference = BayesNet::builder()
        .with_variable(Variable::new("x", gaussian(obs)).observed())
        .with_variable(Variable::new("zcom", gaussian(com_dim)))
        .with_variable(Variable::new("zcl", gaussian(side_dim)))
        .with_variable(Variable::new("y", Family::Categorical { classes }).supervised())
        .with_edge(Edge::new(
            "zcom",
            vec![Parent::new("x")],
            affine(obs, gaussian(com_dim), seed)?,
        ))
        .with_edge(Edge::new(
            "zcl",
            vec![Parent::new("x")],
            affine(obs, gaussian(side_dim), seed + 1)?,
        ))
        .with_edge(Edge::new(
            "y",
            vec![Parent::new("x")],
            affine(obs, Family::Categorical { classes }, seed + 2)?,
        ))
        .build()?;
    let clean_generative = BayesNet::builder()
        .with_variable(Variable::new("zcom", gaussian(com_dim)).with_prior(Prior::StandardGaussian))
        .with_variable(Variable::new("zcl", gaussian(side_dim)).with_prior(Prior::StandardGaussian))
        .with_variable(Variable::new("y", Family::Categorical { classes }))
        .with_variable(Variable::new("x", gaussian(obs)).generated())
        .with_edge(Edge::new(
            "y",
            vec![Parent::new("zcom")],
            affine(com_dim, Family::Categorical { classes }, seed + 3)?,
        ))
        .with_edge(Edge::new(
            "x",
            vec![Parent::new("zcom"), Parent::new("zcl")],
            affine(com_dim + side_dim, gaussian(obs), seed + 4)?,
        ))
        .build()?;
    let clean = Model::new("clean", clean_inference, clean_generative)?;

    let noise_inference = BayesNet::builder()
        .with_variable(Variable::new("x", gaussian(obs)).observed())
        .with_variable(Variable::new("zcom", gaussian(com_dim)))
        .with_variable(Variable::new("zno", gaussian(side_dim)))
        .with_edge(Edge::new(
            "zcom",
            vec![Parent::new("x")],
            affine(obs, gaussian(com_dim), seed + 8)?,
        ))
        .with_edge(Edge::new(
            "zno",
            vec![Parent::new("x")],
            affine(obs, gaussian(side_dim), seed + 9)?,
        ))
        .build()?;
    let noise_generative = BayesNet::builder()
        .with_variable(Variable::new("zcom", gaussian(com_dim)).with_prior(Prior::StandardGaussian))
        .with_variable(Variable::new("zno", gaussian(side_dim)).with_prior(Prior::StandardGaussian))
        .with_variable(Variable::new("x", gaussian(obs)).generated())
        .with_edge(Edge::new(
            "x",
            vec![Parent::new("zcom"), Parent::new("zno")],
            affine(com_dim + side_dim, gaussian(obs), seed + 10)?,
        ))
        .build()?;
    let noise = Model::new("noise", noise_inference, noise_generative)?;

    Ok((clean, noise))
}
