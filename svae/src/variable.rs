//! Variable identity: name, distribution family, graph roles and prior.
//!
//! A [`Variable`] is immutable after construction. Everything that changes per
//! evaluation cycle (samples, posterior parameters, recurrent state) lives in
//! the [`Trace`](crate::graph::Trace) returned by the engine, never on the
//! variable itself.

use std::env;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::dist::SampleMode;
use crate::tensor::Shape;

// Get the relaxation temperature from an environment variable or use the
// default value
pub static RELAXATION_TEMPERATURE: Lazy<f64> = Lazy::new(|| {
    env::var("SVAE_RELAX_TEMPERATURE")
        .ok()
        .and_then(|val| val.parse::<f64>().ok())
        .unwrap_or(1.0)
});

/// Distribution family of a variable. A closed set: the engine never needs to
/// branch on anything beyond these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Family {
    /// Diagonal Gaussian over `dim` coordinates.
    Gaussian { dim: usize },
    /// Single categorical over `classes` outcomes, represented one-hot.
    Categorical { classes: usize },
    /// `groups` independent categoricals sharing one class count, represented
    /// as a `[groups, classes]` block of one-hot rows.
    MultiCategorical { groups: usize, classes: usize },
}

impl Family {
    /// Trailing shape of one event of this family.
    pub fn event_shape(&self) -> Shape {
        match self {
            Family::Gaussian { dim } => vec![*dim],
            Family::Categorical { classes } => vec![*classes],
            Family::MultiCategorical { groups, classes } => vec![*groups, *classes],
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Family::Gaussian { .. } => "Gaussian",
            Family::Categorical { .. } => "Categorical",
            Family::MultiCategorical { .. } => "MultiCategorical",
        }
    }

    /// Whether sampling distinguishes relaxed from discrete draws.
    pub fn is_categorical(&self) -> bool {
        matches!(
            self,
            Family::Categorical { .. } | Family::MultiCategorical { .. }
        )
    }
}

/// Declared unconditional prior of a root variable.
///
/// Conditional priors are not declared here; they are whatever the generation
/// graph's inbound link computes for the variable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Prior {
    /// Unit Gaussian per coordinate.
    StandardGaussian,
    /// Gaussian with one scalar location and scale shared by every coordinate.
    Gaussian { loc: f64, scale: f64 },
    /// Uniform categorical (all logits zero).
    UniformLogits,
}

/// A random variable in a graph: stable name, family and role flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variable {
    name: String,
    family: Family,
    observed_only: bool,
    generated: bool,
    supervised: bool,
    prior: Option<Prior>,
    temperature: Option<f64>,
}

impl Variable {
    /// A latent variable with no special roles.
    pub fn new(name: impl Into<String>, family: Family) -> Variable {
        Variable {
            name: name.into(),
            family,
            observed_only: false,
            generated: false,
            supervised: false,
            prior: None,
            temperature: None,
        }
    }

    /// Marks the variable as observed-only: its value is always supplied
    /// externally and no link may target it.
    pub fn observed(mut self) -> Variable {
        self.observed_only = true;
        self
    }

    /// Marks the variable as the designated reconstruction target.
    pub fn generated(mut self) -> Variable {
        self.generated = true;
        self
    }

    /// Marks the variable as optionally labelled at training time.
    pub fn supervised(mut self) -> Variable {
        self.supervised = true;
        self
    }

    pub fn with_prior(mut self, prior: Prior) -> Variable {
        self.prior = Some(prior);
        self
    }

    /// Overrides the global relaxation temperature for this variable.
    pub fn with_temperature(mut self, temperature: f64) -> Variable {
        self.temperature = Some(temperature);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn is_observed_only(&self) -> bool {
        self.observed_only
    }

    pub fn is_generated(&self) -> bool {
        self.generated
    }

    pub fn is_supervised(&self) -> bool {
        self.supervised
    }

    pub fn prior(&self) -> Option<Prior> {
        self.prior
    }

    /// Relaxation temperature: the per-variable override if set, else the
    /// process-wide default.
    pub fn temperature(&self) -> f64 {
        self.temperature.unwrap_or(*RELAXATION_TEMPERATURE)
    }

    /// How this variable samples under the given evaluation flag.
    pub fn sample_mode(&self, eval_mode: bool) -> SampleMode {
        if self.family.is_categorical() && eval_mode {
            SampleMode::Discrete
        } else {
            SampleMode::Relaxed {
                temperature: self.temperature(),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn event_shapes_per_family() {
        assert_eq!(Family::Gaussian { dim: 8 }.event_shape(), vec![8]);
        assert_eq!(Family::Categorical { classes: 5 }.event_shape(), vec![5]);
        assert_eq!(
            Family::MultiCategorical {
                groups: 3,
                classes: 4
            }
            .event_shape(),
            vec![3, 4]
        );
    }

    #[test]
    fn temperature_falls_back_to_global_default() {
        let v = Variable::new("z", Family::Categorical { classes: 4 });
        assert_eq!(v.temperature(), *RELAXATION_TEMPERATURE);
        let v = v.with_temperature(0.25);
        assert_eq!(v.temperature(), 0.25);
    }

    #[test]
    fn eval_mode_switches_only_categorical_families() {
        let z = Variable::new("z", Family::Gaussian { dim: 2 });
        assert!(matches!(
            z.sample_mode(true),
            SampleMode::Relaxed { .. }
        ));
        let y = Variable::new("y", Family::Categorical { classes: 3 });
        assert!(matches!(y.sample_mode(false), SampleMode::Relaxed { .. }));
        assert!(matches!(y.sample_mode(true), SampleMode::Discrete));
    }

    #[test]
    fn role_flags_accumulate_through_the_builder() {
        let x = Variable::new("x", Family::Categorical { classes: 10 }).observed();
        assert!(x.is_observed_only());
        assert!(!x.is_generated());
        let y = Variable::new("y", Family::Categorical { classes: 10 })
            .generated()
            .supervised();
        assert!(y.is_generated());
        assert!(y.is_supervised());
        assert!(y.prior().is_none());
    }
}
