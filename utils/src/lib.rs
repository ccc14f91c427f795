//! Cross-cutting observability helpers shared by the workspace crates.
//!
//! Nothing in here knows about graphs or tensors: the norm utility works on
//! any component that can hand out its parameter groups as slices, so it can
//! be pointed at a whole model, a single network or a single link without
//! special cases.

use std::collections::BTreeMap;

use tracing::info;

/// L2 norm over a set of parameter groups.
///
/// Each item is one flat parameter slice (a weight matrix, a bias, ...); the
/// norm is taken over the concatenation of all of them, accumulated in `f64`
/// so that large models with small weights do not lose precision.
pub fn l2_norm<I, T>(groups: I) -> f64
where
    I: IntoIterator,
    I::Item: AsRef<[T]>,
    T: Into<f64> + Copy,
{
    let sum_sq: f64 = groups
        .into_iter()
        .flat_map(|group| {
            group
                .as_ref()
                .iter()
                .map(|value| {
                    let v: f64 = (*value).into();
                    v * v
                })
                .collect::<Vec<_>>()
        })
        .sum();
    sum_sq.sqrt()
}

/// Emits a named scalar map as tracing events, one event per entry.
///
/// The `scope` is prepended to every metric name, mirroring how training and
/// test scalars are kept apart when they are dumped.
pub fn log_metrics(scope: &str, metrics: &BTreeMap<String, f64>) {
    for (name, value) in metrics {
        info!(target: "metrics", "{}/{} = {:.6}", scope, name, value);
    }
}

/// Installs a global tracing subscriber honoring `RUST_LOG`.
///
/// Safe to call from every test; installation failures (an earlier test
/// already installed one) are ignored.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
