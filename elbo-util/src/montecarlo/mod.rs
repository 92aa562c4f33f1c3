//! Monte Carlo estimators of the semi-supervised ELBO.
//!
//! Given an encoder trace `q` and a decoder trace `p`, variables fall
//! into three sets:
//!
//! - `x`: conditioned in `p` and absent from `q` (the data)
//! - `y`: conditioned in `q` (the observed labels)
//! - `z`: sampled in `q` (the latent states)
//!
//! The estimators reduce per-node log-densities to `[S, B]` (sample axis,
//! batch axis), weight the samples by `softmax_s log q(y, ...)` and average
//! over the batch.
//!
//! # Example
//!
//! ```ignore
//! use elbo_util::montecarlo::{elbo, ElboConfig};
//!
//! let (q, p) = model.traces(&x_nd, Some(&y_nl), num_samples)?;
//! let config = ElboConfig::new(Some(0), Some(1));
//! let loss = elbo(&q, &p, &config)?.scale(-1.0)?;
//! // optimizer.backward_step(&loss.to_tensor(dtype, &device)?)?;
//! ```

mod objectives;
mod reduce;

pub use objectives::{elbo, elbo_terms, kl, log_like, ml, ElboConfig, ElboDecomposition};
pub use reduce::{importance_weights, sum_log_prob, LogWeights};
