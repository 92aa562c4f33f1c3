use candle_core::Result;
use log::debug;

use super::reduce::{sum_log_prob, LogWeights};
use crate::log_prob::LogProb;
use crate::trace::TraceT;

/// Configuration for the semi-supervised ELBO.
#[derive(Debug, Clone)]
pub struct ElboConfig {
    /// Axis of independent Monte Carlo draws; `None` means no importance
    /// weighting at all
    pub sample_dim: Option<usize>,
    /// Axis of data items
    pub batch_dim: Option<usize>,
    /// Coefficient of the ML (supervised) term
    pub alpha: f64,
    /// Coefficient of the KL term
    pub beta: f64,
}

impl Default for ElboConfig {
    fn default() -> Self {
        Self {
            sample_dim: None,
            batch_dim: None,
            alpha: 0.1,
            beta: 1.0,
        }
    }
}

impl ElboConfig {
    /// Create a configuration with default coefficients.
    pub fn new(sample_dim: Option<usize>, batch_dim: Option<usize>) -> Self {
        Self {
            sample_dim,
            batch_dim,
            ..Default::default()
        }
    }

    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_beta(mut self, beta: f64) -> Self {
        self.beta = beta;
        self
    }
}

/// Importance-weighted average of a per-sample quantity `[S, B]`:
/// weighted sum over the sample axis, then the mean over what is left.
///
/// Falls back to a plain mean when there is no sample axis or the
/// log-weights carry no axis to normalize.
fn weighted_mean<Q>(
    value: &LogProb,
    q: &Q,
    sample_dim: Option<usize>,
    batch_dim: Option<usize>,
    log_weights: Option<&LogWeights>,
) -> Result<LogProb>
where
    Q: TraceT + ?Sized,
{
    if sample_dim.is_none() {
        return value.mean();
    }

    let computed;
    let log_weights = match log_weights {
        Some(lw) => lw,
        None => {
            computed = LogWeights::from_encoder(q, sample_dim, batch_dim)?;
            &computed
        }
    };

    match (log_weights.normalized()?, value) {
        (Some(weights), LogProb::Tensor(x)) if x.rank() > 0 => Ok(LogProb::Tensor(
            weights.broadcast_mul(x)?.sum(0)?.mean_all()?,
        )),
        (None, _) => {
            debug!("log-weights have no sample axis; unweighted average");
            value.mean()
        }
        // weights sum to one over samples, a constant stays a constant
        _ => value.mean(),
    }
}

/// Monte Carlo estimate of the reconstruction log-likelihood
///
/// E_q[ log p(x | y, z) ] ≈ (1/B) Σ_b Σ_s w(s,b) log p(x(b) | y(b), z(s,b))
///
/// * `x` - variables conditioned in `p` that `q` does not have
/// * `y` - variables conditioned in `q`
/// * `z` - variables sampled in `q`
///
/// `w` are the importance weights, softmax over samples of log q(y, ...).
/// Without a sample axis the plain mean is returned and `log_weights`
/// is ignored.
///
/// # Arguments
/// * `q` - encoder trace
/// * `p` - decoder trace
/// * `sample_dim` - axis of Monte Carlo draws
/// * `batch_dim` - axis of data items
/// * `log_weights` - shared log-weights; computed from `q` if `None`
pub fn log_like<Q, P>(
    q: &Q,
    p: &P,
    sample_dim: Option<usize>,
    batch_dim: Option<usize>,
    log_weights: Option<&LogWeights>,
) -> Result<LogProb>
where
    Q: TraceT + ?Sized,
    P: TraceT + ?Sized,
{
    let x: Vec<&str> = p
        .conditioned()
        .into_iter()
        .filter(|n| !q.contains(n))
        .collect();

    let log_prob = sum_log_prob(p, sample_dim, batch_dim, &x)?;
    weighted_mean(&log_prob, q, sample_dim, batch_dim, log_weights)
}

/// Monte Carlo estimate of the KL divergence
///
/// E_q[ log q(z | x, y) - log p(z) ]
///
/// where `z` are the variables sampled in `q`. Weighting follows
/// [`log_like`]; pass the same `log_weights` to both.
pub fn kl<Q, P>(
    q: &Q,
    p: &P,
    sample_dim: Option<usize>,
    batch_dim: Option<usize>,
    log_weights: Option<&LogWeights>,
) -> Result<LogProb>
where
    Q: TraceT + ?Sized,
    P: TraceT + ?Sized,
{
    let z = q.sampled();
    let log_p = sum_log_prob(p, sample_dim, batch_dim, &z)?;
    let log_q = sum_log_prob(q, sample_dim, batch_dim, &z)?;
    let log_qp = log_q.sub(&log_p)?;
    weighted_mean(&log_qp, q, sample_dim, batch_dim, log_weights)
}

/// Monte Carlo estimate of the maximum likelihood encoder objective
///
/// E_q[ log q(y, z | x) - log q(z | x) ] ≈ mean of log q(y | ...)
///
/// This is the average log-density of the variables conditioned in `q`,
/// i.e., the mean of the same quantity that serves as log-weights. The
/// ratio above equals q(y | z, x), so the two agree when the conditioned
/// nodes record their density given the latent states. When `q`
/// conditions nothing the result is the number zero.
pub fn ml<Q>(q: &Q, sample_dim: Option<usize>, batch_dim: Option<usize>) -> Result<LogProb>
where
    Q: TraceT + ?Sized,
{
    sum_log_prob(q, sample_dim, batch_dim, &q.conditioned())?.mean()
}

/// The three terms of the semi-supervised ELBO, estimated with one
/// shared set of importance weights.
#[derive(Debug, Clone)]
pub struct ElboDecomposition {
    pub log_like: LogProb,
    pub kl: LogProb,
    pub ml: LogProb,
}

impl ElboDecomposition {
    /// log_like - beta * kl + alpha * ml
    pub fn total(&self, config: &ElboConfig) -> Result<LogProb> {
        self.log_like
            .sub(&self.kl.scale(config.beta)?)?
            .add(&self.ml.scale(config.alpha)?)
    }
}

/// Estimate each ELBO term; log-weights are computed once and shared.
pub fn elbo_terms<Q, P>(q: &Q, p: &P, config: &ElboConfig) -> Result<ElboDecomposition>
where
    Q: TraceT + ?Sized,
    P: TraceT + ?Sized,
{
    let (sd, bd) = (config.sample_dim, config.batch_dim);
    let log_weights = LogWeights::from_encoder(q, sd, bd)?;

    Ok(ElboDecomposition {
        log_like: log_like(q, p, sd, bd, Some(&log_weights))?,
        kl: kl(q, p, sd, bd, Some(&log_weights))?,
        // same reduction as `ml`
        ml: log_weights.log_prob().mean()?,
    })
}

/// Monte Carlo estimate of the semi-supervised evidence lower bound
///
/// E_q[ log p(x | y, z) - β log q(z | x, y) / p(z) ] + α E_q[ log q(y, z | x) / q(z | x) ]
///
/// * `x` - variables conditioned in `p` but not present in `q`
/// * `y` - variables conditioned in `q`
/// * `z` - variables sampled in `q`
///
/// The expectation over q(z | x, y) is approximated by importance
/// sampling along `config.sample_dim`.
///
/// # Returns
/// A value attached to the autodiff graph of the traces; maximize it
/// (or minimize its negative)
pub fn elbo<Q, P>(q: &Q, p: &P, config: &ElboConfig) -> Result<LogProb>
where
    Q: TraceT + ?Sized,
    P: TraceT + ?Sized,
{
    elbo_terms(q, p, config)?.total(config)
}
