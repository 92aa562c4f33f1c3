use candle_core::{Result, Tensor};
use candle_nn::ops;

use crate::log_prob::LogProb;
use crate::trace::TraceT;

/// Sum the log-densities of `names` in `trace` over every axis except
/// the sample and batch axes.
///
/// The result keeps the sample axis first and the batch axis second,
/// i.e., `[S, B]`, `[S]`, `[B]` or no axis at all depending on which
/// axes are given. Names that the trace does not have contribute
/// nothing, so an empty selection gives `LogProb::Number(0.0)`.
///
/// * `trace` - trace holding the nodes
/// * `sample_dim` - axis of the Monte Carlo draws
/// * `batch_dim` - axis of the data items
/// * `names` - variables to include
///
pub fn sum_log_prob<T, S>(
    trace: &T,
    sample_dim: Option<usize>,
    batch_dim: Option<usize>,
    names: &[S],
) -> Result<LogProb>
where
    T: TraceT + ?Sized,
    S: AsRef<str>,
{
    let mut ret = LogProb::zero();
    for name in names {
        if let Some(log_prob) = trace.log_density(name.as_ref()) {
            ret = ret.add(&batch_sum(log_prob, sample_dim, batch_dim)?)?;
        }
    }
    Ok(ret)
}

/// Collapse every axis of one node's log-density except the sample and
/// batch axes. Numbers and rank-0 tensors pass through and broadcast
/// later.
fn batch_sum(
    log_prob: &LogProb,
    sample_dim: Option<usize>,
    batch_dim: Option<usize>,
) -> Result<LogProb> {
    let x = match log_prob {
        LogProb::Number(_) => return Ok(log_prob.clone()),
        LogProb::Tensor(x) if x.rank() == 0 => return Ok(log_prob.clone()),
        LogProb::Tensor(x) => x,
    };

    let keep: Vec<usize> = sample_dim
        .into_iter()
        .chain(batch_dim.filter(|&b| Some(b) != sample_dim))
        .collect();

    if let Some(d) = keep.iter().find(|&&d| d >= x.rank()) {
        candle_core::bail!(
            "axis {} out of range for a log-density of shape {:?}",
            d,
            x.dims()
        );
    }

    let others: Vec<usize> = (0..x.rank()).filter(|d| !keep.contains(d)).collect();

    let x = if others.is_empty() {
        x.clone()
    } else {
        x.sum(others)?
    };

    // kept axes survive in their original order
    let x = match keep.as_slice() {
        [s, b] if s > b => x.transpose(0, 1)?,
        _ => x,
    };

    Ok(LogProb::Tensor(x))
}

/// Softmax of the log-weights along the leading (sample) axis.
///
/// Returns `None` when there is no sample axis to normalize over, a
/// plain number or a rank-0 tensor, in which case callers fall back to
/// an unweighted average. The weights are detached: they enter the
/// estimators as fixed mixture coefficients.
pub fn importance_weights(log_weights: &LogProb) -> Result<Option<Tensor>> {
    match log_weights {
        LogProb::Tensor(lw) if lw.rank() > 0 => Ok(Some(ops::softmax(lw, 0)?.detach())),
        _ => Ok(None),
    }
}

/// Log importance weights of the encoder's samples.
///
/// These are the summed log-densities of the variables conditioned in
/// the encoder trace `q`, with the sample axis leading. Build them once
/// per forward pass and hand the same value to [`super::log_like`] and
/// [`super::kl`] so that both terms see one realization of the weights.
#[derive(Clone, Debug)]
pub struct LogWeights(LogProb);

impl LogWeights {
    /// Reduce the conditioned nodes of the encoder trace
    pub fn from_encoder<Q>(q: &Q, sample_dim: Option<usize>, batch_dim: Option<usize>) -> Result<Self>
    where
        Q: TraceT + ?Sized,
    {
        Ok(Self(sum_log_prob(q, sample_dim, batch_dim, &q.conditioned())?))
    }

    /// Wrap log-weights computed elsewhere; the sample axis must lead
    pub fn from_log_prob(log_weights: LogProb) -> Self {
        Self(log_weights)
    }

    pub fn log_prob(&self) -> &LogProb {
        &self.0
    }

    /// Normalized weights, see [`importance_weights`]
    pub fn normalized(&self) -> Result<Option<Tensor>> {
        importance_weights(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{Node, Trace};
    use candle_core::{DType, Device};

    #[test]
    fn empty_selection_is_zero() -> Result<()> {
        let device = Device::Cpu;
        let mut trace = Trace::new();
        trace.insert(
            "z",
            Node::sampled(None, Tensor::ones((3, 4, 2), DType::F32, &device)?.into()),
        )?;

        let none: [&str; 0] = [];
        let ret = sum_log_prob(&trace, Some(0), Some(1), &none)?;
        assert!(ret.is_number());
        assert_eq!(ret.to_f64()?, 0.0);

        let ret = sum_log_prob(&trace, Some(0), Some(1), &["missing"])?;
        assert!(ret.is_number());
        assert_eq!(ret.to_f64()?, 0.0);
        Ok(())
    }

    #[test]
    fn keeps_sample_and_batch_axes() -> Result<()> {
        let device = Device::Cpu;
        let (s, b, k) = (3, 4, 5);
        let mut trace = Trace::new();
        trace.insert(
            "z",
            Node::sampled(None, Tensor::ones((s, b, k), DType::F32, &device)?.into()),
        )?;
        trace.insert(
            "c",
            Node::conditioned(None, Tensor::ones((s, b), DType::F32, &device)?.into()),
        )?;

        let ret = sum_log_prob(&trace, Some(0), Some(1), &["z", "c"])?;
        let x = ret.as_tensor().unwrap();
        assert_eq!(x.dims(), &[s, b]);
        let vals = x.flatten_all()?.to_vec1::<f32>()?;
        assert!(vals.iter().all(|&v| (v - (k as f32 + 1.0)).abs() < 1e-6));

        let ret = sum_log_prob(&trace, Some(0), None, &["z"])?;
        assert_eq!(ret.as_tensor().unwrap().dims(), &[s]);

        let ret = sum_log_prob(&trace, None, Some(1), &["z"])?;
        assert_eq!(ret.as_tensor().unwrap().dims(), &[b]);

        let ret = sum_log_prob(&trace, None, None, &["z"])?;
        assert!(ret.as_tensor().unwrap().dims().is_empty());
        assert!((ret.to_f64()? - (s * b * k) as f64).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn sample_axis_comes_first() -> Result<()> {
        let device = Device::Cpu;
        // batch x feature x sample
        let x = Tensor::arange(0f32, 24f32, &device)?.reshape((2, 3, 4))?;
        let mut trace = Trace::new();
        trace.insert("x", Node::conditioned(None, x.clone().into()))?;

        let ret = sum_log_prob(&trace, Some(2), Some(0), &["x"])?;
        let ret = ret.as_tensor().unwrap();
        assert_eq!(ret.dims(), &[4, 2]);

        let expected = x.sum(1)?.t()?.to_vec2::<f32>()?;
        assert_eq!(ret.to_vec2::<f32>()?, expected);
        Ok(())
    }

    #[test]
    fn scalar_nodes_broadcast() -> Result<()> {
        let device = Device::Cpu;
        let mut trace = Trace::new();
        trace.insert("a", Node::conditioned(None, 1.5.into()))?;
        trace.insert(
            "b",
            Node::conditioned(None, Tensor::zeros((2, 3), DType::F64, &device)?.into()),
        )?;

        let ret = sum_log_prob(&trace, Some(0), Some(1), &["a", "b"])?;
        let vals = ret.as_tensor().unwrap().flatten_all()?.to_vec1::<f64>()?;
        assert_eq!(vals, vec![1.5; 6]);

        let ret = sum_log_prob(&trace, Some(0), Some(1), &["a"])?;
        assert!(ret.is_number());
        Ok(())
    }

    #[test]
    fn axis_out_of_range_fails() -> Result<()> {
        let device = Device::Cpu;
        let mut trace = Trace::new();
        trace.insert(
            "z",
            Node::sampled(None, Tensor::ones(3, DType::F32, &device)?.into()),
        )?;
        assert!(sum_log_prob(&trace, Some(0), Some(1), &["z"]).is_err());
        Ok(())
    }

    #[test]
    fn weights_sum_to_one_per_batch_item() -> Result<()> {
        let device = Device::Cpu;
        let lw = Tensor::randn(0f32, 3f32, (7, 5), &device)?;
        let w = importance_weights(&lw.into())?.unwrap();

        let mins = w.min(0)?.to_vec1::<f32>()?;
        assert!(mins.iter().all(|&v| v >= 0.0));

        let sums = w.sum(0)?.to_vec1::<f32>()?;
        for s in sums {
            assert!((s - 1.0).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn numbers_are_not_normalized() -> Result<()> {
        assert!(importance_weights(&LogProb::Number(-2.0))?.is_none());
        let lw = LogWeights::from_log_prob(Tensor::new(0.5f32, &Device::Cpu)?.into());
        assert!(lw.normalized()?.is_none());
        Ok(())
    }
}
