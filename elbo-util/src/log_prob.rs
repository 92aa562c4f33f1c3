use candle_core::{DType, Device, Result, Tensor};

/// Log-density value stored in a trace node or produced by a reduction.
///
/// A `Number` has no axes at all. It shows up when a reduction runs over
/// an empty set of names, or when a node records a constant density.
/// Arithmetic between a `Number` and a `Tensor` broadcasts the number
/// into the tensor, so the result stays attached to the autodiff graph.
#[derive(Clone, Debug)]
pub enum LogProb {
    Number(f64),
    Tensor(Tensor),
}

impl From<f64> for LogProb {
    fn from(value: f64) -> Self {
        LogProb::Number(value)
    }
}

impl From<Tensor> for LogProb {
    fn from(value: Tensor) -> Self {
        LogProb::Tensor(value)
    }
}

impl LogProb {
    /// additive identity
    pub fn zero() -> Self {
        LogProb::Number(0.0)
    }

    pub fn is_number(&self) -> bool {
        matches!(self, LogProb::Number(_))
    }

    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            LogProb::Tensor(t) => Some(t),
            LogProb::Number(_) => None,
        }
    }

    /// `self + other` with broadcasting
    pub fn add(&self, other: &LogProb) -> Result<LogProb> {
        Ok(match (self, other) {
            (LogProb::Number(a), LogProb::Number(b)) => LogProb::Number(a + b),
            (LogProb::Number(a), LogProb::Tensor(t)) | (LogProb::Tensor(t), LogProb::Number(a)) => {
                LogProb::Tensor((t + *a)?)
            }
            (LogProb::Tensor(a), LogProb::Tensor(b)) => LogProb::Tensor(a.broadcast_add(b)?),
        })
    }

    /// `self - other` with broadcasting
    pub fn sub(&self, other: &LogProb) -> Result<LogProb> {
        Ok(match (self, other) {
            (LogProb::Number(a), LogProb::Number(b)) => LogProb::Number(a - b),
            (LogProb::Number(a), LogProb::Tensor(t)) => LogProb::Tensor((t.neg()? + *a)?),
            (LogProb::Tensor(t), LogProb::Number(b)) => LogProb::Tensor((t - *b)?),
            (LogProb::Tensor(a), LogProb::Tensor(b)) => LogProb::Tensor(a.broadcast_sub(b)?),
        })
    }

    /// `c * self`
    pub fn scale(&self, c: f64) -> Result<LogProb> {
        Ok(match self {
            LogProb::Number(a) => LogProb::Number(c * a),
            LogProb::Tensor(t) => LogProb::Tensor((t * c)?),
        })
    }

    /// Average over every axis. A number has nothing to average and is
    /// returned unchanged.
    pub fn mean(&self) -> Result<LogProb> {
        Ok(match self {
            LogProb::Number(a) => LogProb::Number(*a),
            LogProb::Tensor(t) => LogProb::Tensor(t.mean_all()?),
        })
    }

    /// Read out a scalar value. Fails for tensors with any axis left.
    pub fn to_f64(&self) -> Result<f64> {
        match self {
            LogProb::Number(a) => Ok(*a),
            LogProb::Tensor(t) => t.to_dtype(DType::F64)?.to_scalar::<f64>(),
        }
    }

    /// Materialize as a tensor, e.g., to hand a loss to an optimizer.
    /// A number becomes a rank-0 constant with no gradient.
    pub fn to_tensor(&self, dtype: DType, device: &Device) -> Result<Tensor> {
        match self {
            LogProb::Number(a) => Tensor::new(*a, device)?.to_dtype(dtype),
            LogProb::Tensor(t) => Ok(t.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_tensor_arithmetic() -> Result<()> {
        let device = Device::Cpu;
        let t = LogProb::from(Tensor::new(&[1.0f64, 2.0, 3.0], &device)?);
        let c = LogProb::from(2.0);

        let sum = c.add(&t)?;
        assert_eq!(sum.as_tensor().unwrap().to_vec1::<f64>()?, vec![3.0, 4.0, 5.0]);

        let diff = c.sub(&t)?;
        assert_eq!(diff.as_tensor().unwrap().to_vec1::<f64>()?, vec![1.0, 0.0, -1.0]);

        let diff = t.sub(&c)?;
        assert_eq!(diff.as_tensor().unwrap().to_vec1::<f64>()?, vec![-1.0, 0.0, 1.0]);

        let mean = t.scale(2.0)?.mean()?;
        assert!((mean.to_f64()? - 4.0).abs() < 1e-12);

        Ok(())
    }

    #[test]
    fn numbers_stay_numbers() -> Result<()> {
        let a = LogProb::from(1.5).add(&LogProb::zero())?.sub(&LogProb::from(0.5))?;
        assert!(a.is_number());
        assert_eq!(a.mean()?.to_f64()?, 1.0);

        let t = a.to_tensor(DType::F32, &Device::Cpu)?;
        assert!(t.dims().is_empty());
        assert_eq!(t.to_scalar::<f32>()?, 1.0);
        Ok(())
    }
}
