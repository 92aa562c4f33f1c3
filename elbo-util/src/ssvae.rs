//! A small semi-supervised VAE that records its forward pass in traces.
//!
//! Encoder: `z ~ q(z | x)`, labels scored by `q(y | z)`.
//! Decoder: `z ~ N(0, I)`, `x ~ N(W z + b, I)`, `y ~ N(0, I)`.

use candle_core::{Result, Tensor};
use candle_nn::{Linear, Module, VarBuilder};

use crate::trace::Trace;

/// log N(x; mean, exp(lnvar)), elementwise with broadcasting
///
/// -0.5 * [ log(2π) + lnvar + (x - mean)^2 / exp(lnvar) ]
///
pub fn gaussian_log_density(x: &Tensor, mean: &Tensor, lnvar: &Tensor) -> Result<Tensor> {
    let ln_2pi = (2.0 * std::f64::consts::PI).ln();
    let diff_sq = x.broadcast_sub(mean)?.sqr()?;
    let scaled = diff_sq.broadcast_div(&lnvar.exp()?)?;
    (scaled.broadcast_add(lnvar)? + ln_2pi)? * (-0.5)
}

/// log N(x; 0, 1), elementwise
pub fn std_normal_log_density(x: &Tensor) -> Result<Tensor> {
    let ln_2pi = (2.0 * std::f64::consts::PI).ln();
    (x.sqr()? + ln_2pi)? * (-0.5)
}

pub struct SsvaeEncoder {
    fc: Linear,
    z_mean: Linear,
    z_lnvar: Linear,
    y_mean: Linear,
}

impl SsvaeEncoder {
    pub fn new(
        dim_obs: usize,
        dim_hidden: usize,
        dim_latent: usize,
        dim_label: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            fc: candle_nn::linear(dim_obs, dim_hidden, vb.pp("fc"))?,
            z_mean: candle_nn::linear(dim_hidden, dim_latent, vb.pp("z.mean"))?,
            z_lnvar: candle_nn::linear(dim_hidden, dim_latent, vb.pp("z.lnvar"))?,
            y_mean: candle_nn::linear(dim_latent, dim_label, vb.pp("y.mean"))?,
        })
    }

    /// Evaluate latent Gaussian parameters: mu and log_var
    fn latent_gaussian_params(&self, x_nd: &Tensor) -> Result<(Tensor, Tensor)> {
        let min_lv = -8.;
        let max_lv = 8.;
        let h_nh = self.fc.forward(x_nd)?.relu()?;
        let z_mean_nk = self.z_mean.forward(&h_nh)?;
        let z_lnvar_nk = self.z_lnvar.forward(&h_nh)?.clamp(min_lv, max_lv)?;
        Ok((z_mean_nk, z_lnvar_nk))
    }
}

pub struct SsvaeDecoder {
    x_mean: Linear,
}

impl SsvaeDecoder {
    pub fn new(dim_latent: usize, dim_obs: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            x_mean: candle_nn::linear(dim_latent, dim_obs, vb.pp("x.mean"))?,
        })
    }
}

pub struct SemiSupervisedVae {
    pub encoder: SsvaeEncoder,
    pub decoder: SsvaeDecoder,
    dim_obs: usize,
    dim_latent: usize,
    dim_label: usize,
}

impl SemiSupervisedVae {
    pub fn new(
        dim_obs: usize,
        dim_hidden: usize,
        dim_latent: usize,
        dim_label: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            encoder: SsvaeEncoder::new(dim_obs, dim_hidden, dim_latent, dim_label, vb.pp("enc"))?,
            decoder: SsvaeDecoder::new(dim_latent, dim_obs, vb.pp("dec"))?,
            dim_obs,
            dim_latent,
            dim_label,
        })
    }

    pub fn dim_obs(&self) -> usize {
        self.dim_obs
    }

    pub fn dim_latent(&self) -> usize {
        self.dim_latent
    }

    pub fn dim_label(&self) -> usize {
        self.dim_label
    }

    /// Run encoder and decoder once and record both in traces.
    ///
    /// Every log-density is kept elementwise with the sample axis at 0
    /// and the batch axis at 1, e.g., `log q(z)` is `S x n x k`.
    ///
    /// # Arguments
    /// * `x_nd` - observed data (n x d)
    /// * `y_nl` - labels (n x l), if this minibatch is labeled
    /// * `num_samples` - number of Monte Carlo draws S
    ///
    /// # Returns `(q, p)`
    /// * `q` - encoder trace: `z` sampled, `y` conditioned
    /// * `p` - decoder trace: `z` sampled, `x` and `y` conditioned
    pub fn traces(
        &self,
        x_nd: &Tensor,
        y_nl: Option<&Tensor>,
        num_samples: usize,
    ) -> Result<(Trace, Trace)> {
        let (n, k) = (x_nd.dim(0)?, self.dim_latent);

        let (z_mean_nk, z_lnvar_nk) = self.encoder.latent_gaussian_params(x_nd)?;
        let eps_snk = Tensor::randn(0f32, 1f32, (num_samples, n, k), x_nd.device())?
            .to_dtype(x_nd.dtype())?;
        let z_snk = z_mean_nk
            .unsqueeze(0)?
            .broadcast_add(&eps_snk.broadcast_mul(&(&z_lnvar_nk * 0.5)?.exp()?)?)?;

        let mut q = Trace::new();
        let mut p = Trace::new();

        let log_q_z = gaussian_log_density(&z_snk, &z_mean_nk, &z_lnvar_nk)?;
        q.sample("z", z_snk.clone(), log_q_z)?;

        if let Some(y_nl) = y_nl {
            let y_mean_snl = self.encoder.y_mean.forward(&z_snk)?;
            let zero = Tensor::zeros_like(&y_mean_snl)?;
            let log_q_y = gaussian_log_density(y_nl, &y_mean_snl, &zero)?;
            q.observe("y", y_nl.clone(), log_q_y)?;
        }

        // decoder consumes the encoder's draws
        let Some(z_snk) = q.value("z") else {
            candle_core::bail!("encoder trace has no `z` sample");
        };
        p.sample("z", z_snk.clone(), std_normal_log_density(z_snk)?)?;

        let x_mean_snd = self.decoder.x_mean.forward(z_snk)?;
        let zero = Tensor::zeros_like(&x_mean_snd)?;
        p.observe("x", x_nd.clone(), gaussian_log_density(x_nd, &x_mean_snd, &zero)?)?;

        if let Some(y_nl) = y_nl {
            let log_p_y = std_normal_log_density(y_nl)?
                .unsqueeze(0)?
                .broadcast_as((num_samples, n, self.dim_label))?;
            p.observe("y", y_nl.clone(), log_p_y)?;
        }

        Ok((q, p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::montecarlo::{elbo, elbo_terms, ElboConfig};
    use crate::trace::TraceT;
    use candle_core::{DType, Device};
    use candle_nn::{Optimizer, VarMap};

    #[test]
    fn log_density_at_mean() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::zeros((2, 3), DType::F64, &device)?;
        let lp = gaussian_log_density(&x, &x, &x)?;
        let expected = -0.5 * (2.0 * std::f64::consts::PI).ln();
        for v in lp.flatten_all()?.to_vec1::<f64>()? {
            assert!((v - expected).abs() < 1e-12);
        }
        let lp0 = std_normal_log_density(&x)?;
        assert_eq!(lp.to_vec2::<f64>()?, lp0.to_vec2::<f64>()?);
        Ok(())
    }

    #[test]
    fn trace_shapes() -> Result<()> {
        let device = Device::Cpu;
        let (n, d, h, k, l, s) = (6, 4, 8, 2, 1, 5);

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = SemiSupervisedVae::new(d, h, k, l, vb)?;

        let x = Tensor::randn(0f32, 1f32, (n, d), &device)?;
        let y = Tensor::randn(0f32, 1f32, (n, l), &device)?;

        let (q, p) = model.traces(&x, Some(&y), s)?;
        assert_eq!(q.sampled(), vec!["z"]);
        assert_eq!(q.conditioned(), vec!["y"]);
        assert_eq!(p.conditioned(), vec!["x", "y"]);

        let dims = |t: &Trace, name: &str| {
            t.log_density(name)
                .and_then(|lp| lp.as_tensor())
                .map(|t| t.dims().to_vec())
        };
        assert_eq!(dims(&q, "z"), Some(vec![s, n, k]));
        assert_eq!(dims(&q, "y"), Some(vec![s, n, l]));
        assert_eq!(dims(&p, "x"), Some(vec![s, n, d]));
        assert_eq!(dims(&p, "y"), Some(vec![s, n, l]));

        // decoder scores the same draws the encoder made
        let z_q = q.value("z").expect("encoder z").to_vec3::<f32>()?;
        let z_p = p.value("z").expect("decoder z").to_vec3::<f32>()?;
        assert_eq!(z_q, z_p);

        let (q, _) = model.traces(&x, None, s)?;
        assert!(q.conditioned().is_empty());
        Ok(())
    }

    #[test]
    fn elbo_is_scalar_and_trains() -> Result<()> {
        let device = Device::Cpu;
        let (n, d, h, k, l, s) = (20, 5, 8, 2, 1, 4);

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = SemiSupervisedVae::new(d, h, k, l, vb)?;
        let mut adam = candle_nn::AdamW::new_lr(varmap.all_vars(), 1e-2)?;

        let x = Tensor::randn(0f32, 1f32, (n, d), &device)?;
        let y = Tensor::randn(0f32, 1f32, (n, l), &device)?;
        let config = ElboConfig::new(Some(0), Some(1));

        for _ in 0..5 {
            let (q, p) = model.traces(&x, Some(&y), s)?;
            let loss = elbo(&q, &p, &config)?
                .scale(-1.0)?
                .to_tensor(DType::F32, &device)?;
            assert!(loss.dims().is_empty());
            adam.backward_step(&loss)?;
        }

        let (q, p) = model.traces(&x, Some(&y), s)?;
        let terms = elbo_terms(&q, &p, &config)?;
        assert!(terms.log_like.to_f64()?.is_finite());
        assert!(terms.kl.to_f64()?.is_finite());
        assert!(terms.ml.to_f64()?.is_finite());
        assert!(terms.total(&config)?.to_f64()?.is_finite());
        Ok(())
    }
}
