use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer, VarBuilder, VarMap};
use clap::{Args, ValueEnum};
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};

use crate::montecarlo::{elbo_terms, ElboConfig, ElboDecomposition};
use crate::ssvae::SemiSupervisedVae;

/// Compute device selection
#[derive(ValueEnum, Clone, Debug, PartialEq)]
#[clap(rename_all = "lowercase")]
pub enum ComputeDevice {
    Cpu,
    Cuda,
    Metal,
}

impl ComputeDevice {
    /// Open the first device of this kind and seed its generator.
    ///
    /// The CPU back end has no seedable generator in candle, so only
    /// GPU devices are seeded here; host-side draws in `simulate` use
    /// their own `StdRng`.
    pub fn seeded_device(&self, seed: u64) -> Result<Device> {
        let device = match self {
            ComputeDevice::Cpu => return Ok(Device::Cpu),
            ComputeDevice::Cuda => Device::new_cuda(0)?,
            ComputeDevice::Metal => Device::new_metal(0)?,
        };
        device.set_seed(seed)?;
        Ok(device)
    }
}

#[derive(Args, Debug)]
pub struct FitArgs {
    #[arg(long, default_value = "500", help = "Number of simulated data points")]
    pub n: usize,

    #[arg(long, default_value = "10")]
    pub dim_obs: usize,

    #[arg(long, default_value = "2")]
    pub dim_latent: usize,

    #[arg(long, default_value = "1")]
    pub dim_label: usize,

    #[arg(long, default_value = "32")]
    pub dim_hidden: usize,

    #[arg(long, default_value = "0.2", help = "Fraction of data points with observed labels")]
    pub labeled: f64,

    #[arg(short, long, default_value = "10", help = "Monte Carlo samples per data point")]
    pub samples: usize,

    #[arg(long, default_value = "1000")]
    pub iters: usize,

    #[arg(long, default_value = "0.01")]
    pub lr: f64,

    #[arg(long, default_value = "0.1", help = "Coefficient of the supervised (ML) term")]
    pub alpha: f64,

    #[arg(long, default_value = "1.0", help = "Coefficient of the KL term")]
    pub beta: f64,

    #[arg(long, default_value = "42")]
    pub seed: u64,

    /// Candle device
    #[arg(long, value_enum, default_value = "cpu")]
    pub device: ComputeDevice,

    #[arg(short, long)]
    pub verbose: bool,
}

/// Simulated linear-Gaussian data split into labeled and unlabeled parts
struct SimData {
    x_labeled: Option<Tensor>,
    y_labeled: Option<Tensor>,
    x_unlabeled: Option<Tensor>,
}

/// `rows x cols` standard normal draws
fn rnorm(rows: usize, cols: usize, rng: &mut StdRng, device: &Device) -> Result<Tensor> {
    let data: Vec<f32> = (0..rows * cols).map(|_| StandardNormal.sample(rng)).collect();
    Ok(Tensor::from_vec(data, (rows, cols), device)?)
}

/// z ~ N(0, I), x = z W + 0.1 ε, y = z V
fn simulate(args: &FitArgs, device: &Device) -> Result<SimData> {
    let (n, d, k, l) = (args.n, args.dim_obs, args.dim_latent, args.dim_label);
    let mut rng = StdRng::seed_from_u64(args.seed);

    let z_nk = rnorm(n, k, &mut rng, device)?;
    let w_kd = rnorm(k, d, &mut rng, device)?;
    let v_kl = rnorm(k, l, &mut rng, device)?;

    let noise_nd = (rnorm(n, d, &mut rng, device)? * 0.1)?;
    let x_nd = (z_nk.matmul(&w_kd)? + noise_nd)?;
    let y_nl = z_nk.matmul(&v_kl)?;

    let n_labeled = ((n as f64) * args.labeled).round() as usize;
    let n_unlabeled = n - n_labeled;
    info!("{} labeled, {} unlabeled data points", n_labeled, n_unlabeled);

    let take = |x: &Tensor, start: usize, len: usize| -> Result<Option<Tensor>> {
        Ok(if len > 0 {
            Some(x.narrow(0, start, len)?)
        } else {
            None
        })
    };

    Ok(SimData {
        x_labeled: take(&x_nd, 0, n_labeled)?,
        y_labeled: take(&y_nl, 0, n_labeled)?,
        x_unlabeled: take(&x_nd, n_labeled, n_unlabeled)?,
    })
}

/// ELBO terms of the labeled and the unlabeled part, one forward pass each
fn forward_terms(
    model: &SemiSupervisedVae,
    data: &SimData,
    num_samples: usize,
    config: &ElboConfig,
) -> Result<Vec<ElboDecomposition>> {
    let mut ret = vec![];
    if let (Some(x), Some(y)) = (&data.x_labeled, &data.y_labeled) {
        let (q, p) = model.traces(x, Some(y), num_samples)?;
        ret.push(elbo_terms(&q, &p, config)?);
    }
    if let Some(x) = &data.x_unlabeled {
        let (q, p) = model.traces(x, None, num_samples)?;
        ret.push(elbo_terms(&q, &p, config)?);
    }
    Ok(ret)
}

fn report(terms: &[ElboDecomposition], config: &ElboConfig) -> Result<(f64, f64, f64, f64)> {
    let mut ret = (0., 0., 0., 0.);
    for t in terms {
        ret.0 += t.log_like.to_f64()?;
        ret.1 += t.kl.to_f64()?;
        ret.2 += t.ml.to_f64()?;
        ret.3 += t.total(config)?.to_f64()?;
    }
    Ok(ret)
}

pub fn run(args: &FitArgs) -> Result<()> {
    if !(0.0..=1.0).contains(&args.labeled) {
        anyhow::bail!("--labeled must be in [0, 1], got {}", args.labeled);
    }
    if args.samples == 0 || args.iters == 0 || args.n == 0 {
        anyhow::bail!("--n, --samples and --iters must be positive");
    }

    let device = args.device.seeded_device(args.seed)?;
    info!("Using device: {:?}", device);

    let data = simulate(args, &device)?;

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = SemiSupervisedVae::new(
        args.dim_obs,
        args.dim_hidden,
        args.dim_latent,
        args.dim_label,
        vb,
    )?;
    info!(
        "model: {} observed, {} latent, {} label dimensions",
        model.dim_obs(),
        model.dim_latent(),
        model.dim_label()
    );

    let config = ElboConfig::new(Some(0), Some(1))
        .with_alpha(args.alpha)
        .with_beta(args.beta);
    info!("ELBO: alpha = {}, beta = {}", config.alpha, config.beta);

    // Create optimizer AFTER the model so varmap contains all variables
    let mut adam = AdamW::new_lr(varmap.all_vars(), args.lr)?;

    let pb = ProgressBar::new(args.iters as u64);
    if args.verbose {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    }

    for iter in 0..args.iters {
        let terms = forward_terms(&model, &data, args.samples, &config)?;

        let mut loss = Tensor::zeros((), DType::F32, &device)?;
        for t in terms.iter() {
            let elbo = t.total(&config)?.to_tensor(DType::F32, &device)?;
            loss = (loss - elbo)?;
        }
        adam.backward_step(&loss)?;

        let (llik, kl, ml, elbo) = report(&terms, &config)?;

        pb.inc(1);
        if args.verbose && (iter % 50 == 0 || iter == args.iters - 1) {
            info!(
                "iter {:4}: ELBO = {:10.4}, llik = {:10.4}, KL = {:10.4}, ML = {:10.4}",
                iter, elbo, llik, kl, ml
            );
        }
    }
    pb.finish_and_clear();

    let terms = forward_terms(&model, &data, args.samples, &config)?;
    let (llik, kl, ml, elbo) = report(&terms, &config)?;
    info!("done after {} iterations", args.iters);

    println!("log_like\t{:.4}", llik);
    println!("kl\t{:.4}", kl);
    println!("ml\t{:.4}", ml);
    println!("elbo\t{:.4}", elbo);

    Ok(())
}
