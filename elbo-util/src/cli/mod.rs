pub mod fit;

use clap::{Parser, Subcommand};

pub use fit::FitArgs;

#[derive(Parser)]
#[command(name = "elbo-util")]
#[command(about = "Semi-supervised ELBO estimators over probabilistic traces")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Train a semi-supervised VAE on simulated data
    Fit(FitArgs),
}
