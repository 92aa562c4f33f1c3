use anyhow::Result;
use clap::Parser;
use elbo_util::cli::{fit, Cli, Commands};

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Fit(args) => {
            fit::run(args)?;
        }
    }

    Ok(())
}
