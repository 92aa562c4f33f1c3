pub mod cli;
pub mod log_prob;
pub mod montecarlo;
pub mod ssvae;
pub mod trace;

pub use candle_core;
pub use candle_nn;
