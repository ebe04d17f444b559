pub mod fit;
pub mod io;
pub mod simulate;

use clap::{Parser, Subcommand};

pub use fit::{FitArgs, LikelihoodType, PosteriorOutputArg, QuadratureType};
pub use simulate::SimulateArgs;

#[derive(Parser)]
#[command(name = "svgp")]
#[command(about = "Sparse variational Gaussian process regression")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Fit an SVGP to a table of inputs and targets
    Fit(FitArgs),
    /// Write a noisy sin(3x) data set
    Simulate(SimulateArgs),
}
