use anyhow::Result;
use clap::Parser;
use svgp::cli::{fit, simulate, Cli, Commands};

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Fit(args) => {
            fit::run(args)?;
        }
        Commands::Simulate(args) => {
            simulate::run(args)?;
        }
    }

    Ok(())
}
