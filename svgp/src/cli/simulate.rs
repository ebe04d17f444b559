use anyhow::Result;
use clap::Args;
use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use super::io::write_rows;

#[derive(Args, Debug)]
pub struct SimulateArgs {
    #[arg(short, long, help = "Output file (`.gz` compresses, `stdout` prints)")]
    pub out: String,

    #[arg(short, long, default_value = "200")]
    pub n: usize,

    #[arg(long, default_value = "0.3", help = "Standard deviation of the additive noise")]
    pub noise_sd: f64,

    #[arg(long, default_value = "-1.0", allow_hyphen_values = true)]
    pub xmin: f64,

    #[arg(long, default_value = "1.0", allow_hyphen_values = true)]
    pub xmax: f64,

    #[arg(long, default_value = "42")]
    pub seed: u64,
}

/// y = sin(3x) + ε with x uniform on [xmin, xmax]
pub fn simulate_rows<R: Rng>(args: &SimulateArgs, rng: &mut R) -> Result<Vec<Vec<f64>>> {
    if !(args.xmax > args.xmin) {
        anyhow::bail!("empty input range [{}, {}]", args.xmin, args.xmax);
    }
    let noise = Normal::new(0.0, args.noise_sd)?;

    Ok((0..args.n)
        .map(|_| {
            let x = rng.random_range(args.xmin..args.xmax);
            let y = (3.0 * x).sin() + noise.sample(&mut *rng);
            vec![x, y]
        })
        .collect())
}

pub fn run(args: &SimulateArgs) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(args.seed);
    let rows = simulate_rows(args, &mut rng)?;
    write_rows(&rows, &["x", "y"], &args.out)?;
    info!("wrote {} rows to {}", rows.len(), args.out);
    Ok(())
}
