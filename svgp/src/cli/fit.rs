use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::{Optimizer, VarBuilder, VarMap};
use clap::{Args, ValueEnum};
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::{info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::io::Write;

use super::io::{open_buf_writer, read_regression_table, write_rows, RegressionTable};
use crate::config::{PosteriorOutput, SvgpConfig, TrainConfig};
use crate::elbo::Minibatch;
use crate::likelihood::{BernoulliLikelihood, GaussianLikelihood, Likelihood, PoissonLikelihood};
use crate::linalg::scalar_value;
use crate::model::{SvgpModel, SvgpParams};
use crate::prior_process::SquaredExponentialGp;
use crate::quadrature::QuadratureStrategy;

#[derive(Clone, Debug, ValueEnum)]
pub enum LikelihoodType {
    /// y ~ N(f, σ²), σ² learned
    Gaussian,
    /// y ~ Bernoulli(sigmoid(f))
    Bernoulli,
    /// y ~ Poisson(exp(f))
    Poisson,
}

#[derive(Clone, Debug, ValueEnum)]
pub enum QuadratureType {
    /// Closed form (Gaussian likelihood only)
    Analytic,
    GaussHermite,
    MonteCarlo,
}

#[derive(Clone, Debug, ValueEnum)]
pub enum PosteriorOutputArg {
    Latent,
    Observation,
}

#[derive(Args, Debug)]
pub struct FitArgs {
    #[arg(help = "Numeric table; inputs in all but the last column, target in the last (`.gz` ok)")]
    pub data: String,

    #[arg(short, long, help = "Output prefix (creates {out}.pred.tsv, {out}.params.json, {out}.elbo.tsv)")]
    pub out: String,

    #[arg(short = 'm', long, default_value = "20")]
    pub num_inducing: usize,

    #[arg(short, long, default_value = "gaussian")]
    pub likelihood: LikelihoodType,

    #[arg(short, long, default_value = "gauss-hermite")]
    pub quadrature: QuadratureType,

    #[arg(long, default_value = "20", help = "Gauss-Hermite nodes or Monte Carlo samples")]
    pub quadrature_size: usize,

    #[arg(long, default_value = "latent")]
    pub posterior_output: PosteriorOutputArg,

    #[arg(long, default_value = "1.0")]
    pub kernel_variance: f64,

    #[arg(long, default_value = "0.5")]
    pub lengthscale: f64,

    #[arg(long, default_value = "0.1", help = "Initial noise variance (Gaussian likelihood)")]
    pub noise_var: f64,

    #[arg(long, help = "Learn a constant prior mean")]
    pub constant_mean: bool,

    #[arg(long, default_value = "1e-6")]
    pub jitter: f64,

    #[arg(long, default_value = "1000")]
    pub iters: usize,

    #[arg(long, default_value = "0.01")]
    pub lr: f64,

    #[arg(long, default_value = "100")]
    pub batch_size: usize,

    #[arg(long, default_value = "42")]
    pub seed: u64,

    #[arg(long, help = "Hide the progress bar")]
    pub no_progress: bool,

    #[arg(short, long)]
    pub verbose: bool,
}

impl FitArgs {
    fn svgp_config(&self) -> SvgpConfig {
        let quadrature = match self.quadrature {
            QuadratureType::Analytic => QuadratureStrategy::Analytic,
            QuadratureType::GaussHermite => QuadratureStrategy::GaussHermite {
                num_points: self.quadrature_size,
            },
            QuadratureType::MonteCarlo => QuadratureStrategy::MonteCarlo {
                num_samples: self.quadrature_size,
            },
        };
        let posterior_output = match self.posterior_output {
            PosteriorOutputArg::Latent => PosteriorOutput::Latent,
            PosteriorOutputArg::Observation => PosteriorOutput::Observation,
        };
        SvgpConfig {
            jitter: self.jitter,
            quadrature,
            posterior_output,
        }
    }

    fn train_config(&self) -> TrainConfig {
        TrainConfig {
            learning_rate: self.lr,
            batch_size: self.batch_size,
            num_iters: self.iters,
            seed: self.seed,
            verbose: self.verbose,
            show_progress: !self.no_progress,
        }
    }
}

///
/// Inducing points at evenly spaced quantiles (k + ½) / M of each
/// input column, linearly interpolated.
///
/// Columns are handled one at a time, so with more than one input the
/// points lie on a single monotone curve through the column quantiles.
/// `initial_inducing_points` uses k-means for that case.
///
pub fn quantile_inducing_points(inputs: &[Vec<f64>], num_inducing: usize) -> Vec<Vec<f64>> {
    let n = inputs.len();
    let d = inputs.first().map(|r| r.len()).unwrap_or(0);
    if n == 0 || num_inducing == 0 {
        return vec![];
    }

    let sorted_cols: Vec<Vec<f64>> = (0..d)
        .map(|j| {
            let mut col: Vec<f64> = inputs.iter().map(|r| r[j]).collect();
            col.sort_by(|a, b| a.total_cmp(b));
            col
        })
        .collect();

    (0..num_inducing)
        .map(|k| {
            let pos = (k as f64 + 0.5) / num_inducing as f64 * (n - 1) as f64;
            let (lo, frac) = (pos.floor() as usize, pos - pos.floor());
            let hi = (lo + 1).min(n - 1);
            sorted_cols
                .iter()
                .map(|col| col[lo] + frac * (col[hi] - col[lo]))
                .collect()
        })
        .collect()
}

fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

///
/// Inducing points as k-means centroids of the input rows. Seeds are
/// picked farthest-first starting from a row drawn with `rng`. A
/// centroid that loses all its rows stays where it was.
///
pub fn kmeans_inducing_points(
    inputs: &[Vec<f64>],
    num_inducing: usize,
    max_iter: usize,
    rng: &mut StdRng,
) -> Vec<Vec<f64>> {
    let n = inputs.len();
    if n == 0 || num_inducing == 0 {
        return vec![];
    }
    let k = num_inducing.min(n);
    let d = inputs[0].len();

    // farthest-first seeding from one random row
    let first = rng.random_range(0..n);
    let mut centroids: Vec<Vec<f64>> = vec![inputs[first].clone()];
    let mut nearest_dist: Vec<f64> = inputs
        .iter()
        .map(|row| squared_distance(row, &inputs[first]))
        .collect();
    while centroids.len() < k {
        let far = (0..n)
            .max_by(|&a, &b| nearest_dist[a].total_cmp(&nearest_dist[b]))
            .unwrap_or(0);
        let z = inputs[far].clone();
        for (dist, row) in nearest_dist.iter_mut().zip(inputs) {
            *dist = dist.min(squared_distance(row, &z));
        }
        centroids.push(z);
    }
    let mut membership = vec![usize::MAX; n];

    for _ in 0..max_iter {
        let mut changed = false;
        for (i, row) in inputs.iter().enumerate() {
            let nearest = centroids
                .iter()
                .enumerate()
                .map(|(c, z)| (c, squared_distance(row, z)))
                .min_by(|a, b| a.1.total_cmp(&b.1))
                .map(|(c, _)| c)
                .unwrap_or(0);
            if membership[i] != nearest {
                membership[i] = nearest;
                changed = true;
            }
        }
        if !changed {
            break;
        }

        let mut sums = vec![vec![0f64; d]; k];
        let mut counts = vec![0usize; k];
        for (row, &c) in inputs.iter().zip(membership.iter()) {
            counts[c] += 1;
            for (s, x) in sums[c].iter_mut().zip(row) {
                *s += x;
            }
        }
        for c in 0..k {
            if counts[c] > 0 {
                centroids[c] = sums[c].iter().map(|s| s / counts[c] as f64).collect();
            }
        }
    }
    centroids
}

/// Quantiles for a single input column, k-means otherwise
pub fn initial_inducing_points(
    inputs: &[Vec<f64>],
    num_inducing: usize,
    rng: &mut StdRng,
) -> Vec<Vec<f64>> {
    match inputs.first().map(|r| r.len()) {
        Some(1) => quantile_inducing_points(inputs, num_inducing),
        _ => kmeans_inducing_points(inputs, num_inducing, KMEANS_MAX_ITER, rng),
    }
}

const KMEANS_MAX_ITER: usize = 50;

///
/// Targets must be in the likelihood's support: {0, 1} for Bernoulli,
/// non-negative integers for Poisson, finite for Gaussian
///
pub fn check_targets(likelihood: &LikelihoodType, targets: &[f64]) -> Result<()> {
    for (i, &y) in targets.iter().enumerate() {
        let ok = match likelihood {
            LikelihoodType::Gaussian => y.is_finite(),
            LikelihoodType::Bernoulli => y == 0.0 || y == 1.0,
            LikelihoodType::Poisson => y.is_finite() && y >= 0.0 && y.fract() == 0.0,
        };
        if !ok {
            anyhow::bail!(
                "data row {}: target {} is outside the support of the {:?} likelihood",
                i + 1,
                y,
                likelihood
            );
        }
    }
    Ok(())
}

fn to_matrix(rows: &[Vec<f64>], device: &Device) -> Result<Tensor> {
    let nrow = rows.len();
    let ncol = rows.first().map(|r| r.len()).unwrap_or(0);
    let flat: Vec<f64> = rows.iter().flatten().copied().collect();
    Ok(Tensor::from_vec(flat, (nrow, ncol), device)?)
}

/// Cycles through shuffled row indices, reshuffling after each pass
struct BatchSampler {
    order: Vec<u32>,
    cursor: usize,
    batch_size: usize,
}

impl BatchSampler {
    fn new(n: usize, batch_size: usize) -> Self {
        Self {
            order: (0..n as u32).collect(),
            cursor: n,
            batch_size: batch_size.clamp(1, n.max(1)),
        }
    }

    fn next_batch(&mut self, rng: &mut StdRng) -> &[u32] {
        if self.cursor + self.batch_size > self.order.len() {
            self.order.shuffle(rng);
            self.cursor = 0;
        }
        let start = self.cursor;
        self.cursor += self.batch_size;
        &self.order[start..self.cursor]
    }
}

#[derive(Serialize)]
struct FittedParams {
    kernel_variance: f64,
    kernel_lengthscale: f64,
    constant_mean: Option<f64>,
    noise_variance: Option<f64>,
    inducing: Vec<Vec<f64>>,
    q_mean: Vec<f64>,
    q_sqrt: Vec<Vec<f64>>,
    elbo: f64,
    config: SvgpConfig,
}

pub fn run(args: &FitArgs) -> Result<()> {
    let device = Device::Cpu;
    let train_config = args.train_config();

    let RegressionTable { inputs, targets } = read_regression_table(&args.data)?;
    let n = targets.len();
    info!("read {} rows x {} inputs from {}", n, inputs[0].len(), args.data);

    let num_inducing = if args.num_inducing > n {
        warn!("{} inducing points for {} rows; using {}", args.num_inducing, n, n);
        n
    } else {
        args.num_inducing
    };
    if num_inducing == 0 {
        anyhow::bail!("need at least one inducing point");
    }

    check_targets(&args.likelihood, &targets)?;

    let x = to_matrix(&inputs, &device)?;
    let y = Tensor::from_vec(targets.clone(), n, &device)?;
    let mut init_rng = StdRng::seed_from_u64(train_config.seed);
    let z_init = to_matrix(
        &initial_inducing_points(&inputs, num_inducing, &mut init_rng),
        &device,
    )?;

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F64, &device);

    let mut gp = SquaredExponentialGp::new(vb.pp("kernel"), args.kernel_variance, args.lengthscale)?;
    if args.constant_mean {
        let y_bar = targets.iter().sum::<f64>() / n as f64;
        gp = gp.with_constant_mean(vb.pp("mean"), y_bar)?;
    }

    let likelihood: Likelihood = match args.likelihood {
        LikelihoodType::Gaussian => GaussianLikelihood::learnable(vb.pp("noise"), args.noise_var)?.into(),
        LikelihoodType::Bernoulli => BernoulliLikelihood::new().into(),
        LikelihoodType::Poisson => PoissonLikelihood::new().into(),
    };

    let svgp_config = args.svgp_config();
    svgp_config.validate(&likelihood)?;
    let (params, param_vars) = SvgpParams::from_prior(&gp, &z_init, svgp_config.jitter)?;
    let model = SvgpModel::new(gp, params, likelihood, svgp_config)?;

    let mut vars = varmap.all_vars();
    vars.extend(param_vars);
    let mut optimizer = candle_nn::AdamW::new_lr(vars, train_config.learning_rate)?;

    let elbo_trace = train(&model, &x, &y, &mut optimizer, &train_config)?;

    let mut rng = StdRng::seed_from_u64(train_config.seed.wrapping_add(1));
    let final_elbo = scalar_value(&model.elbo(&Minibatch::full(x.clone(), y.clone())?, &mut rng)?.elbo)?;
    info!("final ELBO (full data): {:.4}", final_elbo);

    write_predictions(&model, &x, &inputs, &format!("{}.pred.tsv", args.out))?;
    write_params(&model, final_elbo, &format!("{}.params.json", args.out))?;

    let trace_rows: Vec<Vec<f64>> = elbo_trace.iter().map(|&e| vec![e]).collect();
    write_rows(&trace_rows, &["elbo"], &format!("{}.elbo.tsv", args.out))?;

    info!("done");
    Ok(())
}

///
/// AdamW on shuffled minibatches; returns the ELBO of each step
///
fn train(
    model: &SvgpModel<SquaredExponentialGp>,
    x: &Tensor,
    y: &Tensor,
    optimizer: &mut impl Optimizer,
    train_config: &TrainConfig,
) -> Result<Vec<f64>> {
    let n = y.dims1()?;
    let iters = train_config.num_iters;
    let mut rng = StdRng::seed_from_u64(train_config.seed);
    let mut sampler = BatchSampler::new(n, train_config.batch_size);
    let mut trace = Vec::with_capacity(iters);

    let pb = ProgressBar::new(iters as u64);
    if !train_config.show_progress || train_config.verbose {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    }

    info!("Training for {} iterations, batch size {}", iters, sampler.batch_size);

    for i in 0..iters {
        let idx = sampler.next_batch(&mut rng).to_vec();
        let nb = idx.len();
        let idx = Tensor::from_vec(idx, nb, x.device())?;
        let batch = Minibatch::new(x.index_select(&idx, 0)?, y.index_select(&idx, 0)?, n)?;

        let terms = model.elbo(&batch, &mut rng)?;
        optimizer.backward_step(&terms.loss()?)?;

        let elbo = scalar_value(&terms.elbo)?;
        trace.push(elbo);
        pb.inc(1);

        if train_config.verbose && (i % 50 == 0 || i == iters - 1) {
            info!(
                "iter {:4}: ELBO = {:10.4}, KL = {:8.4}",
                i,
                elbo,
                scalar_value(&terms.kl)?
            );
        }
    }
    pb.finish_and_clear();

    Ok(trace)
}

fn write_predictions(
    model: &SvgpModel<SquaredExponentialGp>,
    x: &Tensor,
    inputs: &[Vec<f64>],
    output_file: &str,
) -> Result<()> {
    let posterior = model.posterior()?;
    let pred = posterior.predict_marginals(x)?;
    let mean = pred.mean.to_vec1::<f64>()?;
    let var = pred.var.to_vec1::<f64>()?;

    let d = inputs.first().map(|r| r.len()).unwrap_or(0);
    let mut header: Vec<String> = (0..d).map(|j| format!("x{}", j + 1)).collect();
    header.push("mean".into());
    header.push("var".into());
    let header: Vec<&str> = header.iter().map(String::as_str).collect();

    let rows: Vec<Vec<f64>> = inputs
        .iter()
        .zip(mean.iter().zip(var.iter()))
        .map(|(xi, (&m, &v))| {
            let mut row = xi.clone();
            row.push(m);
            row.push(v);
            row
        })
        .collect();

    write_rows(&rows, &header, output_file)?;
    info!("wrote {:?} predictions to {}", posterior.output(), output_file);
    Ok(())
}

fn write_params(
    model: &SvgpModel<SquaredExponentialGp>,
    elbo: f64,
    output_file: &str,
) -> Result<()> {
    let gp = model.prior();
    let params = model.params();
    let fitted = FittedParams {
        kernel_variance: gp.variance()?,
        kernel_lengthscale: gp.lengthscale()?,
        constant_mean: gp.constant_mean()?,
        noise_variance: model
            .likelihood()
            .as_gaussian()
            .map(|g| g.noise_variance())
            .transpose()?,
        inducing: params.inducing.to_vec2::<f64>()?,
        q_mean: params.q_mean.to_vec1::<f64>()?,
        q_sqrt: params.q_sqrt()?.to_vec2::<f64>()?,
        elbo,
        config: model.config().clone(),
    };

    let mut buf = open_buf_writer(output_file)?;
    serde_json::to_writer_pretty(&mut buf, &fitted)?;
    buf.flush()?;
    info!("wrote parameters to {}", output_file);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantile_inducing_points() {
        let inputs: Vec<Vec<f64>> = (0..101).map(|i| vec![-1.0 + 0.02 * i as f64]).collect();
        let z = quantile_inducing_points(&inputs, 5);
        let expected = [-0.8, -0.4, 0.0, 0.4, 0.8];
        assert_eq!(z.len(), 5);
        for (zk, e) in z.iter().zip(expected.iter()) {
            assert!((zk[0] - e).abs() < 1e-9, "{} vs {}", zk[0], e);
        }
    }

    #[test]
    fn test_kmeans_inducing_points_spread_over_clusters() {
        let mut rng = StdRng::seed_from_u64(7);
        let corners = [[-1.0, -1.0], [1.0, -1.0], [-1.0, 1.0], [1.0, 1.0]];
        let inputs: Vec<Vec<f64>> = (0..80)
            .map(|i| {
                let c = corners[i % 4];
                let jitter = 0.01 * (i / 4) as f64;
                vec![c[0] + jitter, c[1] - jitter]
            })
            .collect();

        let z = kmeans_inducing_points(&inputs, 4, 50, &mut rng);
        assert_eq!(z.len(), 4);
        let mut hit = [false; 4];
        for zk in &z {
            for (c, corner) in corners.iter().enumerate() {
                if squared_distance(zk, corner) < 0.1 {
                    hit[c] = true;
                }
            }
        }
        assert_eq!(hit, [true; 4], "centroids {:?}", z);
    }

    #[test]
    fn test_multi_column_inputs_are_not_on_one_line() {
        let mut rng = StdRng::seed_from_u64(1);
        // x2 = -x1 on half the rows, x2 = x1 on the other half
        let inputs: Vec<Vec<f64>> = (0..60)
            .map(|i| {
                let t = -1.0 + 2.0 * (i / 2) as f64 / 29.0;
                if i % 2 == 0 { vec![t, t] } else { vec![t, -t] }
            })
            .collect();
        let z = initial_inducing_points(&inputs, 6, &mut rng);
        assert_eq!(z.len(), 6);
        assert!(z.iter().any(|p| p[0] * p[1] < -0.05), "{:?}", z);
        assert!(z.iter().any(|p| p[0] * p[1] > 0.05), "{:?}", z);
    }

    #[test]
    fn test_targets_checked_against_likelihood() {
        assert!(check_targets(&LikelihoodType::Bernoulli, &[0.0, 1.0, 1.0]).is_ok());
        assert!(check_targets(&LikelihoodType::Poisson, &[0.0, 3.0, 12.0]).is_ok());
        assert!(check_targets(&LikelihoodType::Gaussian, &[-2.5, 0.3]).is_ok());

        let err = check_targets(&LikelihoodType::Bernoulli, &[0.0, 0.3]).unwrap_err();
        assert!(err.to_string().contains("data row 2"), "{}", err);
        assert!(check_targets(&LikelihoodType::Poisson, &[1.0, -2.0]).is_err());
        assert!(check_targets(&LikelihoodType::Poisson, &[1.5]).is_err());
        assert!(check_targets(&LikelihoodType::Gaussian, &[f64::NAN]).is_err());
    }

    #[test]
    fn test_batch_sampler_covers_every_row_per_pass() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut sampler = BatchSampler::new(10, 5);
        let mut seen: Vec<u32> = vec![];
        seen.extend_from_slice(sampler.next_batch(&mut rng));
        seen.extend_from_slice(sampler.next_batch(&mut rng));
        seen.sort();
        assert_eq!(seen, (0..10).collect::<Vec<u32>>());

        let mut oversized = BatchSampler::new(4, 100);
        assert_eq!(oversized.next_batch(&mut rng).len(), 4);
    }
}
