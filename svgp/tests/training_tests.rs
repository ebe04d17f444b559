use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer, VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use svgp::linalg::{diag, scalar_value};
use svgp::{
    BernoulliLikelihood, GaussianLikelihood, Likelihood, Minibatch, QuadratureStrategy,
    SquaredExponentialGp, SvgpConfig, SvgpModel, SvgpParams,
};

fn evenly_spaced(m: usize, lo: f64, hi: f64) -> Vec<f64> {
    (0..m)
        .map(|i| lo + (hi - lo) * i as f64 / (m as f64 - 1.0))
        .collect()
}

fn sine_batch(n: usize, noise_var: f64, seed: u64) -> anyhow::Result<Minibatch> {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0, noise_var.sqrt())?;
    let xs: Vec<f64> = (0..n).map(|_| rng.random_range(-1.0..1.0)).collect();
    let ys: Vec<f64> = xs
        .iter()
        .map(|x| (3.0 * x).sin() + noise.sample(&mut rng))
        .collect();
    Ok(Minibatch::full(
        Tensor::from_vec(xs, (n, 1), &Device::Cpu)?,
        Tensor::from_vec(ys, n, &Device::Cpu)?,
    )?)
}

/// Learnable kernel, Var-backed (z, m, S), everything handed to AdamW
fn trainable_model(
    likelihood: Likelihood,
    quadrature: QuadratureStrategy,
) -> anyhow::Result<(SvgpModel<SquaredExponentialGp>, AdamW)> {
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F64, &device);
    let gp = SquaredExponentialGp::new(vb.pp("kernel"), 1.0, 0.5)?;

    let z = Tensor::from_vec(evenly_spaced(5, -1.0, 1.0), (5, 1), &device)?;
    let (params, param_vars) = SvgpParams::trainable(&z)?;

    let config = SvgpConfig {
        quadrature,
        ..Default::default()
    };
    let model = SvgpModel::new(gp, params, likelihood, config)?;

    let mut vars = varmap.all_vars();
    vars.extend(param_vars);
    assert_eq!(vars.len(), 6);
    let optimizer = AdamW::new_lr(vars, 0.05)?;
    Ok((model, optimizer))
}

#[test]
fn loss_decreases_on_sine_data() -> anyhow::Result<()> {
    let lik = GaussianLikelihood::new(0.1, DType::F64, &Device::Cpu)?;
    let (model, mut optimizer) = trainable_model(lik.into(), QuadratureStrategy::default())?;
    let batch = sine_batch(100, 0.1, 11)?;
    let mut rng = StdRng::seed_from_u64(0);

    let initial = scalar_value(&model.loss(&batch, &mut rng)?)?;
    assert!(initial.is_finite());

    for _ in 0..30 {
        let loss = model.loss(&batch, &mut rng)?;
        optimizer.backward_step(&loss)?;
    }

    let last = scalar_value(&model.loss(&batch, &mut rng)?)?;
    assert!(last.is_finite());
    assert!(last < initial, "loss went from {} to {}", initial, last);

    // inducing points moved
    let z = model.params().inducing.flatten_all()?.to_vec1::<f64>()?;
    assert!(z
        .iter()
        .zip(evenly_spaced(5, -1.0, 1.0))
        .any(|(a, b)| (a - b).abs() > 1e-6));

    let grid = Tensor::from_vec(evenly_spaced(41, -1.5, 1.5), (41, 1), &Device::Cpu)?;
    let pred = model.posterior()?.predict(&grid)?;
    for v in diag(&pred.cov)?.to_vec1::<f64>()? {
        assert!(v >= 0.0, "negative predictive variance {}", v);
    }
    Ok(())
}

#[test]
fn analytic_and_quadrature_training_agree() -> anyhow::Result<()> {
    let batch = sine_batch(60, 0.1, 5)?;
    let mut traces = vec![];

    for quadrature in [
        QuadratureStrategy::Analytic,
        QuadratureStrategy::GaussHermite { num_points: 20 },
    ] {
        let lik = GaussianLikelihood::new(0.1, DType::F64, &Device::Cpu)?;
        let (model, mut optimizer) = trainable_model(lik.into(), quadrature)?;
        let mut rng = StdRng::seed_from_u64(0);
        let mut trace = vec![];
        for _ in 0..10 {
            let loss = model.loss(&batch, &mut rng)?;
            trace.push(scalar_value(&loss)?);
            optimizer.backward_step(&loss)?;
        }
        traces.push(trace);
    }

    for (a, b) in traces[0].iter().zip(traces[1].iter()) {
        assert!((a - b).abs() < 1e-6 * a.abs().max(1.0), "{} vs {}", a, b);
    }
    Ok(())
}

#[test]
fn classification_with_monte_carlo_quadrature() -> anyhow::Result<()> {
    let n = 80;
    let xs = evenly_spaced(n, -1.0, 1.0);
    let ys: Vec<f64> = xs.iter().map(|x| if (3.0 * x).sin() > 0.0 { 1.0 } else { 0.0 }).collect();
    let batch = Minibatch::full(
        Tensor::from_vec(xs, (n, 1), &Device::Cpu)?,
        Tensor::from_vec(ys, n, &Device::Cpu)?,
    )?;

    let (model, mut optimizer) = trainable_model(
        BernoulliLikelihood::new().into(),
        QuadratureStrategy::MonteCarlo { num_samples: 32 },
    )?;

    // compare on a deterministic estimate
    let gh = SvgpConfig::default().quadrature;
    let full_ell = |model: &SvgpModel<SquaredExponentialGp>| -> anyhow::Result<f64> {
        let post = model.posterior()?;
        let latent = post.predict_latent_marginals(batch.x())?;
        let ell = gh.expected_log_likelihood(
            model.likelihood(),
            batch.y(),
            &latent.mean,
            &latent.var,
            &mut StdRng::seed_from_u64(0),
        )?;
        Ok(scalar_value(&ell)? - scalar_value(&model.kl()?)?)
    };

    let before = full_ell(&model)?;
    let mut rng = StdRng::seed_from_u64(1);
    for _ in 0..40 {
        let loss = model.loss(&batch, &mut rng)?;
        optimizer.backward_step(&loss)?;
    }
    let after = full_ell(&model)?;

    assert!(after > before, "ELBO went from {} to {}", before, after);
    Ok(())
}

#[test]
fn aggressive_learning_rate_keeps_square_root_valid() -> anyhow::Result<()> {
    let batch = sine_batch(100, 0.09, 21)?;
    let mut rng = StdRng::seed_from_u64(0);

    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F64, &device);
    let gp = SquaredExponentialGp::new(vb.pp("kernel"), 1.0, 0.5)?;
    let z = Tensor::from_vec(evenly_spaced(10, -1.0, 1.0), (10, 1), &device)?;
    let (params, param_vars) = SvgpParams::trainable(&z)?;
    let lik = GaussianLikelihood::learnable(vb.pp("noise"), 0.1)?;
    let model = SvgpModel::new(gp, params, lik.into(), SvgpConfig::default())?;

    let mut vars = varmap.all_vars();
    vars.extend(param_vars);
    let mut optimizer = AdamW::new_lr(vars, 0.1)?;

    for step in 0..300 {
        let loss = model.loss(&batch, &mut rng)?;
        let value = scalar_value(&loss)?;
        assert!(value.is_finite(), "loss {} at step {}", value, step);
        optimizer.backward_step(&loss)?;
    }

    for s_ii in diag(&model.params().q_sqrt()?)?.to_vec1::<f64>()? {
        assert!(s_ii > 0.0);
    }
    Ok(())
}
