use anyhow::Result;
use itertools::Itertools;
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tram_rs::testsystems::*;
use tram_rs::*;

/// Energies of a double well on `n_bins` bins plus a harmonic umbrella at each centre
fn umbrella_energies(n_bins: usize, centres: &[f64], spring: f64) -> Array2<f64> {
    let x = |i: usize| 2.0 * i as f64 / (n_bins - 1) as f64 - 1.0;
    Array2::from_shape_fn((centres.len(), n_bins), |(k, i)| {
        let well = 4.0 * (x(i).powi(2) - 1.0).powi(2);
        well + 0.5 * spring * (x(i) - centres[k]).powi(2)
    })
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let n_bins = 12;
    let centres = [-1.0, -0.5, 0.0, 0.5, 1.0];
    let model = MetropolisModel::builder()
        .energies(umbrella_energies(n_bins, &centres, 8.0))
        .n_samples(20_000)
        .initial_state(n_bins / 2)
        .build()?;

    let mut rng = StdRng::seed_from_u64(7);
    let sample = (0..10)
        .map(|_| model.sample_from(&mut rng))
        .find(Sample::is_connected)
        .ok_or_else(|| anyhow::anyhow!("no connected sample in 10 attempts"))?;

    let estimate = tram::estimate(
        sample.count_matrices.view(),
        sample.state_counts.view(),
        sample.bias_energy_sequence.view(),
        sample.conf_state_sequence.view(),
        100_000,
        1.0e-10,
        100,
    )?;
    println!("converged: {} after {} iterations", estimate.converged, estimate.iterations);

    let mut mu = Array1::zeros(sample.conf_state_sequence.len());
    get_pointwise_unbiased_free_energies(
        None,
        estimate.log_lagrangian_mult.view(),
        estimate.biased_conf_energies.view(),
        sample.count_matrices.view(),
        sample.bias_energy_sequence.view(),
        sample.conf_state_sequence.view(),
        sample.state_counts.view(),
        None,
        mu.view_mut(),
    )?;

    // Coarse-grain pairs of neighbouring bins into one label
    let labels: Array1<usize> = sample.conf_state_sequence.mapv(|i| i / 2);
    let mut pmf = Array1::zeros(n_bins / 2);
    get_unbiased_user_free_energies(mu.view(), labels.view(), pmf.view_mut())?;

    let lowest = pmf.iter().cloned().fold(f64::INFINITY, f64::min);
    println!(
        "{}",
        pmf.iter()
            .enumerate()
            .map(|(l, f)| format!("{:>2}: {:6.3}", l, f - lowest))
            .join("\n")
    );

    // Bias energies are relative to the first umbrella, so that is the ensemble reweighted to
    let exact: Vec<f64> = model
        .energies()
        .row(0)
        .iter()
        .tuples()
        .map(|(a, b)| -((-a).exp() + (-b).exp()).ln())
        .collect();
    let exact_lowest = exact.iter().cloned().fold(f64::INFINITY, f64::min);
    println!("{:?}", exact.iter().map(|f| f - exact_lowest).collect::<Vec<_>>());

    Ok(())
}
