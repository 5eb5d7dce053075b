use ndarray::array;
use tram_rs::testsystems::*;
use tram_rs::*;

fn main() {
    tracing_subscriber::fmt::init();

    let model = MetropolisModel::builder()
        .energies(array![
            [0.2, 1.4, 0.0, 0.9],
            [1.1, 0.3, 0.8, 0.1],
            [0.6, 0.6, 1.5, 0.4],
        ])
        .n_samples(5000)
        .build()
        .unwrap();
    let sample = model.sample_with_seed(2016);
    println!("pooled counts connected: {}", sample.is_connected());

    let estimate = Tram::builder()
        .count_matrices(sample.count_matrices.clone())
        .state_counts(sample.state_counts)
        .bias_energy_sequence(sample.bias_energy_sequence)
        .conf_state_sequence(sample.conf_state_sequence)
        .maxiter(100_000)
        .maxerr(1.0e-10)
        .build()
        .map_err(|e| {
            println!("{}", e);
            e
        })
        .unwrap()
        .estimate();

    println!("{:?}", estimate.conf_energies);
    println!("{:?}", estimate.therm_energies);

    let transition_matrices = estimate_transition_matrices(
        estimate.log_lagrangian_mult.view(),
        estimate.biased_conf_energies.view(),
        sample.count_matrices.view(),
        None,
    )
    .unwrap();

    println!("{:?}", transition_matrices)
}
