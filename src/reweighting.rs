//! Per-sample reweighting and free-energy profiles over arbitrary labelings.
//!
//! The pointwise free energy of a sample is minus the log of its statistical weight in the
//! unbiased (or one chosen biased) ensemble. Aggregating these weights over any labeling of the
//! samples gives a potential of mean force along that labeling without re-running the estimator.

use crate::errors::*;
use crate::lse::logsumexp;
use crate::tram::check_bias_energies;
use crate::update::{compute_log_r_k_i, compute_pointwise_free_energies};
use ndarray::{Array2, ArrayView1, ArrayView2, ArrayView3, ArrayViewMut1};

/// Compute the pointwise free energy $\mu(x)$ of every sample of the concatenated trajectory.
///
/// # Parameters
///
/// * `therm_state` selects the ensemble: `None` for the unbiased ensemble, `Some(k)` for
/// thermodynamic state `k`
///
/// * `log_lagrangian_mult`, `biased_conf_energies` are the `[T, M]` TRAM parameters
///
/// * `count_matrices`, `bias_energy_sequence`, `conf_state_sequence`, `state_counts` are the
/// data the parameters were estimated from
///
/// * `log_r_k_i` may hold the precomputed $\log R_i^k$; it is computed from the parameters
/// otherwise
///
/// * `output` receives `N` values, normalized such that $\sum_x e^{-\mu(x)} = 1$
///
/// # Notes
///
/// The weight of sample $x$ in bin $i$ is
///
/// $$
///     e^{-\mu(x)} \propto \frac{e^{-b^k(x)}}{\sum_l R_i^l e^{f_i^l - b^l(x)}}
/// $$
///
/// with $b^k \equiv 0$ for the unbiased ensemble.
#[allow(clippy::too_many_arguments)]
pub fn get_pointwise_unbiased_free_energies(
    therm_state: Option<usize>,
    log_lagrangian_mult: ArrayView2<'_, f64>,
    biased_conf_energies: ArrayView2<'_, f64>,
    count_matrices: ArrayView3<'_, usize>,
    bias_energy_sequence: ArrayView2<'_, f64>,
    conf_state_sequence: ArrayView1<'_, usize>,
    state_counts: ArrayView2<'_, usize>,
    log_r_k_i: Option<ArrayView2<'_, f64>>,
    mut output: ArrayViewMut1<'_, f64>,
) -> Result<()> {
    let (n_therm_states, n_conf_states) = state_counts.dim();
    let n_samples = conf_state_sequence.len();
    let params_shape = [n_therm_states, n_conf_states];

    check_shape("log_lagrangian_mult", log_lagrangian_mult.shape(), &params_shape)?;
    check_shape("biased_conf_energies", biased_conf_energies.shape(), &params_shape)?;
    check_shape(
        "count_matrices",
        count_matrices.shape(),
        &[n_therm_states, n_conf_states, n_conf_states],
    )?;
    check_shape(
        "bias_energy_sequence",
        bias_energy_sequence.shape(),
        &[n_therm_states, n_samples],
    )?;
    check_labels("conf_state_sequence", conf_state_sequence, n_conf_states)?;
    check_bias_energies("bias_energy_sequence", bias_energy_sequence)?;
    if output.len() != n_samples {
        return Err(TramError::ArrayLengthMismatch(output.len(), n_samples));
    }
    if let Some(k) = therm_state {
        if k >= n_therm_states {
            return Err(TramError::IndexOutOfRange {
                name: "therm_state",
                index: k as i64,
                bound: n_therm_states,
            });
        }
    }

    let log_r_k_i = match log_r_k_i {
        Some(log_r_k_i) => {
            check_shape("log_r_k_i", log_r_k_i.shape(), &params_shape)?;
            log_r_k_i.to_owned()
        }
        None => {
            let mut log_r = Array2::zeros((n_therm_states, n_conf_states));
            compute_log_r_k_i(
                log_lagrangian_mult,
                biased_conf_energies,
                count_matrices,
                state_counts,
                &mut log_r,
            );
            log_r
        }
    };

    compute_pointwise_free_energies(
        log_r_k_i.view(),
        biased_conf_energies,
        bias_energy_sequence,
        conf_state_sequence,
        output.view_mut(),
    );
    if let Some(k) = therm_state {
        for (mu, &b) in output.iter_mut().zip(bias_energy_sequence.row(k).iter()) {
            *mu += b;
        }
    }

    let shift = logsumexp(&output.mapv(|mu| -mu).to_vec());
    output.mapv_inplace(|mu| mu + shift);
    Ok(())
}

/// Aggregate pointwise free energies `mu` into a free energy profile over `label_sequence`.
///
/// `output[l]` receives $-\log \sum_{x: \mathrm{label}(x) = l} e^{-\mu(x)}$; labels without
/// samples get $+\infty$. The number of labels is the length of `output`.
///
/// With `mu` from [`get_pointwise_unbiased_free_energies`] and the configuration states as
/// labels this reproduces `TramEstimate::conf_energies`.
pub fn get_unbiased_user_free_energies(
    mu: ArrayView1<'_, f64>,
    label_sequence: ArrayView1<'_, usize>,
    mut output: ArrayViewMut1<'_, f64>,
) -> Result<()> {
    if label_sequence.len() != mu.len() {
        return Err(TramError::ArrayLengthMismatch(
            label_sequence.len(),
            mu.len(),
        ));
    }
    check_labels("label_sequence", label_sequence, output.len())?;

    let mut members = vec![Vec::new(); output.len()];
    for (&label, &mu) in label_sequence.iter().zip(mu.iter()) {
        members[label].push(-mu);
    }
    for (f, member) in output.iter_mut().zip(members.iter()) {
        *f = -logsumexp(member);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array1, Array3};

    fn single_state_data() -> (Array2<f64>, Array2<f64>, Array3<usize>, Array2<usize>) {
        let count_matrices =
            Array3::from_shape_vec((1, 2, 2), vec![2, 1, 1, 3]).unwrap();
        let state_counts = array![[3, 4]];
        let log_v = array![[3f64.ln(), 4f64.ln()]];
        let f = array![[-(3f64 / 7.0).ln(), -(4f64 / 7.0).ln()]];
        (log_v, f, count_matrices, state_counts)
    }

    #[test]
    fn unbiased_weights_are_uniform_for_a_single_unbiased_state() {
        let (log_v, f, c, n) = single_state_data();
        let labels = array![0, 0, 0, 1, 1, 1, 1];
        let bias = Array2::zeros((1, 7));
        let mut mu = Array1::zeros(7);
        get_pointwise_unbiased_free_energies(
            None,
            log_v.view(),
            f.view(),
            c.view(),
            bias.view(),
            labels.view(),
            n.view(),
            None,
            mu.view_mut(),
        )
        .unwrap();
        for &m in mu.iter() {
            assert_abs_diff_eq!(m, 7f64.ln(), epsilon = 1e-12);
        }

        let mut pmf = Array1::zeros(2);
        get_unbiased_user_free_energies(mu.view(), labels.view(), pmf.view_mut()).unwrap();
        assert_abs_diff_eq!(pmf[0], -(3f64 / 7.0).ln(), epsilon = 1e-12);
        assert_abs_diff_eq!(pmf[1], -(4f64 / 7.0).ln(), epsilon = 1e-12);
    }

    #[test]
    fn biased_ensemble_adds_bias_energy() {
        let (log_v, f, c, n) = single_state_data();
        let labels = array![0, 0, 0, 1, 1, 1, 1];
        let bias = array![[0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0]];
        let pointwise = |therm_state: Option<usize>| {
            let mut mu = Array1::zeros(7);
            get_pointwise_unbiased_free_energies(
                therm_state,
                log_v.view(),
                f.view(),
                c.view(),
                bias.view(),
                labels.view(),
                n.view(),
                None,
                mu.view_mut(),
            )
            .unwrap();
            mu
        };
        let unbiased = pointwise(None);
        let biased = pointwise(Some(0));
        // the differences between samples grow by exactly their bias energy difference
        assert_abs_diff_eq!(
            biased[3] - biased[0],
            unbiased[3] - unbiased[0] + 1.0,
            epsilon = 1e-12
        );
        let total: f64 = biased.iter().map(|m| (-m).exp()).sum();
        assert_abs_diff_eq!(total, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn precomputed_log_r_gives_the_same_weights() {
        let (log_v, f, c, n) = single_state_data();
        let labels = array![0, 0, 0, 1, 1, 1, 1];
        let bias = array![[0.3, -0.2, 0.0, 1.0, 0.7, 1.4, 0.9]];
        let mut log_r = Array2::zeros((1, 2));
        compute_log_r_k_i(log_v.view(), f.view(), c.view(), n.view(), &mut log_r);

        let pointwise = |log_r_k_i: Option<ArrayView2<'_, f64>>| {
            let mut mu = Array1::zeros(7);
            get_pointwise_unbiased_free_energies(
                Some(0),
                log_v.view(),
                f.view(),
                c.view(),
                bias.view(),
                labels.view(),
                n.view(),
                log_r_k_i,
                mu.view_mut(),
            )
            .unwrap();
            mu
        };
        assert_eq!(pointwise(None), pointwise(Some(log_r.view())));

        let mut mu = Array1::zeros(7);
        let wrong_shape = Array2::zeros((2, 2));
        assert!(matches!(
            get_pointwise_unbiased_free_energies(
                None,
                log_v.view(),
                f.view(),
                c.view(),
                bias.view(),
                labels.view(),
                n.view(),
                Some(wrong_shape.view()),
                mu.view_mut(),
            ),
            Err(TramError::ShapeMismatch { name: "log_r_k_i", .. })
        ));
    }

    #[test]
    fn empty_labels_get_infinite_free_energy() {
        let mu = array![1.0, 2.0, 0.5];
        let labels = array![0, 2, 0];
        let mut pmf = Array1::zeros(3);
        get_unbiased_user_free_energies(mu.view(), labels.view(), pmf.view_mut()).unwrap();
        assert_abs_diff_eq!(pmf[0], -logsumexp(&[-1.0, -0.5]), epsilon = 1e-15);
        assert_eq!(pmf[1], f64::INFINITY);
        assert_abs_diff_eq!(pmf[2], 2.0, epsilon = 1e-15);
    }

    #[test]
    fn rejects_bad_buffers_and_labels() {
        let mu = array![1.0, 2.0, 0.5];
        let mut pmf = Array1::zeros(2);
        assert!(matches!(
            get_unbiased_user_free_energies(mu.view(), array![0, 1].view(), pmf.view_mut()),
            Err(TramError::ArrayLengthMismatch(2, 3))
        ));
        assert!(matches!(
            get_unbiased_user_free_energies(mu.view(), array![0, 1, 2].view(), pmf.view_mut()),
            Err(TramError::IndexOutOfRange { index: 2, bound: 2, .. })
        ));

        let (log_v, f, c, n) = single_state_data();
        let labels = array![0, 0, 0, 1, 1, 1, 1];
        let bias = Array2::zeros((1, 7));
        let mut short = Array1::zeros(6);
        assert!(matches!(
            get_pointwise_unbiased_free_energies(
                Some(1),
                log_v.view(),
                f.view(),
                c.view(),
                bias.view(),
                labels.view(),
                n.view(),
                None,
                short.view_mut(),
            ),
            Err(TramError::ArrayLengthMismatch(6, 7))
        ));
        let mut mu = Array1::zeros(7);
        assert!(matches!(
            get_pointwise_unbiased_free_energies(
                Some(1),
                log_v.view(),
                f.view(),
                c.view(),
                bias.view(),
                labels.view(),
                n.view(),
                None,
                mu.view_mut(),
            ),
            Err(TramError::IndexOutOfRange { name: "therm_state", .. })
        ));
    }
}
