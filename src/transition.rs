//! Reversible transition matrices from converged TRAM parameters.

use crate::errors::*;
use crate::lse::logsumexp_pair;
use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis};

/// Estimate one reversible transition matrix per thermodynamic state.
///
/// The unnormalized elements are
///
/// $$
///     p_{ii}^k = \frac{c_{ii}^k}{v_i^k}, \qquad
///     p_{ij}^k = \frac{(c_{ij}^k + c_{ji}^k)\, \varphi_j^k}
///                     {v_i^k \varphi_j^k + v_j^k \varphi_i^k},
/// $$
///
/// which already sum to one per row at the fixed point. Each matrix is then divided by its
/// largest row sum and the missing mass of every row is moved onto its diagonal, so the result
/// is row-stochastic for any input. Rows of bins never visited at state `k` become identity rows.
///
/// # Parameters
///
/// * `log_lagrangian_mult[k, i]` and `biased_conf_energies[k, i]` are the estimated parameters
///
/// * `count_matrices[k, i, j]` are the observed transition counts
///
/// * `active_set` optionally restricts the estimate to a subset of configuration states; the
///   output is then `[T, A, A]` in the order given
pub fn estimate_transition_matrices(
    log_lagrangian_mult: ArrayView2<'_, f64>,
    biased_conf_energies: ArrayView2<'_, f64>,
    count_matrices: ArrayView3<'_, usize>,
    active_set: Option<&[usize]>,
) -> Result<Array3<f64>> {
    let (n_therm_states, n_conf_states) = log_lagrangian_mult.dim();
    check_shape(
        "biased_conf_energies",
        biased_conf_energies.shape(),
        &[n_therm_states, n_conf_states],
    )?;
    check_shape(
        "count_matrices",
        count_matrices.shape(),
        &[n_therm_states, n_conf_states, n_conf_states],
    )?;

    let all_states: Vec<usize>;
    let active = match active_set {
        Some(active) => {
            check_labels("active_set", active, n_conf_states)?;
            active
        }
        None => {
            all_states = (0..n_conf_states).collect();
            &all_states
        }
    };

    let mut transition_matrices = Array3::zeros((n_therm_states, active.len(), active.len()));
    for k in 0..n_therm_states {
        let matrix = transition_matrix(
            k,
            log_lagrangian_mult,
            biased_conf_energies,
            count_matrices,
            active,
        );
        transition_matrices
            .index_axis_mut(Axis(0), k)
            .assign(&matrix);
    }
    Ok(transition_matrices)
}

/// Row-stochastic transition matrix of state `k` over the `active` bins
pub(crate) fn transition_matrix(
    k: usize,
    log_lagrangian_mult: ArrayView2<'_, f64>,
    biased_conf_energies: ArrayView2<'_, f64>,
    count_matrices: ArrayView3<'_, usize>,
    active: &[usize],
) -> Array2<f64> {
    let n_active = active.len();
    let log_v = log_lagrangian_mult.index_axis(Axis(0), k);
    let f = biased_conf_energies.index_axis(Axis(0), k);
    let counts = count_matrices.index_axis(Axis(0), k);

    let mut matrix = Array2::zeros((n_active, n_active));
    let mut row_sums = vec![0.0; n_active];
    for (a, &i) in active.iter().enumerate() {
        if !log_v[i].is_finite() {
            continue;
        }
        for (b, &j) in active.iter().enumerate() {
            let element = if i == j {
                let c_ii = counts[[i, i]];
                if c_ii == 0 {
                    continue;
                }
                c_ii as f64 * (-log_v[i]).exp()
            } else {
                let c = counts[[i, j]] + counts[[j, i]];
                if c == 0 {
                    continue;
                }
                let divisor = logsumexp_pair(log_v[i] - f[j], log_v[j] - f[i]);
                c as f64 * (-f[j] - divisor).exp()
            };
            matrix[[a, b]] = element;
            row_sums[a] += element;
        }
    }

    let mut max_sum = row_sums.iter().copied().fold(0.0, f64::max);
    if max_sum == 0.0 {
        max_sum = 1.0;
    }
    for a in 0..n_active {
        for b in 0..n_active {
            if a == b {
                matrix[[a, a]] = (matrix[[a, a]] + max_sum - row_sums[a]) / max_sum;
            } else {
                matrix[[a, b]] /= max_sum;
            }
        }
    }
    matrix
}
