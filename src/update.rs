//! Self-consistent update rules for the TRAM estimating equations.
//!
//! With $v_i^k = e^{\log v_i^k}$ the Lagrange multipliers, $\varphi_i^k = e^{-f_i^k}$ the biased
//! configuration weights and $c_{ij}^k$ the transition counts, the fixed point solved by both
//! schemes is
//!
//! $$
//!     v_i^k = \sum_j \frac{(c_{ij}^k + c_{ji}^k)\, v_i^k \varphi_j^k}
//!                         {v_i^k \varphi_j^k + v_j^k \varphi_i^k}, \qquad
//!     e^{-f_i^k} = \sum_{x \in i} \frac{e^{-b^k(x)}}{\sum_l R_i^l e^{f_i^l - b^l(x)}},
//! $$
//!
//! with
//!
//! $$
//!     R_i^k = \sum_j \frac{(c_{ij}^k + c_{ji}^k)\, v_j^k \varphi_i^k}
//!                         {v_i^k \varphi_j^k + v_j^k \varphi_i^k}
//!             + N_i^k - \sum_j c_{ji}^k .
//! $$
//!
//! The diagonal terms reduce to $c_{ii}^k$ in both sums.

use crate::convergence::ConvergenceMonitor;
use crate::lse::{logsumexp, logsumexp_pair};
use crate::tram::Tram;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayView3, ArrayViewMut1, Axis, Zip};

/// Working parameters of the estimator after one sweep.
///
/// `pointwise_free_energies[n]` is $\log \sum_l R_{i(n)}^l e^{f_{i(n)}^l - b^l(n)}$, the value
/// that was used to produce `biased_conf_energies`. The biased energies are always those of the
/// sample weights $e^{-\mu(x)}$.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// `log_lagrangian_mult[k, i]`; $-\infty$ where state `k` never visited bin `i`
    pub log_lagrangian_mult: Array2<f64>,
    /// `biased_conf_energies[k, i]`
    pub biased_conf_energies: Array2<f64>,
    /// `pointwise_free_energies[n]` for every sample of the concatenated trajectory
    pub pointwise_free_energies: Array1<f64>,
}

impl Snapshot {
    /// Move the biased energies a `fraction` of the way from `from` to `to`.
    ///
    /// The pointwise free energies are interpolated linearly and the biased configuration
    /// energies recomputed from them, which keeps the two consistent. The multipliers are left
    /// alone; the caller settles them for the new energies.
    pub(crate) fn interpolate(
        &mut self,
        tram: &Tram,
        from: &Snapshot,
        to: &Snapshot,
        fraction: f64,
        scratch: &mut Vec<f64>,
    ) {
        Zip::from(&mut self.pointwise_free_energies)
            .and(&from.pointwise_free_energies)
            .and(&to.pointwise_free_energies)
            .apply(|x, &a, &b| *x = a + fraction * (b - a));
        biased_conf_energies_from_pointwise(
            self.pointwise_free_energies.view(),
            tram.bias_energy_sequence().view(),
            tram.bins(),
            scratch,
            &mut self.biased_conf_energies,
        );
    }
}

/// One scheme for advancing the TRAM fixed-point iteration.
///
/// Implementations read the complete previous snapshot and overwrite every entry of the next
/// one, updating the multipliers first and the biased energies from the fresh multipliers.
pub trait UpdateRule {
    /// Perform one self-consistent sweep from `current` into `next`.
    fn step(&mut self, tram: &Tram, current: &Snapshot, next: &mut Snapshot);
}

/// Initial multipliers: half the symmetrized row count of each visited bin.
pub(crate) fn initial_log_lagrangian_mult(
    count_matrices: ArrayView3<'_, usize>,
    state_counts: ArrayView2<'_, usize>,
) -> Array2<f64> {
    let (n_therm_states, n_conf_states) = state_counts.dim();
    let mut log_lagrangian_mult = Array2::from_elem(state_counts.dim(), f64::NEG_INFINITY);
    for k in 0..n_therm_states {
        for i in 0..n_conf_states {
            if state_counts[[k, i]] == 0 {
                continue;
            }
            let sum: usize = (0..n_conf_states)
                .map(|j| count_matrices[[k, i, j]] + count_matrices[[k, j, i]])
                .sum();
            log_lagrangian_mult[[k, i]] = (0.5 * sum as f64).ln();
        }
    }
    log_lagrangian_mult
}

/// One update of the log multipliers at fixed biased energies; $-\infty$ for unvisited bins.
pub(crate) fn update_log_lagrangian_mult(
    count_matrices: ArrayView3<'_, usize>,
    state_counts: ArrayView2<'_, usize>,
    log_lagrangian_mult: ArrayView2<'_, f64>,
    biased_conf_energies: ArrayView2<'_, f64>,
    scratch: &mut Vec<f64>,
    new_log_lagrangian_mult: &mut Array2<f64>,
) {
    let (n_therm_states, n_conf_states) = state_counts.dim();
    let log_v = log_lagrangian_mult;
    let f = biased_conf_energies;
    for k in 0..n_therm_states {
        for i in 0..n_conf_states {
            if state_counts[[k, i]] == 0 {
                new_log_lagrangian_mult[[k, i]] = f64::NEG_INFINITY;
                continue;
            }
            scratch.clear();
            for j in 0..n_conf_states {
                if i == j {
                    let c_ii = count_matrices[[k, i, i]];
                    if c_ii > 0 {
                        scratch.push((c_ii as f64).ln());
                    }
                    continue;
                }
                let c = count_matrices[[k, i, j]] + count_matrices[[k, j, i]];
                if c == 0 {
                    continue;
                }
                let divisor =
                    logsumexp_pair(0.0, log_v[[k, j]] - f[[k, i]] - log_v[[k, i]] + f[[k, j]]);
                scratch.push((c as f64).ln() - divisor);
            }
            new_log_lagrangian_mult[[k, i]] = logsumexp(scratch.as_slice());
        }
    }
}

/// Largest change of the log multipliers that ends [`settle_log_lagrangian_mult`]
const SETTLE_TOL: f64 = 1e-12;

/// Sweeps after which [`settle_log_lagrangian_mult`] gives up
const MAX_SETTLE_SWEEPS: usize = 10_000;

/// Iterate the multiplier update at fixed `biased_conf_energies`, starting from and overwriting
/// `log_lagrangian_mult`, until no visited entry moves by more than `SETTLE_TOL`.
///
/// The settled multipliers give the most likely reversible transition matrices with stationary
/// weights $e^{-f^k}$. Returns the number of sweeps taken.
pub(crate) fn settle_log_lagrangian_mult(
    tram: &Tram,
    biased_conf_energies: ArrayView2<'_, f64>,
    log_lagrangian_mult: &mut Array2<f64>,
    buffer: &mut Array2<f64>,
    scratch: &mut Vec<f64>,
) -> usize {
    let state_counts = tram.state_counts();
    for sweep in 1..=MAX_SETTLE_SWEEPS {
        update_log_lagrangian_mult(
            tram.count_matrices().view(),
            state_counts.view(),
            log_lagrangian_mult.view(),
            biased_conf_energies,
            scratch,
            buffer,
        );
        let mut change: f64 = 0.0;
        for ((k, i), &count) in state_counts.indexed_iter() {
            if count > 0 {
                change = change.max((buffer[[k, i]] - log_lagrangian_mult[[k, i]]).abs());
            }
        }
        std::mem::swap(log_lagrangian_mult, buffer);
        if change < SETTLE_TOL {
            return sweep;
        }
    }
    MAX_SETTLE_SWEEPS
}

/// Log multipliers settled for the biased energies of the last accepted snapshot, and the
/// log-likelihood of candidate snapshots judged with multipliers settled for theirs.
#[derive(Debug)]
pub(crate) struct SettledMultipliers {
    accepted: Array2<f64>,
    candidate: Array2<f64>,
    buffer: Array2<f64>,
    scratch: Vec<f64>,
}

impl SettledMultipliers {
    /// Start from `log_lagrangian_mult`, which need not be settled yet
    pub(crate) fn new(log_lagrangian_mult: &Array2<f64>) -> Self {
        Self {
            accepted: log_lagrangian_mult.clone(),
            candidate: log_lagrangian_mult.clone(),
            buffer: log_lagrangian_mult.clone(),
            scratch: Vec::new(),
        }
    }

    /// Settle the multipliers for the energies of `snapshot`, warm-started from the accepted
    /// ones, and return the log-likelihood of the snapshot's energies with them.
    pub(crate) fn log_likelihood(&mut self, tram: &Tram, snapshot: &Snapshot) -> f64 {
        self.candidate.assign(&self.accepted);
        settle_log_lagrangian_mult(
            tram,
            snapshot.biased_conf_energies.view(),
            &mut self.candidate,
            &mut self.buffer,
            &mut self.scratch,
        );
        ConvergenceMonitor::log_likelihood(
            tram.count_matrices().view(),
            tram.state_counts().view(),
            self.candidate.view(),
            snapshot.biased_conf_energies.view(),
            snapshot.pointwise_free_energies.view(),
        )
    }

    /// Multipliers of the last call to `log_likelihood`
    pub(crate) fn candidate(&self) -> &Array2<f64> {
        &self.candidate
    }

    /// Keep the multipliers of the last call to `log_likelihood` as the next warm start
    pub(crate) fn accept(&mut self) {
        std::mem::swap(&mut self.accepted, &mut self.candidate);
    }
}

/// $\log R_i^k$ for every (k, i); $-\infty$ for unvisited bins.
pub(crate) fn compute_log_r_k_i(
    log_lagrangian_mult: ArrayView2<'_, f64>,
    biased_conf_energies: ArrayView2<'_, f64>,
    count_matrices: ArrayView3<'_, usize>,
    state_counts: ArrayView2<'_, usize>,
    log_r_k_i: &mut Array2<f64>,
) {
    let (n_therm_states, n_conf_states) = state_counts.dim();
    let mut scratch = Vec::with_capacity(n_conf_states + 1);
    for k in 0..n_therm_states {
        for i in 0..n_conf_states {
            if state_counts[[k, i]] == 0 {
                log_r_k_i[[k, i]] = f64::NEG_INFINITY;
                continue;
            }
            scratch.clear();
            let mut arrivals = 0;
            for j in 0..n_conf_states {
                arrivals += count_matrices[[k, j, i]];
                if i == j {
                    let c_ii = count_matrices[[k, i, i]];
                    if c_ii > 0 {
                        scratch.push((c_ii as f64).ln());
                    }
                    continue;
                }
                let c = count_matrices[[k, i, j]] + count_matrices[[k, j, i]];
                if c == 0 {
                    continue;
                }
                let divisor = logsumexp_pair(
                    log_lagrangian_mult[[k, i]] - biased_conf_energies[[k, j]],
                    log_lagrangian_mult[[k, j]] - biased_conf_energies[[k, i]],
                );
                scratch.push(
                    (c as f64).ln() + log_lagrangian_mult[[k, j]]
                        - biased_conf_energies[[k, i]]
                        - divisor,
                );
            }
            // visits that are not the end point of a counted transition, e.g. trajectory starts
            if state_counts[[k, i]] > arrivals {
                scratch.push(((state_counts[[k, i]] - arrivals) as f64).ln());
            }
            log_r_k_i[[k, i]] = logsumexp(&scratch);
        }
    }
}

/// $\log \sum_l R_{i(n)}^l e^{f_{i(n)}^l - b^l(n)}$ for every sample `n`.
pub(crate) fn compute_pointwise_free_energies(
    log_r_k_i: ArrayView2<'_, f64>,
    biased_conf_energies: ArrayView2<'_, f64>,
    bias_energy_sequence: ArrayView2<'_, f64>,
    conf_state_sequence: ArrayView1<'_, usize>,
    mut output: ArrayViewMut1<'_, f64>,
) {
    let n_therm_states = log_r_k_i.len_of(Axis(0));
    let mut scratch = Vec::with_capacity(n_therm_states);
    for (n, &i) in conf_state_sequence.iter().enumerate() {
        scratch.clear();
        for l in 0..n_therm_states {
            if log_r_k_i[[l, i]] == f64::NEG_INFINITY {
                continue;
            }
            scratch.push(
                log_r_k_i[[l, i]] + biased_conf_energies[[l, i]] - bias_energy_sequence[[l, n]],
            );
        }
        output[n] = logsumexp(&scratch);
    }
}

/// $f_i^k = -\log \sum_{x \in i} e^{-b^k(x) - \mu(x)}$ for every (k, i).
pub(crate) fn biased_conf_energies_from_pointwise(
    pointwise_free_energies: ArrayView1<'_, f64>,
    bias_energy_sequence: ArrayView2<'_, f64>,
    bins: &[Vec<usize>],
    scratch: &mut Vec<f64>,
    biased_conf_energies: &mut Array2<f64>,
) {
    for (i, samples) in bins.iter().enumerate() {
        for k in 0..biased_conf_energies.len_of(Axis(0)) {
            scratch.clear();
            scratch.extend(
                samples
                    .iter()
                    .map(|&n| -bias_energy_sequence[[k, n]] - pointwise_free_energies[n]),
            );
            biased_conf_energies[[k, i]] = -logsumexp(scratch.as_slice());
        }
    }
}

/// Unbiased free energy of each bin from the pointwise free energies, before normalization.
pub(crate) fn conf_energies_from_pointwise(
    pointwise_free_energies: ArrayView1<'_, f64>,
    bins: &[Vec<usize>],
) -> Array1<f64> {
    let mut scratch = Vec::new();
    bins.iter()
        .map(|samples| {
            scratch.clear();
            scratch.extend(samples.iter().map(|&n| -pointwise_free_energies[n]));
            -logsumexp(&scratch)
        })
        .collect()
}

/// The log-space TRAM update.
///
/// Every sum is a log-sum-exp reduction, so arbitrarily large bias energies and nearly empty
/// bins are handled without overflow.
#[derive(Debug)]
pub struct LogSpaceUpdate {
    log_r_k_i: Array2<f64>,
    scratch: Vec<f64>,
}

impl LogSpaceUpdate {
    /// Allocate working buffers for `tram`
    pub fn new(tram: &Tram) -> Self {
        Self {
            log_r_k_i: Array2::zeros(tram.state_counts().dim()),
            scratch: Vec::with_capacity(tram.n_samples().max(tram.n_conf_states())),
        }
    }

    fn update_lagrangian_mult(&mut self, tram: &Tram, current: &Snapshot, next: &mut Snapshot) {
        update_log_lagrangian_mult(
            tram.count_matrices().view(),
            tram.state_counts().view(),
            current.log_lagrangian_mult.view(),
            current.biased_conf_energies.view(),
            &mut self.scratch,
            &mut next.log_lagrangian_mult,
        );
    }

    fn update_biased_conf_energies(
        &mut self,
        tram: &Tram,
        current: &Snapshot,
        next: &mut Snapshot,
    ) {
        compute_log_r_k_i(
            next.log_lagrangian_mult.view(),
            current.biased_conf_energies.view(),
            tram.count_matrices().view(),
            tram.state_counts().view(),
            &mut self.log_r_k_i,
        );
        compute_pointwise_free_energies(
            self.log_r_k_i.view(),
            current.biased_conf_energies.view(),
            tram.bias_energy_sequence().view(),
            tram.conf_state_sequence().view(),
            next.pointwise_free_energies.view_mut(),
        );
        biased_conf_energies_from_pointwise(
            next.pointwise_free_energies.view(),
            tram.bias_energy_sequence().view(),
            tram.bins(),
            &mut self.scratch,
            &mut next.biased_conf_energies,
        );
    }
}

impl UpdateRule for LogSpaceUpdate {
    fn step(&mut self, tram: &Tram, current: &Snapshot, next: &mut Snapshot) {
        self.update_lagrangian_mult(tram, current, next);
        self.update_biased_conf_energies(tram, current, next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array3};

    fn two_bin_counts() -> (Array3<usize>, Array2<usize>) {
        let count_matrices = Array3::from_shape_vec((1, 2, 2), vec![3, 1, 1, 5]).unwrap();
        let state_counts = array![[4, 7]];
        (count_matrices, state_counts)
    }

    #[test]
    fn initial_multipliers_use_symmetrized_counts() {
        let (count_matrices, mut state_counts) = two_bin_counts();
        state_counts[[0, 1]] = 0;
        let log_v = initial_log_lagrangian_mult(count_matrices.view(), state_counts.view());
        assert_abs_diff_eq!(log_v[[0, 0]], (0.5 * 8.0f64).ln(), epsilon = 1e-12);
        assert_eq!(log_v[[0, 1]], f64::NEG_INFINITY);
    }

    #[test]
    fn log_r_splits_symmetric_counts_at_equal_weights() {
        let (count_matrices, state_counts) = two_bin_counts();
        let log_v = array![[0.0, 0.0]];
        let f = array![[0.0, 0.0]];
        let mut log_r = Array2::zeros((1, 2));
        compute_log_r_k_i(
            log_v.view(),
            f.view(),
            count_matrices.view(),
            state_counts.view(),
            &mut log_r,
        );
        // bin 0: c_00 + (c_01 + c_10) / 2 + (N_0 - arrivals) = 3 + 1 + (4 - 4)
        assert_abs_diff_eq!(log_r[[0, 0]], 4.0f64.ln(), epsilon = 1e-12);
        // bin 1: 5 + 1 + (7 - 6)
        assert_abs_diff_eq!(log_r[[0, 1]], 7.0f64.ln(), epsilon = 1e-12);
    }

    /// Two states over two bins; bin 1 is never visited at state 1
    fn small_tram() -> Tram {
        let conf_state_sequence: Array1<usize> =
            array![0, 0, 1, 1, 1, 0, 1, 1, 0, 0, 0, 0, 0];
        let bias_energy_sequence = Array2::from_shape_fn((2, 13), |(k, n)| {
            k as f64 * [0.5, -0.25][conf_state_sequence[n]]
        });
        let count_matrices =
            Array3::from_shape_vec((2, 2, 2), vec![2, 2, 1, 3, 4, 0, 0, 0]).unwrap();
        Tram::builder()
            .count_matrices(count_matrices)
            .state_counts(array![[3, 5], [5, 0]])
            .bias_energy_sequence(bias_energy_sequence)
            .conf_state_sequence(conf_state_sequence)
            .build()
            .unwrap()
    }

    #[test]
    fn interpolation_reaches_both_end_points() {
        let tram = small_tram();
        let start = Snapshot {
            log_lagrangian_mult: initial_log_lagrangian_mult(
                tram.count_matrices().view(),
                tram.state_counts().view(),
            ),
            biased_conf_energies: Array2::zeros((2, 2)),
            pointwise_free_energies: Array1::zeros(13),
        };
        let mut rule = LogSpaceUpdate::new(&tram);
        let mut from = start.clone();
        rule.step(&tram, &start, &mut from);
        let mut to = from.clone();
        rule.step(&tram, &from, &mut to);

        let mut scratch = Vec::new();
        let mut point = start.clone();
        for &(fraction, end) in &[(0.0, &from), (1.0, &to)] {
            point.interpolate(&tram, &from, &to, fraction, &mut scratch);
            for (a, b) in point.biased_conf_energies.iter().zip(end.biased_conf_energies.iter()) {
                assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
            }
        }

        point.interpolate(&tram, &from, &to, 0.5, &mut scratch);
        let halfway = 0.5 * (from.pointwise_free_energies[4] + to.pointwise_free_energies[4]);
        assert_abs_diff_eq!(point.pointwise_free_energies[4], halfway, epsilon = 1e-12);
        // multipliers are not touched
        assert_eq!(point.log_lagrangian_mult, start.log_lagrangian_mult);
    }

    #[test]
    fn settled_multipliers_are_a_fixed_point_with_stochastic_rows() {
        let tram = small_tram();
        let f = array![[0.3, -0.4], [0.1, 0.0]];
        let mut log_v = initial_log_lagrangian_mult(
            tram.count_matrices().view(),
            tram.state_counts().view(),
        );
        let mut buffer = log_v.clone();
        let mut scratch = Vec::new();
        let sweeps =
            settle_log_lagrangian_mult(&tram, f.view(), &mut log_v, &mut buffer, &mut scratch);
        assert!(sweeps < MAX_SETTLE_SWEEPS);
        assert_eq!(log_v[[1, 1]], f64::NEG_INFINITY);

        update_log_lagrangian_mult(
            tram.count_matrices().view(),
            tram.state_counts().view(),
            log_v.view(),
            f.view(),
            &mut scratch,
            &mut buffer,
        );
        for (a, b) in log_v.iter().zip(buffer.iter()).filter(|(a, _)| a.is_finite()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-10);
        }

        // unnormalized rows of state 0 sum to one once the multipliers are settled
        let counts = tram.count_matrices();
        for i in 0..2 {
            let j = 1 - i;
            let c = (counts[[0, i, j]] + counts[[0, j, i]]) as f64;
            let (phi_i, phi_j) = ((-f[[0, i]]).exp(), (-f[[0, j]]).exp());
            let (v_i, v_j) = (log_v[[0, i]].exp(), log_v[[0, j]].exp());
            let row = counts[[0, i, i]] as f64 / v_i + c * phi_j / (v_i * phi_j + v_j * phi_i);
            assert_abs_diff_eq!(row, 1.0, epsilon = 1e-10);
        }
    }

    #[test]
    fn settling_never_lowers_the_log_likelihood_at_fixed_energies() {
        let tram = small_tram();
        let start = Snapshot {
            log_lagrangian_mult: initial_log_lagrangian_mult(
                tram.count_matrices().view(),
                tram.state_counts().view(),
            ),
            biased_conf_energies: Array2::zeros((2, 2)),
            pointwise_free_energies: Array1::zeros(13),
        };
        let mut next = start.clone();
        LogSpaceUpdate::new(&tram).step(&tram, &start, &mut next);

        let unsettled = ConvergenceMonitor::log_likelihood(
            tram.count_matrices().view(),
            tram.state_counts().view(),
            next.log_lagrangian_mult.view(),
            next.biased_conf_energies.view(),
            next.pointwise_free_energies.view(),
        );
        let mut settled = SettledMultipliers::new(&next.log_lagrangian_mult);
        let logl = settled.log_likelihood(&tram, &next);
        assert!(logl >= unsettled - 1e-10);
        assert_ne!(settled.candidate(), &next.log_lagrangian_mult);
    }

    #[test]
    fn unvisited_bins_do_not_enter_pointwise_sums() {
        let log_r = array![[0.0, f64::NEG_INFINITY], [1.0, 2.0]];
        let f = array![[0.5, f64::INFINITY], [0.25, 0.75]];
        let bias = array![[0.0, 0.0, 0.0], [1.0, 2.0, 3.0]];
        let labels = array![0, 1, 1];
        let mut mu = Array1::zeros(3);
        compute_pointwise_free_energies(
            log_r.view(),
            f.view(),
            bias.view(),
            labels.view(),
            mu.view_mut(),
        );
        assert_abs_diff_eq!(mu[0], logsumexp_pair(0.5, 1.25 - 1.0), epsilon = 1e-12);
        assert_abs_diff_eq!(mu[1], 2.0 + 0.75 - 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(mu[2], 2.0 + 0.75 - 3.0, epsilon = 1e-12);
    }
}
