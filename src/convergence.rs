//! Per-iteration diagnostics and the termination decision.

use crate::transition::transition_matrix;
use crate::update::Snapshot;
use ndarray::{ArrayView1, ArrayView2, ArrayView3, Axis};
use tracing::debug;

/// Outcome of observing one sweep
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    /// Largest parameter change of the sweep over visited (state, bin) pairs
    pub error: f64,
    /// Whether the iteration should stop after this sweep
    pub finished: bool,
    /// Whether `error` fell below the requested tolerance
    pub converged: bool,
}

/// Collects error and log-likelihood histories and decides when to stop.
///
/// Apart from the two histories it appends to, the monitor holds no state; the diagnostics
/// themselves are pure functions of the snapshots.
#[derive(Debug, Clone)]
pub struct ConvergenceMonitor {
    maxiter: usize,
    maxerr: f64,
    lll_out: usize,
    error_history: Vec<f64>,
    logl_history: Vec<f64>,
}

impl ConvergenceMonitor {
    /// Stop after `maxiter` sweeps or once the error drops below `maxerr`, recording the
    /// diagnostics every `lll_out`-th sweep (never if `lll_out` is zero).
    pub fn new(maxiter: usize, maxerr: f64, lll_out: usize) -> Self {
        Self {
            maxiter,
            maxerr,
            lll_out,
            error_history: Vec::new(),
            logl_history: Vec::new(),
        }
    }

    /// Largest absolute change of the log Lagrange multipliers and of the biased configuration
    /// energies between two snapshots.
    ///
    /// Only pairs with `state_counts[k, i] > 0` take part; unvisited entries hold infinite
    /// sentinels.
    pub fn parameter_error(
        previous: &Snapshot,
        current: &Snapshot,
        state_counts: ArrayView2<'_, usize>,
    ) -> f64 {
        let mut error: f64 = 0.0;
        for ((k, i), &count) in state_counts.indexed_iter() {
            if count == 0 {
                continue;
            }
            let delta_log_v = (current.log_lagrangian_mult[[k, i]]
                - previous.log_lagrangian_mult[[k, i]])
                .abs();
            let delta_f = (current.biased_conf_energies[[k, i]]
                - previous.biased_conf_energies[[k, i]])
                .abs();
            // NaN from inf - inf must not hide behind f64::max
            if delta_log_v.is_nan() || delta_f.is_nan() {
                return f64::INFINITY;
            }
            error = error.max(delta_log_v).max(delta_f);
        }
        error
    }

    /// Log-likelihood of the data, up to a constant.
    ///
    /// $$
    ///     \log L = \sum_{k,i,j} c_{ij}^k \log p_{ij}^k
    ///            + \sum_{k,i} N_i^k f_i^k
    ///            - \sum_x \mu(x)
    /// $$
    ///
    /// where $p^k$ are the transition matrices built from `log_lagrangian_mult` and
    /// `biased_conf_energies`, and $\mu$ are the pointwise free energies. The $p^k$ are
    /// stochastic and reversible with respect to $e^{-f^k}$. When $f$ are the biased energies of
    /// the weights $e^{-\mu}$ and the multipliers are settled for $f$, this is the likelihood of
    /// an admissible set of TRAM parameters, maximized over the transition matrices.
    pub fn log_likelihood(
        count_matrices: ArrayView3<'_, usize>,
        state_counts: ArrayView2<'_, usize>,
        log_lagrangian_mult: ArrayView2<'_, f64>,
        biased_conf_energies: ArrayView2<'_, f64>,
        pointwise_free_energies: ArrayView1<'_, f64>,
    ) -> f64 {
        let (n_therm_states, n_conf_states) = state_counts.dim();
        let all_states: Vec<usize> = (0..n_conf_states).collect();

        let mut transitions = 0.0;
        for k in 0..n_therm_states {
            let p = transition_matrix(
                k,
                log_lagrangian_mult,
                biased_conf_energies,
                count_matrices,
                &all_states,
            );
            let counts = count_matrices.index_axis(Axis(0), k);
            for ((i, j), &c) in counts.indexed_iter() {
                if c > 0 {
                    transitions += c as f64 * p[[i, j]].ln();
                }
            }
        }

        let mut samples = 0.0;
        for ((k, i), &count) in state_counts.indexed_iter() {
            if count > 0 {
                samples += count as f64 * biased_conf_energies[[k, i]];
            }
        }
        let pointwise: f64 = pointwise_free_energies.iter().sum();

        transitions + samples - pointwise
    }

    /// Observe the sweep `iteration` (zero-based), given its parameter `error` and the
    /// log-likelihood `logl` of the snapshot it was taken to.
    pub fn observe(&mut self, iteration: usize, error: f64, logl: f64) -> Progress {
        let converged = error < self.maxerr;
        let finished = converged || iteration + 1 >= self.maxiter;

        let scheduled = self.lll_out > 0 && (iteration + 1) % self.lll_out == 0;
        if self.lll_out > 0 && (scheduled || finished) {
            debug!(iteration, error, logl, "recorded diagnostics");
            self.error_history.push(error);
            self.logl_history.push(logl);
        }

        Progress {
            error,
            finished,
            converged,
        }
    }

    /// Recorded parameter errors
    pub fn error_history(&self) -> &[f64] {
        &self.error_history
    }

    /// Recorded log-likelihoods
    pub fn logl_history(&self) -> &[f64] {
        &self.logl_history
    }

    /// Consume the monitor, returning `(error_history, logl_history)`
    pub fn into_histories(self) -> (Vec<f64>, Vec<f64>) {
        (self.error_history, self.logl_history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array1, Array3};

    fn snapshot(log_v: [f64; 2], f: [f64; 2]) -> Snapshot {
        Snapshot {
            log_lagrangian_mult: array![[log_v[0], log_v[1]]],
            biased_conf_energies: array![[f[0], f[1]]],
            pointwise_free_energies: Array1::zeros(2),
        }
    }

    #[test]
    fn error_ignores_unvisited_bins() {
        let previous = snapshot([0.0, f64::NEG_INFINITY], [0.0, f64::INFINITY]);
        let current = snapshot([0.25, f64::NEG_INFINITY], [-0.5, f64::INFINITY]);
        let state_counts = array![[3, 0]];
        let error = ConvergenceMonitor::parameter_error(&previous, &current, state_counts.view());
        assert_abs_diff_eq!(error, 0.5, epsilon = 1e-15);
    }

    #[test]
    fn error_is_infinite_if_a_visited_entry_is_undefined() {
        let previous = snapshot([0.0, f64::NEG_INFINITY], [0.0, 0.0]);
        let current = snapshot([0.0, f64::NEG_INFINITY], [0.0, 0.0]);
        let state_counts = array![[3, 1]];
        let error = ConvergenceMonitor::parameter_error(&previous, &current, state_counts.view());
        assert_eq!(error, f64::INFINITY);
    }

    #[test]
    fn records_on_schedule_and_on_termination() {
        let counts = Array3::from_shape_vec((1, 2, 2), vec![2, 1, 1, 2]).unwrap();
        let state_counts = array![[3, 3]];
        let a = snapshot([0.0, 0.0], [0.0, 0.0]);
        let b = snapshot([1.0, 0.0], [0.0, 0.0]);

        let error = ConvergenceMonitor::parameter_error(&a, &b, state_counts.view());
        let logl = ConvergenceMonitor::log_likelihood(
            counts.view(),
            state_counts.view(),
            b.log_lagrangian_mult.view(),
            b.biased_conf_energies.view(),
            b.pointwise_free_energies.view(),
        );

        let mut monitor = ConvergenceMonitor::new(5, 1e-3, 2);
        let progress: Vec<_> = (0..5)
            .map(|m| monitor.observe(m, error, logl - (4 - m) as f64))
            .collect();
        assert!(progress[..4].iter().all(|p| !p.finished));
        assert!(progress[4].finished && !progress[4].converged);
        // sweeps 2 and 4 on schedule, sweep 5 because it is the last one
        assert_eq!(monitor.error_history(), &[1.0, 1.0, 1.0]);
        assert_eq!(monitor.logl_history(), &[logl - 3.0, logl - 1.0, logl]);

        let mut monitor = ConvergenceMonitor::new(5, 1e-3, 0);
        let progress = monitor.observe(0, 0.0, logl);
        assert!(progress.converged && progress.finished);
        assert!(monitor.error_history().is_empty());
    }

    #[test]
    fn log_likelihood_of_exact_single_state_model() {
        // symmetric counts with uniform weights: p = c / row sum, v = row sums
        let counts = Array3::from_shape_vec((1, 2, 2), vec![2, 1, 1, 2]).unwrap();
        let state_counts = array![[3, 3]];
        let log_v = array![[3f64.ln(), 3f64.ln()]];
        let f = array![[0.0, 0.0]];
        let mu = Array1::<f64>::zeros(6);
        let logl = ConvergenceMonitor::log_likelihood(
            counts.view(),
            state_counts.view(),
            log_v.view(),
            f.view(),
            mu.view(),
        );
        let expected = 4.0 * (2.0f64 / 3.0).ln() + 2.0 * (1.0f64 / 3.0).ln();
        assert_abs_diff_eq!(logl, expected, epsilon = 1e-12);
    }
}
