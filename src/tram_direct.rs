//! TRAM with the estimating equations evaluated on plain weights.
//!
//! The multipliers $v_i^k$ and the biased configuration weights $\varphi_i^k = e^{-f_i^k}$ are
//! updated directly instead of through log-sum-exp reductions. Each sample's bias energies are
//! shifted by their minimum over the thermodynamic states, which cancels exactly in the
//! estimating equations and keeps the weights $e^{-b}$ representable. After every sweep the
//! parameters are handed back in log space so that error and log-likelihood bookkeeping are
//! shared with [`LogSpaceUpdate`](crate::update::LogSpaceUpdate).

use crate::errors::*;
use crate::tram::{Tram, TramEstimate, UpdateScheme};
use crate::update::{Snapshot, UpdateRule};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayView3, Axis};

/// The direct (linear-space) TRAM update
#[derive(Debug)]
pub struct DirectUpdate {
    /// `bias_weights[k, n]` is $e^{-(b^k(n) - \min_l b^l(n))}$
    bias_weights: Array2<f64>,
    /// `min_bias[n]` is $\min_l b^l(n)$
    min_bias: Array1<f64>,
    lagrangian_mult: Array2<f64>,
    biased_conf_weights: Array2<f64>,
    new_lagrangian_mult: Array2<f64>,
    r_k_i: Array2<f64>,
    denominators: Array1<f64>,
}

impl DirectUpdate {
    /// Precompute the shifted bias weights of `tram`
    pub fn new(tram: &Tram) -> Self {
        let bias = tram.bias_energy_sequence();
        let min_bias: Array1<f64> = bias
            .axis_iter(Axis(1))
            .map(|column| column.iter().copied().fold(f64::INFINITY, f64::min))
            .collect();
        let mut bias_weights = Array2::zeros(bias.dim());
        for ((k, n), w) in bias_weights.indexed_iter_mut() {
            *w = if min_bias[n].is_finite() {
                (-(bias[[k, n]] - min_bias[n])).exp()
            } else {
                0.0
            };
        }

        let dim = tram.state_counts().dim();
        Self {
            bias_weights,
            min_bias,
            lagrangian_mult: Array2::zeros(dim),
            biased_conf_weights: Array2::zeros(dim),
            new_lagrangian_mult: Array2::zeros(dim),
            r_k_i: Array2::zeros(dim),
            denominators: Array1::zeros(tram.n_samples()),
        }
    }

    fn update_lagrangian_mult(
        &mut self,
        count_matrices: ArrayView3<'_, usize>,
        state_counts: ArrayView2<'_, usize>,
    ) {
        let (n_therm_states, n_conf_states) = state_counts.dim();
        let v = &self.lagrangian_mult;
        let phi = &self.biased_conf_weights;
        for k in 0..n_therm_states {
            for i in 0..n_conf_states {
                if state_counts[[k, i]] == 0 {
                    self.new_lagrangian_mult[[k, i]] = 0.0;
                    continue;
                }
                let mut sum = count_matrices[[k, i, i]] as f64;
                for j in 0..n_conf_states {
                    let c = count_matrices[[k, i, j]] + count_matrices[[k, j, i]];
                    if i == j || c == 0 {
                        continue;
                    }
                    let numerator = v[[k, i]] * phi[[k, j]];
                    sum += c as f64 * numerator / (numerator + v[[k, j]] * phi[[k, i]]);
                }
                self.new_lagrangian_mult[[k, i]] = sum;
            }
        }
    }

    fn update_r_k_i(
        &mut self,
        count_matrices: ArrayView3<'_, usize>,
        state_counts: ArrayView2<'_, usize>,
    ) {
        let (n_therm_states, n_conf_states) = state_counts.dim();
        let v = &self.new_lagrangian_mult;
        let phi = &self.biased_conf_weights;
        for k in 0..n_therm_states {
            for i in 0..n_conf_states {
                if state_counts[[k, i]] == 0 {
                    self.r_k_i[[k, i]] = 0.0;
                    continue;
                }
                let mut sum = count_matrices[[k, i, i]] as f64;
                let mut arrivals = 0;
                for j in 0..n_conf_states {
                    arrivals += count_matrices[[k, j, i]];
                    let c = count_matrices[[k, i, j]] + count_matrices[[k, j, i]];
                    if i == j || c == 0 {
                        continue;
                    }
                    let numerator = v[[k, j]] * phi[[k, i]];
                    sum += c as f64 * numerator / (v[[k, i]] * phi[[k, j]] + numerator);
                }
                if state_counts[[k, i]] > arrivals {
                    sum += (state_counts[[k, i]] - arrivals) as f64;
                }
                self.r_k_i[[k, i]] = sum;
            }
        }
    }

    fn update_biased_conf_weights(
        &mut self,
        conf_state_sequence: ArrayView1<'_, usize>,
        bins: &[Vec<usize>],
        next: &mut Snapshot,
    ) {
        let n_therm_states = self.r_k_i.len_of(Axis(0));
        for (n, &i) in conf_state_sequence.iter().enumerate() {
            let mut denominator = 0.0;
            for l in 0..n_therm_states {
                if self.r_k_i[[l, i]] > 0.0 {
                    denominator += self.r_k_i[[l, i]] * self.bias_weights[[l, n]]
                        / self.biased_conf_weights[[l, i]];
                }
            }
            self.denominators[n] = denominator;
            next.pointwise_free_energies[n] = denominator.ln() - self.min_bias[n];
        }

        for (i, samples) in bins.iter().enumerate() {
            for k in 0..n_therm_states {
                let weight: f64 = samples
                    .iter()
                    .map(|&n| self.bias_weights[[k, n]] / self.denominators[n])
                    .sum();
                next.biased_conf_energies[[k, i]] = -weight.ln();
            }
        }
    }
}

impl UpdateRule for DirectUpdate {
    fn step(&mut self, tram: &Tram, current: &Snapshot, next: &mut Snapshot) {
        self.lagrangian_mult.assign(&current.log_lagrangian_mult.mapv(f64::exp));
        self.biased_conf_weights
            .assign(&current.biased_conf_energies.mapv(|f| (-f).exp()));

        self.update_lagrangian_mult(tram.count_matrices().view(), tram.state_counts().view());
        self.update_r_k_i(tram.count_matrices().view(), tram.state_counts().view());
        self.update_biased_conf_weights(tram.conf_state_sequence().view(), tram.bins(), next);

        next.log_lagrangian_mult
            .assign(&self.new_lagrangian_mult.mapv(f64::ln));
    }
}

/// Estimate free energies with the direct TRAM iteration.
///
/// Same parameters and result as [`tram::estimate`](crate::tram::estimate).
pub fn estimate(
    count_matrices: ArrayView3<'_, usize>,
    state_counts: ArrayView2<'_, usize>,
    bias_energy_sequence: ArrayView2<'_, f64>,
    conf_state_sequence: ArrayView1<'_, usize>,
    maxiter: usize,
    maxerr: f64,
    lll_out: usize,
) -> Result<TramEstimate> {
    Ok(Tram::builder()
        .count_matrices(count_matrices.to_owned())
        .state_counts(state_counts.to_owned())
        .bias_energy_sequence(bias_energy_sequence.to_owned())
        .conf_state_sequence(conf_state_sequence.to_owned())
        .maxiter(maxiter)
        .maxerr(maxerr)
        .lll_out(lll_out)
        .scheme(UpdateScheme::Direct)
        .build()?
        .estimate())
}
