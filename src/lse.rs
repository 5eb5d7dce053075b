//! Numerically stable log-sum-exp reductions.
//!
//! Every estimating equation in this crate is a sum of exponentials of (biased) free energies.
//! Those sums are carried out in log space,
//!
//! $$
//!     \log \sum_i e^{v_i} = m + \log \sum_i e^{v_i - m}, \qquad m = \max_i v_i,
//! $$
//!
//! so that neither very large nor very negative arguments overflow or underflow.
//!
//! # Examples
//!
//! ```
//! use tram_rs::lse::{logsumexp, logsumexp_pair};
//!
//! let values = [1000.0, 1000.0];
//! assert!((logsumexp(&values) - (1000.0 + 2f64.ln())).abs() < 1e-12);
//! assert_eq!(logsumexp_pair(1000.0, 1000.0), logsumexp(&values));
//! assert_eq!(logsumexp(&[f64::NEG_INFINITY; 3]), f64::NEG_INFINITY);
//! ```

/// Compute $\log \sum_i e^{v_i}$ over `values`.
///
/// Entries of $-\infty$ represent zero mass. An empty slice, or one holding only $-\infty$,
/// yields $-\infty$; a $+\infty$ entry yields $+\infty$. The sum runs in slice order.
pub fn logsumexp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max.is_infinite() {
        return max;
    }
    let sum = values.iter().fold(0.0, |acc, &v| acc + (v - max).exp());
    max + sum.ln()
}

/// Compute $\log(e^a + e^b)$.
///
/// Gives bit-identical results to `logsumexp(&[a, b])`.
#[inline]
pub fn logsumexp_pair(a: f64, b: f64) -> f64 {
    let max = a.max(b);
    if max.is_infinite() {
        return max;
    }
    max + (0.0 + (a - max).exp() + (b - max).exp()).ln()
}
