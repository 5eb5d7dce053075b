use crate::errors::*;
use ndarray::{s, Array1, Array2, Array3, ArrayView1, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;

/// Multi-ensemble test case of Metropolis chains on a line of configuration states.
///
/// Each thermodynamic state `k` has reduced energies `energies[k, i]`. Its chain moves to a
/// neighbouring configuration state with probability $\frac{1}{2} e^{-\max(0, E_j - E_i)}$ and
/// stays put otherwise, so it is reversible with stationary distribution $\propto e^{-E_i}$.
///
/// # Examples
///
/// ```
/// use ndarray::array;
/// use tram_rs::testsystems::*;
///
/// let model = MetropolisModel::builder()
///     .energies(array![[0.0, 1.0, 0.5], [1.0, 0.0, 0.5]])
///     .n_samples(1000)
///     .build()?;
/// let Sample {
///     count_matrices,
///     state_counts,
///     conf_state_sequence,
///     bias_energy_sequence,
/// } = model.sample_with_seed(42);
///
/// assert_eq!(count_matrices.shape(), &[2, 3, 3]);
/// assert_eq!(state_counts.sum(), 2 * 1001);
/// assert_eq!(conf_state_sequence.len(), 2 * 1001);
/// assert_eq!(bias_energy_sequence.shape(), &[2, 2 * 1001]);
/// # Ok::<(), tram_rs::errors::TramError>(())
/// ```
#[derive(Builder, Debug)]
#[builder(build_fn(validate = "Self::validate", name = "build_inner", private))]
pub struct MetropolisModel {
    /// `energies[k, i]` is the reduced energy of configuration state `i` at thermodynamic state `k`
    energies: Array2<f64>,

    /// Number of transitions drawn per thermodynamic state
    #[builder(default = "10_000")]
    n_samples: usize,

    /// Configuration state every chain starts from
    #[builder(default = "0")]
    initial_state: usize,

    #[builder(setter(skip), default)]
    transition_matrices: Array3<f64>,
}

impl MetropolisModelBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        if let Some(energies) = &self.energies {
            if energies.iter().any(|e| !e.is_finite()) {
                return Err("energies must all be finite".to_string());
            }
            if energies.len_of(Axis(1)) == 0 {
                return Err("energies must have at least one configuration state".to_string());
            }
        }

        Ok(())
    }

    /// Build the model and its transition matrices
    pub fn build(&self) -> Result<MetropolisModel> {
        self.build_inner()?.init()
    }
}

impl MetropolisModel {
    fn init(mut self) -> Result<Self> {
        let (n_therm_states, n_conf_states) = self.energies.dim();
        if self.initial_state >= n_conf_states {
            return Err(TramError::IndexOutOfRange {
                name: "initial_state",
                index: self.initial_state as i64,
                bound: n_conf_states,
            });
        }

        let mut transition_matrices = Array3::zeros((n_therm_states, n_conf_states, n_conf_states));
        for (k, mut t) in transition_matrices.outer_iter_mut().enumerate() {
            t.assign(&metropolis_matrix(self.energies.index_axis(Axis(0), k)));
        }
        self.transition_matrices = transition_matrices;
        Ok(self)
    }

    /// Get a new builder for the `MetropolisModel` struct
    pub fn builder() -> MetropolisModelBuilder {
        MetropolisModelBuilder::default()
    }

    /// Draw energies for `n_therm_states` states over `n_conf_states` bins.
    ///
    /// Energies are $-\log u$ with $u$ uniform on $(0, 1]$; every state but the first also gets a
    /// random uniform offset.
    pub fn random_energies<R: Rng>(
        rng: &mut R,
        n_therm_states: usize,
        n_conf_states: usize,
    ) -> Array2<f64> {
        let mut energies = Array2::zeros((n_therm_states, n_conf_states));
        for (k, mut row) in energies.outer_iter_mut().enumerate() {
            let offset = if k > 0 { rng.gen::<f64>() } else { 0.0 };
            for e in row.iter_mut() {
                // gen() is in [0, 1)
                *e = -(1.0 - rng.gen::<f64>()).ln() + offset;
            }
        }
        energies
    }

    /// `energies[k, i]` is the reduced energy of configuration state `i` at state `k`
    pub fn energies(&self) -> &Array2<f64> {
        &self.energies
    }

    /// `transition_matrices[k, i, j]` is the probability of a jump from `i` to `j` at state `k`
    pub fn transition_matrices(&self) -> &Array3<f64> {
        &self.transition_matrices
    }

    /// Draw samples with a random seed
    pub fn sample(&self) -> Sample {
        self.sample_from(&mut StdRng::from_entropy())
    }

    /// Draw samples with a specified seed
    pub fn sample_with_seed(&self, seed: u64) -> Sample {
        self.sample_from(&mut StdRng::seed_from_u64(seed))
    }

    /// Run one chain of `n_samples` transitions per thermodynamic state.
    ///
    /// Samples are concatenated in state order and include each chain's starting point. Bias
    /// energies are taken relative to state 0.
    pub fn sample_from<R: Rng>(&self, rng: &mut R) -> Sample {
        let (n_therm_states, n_conf_states) = self.energies.dim();
        let chain_len = self.n_samples + 1;

        let mut count_matrices = Array3::zeros((n_therm_states, n_conf_states, n_conf_states));
        let mut state_counts = Array2::zeros((n_therm_states, n_conf_states));
        let mut conf_state_sequence = Vec::with_capacity(n_therm_states * chain_len);
        for k in 0..n_therm_states {
            let mut x = self.initial_state;
            state_counts[[k, x]] += 1;
            conf_state_sequence.push(x);
            for _ in 0..self.n_samples {
                let next = tower_sample(rng, self.transition_matrices.slice(s![k, x, ..]));
                count_matrices[[k, x, next]] += 1;
                x = next;
                state_counts[[k, x]] += 1;
                conf_state_sequence.push(x);
            }
        }

        let bias_energy_sequence =
            Array2::from_shape_fn((n_therm_states, conf_state_sequence.len()), |(k, n)| {
                let i = conf_state_sequence[n];
                self.energies[[k, i]] - self.energies[[0, i]]
            });

        Sample {
            count_matrices,
            state_counts,
            conf_state_sequence: Array1::from(conf_state_sequence),
            bias_energy_sequence,
        }
    }
}

/// A sample from a test case
#[derive(Debug, Clone)]
pub struct Sample {
    /// `count_matrices[k, i, j]` is the number of observed transitions `i -> j` at state `k`
    pub count_matrices: Array3<usize>,
    /// `state_counts[k, i]` is the number of samples at state `k` in configuration state `i`
    pub state_counts: Array2<usize>,
    /// `conf_state_sequence[n]` is the configuration state of sample `n`
    pub conf_state_sequence: Array1<usize>,
    /// `bias_energy_sequence[k, n]` is the bias energy of sample `n` at state `k` relative to
    /// state 0
    pub bias_energy_sequence: Array2<f64>,
}

impl Sample {
    /// Whether the count matrix pooled over all thermodynamic states is strongly connected
    pub fn is_connected(&self) -> bool {
        is_connected(self.count_matrices.sum_axis(Axis(0)).view())
    }
}

/// Whether the directed graph with an edge `i -> j` for every `count_matrix[i, j] > 0` is
/// strongly connected
pub fn is_connected(count_matrix: ArrayView2<'_, usize>) -> bool {
    let n = count_matrix.len_of(Axis(0));
    if n == 0 {
        return true;
    }
    let reaches_all = |forward: bool| {
        let mut seen = vec![false; n];
        let mut queue = VecDeque::new();
        seen[0] = true;
        queue.push_back(0);
        while let Some(i) = queue.pop_front() {
            for j in 0..n {
                let count = if forward {
                    count_matrix[[i, j]]
                } else {
                    count_matrix[[j, i]]
                };
                if count > 0 && !seen[j] {
                    seen[j] = true;
                    queue.push_back(j);
                }
            }
        }
        seen.into_iter().all(|s| s)
    };
    reaches_all(true) && reaches_all(false)
}

fn metropolis_matrix(energies: ArrayView1<'_, f64>) -> Array2<f64> {
    let n = energies.len();
    let mut t = Array2::zeros((n, n));
    for i in 0..n {
        let neighbours = [i.checked_sub(1), Some(i + 1).filter(|&j| j < n)];
        for &j in neighbours.iter().flatten() {
            t[[i, j]] = 0.5 * (-(energies[j] - energies[i]).max(0.0)).exp();
        }
        t[[i, i]] = 1.0 - t.row(i).sum();
    }
    t
}

fn tower_sample<R: Rng>(rng: &mut R, distribution: ArrayView1<'_, f64>) -> usize {
    let u = rng.gen::<f64>() * distribution.sum();
    let mut cdf = 0.0;
    for (i, &p) in distribution.iter().enumerate() {
        cdf += p;
        if u < cdf {
            return i;
        }
    }
    distribution.len() - 1
}
