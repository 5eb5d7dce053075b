use crate::convergence::ConvergenceMonitor;
use crate::errors::*;
use crate::lse::logsumexp;
use crate::tram_direct::DirectUpdate;
use crate::update::*;
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayView3, Axis};
use tracing::{debug, info, warn};

/// A sweep that lowers the log-likelihood is halved at most this many times
const MAX_STEP_HALVINGS: usize = 30;

/// Relative drop of the log-likelihood that is put down to rounding
const LOGL_RTOL: f64 = 1e-13;

fn does_not_lower(logl: f64, reference: f64) -> bool {
    reference == f64::NEG_INFINITY || logl >= reference - LOGL_RTOL * reference.abs().max(1.0)
}

/// Define the initial guess for the biased configuration energies
///
/// A previous estimate can be passed in with `Specified` to resume an iteration that ran into
/// `maxiter`.
#[derive(Debug, Clone, PartialEq)]
pub enum InitialEnergies {
    /// Use the specified `[T, M]` biased configuration energies
    Specified(Array2<f64>),
    /// Initialize all biased configuration energies to zero
    Zeros,
}

impl Default for InitialEnergies {
    fn default() -> Self {
        Self::Zeros
    }
}

impl From<Array2<f64>> for InitialEnergies {
    fn from(energies: Array2<f64>) -> Self {
        Self::Specified(energies)
    }
}

/// Which update rule advances the self-consistent iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateScheme {
    /// Every sum is a log-sum-exp reduction
    LogSpace,
    /// Sums run over plain weights with a per-sample shift of the bias energies
    Direct,
}

impl Default for UpdateScheme {
    fn default() -> Self {
        Self::LogSpace
    }
}

/// Transition-based reweighting analysis method (TRAM) for multi-ensemble Markov chain data.
///
/// # Notes
///
/// `count_matrices` and `state_counts` are typically produced by discretizing several
/// simulations, each run at its own thermodynamic state, into the same configuration states.
/// The pooled count matrix should be connected; this is not checked here.
///
/// # References
///
/// 1. Wu H, Paul F, Wehmeyer C and Noé F. Multiensemble Markov models of molecular
/// thermodynamics and kinetics. Proc. Natl. Acad. Sci. USA 113:E3221, 2016
/// <http://dx.doi.org/10.1073/pnas.1525092113>
#[derive(Builder, Debug)]
#[builder(build_fn(validate = "Self::validate", name = "build_inner", private))]
pub struct Tram {
    /// `count_matrices[k, i, j]` is the number of observed transitions from configuration state
    /// `i` to `j` in the simulation run at thermodynamic state `k`
    count_matrices: Array3<usize>,

    /// `state_counts[k, i]` is the number of samples of the simulation at state `k` that fall
    /// into configuration state `i`
    state_counts: Array2<usize>,

    /// `bias_energy_sequence[k, n]` is the reduced bias energy of sample `n` of the concatenated
    /// trajectories evaluated at thermodynamic state `k`
    bias_energy_sequence: Array2<f64>,

    /// `conf_state_sequence[n]` is the configuration state of sample `n`
    conf_state_sequence: Array1<usize>,

    /// Set to limit the maximum number of iterations performed
    #[builder(default = "1000")]
    maxiter: usize,

    /// Set the convergence threshold on the largest parameter change of an iteration
    #[builder(default = "1.0e-8")]
    maxerr: f64,

    /// Record error and log-likelihood every `lll_out` iterations (0 disables the histories)
    #[builder(default = "10")]
    lll_out: usize,

    /// Set the update rule
    #[builder(default)]
    scheme: UpdateScheme,

    /// Set to the initial biased configuration energies to use as a guess
    #[builder(default)]
    initial_biased_conf_energies: InitialEnergies,

    /// Set to the initial log Lagrange multipliers to use as a guess
    #[builder(setter(strip_option), default)]
    initial_log_lagrangian_mult: Option<Array2<f64>>,

    /// `bins[i]` lists the samples falling into configuration state `i`
    #[builder(setter(skip), default)]
    bins: Vec<Vec<usize>>,
}

impl TramBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        if let Some(maxerr) = self.maxerr {
            if !(maxerr.is_finite() && maxerr > 0.0) {
                return Err(format!("maxerr must be positive and finite (not {})", maxerr));
            }
        }

        Ok(())
    }

    /// Build the estimator, checking that all arrays agree in shape
    pub fn build(&self) -> Result<Tram> {
        self.build_inner()?.init()
    }
}

/// Result of a TRAM estimate
///
/// Free energies are shifted so that $\sum_i e^{-f_i} = 1$ for the unbiased `conf_energies`;
/// `biased_conf_energies` and `therm_energies` carry the same shift.
#[derive(Debug, Clone)]
pub struct TramEstimate {
    /// `biased_conf_energies[k, i]` is the free energy of configuration state `i` at
    /// thermodynamic state `k`
    pub biased_conf_energies: Array2<f64>,
    /// `conf_energies[i]` is the unbiased free energy of configuration state `i`
    pub conf_energies: Array1<f64>,
    /// `therm_energies[k]` is the free energy of thermodynamic state `k`
    pub therm_energies: Array1<f64>,
    /// `log_lagrangian_mult[k, i]`; $-\infty$ where `state_counts[k, i] == 0`
    pub log_lagrangian_mult: Array2<f64>,
    /// Recorded parameter errors
    pub error_history: Vec<f64>,
    /// Recorded log-likelihoods
    pub logl_history: Vec<f64>,
    /// Parameter error of the last iteration
    pub error: f64,
    /// Number of iterations performed
    pub iterations: usize,
    /// Whether `error` fell below `maxerr` before `maxiter` was reached
    pub converged: bool,
}

impl Tram {
    /// Validate shapes and index the samples by configuration state; called by build methods
    fn init(mut self) -> Result<Self> {
        let (n_therm_states, n_conf_states) = self.state_counts.dim();
        let n_samples = self.conf_state_sequence.len();

        check_shape(
            "count_matrices",
            self.count_matrices.shape(),
            &[n_therm_states, n_conf_states, n_conf_states],
        )?;
        check_shape(
            "bias_energy_sequence",
            self.bias_energy_sequence.shape(),
            &[n_therm_states, n_samples],
        )?;
        check_labels("conf_state_sequence", &self.conf_state_sequence, n_conf_states)?;
        check_bias_energies("bias_energy_sequence", self.bias_energy_sequence.view())?;

        if let InitialEnergies::Specified(energies) = &self.initial_biased_conf_energies {
            check_shape(
                "initial_biased_conf_energies",
                energies.shape(),
                &[n_therm_states, n_conf_states],
            )?;
            check_bias_energies("initial_biased_conf_energies", energies.view())?;
        }
        if let Some(log_v) = &self.initial_log_lagrangian_mult {
            check_shape(
                "initial_log_lagrangian_mult",
                log_v.shape(),
                &[n_therm_states, n_conf_states],
            )?;
            if let Some(((k, i), _)) = log_v
                .indexed_iter()
                .find(|&((k, i), x)| self.state_counts[[k, i]] > 0 && !x.is_finite())
            {
                return Err(TramError::NonFiniteInput {
                    name: "initial_log_lagrangian_mult",
                    index: vec![k, i],
                });
            }
        }

        let mut bins = vec![Vec::new(); n_conf_states];
        for (n, &i) in self.conf_state_sequence.iter().enumerate() {
            bins[i].push(n);
        }
        self.bins = bins;

        Ok(self)
    }

    /// Get a new builder for the `Tram` struct. `Tram` can only be constructed via the builder.
    pub fn builder() -> TramBuilder {
        TramBuilder::default()
    }

    /// $T$, the number of thermodynamic states
    pub fn n_therm_states(&self) -> usize {
        self.state_counts.len_of(Axis(0))
    }

    /// $M$, the number of configuration states
    pub fn n_conf_states(&self) -> usize {
        self.state_counts.len_of(Axis(1))
    }

    /// $N$, the total number of samples from all thermodynamic states
    pub fn n_samples(&self) -> usize {
        self.conf_state_sequence.len()
    }

    /// `count_matrices[k, i, j]` is the number of observed transitions from `i` to `j` at state `k`
    pub fn count_matrices(&self) -> &Array3<usize> {
        &self.count_matrices
    }

    /// `state_counts[k, i]` is the number of samples from state `k` in configuration state `i`
    pub fn state_counts(&self) -> &Array2<usize> {
        &self.state_counts
    }

    /// `bias_energy_sequence[k, n]` is the reduced bias energy of sample `n` at state `k`
    pub fn bias_energy_sequence(&self) -> &Array2<f64> {
        &self.bias_energy_sequence
    }

    /// `conf_state_sequence[n]` is the configuration state of sample `n`
    pub fn conf_state_sequence(&self) -> &Array1<usize> {
        &self.conf_state_sequence
    }

    /// The update rule used by `estimate`
    pub fn scheme(&self) -> UpdateScheme {
        self.scheme
    }

    pub(crate) fn bins(&self) -> &[Vec<usize>] {
        &self.bins
    }

    /// Run the self-consistent iteration with the configured update rule
    pub fn estimate(&self) -> TramEstimate {
        match self.scheme {
            UpdateScheme::LogSpace => self.estimate_with(&mut LogSpaceUpdate::new(self)),
            UpdateScheme::Direct => self.estimate_with(&mut DirectUpdate::new(self)),
        }
    }

    /// Run the self-consistent iteration with an arbitrary update rule
    ///
    /// Each sweep is judged by the log-likelihood of its biased energies with the multipliers
    /// settled for them. A sweep that would lower it is cut back by halving, towards the
    /// snapshot it started from, and dropped entirely if halving does not help. A shortened
    /// sweep continues from the settled multipliers. Recorded log-likelihoods therefore never
    /// decrease. The error of a sweep is always that of the full update.
    pub fn estimate_with<U: UpdateRule>(&self, rule: &mut U) -> TramEstimate {
        let mut current = self.initial_snapshot();
        let mut next = current.clone();
        let mut trial = current.clone();
        let mut settled = SettledMultipliers::new(&current.log_lagrangian_mult);
        let mut scratch = Vec::new();
        let mut monitor = ConvergenceMonitor::new(self.maxiter, self.maxerr, self.lll_out);

        // the initial guess has no pointwise energies to be judged by
        let mut logl = f64::NEG_INFINITY;
        let mut error = f64::INFINITY;
        let mut iterations = 0;
        let mut converged = false;
        for iteration in 0..self.maxiter {
            rule.step(self, &current, &mut next);
            let full_error =
                ConvergenceMonitor::parameter_error(&current, &next, self.state_counts.view());

            let mut next_logl = settled.log_likelihood(self, &next);
            let mut fraction = 1.0;
            let mut halvings = 0;
            while !does_not_lower(next_logl, logl) && halvings < MAX_STEP_HALVINGS {
                fraction *= 0.5;
                halvings += 1;
                trial.interpolate(self, &current, &next, fraction, &mut scratch);
                next_logl = settled.log_likelihood(self, &trial);
            }
            if !does_not_lower(next_logl, logl) {
                fraction = 0.0;
                trial.clone_from(&current);
                next_logl = settled.log_likelihood(self, &trial);
            }
            if halvings > 0 {
                debug!(iteration, fraction, "shortened sweep");
                trial.log_lagrangian_mult.assign(settled.candidate());
                std::mem::swap(&mut next, &mut trial);
            }
            settled.accept();

            let progress = monitor.observe(iteration, full_error, next_logl);
            std::mem::swap(&mut current, &mut next);
            logl = next_logl;
            error = progress.error;
            iterations = iteration + 1;
            if progress.finished {
                converged = progress.converged;
                break;
            }
        }

        if converged {
            info!(iterations, error, "TRAM converged");
        } else {
            warn!(
                iterations,
                error,
                maxerr = self.maxerr,
                "TRAM did not converge within maxiter"
            );
        }

        let (error_history, logl_history) = monitor.into_histories();
        let Snapshot {
            log_lagrangian_mult,
            mut biased_conf_energies,
            ..
        } = current;

        let mut conf_energies = self.conf_energies(
            log_lagrangian_mult.view(),
            biased_conf_energies.view(),
        );
        let shift = logsumexp(&conf_energies.mapv(|f| -f).to_vec());
        // no samples at all leaves every conf energy at +inf and nothing to normalize
        if shift.is_finite() {
            conf_energies.mapv_inplace(|f| f + shift);
            biased_conf_energies.mapv_inplace(|f| f + shift);
        }
        let therm_energies = therm_energies(biased_conf_energies.view());

        TramEstimate {
            biased_conf_energies,
            conf_energies,
            therm_energies,
            log_lagrangian_mult,
            error_history,
            logl_history,
            error,
            iterations,
            converged,
        }
    }

    fn initial_snapshot(&self) -> Snapshot {
        let log_lagrangian_mult = match &self.initial_log_lagrangian_mult {
            Some(log_v) => {
                let mut log_v = log_v.clone();
                for ((k, i), x) in log_v.indexed_iter_mut() {
                    if self.state_counts[[k, i]] == 0 {
                        *x = f64::NEG_INFINITY;
                    }
                }
                log_v
            }
            None => initial_log_lagrangian_mult(
                self.count_matrices.view(),
                self.state_counts.view(),
            ),
        };
        let biased_conf_energies = match &self.initial_biased_conf_energies {
            InitialEnergies::Specified(energies) => energies.clone(),
            InitialEnergies::Zeros => Array2::zeros(self.state_counts.dim()),
        };

        Snapshot {
            log_lagrangian_mult,
            biased_conf_energies,
            pointwise_free_energies: Array1::zeros(self.n_samples()),
        }
    }

    /// Unnormalized unbiased configuration energies at the given parameters
    fn conf_energies(
        &self,
        log_lagrangian_mult: ArrayView2<'_, f64>,
        biased_conf_energies: ArrayView2<'_, f64>,
    ) -> Array1<f64> {
        let mut log_r_k_i = Array2::zeros(self.state_counts.dim());
        compute_log_r_k_i(
            log_lagrangian_mult,
            biased_conf_energies,
            self.count_matrices.view(),
            self.state_counts.view(),
            &mut log_r_k_i,
        );
        let mut pointwise = Array1::zeros(self.n_samples());
        compute_pointwise_free_energies(
            log_r_k_i.view(),
            biased_conf_energies,
            self.bias_energy_sequence.view(),
            self.conf_state_sequence.view(),
            pointwise.view_mut(),
        );
        conf_energies_from_pointwise(pointwise.view(), &self.bins)
    }
}

/// $f^k = -\log \sum_i e^{-f_i^k}$
pub(crate) fn therm_energies(biased_conf_energies: ArrayView2<'_, f64>) -> Array1<f64> {
    biased_conf_energies
        .outer_iter()
        .map(|row| -logsumexp(&row.mapv(|f| -f).to_vec()))
        .collect()
}

/// Bias energies may be $+\infty$ (outside the support of a state) but never NaN or $-\infty$
pub(crate) fn check_bias_energies(name: &'static str, energies: ArrayView2<'_, f64>) -> Result<()> {
    match energies
        .indexed_iter()
        .find(|&(_, &x)| x.is_nan() || x == f64::NEG_INFINITY)
    {
        Some(((k, n), _)) => Err(TramError::NonFiniteInput {
            name,
            index: vec![k, n],
        }),
        None => Ok(()),
    }
}

/// Estimate free energies with the log-space TRAM iteration.
///
/// # Parameters
///
/// * `count_matrices[k, i, j]` is the number of observed transitions `i -> j` at state `k`
///
/// * `state_counts[k, i]` is the number of samples at state `k` in configuration state `i`
///
/// * `bias_energy_sequence[k, n]` is the reduced bias energy of sample `n` evaluated at state `k`
///
/// * `conf_state_sequence[n]` is the configuration state of sample `n`
///
/// * `maxiter` and `maxerr` bound the iteration; `lll_out` is the recording stride of the
///   error and log-likelihood histories
///
/// Running into `maxiter` is not an error; check `TramEstimate::converged`.
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
        .scheme(UpdateScheme::LogSpace)
        .build()?
        .estimate())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array1, Array3};

    /// One thermodynamic state, three bins, counts equal to a symmetric flux matrix.
    ///
    /// The stationary distribution is proportional to the row sums (30, 60, 110).
    fn exact_three_state_chain() -> (Array3<usize>, Array2<usize>, Array2<f64>, Array1<usize>) {
        let count_matrices =
            Array3::from_shape_vec((1, 3, 3), vec![20, 10, 0, 10, 30, 20, 0, 20, 90]).unwrap();
        let state_counts = array![[30, 60, 110]];
        let conf_state_sequence: Array1<usize> = (0..3)
            .flat_map(|i| std::iter::repeat(i).take(state_counts[[0, i]]))
            .collect();
        let bias_energy_sequence = Array2::zeros((1, conf_state_sequence.len()));
        (
            count_matrices,
            state_counts,
            bias_energy_sequence,
            conf_state_sequence,
        )
    }

    fn builder_for(
        (c, n, b, s): (Array3<usize>, Array2<usize>, Array2<f64>, Array1<usize>),
    ) -> TramBuilder {
        let mut builder = Tram::builder();
        builder
            .count_matrices(c)
            .state_counts(n)
            .bias_energy_sequence(b)
            .conf_state_sequence(s);
        builder
    }

    #[test]
    fn build_tram() {
        let tram = builder_for(exact_three_state_chain()).build().unwrap();

        assert_eq!(tram.n_therm_states(), 1);
        assert_eq!(tram.n_conf_states(), 3);
        assert_eq!(tram.n_samples(), 200);
        assert_eq!(tram.maxiter, 1000);
        assert_eq!(tram.maxerr, 1.0e-8);
        assert_eq!(tram.lll_out, 10);
        assert_eq!(tram.scheme(), UpdateScheme::LogSpace);
        assert_eq!(tram.initial_biased_conf_energies, InitialEnergies::Zeros);
        assert_eq!(tram.initial_log_lagrangian_mult, None);
        assert_eq!(tram.bins()[0], (0..30).collect::<Vec<_>>());
    }

    #[test]
    fn recovers_stationary_distribution_of_exact_chain() {
        let estimate = builder_for(exact_three_state_chain())
            .maxiter(10_000)
            .maxerr(1e-12)
            .build()
            .unwrap()
            .estimate();
        assert!(estimate.converged);

        let pi: [f64; 3] = [30.0 / 200.0, 60.0 / 200.0, 110.0 / 200.0];
        for (f, p) in estimate.conf_energies.iter().zip(pi.iter()) {
            assert_abs_diff_eq!(*f, -p.ln(), epsilon = 1e-6);
        }
        assert_abs_diff_eq!(estimate.therm_energies[0], 0.0, epsilon = 1e-6);
        for (f, g) in estimate
            .biased_conf_energies
            .iter()
            .zip(estimate.conf_energies.iter())
        {
            assert_abs_diff_eq!(*f, *g, epsilon = 1e-10);
        }
    }

    #[test]
    fn maxiter_exhaustion_is_reported_not_fatal() {
        let estimate = builder_for(exact_three_state_chain())
            .maxiter(2)
            .maxerr(1e-14)
            .lll_out(1)
            .build()
            .unwrap()
            .estimate();
        assert!(!estimate.converged);
        assert_eq!(estimate.iterations, 2);
        assert_eq!(estimate.error_history.len(), 2);
        assert_eq!(estimate.error, estimate.error_history[1]);
        assert!(estimate.conf_energies.iter().all(|f| f.is_finite()));
    }

    #[test]
    fn resuming_from_an_estimate_converges_immediately() {
        let first = builder_for(exact_three_state_chain())
            .maxiter(10_000)
            .maxerr(1e-12)
            .build()
            .unwrap()
            .estimate();
        let resumed = builder_for(exact_three_state_chain())
            .maxerr(1e-9)
            .initial_biased_conf_energies(first.biased_conf_energies.clone().into())
            .initial_log_lagrangian_mult(first.log_lagrangian_mult.clone())
            .build()
            .unwrap()
            .estimate();
        assert!(resumed.converged);
        assert_eq!(resumed.iterations, 1);
    }

    #[test]
    fn unvisited_bins_keep_sentinels() {
        let (mut c, mut n, _, _) = exact_three_state_chain();
        // drop bin 2 entirely
        c[[0, 1, 2]] = 0;
        c[[0, 2, 1]] = 0;
        c[[0, 2, 2]] = 0;
        n[[0, 1]] = 40;
        n[[0, 2]] = 0;
        let s: Array1<usize> = (0..70).map(|x| if x < 30 { 0 } else { 1 }).collect();
        let b = Array2::zeros((1, 70));
        let estimate = builder_for((c, n, b, s))
            .maxiter(10_000)
            .build()
            .unwrap()
            .estimate();

        assert!(estimate.converged);
        assert_eq!(estimate.log_lagrangian_mult[[0, 2]], f64::NEG_INFINITY);
        assert_eq!(estimate.biased_conf_energies[[0, 2]], f64::INFINITY);
        assert_eq!(estimate.conf_energies[2], f64::INFINITY);
        assert!(estimate.log_lagrangian_mult[[0, 0]].is_finite());
        assert_abs_diff_eq!(
            estimate.conf_energies[0],
            -(30.0f64 / 70.0).ln(),
            epsilon = 1e-6
        );
    }

    #[test]
    fn empty_trajectory_gives_infinite_energies_not_nan() {
        let c = Array3::zeros((2, 3, 3));
        let n = Array2::zeros((2, 3));
        let b = Array2::zeros((2, 0));
        let s = Array1::zeros(0);
        let estimate = builder_for((c, n, b, s)).build().unwrap().estimate();

        assert!(estimate.converged);
        assert!(estimate.conf_energies.iter().all(|&f| f == f64::INFINITY));
        assert!(estimate
            .biased_conf_energies
            .iter()
            .all(|&f| f == f64::INFINITY));
        assert!(estimate.therm_energies.iter().all(|&f| f == f64::INFINITY));
        assert!(estimate.logl_history.iter().all(|l| !l.is_nan()));
    }

    #[test]
    fn rejects_inconsistent_shapes() {
        let (c, n, _, s) = exact_three_state_chain();
        let b = Array2::zeros((2, s.len()));
        assert!(matches!(
            builder_for((c, n, b, s)).build(),
            Err(TramError::ShapeMismatch {
                name: "bias_energy_sequence",
                ..
            })
        ));

        let (c, _, b, s) = exact_three_state_chain();
        let n = array![[30, 60, 110, 0]];
        assert!(matches!(
            builder_for((c, n, b, s)).build(),
            Err(TramError::ShapeMismatch {
                name: "count_matrices",
                ..
            })
        ));
    }

    #[test]
    fn rejects_bad_values() {
        let (c, n, mut b, s) = exact_three_state_chain();
        b[[0, 7]] = f64::NAN;
        assert!(matches!(
            builder_for((c, n, b, s)).build(),
            Err(TramError::NonFiniteInput { .. })
        ));

        let (c, n, mut b, mut s) = exact_three_state_chain();
        b[[0, 7]] = f64::INFINITY;
        s[5] = 3;
        assert!(matches!(
            builder_for((c, n, b, s)).build(),
            Err(TramError::IndexOutOfRange { index: 3, .. })
        ));

        assert!(matches!(
            builder_for(exact_three_state_chain()).maxerr(0.0).build(),
            Err(TramError::BuilderError(_))
        ));
        assert!(matches!(
            Tram::builder().build(),
            Err(TramError::BuilderError(_))
        ));
    }
}
