#![warn(rust_2018_idioms, missing_docs, missing_debug_implementations)]

//! The transition-based reweighting analysis method (TRAM) for the analysis of Markov chain data
//! sampled at multiple thermodynamic states, estimating unbiased free energies of configuration
//! states together with the free energies of each biased ensemble and their transition matrices.
//!
//! Please reference the following if you use this code in your research:
//!
//! [1] Wu H, Paul F, Wehmeyer C and Noé F. Multiensemble Markov models of molecular
//! thermodynamics and kinetics. Proc. Natl. Acad. Sci. USA 113:E3221, 2016.
//! <http://dx.doi.org/10.1073/pnas.1525092113>
//!
//! # Examples
//!
//! ```
//! use tram_rs::testsystems::MetropolisModel;
//! use tram_rs::Tram;
//! use ndarray::array;
//!
//! let model = MetropolisModel::builder()
//!     .energies(array![[0.0, 0.5, 1.0], [1.0, 0.5, 0.0]])
//!     .n_samples(2000)
//!     .build()?;
//! let sample = model.sample_with_seed(1);
//!
//! let estimate = Tram::builder()
//!     .count_matrices(sample.count_matrices)
//!     .state_counts(sample.state_counts)
//!     .bias_energy_sequence(sample.bias_energy_sequence)
//!     .conf_state_sequence(sample.conf_state_sequence)
//!     .maxiter(100_000)
//!     .build()?
//!     .estimate();
//!
//! let total: f64 = estimate.conf_energies.iter().map(|f| (-f).exp()).sum();
//! assert!((total - 1.0).abs() < 1e-10);
//! # Ok::<(), tram_rs::errors::TramError>(())
//! ```

#[macro_use]
extern crate derive_builder;

/// Error handling
pub mod errors;
pub mod convergence;
pub mod lse;
pub mod reweighting;
/// Test systems with known ground truth
pub mod testsystems;
pub mod transition;
/// The TRAM estimator and its log-space iteration
pub mod tram;
pub mod tram_direct;
pub mod update;

#[cfg(feature = "python")]
pub mod python;

pub use crate::errors::{Result, TramError};
pub use crate::reweighting::{
    get_pointwise_unbiased_free_energies, get_unbiased_user_free_energies,
};
pub use crate::transition::estimate_transition_matrices;
pub use crate::tram::{InitialEnergies, Tram, TramBuilder, TramEstimate, UpdateScheme};

/// Version of the crate, as set at build time
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
