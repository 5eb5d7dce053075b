//! Python bindings via PyO3 and numpy.
//!
//! The functions mirror the module-level API of the Rust crate and take numpy arrays. Integer
//! arrays are expected as `np.intc`, float arrays as `np.float64`; output buffers are written in
//! place.
//!
//! # Building the Python extension
//!
//! ```bash
//! pip install maturin
//! maturin develop --features python
//! ```
//!
//! # Usage
//!
//! ```python
//! import numpy as np
//! import tram_rs
//!
//! (biased_conf_energies, conf_energies, therm_energies, log_lagrangian_mult,
//!  error_history, logL_history) = tram_rs.estimate(
//!     count_matrices, state_counts, bias_energy_sequence, conf_state_sequence,
//!     maxiter=100000, maxerr=1.0e-10, lll_out=10)
//! mu = np.zeros(conf_state_sequence.shape[0])
//! tram_rs.get_pointwise_unbiased_free_energies(
//!     log_lagrangian_mult, biased_conf_energies, count_matrices, bias_energy_sequence,
//!     conf_state_sequence, state_counts, None, None, mu)
//! ```

use crate::errors::TramError;
use crate::{lse, reweighting, transition, tram, tram_direct};
use ndarray::{Array, Dimension};
use numpy::{PyArray, PyArray1, PyArray2, PyArray3};
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use pyo3::types::PyTuple;
use pyo3::wrap_pyfunction;

impl From<TramError> for PyErr {
    fn from(err: TramError) -> PyErr {
        match err {
            TramError::UnhandledPythonException { source } => source,
            other => PyValueError::new_err(other.to_string()),
        }
    }
}

/// Copy a numpy `intc` array into an owned `usize` array, rejecting negative entries
fn to_usize<D: Dimension>(
    name: &'static str,
    array: &PyArray<i32, D>,
) -> Result<Array<usize, D>, TramError> {
    let array = array.to_owned_array();
    if let Some(&value) = array.iter().find(|&&x| x < 0) {
        return Err(TramError::NegativeInteger {
            name,
            value: i64::from(value),
        });
    }
    Ok(array.mapv(|x| x as usize))
}

fn estimate_result(py: Python<'_>, estimate: tram::TramEstimate) -> PyObject {
    let items = vec![
        PyArray::from_array(py, &estimate.biased_conf_energies).to_object(py),
        PyArray::from_array(py, &estimate.conf_energies).to_object(py),
        PyArray::from_array(py, &estimate.therm_energies).to_object(py),
        PyArray::from_array(py, &estimate.log_lagrangian_mult).to_object(py),
        PyArray1::from_vec(py, estimate.error_history).to_object(py),
        PyArray1::from_vec(py, estimate.logl_history).to_object(py),
    ];
    PyTuple::new(py, items).to_object(py)
}

/// estimate(count_matrices, state_counts, bias_energy_sequence, conf_state_sequence,
///          maxiter=1000, maxerr=1.0e-8, lll_out=10)
///
/// Returns (biased_conf_energies, conf_energies, therm_energies, log_lagrangian_mult,
/// error_history, logL_history).
#[pyfunction(maxiter = "1000", maxerr = "1.0e-8", lll_out = "10")]
fn estimate(
    py: Python<'_>,
    count_matrices: &PyArray3<i32>,
    state_counts: &PyArray2<i32>,
    bias_energy_sequence: &PyArray2<f64>,
    conf_state_sequence: &PyArray1<i32>,
    maxiter: usize,
    maxerr: f64,
    lll_out: usize,
) -> PyResult<PyObject> {
    let estimate = tram::estimate(
        to_usize("count_matrices", count_matrices)?.view(),
        to_usize("state_counts", state_counts)?.view(),
        bias_energy_sequence.to_owned_array().view(),
        to_usize("conf_state_sequence", conf_state_sequence)?.view(),
        maxiter,
        maxerr,
        lll_out,
    )?;
    Ok(estimate_result(py, estimate))
}

/// Same as `estimate`, with the direct update scheme.
#[pyfunction(maxiter = "1000", maxerr = "1.0e-8", lll_out = "10")]
fn estimate_direct(
    py: Python<'_>,
    count_matrices: &PyArray3<i32>,
    state_counts: &PyArray2<i32>,
    bias_energy_sequence: &PyArray2<f64>,
    conf_state_sequence: &PyArray1<i32>,
    maxiter: usize,
    maxerr: f64,
    lll_out: usize,
) -> PyResult<PyObject> {
    let estimate = tram_direct::estimate(
        to_usize("count_matrices", count_matrices)?.view(),
        to_usize("state_counts", state_counts)?.view(),
        bias_energy_sequence.to_owned_array().view(),
        to_usize("conf_state_sequence", conf_state_sequence)?.view(),
        maxiter,
        maxerr,
        lll_out,
    )?;
    Ok(estimate_result(py, estimate))
}

/// estimate_transition_matrices(log_lagrangian_mult, biased_conf_energies, count_matrices,
///                              active_set)
#[pyfunction]
fn estimate_transition_matrices<'py>(
    py: Python<'py>,
    log_lagrangian_mult: &PyArray2<f64>,
    biased_conf_energies: &PyArray2<f64>,
    count_matrices: &PyArray3<i32>,
    active_set: Option<Vec<usize>>,
) -> PyResult<&'py PyArray3<f64>> {
    let transition_matrices = transition::estimate_transition_matrices(
        log_lagrangian_mult.to_owned_array().view(),
        biased_conf_energies.to_owned_array().view(),
        to_usize("count_matrices", count_matrices)?.view(),
        active_set.as_deref(),
    )?;
    Ok(PyArray::from_array(py, &transition_matrices))
}

/// get_pointwise_unbiased_free_energies(log_lagrangian_mult, biased_conf_energies,
///     count_matrices, bias_energy_sequence, conf_state_sequence, state_counts,
///     log_R_K_i, therm_state, output)
#[pyfunction]
#[allow(clippy::too_many_arguments)]
fn get_pointwise_unbiased_free_energies(
    log_lagrangian_mult: &PyArray2<f64>,
    biased_conf_energies: &PyArray2<f64>,
    count_matrices: &PyArray3<i32>,
    bias_energy_sequence: &PyArray2<f64>,
    conf_state_sequence: &PyArray1<i32>,
    state_counts: &PyArray2<i32>,
    log_r_k_i: Option<&PyArray2<f64>>,
    therm_state: Option<usize>,
    output: &PyArray1<f64>,
) -> PyResult<()> {
    let log_lagrangian_mult = log_lagrangian_mult.to_owned_array();
    let biased_conf_energies = biased_conf_energies.to_owned_array();
    let count_matrices = to_usize("count_matrices", count_matrices)?;
    let bias_energy_sequence = bias_energy_sequence.to_owned_array();
    let conf_state_sequence = to_usize("conf_state_sequence", conf_state_sequence)?;
    let state_counts = to_usize("state_counts", state_counts)?;
    let log_r_k_i = log_r_k_i.map(|array| array.to_owned_array());
    // SAFETY: `output` may share memory with any of the input arrays. All of them were copied
    // into owned arrays above, so no borrowed view of caller memory is alive while it is written.
    let output = unsafe { output.as_array_mut() };
    reweighting::get_pointwise_unbiased_free_energies(
        therm_state,
        log_lagrangian_mult.view(),
        biased_conf_energies.view(),
        count_matrices.view(),
        bias_energy_sequence.view(),
        conf_state_sequence.view(),
        state_counts.view(),
        log_r_k_i.as_ref().map(|array| array.view()),
        output,
    )?;
    Ok(())
}

/// get_unbiased_user_free_energies(mu, label_sequence, output)
#[pyfunction]
fn get_unbiased_user_free_energies(
    mu: &PyArray1<f64>,
    label_sequence: &PyArray1<i32>,
    output: &PyArray1<f64>,
) -> PyResult<()> {
    let mu = mu.to_owned_array();
    let label_sequence = to_usize("label_sequence", label_sequence)?;
    // SAFETY: `output` may share memory with `mu` or `label_sequence`, so both are copied into
    // owned arrays above and no borrowed view of either is alive while `output` is written.
    let output = unsafe { output.as_array_mut() };
    reweighting::get_unbiased_user_free_energies(mu.view(), label_sequence.view(), output)?;
    Ok(())
}

/// logsumexp(values)
#[pyfunction]
fn logsumexp(values: Vec<f64>) -> f64 {
    lse::logsumexp(&values)
}

/// logsumexp_pair(a, b)
#[pyfunction]
fn logsumexp_pair(a: f64, b: f64) -> f64 {
    lse::logsumexp_pair(a, b)
}

/// Transition-based reweighting analysis method (TRAM)
#[pymodule]
fn tram_rs(_py: Python<'_>, m: &PyModule) -> PyResult<()> {
    m.add("__version__", crate::VERSION)?;
    m.add_wrapped(wrap_pyfunction!(estimate))?;
    m.add_wrapped(wrap_pyfunction!(estimate_direct))?;
    m.add_wrapped(wrap_pyfunction!(estimate_transition_matrices))?;
    m.add_wrapped(wrap_pyfunction!(get_pointwise_unbiased_free_energies))?;
    m.add_wrapped(wrap_pyfunction!(get_unbiased_user_free_energies))?;
    m.add_wrapped(wrap_pyfunction!(logsumexp))?;
    m.add_wrapped(wrap_pyfunction!(logsumexp_pair))?;
    Ok(())
}
