//! Python bindings, bundled as the `fml_core` extension module.

use std::path::{Path, PathBuf};

use pyo3::exceptions::PyRuntimeError;
use pyo3::prelude::*;

use crate::config::Config;
use crate::pipeline::run_analysis;

/// Run the full analysis.
///
/// # Returns
/// * Path of the result table, or `None` when no element produced a result
#[pyfunction]
#[pyo3(signature = (mutations, elements, config, output, blacklist=None, seed=None, cores=None))]
fn run(
    py: Python<'_>,
    mutations: PathBuf,
    elements: PathBuf,
    config: PathBuf,
    output: PathBuf,
    blacklist: Option<PathBuf>,
    seed: Option<u64>,
    cores: Option<usize>,
) -> PyResult<Option<String>> {
    let mut cfg = Config::load(&config).map_err(|e| PyRuntimeError::new_err(format!("{:#}", e)))?;
    if seed.is_some() {
        cfg.settings.seed = seed;
    }
    if cores.is_some() {
        cfg.settings.cores = cores;
    }
    // Progress bars would fight with Python's own output
    cfg.settings.silent = true;

    let result = py.allow_threads(|| run_analysis(&cfg, &mutations, &elements, &output, blacklist.as_deref()));
    match result {
        Ok(path) => Ok(path.map(|p: PathBuf| p.display().to_string())),
        Err(e) => Err(PyRuntimeError::new_err(format!("{:#}", e))),
    }
}

/// Validate a configuration file without running anything.
#[pyfunction]
fn check_config(path: &str) -> PyResult<()> {
    let config = Config::load(Path::new(path)).map_err(|e| PyRuntimeError::new_err(format!("{:#}", e)))?;
    config.check_inputs().map_err(|e| PyRuntimeError::new_err(format!("{:#}", e)))
}

#[pyfunction]
fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[pymodule]
fn fml_core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    pyo3_log::init();
    m.add_function(wrap_pyfunction!(run, m)?)?;
    m.add_function(wrap_pyfunction!(check_config, m)?)?;
    m.add_function(wrap_pyfunction!(version, m)?)?;
    Ok(())
}
