//! Visibility, lighting and fog-of-war engine for shared tabletop maps.
//!
//! `VisionEngine` is the long-lived entry point: it owns a zone, answers
//! visible-area and light queries per view, and keeps cached results
//! consistent as the zone changes. `evaluate_json` runs a one-shot request
//! through a fresh engine, and is what the optional Python module exposes.

#[cfg(feature = "python")]
use pyo3::prelude::*;

pub mod cache;
pub mod campaign;
pub mod config;
pub mod engine;
pub mod error;
pub mod fog;
pub mod light;
pub mod prng;
pub mod region;
pub mod shape;
pub mod syntax;
pub mod topology;
pub mod types;
pub mod visibility;
pub mod zone;

pub use campaign::Campaign;
pub use config::EngineConfig;
pub use engine::{evaluate, EvaluateRequest, EvaluateResponse, VisionEngine, ZoneEvent};
pub use error::{EngineError, Result};
pub use region::Region;
pub use topology::Topology;
pub use zone::Zone;

/// Evaluate a JSON request and return the JSON response.
pub fn evaluate_json(request_json: &str) -> Result<String> {
    let request: EvaluateRequest = serde_json::from_str(request_json)?;
    let response = evaluate(request)?;
    Ok(serde_json::to_string(&response)?)
}

#[cfg(feature = "python")]
#[pyfunction(name = "evaluate_json")]
fn py_evaluate_json(request_json: &str) -> PyResult<String> {
    evaluate_json(request_json)
        .map_err(|e| PyErr::new::<pyo3::exceptions::PyValueError, _>(e.to_string()))
}

/// Vision engine, importable from Python.
#[cfg(feature = "python")]
#[pymodule]
fn vision_rs(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(py_evaluate_json, m)?)?;
    Ok(())
}
