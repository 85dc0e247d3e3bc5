//! moe-stream: disk-streamed sparse Mixture-of-Experts execution on CPU.
//!
//! Expert weights live in a flat bundle on disk. An [`ExpertCache`] keeps a
//! bounded LRU set of them in memory and streams misses in on a background
//! I/O thread. A [`Pipeline`] turns each layer's routing decision into a
//! dependency graph of gate/up/down/reduce tasks, holds tasks back until the
//! matrices they read are resident, and drains the graph on a fixed pool of
//! worker threads.

pub mod affinity;
pub mod bundle;
pub mod cache;
pub mod config;
pub mod error;
pub mod io;
pub mod kernel;
pub mod moe;
#[cfg(feature = "python")]
pub mod python;
pub mod task;

pub use bundle::{BundleLayout, BundleWriter};
pub use cache::{CacheStats, ExpertCache};
pub use config::{Activation, CacheConfig, IdleStrategy, PipelineConfig};
pub use error::{Error, Result};
pub use moe::{ComputeParam, ForwardArgs, Pipeline};

/// Install the `env_logger` backend (RUST_LOG). Safe to call more than once.
pub fn init_logging() {
    let _ = env_logger::try_init();
}

#[cfg(feature = "python")]
use pyo3::prelude::*;

/// moe-stream: disk-streamed sparse MoE runtime
#[cfg(feature = "python")]
#[pymodule]
fn moe_stream(m: &Bound<'_, PyModule>) -> PyResult<()> {
    init_logging();
    m.add_class::<python::MoeEngine>()?;
    Ok(())
}
