//! fml-core: functional-impact bias detection for somatic mutations.
//!
//! Elements (genes or regions) are tested for an accumulation of mutations
//! with high functional-impact scores. The observed average score of each
//! element is compared against a null distribution obtained by drawing
//! random mutations from the element's own positions, weighted by the
//! mutational signature, and the resulting empirical p-values are corrected
//! with Benjamini-Hochberg.
//!
//! The library is driven by [`pipeline::run_analysis`], which the `fml`
//! binary and the optional Python bindings wrap.

pub mod cache;
pub mod config;
pub mod correction;
pub mod groups;
pub mod indels;
pub mod io;
pub mod mutations;
pub mod observed;
pub mod pipeline;
pub mod reference;
pub mod regions;
pub mod sampling;
pub mod scores;
pub mod signature;
pub mod site_weights;
pub mod statistic;
pub mod store;

#[cfg(feature = "python")]
mod python;

pub use config::Config;
pub use correction::ElementResult;
pub use pipeline::{analyze, finalize, run_analysis, Sources};
