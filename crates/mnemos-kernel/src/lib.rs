//! Core kernel for the mnemos recall engine.
//!
//! Loads configuration, assembles the store, caches, provider client,
//! vector index and recall engine into a [`RecallKernel`], and runs the
//! optional background maintenance loops.

pub mod background;
pub mod config;
pub mod error;
pub mod kernel;

pub use kernel::{BackfillReport, CacheReport, RecallKernel};
