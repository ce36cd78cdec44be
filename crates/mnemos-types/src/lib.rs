//! Core types and traits for the mnemos recall engine.
//!
//! This crate defines the shared data model used by the memory substrate,
//! the runtime pipeline and the kernel: candidates, payloads, recall results,
//! the error taxonomy, configuration, and the two collaborator traits the
//! engine consumes (`MemoryStore`, `AffectModel`). It contains no business logic.

pub mod affect;
pub mod config;
pub mod error;
pub mod memory;
pub mod vector;
