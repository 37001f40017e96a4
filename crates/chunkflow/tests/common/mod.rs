//! Shared test utilities for chunkflow integration tests.
//!
//! This module provides:
//! - `TestHarness` for isolated runs against a temp database and artifact store
//! - `ScriptedExecutor` and `ConfigBuilder` for describing scenarios

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::TestHarness;
