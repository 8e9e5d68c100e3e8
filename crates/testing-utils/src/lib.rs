//! # Discovery Testing Utils
//!
//! Shared testing utilities for the discovery engine workspace: entity
//! builders, scripted connectors, failure-injecting repositories and a
//! harness that wires the domain services together.
//!
//! ## Usage
//!
//! ```toml
//! [dev-dependencies]
//! discovery-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use helpers::*;
pub use mocks::*;
