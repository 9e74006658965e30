//! Shared primitives for the velella gene-tree / species-tree toolkit.
//!
//! `velella-core` provides the foundation the domain crates build on:
//!
//! - **Error types** — [`VelellaError`] and [`Result`] for structured error handling
//! - **Traits** — [`Summarizable`] for one-line display summaries
//! - **Extended-range reals** — [`ScaledReal`] and the [`ExtendedReal`]
//!   abstraction for probability chains that underflow `f64`

pub mod error;
pub mod scaled;
pub mod traits;

pub use error::{Result, VelellaError};
pub use scaled::{ExtendedReal, ScaledReal};
pub use traits::Summarizable;
