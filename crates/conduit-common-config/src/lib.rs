//! Configuration primitives for Conduit.
//!
//! Configuration is resolved from an [`EnvSource`]: the process environment
//! (seeded from `.env` files) in deployments, or an in-memory [`MapEnv`] in
//! tests. [`Environment`] adds typed getters and [`RunMode`] decides how
//! strictly missing values are treated.

pub mod env;
pub mod mode;

pub use env::*;
pub use mode::*;
