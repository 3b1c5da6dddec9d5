//! Internal tests module
//!
//! End-to-end convergence scenarios over the simulated cluster, with access to crate
//! internals.
