//!
//! # minigrad
//!
//! ## Core API
//!
//! Reverse-mode automatic differentiation over scalar computation graphs.
//!
//! The engine lives in [`lib_minigrad_core`]: the [`Variable`] capability
//! contract, [`topological_sort`], [`backpropagate`], and the
//! [`central_difference`] test oracle. The default `scalar` feature pulls in
//! the f64 [`scalar::Scalar`] node type and the numeric primitives.
//!

pub use lib_minigrad_core::*;

#[cfg(feature = "scalar")]
pub use lib_minigrad_scalar as scalar;
