//! `quince-core` is the nonlinear relaxation engine of the Quince mixed-integer nonlinear
//! solver: a reference-counted DAG of nonlinear expressions with forward/reverse interval
//! (activity) propagation, an open registry of pluggable nonlinear handlers, cut separation with
//! a weak/strong-cut policy, and branching support for a surrounding branch-and-cut loop.
//!
//! The main entry point is the [`Relaxation`] facade: create variables, build expressions in its
//! [`expr::ExpressionGraph`], register constraints over them, and then alternate
//! [`Relaxation::propagate`], [`Relaxation::separate`] (or [`Relaxation::enforce`]), and
//! [`Relaxation::select_branching`] from the consumer's search loop. The engine never solves the
//! linear relaxation itself; the consumer hands LP points in as [`Solution`]s.

pub(crate) mod quince_asserts;

pub mod basic_types;
pub mod branching;
pub mod containers;
pub mod enforce;
pub mod expr;
pub mod handlers;
pub mod options;
pub mod propagation;
pub mod statistics;
pub mod variables;

pub use convert_case;
pub use rand;

// We declare a private module with public use, so that all exports from the API are exports
// directly from the crate.
//
// Example:
// `use quince_core::Relaxation;`
// vs.
// `use quince_core::api::Relaxation;`
mod api;

pub use api::*;

pub use crate::basic_types::Interval;
pub use crate::basic_types::Random;
pub use crate::basic_types::Solution;
pub use crate::variables::VarId;
