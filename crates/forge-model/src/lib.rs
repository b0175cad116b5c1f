//! Shared data model for batch prediction processing.
//!
//! Holds the plain types exchanged between the batch engine, the unit runners and the
//! evaluate binary. Nothing here performs I/O or spawns work.

mod domain;
pub use domain::*;
