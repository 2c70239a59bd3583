//! Pure program model and build-time checks. Nothing in `core` performs I/O.

pub mod analysis;
pub mod expr;
pub mod graph;
pub mod program;
pub mod resource;
pub mod value;
