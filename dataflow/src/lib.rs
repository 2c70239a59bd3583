//! Single-assignment dataflow engine for pipelines of external tools.
//!
//! A pipeline is a typed program of procedures (external apps or compound
//! bodies), statements and expressions. Every variable is assigned exactly
//! once; tasks run as soon as their inputs settle, in parallel, and `foreach`
//! fans work out over arrays with one private scope per element.
//!
//! - **[`core`]**: Pure program model, expression library and build-time
//!   analysis. No I/O.
//! - **[`engine`]**: Variable store, scopes, graph construction, scheduling
//!   and the [`engine::Engine`] run facade.
//! - **[`io`]**: Configuration, pipeline documents, file mapping and external
//!   process invocation.

pub mod core;
pub mod engine;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
