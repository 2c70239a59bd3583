//! Filesystem and process side effects: configuration, pipeline documents,
//! file mapping and external process invocation.

pub mod config;
pub mod invoker;
pub mod mapper;
pub mod pipeline;
pub mod process;
