//! Critical-path CSS cache: per-viewport CSS artifacts generated out of band
//! and inlined into HTML responses.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
