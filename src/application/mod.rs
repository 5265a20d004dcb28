//! Application services: generation, maintenance commands and the ports they
//! depend on.

pub mod error;
pub mod generator;
pub mod maintenance;
pub mod ports;
pub mod site;
