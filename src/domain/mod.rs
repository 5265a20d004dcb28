//! Site content as seen by the regeneration planner.

pub mod entities;
pub mod types;
