//! Infrastructure adapters and runtime bootstrap.

pub mod error;
pub mod extractor;
pub mod fetch;
pub mod http;
pub mod sitemap;
pub mod telemetry;
