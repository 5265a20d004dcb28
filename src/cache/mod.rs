//! Critical-path CSS cache.
//!
//! - **Store**: one CSS artifact per `(viewport, url)` on disk
//! - **Gate**: decides per request whether inlining is worthwhile
//! - **Middleware**: inlines the artifact into HTML responses
//! - **Planner / Trigger / Queue**: turn content changes into background
//!   regeneration
//!
//! ## Configuration
//!
//! ```toml
//! [storage]
//! directory = "critical-css"
//!
//! [marker]
//! cookie_name = "abovefold-css"
//! version = "1.0.0"
//!
//! [viewports.mobile]
//! width = 614
//! height = 736
//! # ... see config.rs for all options
//! ```

mod classifier;
mod config;
mod events;
mod gate;
mod keys;
mod middleware;
mod planner;
mod queue;
mod store;
mod trigger;

pub use classifier::{ClientSignals, ViewportClassifier};
pub use config::{
    ConfigValidationError, DEFAULT_AUTOMATION_USER_AGENTS, DEFAULT_CONTENT_VERSION,
    DEFAULT_COOKIE_NAME, DEFAULT_MARKER_TTL_SECS, GateConfig, RawViewport, ViewportSpec,
    ViewportTable,
};
pub use events::ChangeEvent;
pub use gate::{
    CacheGateKeeper, ClientVersionMarker, GateDecision, GateInputs, RENDER_FETCH_HEADER,
};
pub use keys::{CacheKey, InvalidViewportName, ViewportClass, hash_key, normalize_url, site_url};
pub use middleware::{
    CriticalCssState, InlinePlan, STYLESHEET_LOADER, critical_css_layer, rewrite_document,
};
pub use planner::{PlanError, RegenerationPlan, RegenerationPlanner};
pub use queue::{RegenerationJob, RegenerationQueue};
pub use store::{Artifact, ArtifactStore, StoreError, placeholder, style_block};
pub use trigger::RegenerationTrigger;
