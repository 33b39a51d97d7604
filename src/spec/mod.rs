//! Declarative topology description.
//!
//! Callers describe a fan-out as a [`TopologySpec`] holding an ordered list
//! of [`RouteSpec`]s. Both are validated eagerly on construction and are
//! read-only afterwards; the builder never sees an invalid description.

mod region;
mod route;
mod topology;

pub use region::{Region, UnknownRegion};
pub use route::{
    ConsumerReference, FilterScope, MessageFilter, RouteProps, RouteSpec, DEFAULT_MAX_BATCH_SIZE,
    DEFAULT_VISIBILITY_TIMEOUT,
};
pub use topology::{TopologyProps, TopologySpec, DEFAULT_GATEWAY_PATH};
