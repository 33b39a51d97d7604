//! Fanout - declarative SNS/SQS fan-out topologies
//!
//! One ingress publishes to a broadcast topic; any number of filtered
//! routes (queue, dead-letter queue, consumer) receive the subset of
//! messages they match. Describe the routes as a [`spec::TopologySpec`],
//! hand it to a [`builder::TopologyBuilder`] with a
//! [`provisioning::ProvisioningBackend`], and get back handles to the
//! topic and every route's queue.

pub mod builder;
pub mod config;
pub mod envelope;
pub mod ingress;
pub mod naming;
pub mod provisioning;
pub mod spec;
pub mod utils;
pub mod validation;

pub use builder::{BuildError, TopologyBuilder, TopologyHandles};
pub use provisioning::{ProvisionError, ProvisioningBackend};
pub use spec::{RouteProps, RouteSpec, TopologyProps, TopologySpec};
pub use validation::ValidationError;
