//! Input validation for topology descriptions.
//!
//! Everything a caller hands to the builder is checked here, at construction
//! time, before any provisioning call is attempted. Each failure maps to a
//! dedicated [`ValidationError`] variant with a stable upper-snake code so
//! callers can branch on exactly which constraint failed.

use std::time::Duration;

use crate::spec::{MessageFilter, Region};

/// Bounds for validated fields.
pub mod limits {
    use std::time::Duration;

    /// Maximum stage identifier length.
    pub const MAX_STAGE_LENGTH: usize = 32;
    /// Smallest batch a consumer may be invoked with.
    pub const MIN_BATCH_SIZE: u32 = 1;
    /// Largest batch a consumer may be invoked with.
    pub const MAX_BATCH_SIZE: u32 = 10_000;
    /// Longest time a queue may wait to fill a batch (5 minutes).
    pub const MAX_BATCHING_WINDOW: Duration = Duration::from_secs(300);
    /// Longest visibility timeout a queue accepts (12 hours).
    pub const MAX_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(43_200);
}

/// Error constants for validation failures.
pub mod errmsg {
    pub const STAGE_REQUIRED: &str = "stage is required";
    pub const STAGE_INVALID_CHARACTERS: &str =
        "stage contains invalid characters (allowed: A-Z, a-z, 0-9, -)";
    pub const STAGE_TOO_LONG: &str = "stage exceeds maximum length";
    pub const REGION_REQUIRED: &str = "region is required";
    pub const REGION_INVALID: &str = "region is not a known region identifier";
    pub const TOPOLOGY_ID_REQUIRED: &str = "topology id is required";
    pub const TOPOLOGY_ID_INVALID_CHARACTERS: &str =
        "topology id contains invalid characters (allowed: A-Z, a-z, 0-9, -)";
    pub const ROUTE_NAME_REQUIRED: &str = "route name is required";
    pub const ROUTE_NAME_INVALID_CHARACTERS: &str =
        "route name contains invalid characters (allowed: A-Z, a-z, 0-9, -)";
    pub const DUPLICATE_ROUTE_NAME: &str = "route name is used more than once";
    pub const GATEWAY_PATH_INVALID: &str =
        "gateway path must be a single segment of A-Z, a-z, 0-9, -, _";
    pub const FILTER_ATTRIBUTE_REQUIRED: &str = "filter attribute is required";
    pub const FILTER_VALUES_REQUIRED: &str = "filter must allow at least one non-empty value";
    pub const SQS_MAX_BATCH_SIZE_INVALID: &str = "max batch size out of range";
    pub const SQS_MAX_BATCHING_WINDOW_INVALID: &str = "max batching window out of range";
    pub const SQS_VISIBILITY_TIMEOUT_INVALID: &str = "visibility timeout out of range";
}

/// Result type for validation.
pub type Result<T> = std::result::Result<T, ValidationError>;

/// Validation failures, one variant per constraint.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{msg}", msg = errmsg::STAGE_REQUIRED)]
    StageRequired,

    #[error("{msg}: {stage:?}", msg = errmsg::STAGE_INVALID_CHARACTERS)]
    StageInvalidCharacters { stage: String },

    #[error(
        "{msg} (max: {max}, got: {len})",
        msg = errmsg::STAGE_TOO_LONG,
        max = limits::MAX_STAGE_LENGTH
    )]
    StageTooLong { len: usize },

    #[error("{msg}", msg = errmsg::REGION_REQUIRED)]
    RegionRequired,

    #[error("{msg}: {region:?}", msg = errmsg::REGION_INVALID)]
    RegionInvalid { region: String },

    #[error("{msg}", msg = errmsg::TOPOLOGY_ID_REQUIRED)]
    TopologyIdRequired,

    #[error("{msg}: {id:?}", msg = errmsg::TOPOLOGY_ID_INVALID_CHARACTERS)]
    TopologyIdInvalidCharacters { id: String },

    #[error("{msg}", msg = errmsg::ROUTE_NAME_REQUIRED)]
    RouteNameRequired,

    #[error("{msg}: {name:?}", msg = errmsg::ROUTE_NAME_INVALID_CHARACTERS)]
    RouteNameInvalidCharacters { name: String },

    #[error("{msg}: {name:?}", msg = errmsg::DUPLICATE_ROUTE_NAME)]
    DuplicateRouteName { name: String },

    #[error("{msg}: {path:?}", msg = errmsg::GATEWAY_PATH_INVALID)]
    GatewayPathInvalid { path: String },

    #[error("{msg} for route {route:?}", msg = errmsg::FILTER_ATTRIBUTE_REQUIRED)]
    FilterAttributeRequired { route: String },

    #[error(
        "{msg} for route {route:?} (attribute: {attribute:?})",
        msg = errmsg::FILTER_VALUES_REQUIRED
    )]
    FilterValuesRequired { route: String, attribute: String },

    #[error(
        "{msg} for route {route:?} (allowed: {min}..={max}, got: {got})",
        msg = errmsg::SQS_MAX_BATCH_SIZE_INVALID,
        min = limits::MIN_BATCH_SIZE,
        max = limits::MAX_BATCH_SIZE
    )]
    MaxBatchSizeInvalid { route: String, got: u32 },

    #[error(
        "{msg} for route {route:?} (max: {max:?}, got: {got:?})",
        msg = errmsg::SQS_MAX_BATCHING_WINDOW_INVALID,
        max = limits::MAX_BATCHING_WINDOW
    )]
    MaxBatchingWindowInvalid { route: String, got: Duration },

    #[error(
        "{msg} for route {route:?} (max: {max:?}, got: {got:?})",
        msg = errmsg::SQS_VISIBILITY_TIMEOUT_INVALID,
        max = limits::MAX_VISIBILITY_TIMEOUT
    )]
    VisibilityTimeoutInvalid { route: String, got: Duration },
}

impl ValidationError {
    /// Stable machine-readable code for this failure.
    pub fn code(&self) -> &'static str {
        match self {
            Self::StageRequired => "STAGE_REQUIRED",
            Self::StageInvalidCharacters { .. } => "STAGE_INVALID_CHARACTERS",
            Self::StageTooLong { .. } => "STAGE_TOO_LONG",
            Self::RegionRequired => "REGION_REQUIRED",
            Self::RegionInvalid { .. } => "REGION_INVALID",
            Self::TopologyIdRequired => "TOPOLOGY_ID_REQUIRED",
            Self::TopologyIdInvalidCharacters { .. } => "TOPOLOGY_ID_INVALID_CHARACTERS",
            Self::RouteNameRequired => "ROUTE_NAME_REQUIRED",
            Self::RouteNameInvalidCharacters { .. } => "ROUTE_NAME_INVALID_CHARACTERS",
            Self::DuplicateRouteName { .. } => "DUPLICATE_ROUTE_NAME",
            Self::GatewayPathInvalid { .. } => "GATEWAY_PATH_INVALID",
            Self::FilterAttributeRequired { .. } => "FILTER_ATTRIBUTE_REQUIRED",
            Self::FilterValuesRequired { .. } => "FILTER_VALUES_REQUIRED",
            Self::MaxBatchSizeInvalid { .. } => "SQS_MAX_BATCH_SIZE_INVALID",
            Self::MaxBatchingWindowInvalid { .. } => "SQS_MAX_BATCHING_WINDOW_INVALID",
            Self::VisibilityTimeoutInvalid { .. } => "SQS_VISIBILITY_TIMEOUT_INVALID",
        }
    }
}

/// `^[A-Za-z0-9-]+$`, without pulling in a regex engine.
fn is_identifier(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|ch| matches!(ch, 'a'..='z' | 'A'..='Z' | '0'..='9' | '-'))
}

/// Validate a stage identifier.
///
/// Rules, checked in this order:
/// - Must not be empty
/// - May contain: letters (A-Z, a-z), digits (0-9), hyphen (-)
/// - Maximum 32 characters
pub fn validate_stage(stage: &str) -> Result<()> {
    if stage.is_empty() {
        return Err(ValidationError::StageRequired);
    }
    if !is_identifier(stage) {
        return Err(ValidationError::StageInvalidCharacters {
            stage: stage.to_string(),
        });
    }
    if stage.len() > limits::MAX_STAGE_LENGTH {
        return Err(ValidationError::StageTooLong { len: stage.len() });
    }
    Ok(())
}

/// Validate a region identifier against the known region list.
pub fn validate_region(region: &str) -> Result<Region> {
    if region.is_empty() {
        return Err(ValidationError::RegionRequired);
    }
    region
        .parse::<Region>()
        .map_err(|_| ValidationError::RegionInvalid {
            region: region.to_string(),
        })
}

/// Validate the caller-supplied topology id.
pub fn validate_topology_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(ValidationError::TopologyIdRequired);
    }
    if !is_identifier(id) {
        return Err(ValidationError::TopologyIdInvalidCharacters { id: id.to_string() });
    }
    Ok(())
}

/// Validate a route name. Route names end up inside resource names.
pub fn validate_route_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ValidationError::RouteNameRequired);
    }
    if !is_identifier(name) {
        return Err(ValidationError::RouteNameInvalidCharacters {
            name: name.to_string(),
        });
    }
    Ok(())
}

/// Validate the ingress path: one non-empty segment, no slashes.
pub fn validate_gateway_path(path: &str) -> Result<()> {
    let valid = !path.is_empty()
        && path
            .chars()
            .all(|ch| matches!(ch, 'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_'));
    if !valid {
        return Err(ValidationError::GatewayPathInvalid {
            path: path.to_string(),
        });
    }
    Ok(())
}

/// Validate a route's filter. An allowlist needs a named attribute and at
/// least one value; an empty value never matches anything.
pub fn validate_filter(route: &str, filter: &MessageFilter) -> Result<()> {
    let MessageFilter::AttributeAllowlist {
        attribute, values, ..
    } = filter
    else {
        return Ok(());
    };
    if attribute.trim().is_empty() {
        return Err(ValidationError::FilterAttributeRequired {
            route: route.to_string(),
        });
    }
    if values.is_empty() || values.iter().any(|v| v.is_empty()) {
        return Err(ValidationError::FilterValuesRequired {
            route: route.to_string(),
            attribute: attribute.clone(),
        });
    }
    Ok(())
}

/// Validate batch size, batching window and visibility timeout for a route.
///
/// Bounds are inclusive. The lower bound of both durations is zero, which
/// `Duration` cannot go below.
pub fn validate_queue_bounds(
    route: &str,
    max_batch_size: u32,
    max_batching_window: Duration,
    visibility_timeout: Duration,
) -> Result<()> {
    if !(limits::MIN_BATCH_SIZE..=limits::MAX_BATCH_SIZE).contains(&max_batch_size) {
        return Err(ValidationError::MaxBatchSizeInvalid {
            route: route.to_string(),
            got: max_batch_size,
        });
    }
    if max_batching_window > limits::MAX_BATCHING_WINDOW {
        return Err(ValidationError::MaxBatchingWindowInvalid {
            route: route.to_string(),
            got: max_batching_window,
        });
    }
    if visibility_timeout > limits::MAX_VISIBILITY_TIMEOUT {
        return Err(ValidationError::VisibilityTimeoutInvalid {
            route: route.to_string(),
            got: visibility_timeout,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    mod stage_validation {
        use super::*;

        #[test]
        fn test_valid_stages() {
            assert!(validate_stage("dev").is_ok());
            assert!(validate_stage("Prod-2").is_ok());
            assert!(validate_stage("a").is_ok());
            assert!(validate_stage(&"a".repeat(32)).is_ok());
        }

        #[test]
        fn test_empty_stage() {
            assert_eq!(validate_stage(""), Err(ValidationError::StageRequired));
        }

        #[test]
        fn test_stage_invalid_chars() {
            let err = validate_stage("bad stage!").unwrap_err();
            assert_eq!(err.code(), "STAGE_INVALID_CHARACTERS");
            assert!(validate_stage("dev_1").is_err());
            assert!(validate_stage("dév").is_err());
        }

        #[test]
        fn test_stage_too_long() {
            let err = validate_stage(&"a".repeat(33)).unwrap_err();
            assert_eq!(err, ValidationError::StageTooLong { len: 33 });
            assert_eq!(err.code(), "STAGE_TOO_LONG");
            assert!(err.to_string().contains("max: 32"));
        }

        #[test]
        fn test_character_check_precedes_length_check() {
            let err = validate_stage(&"!".repeat(40)).unwrap_err();
            assert_eq!(err.code(), "STAGE_INVALID_CHARACTERS");
        }
    }

    mod region_validation {
        use super::*;

        #[test]
        fn test_known_region() {
            assert_eq!(validate_region("eu-west-3"), Ok(Region::EuWest3));
        }

        #[test]
        fn test_empty_region() {
            assert_eq!(validate_region(""), Err(ValidationError::RegionRequired));
        }

        #[test]
        fn test_unknown_region() {
            let err = validate_region("mars-north-1").unwrap_err();
            assert_eq!(err.code(), "REGION_INVALID");
        }
    }

    mod name_validation {
        use super::*;

        #[test]
        fn test_route_names() {
            assert!(validate_route_name("send-event").is_ok());
            assert_eq!(
                validate_route_name(""),
                Err(ValidationError::RouteNameRequired)
            );
            assert_eq!(
                validate_route_name("send.event").unwrap_err().code(),
                "ROUTE_NAME_INVALID_CHARACTERS"
            );
        }

        #[test]
        fn test_topology_ids() {
            assert!(validate_topology_id("orders").is_ok());
            assert_eq!(
                validate_topology_id(""),
                Err(ValidationError::TopologyIdRequired)
            );
            assert!(validate_topology_id("orders/1").is_err());
        }

        #[test]
        fn test_gateway_paths() {
            assert!(validate_gateway_path("send-event").is_ok());
            assert!(validate_gateway_path("send_event").is_ok());
            assert!(validate_gateway_path("").is_err());
            assert!(validate_gateway_path("a/b").is_err());
        }
    }

    mod filter_validation {
        use super::*;

        #[test]
        fn test_unfiltered_is_valid() {
            assert!(validate_filter("r", &MessageFilter::All).is_ok());
        }

        #[test]
        fn test_single_value_allowlist_is_valid() {
            let attribute = MessageFilter::allowlist("eventType", ["send"]);
            assert!(validate_filter("r", &attribute).is_ok());
            let body = MessageFilter::body_allowlist("kind", ["a", "b"]);
            assert!(validate_filter("r", &body).is_ok());
        }

        #[test]
        fn test_empty_attribute() {
            let err = validate_filter("r", &MessageFilter::allowlist("", ["send"])).unwrap_err();
            assert_eq!(err.code(), "FILTER_ATTRIBUTE_REQUIRED");
            let err = validate_filter("r", &MessageFilter::allowlist("  ", ["send"])).unwrap_err();
            assert_eq!(err.code(), "FILTER_ATTRIBUTE_REQUIRED");
        }

        #[test]
        fn test_empty_values() {
            let none = MessageFilter::allowlist("eventType", Vec::<String>::new());
            let err = validate_filter("r", &none).unwrap_err();
            assert_eq!(
                err,
                ValidationError::FilterValuesRequired {
                    route: "r".to_string(),
                    attribute: "eventType".to_string(),
                }
            );
            let blank = MessageFilter::allowlist("eventType", ["send", ""]);
            let err = validate_filter("r", &blank).unwrap_err();
            assert_eq!(err.code(), "FILTER_VALUES_REQUIRED");
        }
    }

    mod queue_bounds {
        use super::*;

        fn check(size: u32, window: u64, visibility: u64) -> Result<()> {
            validate_queue_bounds(
                "r",
                size,
                Duration::from_secs(window),
                Duration::from_secs(visibility),
            )
        }

        #[test]
        fn test_batch_size_bounds_inclusive() {
            assert!(check(1, 0, 0).is_ok());
            assert!(check(10_000, 0, 0).is_ok());
            assert_eq!(check(0, 0, 0).unwrap_err().code(), "SQS_MAX_BATCH_SIZE_INVALID");
            assert_eq!(
                check(10_001, 0, 0).unwrap_err().code(),
                "SQS_MAX_BATCH_SIZE_INVALID"
            );
        }

        #[test]
        fn test_batching_window_bounds() {
            assert!(check(1, 300, 0).is_ok());
            assert_eq!(
                check(1, 301, 0).unwrap_err().code(),
                "SQS_MAX_BATCHING_WINDOW_INVALID"
            );
        }

        #[test]
        fn test_visibility_timeout_bounds() {
            assert!(check(1, 0, 43_200).is_ok());
            assert_eq!(
                check(1, 0, 43_201).unwrap_err().code(),
                "SQS_VISIBILITY_TIMEOUT_INVALID"
            );
        }

        #[test]
        fn test_sub_second_overshoot_rejected() {
            let result = validate_queue_bounds(
                "r",
                1,
                Duration::from_millis(300_001),
                Duration::ZERO,
            );
            assert!(matches!(
                result,
                Err(ValidationError::MaxBatchingWindowInvalid { .. })
            ));
        }
    }
}
