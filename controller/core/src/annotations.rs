//! Decoding of `mesh.caddyserver.com/*` service annotations into a typed
//! [`Policy`].

use crate::duration;
use std::{collections::BTreeMap, time::Duration};

pub const TIMEOUT_DIAL: &str = "mesh.caddyserver.com/timeout-dial-timeout";
pub const TIMEOUT_READ: &str = "mesh.caddyserver.com/timeout-read-timeout";
pub const TIMEOUT_WRITE: &str = "mesh.caddyserver.com/timeout-write-timeout";
pub const RETRY_COUNT: &str = "mesh.caddyserver.com/retry-count";
pub const RETRY_DURATION: &str = "mesh.caddyserver.com/retry-duration";
pub const RETRY_ON: &str = "mesh.caddyserver.com/retry-on";
pub const RATE_LIMIT_KEY: &str = "mesh.caddyserver.com/rate-limit-key";
pub const RATE_LIMIT_RATE: &str = "mesh.caddyserver.com/rate-limit-rate";
pub const RATE_LIMIT_ZONE_SIZE: &str = "mesh.caddyserver.com/rate-limit-zone-size";
pub const TRAFFIC_SPLIT_EXPRESSION: &str = "mesh.caddyserver.com/traffic-split-expression";
pub const TRAFFIC_SPLIT_NEW_SERVICE: &str = "mesh.caddyserver.com/traffic-split-new-service";
pub const TRAFFIC_SPLIT_OLD_SERVICE: &str = "mesh.caddyserver.com/traffic-split-old-service";

/// Per-service proxying policy decoded from annotations.
///
/// `None` uniformly means "not set"; empty string and zero values decode to
/// `None` so that an explicitly-zero annotation compares equal to an absent
/// one.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Policy {
    pub dial_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,

    pub retry_count: Option<u32>,
    pub retry_duration: Option<Duration>,
    pub retry_on: Option<String>,

    pub rate_limit_key: Option<String>,
    pub rate_limit_rate: Option<String>,
    pub rate_limit_zone_size: Option<u64>,

    pub split_expression: Option<String>,
    pub split_new_service: Option<String>,
    pub split_old_service: Option<String>,
}

/// An annotation was present but unparseable.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("annotation {key} is not a valid duration: {source}")]
    InvalidDuration {
        key: &'static str,
        #[source]
        source: duration::ParseError,
    },

    #[error("annotation {key} is not a valid integer: {source}")]
    InvalidInteger {
        key: &'static str,
        #[source]
        source: std::num::ParseIntError,
    },
}

impl Policy {
    /// Decodes the recognized `mesh.caddyserver.com/*` keys from a service's
    /// annotations. Unrecognized keys are ignored; an empty map decodes to
    /// the default policy.
    pub fn decode(annotations: &BTreeMap<String, String>) -> Result<Self, DecodeError> {
        Ok(Self {
            dial_timeout: duration_value(annotations, TIMEOUT_DIAL)?,
            read_timeout: duration_value(annotations, TIMEOUT_READ)?,
            write_timeout: duration_value(annotations, TIMEOUT_WRITE)?,
            retry_count: int_value(annotations, RETRY_COUNT)?,
            retry_duration: duration_value(annotations, RETRY_DURATION)?,
            retry_on: string_value(annotations, RETRY_ON),
            rate_limit_key: string_value(annotations, RATE_LIMIT_KEY),
            rate_limit_rate: string_value(annotations, RATE_LIMIT_RATE),
            rate_limit_zone_size: int_value(annotations, RATE_LIMIT_ZONE_SIZE)?,
            split_expression: string_value(annotations, TRAFFIC_SPLIT_EXPRESSION),
            split_new_service: string_value(annotations, TRAFFIC_SPLIT_NEW_SERVICE),
            split_old_service: string_value(annotations, TRAFFIC_SPLIT_OLD_SERVICE),
        })
    }

    /// The traffic-split definition, if all three annotations are set.
    pub fn split(&self) -> Option<(&str, &str, &str)> {
        match (
            self.split_expression.as_deref(),
            self.split_new_service.as_deref(),
            self.split_old_service.as_deref(),
        ) {
            (Some(expression), Some(new), Some(old)) => Some((expression, new, old)),
            _ => None,
        }
    }

    /// The rate-limit definition, if both the key and the rate are set.
    pub fn rate_limit(&self) -> Option<(&str, &str)> {
        match (self.rate_limit_key.as_deref(), self.rate_limit_rate.as_deref()) {
            (Some(key), Some(rate)) => Some((key, rate)),
            _ => None,
        }
    }

    pub fn has_timeouts(&self) -> bool {
        self.dial_timeout.is_some() || self.read_timeout.is_some() || self.write_timeout.is_some()
    }
}

fn string_value(annotations: &BTreeMap<String, String>, key: &'static str) -> Option<String> {
    annotations
        .get(key)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

fn duration_value(
    annotations: &BTreeMap<String, String>,
    key: &'static str,
) -> Result<Option<Duration>, DecodeError> {
    match annotations.get(key).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(v) => duration::parse(v)
            .map(|d| Some(d).filter(|d| !d.is_zero()))
            .map_err(|source| DecodeError::InvalidDuration { key, source }),
    }
}

fn int_value<T: std::str::FromStr<Err = std::num::ParseIntError> + PartialEq + Default>(
    annotations: &BTreeMap<String, String>,
    key: &'static str,
) -> Result<Option<T>, DecodeError> {
    match annotations.get(key).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(v) => v
            .parse::<T>()
            .map(|n| Some(n).filter(|n| *n != T::default()))
            .map_err(|source| DecodeError::InvalidInteger { key, source }),
    }
}
