//! Per-instance setup timeout taken from registry metadata

use std::time::Duration;
use tracing::warn;

use crate::registry::Instance;

/// Metadata key holding an instance's timeout in milliseconds
pub const TIMEOUT_METADATA_KEY: &str = "timeout";

/// Effective setup timeout for `instance`, in milliseconds.
///
/// Falls back to `default_ms` when there is no instance, no `timeout` key, a
/// blank value, or a value that does not parse as a positive integer.
/// Malformed and zero values are logged and never fail the request.
pub fn resolve_ms(instance: Option<&Instance>, default_ms: u64) -> u64 {
    let Some(instance) = instance else {
        return default_ms;
    };

    let raw = match instance.metadata.get(TIMEOUT_METADATA_KEY) {
        Some(value) if !value.trim().is_empty() => value,
        _ => return default_ms,
    };

    match raw.trim().parse::<u64>() {
        Ok(0) => {
            warn!(
                instance = %instance.authority(),
                timeout = %raw,
                "Ignoring zero timeout metadata"
            );
            default_ms
        }
        Ok(ms) => ms,
        Err(e) => {
            warn!(
                instance = %instance.authority(),
                timeout = %raw,
                error = %e,
                "Ignoring malformed timeout metadata"
            );
            default_ms
        }
    }
}

pub fn resolve(instance: Option<&Instance>, default: Duration) -> Duration {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(resolve_ms(instance, default_ms))
}
