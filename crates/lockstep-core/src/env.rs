//! Environment variable utilities
//!
//! Generic `env_get<T>` for parsing environment variables with defaults.
//!
//! ```ignore
//! use lockstep_core::env::{env_get, env_get_bool};
//!
//! let workers: usize = env_get("LKS_NUM_WORKERS", 4);
//! let debug: bool = env_get_bool("LKS_DEBUG", false);
//! ```

use std::str::FromStr;

/// Get environment variable parsed as type T, or return default.
///
/// Works with any type that implements `FromStr`.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Get environment variable as boolean.
///
/// Accepts: "1", "true", "yes", "on" (case-insensitive) as true.
/// Everything else (including unset) returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Get environment variable as optional value.
///
/// Returns `Some(T)` if the variable is set and parses successfully.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
