//! Serialization helpers for configuration values

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

/// Serde adapter that stores a `Duration` as whole milliseconds
///
/// Resilience settings are written by humans as `sleep_window_ms = 2000`, so
/// every duration in [`crate::ResilienceConfig`] goes through this module.
///
/// # Usage
/// ```rust
/// use std::time::Duration;
///
/// use resilia::duration_millis;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Example {
///     #[serde(with = "duration_millis")]
///     wait_timeout_ms: Duration,
/// }
/// ```
pub mod duration_millis {
    use super::{Deserialize, Deserializer, Duration, Serializer};

    type SerializeResult<S> = Result<<S as Serializer>::Ok, <S as Serializer>::Error>;

    /// Serialize a Duration as milliseconds (u64)
    pub fn serialize<S>(duration: &Duration, serializer: S) -> SerializeResult<S>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    /// Deserialize milliseconds (u64) into a Duration
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
