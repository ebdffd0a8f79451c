//! Configuration loading for Weft components.
//!
//! Components declare plain-old-data config structs with serde derives and
//! a [`Validatable`](crate::traits::Validatable) impl; this module supplies
//! the machinery to populate them from JSON files and environment
//! variables without any global state.

use crate::{traits::Validatable, WeftError, WeftResult};
use serde::de::DeserializeOwned;
use std::path::Path;
use tracing::debug;

/// Load a config struct from a JSON file and validate it.
pub fn from_json_file<T, P>(path: P) -> WeftResult<T>
where
    T: DeserializeOwned + Validatable,
    P: AsRef<Path>,
{
    debug!(path = %path.as_ref().display(), "loading config file");
    let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
        WeftError::config(format!(
            "cannot read config file {}: {e}",
            path.as_ref().display()
        ))
    })?;
    from_json_str(&raw)
}

/// Parse a config struct from a JSON string and validate it.
pub fn from_json_str<T>(raw: &str) -> WeftResult<T>
where
    T: DeserializeOwned + Validatable,
{
    let config: T =
        serde_json::from_str(raw).map_err(|e| WeftError::config(format!("invalid config: {e}")))?;
    config.validate()?;
    Ok(config)
}

/// Read an environment variable override, parsed to the target type.
///
/// Returns `Ok(None)` when the variable is unset; an unparseable value is a
/// configuration error rather than a silent fallback.
pub fn env_override<T>(var: &str) -> WeftResult<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(var) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| WeftError::config(format!("invalid value for {var}: {e}"))),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(WeftError::config(format!("cannot read {var}: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct DemoConfig {
        interval_ms: u64,
        peers: Vec<String>,
    }

    impl Validatable for DemoConfig {
        fn validate(&self) -> WeftResult<()> {
            if self.interval_ms == 0 {
                return Err(WeftError::config("interval_ms must be positive"));
            }
            Ok(())
        }
    }

    #[test]
    fn test_from_json_str() {
        let config: DemoConfig =
            from_json_str(r#"{"interval_ms": 1000, "peers": ["n1", "n2"]}"#).unwrap();
        assert_eq!(config.interval_ms, 1000);
        assert_eq!(config.peers.len(), 2);
    }

    #[test]
    fn test_validation_rejects_bad_config() {
        let result: WeftResult<DemoConfig> =
            from_json_str(r#"{"interval_ms": 0, "peers": []}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_env_override_absent() {
        let missing: Option<u64> = env_override("WEFT_TEST_UNSET_VARIABLE").unwrap();
        assert!(missing.is_none());
    }
}
