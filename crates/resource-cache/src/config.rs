use std::fs;
use std::io::{self, Read};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::expiry::ExpiresSelector;

/// An error constructing a [`ResourceCache`](crate::ResourceCache).
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The cache was built outside of a tokio runtime, and no runtime handle was given.
    #[error("no tokio runtime available to drive the cache")]
    NoRuntime,
    /// Neither an expiry function nor a field selector was configured.
    #[error("no expiration configured for the resource")]
    MissingExpiry,
    /// A duration does not fit into the clock's range of milliseconds.
    #[error("`{name}` of {duration:?} is out of range")]
    DurationOutOfRange {
        /// The name of the offending option.
        name: &'static str,
        /// The configured duration.
        duration: Duration,
    },
    /// The configuration file could not be read.
    #[error("failed to read configuration file")]
    Io(#[from] io::Error),
    /// The configuration file is empty.
    #[error("configuration file is empty")]
    Empty,
    /// The configuration file is not valid YAML, or holds invalid values.
    #[error("failed to parse configuration YAML")]
    Parse(#[from] serde_yaml::Error),
}

/// Configuration of a [`ResourceCache`](crate::ResourceCache).
///
/// All durations are human readable (`500ms`, `5m`, `1h 30m`) and default to zero, which
/// disables the respective feature.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    /// The name of the cache, used in logs and metrics.
    pub name: String,

    /// Safety margin subtracted from the resource's expiration.
    ///
    /// The cached value is considered stale `buffer` before it actually expires.
    #[serde(with = "humantime_serde")]
    pub buffer: Duration,

    /// How long before the (buffered) expiration to start refreshing in the background.
    #[serde(with = "humantime_serde")]
    pub prefetch: Duration,

    /// How long to wait before another background refresh after one failed.
    #[serde(with = "humantime_serde")]
    pub retry: Duration,

    /// Where to find the expiration in the fetched resource.
    ///
    /// Defaults to the `expires` field.
    pub expires: Option<ExpiresSelector>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: "resource".to_owned(),
            buffer: Duration::ZERO,
            prefetch: Duration::ZERO,
            retry: Duration::ZERO,
            expires: None,
        }
    }
}

impl CacheConfig {
    /// Loads the configuration from a YAML file, or returns the default configuration.
    pub fn get(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_reader(fs::File::open(path)?),
            None => Ok(Self::default()),
        }
    }

    /// Parses the configuration from YAML.
    pub fn from_reader(mut reader: impl Read) -> Result<Self, ConfigError> {
        let mut config = String::new();
        reader.read_to_string(&mut config)?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            return Err(ConfigError::Empty);
        }
        Ok(serde_yaml::from_str(&config)?)
    }
}

/// Converts `duration` into the clock's unit, milliseconds.
pub(crate) fn to_clock_units(name: &'static str, duration: Duration) -> Result<i64, ConfigError> {
    i64::try_from(duration.as_millis())
        .map_err(|_| ConfigError::DurationOutOfRange { name, duration })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::get(None).unwrap();
        assert_eq!(config, CacheConfig::default());
        assert_eq!(config.name, "resource");
        assert_eq!(config.prefetch, Duration::ZERO);
    }

    #[test]
    fn test_parse_config() {
        let yaml = r#"
            name: oauth-token
            buffer: 100ms
            prefetch: 5m
            retry: 30s
            expires: notAfter
        "#;
        let config = CacheConfig::from_reader(yaml.as_bytes()).unwrap();

        assert_eq!(
            config,
            CacheConfig {
                name: "oauth-token".into(),
                buffer: Duration::from_millis(100),
                prefetch: Duration::from_secs(300),
                retry: Duration::from_secs(30),
                expires: Some(ExpiresSelector::Field("notAfter".into())),
            }
        );
    }

    #[test]
    fn test_partial_config() {
        let config = CacheConfig::from_reader("retry: 1h 30m".as_bytes()).unwrap();
        assert_eq!(config.retry, Duration::from_secs(5400));
        assert_eq!(config.buffer, Duration::ZERO);
        assert_eq!(config.expires, None);
    }

    #[test]
    fn test_invalid_config() {
        let err = CacheConfig::from_reader("expires: 3".as_bytes()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));

        let err = CacheConfig::from_reader("prefetch: soon".as_bytes()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));

        let err = CacheConfig::from_reader("  \n".as_bytes()).unwrap_err();
        assert!(matches!(err, ConfigError::Empty));
    }

    #[test]
    fn test_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "buffer: 2s").unwrap();

        let config = CacheConfig::get(Some(file.path())).unwrap();
        assert_eq!(config.buffer, Duration::from_secs(2));

        let err = CacheConfig::get(Some(Path::new("/does/not/exist.yml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_clock_units() {
        assert_eq!(to_clock_units("buffer", Duration::from_secs(2)).unwrap(), 2000);

        let err = to_clock_units("retry", Duration::MAX).unwrap_err();
        insta::assert_snapshot!(
            err.to_string(),
            @"`retry` of 18446744073709551615.999999999s is out of range"
        );
    }
}
