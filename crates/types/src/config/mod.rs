//! Configuration types for the entry store.
//!
//! Configuration is supplied by the administrative collaborator at backend
//! startup, either built in code or loaded from TOML. All config structs
//! validate their values at construction time via fallible builders.
//! Post-deserialization validation is available via the `validate()` method
//! on each struct.

// The schemars `JsonSchema` derive macro internally uses `.unwrap()` in its
// expansions.
#![allow(clippy::disallowed_methods)]

mod backend;
mod index;
mod substrate;

use std::path::PathBuf;

pub use backend::*;
pub use index::*;
use snafu::Snafu;
pub use substrate::*;

/// Configuration validation error.
///
/// Returned when a configuration value is outside its valid range or
/// violates a cross-field constraint, or when a configuration file cannot
/// be read or parsed.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    /// A configuration value is invalid.
    #[snafu(display("invalid config: {message}"))]
    Validation {
        /// Description of the validation failure.
        message: String,
    },

    /// The TOML document could not be parsed.
    #[snafu(display("config parse error: {source}"))]
    Parse {
        /// The underlying TOML error.
        source: toml::de::Error,
    },

    /// The configuration file could not be read.
    #[snafu(display("cannot read config file {}: {source}", path.display()))]
    Read {
        /// The file that failed.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },
}

pub(crate) fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Validation { message: message.into() }
}

/// Duration serialization using humantime format.
mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }

    /// Optional durations; absent or `None` means "no limit".
    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => serializer.serialize_some(&humantime::format_duration(*d).to_string()),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let s = Option::<String>::deserialize(deserializer)?;
            s.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom)).transpose()
        }
    }
}
