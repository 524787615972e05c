//! Connection settings.
//!
//! Timeouts are given in milliseconds when loaded from JSON:
//!
//! ```
//! use std::time::Duration;
//! use wirelink::ConnectionSettings;
//!
//! let settings = ConnectionSettings::from_json(r#"{ "read_timeout_ms": 1500 }"#).unwrap();
//! assert_eq!(settings.read_timeout, Some(Duration::from_millis(1500)));
//! assert_eq!(settings.connect_timeout, Duration::from_secs(10));
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Time allowed for the stream factory to produce a stream.
    #[serde(rename = "connect_timeout_ms", with = "millis")]
    pub connect_timeout: Duration,
    /// Time allowed to read one full reply. `None` waits forever.
    #[serde(rename = "read_timeout_ms", with = "optional_millis")]
    pub read_timeout: Option<Duration>,
    /// Time allowed to write one request. `None` waits forever.
    #[serde(rename = "write_timeout_ms", with = "optional_millis")]
    pub write_timeout: Option<Duration>,
    /// Check that outbound bytes tile into whole messages ending with the
    /// declared request id before writing them.
    pub validate_outbound: bool,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: None,
            write_timeout: None,
            validate_outbound: true,
        }
    }
}

impl ConnectionSettings {
    /// Parse settings from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Set the connect timeout.
    ///
    /// Default: 10 seconds
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the read timeout.
    ///
    /// Default: none
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Set the write timeout.
    ///
    /// Default: none
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    /// Enable or disable outbound message validation.
    ///
    /// Default: enabled
    pub fn validate_outbound(mut self, validate: bool) -> Self {
        self.validate_outbound = validate;
        self
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod optional_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}
