//! Logical device identity

use std::fmt;

use serde::{Deserialize, Serialize};

/// Adapter identity as reported by device discovery
///
/// Opaque string (a PnP instance path, an interface name, or a
/// liveness-poll label such as `USBBUS3`). Blank ids are treated as
/// "no device selected" by the session manager.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogicalDeviceId(String);

impl LogicalDeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for LogicalDeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LogicalDeviceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for LogicalDeviceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for LogicalDeviceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
