//! Device identity
//!
//! Device identifiers are chosen by the devices themselves; the relay only
//! uses them as routing keys inside a couple.

use duet_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Longest accepted couple or device identifier
pub const MAX_ID_LEN: usize = 128;

/// Validate an opaque client-chosen identifier (couple or device)
pub fn validate_id(field: &str, raw: &str) -> Result<String> {
    let id = raw.trim();
    if id.is_empty() {
        return Err(Error::validation(format!("Missing required field: {}", field)));
    }
    if id.len() > MAX_ID_LEN {
        return Err(Error::validation(format!(
            "{} exceeds {} characters",
            field, MAX_ID_LEN
        )));
    }
    if id.chars().any(char::is_control) {
        return Err(Error::validation(format!(
            "{} contains control characters",
            field
        )));
    }
    Ok(id.to_string())
}

/// Identifier of one device of a couple
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Parse a client supplied device identifier
    pub fn parse(s: &str) -> Result<Self> {
        validate_id("deviceId", s).map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata the initiating device attaches to a pairing request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Human-readable device name (e.g., "Maya's iPhone")
    #[serde(default, alias = "displayName")]
    pub name: Option<String>,
    /// Device type/platform hint
    #[serde(default)]
    pub platform: DeviceType,
    /// Browser user agent, if reported
    #[serde(default)]
    pub user_agent: Option<String>,
}

/// Type of device pairing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// iOS device (iPhone, iPad)
    Ios,
    /// Android device
    Android,
    /// Web browser
    Browser,
    /// Unknown/other device
    #[default]
    Unknown,
}

impl std::str::FromStr for DeviceType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.to_lowercase();
        Ok(match s.as_str() {
            "ios" | "iphone" | "ipad" => Self::Ios,
            "android" => Self::Android,
            "browser" | "web" => Self::Browser,
            _ if s.contains("iphone") || s.contains("ipad") => Self::Ios,
            _ if s.contains("android") || s.contains("linux armv") => Self::Android,
            _ if s.starts_with("win") || s.starts_with("mac") || s.starts_with("linux") => {
                Self::Browser
            }
            _ => Self::Unknown,
        })
    }
}

// Clients send free-form `navigator.platform` strings; never reject them.
impl<'de> Deserialize<'de> for DeviceType {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(raw.parse().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_parsing() {
        assert_eq!(DeviceId::parse(" d1 ").unwrap().as_str(), "d1");
        assert!(DeviceId::parse("").is_err());
        assert!(DeviceId::parse(&"x".repeat(MAX_ID_LEN + 1)).is_err());
        assert!(DeviceId::parse("bad\nid").is_err());
    }

    #[test]
    fn test_device_type_parsing() {
        assert_eq!("ios".parse::<DeviceType>().unwrap(), DeviceType::Ios);
        assert_eq!("iPhone".parse::<DeviceType>().unwrap(), DeviceType::Ios);
        assert_eq!(
            "android".parse::<DeviceType>().unwrap(),
            DeviceType::Android
        );
        assert_eq!("Win32".parse::<DeviceType>().unwrap(), DeviceType::Browser);
        assert_eq!(
            "toaster".parse::<DeviceType>().unwrap(),
            DeviceType::Unknown
        );
    }

    #[test]
    fn test_device_info_from_client_json() {
        let info: DeviceInfo = serde_json::from_str(
            r#"{"displayName":"Maya's phone","platform":"iPhone","userAgent":"Mozilla/5.0"}"#,
        )
        .unwrap();
        assert_eq!(info.name.as_deref(), Some("Maya's phone"));
        assert_eq!(info.platform, DeviceType::Ios);

        let empty: DeviceInfo = serde_json::from_str("{}").unwrap();
        assert_eq!(empty, DeviceInfo::default());
    }
}
