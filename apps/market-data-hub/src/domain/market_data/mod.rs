//! Market Data Types
//!
//! Ticks and security identifiers. A tick is one observed market event for
//! one security; it is appended to the durable store, mirrored into the
//! cache as the latest value, and broadcast on the security's channel.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Prefix of the pub/sub channel carrying a security's ticks.
pub const CHANNEL_PREFIX: &str = "market:";

// =============================================================================
// Security Identifier
// =============================================================================

/// Identifier of a listed security (e.g. `CRDB`, `NMB`, `TBL`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecurityId(String);

impl SecurityId {
    /// Create a security identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The pub/sub channel name for this security.
    #[must_use]
    pub fn channel(&self) -> String {
        format!("{CHANNEL_PREFIX}{}", self.0)
    }

    /// Parse a channel name back into a security identifier.
    ///
    /// Returns `None` if the channel does not carry market data.
    #[must_use]
    pub fn from_channel(channel: &str) -> Option<Self> {
        channel
            .strip_prefix(CHANNEL_PREFIX)
            .filter(|id| !id.is_empty())
            .map(Self::new)
    }
}

impl fmt::Display for SecurityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SecurityId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SecurityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// =============================================================================
// Tick
// =============================================================================

/// A recorded market event for one security.
///
/// Immutable once created. The timestamp is assigned by the data access
/// layer when the tick is recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tick {
    /// Security the tick belongs to.
    pub security_id: SecurityId,
    /// When the tick was recorded.
    pub timestamp: DateTime<Utc>,
    /// Last traded price.
    pub price: Decimal,
    /// Traded volume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<i64>,
    /// Session high.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high: Option<Decimal>,
    /// Session low.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low: Option<Decimal>,
    /// Session open.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open: Option<Decimal>,
    /// Previous close.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close: Option<Decimal>,
}

impl Tick {
    /// Serialize for the transport and the cache.
    ///
    /// # Errors
    ///
    /// Returns the underlying `serde_json` error.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize a transport or cache payload.
    ///
    /// # Errors
    ///
    /// Returns the underlying `serde_json` error for malformed payloads.
    pub fn from_json(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}

/// An incoming tick before it has been timestamped and recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTick {
    /// Security the tick belongs to.
    pub security_id: SecurityId,
    /// Last traded price.
    pub price: Decimal,
    /// Traded volume.
    #[serde(default)]
    pub volume: Option<i64>,
    /// Session high.
    #[serde(default)]
    pub high: Option<Decimal>,
    /// Session low.
    #[serde(default)]
    pub low: Option<Decimal>,
    /// Session open.
    #[serde(default)]
    pub open: Option<Decimal>,
    /// Previous close.
    #[serde(default)]
    pub close: Option<Decimal>,
}

impl NewTick {
    /// A price/volume tick without OHLC fields.
    #[must_use]
    pub fn new(security_id: impl Into<SecurityId>, price: Decimal, volume: Option<i64>) -> Self {
        Self {
            security_id: security_id.into(),
            price,
            volume,
            high: None,
            low: None,
            open: None,
            close: None,
        }
    }

    /// Stamp the tick with the time it was recorded.
    #[must_use]
    pub fn at(self, timestamp: DateTime<Utc>) -> Tick {
        Tick {
            security_id: self.security_id,
            timestamp,
            price: self.price,
            volume: self.volume,
            high: self.high,
            low: self.low,
            open: self.open,
            close: self.close,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_name_round_trips() {
        let id = SecurityId::new("CRDB");
        assert_eq!(id.channel(), "market:CRDB");
        assert_eq!(SecurityId::from_channel("market:CRDB"), Some(id));
    }

    #[test]
    fn foreign_channels_are_rejected() {
        assert_eq!(SecurityId::from_channel("orders:CRDB"), None);
        assert_eq!(SecurityId::from_channel("market:"), None);
    }

    #[test]
    fn tick_payload_uses_camel_case() {
        let tick = NewTick::new("NMB", Decimal::new(3910, 0), Some(200)).at(Utc::now());
        let json = tick.to_json().unwrap();

        assert!(json.contains("\"securityId\":\"NMB\""));
        assert!(json.contains("\"volume\":200"));
        assert!(!json.contains("high"));
    }

    #[test]
    fn payload_without_optional_fields_parses() {
        let tick = Tick::from_json(
            r#"{"securityId":"TBL","timestamp":"2026-01-05T07:30:00Z","price":"10900"}"#,
        )
        .unwrap();

        assert_eq!(tick.security_id.as_str(), "TBL");
        assert_eq!(tick.price, Decimal::new(10900, 0));
        assert!(tick.volume.is_none());
    }

    #[test]
    fn malformed_payload_is_an_error() {
        assert!(Tick::from_json("{\"securityId\":42}").is_err());
        assert!(Tick::from_json("not json").is_err());
    }
}
