//! Domain types shared across the viewer.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ── Station data ──────────────────────────────────────────────────────

/// Identifier of a weather station as used by the API.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StationId(pub String);

impl StationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Catalog entry returned by GET /api/v1/stations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationSummary {
    pub id: StationId,
    pub name: String,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub online: bool,
}

/// Latest readings shown on the live widget.
///
/// Any sensor may be absent; `None` means the station did not report it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WidgetData {
    pub station_id: StationId,
    pub observed_at: DateTime<Utc>,
    #[serde(default)]
    pub temperature_c: Option<f64>,
    #[serde(default)]
    pub humidity_pct: Option<f64>,
    #[serde(default)]
    pub pressure_hpa: Option<f64>,
    #[serde(default)]
    pub wind_speed_ms: Option<f64>,
    #[serde(default)]
    pub rain_mm: Option<f64>,
}

impl WidgetData {
    /// True if at least one sensor produced a value.
    pub fn has_readings(&self) -> bool {
        self.temperature_c.is_some()
            || self.humidity_pct.is_some()
            || self.pressure_hpa.is_some()
            || self.wind_speed_ms.is_some()
            || self.rain_mm.is_some()
    }
}

/// One sample of a historical series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalPoint {
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub temperature_c: Option<f64>,
    #[serde(default)]
    pub humidity_pct: Option<f64>,
    #[serde(default)]
    pub pressure_hpa: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalSeries {
    pub station_id: StationId,
    #[serde(default)]
    pub points: Vec<HistoricalPoint>,
}

/// Inclusive day range for historical queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateRange {
    pub fn new(from: NaiveDate, to: NaiveDate) -> Self {
        Self { from, to }
    }

    pub fn is_valid(&self) -> bool {
        self.from <= self.to
    }
}

// ── Auth ──────────────────────────────────────────────────────────────

/// The signed-in user as reported by the auth endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// Token payload returned by login, exchange and refresh.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Lifetime of the access token in seconds.
    pub expires_in: u64,
    #[serde(default)]
    pub user: Option<UserIdentity>,
}

impl fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenGrant")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_in", &self.expires_in)
            .field("user", &self.user)
            .finish()
    }
}

/// Ways to obtain a session.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "grant_type", rename_all = "snake_case")]
pub enum LoginRequest {
    Password { username: String, password: String },
    /// Exchange of an identity-provider token (e.g. Google sign-in).
    IdentityProvider { provider: String, id_token: String },
}

impl fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoginRequest::Password { username, .. } => f
                .debug_struct("Password")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            LoginRequest::IdentityProvider { provider, .. } => f
                .debug_struct("IdentityProvider")
                .field("provider", provider)
                .field("id_token", &"<redacted>")
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_widget_deserializes_with_missing_sensors() {
        let raw = r#"{
            "station_id": "StationA",
            "observed_at": "2024-01-01T12:00:00Z",
            "temperature_c": 21.4
        }"#;
        let data: WidgetData = serde_json::from_str(raw).expect("widget should deserialize");
        assert_eq!(data.station_id, StationId::new("StationA"));
        assert_eq!(data.temperature_c, Some(21.4));
        assert!(data.humidity_pct.is_none());
        assert!(data.has_readings());
    }

    #[test]
    fn test_login_request_is_tagged() {
        let req = LoginRequest::Password {
            username: "ana".into(),
            password: "hunter2".into(),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["grant_type"], "password");
        assert_eq!(json["username"], "ana");
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let grant = TokenGrant {
            access_token: "secret-access".into(),
            refresh_token: Some("secret-refresh".into()),
            expires_in: 3600,
            user: None,
        };
        let rendered = format!("{grant:?}");
        assert!(!rendered.contains("secret-access"));
        assert!(!rendered.contains("secret-refresh"));

        let req = LoginRequest::Password {
            username: "ana".into(),
            password: "hunter2".into(),
        };
        assert!(!format!("{req:?}").contains("hunter2"));
    }

    #[test]
    fn test_date_range_validity() {
        let from = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let to = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        assert!(DateRange::new(from, to).is_valid());
        assert!(!DateRange::new(to, from).is_valid());
    }
}
