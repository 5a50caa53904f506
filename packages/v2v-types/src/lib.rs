//! # v2v-types
//!
//! Shared wire model for the V2V collision-risk service.
//!
//! These types are used by:
//! - `backend-rust`: parsing inbound telemetry frames and emitting threat
//!   notifications and acknowledgments
//! - native clients and load generators speaking the same JSON protocol
//!
//! ## Conventions
//!
//! - Positions are WGS-84 decimal degrees.
//! - Headings are compass bearings: 0° = north, 90° = east, clockwise,
//!   degrees, normalized to [0, 360).
//! - Speeds are ground speed in m/s, clamped non-negative.
//! - The local tangent frame is 2D ENU (east, north) meters; see
//!   [`geo`] for the kernel that owns the axis convention.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub mod geo;

use geo::{normalize_heading, velocity_en, LatLon, Vec2};

// ── Inbound telemetry ─────────────────────────────────────────────────────────

/// One 3-axis sensor reading (accelerometer m/s², gyroscope rate).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Axes3 {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub z: f64,
}

/// The canonical unit of input: one telemetry frame from a vehicle.
///
/// Field names match the wire protocol exactly. `server_timestamp_ms` is
/// stamped by the ingesting server before the sample is persisted, so a
/// stored sample always carries a staleness reference even when the
/// client sent no usable `timestamp`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySample {
    pub user_id: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub speed: f64,
    #[serde(default)]
    pub heading: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accel: Option<Axes3>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gyro: Option<Axes3>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub horizontal_accuracy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_timestamp_ms: Option<i64>,
}

/// Why an inbound frame was rejected. The display strings are the wire
/// `reason` values of the error acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvalidSample {
    #[error("missing userId")]
    MissingUserId,
    #[error("invalid coordinates")]
    InvalidCoordinates,
}

fn finite_f64(v: &Value, key: &str) -> Option<f64> {
    v.get(key).and_then(Value::as_f64).filter(|x| x.is_finite())
}

fn axes(v: &Value, key: &str) -> Option<Axes3> {
    let obj = v.get(key)?;
    if !obj.is_object() {
        return None;
    }
    let pick = |k: &str| obj.get(k).and_then(Value::as_f64).unwrap_or(0.0);
    Some(Axes3 {
        x: pick("x"),
        y: pick("y"),
        z: pick("z"),
    })
}

impl TelemetrySample {
    /// Extract a sample from an already-parsed JSON frame, applying the
    /// protocol's coercion rules: non-finite speed collapses to 0, speed
    /// is clamped non-negative, heading is wrapped to [0, 360).
    /// Coordinates and the vehicle id are the only hard requirements.
    pub fn from_message(v: &Value) -> Result<Self, InvalidSample> {
        let user_id = v
            .get("userId")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(InvalidSample::MissingUserId)?
            .to_string();

        let latitude = finite_f64(v, "latitude").ok_or(InvalidSample::InvalidCoordinates)?;
        let longitude = finite_f64(v, "longitude").ok_or(InvalidSample::InvalidCoordinates)?;
        if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
            return Err(InvalidSample::InvalidCoordinates);
        }

        let speed = finite_f64(v, "speed").unwrap_or(0.0).max(0.0);
        let heading = normalize_heading(v.get("heading").and_then(Value::as_f64).unwrap_or(0.0));

        Ok(Self {
            user_id,
            latitude,
            longitude,
            speed,
            heading,
            accel: axes(v, "accel"),
            gyro: axes(v, "gyro"),
            horizontal_accuracy: finite_f64(v, "horizontalAccuracy"),
            timestamp: v.get("timestamp").cloned().filter(|t| !t.is_null()),
            server_timestamp_ms: None,
        })
    }

    pub fn position(&self) -> LatLon {
        LatLon::new(self.latitude, self.longitude)
    }

    /// Client wall time in epoch milliseconds, if the `timestamp` field
    /// is usable. Numbers below 1e11 are taken as epoch seconds; strings
    /// are tried as RFC 3339, then as a bare number.
    pub fn client_timestamp_ms(&self) -> Option<i64> {
        match self.timestamp.as_ref()? {
            Value::Number(n) => n.as_f64().and_then(epoch_to_ms),
            Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.timestamp_millis())
                .ok()
                .or_else(|| s.trim().parse::<f64>().ok().and_then(epoch_to_ms)),
            _ => None,
        }
    }

    /// The staleness reference: client wall time when parseable, the
    /// server receive stamp otherwise.
    pub fn effective_timestamp_ms(&self, fallback_ms: i64) -> i64 {
        self.client_timestamp_ms()
            .or(self.server_timestamp_ms)
            .unwrap_or(fallback_ms)
    }
}

fn epoch_to_ms(x: f64) -> Option<i64> {
    if !x.is_finite() || x <= 0.0 {
        return None;
    }
    if x < 1e11 {
        Some((x * 1000.0) as i64)
    } else {
        Some(x as i64)
    }
}

// ── Derived kinematic state ───────────────────────────────────────────────────

/// Per-vehicle state after normalization, the input to every predictor.
#[derive(Debug, Clone)]
pub struct VehicleState {
    pub position: LatLon,
    /// Compass bearing in [0, 360).
    pub heading_deg: f64,
    /// Ground speed, ≥ 0 m/s.
    pub speed_mps: f64,
    /// (east, north) velocity components, m/s.
    pub velocity: Vec2,
    /// Yaw rate in degrees per second, sign per the client's gyro.
    pub yaw_rate_deg_s: f64,
    /// Magnitude of reported linear acceleration, m/s².
    pub linear_accel_mag: f64,
}

impl VehicleState {
    pub fn derive(sample: &TelemetrySample) -> Self {
        let heading_deg = normalize_heading(sample.heading);
        let speed_mps = if sample.speed.is_finite() {
            sample.speed.max(0.0)
        } else {
            0.0
        };

        // Gyro z is yaw. Small magnitudes are radians/s from the raw
        // sensor; anything ≥ 0.5 is already degrees/s.
        let yaw_rate_deg_s = match sample.gyro {
            Some(g) if g.z.is_finite() => {
                if g.z.abs() < 0.5 {
                    g.z.to_degrees()
                } else {
                    g.z
                }
            }
            _ => 0.0,
        };

        let linear_accel_mag = match sample.accel {
            Some(a) => {
                let m = (a.x * a.x + a.y * a.y + a.z * a.z).sqrt();
                if m.is_finite() {
                    m
                } else {
                    0.0
                }
            }
            None => 0.0,
        };

        Self {
            position: sample.position(),
            heading_deg,
            speed_mps,
            velocity: velocity_en(speed_mps, heading_deg),
            yaw_rate_deg_s,
            linear_accel_mag,
        }
    }
}

// ── Threat notifications ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatKind {
    PredictedCollision,
    RearEnd,
    WrongDirection,
    IntersectionCollision,
    Overtake,
}

/// The counterpart vehicle as embedded in a threat payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceVehicle {
    pub user_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub speed: f64,
    pub heading: f64,
}

impl From<&TelemetrySample> for SourceVehicle {
    fn from(s: &TelemetrySample) -> Self {
        Self {
            user_id: s.user_id.clone(),
            latitude: s.latitude,
            longitude: s.longitude,
            speed: s.speed,
            heading: s.heading,
        }
    }
}

/// A threat as one recipient sees it: `id`/`lat`/`lng`/`source_vehicle`
/// all describe the *other* vehicle. Which numeric fields are present is
/// determined by `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Threat {
    #[serde(rename = "type")]
    pub kind: ThreatKind,
    pub id: String,
    pub lat: f64,
    pub lng: f64,
    #[serde(rename = "sourceVehicle")]
    pub source_vehicle: SourceVehicle,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub future_distance_m: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_s: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_m: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deceleration: Option<f64>,
    #[serde(rename = "timeToCPA_s", skip_serializing_if = "Option::is_none")]
    pub time_to_cpa_s: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lateral_m: Option<f64>,
    pub message: String,
}

// ── Server → client frames ────────────────────────────────────────────────────

/// Everything the server writes to a channel, tagged by `status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Acknowledgment after a processed telemetry frame.
    Received {
        /// ISO-8601 server time.
        timestamp: String,
        threats: Vec<Threat>,
    },
    /// Validation or infrastructure rejection.
    Error { reason: String },
    /// Push notification to a counterpart vehicle.
    Threat { data: Threat },
}

// ── Tests ─────────────────────────────────────────────────────────────────────
