//! geo.rs — Geometry kernel
//!
//! All distance math the risk engine needs: great-circle distance,
//! spherical forward projection, a short-range ENU linearization, and the
//! closest-point-of-approach solver.
//!
//! Headings everywhere are compass bearings: 0° = north, 90° = east,
//! clockwise, in degrees. `velocity_en` decomposes a bearing into
//! `(east, north)` meters-per-second components; every caller of this
//! kernel shares that axis convention.
//!
//! The ENU linearization is equirectangular and only valid at short range
//! (hundreds of meters around the reference point). That is exactly the
//! regime the predictors operate in — neighbor queries are bounded well
//! under a kilometer.

use serde::{Deserialize, Serialize};

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Meters per degree of latitude (and of longitude at the equator).
pub const METERS_PER_DEG: f64 = 111_320.0;

// ── Primitive types ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

impl LatLon {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// 2D vector in the local tangent frame, meters (east, north).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vec2 {
    pub east: f64,
    pub north: f64,
}

impl Vec2 {
    pub fn new(east: f64, north: f64) -> Self {
        Self { east, north }
    }

    pub fn dot(&self, other: Vec2) -> f64 {
        self.east * other.east + self.north * other.north
    }

    pub fn norm(&self) -> f64 {
        self.dot(*self).sqrt()
    }

    pub fn sub(&self, other: Vec2) -> Vec2 {
        Vec2::new(self.east - other.east, self.north - other.north)
    }

    pub fn add(&self, other: Vec2) -> Vec2 {
        Vec2::new(self.east + other.east, self.north + other.north)
    }

    pub fn scale(&self, s: f64) -> Vec2 {
        Vec2::new(self.east * s, self.north * s)
    }
}

// ── Headings ──────────────────────────────────────────────────────────────────

/// Wrap a heading into [0, 360). Non-finite input collapses to 0.
pub fn normalize_heading(deg: f64) -> f64 {
    if !deg.is_finite() {
        return 0.0;
    }
    deg.rem_euclid(360.0)
}

/// Smallest-arc difference between two headings, in [0, 180].
pub fn heading_diff_deg(a: f64, b: f64) -> f64 {
    let d = (normalize_heading(a) - normalize_heading(b)).abs() % 360.0;
    if d > 180.0 {
        360.0 - d
    } else {
        d
    }
}

/// Decompose ground speed along a compass bearing into (east, north) m/s.
pub fn velocity_en(speed_mps: f64, heading_deg: f64) -> Vec2 {
    let theta = heading_deg.to_radians();
    Vec2::new(speed_mps * theta.sin(), speed_mps * theta.cos())
}

// ── Great-circle distance ─────────────────────────────────────────────────────

/// Haversine distance in meters between two WGS-84 points.
pub fn great_circle_m(a: LatLon, b: LatLon) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();

    let h = (dlat / 2.0).sin().powi(2)
        + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());

    EARTH_RADIUS_M * c
}

// ── Forward projection ────────────────────────────────────────────────────────

/// Spherical forward geodesic: project `p` along `bearing_deg` by
/// `dist_m` meters. Output longitude is wrapped to (−180, 180].
pub fn project_forward(p: LatLon, bearing_deg: f64, dist_m: f64) -> LatLon {
    let delta = dist_m / EARTH_RADIUS_M;
    let theta = bearing_deg.to_radians();
    let lat1 = p.lat.to_radians();
    let lon1 = p.lon.to_radians();

    let lat2 = (lat1.sin() * delta.cos() + lat1.cos() * delta.sin() * theta.cos()).asin();
    let lon2 = lon1
        + (theta.sin() * delta.sin() * lat1.cos())
            .atan2(delta.cos() - lat1.sin() * lat2.sin());

    let mut lon_deg = lon2.to_degrees();
    if lon_deg > 180.0 {
        lon_deg -= 360.0;
    } else if lon_deg <= -180.0 {
        lon_deg += 360.0;
    }

    LatLon::new(lat2.to_degrees(), lon_deg)
}

// ── Local tangent frame ───────────────────────────────────────────────────────

/// Equirectangular ENU linearization of `p` around `reference`, meters.
pub fn local_enu(reference: LatLon, p: LatLon) -> Vec2 {
    let m_per_deg_lon = METERS_PER_DEG * reference.lat.to_radians().cos();
    Vec2::new(
        (p.lon - reference.lon) * m_per_deg_lon,
        (p.lat - reference.lat) * METERS_PER_DEG,
    )
}

// ── Closest point of approach ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct CpaResult {
    /// Time of closest approach, clamped to [0, max_t] seconds.
    pub t_star: f64,
    /// Separation at `t_star`, meters.
    pub cpa_dist_m: f64,
    /// Own position at `t_star` in the shared tangent frame.
    pub self_at: Vec2,
    /// Peer position at `t_star`.
    pub other_at: Vec2,
    /// Current closing speed, m/s; positive means the gap is shrinking.
    pub closing_speed: f64,
}

/// Straight-line CPA/TTC over [0, max_t].
///
/// `t* = clamp(−(r·v)/|v|², 0, max_t)` with `r = pos_other − pos_self`,
/// `v = vel_other − vel_self`. Degenerate relative motion (|v|² ≤ 1e-6)
/// pins `t*` to 0 so the current separation is the answer.
pub fn compute_cpa_ttc(
    self_pos: Vec2,
    self_vel: Vec2,
    other_pos: Vec2,
    other_vel: Vec2,
    max_t: f64,
) -> CpaResult {
    let r = other_pos.sub(self_pos);
    let v = other_vel.sub(self_vel);

    let v_sq = v.dot(v);
    let t_star = if v_sq <= 1e-6 {
        0.0
    } else {
        (-(r.dot(v)) / v_sq).clamp(0.0, max_t)
    };

    let self_at = self_pos.add(self_vel.scale(t_star));
    let other_at = other_pos.add(other_vel.scale(t_star));
    let cpa_dist_m = other_at.sub(self_at).norm();

    let r_norm = r.norm();
    let closing_speed = if r_norm > 1e-9 {
        -(r.dot(v)) / r_norm
    } else {
        0.0
    };

    CpaResult {
        t_star,
        cpa_dist_m,
        self_at,
        other_at,
        closing_speed,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
