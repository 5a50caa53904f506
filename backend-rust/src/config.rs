//! # config
//!
//! Configuration for the service, split in two: `EngineConfig` holds the
//! tuning thresholds of the risk engine, `DeploymentConfig` holds the
//! process wiring (stores, auth secret, CORS, port). Every knob is
//! environment-overridable under the name shown next to it; defaults are
//! the deployed values.

use axum::http::HeaderValue;
use tower_http::cors::AllowOrigin;

fn env_f64(name: &str, default: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_i64(name: &str, default: i64) -> i64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_str(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

// ── Deployment wiring ─────────────────────────────────────────────────────────

/// Where the shared stores live and how the service is reached. Kept
/// apart from [`EngineConfig`] so prediction tuning and process wiring
/// never mix.
#[derive(Debug, Clone)]
pub struct DeploymentConfig {
    /// Shared-store endpoint (REDIS_URL); in-process stores when unset.
    pub redis_url: Option<String>,
    /// HS256 secret for bearer-token identity binding (AUTH_JWT_SECRET).
    pub auth_jwt_secret: Option<String>,
    /// Allowed browser origins: comma list, or "*" (CORS_ORIGINS).
    pub cors_origins: String,
    /// Listen port (PORT).
    pub port: u16,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            auth_jwt_secret: None,
            // Open by default: the telemetry channel grants nothing an
            // origin check would protect. Browser dashboards that want
            // an allowlist set CORS_ORIGINS to a comma list.
            cors_origins: "*".to_string(),
            port: 3001,
        }
    }
}

impl DeploymentConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            redis_url: env_str("REDIS_URL"),
            auth_jwt_secret: env_str("AUTH_JWT_SECRET"),
            cors_origins: env_str("CORS_ORIGINS").unwrap_or(d.cors_origins),
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.port),
        }
    }

    /// Origin policy for the router: `*` → any, otherwise the parsed
    /// comma list.
    pub fn cors_allow_origin(&self) -> AllowOrigin {
        if self.cors_origins.trim() == "*" {
            AllowOrigin::any()
        } else {
            AllowOrigin::list(parse_origin_list(&self.cors_origins))
        }
    }
}

fn parse_origin_list(origins: &str) -> Vec<HeaderValue> {
    origins
        .split(',')
        .filter_map(|o| o.trim().parse::<HeaderValue>().ok())
        .filter(|v| !v.is_empty())
        .collect()
}

// ── Engine thresholds ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base neighbor query radius (NEARBY_RADIUS_METERS)
    pub nearby_radius_m: f64,
    /// Max horizon for CPA-based predictors, seconds (PROJECTION_TIME_SECONDS)
    pub projection_time_s: f64,
    /// Baseline proximity threat cutoff (THREAT_DISTANCE_METERS)
    pub threat_distance_m: f64,
    /// Minimum speed considered "moving" (MIN_MOVING_SPEED_MS)
    pub min_moving_speed_ms: f64,
    /// Sudden-turn yaw-rate threshold, deg/s (ANGULAR_VEL_HIGH_DEG_S)
    pub angular_vel_high_deg_s: f64,
    /// Extra collision-radius margin while turning (UNCERTAINTY_INFLATION_METERS)
    pub uncertainty_inflation_m: f64,
    /// Extra query radius while turning sharply (BLIND_SPOT_RADIUS_BOOST_METERS)
    pub blind_spot_radius_boost_m: f64,
    /// Max age of a neighbor sample, milliseconds (STALE_MS)
    pub stale_ms: i64,
    /// Max time-to-CPA for the intersection predictor (TTC_MAX_SECONDS)
    pub ttc_max_s: f64,
    /// Reserved closing-speed gate, m/s (CLOSING_SPEED_STRONG_MS)
    pub closing_speed_strong_ms: f64,
    /// Predicted-collision horizon, seconds (LOOKAHEAD_S)
    pub lookahead_s: u32,
    /// Predicted-collision simulation step, seconds (PREDICT_STEP)
    pub predict_step_s: u32,
    /// Predicted-collision distance cutoff (COLLISION_RADIUS_M)
    pub collision_radius_m: f64,
    /// Rear-end proximity cutoff (REAR_END_DISTANCE_M)
    pub rear_end_distance_m: f64,
    /// Rear-end deceleration trigger, m/s² (SUDDEN_DECEL_MS2)
    pub sudden_decel_ms2: f64,
    /// Wrong-direction heading delta, degrees (WRONG_DIR_DIFF_DEG)
    pub wrong_dir_diff_deg: f64,
    /// Max lateral offset for the overtake predictor (OVERTAKE_SIDE_MAX_M)
    pub overtake_side_max_m: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            nearby_radius_m: 75.0,
            projection_time_s: 3.0,
            threat_distance_m: 15.0,
            min_moving_speed_ms: 0.1,
            angular_vel_high_deg_s: 45.0,
            uncertainty_inflation_m: 5.0,
            blind_spot_radius_boost_m: 8.0,
            stale_ms: 4000,
            ttc_max_s: 3.0,
            closing_speed_strong_ms: 10.0,
            lookahead_s: 5,
            predict_step_s: 1,
            collision_radius_m: 4.0,
            rear_end_distance_m: 10.0,
            sudden_decel_ms2: 2.0,
            wrong_dir_diff_deg: 150.0,
            overtake_side_max_m: 3.5,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            nearby_radius_m: env_f64("NEARBY_RADIUS_METERS", d.nearby_radius_m),
            projection_time_s: env_f64("PROJECTION_TIME_SECONDS", d.projection_time_s),
            threat_distance_m: env_f64("THREAT_DISTANCE_METERS", d.threat_distance_m),
            min_moving_speed_ms: env_f64("MIN_MOVING_SPEED_MS", d.min_moving_speed_ms),
            angular_vel_high_deg_s: env_f64("ANGULAR_VEL_HIGH_DEG_S", d.angular_vel_high_deg_s),
            uncertainty_inflation_m: env_f64(
                "UNCERTAINTY_INFLATION_METERS",
                d.uncertainty_inflation_m,
            ),
            blind_spot_radius_boost_m: env_f64(
                "BLIND_SPOT_RADIUS_BOOST_METERS",
                d.blind_spot_radius_boost_m,
            ),
            stale_ms: env_i64("STALE_MS", d.stale_ms),
            ttc_max_s: env_f64("TTC_MAX_SECONDS", d.ttc_max_s),
            closing_speed_strong_ms: env_f64("CLOSING_SPEED_STRONG_MS", d.closing_speed_strong_ms),
            lookahead_s: env_u32("LOOKAHEAD_S", d.lookahead_s),
            predict_step_s: env_u32("PREDICT_STEP", d.predict_step_s).max(1),
            collision_radius_m: env_f64("COLLISION_RADIUS_M", d.collision_radius_m),
            rear_end_distance_m: env_f64("REAR_END_DISTANCE_M", d.rear_end_distance_m),
            sudden_decel_ms2: env_f64("SUDDEN_DECEL_MS2", d.sudden_decel_ms2),
            wrong_dir_diff_deg: env_f64("WRONG_DIR_DIFF_DEG", d.wrong_dir_diff_deg),
            overtake_side_max_m: env_f64("OVERTAKE_SIDE_MAX_M", d.overtake_side_max_m),
        }
    }

    /// Whether a yaw rate qualifies as a sudden turn (blind-spot mode).
    pub fn is_sudden_turn(&self, yaw_rate_deg_s: f64) -> bool {
        yaw_rate_deg_s.abs() >= self.angular_vel_high_deg_s
    }

    /// Neighbor query radius for a vehicle, widened while it is turning
    /// sharply.
    pub fn query_radius_m(&self, yaw_rate_deg_s: f64) -> f64 {
        if self.is_sudden_turn(yaw_rate_deg_s) {
            self.nearby_radius_m + self.blind_spot_radius_boost_m
        } else {
            self.nearby_radius_m
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployed_values() {
        let c = EngineConfig::default();
        assert_eq!(c.nearby_radius_m, 75.0);
        assert_eq!(c.lookahead_s, 5);
        assert_eq!(c.collision_radius_m, 4.0);
        assert_eq!(c.stale_ms, 4000);
        assert_eq!(c.wrong_dir_diff_deg, 150.0);
    }

    #[test]
    fn sudden_turn_widens_query_radius() {
        let c = EngineConfig::default();
        assert_eq!(c.query_radius_m(10.0), 75.0);
        assert_eq!(c.query_radius_m(45.0), 83.0);
        assert_eq!(c.query_radius_m(-60.0), 83.0);
    }

    #[test]
    fn deployment_defaults_are_open() {
        let d = DeploymentConfig::default();
        assert_eq!(d.cors_origins, "*");
        assert_eq!(d.port, 3001);
        assert!(d.redis_url.is_none());
        assert!(d.auth_jwt_secret.is_none());
    }

    #[test]
    fn origin_list_parsing_trims_and_drops_junk() {
        let parsed = parse_origin_list("http://localhost:5173, https://app.example.com ,,");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0], "http://localhost:5173");
        assert_eq!(parsed[1], "https://app.example.com");
    }
}
