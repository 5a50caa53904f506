//! # predict
//!
//! The predictor bank: five kinematic detectors, each a pure function of
//! two vehicle states plus derived context. `assess_pair` runs them in a
//! fixed order and the first match wins, so one telemetry frame emits at
//! most one threat per neighbor.
//!
//! Order: predicted-collision, rear-end, wrong-direction, intersection,
//! overtake.
//!
//! All headings are compass bearings and all tangent-frame math shares
//! the (east, north) convention of the geometry kernel.

use v2v_types::geo::{
    compute_cpa_ttc, great_circle_m, heading_diff_deg, local_enu, normalize_heading,
    project_forward, velocity_en, Vec2,
};
use v2v_types::{ThreatKind, VehicleState};

use crate::config::EngineConfig;
use crate::history::SpeedPoint;

// Literal gates of the individual detectors.
const WRONG_DIR_MAX_DIST_M: f64 = 40.0;
const INTERSECTION_MIN_SPEED_MPS: f64 = 2.78; // 10 km/h
const INTERSECTION_MIN_ANGLE_DEG: f64 = 60.0;
const INTERSECTION_MAX_ANGLE_DEG: f64 = 120.0;
const INTERSECTION_CPA_MAX_M: f64 = 8.0;
const OVERTAKE_MAX_ANGLE_DEG: f64 = 20.0;
const OVERTAKE_MAX_DIST_M: f64 = 12.0;
const OVERTAKE_MIN_SPEED_DELTA_MPS: f64 = 1.5;
const OVERTAKE_MIN_CLOSING_MPS: f64 = 0.3;
const OVERTAKE_MAX_TTC_S: f64 = 2.0;
const REAR_END_MIN_CLOSING_MPS: f64 = 0.5;

/// One positive detector outcome; the dispatcher turns this into the two
/// recipient-relative payloads.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub kind: ThreatKind,
    pub future_distance_m: Option<f64>,
    pub time_s: Option<f64>,
    pub distance_m: Option<f64>,
    pub deceleration: Option<f64>,
    pub time_to_cpa_s: Option<f64>,
    pub lateral_m: Option<f64>,
}

impl Detection {
    fn new(kind: ThreatKind) -> Self {
        Self {
            kind,
            future_distance_m: None,
            time_s: None,
            distance_m: None,
            deceleration: None,
            time_to_cpa_s: None,
            lateral_m: None,
        }
    }
}

/// Derived context for one (self, neighbor) pair.
pub struct PairContext<'a> {
    /// The counterpart's recent speed window, oldest first.
    pub other_history: &'a [SpeedPoint],
    /// Majority heading of the neighborhood, degrees.
    pub majority_heading_deg: f64,
    /// Current great-circle separation, meters.
    pub distance_m: f64,
}

/// Argument of the unit-vector sum of headings. Robust to the 0°/360°
/// wrap; an empty or perfectly cancelling set collapses to 0°.
pub fn majority_heading(headings: impl IntoIterator<Item = f64>) -> f64 {
    let (mut east, mut north) = (0.0f64, 0.0f64);
    for h in headings {
        let r = h.to_radians();
        east += r.sin();
        north += r.cos();
    }
    if east * east + north * north < 1e-12 {
        return 0.0;
    }
    normalize_heading(east.atan2(north).to_degrees())
}

/// Run the bank in order; first hit wins.
pub fn assess_pair(
    own: &VehicleState,
    other: &VehicleState,
    ctx: &PairContext<'_>,
    cfg: &EngineConfig,
) -> Option<Detection> {
    predicted_collision(own, other, cfg)
        .or_else(|| rear_end(own, other, ctx, cfg))
        .or_else(|| wrong_direction(other, ctx, cfg))
        .or_else(|| intersection(own, other, cfg))
        .or_else(|| overtake(own, other, ctx, cfg))
}

// ── 1. Predicted collision ────────────────────────────────────────────────────

/// Constant-velocity simulation at whole-second steps: project both
/// vehicles along their headings and flag the first step where the
/// projected great-circle gap closes below the collision radius. The
/// radius widens while the reporting vehicle is mid-turn, where its
/// heading is least trustworthy.
fn predicted_collision(
    own: &VehicleState,
    other: &VehicleState,
    cfg: &EngineConfig,
) -> Option<Detection> {
    if own.speed_mps < cfg.min_moving_speed_ms && other.speed_mps < cfg.min_moving_speed_ms {
        return None;
    }

    let mut radius = cfg.collision_radius_m;
    if cfg.is_sudden_turn(own.yaw_rate_deg_s) {
        radius += cfg.uncertainty_inflation_m;
    }

    let mut t = cfg.predict_step_s;
    while t <= cfg.lookahead_s {
        let dt = t as f64;
        let own_at = project_forward(own.position, own.heading_deg, own.speed_mps * dt);
        let other_at = project_forward(other.position, other.heading_deg, other.speed_mps * dt);
        let gap = great_circle_m(own_at, other_at);
        if gap <= radius {
            let mut d = Detection::new(ThreatKind::PredictedCollision);
            d.time_s = Some(dt);
            d.future_distance_m = Some(gap);
            return Some(d);
        }
        t += cfg.predict_step_s;
    }
    None
}

// ── 2. Rear-end ───────────────────────────────────────────────────────────────

/// The counterpart is braking hard right in front of us: its history
/// shows a sudden deceleration, it is close, and we are closing on it.
fn rear_end(
    own: &VehicleState,
    other: &VehicleState,
    ctx: &PairContext<'_>,
    cfg: &EngineConfig,
) -> Option<Detection> {
    let [.., prev, last] = ctx.other_history else {
        return None;
    };

    let dt_s = ((last.recorded_at_ms - prev.recorded_at_ms) as f64 / 1000.0).max(1.0);
    let decel = (prev.speed_mps - last.speed_mps) / dt_s;
    let closing = own.speed_mps - other.speed_mps;

    if decel >= cfg.sudden_decel_ms2
        && ctx.distance_m <= cfg.rear_end_distance_m
        && closing > REAR_END_MIN_CLOSING_MPS
    {
        let mut d = Detection::new(ThreatKind::RearEnd);
        d.distance_m = Some(ctx.distance_m);
        d.deceleration = Some(decel);
        return Some(d);
    }
    None
}

// ── 3. Wrong direction ────────────────────────────────────────────────────────

/// The counterpart drives against the dominant flow of the neighborhood.
fn wrong_direction(
    other: &VehicleState,
    ctx: &PairContext<'_>,
    cfg: &EngineConfig,
) -> Option<Detection> {
    let diff = heading_diff_deg(other.heading_deg, ctx.majority_heading_deg);
    if diff >= cfg.wrong_dir_diff_deg && ctx.distance_m <= WRONG_DIR_MAX_DIST_M {
        let mut d = Detection::new(ThreatKind::WrongDirection);
        d.distance_m = Some(ctx.distance_m);
        return Some(d);
    }
    None
}

// ── 4. Intersection (T/L) ─────────────────────────────────────────────────────

/// Crossing trajectories: both vehicles at road speed, headings roughly
/// perpendicular, and the straight-line CPA inside the collision window.
fn intersection(
    own: &VehicleState,
    other: &VehicleState,
    cfg: &EngineConfig,
) -> Option<Detection> {
    if own.speed_mps < INTERSECTION_MIN_SPEED_MPS || other.speed_mps < INTERSECTION_MIN_SPEED_MPS {
        return None;
    }
    let angle = heading_diff_deg(own.heading_deg, other.heading_deg);
    if !(INTERSECTION_MIN_ANGLE_DEG..=INTERSECTION_MAX_ANGLE_DEG).contains(&angle) {
        return None;
    }

    let other_pos = local_enu(own.position, other.position);
    let cpa = compute_cpa_ttc(
        Vec2::default(),
        own.velocity,
        other_pos,
        other.velocity,
        cfg.projection_time_s,
    );

    if cpa.cpa_dist_m <= INTERSECTION_CPA_MAX_M && cpa.t_star <= cfg.ttc_max_s {
        let mut d = Detection::new(ThreatKind::IntersectionCollision);
        d.time_to_cpa_s = Some(cpa.t_star);
        d.distance_m = Some(cpa.cpa_dist_m);
        return Some(d);
    }
    None
}

// ── 5. Overtake ───────────────────────────────────────────────────────────────

/// A faster vehicle slotting past in the adjacent lane: near-parallel
/// headings, small lateral offset, and a CPA confirming it is actually
/// coming through within two seconds.
fn overtake(
    own: &VehicleState,
    other: &VehicleState,
    ctx: &PairContext<'_>,
    cfg: &EngineConfig,
) -> Option<Detection> {
    if heading_diff_deg(own.heading_deg, other.heading_deg) > OVERTAKE_MAX_ANGLE_DEG
        || ctx.distance_m > OVERTAKE_MAX_DIST_M
        || other.speed_mps <= own.speed_mps + OVERTAKE_MIN_SPEED_DELTA_MPS
    {
        return None;
    }

    let rel = local_enu(own.position, other.position);
    let along = velocity_en(1.0, own.heading_deg);
    // Magnitude of the component of `rel` orthogonal to our heading.
    let lateral = (rel.east * along.north - rel.north * along.east).abs();
    if lateral > cfg.overtake_side_max_m {
        return None;
    }

    let cpa = compute_cpa_ttc(
        Vec2::default(),
        own.velocity,
        rel,
        other.velocity,
        cfg.projection_time_s,
    );
    if cpa.closing_speed > OVERTAKE_MIN_CLOSING_MPS && cpa.t_star <= OVERTAKE_MAX_TTC_S {
        let mut d = Detection::new(ThreatKind::Overtake);
        d.lateral_m = Some(lateral);
        d.distance_m = Some(ctx.distance_m);
        return Some(d);
    }
    None
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use v2v_types::geo::METERS_PER_DEG;
    use v2v_types::TelemetrySample;

    fn state(lat: f64, lon: f64, heading: f64, speed: f64) -> VehicleState {
        let sample = TelemetrySample::from_message(&json!({
            "userId": "t",
            "latitude": lat,
            "longitude": lon,
            "heading": heading,
            "speed": speed,
        }))
        .unwrap();
        VehicleState::derive(&sample)
    }

    fn ctx<'a>(history: &'a [SpeedPoint], majority: f64, a: &VehicleState, b: &VehicleState) -> PairContext<'a> {
        PairContext {
            other_history: history,
            majority_heading_deg: majority,
            distance_m: great_circle_m(a.position, b.position),
        }
    }

    fn deg_east(m: f64) -> f64 {
        m / METERS_PER_DEG
    }

    #[test]
    fn majority_heading_handles_wraparound() {
        let m = majority_heading([350.0, 10.0]);
        assert!(m < 1.0 || m > 359.0, "got {m}");
        let m = majority_heading([90.0, 90.0, 270.0]);
        assert!((m - 90.0).abs() < 1e-6);
        assert_eq!(majority_heading([]), 0.0);
    }

    // Head-on pair, 100 m apart, 10 m/s each: the projected gap first
    // closes inside the collision radius at t = 5.
    #[test]
    fn head_on_pair_predicts_collision() {
        let cfg = EngineConfig::default();
        let a = state(0.0, 0.0, 90.0, 10.0);
        let b = state(0.0, 0.0009, 270.0, 10.0);

        let det = assess_pair(&b, &a, &ctx(&[], 90.0, &b, &a), &cfg).expect("threat");
        assert_eq!(det.kind, ThreatKind::PredictedCollision);
        let t = det.time_s.unwrap();
        assert!(t == 4.0 || t == 5.0, "time_s = {t}");
        assert!(det.future_distance_m.unwrap() <= cfg.collision_radius_m);

        // Mirror telemetry fires symmetrically.
        let det = assess_pair(&a, &b, &ctx(&[], 90.0, &a, &b), &cfg).expect("mirror threat");
        assert_eq!(det.kind, ThreatKind::PredictedCollision);
    }

    #[test]
    fn parked_pair_is_not_a_predicted_collision() {
        let cfg = EngineConfig::default();
        let a = state(0.0, 0.0, 90.0, 0.0);
        let b = state(0.0, deg_east(2.0), 270.0, 0.0);
        assert!(predicted_collision(&a, &b, &cfg).is_none());
    }

    #[test]
    fn sudden_turn_inflates_collision_radius() {
        let cfg = EngineConfig::default();
        // Parallel tracks 6 m apart: outside the base 4 m radius, inside
        // the inflated 9 m one.
        let mut a = state(0.0, 0.0, 0.0, 10.0);
        let b = state(0.0, deg_east(6.0), 0.0, 10.0);
        assert!(predicted_collision(&a, &b, &cfg).is_none());

        a.yaw_rate_deg_s = 50.0;
        let det = predicted_collision(&a, &b, &cfg).expect("inflated radius hit");
        assert_eq!(det.kind, ThreatKind::PredictedCollision);
    }

    // Braking vehicle 9 m ahead, same lane, closing slowly enough that
    // the projection never dips under the collision radius.
    #[test]
    fn braking_lead_vehicle_triggers_rear_end() {
        let cfg = EngineConfig::default();
        let a = state(0.0, 0.0, 90.0, 10.6);
        let b = state(0.0, deg_east(9.0), 90.0, 10.0);

        let history = [
            SpeedPoint { speed_mps: 16.0, recorded_at_ms: 1_000 },
            SpeedPoint { speed_mps: 10.0, recorded_at_ms: 2_000 },
        ];
        let det = assess_pair(&a, &b, &ctx(&history, 90.0, &a, &b), &cfg).expect("threat");
        assert_eq!(det.kind, ThreatKind::RearEnd);
        assert!((det.deceleration.unwrap() - 6.0).abs() < 1e-9);
        assert!((det.distance_m.unwrap() - 9.0).abs() < 0.1);
    }

    #[test]
    fn rear_end_needs_two_history_samples_and_real_braking() {
        let cfg = EngineConfig::default();
        let a = state(0.0, 0.0, 90.0, 10.6);
        let b = state(0.0, deg_east(9.0), 90.0, 10.0);

        let one = [SpeedPoint { speed_mps: 16.0, recorded_at_ms: 1_000 }];
        assert!(rear_end(&a, &b, &ctx(&one, 90.0, &a, &b), &cfg).is_none());

        let gentle = [
            SpeedPoint { speed_mps: 11.0, recorded_at_ms: 1_000 },
            SpeedPoint { speed_mps: 10.0, recorded_at_ms: 2_000 },
        ];
        assert!(rear_end(&a, &b, &ctx(&gentle, 90.0, &a, &b), &cfg).is_none());
    }

    // Counterpart heading 270° against a 90° corridor, 20 m away.
    #[test]
    fn against_the_flow_triggers_wrong_direction() {
        let cfg = EngineConfig::default();
        let own = state(0.0, 0.0, 90.0, 0.05);
        let ghost = state(0.0, deg_east(20.0), 270.0, 0.05);

        let det = assess_pair(&own, &ghost, &ctx(&[], 90.0, &own, &ghost), &cfg).expect("threat");
        assert_eq!(det.kind, ThreatKind::WrongDirection);
        assert!((det.distance_m.unwrap() - 20.0).abs() < 0.2);
    }

    #[test]
    fn wrong_direction_needs_proximity() {
        let cfg = EngineConfig::default();
        let own = state(0.0, 0.0, 90.0, 0.05);
        let ghost = state(0.0, deg_east(60.0), 270.0, 0.05);
        assert!(assess_pair(&own, &ghost, &ctx(&[], 90.0, &own, &ghost), &cfg).is_none());
    }

    // Northbound at 3 m/s; crossing traffic 20 m east coming west at
    // 8 m/s. Perpendicular headings, CPA ≈ 7 m at t ≈ 2.2 s.
    #[test]
    fn crossing_paths_trigger_intersection() {
        let cfg = EngineConfig::default();
        let a = state(0.0, 0.0, 0.0, 3.0);
        let b = state(0.0, deg_east(20.0), 270.0, 8.0);

        let det = assess_pair(&a, &b, &ctx(&[], 0.0, &a, &b), &cfg).expect("threat");
        assert_eq!(det.kind, ThreatKind::IntersectionCollision);
        let t = det.time_to_cpa_s.unwrap();
        assert!(t > 0.0 && t <= cfg.ttc_max_s, "t* = {t}");
        assert!(det.distance_m.unwrap() <= 8.0);
    }

    #[test]
    fn intersection_requires_road_speed_and_crossing_angle() {
        let cfg = EngineConfig::default();
        // Too slow
        let a = state(0.0, 0.0, 0.0, 1.0);
        let b = state(0.0, deg_east(20.0), 270.0, 8.0);
        assert!(intersection(&a, &b, &cfg).is_none());
        // Near-parallel
        let a = state(0.0, 0.0, 0.0, 8.0);
        let b = state(0.0, deg_east(20.0), 10.0, 8.0);
        assert!(intersection(&a, &b, &cfg).is_none());
    }

    // Faster vehicle slightly behind in the adjacent lane (3 m lateral,
    // 1.2 m back, +4 m/s).
    #[test]
    fn adjacent_lane_pass_triggers_overtake() {
        let cfg = EngineConfig::default();
        let own = state(0.0, 0.0, 0.0, 5.0);
        let passer = state(-1.2 / METERS_PER_DEG, deg_east(3.0), 0.0, 9.0);

        let det = assess_pair(&own, &passer, &ctx(&[], 0.0, &own, &passer), &cfg).expect("threat");
        assert_eq!(det.kind, ThreatKind::Overtake);
        assert!((det.lateral_m.unwrap() - 3.0).abs() < 0.1);
    }

    #[test]
    fn overtake_rejects_wide_or_slow_passers() {
        let cfg = EngineConfig::default();
        let own = state(0.0, 0.0, 0.0, 5.0);
        // Too far to the side
        let wide = state(-1.2 / METERS_PER_DEG, deg_east(5.0), 0.0, 9.0);
        assert!(overtake(&own, &wide, &ctx(&[], 0.0, &own, &wide), &cfg).is_none());
        // Not meaningfully faster
        let slow = state(-1.2 / METERS_PER_DEG, deg_east(3.0), 0.0, 6.0);
        assert!(overtake(&own, &slow, &ctx(&[], 0.0, &own, &slow), &cfg).is_none());
    }

    // A pair that satisfies several detectors still yields exactly one
    // threat: the first in bank order.
    #[test]
    fn first_matching_predictor_wins() {
        let cfg = EngineConfig::default();
        let a = state(0.0, 0.0, 90.0, 10.0);
        let b = state(0.0, deg_east(20.0), 270.0, 10.0);

        let history = [
            SpeedPoint { speed_mps: 16.0, recorded_at_ms: 1_000 },
            SpeedPoint { speed_mps: 10.0, recorded_at_ms: 2_000 },
        ];
        // Majority 90° makes b wrong-direction eligible too; head-on
        // geometry also satisfies predicted-collision, which runs first.
        let det = assess_pair(&a, &b, &ctx(&history, 90.0, &a, &b), &cfg).expect("threat");
        assert_eq!(det.kind, ThreatKind::PredictedCollision);
    }

    // Reprocessing identical inputs yields the identical detection.
    #[test]
    fn assessment_is_idempotent() {
        let cfg = EngineConfig::default();
        let a = state(0.0, 0.0, 90.0, 10.0);
        let b = state(0.0, 0.0009, 270.0, 10.0);
        let c = ctx(&[], 90.0, &b, &a);
        let first = assess_pair(&b, &a, &c, &cfg);
        let second = assess_pair(&b, &a, &c, &cfg);
        assert_eq!(first, second);
    }
}
