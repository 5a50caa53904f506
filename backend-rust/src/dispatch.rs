//! # dispatch
//!
//! Turns one detection into its two recipient-relative payloads and
//! routes them: the origin channel always gets the push, the counterpart
//! only if a channel is currently bound to its id. Each recipient sees
//! the *other* vehicle as `id`/`lat`/`lng`/`sourceVehicle`. Undeliverable
//! pushes are dropped, never surfaced to the pipeline.

use tracing::debug;

use v2v_types::{ServerMessage, SourceVehicle, TelemetrySample, Threat, ThreatKind};

use crate::predict::Detection;
use crate::sessions::{ChannelHandle, SessionRegistry};

fn describe(det: &Detection, counterpart_id: &str) -> String {
    match det.kind {
        ThreatKind::PredictedCollision => format!(
            "Predicted collision with {counterpart_id} in {:.0} s (projected gap {:.1} m)",
            det.time_s.unwrap_or_default(),
            det.future_distance_m.unwrap_or_default(),
        ),
        ThreatKind::RearEnd => format!(
            "Vehicle {counterpart_id} braking hard {:.1} m ahead ({:.1} m/s²)",
            det.distance_m.unwrap_or_default(),
            det.deceleration.unwrap_or_default(),
        ),
        ThreatKind::WrongDirection => format!(
            "Vehicle {counterpart_id} traveling against traffic {:.1} m away",
            det.distance_m.unwrap_or_default(),
        ),
        ThreatKind::IntersectionCollision => format!(
            "Crossing-traffic conflict with {counterpart_id}: closest approach {:.1} m in {:.1} s",
            det.distance_m.unwrap_or_default(),
            det.time_to_cpa_s.unwrap_or_default(),
        ),
        ThreatKind::Overtake => format!(
            "Vehicle {counterpart_id} overtaking within {:.1} m",
            det.lateral_m.unwrap_or_default(),
        ),
    }
}

/// The threat as one recipient sees it: `counterpart` is the other
/// vehicle from that recipient's viewpoint.
pub fn build_threat(det: &Detection, counterpart: &TelemetrySample) -> Threat {
    Threat {
        kind: det.kind,
        id: counterpart.user_id.clone(),
        lat: counterpart.latitude,
        lng: counterpart.longitude,
        source_vehicle: SourceVehicle::from(counterpart),
        future_distance_m: det.future_distance_m,
        time_s: det.time_s,
        distance_m: det.distance_m,
        deceleration: det.deceleration,
        time_to_cpa_s: det.time_to_cpa_s,
        lateral_m: det.lateral_m,
        message: describe(det, &counterpart.user_id),
    }
}

/// Fan one detection out to both endpoints. Returns the origin-side
/// threat so the ingress pipeline can include it in the acknowledgment.
pub fn dispatch(
    sessions: &SessionRegistry,
    origin: &ChannelHandle,
    det: &Detection,
    own_sample: &TelemetrySample,
    other_sample: &TelemetrySample,
) -> Threat {
    let to_origin = build_threat(det, other_sample);
    origin.send_json(&ServerMessage::Threat {
        data: to_origin.clone(),
    });

    match sessions.lookup(&other_sample.user_id) {
        Some(counterpart) => {
            counterpart.send_json(&ServerMessage::Threat {
                data: build_threat(det, own_sample),
            });
        }
        None => {
            debug!(
                "counterpart {} has no bound channel, push skipped",
                other_sample.user_id
            );
        }
    }

    to_origin
}
