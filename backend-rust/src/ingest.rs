//! # ingest
//!
//! WebSocket ingress and the per-message pipeline:
//! validate → persist → neighbors → predict → dispatch → acknowledge.
//!
//! Each connection runs one task. Outbound frames (acks and pushes, from
//! this pipeline and from other vehicles' pipelines) funnel through a
//! bounded per-socket queue; inbound frames are processed strictly in
//! arrival order, so a session's message N fully completes — dispatches
//! included — before N+1 starts. Across sessions nothing is ordered.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use v2v_types::geo::great_circle_m;
use v2v_types::{ServerMessage, TelemetrySample, Threat, VehicleState};

use crate::auth::AuthVerifier;
use crate::config::EngineConfig;
use crate::dispatch;
use crate::history::SpeedHistory;
use crate::predict::{assess_pair, majority_heading, PairContext};
use crate::sessions::{ChannelHandle, SessionRegistry, CHANNEL_QUEUE_DEPTH};
use crate::stores::{GeoIndex, TelemetryStore, MAX_RADIUS_RESULTS};

/// Telemetry TTL split: fast movers expire quickly, slow or parked
/// vehicles linger.
const FAST_TTL: Duration = Duration::from_secs(10);
const SLOW_TTL: Duration = Duration::from_secs(30);
const FAST_SPEED_CUTOFF_MPS: f64 = 5.0;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<EngineConfig>,
    pub geo: Arc<GeoIndex>,
    pub telemetry: Arc<TelemetryStore>,
    pub history: Arc<SpeedHistory>,
    pub sessions: Arc<SessionRegistry>,
    pub auth: Arc<AuthVerifier>,
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    token: Option<String>,
}

pub async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<ConnectQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let token = query.token.clone().or_else(|| {
        headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    });
    let subject = state.auth.verify(token.as_deref());
    ws.on_upgrade(move |socket| handle_socket(state, socket, subject))
}

enum SocketEvent {
    Outbound(Option<String>),
    Inbound(Option<Result<Message, axum::Error>>),
}

async fn handle_socket(state: AppState, mut socket: WebSocket, subject: Option<String>) {
    let conn_id = Uuid::new_v4();
    let (tx, mut rx) = mpsc::channel::<String>(CHANNEL_QUEUE_DEPTH);
    let handle = ChannelHandle::new(conn_id, tx);

    match &subject {
        Some(sub) => info!(conn = %conn_id, subject = %sub, "client connected"),
        None => info!(conn = %conn_id, "client connected (anonymous)"),
    }

    loop {
        let event = tokio::select! {
            outbound = rx.recv() => SocketEvent::Outbound(outbound),
            inbound = socket.recv() => SocketEvent::Inbound(inbound),
        };
        match event {
            SocketEvent::Outbound(Some(text)) => {
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            SocketEvent::Outbound(None) => break,
            SocketEvent::Inbound(Some(Ok(Message::Text(text)))) => {
                process_message(&state, &handle, &text).await;
            }
            SocketEvent::Inbound(Some(Ok(Message::Close(_)))) | SocketEvent::Inbound(None) => break,
            SocketEvent::Inbound(Some(Ok(_))) => {} // binary / ping / pong ignored
            SocketEvent::Inbound(Some(Err(e))) => {
                debug!(conn = %conn_id, "socket error: {e}");
                break;
            }
        }
    }

    state.sessions.remove_conn(conn_id);
    info!(conn = %conn_id, "client disconnected");
}

fn send_ack(origin: &ChannelHandle, threats: Vec<Threat>) {
    origin.send_json(&ServerMessage::Received {
        timestamp: chrono::Utc::now().to_rfc3339(),
        threats,
    });
}

fn send_error(origin: &ChannelHandle, reason: &str) {
    origin.send_json(&ServerMessage::Error {
        reason: reason.to_string(),
    });
}

/// One inbound telemetry frame, start to finish.
pub async fn process_message(state: &AppState, origin: &ChannelHandle, raw: &str) {
    // 1. Parse. Frames that are not JSON are dropped without a response.
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            debug!("unparseable frame dropped: {e}");
            return;
        }
    };

    // 2. Validate; nothing is persisted for a rejected frame.
    let mut sample = match TelemetrySample::from_message(&value) {
        Ok(s) => s,
        Err(e) => {
            send_error(origin, &e.to_string());
            return;
        }
    };

    let received_at = now_ms();
    sample.server_timestamp_ms = Some(received_at);
    let own_state = VehicleState::derive(&sample);
    let id = sample.user_id.clone();

    // 3. Persist. Geo entry and telemetry entry share this upsert
    //    boundary and TTL; history and session binding follow.
    let ttl = if sample.speed > FAST_SPEED_CUTOFF_MPS {
        FAST_TTL
    } else {
        SLOW_TTL
    };
    if let Err(e) = state.geo.upsert(&id, sample.position(), ttl).await {
        warn!("geo upsert failed for {id}: {e}");
        send_error(origin, "storage unavailable");
        return;
    }
    if let Err(e) = state.telemetry.put(&id, &sample, ttl).await {
        warn!("telemetry put failed for {id}: {e}");
        send_error(origin, "storage unavailable");
        return;
    }
    state.history.append(&id, sample.speed, received_at);
    state.sessions.bind(&id, origin.clone());

    // 4–5. Neighbor query, widened while turning sharply.
    let radius = state.cfg.query_radius_m(own_state.yaw_rate_deg_s);
    let mut neighbor_ids = match state
        .geo
        .radius_by_member(&id, radius, MAX_RADIUS_RESULTS)
        .await
    {
        Ok(n) => n,
        Err(e) => {
            warn!("neighbor query failed for {id}: {e}");
            send_error(origin, "storage unavailable");
            return;
        }
    };
    neighbor_ids.retain(|n| n != &id);
    if neighbor_ids.is_empty() {
        send_ack(origin, Vec::new());
        return;
    }

    // 6. Batch fetch; undecodable entries already come back as None.
    let fetched = match state.telemetry.mget(&neighbor_ids).await {
        Ok(f) => f,
        Err(e) => {
            warn!("neighbor fetch failed for {id}: {e}");
            send_error(origin, "storage unavailable");
            return;
        }
    };

    let mut valid: Vec<(TelemetrySample, VehicleState)> = Vec::new();
    for (nid, maybe) in neighbor_ids.iter().zip(fetched) {
        let Some(neighbor) = maybe else {
            debug!("neighbor {nid} has no stored sample, skipped");
            continue;
        };
        let age_ms = received_at - neighbor.effective_timestamp_ms(received_at);
        if age_ms > state.cfg.stale_ms {
            debug!("neighbor {nid} stale ({age_ms} ms), skipped");
            continue;
        }
        let derived = VehicleState::derive(&neighbor);
        valid.push((neighbor, derived));
    }

    // 7. Majority heading over self + usable neighbors.
    let majority = majority_heading(
        std::iter::once(own_state.heading_deg).chain(valid.iter().map(|(_, st)| st.heading_deg)),
    );

    // 8. Predictor bank per neighbor; first hit dispatches to both ends.
    let mut threats = Vec::new();
    for (neighbor, neighbor_state) in &valid {
        let window = state.history.latest(&neighbor.user_id);
        let ctx = PairContext {
            other_history: &window,
            majority_heading_deg: majority,
            distance_m: great_circle_m(own_state.position, neighbor_state.position),
        };
        if let Some(det) = assess_pair(&own_state, neighbor_state, &ctx, &state.cfg) {
            debug!(
                "threat {:?} between {id} and {}",
                det.kind, neighbor.user_id
            );
            threats.push(dispatch::dispatch(
                &state.sessions,
                origin,
                &det,
                &sample,
                neighbor,
            ));
        }
    }

    // 9. Acknowledge to origin.
    send_ack(origin, threats);
}

// ── Tests ─────────────────────────────────────────────────────────────────────
