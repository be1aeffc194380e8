//! Mesh metrics
//!
//! All metrics are prefixed with `mesh_`. Counters end in `_total`. No
//! recorder is installed here; without one the macros are no-ops.

use metrics::{counter, gauge};

use crate::{peer_directory::PeerState, protocol::Action, transport::Direction};

pub fn record_connection_opened(direction: Direction) {
    counter!("mesh_connections_opened_total", "direction" => direction.as_str()).increment(1);
}

pub fn record_connection_closed(direction: Direction) {
    counter!("mesh_connections_closed_total", "direction" => direction.as_str()).increment(1);
}

pub fn set_open_connections(count: usize) {
    gauge!("mesh_open_connections").set(count as f64);
}

pub fn record_dial_attempt(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("mesh_dial_attempts_total", "status" => status).increment(1);
}

pub fn record_envelope_dispatched(action: Action, is_response: bool) {
    let kind = if is_response { "response" } else { "request" };
    counter!("mesh_envelopes_dispatched_total", "action" => action.as_str(), "kind" => kind)
        .increment(1);
}

pub fn record_peer_transition(state: PeerState) {
    counter!("mesh_peer_transitions_total", "state" => state.as_str()).increment(1);
}

pub fn record_sync_round() {
    counter!("mesh_sync_rounds_total").increment(1);
}

pub fn record_entity_repaired(entity_type: &'static str) {
    counter!("mesh_entities_repaired_total", "type" => entity_type).increment(1);
}

pub fn record_liveness_timeout() {
    counter!("mesh_liveness_timeouts_total").increment(1);
}
