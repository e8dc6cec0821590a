use serde::Serialize;

use super::{ConnectionStatus, Sample};

/// Point-in-time copy of the whole telemetry store, taken under a single lock.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    pub status: ConnectionStatus,
    pub has_received_any: bool,
    pub latest: Option<Sample>,
    pub history: Vec<Sample>,
}
