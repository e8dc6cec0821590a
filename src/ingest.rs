use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::{
    connection::transition,
    decoder,
    dto::ConnectionStatus,
    store::{SharedStore, TelemetryStore},
};

/// What a subscriber session hands to the ingestion loop.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Message(Vec<u8>),
    /// The session ended without being asked to.
    Dropped(String),
}

/// Consumes events of one session until it ends or the task is aborted.
pub async fn run(store: SharedStore, mut events: mpsc::Receiver<LinkEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            LinkEvent::Message(payload) => handle_message(&store, &payload),
            LinkEvent::Dropped(reason) => {
                error!("MQTT connection lost: {}", reason);
                break;
            }
        }
    }

    transition(&store, ConnectionStatus::Disconnected);
}

/// Decodes one uplink and records it. Undecodable payloads are logged and dropped.
pub fn handle_message(store: &TelemetryStore, payload: &[u8]) {
    // Single writer: nothing can replace `latest` between this read and `record`.
    let prior = store.latest();

    match decoder::decode_after(payload, prior.as_ref(), Utc::now()) {
        Ok(sample) => {
            info!(
                "Sample from {} via {}: {:.1} V {:.2} A {:.0} W (RSSI {} dBm, SNR {:.1} dB)",
                sample.device_id,
                sample.gateway_name,
                sample.voltage,
                sample.current,
                sample.power,
                sample.rssi,
                sample.snr
            );
            store.record(sample);
        }
        Err(err) => warn!("Discarding uplink of {} bytes: {}", payload.len(), err),
    }
}
