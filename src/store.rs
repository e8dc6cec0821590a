//! Shared state between the MQTT ingestion path and readers.
//!
//! Every field lives behind one lock, so a read of latest sample, history and
//! status together always observes a single point in time.

use std::{num::NonZeroUsize, sync::Arc};

use parking_lot::RwLock;

use crate::{
    dto::{ConnectionStatus, Sample, TelemetrySnapshot},
    history::HistoryBuffer,
};

pub type SharedStore = Arc<TelemetryStore>;

#[derive(Debug)]
struct StoreState {
    latest: Option<Sample>,
    history: HistoryBuffer,
    status: ConnectionStatus,
    has_received_any: bool,
}

#[derive(Debug)]
pub struct TelemetryStore {
    state: RwLock<StoreState>,
}

impl TelemetryStore {
    pub fn new(history_capacity: NonZeroUsize) -> Self {
        TelemetryStore {
            state: RwLock::new(StoreState {
                latest: None,
                history: HistoryBuffer::new(history_capacity),
                status: ConnectionStatus::Disconnected,
                has_received_any: false,
            }),
        }
    }

    pub fn shared(history_capacity: NonZeroUsize) -> SharedStore {
        Arc::new(Self::new(history_capacity))
    }

    /// Makes `sample` the latest reading and appends it to the history.
    pub fn record(&self, sample: Sample) {
        let mut state = self.state.write();
        state.history.append(sample.clone());
        state.latest = Some(sample);
        state.has_received_any = true;
    }

    /// Returns the previous status when it differs from `status`.
    pub fn set_status(&self, status: ConnectionStatus) -> Option<ConnectionStatus> {
        let mut state = self.state.write();
        let previous = std::mem::replace(&mut state.status, status);
        (previous != status).then_some(previous)
    }

    pub fn latest(&self) -> Option<Sample> {
        self.state.read().latest.clone()
    }

    pub fn history(&self) -> Vec<Sample> {
        self.state.read().history.snapshot()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.read().status
    }

    pub fn has_received_any(&self) -> bool {
        self.state.read().has_received_any
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        let state = self.state.read();
        TelemetrySnapshot {
            status: state.status,
            has_received_any: state.has_received_any,
            latest: state.latest.clone(),
            history: state.history.snapshot(),
        }
    }
}
