use chrono::{DateTime, Utc};
use serde::Serialize;

/// Placeholder shown for identifiers the uplink did not carry.
pub const UNKNOWN: &str = "--";

/// One decoded reading of the energy meter, stamped with the local receipt time.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    /// V
    pub voltage: f64,
    /// A
    pub current: f64,
    /// W
    pub power: f64,
    /// Hz
    pub frequency: f64,
    pub power_factor: f64,
    /// Lifetime counter in kWh.
    pub energy_total: f64,
    /// kWh since the device's daily reset.
    pub daily_energy: f64,
    pub daily_cost: f64,
    /// dBm
    pub rssi: f64,
    /// dB
    pub snr: f64,
    pub device_id: String,
    pub gateway_name: String,
}

impl Sample {
    /// A reading with every measurement zeroed and unknown identifiers.
    #[cfg(test)]
    pub fn empty(timestamp: DateTime<Utc>) -> Self {
        Sample {
            timestamp,
            voltage: 0.0,
            current: 0.0,
            power: 0.0,
            frequency: 0.0,
            power_factor: 0.0,
            energy_total: 0.0,
            daily_energy: 0.0,
            daily_cost: 0.0,
            rssi: 0.0,
            snr: 0.0,
            device_id: UNKNOWN.to_string(),
            gateway_name: UNKNOWN.to_string(),
        }
    }
}
