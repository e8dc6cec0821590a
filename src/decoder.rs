//! Decoding of LoRaWAN network-server uplink events into [`Sample`]s.
//!
//! Payloads are the JSON event bodies published on `application/+/device/+/event/up`:
//!
//! ```json
//! {
//!   "devEUI": "9fb27692fb0c2381",
//!   "rxInfo": [{ "name": "rooftop", "rssi": -97, "loRaSNR": 7.5 }],
//!   "object": { "voltage": 221.4, "current": 1.2, "power": 268, "dailyKwh": 1.8 }
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::dto::{Sample, UNKNOWN};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed uplink payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("uplink payload carries no measurement object")]
    MissingMeasurements,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct Uplink {
    #[serde(
        rename = "devEUI",
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    dev_eui: Option<String>,
    #[serde(rename = "rxInfo", default, skip_serializing_if = "Vec::is_empty")]
    rx_info: Vec<RxInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    object: Option<Measurements>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct RxInfo {
    #[serde(default, deserialize_with = "lenient_number")]
    rssi: f64,
    #[serde(rename = "loRaSNR", default, deserialize_with = "lenient_number")]
    lora_snr: f64,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    name: Option<String>,
    #[serde(
        rename = "gatewayID",
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    gateway_id: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct Measurements {
    #[serde(default, deserialize_with = "lenient_number")]
    voltage: f64,
    #[serde(default, deserialize_with = "lenient_number")]
    current: f64,
    #[serde(default, deserialize_with = "lenient_number")]
    power: f64,
    #[serde(default, deserialize_with = "lenient_number")]
    frequency: f64,
    #[serde(default, deserialize_with = "lenient_number")]
    power_factor: f64,
    #[serde(default, deserialize_with = "lenient_number")]
    energy: f64,
    #[serde(rename = "dailyKwh", default, deserialize_with = "lenient_number")]
    daily_kwh: f64,
    #[serde(default, deserialize_with = "lenient_number")]
    daily_cost: f64,
}

/// Numbers, numeric strings, or zero for anything else (null, bool, NaN,
/// values beyond the `f64` range).
fn lenient_number<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let number = match Value::deserialize(deserializer)? {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };

    Ok(number.filter(|n| n.is_finite()).unwrap_or_default())
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(text) => Some(text),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    })
}

/// Decodes an uplink with no earlier reading to inherit identity from.
#[cfg(test)]
pub fn decode(raw: &[u8], received_at: DateTime<Utc>) -> Result<Sample, DecodeError> {
    decode_after(raw, None, received_at)
}

/// Decodes an uplink received at `received_at`.
///
/// Missing measurements are zero. When the uplink has no `devEUI` or no
/// `rxInfo`, the device id, gateway and link quality carry over from `prior`,
/// or take the `"--"`/zero defaults when there is none. A key repeated in
/// the payload keeps its last value.
pub fn decode_after(
    raw: &[u8],
    prior: Option<&Sample>,
    received_at: DateTime<Utc>,
) -> Result<Sample, DecodeError> {
    // Going through `Value` first lets duplicate keys collapse instead of
    // failing the derived struct.
    let value: Value = serde_json::from_slice(raw)?;
    let uplink = Uplink::deserialize(value)?;
    let measurements = uplink.object.ok_or(DecodeError::MissingMeasurements)?;

    let (rssi, snr, gateway_name) = match uplink.rx_info.into_iter().next() {
        Some(rx) => (
            rx.rssi,
            rx.lora_snr,
            rx.name
                .or(rx.gateway_id)
                .unwrap_or_else(|| UNKNOWN.to_string()),
        ),
        None => prior
            .map(|p| (p.rssi, p.snr, p.gateway_name.clone()))
            .unwrap_or_else(|| (0.0, 0.0, UNKNOWN.to_string())),
    };

    let device_id = uplink
        .dev_eui
        .or_else(|| prior.map(|p| p.device_id.clone()))
        .unwrap_or_else(|| UNKNOWN.to_string());

    Ok(Sample {
        timestamp: received_at,
        voltage: measurements.voltage,
        current: measurements.current,
        power: measurements.power,
        frequency: measurements.frequency,
        power_factor: measurements.power_factor,
        energy_total: measurements.energy,
        daily_energy: measurements.daily_kwh,
        daily_cost: measurements.daily_cost,
        rssi,
        snr,
        device_id,
        gateway_name,
    })
}

/// Encodes the fields of `sample` in the uplink shape [`decode_after`] reads.
pub fn encode(sample: &Sample) -> Result<Vec<u8>, serde_json::Error> {
    let uplink = Uplink {
        dev_eui: Some(sample.device_id.clone()),
        rx_info: vec![RxInfo {
            rssi: sample.rssi,
            lora_snr: sample.snr,
            name: Some(sample.gateway_name.clone()),
            gateway_id: None,
        }],
        object: Some(Measurements {
            voltage: sample.voltage,
            current: sample.current,
            power: sample.power,
            frequency: sample.frequency,
            power_factor: sample.power_factor,
            energy: sample.energy_total,
            daily_kwh: sample.daily_energy,
            daily_cost: sample.daily_cost,
        }),
    };

    serde_json::to_vec(&uplink)
}
