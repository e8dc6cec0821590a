//! Publishes synthetic meter uplinks, for checking a deployment end to end
//! before the real device is on air.

use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, QoS};
use std::time::Duration;
use tokio::time::{interval, sleep};
use tracing::{debug, error, info, warn};

use crate::{
    decoder,
    dto::{Sample, UNKNOWN},
    util::{config::Settings, mqtt_options},
};

const GATEWAY_NAME: &str = "simulator";

/// The device EUI in a `application/<app>/device/<eui>/event/up` topic.
pub fn device_from_topic(topic: &str) -> Option<&str> {
    let mut segments = topic.split('/');
    segments.find(|segment| *segment == "device")?;
    segments
        .next()
        .filter(|eui| !eui.is_empty() && !eui.contains(['+', '#']))
}

/// Reading number `tick` of a meter that slowly wanders around a nominal load.
pub fn synthetic_sample(
    tick: u64,
    device_id: &str,
    tariff_rate: f64,
    timestamp: DateTime<Utc>,
) -> Sample {
    let t = tick as f64;
    let voltage = 220.0 + 4.0 * (t / 7.0).sin();
    let current = 1.2 + 0.8 * (t / 5.0).sin().abs();
    let power_factor = 0.92 + 0.05 * (t / 11.0).cos();
    let power = voltage * current * power_factor;
    let daily_energy = 0.05 * t;

    Sample {
        timestamp,
        voltage,
        current,
        power,
        frequency: 60.0 + 0.05 * (t / 3.0).sin(),
        power_factor,
        energy_total: 1200.0 + daily_energy,
        daily_energy,
        daily_cost: daily_energy * tariff_rate,
        rssi: -90.0 + 10.0 * (t / 13.0).sin(),
        snr: 5.0 * (t / 9.0).cos(),
        device_id: device_id.to_string(),
        gateway_name: GATEWAY_NAME.to_string(),
    }
}

pub async fn start_server(settings: Settings) -> anyhow::Result<()> {
    let topic = settings.mqtt.topic.clone();
    let device_id = device_from_topic(&topic).unwrap_or(UNKNOWN).to_string();
    let client_id = format!("{}-simulator", settings.mqtt.client_id);
    info!("Starting uplink simulator for device {} on {}", device_id, topic);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options(&settings.mqtt, &client_id), 10);

    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                error!("MQTT error: {:?}", e);

                // Only retry every 5 seconds
                sleep(Duration::from_secs(5)).await;

                warn!("Retrying after MQTT error.");
            }
        }
    });

    let mut ticker = interval(settings.simulate_interval);
    for tick in 0.. {
        ticker.tick().await;

        let sample = synthetic_sample(tick, &device_id, settings.summary.tariff_rate, Utc::now());
        let payload = decoder::encode(&sample)?;
        client
            .publish(topic.as_str(), QoS::AtLeastOnce, false, payload)
            .await?;
        debug!("Published simulated uplink {}: {:.0} W", tick, sample.power);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_eui_from_uplink_topic() {
        assert_eq!(
            device_from_topic("application/1/device/9fb27692fb0c2381/event/up"),
            Some("9fb27692fb0c2381")
        );
        assert_eq!(device_from_topic("application/1/device/+/event/up"), None);
        assert_eq!(device_from_topic("meters/kitchen"), None);
        assert_eq!(device_from_topic("application/1/device"), None);
    }

    #[test]
    fn synthetic_uplinks_decode() {
        let now = Utc::now();
        let sample = synthetic_sample(42, "9fb27692fb0c2381", 11.16, now);
        let payload = decoder::encode(&sample).unwrap();

        assert_eq!(decoder::decode(&payload, now).unwrap(), sample);
        assert!(sample.voltage > 215.0 && sample.voltage < 225.0);
        assert!((sample.daily_cost - sample.daily_energy * 11.16).abs() < 1e-9);
    }
}
