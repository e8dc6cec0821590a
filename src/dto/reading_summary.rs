use serde::Serialize;

use super::Sample;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalQuality {
    Good,
    Fair,
    Poor,
}

impl SignalQuality {
    pub fn from_rssi(rssi: f64) -> Self {
        if rssi > -85.0 {
            SignalQuality::Good
        } else if rssi > -100.0 {
            SignalQuality::Fair
        } else {
            SignalQuality::Poor
        }
    }

    pub fn from_snr(snr: f64) -> Self {
        if snr > 0.0 {
            SignalQuality::Good
        } else if snr > -5.0 {
            SignalQuality::Fair
        } else {
            SignalQuality::Poor
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SummaryParams {
    /// Currency per kWh, used until the device reports any daily usage.
    pub tariff_rate: f64,
    pub nominal_voltage: f64,
}

/// Values derived from a sample for display next to the raw readings.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingSummary {
    pub rssi_quality: SignalQuality,
    pub snr_quality: SignalQuality,
    pub tariff_rate: f64,
    pub voltage_deviation: Option<f64>,
}

impl ReadingSummary {
    pub fn of(sample: &Sample, params: &SummaryParams) -> Self {
        let tariff_rate = if sample.daily_energy > 0.0 {
            sample.daily_cost / sample.daily_energy
        } else {
            params.tariff_rate
        };

        let voltage_deviation =
            (sample.voltage > 0.0).then(|| sample.voltage - params.nominal_voltage);

        ReadingSummary {
            rssi_quality: SignalQuality::from_rssi(sample.rssi),
            snr_quality: SignalQuality::from_snr(sample.snr),
            tariff_rate,
            voltage_deviation,
        }
    }
}
