use crate::protocol::{Channel, ProbeMethod, TrackerState};
use serde::{Deserialize, Serialize};

/// One completed probe cycle. Append-only; rows are never mutated or
/// deleted once written.
///
/// Invariant: `timeout == true` exactly when `target_rtt_ms` is None.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Measurement {
    pub timestamp_ms: i64,
    pub channel: Channel,
    pub target_id: String,
    pub target_rtt_ms: Option<i64>,
    pub timeout: bool,
    /// Snapshot of the local-network control RTT at probe start.
    pub local_network_rtt_ms: Option<i64>,
    pub probe_method: ProbeMethod,
}

/// One control probe against the reference endpoint. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocalNetworkSample {
    pub timestamp_ms: i64,
    pub rtt_ms: Option<i64>,
    pub timeout: bool,
    /// Standard deviation of valid RTTs in the monitor's rolling window
    /// at record time.
    pub variance_ms: i64,
    pub packet_loss_rate: f64,
    pub reference_target: String,
}

/// Per-target rolling statistical model over recent successful RTTs.
///
/// A row exists only once at least 10 successful samples have been seen.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Baseline {
    pub target_id: String,
    pub channel: Channel,
    pub min_rtt_ms: i64,
    pub median_rtt_ms: i64,
    /// q3 - q1, never negative.
    pub iqr_ms: i64,
    pub updated_at_ms: i64,
    pub sample_count: i64,
}

impl Baseline {
    /// Responsiveness threshold: median + 1.5 * IQR.
    ///
    /// Single definition so the analysis scorer and the subscriber payload
    /// cannot disagree on the formula.
    pub fn threshold(&self) -> f64 {
        self.median_rtt_ms as f64 + 1.5 * self.iqr_ms as f64
    }
}

/// Scores derived for one analysis window. Append-only but re-derivable;
/// the newest row per target wins for live display.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisWindow {
    pub start_ms: i64,
    pub end_ms: i64,
    pub target_id: String,
    pub channel: Channel,
    pub sample_count: i64,
    pub noise_score: f64,
    pub responsiveness_score: f64,
    pub confidence_score: f64,
    pub derived_state: TrackerState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baseline_threshold() {
        let baseline = Baseline {
            target_id: "t".to_string(),
            channel: Channel::Whatsapp,
            min_rtt_ms: 90,
            median_rtt_ms: 150,
            iqr_ms: 40,
            updated_at_ms: 0,
            sample_count: 20,
        };
        assert_eq!(baseline.threshold(), 210.0);
    }

    #[test]
    fn test_measurement_serialization() {
        let row = Measurement {
            timestamp_ms: 1000,
            channel: Channel::Signal,
            target_id: "signal:49171123456".to_string(),
            target_rtt_ms: None,
            timeout: true,
            local_network_rtt_ms: Some(20),
            probe_method: ProbeMethod::Delete,
        };
        let json = serde_json::to_string(&row).unwrap();
        let back: Measurement = serde_json::from_str(&json).unwrap();
        assert_eq!(row, back);
    }
}
