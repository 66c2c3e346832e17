use crate::rows::Measurement;
use serde::{Deserialize, Serialize};

/// Messaging platform a target is probed through.
///
/// Each channel carries its own probe deadline and backoff window because the
/// platforms acknowledge deliveries at very different speeds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Whatsapp,
    Signal,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Whatsapp => "whatsapp",
            Channel::Signal => "signal",
        }
    }

    /// Parse from a string representation
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "whatsapp" | "wa" => Some(Channel::Whatsapp),
            "signal" | "sig" => Some(Channel::Signal),
            _ => None,
        }
    }

    /// Deadline for a delivery acknowledgement before the probe cycle is
    /// recorded as a timeout.
    pub fn probe_timeout_ms(&self) -> u64 {
        match self {
            Channel::Whatsapp => 10_000,
            Channel::Signal => 15_000,
        }
    }

    /// Inclusive bounds for the uniformly jittered inter-probe delay.
    pub fn backoff_range_ms(&self) -> (u64, u64) {
        match self {
            Channel::Whatsapp => (2_000, 5_000),
            Channel::Signal => (1_000, 2_000),
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable side-effect variant used for a probe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMethod {
    /// Retraction of a random, never-sent message id.
    #[default]
    Delete,
    /// Ephemeral reaction, added and immediately removed.
    Reaction,
    /// Zero-width message.
    Message,
}

impl ProbeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeMethod::Delete => "delete",
            ProbeMethod::Reaction => "reaction",
            ProbeMethod::Message => "message",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "delete" => Some(ProbeMethod::Delete),
            "reaction" => Some(ProbeMethod::Reaction),
            "message" => Some(ProbeMethod::Message),
            _ => None,
        }
    }
}

/// Derived responsiveness state for a target.
///
/// `Unknown` is the gated outcome: reported whenever confidence falls at or
/// below the gate, no matter what the raw samples look like.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TrackerState {
    Online,
    Standby,
    Offline,
    Unknown,
}

impl TrackerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackerState::Online => "online",
            TrackerState::Standby => "standby",
            TrackerState::Offline => "offline",
            TrackerState::Unknown => "unknown",
        }
    }

    pub fn from_str_loose(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "online" => TrackerState::Online,
            "standby" => TrackerState::Standby,
            "offline" => TrackerState::Offline,
            _ => TrackerState::Unknown,
        }
    }
}

/// A tracked (target, channel) pair as listed to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetInfo {
    pub target_id: String,
    pub channel: Channel,
    pub identifier: String,
}

/// Snapshot pushed to subscribers on every completed analysis run.
///
/// Clients render these fields as-is; state is never re-derived client-side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdatePayload {
    pub target_id: String,
    pub channel: Channel,
    /// RTT of the latest raw measurement; None when it timed out.
    pub rtt_ms: Option<i64>,
    pub state: TrackerState,
    pub confidence: f64,
    pub noise: f64,
    pub responsiveness: f64,
    /// Baseline median, once a baseline exists.
    pub median: Option<i64>,
    /// Baseline threshold (median + 1.5 * IQR), once a baseline exists.
    pub threshold: Option<f64>,
    /// Timestamp of the latest raw measurement.
    pub timestamp_ms: i64,
}

/// Events sent by a subscriber to the core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ClientEvent {
    AddTarget { identifier: String, channel: Channel },
    RemoveTarget { target_id: String },
    ListTargets,
    GetAvailableDays { target_id: String },
    GetRawForDay { target_id: String, day: String },
    SetProbeMethod { method: ProbeMethod },
}

/// Events sent by the core to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ServerEvent {
    TargetAdded {
        target_id: String,
        channel: Channel,
        identifier: String,
    },
    TargetRemoved {
        target_id: String,
    },
    Targets {
        targets: Vec<TargetInfo>,
    },
    Update(UpdatePayload),
    AvailableDays {
        target_id: String,
        days: Vec<String>,
    },
    RawForDay {
        target_id: String,
        day: String,
        rows: Vec<Measurement>,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        target_id: Option<String>,
    },
}
