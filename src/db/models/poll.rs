use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One telemetry snapshot of a device's association with an access point.
///
/// The same physical session is reported again at every poll while it is
/// still open, so many `RawPoll`s share one [`SessionKey`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RawPoll {
    pub entity: String,
    pub device: String,
    pub location: String,
    #[serde(default)]
    pub network: String,
    #[serde(default)]
    pub protocol: String,
    pub poll_time: DateTime<Utc>,
    pub start: DateTime<Utc>,
    /// `None` while the session is still open at `poll_time`.
    pub end: Option<DateTime<Utc>>,
    pub signal: i32,
}

impl RawPoll {
    pub fn key(&self) -> SessionKey {
        SessionKey {
            entity: self.entity.clone(),
            device: self.device.clone(),
            location: self.location.clone(),
            start: self.start,
        }
    }

    /// Clamp clock skew: neither the reported end nor the poll time may
    /// precede the session start.
    pub fn clamped(mut self) -> Self {
        if let Some(end) = self.end {
            if end < self.start {
                self.end = Some(self.start);
            }
        }
        if self.poll_time < self.start {
            self.poll_time = self.start;
        }
        self
    }
}

/// Identity of one physical session.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionKey {
    pub entity: String,
    pub device: String,
    pub location: String,
    pub start: DateTime<Utc>,
}
