//! Backoff between registry watch attempts

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff applied when the registry watch fails
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchBackoff {
    /// Delay after the first failure
    #[serde(rename = "initial_ms", with = "millis", default = "default_initial")]
    pub initial: Duration,
    /// Upper bound for any delay
    #[serde(rename = "max_ms", with = "millis", default = "default_max")]
    pub max: Duration,
}

impl Default for WatchBackoff {
    fn default() -> Self {
        Self {
            initial: default_initial(),
            max: default_max(),
        }
    }
}

impl WatchBackoff {
    /// Delay before retrying after `attempt` consecutive failures (0-based)
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let base = self.initial.as_millis() as u64;
        let exponential = 2u64.saturating_pow(attempt);
        let backoff_ms = base
            .saturating_mul(exponential)
            .min(self.max.as_millis() as u64);
        Duration::from_millis(backoff_ms)
    }
}

fn default_initial() -> Duration {
    Duration::from_secs(1)
}

fn default_max() -> Duration {
    Duration::from_secs(30)
}

pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
