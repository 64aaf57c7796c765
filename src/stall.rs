//! Stall classification.
//!
//! | backend status | threshold | native timers | outcome |
//! |---|---|---|---|
//! | not downloading | any | any | backend status |
//! | downloading | none | any | downloading |
//! | downloading | `h` | present | stalled when no complete copy was seen for `h` and nothing was received for `h` (if nothing was ever received: active for `h`) |
//! | downloading | `h` | absent | stalled when the byte count equals the stored one and the stored change is older than `h` |
//!
//! Stored progress is only consulted when the backend has no timers of its
//! own.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::persistence::ProgressSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TorrentStatus {
    Downloading,
    Stalled,
    Finished,
    Unknown,
}

/// Timers a backend keeps on its own, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeTimers {
    /// Unix time a complete copy was last seen in the swarm, 0 if never.
    pub last_seen_complete: i64,
    /// Seconds since payload was last received, -1 if never.
    pub time_since_download: i64,
    pub active_time: i64,
}

/// What a backend reported for one torrent, before stall classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub status: TorrentStatus,
    pub bytes: Option<u64>,
    pub timers: Option<NativeTimers>,
}

pub fn classify(
    observation: &Observation,
    prior: Option<&ProgressSnapshot>,
    threshold_hours: Option<u32>,
    now: DateTime<Utc>,
) -> TorrentStatus {
    if observation.status != TorrentStatus::Downloading {
        return observation.status;
    }
    let Some(hours) = threshold_hours else {
        return TorrentStatus::Downloading;
    };
    let threshold = i64::from(hours) * 3600;

    let stalled = match observation.timers {
        Some(timers) => timers_stalled(&timers, threshold, now),
        None => bytes_stalled(observation.bytes, prior, threshold, now),
    };

    if stalled {
        TorrentStatus::Stalled
    } else {
        TorrentStatus::Downloading
    }
}

fn timers_stalled(timers: &NativeTimers, threshold: i64, now: DateTime<Utc>) -> bool {
    let no_seeder = timers.last_seen_complete == 0
        || now.timestamp() > timers.last_seen_complete + threshold;

    let idle = if timers.time_since_download == -1 {
        timers.active_time > threshold
    } else {
        timers.time_since_download > threshold
    };

    no_seeder && idle
}

fn bytes_stalled(
    bytes: Option<u64>,
    prior: Option<&ProgressSnapshot>,
    threshold: i64,
    now: DateTime<Utc>,
) -> bool {
    let (Some(bytes), Some(prior)) = (bytes, prior) else {
        return false;
    };
    match (prior.progress, prior.time) {
        (Some(progress), Some(changed)) => {
            bytes == progress && (now - changed).num_seconds() > threshold
        }
        _ => false,
    }
}
