//! Database model types.

use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;

/// Index of a host in the roster.
pub type HostId = usize;

/// Highest population ever observed for a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordData {
    pub player_count: u32,
    pub timestamp: Timestamp,
}

impl RecordData {
    pub fn new(player_count: u32, timestamp: Timestamp) -> Self {
        Self {
            player_count,
            timestamp,
        }
    }

    /// Whether `candidate` should replace `current`.
    pub fn beats(candidate: &RecordData, current: Option<&RecordData>) -> bool {
        current.map_or(true, |c| candidate.player_count > c.player_count)
    }
}

/// One tick's observation of one host, keyed by host address rather than
/// roster index. `None` means the host did not respond.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSample {
    pub timestamp: Timestamp,
    pub host: String,
    pub player_count: Option<u32>,
}
