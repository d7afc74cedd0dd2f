//! Display-ready connection status

use crate::services::connectivity::ConnectionState;
use std::time::Duration;
use tokio::time::Instant;

/// Periodic refresh cadence of the status display
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(2);

const RSSI_FLOOR: i32 = -100;
const RSSI_CEILING: i32 = -50;

/// Map a signal strength in dBm to a 0-100 quality percentage
pub fn signal_quality(rssi: i32) -> u8 {
    if rssi <= RSSI_FLOOR {
        0
    } else if rssi >= RSSI_CEILING {
        100
    } else {
        (2 * (rssi - RSSI_FLOOR)) as u8
    }
}

/// Derives status snapshots on a fixed cadence or right after a change
#[derive(Default)]
pub struct StatusReporter {
    dirty: bool,
    last_refresh: Option<Instant>,
}

impl StatusReporter {
    pub fn new() -> Self {
        Self {
            dirty: true,
            last_refresh: None,
        }
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.dirty
            || self
                .last_refresh
                .is_none_or(|last| now.duration_since(last) >= REFRESH_INTERVAL)
    }

    pub fn next_refresh(&self) -> Instant {
        match self.last_refresh {
            Some(last) if !self.dirty => last + REFRESH_INTERVAL,
            _ => Instant::now(),
        }
    }

    /// Snapshot of `state` with the signal quality filled in
    pub fn refresh(&mut self, state: &ConnectionState, rssi: i32, now: Instant) -> ConnectionState {
        self.dirty = false;
        self.last_refresh = Some(now);

        ConnectionState {
            signal_quality: if state.is_connected() {
                signal_quality(rssi)
            } else {
                0
            },
            ..state.clone()
        }
    }
}
