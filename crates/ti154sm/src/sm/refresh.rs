//! Coordinator bookkeeping for periodic key refresh and key recovery
//!
//! Every commissioned device carries a refresh status. The sweep picks the
//! first device still due for a refresh; once every device has been
//! attempted the cycle starts over. Devices whose keys were lost (for
//! example after a coordinator restore) are flagged for recommissioning and
//! handled one at a time by key recovery.

use super::error::ErrorCode;
use super::types::{DeviceDescriptor, ExtAddr};
use tracing::debug;

/// Key-refresh status of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshStatus {
    /// Due for a refresh
    Required,
    /// Refreshed (or tried) in the current cycle
    Attempted,
    /// Last run for this device failed
    Failed,
}

/// Recommissioning status of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecommissionStatus {
    NotRequired,
    /// Keys lost; commission again
    Required,
    /// Recommissioning started
    Attempted,
    /// Device did not answer; wait until it is heard from again
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    pub device: DeviceDescriptor,
    pub rx_on_idle: bool,
    pub refresh_status: RefreshStatus,
    /// Refreshes started for this device
    pub refresh_count: u32,
    pub recommission: RecommissionStatus,
}

/// Devices known to the coordinator
#[derive(Debug, Clone, Default)]
pub struct DeviceRoster {
    entries: Vec<RosterEntry>,
}

impl DeviceRoster {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, ext_addr: &ExtAddr) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.device.ext_addr == *ext_addr)
    }

    /// Add a device, or update the addressing of a known one
    pub fn register(&mut self, device: DeviceDescriptor, rx_on_idle: bool) -> &mut RosterEntry {
        let pos = match self.position(&device.ext_addr) {
            Some(pos) => {
                let entry = &mut self.entries[pos];
                entry.device = device;
                entry.rx_on_idle = rx_on_idle;
                pos
            }
            None => {
                self.entries.push(RosterEntry {
                    device,
                    rx_on_idle,
                    refresh_status: RefreshStatus::Required,
                    refresh_count: 0,
                    recommission: RecommissionStatus::NotRequired,
                });
                self.entries.len() - 1
            }
        };
        &mut self.entries[pos]
    }

    pub fn get(&self, ext_addr: &ExtAddr) -> Option<&RosterEntry> {
        self.position(ext_addr).map(|pos| &self.entries[pos])
    }

    pub fn get_mut(&mut self, ext_addr: &ExtAddr) -> Option<&mut RosterEntry> {
        self.position(ext_addr).map(move |pos| &mut self.entries[pos])
    }

    pub fn remove(&mut self, ext_addr: &ExtAddr) -> bool {
        match self.position(ext_addr) {
            Some(pos) => {
                self.entries.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &RosterEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Flag a device whose keys must be re-established
    pub fn require_recommission(&mut self, ext_addr: &ExtAddr) -> bool {
        match self.get_mut(ext_addr) {
            Some(entry) => {
                entry.recommission = RecommissionStatus::Required;
                true
            }
            None => false,
        }
    }

    /// Record a successful run. `new_key` is set when the seed table had no
    /// entry for the device before.
    pub fn record_success(
        &mut self,
        device: &DeviceDescriptor,
        rx_on_idle: bool,
        new_key: bool,
        refresh: bool,
    ) {
        let entry = self.register(*device, rx_on_idle);
        if new_key || !refresh {
            entry.refresh_status = RefreshStatus::Required;
            entry.refresh_count = 0;
            entry.recommission = RecommissionStatus::NotRequired;
        }
    }

    /// Record a failed run
    pub fn record_failure(&mut self, ext_addr: &ExtAddr, error: ErrorCode) {
        if let Some(entry) = self.get_mut(ext_addr) {
            entry.refresh_status = RefreshStatus::Failed;
            if error == ErrorCode::PeerUnresponsive
                && entry.recommission == RecommissionStatus::Attempted
            {
                entry.recommission = RecommissionStatus::Pending;
            }
        }
    }

    /// Pick the next device to refresh and mark it attempted. When none is
    /// due, every attempted device becomes due again and `None` is returned.
    pub fn next_refresh(&mut self) -> Option<RosterEntry> {
        let candidate = self.entries.iter_mut().find(|entry| {
            entry.refresh_status == RefreshStatus::Required
                && !matches!(
                    entry.recommission,
                    RecommissionStatus::Required | RecommissionStatus::Pending
                )
        });

        match candidate {
            Some(entry) => {
                entry.refresh_status = RefreshStatus::Attempted;
                entry.refresh_count = entry.refresh_count.saturating_add(1);
                Some(entry.clone())
            }
            None => {
                for entry in self.entries.iter_mut() {
                    if entry.refresh_status == RefreshStatus::Attempted {
                        entry.refresh_status = RefreshStatus::Required;
                    }
                }
                debug!("key refresh cycle complete");
                None
            }
        }
    }

    /// Pick the next device to recommission and mark it attempted
    pub fn next_recommission(&mut self) -> Option<RosterEntry> {
        let entry = self
            .entries
            .iter_mut()
            .find(|entry| entry.recommission == RecommissionStatus::Required)?;
        entry.recommission = RecommissionStatus::Attempted;
        Some(entry.clone())
    }
}
