// SPDX-License-Identifier: Apache-2.0

//! Worker session configuration.

use serde::{Deserialize, Serialize};

use crate::device::DeviceConfig;

/// Configuration for one worker session attached to a device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// How many preallocated, worker-mappable payload buffers the session's
    /// shared region should contain.
    ///
    /// May be 0, in which case every payload travels through buffers the
    /// worker supplies itself. Adjustment clamps this to the device's
    /// *adjusted* `max_outstanding_reqs`, since no more than that many
    /// payloads can be in flight.
    pub num_preallocated_buffers: u32,
}

impl SessionConfig {
    /// Clamps this configuration against an already-adjusted device
    /// configuration.
    pub fn adjust(&mut self, device: &DeviceConfig) {
        self.num_preallocated_buffers = self
            .num_preallocated_buffers
            .min(device.max_outstanding_reqs);
    }
}
