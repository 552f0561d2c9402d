// SPDX-License-Identifier: Apache-2.0

//! Errors for the control crate.

/// Errors that can occur while operating the device registry.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The device configuration was rejected by validation.
    #[error("invalid device configuration")]
    InvalidConfig(#[from] bdus_config::Error),

    /// The hard cap on simultaneously existing devices was reached.
    #[error("too many devices")]
    TooManyDevices,

    /// No device with this id exists (it was destroyed, or never created).
    #[error("device {device_id} does not exist")]
    DeviceNotFound {
        /// The id that did not resolve.
        device_id: u64,
    },

    /// The device has not yet become available to clients.
    #[error("device {device_id} is not yet available")]
    DeviceNotAvailable {
        /// The id of the device.
        device_id: u64,
    },

    /// Another attachment to this device is already in flight.
    #[error("another attachment to device {device_id} is in progress")]
    AttachmentInProgress {
        /// The id of the device.
        device_id: u64,
    },

    /// The wait for the previous session to detach was interrupted.
    ///
    /// The hand-over slot is released; the attachment can be retried.
    #[error("attachment wait was interrupted")]
    Interrupted,

    /// The session's shared region could not be allocated.
    #[error("failed to allocate shared region")]
    Region(#[from] std::io::Error),

    /// The device completed a control-issued request with a failure.
    #[error("device reported errno {errno}")]
    DeviceError {
        /// The negated errno the device reported.
        errno: i32,
    },
}
