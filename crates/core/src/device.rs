// SPDX-License-Identifier: Apache-2.0

//! The device: one inverter gated by a four-state lifecycle.
//!
//! The state word is only an authority over *external* transitions
//! (attachment, hand-over, destruction); request-path operations never
//! consult it and go by the inverter's flags instead, so lifecycle
//! transitions do not serialize against the hot paths.

use std::sync::atomic::{AtomicU32, Ordering};

use bdus_config::DeviceConfig;
use bytes::BytesMut;

use crate::error::{IoctlError, SubmitError};
use crate::inverter::{Inverter, RequestHandle, TimeoutDecision};
use crate::request::{BlockRequest, RequestPayload};
use crate::{errno, ioc};

/// Lifecycle states of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DeviceState {
    /// Created but not yet available to clients.
    Unavailable = 0,
    /// Available, with a worker session attached.
    Active = 1,
    /// Available, but its worker session went away; in-flight work is held
    /// for the next session.
    Inactive = 2,
    /// Terminated; only destruction follows.
    Terminated = 3,
}

fn decode_state(value: u32) -> DeviceState {
    match value {
        0 => DeviceState::Unavailable,
        1 => DeviceState::Active,
        2 => DeviceState::Inactive,
        _ => DeviceState::Terminated,
    }
}

/// A BDUS device: an adjusted configuration, a lifecycle state, and the
/// inverter carrying its requests.
pub struct Device {
    config: DeviceConfig,
    state: AtomicU32,
    inverter: Inverter,
}

impl Device {
    /// Creates a device from a validated and adjusted configuration.
    ///
    /// The device starts [`DeviceState::Unavailable`]; call
    /// [`Device::make_available`] once it is registered with its
    /// surroundings.
    pub fn new(config: DeviceConfig) -> Self {
        let inverter = Inverter::new(&config);

        Self {
            config,
            state: AtomicU32::new(DeviceState::Unavailable as u32),
            inverter,
        }
    }

    /// The device's adjusted configuration.
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// The device's current lifecycle state.
    pub fn state(&self) -> DeviceState {
        decode_state(self.state.load(Ordering::Acquire))
    }

    /// The device's inverter.
    pub fn inverter(&self) -> &Inverter {
        &self.inverter
    }

    /// Whether the device accepts no mutating request type.
    pub fn is_read_only(&self) -> bool {
        self.config.is_read_only()
    }

    /// Marks the device available: injects the device-available
    /// notification and moves `Unavailable` to `Active`.
    ///
    /// A device that was terminated before becoming available stays
    /// terminated.
    pub fn make_available(&self) {
        self.inverter.submit_device_available_notification();

        let _ = self.state.compare_exchange(
            DeviceState::Unavailable as u32,
            DeviceState::Active as u32,
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        tracing::debug!(device_id = self.config.id, "device available");
    }

    /// Terminates the device. Definitive and idempotent.
    pub fn terminate(&self) {
        self.state
            .store(DeviceState::Terminated as u32, Ordering::Release);
        self.inverter.terminate();

        tracing::debug!(device_id = self.config.id, "device terminated");
    }

    /// Moves `Active` to `Inactive`, deactivating the inverter.
    pub fn deactivate(&self, flush: bool) {
        let old = self
            .state
            .swap(DeviceState::Inactive as u32, Ordering::AcqRel);
        debug_assert_eq!(decode_state(old), DeviceState::Active);

        self.inverter.deactivate(flush);

        tracing::debug!(device_id = self.config.id, flush, "device deactivated");
    }

    /// Moves `Inactive` to `Active`, reactivating the inverter and
    /// re-injecting the device-available notification for the new worker.
    pub fn activate(&self) {
        let old = self.state.swap(DeviceState::Active as u32, Ordering::AcqRel);
        debug_assert_eq!(decode_state(old), DeviceState::Inactive);

        self.inverter.activate();
        self.inverter.submit_device_available_notification();

        tracing::debug!(device_id = self.config.id, "device activated");
    }

    /// Submits a block request to the device's inverter.
    pub fn submit_request(&self, request: BlockRequest) -> Result<RequestHandle, SubmitError> {
        self.inverter.submit_request(request)
    }

    /// Forwards a block-layer timeout to the inverter.
    pub fn timeout_request(&self, handle: RequestHandle) -> TimeoutDecision {
        self.inverter.timeout_request(handle)
    }

    /// Executes an ioctl against the device, blocking until the driver
    /// replies.
    ///
    /// `argument` must be exactly as large as the size encoded in
    /// `command`. For commands whose direction includes `READ` the buffer's
    /// contents are handed to the driver; for directions including `WRITE`
    /// the buffer is updated with the driver's reply on success.
    pub fn execute_ioctl(&self, command: u32, argument: &mut [u8]) -> Result<(), IoctlError> {
        if !ioc::is_valid_command(command) {
            return Err(IoctlError::InvalidCommand { command });
        }

        let arg_size = ioc::size(command) as usize;
        if argument.len() != arg_size {
            return Err(IoctlError::ArgumentSizeMismatch {
                expected: arg_size,
                got: argument.len(),
            });
        }

        let mut buffer = BytesMut::zeroed(arg_size);
        if ioc::dir(command) & ioc::READ != 0 {
            buffer.copy_from_slice(argument);
        }

        let (request, finished) = BlockRequest::ioctl(command, buffer);

        // A failed submission also completes through the channel, with the
        // ioctl-channel errno already in place.
        let _ = self.inverter.submit_request(request);

        let outcome = finished.recv().map_err(|_| IoctlError::Driver {
            errno: -errno::EIO,
        })?;

        if outcome.error_ioctl != 0 {
            return Err(IoctlError::Driver {
                errno: outcome.error_ioctl,
            });
        }

        if ioc::dir(command) & ioc::WRITE != 0 {
            if let RequestPayload::Buffer(reply) = outcome.request.payload() {
                argument.copy_from_slice(&reply.lock());
            }
        }

        Ok(())
    }
}
