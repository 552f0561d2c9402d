// SPDX-License-Identifier: Apache-2.0

//! The device registry.

use std::collections::HashMap;
use std::sync::Arc;

use bdus_config::limits::HARD_MAX_DEVICES;
use bdus_config::{DeviceConfig, SessionConfig};
use bdus_core::errno::EIO;
use bdus_core::sync::{Completion, Interruptor};
use bdus_core::{BlockRequest, Device, DeviceState};
use bdus_transceiver::Transceiver;
use parking_lot::{Condvar, Mutex};

use crate::error::Error;
use crate::session::Session;

pub(crate) struct DeviceEntry {
    pub(crate) device: Arc<Device>,
    pub(crate) attached: bool,
    /// Present while an attacher is waiting for the current session to
    /// detach; the releasing session signals it. At most one attachment may
    /// be in flight per device.
    pub(crate) on_detach: Option<Completion>,
}

impl Drop for DeviceEntry {
    fn drop(&mut self) {
        // An entry can be dropped with its device still live (registry
        // teardown); the inverter must be terminated before it goes away.
        self.device.terminate();
    }
}

#[derive(Default)]
pub(crate) struct Registry {
    pub(crate) devices: HashMap<u64, DeviceEntry>,
    next_id: u64,
}

pub(crate) struct ControlShared {
    pub(crate) registry: Mutex<Registry>,
    /// Signalled when a device is removed from the registry.
    pub(crate) destroyed: Condvar,
}

impl ControlShared {
    // Must be called with the registry lock held.
    pub(crate) fn destroy_device(&self, registry: &mut Registry, device_id: u64) {
        if let Some(entry) = registry.devices.remove(&device_id) {
            entry.device.terminate();
            let _ = self.destroyed.notify_all();
            tracing::info!(device_id, "device destroyed");
        }
    }
}

/// The registry of live devices.
///
/// Cheap to clone; clones operate on the same registry.
#[derive(Clone)]
pub struct Control {
    shared: Arc<ControlShared>,
}

impl Default for Control {
    fn default() -> Self {
        Self::new()
    }
}

impl Control {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(ControlShared {
                registry: Mutex::new(Registry::default()),
                destroyed: Condvar::new(),
            }),
        }
    }

    /// Creates a device and attaches the caller to it.
    ///
    /// Both configurations are validated and updated in place with their
    /// normalized values, including the device's assigned `id`, so the
    /// caller observes the effective configuration.
    pub fn create_device(
        &self,
        config: &mut DeviceConfig,
        session_config: &mut SessionConfig,
    ) -> Result<Session, Error> {
        config.validate_and_adjust()?;
        session_config.adjust(config);

        let mut registry = self.shared.registry.lock();

        if registry.devices.len() >= HARD_MAX_DEVICES {
            return Err(Error::TooManyDevices);
        }

        let device_id = registry.next_id;
        registry.next_id += 1;
        config.id = device_id;

        let device = Arc::new(Device::new(config.clone()));
        let transceiver = Transceiver::new(Arc::clone(&device), session_config)?;

        device.make_available();

        let previous = registry.devices.insert(
            device_id,
            DeviceEntry {
                device: Arc::clone(&device),
                attached: true,
                on_detach: None,
            },
        );
        debug_assert!(previous.is_none());

        tracing::info!(device_id, "device created");

        Ok(Session::new(
            Arc::clone(&self.shared),
            device_id,
            device,
            transceiver,
        ))
    }

    /// Attaches to an existing device, taking over from its current
    /// session if it has one.
    ///
    /// If a session is attached, it is asked to flush and terminate and
    /// this call blocks until it detaches; the device is then reactivated,
    /// so the new session receives the formerly in-flight requests first.
    /// Firing `interruptor` cancels the wait: the call returns
    /// [`Error::Interrupted`] and the hand-over slot is released, though
    /// the previous session may or may not have detached by then.
    pub fn attach_to_device(
        &self,
        device_id: u64,
        session_config: &mut SessionConfig,
        interruptor: &Interruptor,
    ) -> Result<Session, Error> {
        let mut registry = self.shared.registry.lock();

        let entry = registry
            .devices
            .get_mut(&device_id)
            .ok_or(Error::DeviceNotFound { device_id })?;

        if entry.device.state() == DeviceState::Unavailable {
            return Err(Error::DeviceNotAvailable { device_id });
        }

        if entry.on_detach.is_some() {
            return Err(Error::AttachmentInProgress { device_id });
        }

        if entry.attached {
            if entry.device.state() != DeviceState::Terminated {
                entry.device.deactivate(true);
            }

            let on_detach = Completion::new();
            entry.on_detach = Some(on_detach.clone());

            // Wait for the attached session to detach. The completion is
            // counting, so a detach between unlock and wait is not lost.
            drop(registry);
            let wait_result = on_detach.wait(interruptor);
            registry = self.shared.registry.lock();

            if let Some(entry) = registry.devices.get_mut(&device_id) {
                entry.on_detach = None;
            }

            if wait_result.is_err() {
                // The previous session may or may not have detached in the
                // meantime.
                let still_attached = registry
                    .devices
                    .get(&device_id)
                    .is_some_and(|entry| entry.attached);

                if still_attached {
                    return Err(Error::Interrupted);
                }
            }

            let Some(entry) = registry.devices.get_mut(&device_id) else {
                return Err(Error::DeviceNotFound { device_id });
            };

            if entry.device.state() == DeviceState::Terminated {
                self.shared.destroy_device(&mut registry, device_id);
                return Err(Error::DeviceNotFound { device_id });
            }
        }

        let entry = registry
            .devices
            .get_mut(&device_id)
            .ok_or(Error::DeviceNotFound { device_id })?;

        debug_assert_eq!(entry.device.state(), DeviceState::Inactive);

        let device = Arc::clone(&entry.device);
        session_config.adjust(device.config());

        let transceiver = match Transceiver::new(Arc::clone(&device), session_config) {
            Ok(transceiver) => transceiver,
            Err(error) => {
                if !device.config().recoverable {
                    self.shared.destroy_device(&mut registry, device_id);
                }
                return Err(Error::Region(error));
            }
        };

        device.activate();

        let entry = registry
            .devices
            .get_mut(&device_id)
            .ok_or(Error::DeviceNotFound { device_id })?;
        entry.attached = true;

        tracing::info!(device_id, "session attached");

        Ok(Session::new(
            Arc::clone(&self.shared),
            device_id,
            device,
            transceiver,
        ))
    }

    /// The adjusted configuration of a live device.
    pub fn device_config(&self, device_id: u64) -> Result<DeviceConfig, Error> {
        let registry = self.shared.registry.lock();

        registry
            .devices
            .get(&device_id)
            .map(|entry| entry.device.config().clone())
            .ok_or(Error::DeviceNotFound { device_id })
    }

    /// Flushes a device: submits a flush request and waits for the driver
    /// to complete it. Succeeds immediately when the device does not
    /// support flushing.
    pub fn flush_device(&self, device_id: u64) -> Result<(), Error> {
        let device = {
            let registry = self.shared.registry.lock();
            registry
                .devices
                .get(&device_id)
                .map(|entry| Arc::clone(&entry.device))
                .ok_or(Error::DeviceNotFound { device_id })?
        };

        if !device.config().supports_flush {
            return Ok(());
        }

        let (request, finished) = BlockRequest::flush();

        // A failed submission also completes through the channel.
        let _ = device.submit_request(request);

        let outcome = finished
            .recv()
            .map_err(|_| Error::DeviceError { errno: -EIO })?;

        if outcome.error != 0 {
            return Err(Error::DeviceError {
                errno: outcome.error,
            });
        }

        Ok(())
    }

    /// Terminates a device. If no session is attached the device is
    /// destroyed immediately; otherwise destruction completes when its
    /// session detaches.
    pub fn trigger_device_destruction(&self, device_id: u64) -> Result<(), Error> {
        let mut registry = self.shared.registry.lock();

        let entry = registry
            .devices
            .get(&device_id)
            .ok_or(Error::DeviceNotFound { device_id })?;

        entry.device.terminate();

        if !entry.attached {
            self.shared.destroy_device(&mut registry, device_id);
        }

        Ok(())
    }

    /// Blocks until the device no longer exists. Returns immediately for
    /// ids that do not resolve.
    pub fn wait_until_device_is_destroyed(&self, device_id: u64) {
        let mut registry = self.shared.registry.lock();

        while registry.devices.contains_key(&device_id) {
            self.shared.destroyed.wait(&mut registry);
        }
    }

    /// The number of live devices.
    pub fn device_count(&self) -> usize {
        self.shared.registry.lock().devices.len()
    }
}
