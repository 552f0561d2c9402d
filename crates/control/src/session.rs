// SPDX-License-Identifier: Apache-2.0

//! Worker sessions.

use std::sync::Arc;

use bdus_core::sync::Interruptor;
use bdus_core::{Device, DeviceState};
use bdus_transceiver::Transceiver;

use crate::control::ControlShared;

/// One worker session attached to a device.
///
/// The session wraps the transceiver for the attachment and decides the
/// device's fate when it ends: dropping the session (or calling
/// [`Session::detach`]) runs the release protocol. A non-recoverable
/// device whose session did not end in an orderly way is terminated and
/// destroyed, while recoverable devices and orderly exits leave the device
/// inactive with its in-flight work preserved.
pub struct Session {
    shared: Arc<ControlShared>,
    device_id: u64,
    device: Arc<Device>,
    transceiver: Transceiver,
    interruptor: Interruptor,
    successful: bool,
    released: bool,
}

impl Session {
    pub(crate) fn new(
        shared: Arc<ControlShared>,
        device_id: u64,
        device: Arc<Device>,
        transceiver: Transceiver,
    ) -> Self {
        let interruptor = Interruptor::new();

        Self {
            shared,
            device_id,
            device,
            transceiver,
            interruptor,
            successful: false,
            released: false,
        }
    }

    /// The id of the attached device.
    pub fn device_id(&self) -> u64 {
        self.device_id
    }

    /// The attached device.
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// The session's transceiver, for direct record and buffer access.
    pub fn transceiver(&mut self) -> &mut Transceiver {
        &mut self.transceiver
    }

    /// An interruptor for this session's waits; clone it to another thread
    /// to cancel a blocked receive.
    pub fn interruptor(&self) -> Interruptor {
        self.interruptor.clone()
    }

    /// Waits for the next item and projects it into the record at
    /// `record_index`. See [`Transceiver::receive_item`].
    pub fn receive_item(
        &mut self,
        record_index: u32,
        worker_buffer: Option<&mut [u8]>,
    ) -> Result<(), bdus_transceiver::Error> {
        self.transceiver
            .receive_item(record_index, &self.interruptor, worker_buffer)
    }

    /// Sends the reply held in the record at `record_index`. See
    /// [`Transceiver::send_reply`].
    pub fn send_reply(
        &mut self,
        record_index: u32,
        worker_buffer: Option<&[u8]>,
    ) -> Result<(), bdus_transceiver::Error> {
        self.transceiver.send_reply(record_index, worker_buffer)
    }

    /// Sends a reply and receives the next item in one call. See
    /// [`Transceiver::send_reply_and_receive_item`].
    pub fn send_reply_and_receive_item(
        &mut self,
        record_index: u32,
        reply_buffer: Option<&[u8]>,
        item_buffer: Option<&mut [u8]>,
    ) -> Result<(), bdus_transceiver::Error> {
        self.transceiver.send_reply_and_receive_item(
            record_index,
            &self.interruptor,
            reply_buffer,
            item_buffer,
        )
    }

    /// Marks this session's exit as orderly.
    ///
    /// A non-recoverable device survives the detach of a successful
    /// session long enough for a replacement to take over; without this
    /// mark, its detach terminates the device.
    pub fn mark_as_successful(&mut self) {
        self.successful = true;
    }

    /// Detaches from the device, running the release protocol.
    ///
    /// Equivalent to dropping the session.
    pub fn detach(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let mut registry = self.shared.registry.lock();

        let on_detach = {
            let Some(entry) = registry.devices.get_mut(&self.device_id) else {
                return;
            };
            entry.attached = false;
            entry.on_detach.clone()
        };

        let recoverable = self.device.config().recoverable;
        let orderly = recoverable || self.successful;

        match self.device.state() {
            DeviceState::Unavailable => {
                // Never became available: nothing can be waiting for it.
                self.shared.destroy_device(&mut registry, self.device_id);
            }
            DeviceState::Active => {
                if orderly {
                    self.device.deactivate(false);
                } else {
                    self.device.terminate();
                }

                if let Some(on_detach) = on_detach {
                    on_detach.notify_one();
                } else if !recoverable {
                    self.shared.destroy_device(&mut registry, self.device_id);
                }
            }
            DeviceState::Inactive => {
                if !orderly {
                    self.device.terminate();
                }

                if let Some(on_detach) = on_detach {
                    on_detach.notify_one();
                } else if !recoverable {
                    self.shared.destroy_device(&mut registry, self.device_id);
                }
            }
            DeviceState::Terminated => {
                if let Some(on_detach) = on_detach {
                    on_detach.notify_one();
                } else {
                    self.shared.destroy_device(&mut registry, self.device_id);
                }
            }
        }

        tracing::debug!(device_id = self.device_id, "session detached");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.release();
    }
}
