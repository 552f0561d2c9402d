// SPDX-License-Identifier: Apache-2.0

//! Receive, reply, and combined flows between the inverter and the shared
//! region.

use std::io;
use std::sync::Arc;

use bdus_config::SessionConfig;
use bdus_core::errno::{EIO, REPLY_ABORT};
use bdus_core::sync::Interruptor;
use bdus_core::{BlockOp, Device, Item, RequestPayload, ioc};

use crate::error::Error;
use crate::region::SharedRegion;

/// The transceiver for one worker session: marshals items into the shared
/// region and replies out of it, driving the device's inverter through the
/// begin/commit/abort protocol.
pub struct Transceiver {
    device: Arc<Device>,
    region: SharedRegion,
}

impl Transceiver {
    /// Allocates a transceiver (and its shared region) for one session
    /// against `device`.
    pub fn new(device: Arc<Device>, session: &SessionConfig) -> io::Result<Self> {
        let region = SharedRegion::new(device.config(), session)?;
        Ok(Self { device, region })
    }

    /// The device this transceiver serves.
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// The session's shared region.
    pub fn region(&self) -> &SharedRegion {
        &self.region
    }

    /// The session's shared region, mutably. Workers use this to fill in a
    /// record's routing fields and reply view, and to access payload
    /// buffers.
    pub fn region_mut(&mut self) -> &mut SharedRegion {
        &mut self.region
    }

    /// Waits for the next item and projects it into the record at
    /// `record_index`.
    ///
    /// The record's routing fields decide where a payload lands: its
    /// preallocated buffer, or `worker_buffer` when preallocated-buffer
    /// mode is off. On success the get is committed; on failure it is
    /// aborted, so the item becomes visible to consumers again.
    pub fn receive_item(
        &mut self,
        record_index: u32,
        interruptor: &Interruptor,
        worker_buffer: Option<&mut [u8]>,
    ) -> Result<(), Error> {
        if record_index >= self.region.num_records() {
            return Err(Error::InvalidRecordIndex {
                index: record_index,
            });
        }

        let item = self.device.inverter().begin_item_get(interruptor)?;

        match self.project_item(&item, record_index, worker_buffer) {
            Ok(()) => {
                self.device.inverter().commit_item_get(&item);
                Ok(())
            }
            Err(error) => {
                self.device.inverter().abort_item_get(&item);
                Err(error)
            }
        }
    }

    /// Sends the reply held in the record at `record_index`.
    ///
    /// A record whose `handle_index` is 0 carries no reply and succeeds
    /// immediately; a reply whose handle went stale (the request timed out
    /// or was cancelled) also succeeds silently. On a successful reply the
    /// payload for read and driver-written ioctl arguments is copied back
    /// into the block request, from the record's preallocated buffer or
    /// from `worker_buffer`, before the completion is committed.
    pub fn send_reply(
        &mut self,
        record_index: u32,
        worker_buffer: Option<&[u8]>,
    ) -> Result<(), Error> {
        let (handle_index, handle_seqnum, use_prealloc, buffer_index, error) = {
            let record = self
                .region
                .record(record_index)
                .ok_or(Error::InvalidRecordIndex {
                    index: record_index,
                })?;
            (
                record.handle_index,
                record.handle_seqnum,
                record.use_preallocated_buffer != 0,
                record.user_ptr_or_buffer_index,
                record.error(),
            )
        };

        if handle_index == 0 {
            return Ok(());
        }

        let begun = match self
            .device
            .inverter()
            .begin_item_completion(handle_index, handle_seqnum)
        {
            Err(_) => return Err(Error::InvalidReply),
            Ok(None) => return Ok(()), // timed out, cancelled, or completed
            Ok(Some(item)) => item,
        };

        if error == REPLY_ABORT {
            // The driver is unrecoverable: the whole device goes down with
            // it, whether or not it is recoverable. Terminating first makes
            // the commit cancel the slot like every other in-flight request.
            self.device.terminate();
            self.device.inverter().commit_item_completion(&begun, -EIO);
            return Err(Error::DriverAborted);
        }

        if error == 0 {
            if let Err(copy_error) =
                self.copy_reply_payload(&begun, use_prealloc, buffer_index, worker_buffer)
            {
                self.device.inverter().abort_item_completion(&begun);
                return Err(copy_error);
            }
        }

        self.device.inverter().commit_item_completion(&begun, -error);
        Ok(())
    }

    /// Sends the record's reply, then receives the next item into the same
    /// record: one round trip per request.
    pub fn send_reply_and_receive_item(
        &mut self,
        record_index: u32,
        interruptor: &Interruptor,
        reply_buffer: Option<&[u8]>,
        item_buffer: Option<&mut [u8]>,
    ) -> Result<(), Error> {
        self.send_reply(record_index, reply_buffer)?;
        self.receive_item(record_index, interruptor, item_buffer)
    }

    // Projects `item` into the record and copies its device-ward payload
    // into the chosen buffer.
    fn project_item(
        &mut self,
        item: &Item,
        record_index: u32,
        worker_buffer: Option<&mut [u8]>,
    ) -> Result<(), Error> {
        let (buffer_index, use_prealloc) = {
            let record = self
                .region
                .record(record_index)
                .ok_or(Error::InvalidRecordIndex {
                    index: record_index,
                })?;
            (
                record.user_ptr_or_buffer_index,
                record.use_preallocated_buffer != 0,
            )
        };

        if let Some(record) = self.region.record_mut(record_index) {
            record.handle_seqnum = item.handle_seqnum();
            record.handle_index = item.handle_index();
            record.set_item_type(item.item_type());
        }

        let Some(request) = item.request() else {
            // Synthetic items carry no payload or arguments.
            return Ok(());
        };

        match *request.op() {
            BlockOp::Write { offset, len }
            | BlockOp::WriteSame { offset, len }
            | BlockOp::FuaWrite { offset, len } => {
                let RequestPayload::Data(data) = request.payload() else {
                    debug_assert!(false, "write-family request without data payload");
                    return Ok(());
                };

                let dest = payload_dest(
                    &mut self.region,
                    use_prealloc,
                    buffer_index,
                    worker_buffer,
                    data.len(),
                )?;
                dest.copy_from_slice(data);

                if let Some(record) = self.region.record_mut(record_index) {
                    record.arg64 = offset;
                    record.set_arg32(len);
                }
            }
            BlockOp::Read { offset, len }
            | BlockOp::WriteZeros { offset, len, .. }
            | BlockOp::Discard { offset, len }
            | BlockOp::SecureErase { offset, len } => {
                if let Some(record) = self.region.record_mut(record_index) {
                    record.arg64 = offset;
                    record.set_arg32(len);
                }
            }
            BlockOp::Flush => {}
            BlockOp::Ioctl { command } => {
                if let Some(record) = self.region.record_mut(record_index) {
                    record.set_arg32(command);
                }

                let size = ioc::size(command) as usize;

                if ioc::dir(command) & ioc::READ != 0 {
                    let RequestPayload::Buffer(argument) = request.payload() else {
                        debug_assert!(false, "ioctl request without argument buffer");
                        return Ok(());
                    };

                    let argument = argument.lock();
                    let dest = payload_dest(
                        &mut self.region,
                        use_prealloc,
                        buffer_index,
                        worker_buffer,
                        size,
                    )?;
                    dest.copy_from_slice(&argument[..size]);
                } else if ioc::dir(command) & ioc::WRITE != 0 {
                    // Driver-written argument: present a clean buffer.
                    let dest = payload_dest(
                        &mut self.region,
                        use_prealloc,
                        buffer_index,
                        worker_buffer,
                        size,
                    )?;
                    dest.fill(0);
                }
            }
        }

        Ok(())
    }

    // Copies the reply payload of a successful completion back into the
    // block request.
    fn copy_reply_payload(
        &self,
        item: &Item,
        use_prealloc: bool,
        buffer_index: u64,
        worker_buffer: Option<&[u8]>,
    ) -> Result<(), Error> {
        let Some(request) = item.request() else {
            debug_assert!(false, "completion of a synthetic item");
            return Ok(());
        };

        match *request.op() {
            BlockOp::Read { len, .. } => {
                let src = payload_src(
                    &self.region,
                    use_prealloc,
                    buffer_index,
                    worker_buffer,
                    len as usize,
                )?;

                let RequestPayload::Buffer(buffer) = request.payload() else {
                    debug_assert!(false, "read request without payload buffer");
                    return Ok(());
                };
                buffer.lock().copy_from_slice(src);
            }
            BlockOp::Ioctl { command } => {
                if ioc::dir(command) & ioc::WRITE != 0 {
                    let size = ioc::size(command) as usize;
                    let src = payload_src(
                        &self.region,
                        use_prealloc,
                        buffer_index,
                        worker_buffer,
                        size,
                    )?;

                    let RequestPayload::Buffer(argument) = request.payload() else {
                        debug_assert!(false, "ioctl request without argument buffer");
                        return Ok(());
                    };
                    argument.lock().copy_from_slice(src);
                }
            }
            // No reply payload for the remaining types.
            _ => {}
        }

        Ok(())
    }
}

// Resolves where a device-ward payload of `needed` bytes lands.
fn payload_dest<'a>(
    region: &'a mut SharedRegion,
    use_prealloc: bool,
    buffer_index: u64,
    worker_buffer: Option<&'a mut [u8]>,
    needed: usize,
) -> Result<&'a mut [u8], Error> {
    if use_prealloc {
        let buffer = region
            .preallocated_buffer_mut(buffer_index)
            .ok_or(Error::InvalidBufferIndex {
                index: buffer_index,
            })?;
        debug_assert!(buffer.len() >= needed, "payload exceeds buffer slot");
        Ok(&mut buffer[..needed])
    } else {
        match worker_buffer {
            Some(buffer) if buffer.len() >= needed => Ok(&mut buffer[..needed]),
            _ => Err(Error::BadWorkerBuffer { needed }),
        }
    }
}

// Resolves where a worker-ward reply payload of `needed` bytes comes from.
fn payload_src<'a>(
    region: &'a SharedRegion,
    use_prealloc: bool,
    buffer_index: u64,
    worker_buffer: Option<&'a [u8]>,
    needed: usize,
) -> Result<&'a [u8], Error> {
    if use_prealloc {
        let buffer = region
            .preallocated_buffer(buffer_index)
            .ok_or(Error::InvalidBufferIndex {
                index: buffer_index,
            })?;
        debug_assert!(buffer.len() >= needed, "payload exceeds buffer slot");
        Ok(&buffer[..needed])
    } else {
        match worker_buffer {
            Some(buffer) if buffer.len() >= needed => Ok(&buffer[..needed]),
            _ => Err(Error::BadWorkerBuffer { needed }),
        }
    }
}
