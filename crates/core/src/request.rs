// SPDX-License-Identifier: Apache-2.0

//! The block-layer seam: requests entering the inverter and the items
//! workers observe.
//!
//! A [`BlockRequest`] is an owned description of one block-layer request:
//! the operation, its payload buffers, and a channel through which the
//! final result pair travels back to the submitter once the request leaves
//! the inverter. The buffers live inside the request because ownership of
//! them follows the slot state machine rather than the type system: while a
//! slot is *being gotten* the worker side writes the request's data out,
//! and while it is *being completed* the worker's reply payload is written
//! back in. The interior locks are never contended; they only make that
//! hand-off expressible in safe code.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use parking_lot::Mutex;

use crate::errno::NegErrno;

/// Item types, as observed by workers. The numeric tags are wire-stable.
///
/// The first three are *synthetic*: they notify the worker of a lifecycle
/// event and do not correspond to a slot. All others describe a real block
/// request occupying a slot.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive,
)]
#[repr(u8)]
pub enum ItemType {
    /// The device became available to clients (synthetic).
    DeviceAvailable = 0,
    /// The worker should terminate (synthetic).
    Terminate = 1,
    /// The worker should flush and then terminate (synthetic).
    FlushAndTerminate = 2,
    /// Read data.
    Read = 3,
    /// Write data.
    Write = 4,
    /// Write one block of data repeatedly over a range.
    WriteSame = 5,
    /// Write zeros, keeping the range mapped.
    WriteZerosNoUnmap = 6,
    /// Write zeros, possibly unmapping the range.
    WriteZerosMayUnmap = 7,
    /// Write data through to persistent storage (forced unit access).
    FuaWrite = 8,
    /// Flush previously written data to persistent storage.
    Flush = 9,
    /// Discard a range.
    Discard = 10,
    /// Securely erase a range.
    SecureErase = 11,
    /// Device ioctl.
    Ioctl = 12,
}

impl ItemType {
    /// Returns whether this item is a lifecycle notification rather than a
    /// real request.
    pub fn is_synthetic(self) -> bool {
        matches!(
            self,
            ItemType::DeviceAvailable | ItemType::Terminate | ItemType::FlushAndTerminate
        )
    }
}

/// The operation a [`BlockRequest`] performs.
///
/// Offsets and lengths are in bytes. Lengths describe the full range the
/// operation covers; for *write same* the payload is a single logical block
/// repeated over that range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOp {
    /// Read `len` bytes starting at `offset`.
    Read {
        /// Byte offset into the device.
        offset: u64,
        /// Number of bytes to read.
        len: u32,
    },
    /// Write the request's payload starting at `offset`.
    Write {
        /// Byte offset into the device.
        offset: u64,
        /// Number of bytes to write.
        len: u32,
    },
    /// Write one logical block of payload repeatedly over `len` bytes.
    WriteSame {
        /// Byte offset into the device.
        offset: u64,
        /// Size of the full range, in bytes.
        len: u32,
    },
    /// Write zeros over `len` bytes.
    WriteZeros {
        /// Byte offset into the device.
        offset: u64,
        /// Size of the range, in bytes.
        len: u32,
        /// Whether the device may unmap the range instead of writing.
        may_unmap: bool,
    },
    /// Write the request's payload through to persistent storage.
    FuaWrite {
        /// Byte offset into the device.
        offset: u64,
        /// Number of bytes to write.
        len: u32,
    },
    /// Flush previously written data to persistent storage.
    Flush,
    /// Discard a range.
    Discard {
        /// Byte offset into the device.
        offset: u64,
        /// Size of the range, in bytes.
        len: u32,
    },
    /// Securely erase a range.
    SecureErase {
        /// Byte offset into the device.
        offset: u64,
        /// Size of the range, in bytes.
        len: u32,
    },
    /// Device ioctl.
    Ioctl {
        /// The ioctl command word, in `_IOC` encoding.
        command: u32,
    },
}

/// Payload storage of a [`BlockRequest`].
#[derive(Debug)]
pub enum RequestPayload {
    /// The operation carries no payload.
    None,
    /// Data flowing device-ward (write, write same, FUA write).
    Data(Bytes),
    /// A buffer the driver fills or updates (read, ioctl argument).
    Buffer(Mutex<BytesMut>),
}

/// One block-layer request, in flight through the inverter.
#[derive(Debug)]
pub struct BlockRequest {
    op: BlockOp,
    payload: RequestPayload,
    done: flume::Sender<FinishedRequest>,
}

/// A request that has left the inverter, with its result pair.
#[derive(Debug)]
pub struct FinishedRequest {
    /// The finished request, payload included. For reads that succeeded,
    /// the payload buffer holds the data the driver produced.
    pub request: Arc<BlockRequest>,
    /// Negated errno for the block channel.
    pub error: NegErrno,
    /// Negated errno for the ioctl channel.
    pub error_ioctl: NegErrno,
}

impl BlockRequest {
    fn new(op: BlockOp, payload: RequestPayload) -> (Self, flume::Receiver<FinishedRequest>) {
        let (done, finished) = flume::unbounded();
        (Self { op, payload, done }, finished)
    }

    /// Creates a read request; the payload buffer is zero-filled until the
    /// driver replies.
    pub fn read(offset: u64, len: u32) -> (Self, flume::Receiver<FinishedRequest>) {
        Self::new(
            BlockOp::Read { offset, len },
            RequestPayload::Buffer(Mutex::new(BytesMut::zeroed(len as usize))),
        )
    }

    /// Creates a write request carrying `data`.
    pub fn write(offset: u64, data: Bytes) -> (Self, flume::Receiver<FinishedRequest>) {
        let len = data.len() as u32;
        Self::new(BlockOp::Write { offset, len }, RequestPayload::Data(data))
    }

    /// Creates a write-same request: `block` (one logical block) repeated
    /// over `len` bytes starting at `offset`.
    pub fn write_same(
        offset: u64,
        len: u32,
        block: Bytes,
    ) -> (Self, flume::Receiver<FinishedRequest>) {
        Self::new(
            BlockOp::WriteSame { offset, len },
            RequestPayload::Data(block),
        )
    }

    /// Creates a write-zeros request.
    pub fn write_zeros(
        offset: u64,
        len: u32,
        may_unmap: bool,
    ) -> (Self, flume::Receiver<FinishedRequest>) {
        Self::new(
            BlockOp::WriteZeros {
                offset,
                len,
                may_unmap,
            },
            RequestPayload::None,
        )
    }

    /// Creates a FUA write request carrying `data`.
    pub fn fua_write(offset: u64, data: Bytes) -> (Self, flume::Receiver<FinishedRequest>) {
        let len = data.len() as u32;
        Self::new(BlockOp::FuaWrite { offset, len }, RequestPayload::Data(data))
    }

    /// Creates a flush request.
    pub fn flush() -> (Self, flume::Receiver<FinishedRequest>) {
        Self::new(BlockOp::Flush, RequestPayload::None)
    }

    /// Creates a discard request.
    pub fn discard(offset: u64, len: u32) -> (Self, flume::Receiver<FinishedRequest>) {
        Self::new(BlockOp::Discard { offset, len }, RequestPayload::None)
    }

    /// Creates a secure-erase request.
    pub fn secure_erase(offset: u64, len: u32) -> (Self, flume::Receiver<FinishedRequest>) {
        Self::new(BlockOp::SecureErase { offset, len }, RequestPayload::None)
    }

    /// Creates an ioctl request. `argument` must be sized according to the
    /// command and already hold caller data for `_IOC_READ` commands.
    pub fn ioctl(command: u32, argument: BytesMut) -> (Self, flume::Receiver<FinishedRequest>) {
        Self::new(
            BlockOp::Ioctl { command },
            RequestPayload::Buffer(Mutex::new(argument)),
        )
    }

    /// The operation this request performs.
    pub fn op(&self) -> &BlockOp {
        &self.op
    }

    /// The request's payload storage.
    pub fn payload(&self) -> &RequestPayload {
        &self.payload
    }

    /// The item type workers observe for this request.
    pub fn item_type(&self) -> ItemType {
        match self.op {
            BlockOp::Read { .. } => ItemType::Read,
            BlockOp::Write { .. } => ItemType::Write,
            BlockOp::WriteSame { .. } => ItemType::WriteSame,
            BlockOp::WriteZeros {
                may_unmap: false, ..
            } => ItemType::WriteZerosNoUnmap,
            BlockOp::WriteZeros {
                may_unmap: true, ..
            } => ItemType::WriteZerosMayUnmap,
            BlockOp::FuaWrite { .. } => ItemType::FuaWrite,
            BlockOp::Flush => ItemType::Flush,
            BlockOp::Discard { .. } => ItemType::Discard,
            BlockOp::SecureErase { .. } => ItemType::SecureErase,
            BlockOp::Ioctl { .. } => ItemType::Ioctl,
        }
    }

    /// Completes this request with the given result pair.
    pub(crate) fn finish(self: &Arc<Self>, error: NegErrno, error_ioctl: NegErrno) {
        // The submitter may have dropped its receiver; that is its choice.
        let _ = self.done.send(FinishedRequest {
            request: Arc::clone(self),
            error,
            error_ioctl,
        });
    }
}
