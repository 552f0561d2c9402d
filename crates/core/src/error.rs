// SPDX-License-Identifier: Apache-2.0

//! Errors for the core crate.
//!
//! The inverter reports failures to the block layer through the negated
//! errno pair on each completed request; the types here exist so callers
//! inside the process can also branch on the outcome without parsing errno
//! values.

/// Errors returned by request submission.
///
/// In both cases the request itself has already been completed through its
/// channel with the corresponding errno pair, so the submitter's view stays
/// consistent whether it inspects this error or the finished request.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    /// The device does not support this request type (`EOPNOTSUPP` on the
    /// block channel, `ENOTTY` on the ioctl channel).
    #[error("request type not supported by the device")]
    Unsupported,

    /// The inverter has been terminated (`EIO` on the block channel,
    /// `ENODEV` on the ioctl channel).
    #[error("device has been terminated")]
    Terminated,
}

/// The consumer waiting for an item was interrupted.
///
/// This is an outcome, not an error: the caller is expected to either retry
/// or unwind its session, at its discretion.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("wait for next item was interrupted")]
pub struct Interrupted;

/// A completion was attempted with a handle that cannot currently be
/// completed: the index is out of range, or the slot is not awaiting
/// completion.
///
/// A *stale* handle (recycled slot) is not an error; see
/// [`Inverter::begin_item_completion`](crate::inverter::Inverter::begin_item_completion).
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("invalid completion handle with index {index}")]
pub struct InvalidHandle {
    /// The handle index that was rejected.
    pub index: u16,
}

/// Errors returned when executing an ioctl against a device.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[allow(variant_size_differences)]
pub enum IoctlError {
    /// The command encodes an unsupported direction/size combination.
    #[error("invalid ioctl command {command:#010x}")]
    InvalidCommand {
        /// The rejected command word.
        command: u32,
    },

    /// The caller-supplied argument buffer does not match the size encoded
    /// in the command.
    #[error("ioctl argument size mismatch: command encodes {expected}, caller supplied {got}")]
    ArgumentSizeMismatch {
        /// The size encoded in the command word.
        expected: usize,
        /// The size of the supplied argument buffer.
        got: usize,
    },

    /// The driver completed the ioctl with a failure.
    #[error("ioctl failed with errno {errno}")]
    Driver {
        /// The negated errno reported on the ioctl channel.
        errno: i32,
    },
}
