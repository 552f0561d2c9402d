// SPDX-License-Identifier: Apache-2.0

//! Errno vocabulary and result-code coercion.
//!
//! The core speaks *negated* errno values: 0 for success, `-EIO` and
//! friends for failure. Every request completes with a pair of them, one
//! for the block channel and one for the ioctl channel, since the two
//! channels accept different error sets.

use nix::libc;

/// A negated errno value: 0 on success, a negative errno otherwise.
pub type NegErrno = i32;

/// Input/output error.
pub const EIO: i32 = libc::EIO;
/// Link has been severed.
pub const ENOLINK: i32 = libc::ENOLINK;
/// No space left on device.
pub const ENOSPC: i32 = libc::ENOSPC;
/// Operation timed out.
pub const ETIMEDOUT: i32 = libc::ETIMEDOUT;
/// Function not implemented.
pub const ENOSYS: i32 = libc::ENOSYS;
/// No such device.
pub const ENODEV: i32 = libc::ENODEV;
/// Operation not supported.
pub const EOPNOTSUPP: i32 = libc::EOPNOTSUPP;
/// Inappropriate ioctl for device.
pub const ENOTTY: i32 = libc::ENOTTY;
/// Bad address.
pub const EFAULT: i32 = libc::EFAULT;
/// Invalid argument.
pub const EINVAL: i32 = libc::EINVAL;
/// Device or resource busy.
pub const EBUSY: i32 = libc::EBUSY;
/// Operation now in progress.
pub const EINPROGRESS: i32 = libc::EINPROGRESS;

/// The largest errno value the ioctl channel passes through unmodified.
pub const MAX_IOCTL_ERRNO: i32 = 133;

/// Reply error value a worker uses to signal an unrecoverable driver error.
///
/// A reply carrying it terminates the device, recoverable or not; the
/// affected request completes with `-EIO` and the condition is surfaced to
/// the session owner as a distinct "driver aborted" error.
pub const REPLY_ABORT: i32 = i32::MIN;

/// Coerces a reply's result for the block channel.
///
/// The block layer consumes only a small set of meaningful error values;
/// everything outside `{0, -ENOLINK, -ENOSPC, -ETIMEDOUT}` becomes `-EIO`.
pub fn coerce_result(neg_errno: NegErrno) -> NegErrno {
    match neg_errno {
        0 => 0,
        e if e == -ENOLINK || e == -ENOSPC || e == -ETIMEDOUT => e,
        _ => -EIO,
    }
}

/// Coerces a reply's result for the ioctl channel.
///
/// Ioctls are user-visible, so a wider but still bounded set is preserved:
/// any value in `[-MAX_IOCTL_ERRNO, 0]` except `-ENOSYS`. Everything else
/// becomes `-EIO`.
pub fn coerce_ioctl_result(neg_errno: NegErrno) -> NegErrno {
    if neg_errno < -MAX_IOCTL_ERRNO || neg_errno > 0 || neg_errno == -ENOSYS {
        -EIO
    } else {
        neg_errno
    }
}
