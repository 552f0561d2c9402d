// SPDX-License-Identifier: Apache-2.0

//! Hard limits and defaults applied during configuration adjustment.

use nix::unistd::{SysconfVar, sysconf};

/// Hard cap on the number of simultaneously outstanding requests per device.
///
/// This bounds the slot table capacity and therefore the size of the shared
/// record array mapped into worker processes.
pub const HARD_MAX_OUTSTANDING_REQS: u32 = 256;

/// Hard cap on the number of devices that can exist at any given time.
pub const HARD_MAX_DEVICES: usize = 4096;

/// Default maximum size for read, write, and FUA write requests, in bytes.
pub const DEFAULT_MAX_READ_WRITE_SIZE: u32 = 256 * 1024;

/// Hard cap on the maximum size for read, write, and FUA write requests, in
/// bytes.
pub const HARD_MAX_READ_WRITE_SIZE: u32 = 1024 * 1024;

/// Exclusive upper bound on the argument size of device ioctl commands, in
/// bytes.
pub const MAX_IOCTL_ARG_SIZE: u32 = 1 << 14;

/// Minimum logical block size, in bytes.
pub const MIN_LOGICAL_BLOCK_SIZE: u32 = 512;

/// The system page size, in bytes.
///
/// Falls back to 4096 if the value cannot be queried, which matches every
/// platform this crate targets.
pub fn page_size() -> u32 {
    sysconf(SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(4096)
}
