// SPDX-License-Identifier: Apache-2.0

//! Device configuration: geometry, capabilities, and queueing limits.

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::limits::{
    DEFAULT_MAX_READ_WRITE_SIZE, HARD_MAX_OUTSTANDING_REQS, HARD_MAX_READ_WRITE_SIZE,
    MAX_IOCTL_ARG_SIZE, MIN_LOGICAL_BLOCK_SIZE, page_size,
};

/// Configuration for a BDUS device.
///
/// Size limits (`max_read_write_size` and friends) do not restrict what
/// clients of the device may request; they ensure that larger operations are
/// split into requests that satisfy the limit before reaching the driver.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// The device's numerical identifier, unique for every device created
    /// since process start. Assigned on creation; any value given by the
    /// caller is overwritten.
    pub id: u64,

    /// The size of the device, in bytes.
    ///
    /// Must be a positive multiple of `physical_block_size`, or of
    /// `logical_block_size` if the former is 0.
    pub size: u64,

    /// The device's logical block size, in bytes.
    ///
    /// Must be a power of two in `[512, page size]`.
    pub logical_block_size: u32,

    /// The device's physical block size, in bytes.
    ///
    /// Must be 0 or a power of two in `[logical_block_size, page size]`.
    /// Adjustment replaces 0 with `logical_block_size`.
    pub physical_block_size: u32,

    /// The maximum size for *read*, *write*, and *FUA write* requests, in
    /// bytes. Must be 0 or at least one page.
    ///
    /// Adjustment sets this to 0 when none of those request types is
    /// supported; otherwise a value of 0 is replaced by a default, and any
    /// other value is clamped to a hard cap and rounded down to a multiple
    /// of `logical_block_size` (never increased).
    pub max_read_write_size: u32,

    /// The maximum size for *write same* requests, in bytes. Must be 0 or at
    /// least `logical_block_size`; adjusted like `max_read_write_size` but
    /// without a hard cap.
    pub max_write_same_size: u32,

    /// The maximum size for *write zeros* requests, in bytes. Must be 0 or
    /// at least `logical_block_size`; adjusted like `max_write_same_size`.
    pub max_write_zeros_size: u32,

    /// The maximum size for *discard* and *secure erase* requests, in bytes.
    /// Must be 0 or at least `logical_block_size`; adjusted like
    /// `max_write_same_size`.
    pub max_discard_erase_size: u32,

    /// The maximum number of simultaneously outstanding requests.
    ///
    /// An outstanding request is one that has been received by a worker but
    /// not yet replied to. Must be positive; adjustment clamps it to
    /// [`HARD_MAX_OUTSTANDING_REQS`] and forces it to 1 when the device
    /// supports no request type at all.
    pub max_outstanding_reqs: u32,

    /// Whether the device supports *read* requests.
    pub supports_read: bool,
    /// Whether the device supports *write* requests.
    pub supports_write: bool,
    /// Whether the device supports *write same* requests.
    pub supports_write_same: bool,
    /// Whether the device supports *write zeros* requests (both allowing and
    /// disallowing unmapping).
    pub supports_write_zeros: bool,
    /// Whether the device supports *FUA write* requests. Requires
    /// `supports_flush`.
    pub supports_fua_write: bool,
    /// Whether the device supports *flush* requests.
    pub supports_flush: bool,
    /// Whether the device supports *discard* requests.
    pub supports_discard: bool,
    /// Whether the device supports *secure erase* requests.
    pub supports_secure_erase: bool,
    /// Whether the device supports *ioctl* requests.
    pub supports_ioctl: bool,

    /// Whether to advertise the device as rotational to the block layer.
    pub rotational: bool,

    /// Whether adjacent requests may be merged before reaching the driver.
    pub merge_requests: bool,

    /// Whether partition scanning is enabled for the device.
    pub enable_partition_scanning: bool,

    /// Whether the device is *recoverable*.
    ///
    /// A recoverable device survives the loss of its driver: in-flight
    /// requests are held and handed to the next driver that attaches. A
    /// non-recoverable device left without an attached session is destroyed.
    pub recoverable: bool,
}

impl DeviceConfig {
    /// Validates this configuration and normalizes it in place.
    ///
    /// On success the configuration holds the effective values the device
    /// will be created with. Adjustment only ever lowers limits or fills in
    /// defaults; it never raises a caller-supplied value.
    pub fn validate_and_adjust(&mut self) -> Result<(), Error> {
        self.validate()?;
        self.adjust();
        Ok(())
    }

    /// Returns whether the device accepts no mutating request type.
    pub fn is_read_only(&self) -> bool {
        !self.supports_write
            && !self.supports_write_same
            && !self.supports_write_zeros
            && !self.supports_fua_write
            && !self.supports_discard
            && !self.supports_secure_erase
    }

    /// The largest request payload this device can produce, in bytes.
    ///
    /// This sizes the preallocated payload buffers of the shared region: the
    /// read/write limit, one logical block if write-same is supported, and
    /// the ioctl argument bound if ioctls are supported.
    pub fn max_request_payload_size(&self) -> usize {
        let mut size = self.max_read_write_size as usize;

        if self.supports_write_same {
            size = size.max(self.logical_block_size as usize);
        }

        if self.supports_ioctl {
            size = size.max(MAX_IOCTL_ARG_SIZE as usize);
        }

        size
    }

    fn supports_any(&self) -> bool {
        self.supports_read
            || self.supports_write
            || self.supports_write_same
            || self.supports_write_zeros
            || self.supports_fua_write
            || self.supports_flush
            || self.supports_discard
            || self.supports_secure_erase
            || self.supports_ioctl
    }

    fn validate(&self) -> Result<(), Error> {
        let page = page_size();

        if self.supports_fua_write && !self.supports_flush {
            return Err(Error::FuaWriteRequiresFlush);
        }

        if !self.logical_block_size.is_power_of_two()
            || self.logical_block_size < MIN_LOGICAL_BLOCK_SIZE
            || self.logical_block_size > page
        {
            return Err(Error::InvalidLogicalBlockSize {
                value: self.logical_block_size,
                page_size: page,
            });
        }

        if self.physical_block_size != 0
            && (!self.physical_block_size.is_power_of_two()
                || self.physical_block_size < self.logical_block_size
                || self.physical_block_size > page)
        {
            return Err(Error::InvalidPhysicalBlockSize {
                value: self.physical_block_size,
                logical_block_size: self.logical_block_size,
                page_size: page,
            });
        }

        let block = self.physical_block_size.max(self.logical_block_size);

        if self.size == 0 || !self.size.is_multiple_of(u64::from(block)) {
            return Err(Error::InvalidSize {
                value: self.size,
                block_size: block,
            });
        }

        if self.max_read_write_size != 0 && self.max_read_write_size < page {
            return Err(Error::InvalidMaxReadWriteSize {
                value: self.max_read_write_size,
                page_size: page,
            });
        }

        if self.max_write_same_size != 0 && self.max_write_same_size < self.logical_block_size {
            return Err(Error::InvalidMaxWriteSameSize {
                value: self.max_write_same_size,
                logical_block_size: self.logical_block_size,
            });
        }

        if self.max_write_zeros_size != 0 && self.max_write_zeros_size < self.logical_block_size {
            return Err(Error::InvalidMaxWriteZerosSize {
                value: self.max_write_zeros_size,
                logical_block_size: self.logical_block_size,
            });
        }

        if self.max_discard_erase_size != 0
            && self.max_discard_erase_size < self.logical_block_size
        {
            return Err(Error::InvalidMaxDiscardEraseSize {
                value: self.max_discard_erase_size,
                logical_block_size: self.logical_block_size,
            });
        }

        if self.max_outstanding_reqs == 0 {
            return Err(Error::InvalidMaxOutstandingReqs);
        }

        Ok(())
    }

    // Adjusts a previously validated configuration.
    fn adjust(&mut self) {
        let page = page_size();
        let logical = self.logical_block_size;

        if self.physical_block_size == 0 {
            self.physical_block_size = logical;
        }

        if !self.supports_read && !self.supports_write && !self.supports_fua_write {
            self.max_read_write_size = 0;
        } else if self.max_read_write_size == 0 {
            self.max_read_write_size = DEFAULT_MAX_READ_WRITE_SIZE
                .clamp(page, round_down(HARD_MAX_READ_WRITE_SIZE, logical));
        } else {
            self.max_read_write_size = round_down(
                self.max_read_write_size.min(HARD_MAX_READ_WRITE_SIZE),
                logical,
            );
        }

        self.max_write_same_size = if self.supports_write_same {
            round_down(min_not_zero(self.max_write_same_size), logical)
        } else {
            0
        };

        self.max_write_zeros_size = if self.supports_write_zeros {
            round_down(min_not_zero(self.max_write_zeros_size), logical)
        } else {
            0
        };

        self.max_discard_erase_size = if self.supports_discard || self.supports_secure_erase {
            round_down(min_not_zero(self.max_discard_erase_size), logical)
        } else {
            0
        };

        self.max_outstanding_reqs = if self.supports_any() {
            self.max_outstanding_reqs.min(HARD_MAX_OUTSTANDING_REQS)
        } else {
            1
        };
    }
}

fn round_down(value: u32, multiple: u32) -> u32 {
    value - value % multiple
}

fn min_not_zero(value: u32) -> u32 {
    if value == 0 { u32::MAX } else { value }
}
