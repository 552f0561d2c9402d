// SPDX-License-Identifier: Apache-2.0

//! Errors for the config crate.

/// Errors that can occur while validating a device or session configuration.
///
/// Each variant names the offending field and carries the rejected value, so
/// callers can report the failure without re-deriving context.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// `supports_fua_write` was set without `supports_flush`.
    #[error("FUA write support requires flush support")]
    FuaWriteRequiresFlush,

    /// The logical block size is not a power of two in `[512, page size]`.
    #[error("invalid logical_block_size {value}: must be a power of two in [512, {page_size}]")]
    InvalidLogicalBlockSize {
        /// The rejected value.
        value: u32,
        /// The system page size, which bounds the valid range.
        page_size: u32,
    },

    /// The physical block size is neither 0 nor a power of two in
    /// `[logical_block_size, page size]`.
    #[error(
        "invalid physical_block_size {value}: must be 0 or a power of two in \
         [{logical_block_size}, {page_size}]"
    )]
    InvalidPhysicalBlockSize {
        /// The rejected value.
        value: u32,
        /// The configured logical block size.
        logical_block_size: u32,
        /// The system page size, which bounds the valid range.
        page_size: u32,
    },

    /// The device size is not a positive multiple of its block size.
    #[error("invalid size {value}: must be a positive multiple of {block_size}")]
    InvalidSize {
        /// The rejected value.
        value: u64,
        /// The block size the device size must be a multiple of.
        block_size: u32,
    },

    /// The maximum read/write size is neither 0 nor at least one page.
    #[error("invalid max_read_write_size {value}: must be 0 or at least {page_size}")]
    InvalidMaxReadWriteSize {
        /// The rejected value.
        value: u32,
        /// The system page size.
        page_size: u32,
    },

    /// The maximum write-same size is neither 0 nor at least one logical
    /// block.
    #[error("invalid max_write_same_size {value}: must be 0 or at least {logical_block_size}")]
    InvalidMaxWriteSameSize {
        /// The rejected value.
        value: u32,
        /// The configured logical block size.
        logical_block_size: u32,
    },

    /// The maximum write-zeros size is neither 0 nor at least one logical
    /// block.
    #[error("invalid max_write_zeros_size {value}: must be 0 or at least {logical_block_size}")]
    InvalidMaxWriteZerosSize {
        /// The rejected value.
        value: u32,
        /// The configured logical block size.
        logical_block_size: u32,
    },

    /// The maximum discard/secure-erase size is neither 0 nor at least one
    /// logical block.
    #[error("invalid max_discard_erase_size {value}: must be 0 or at least {logical_block_size}")]
    InvalidMaxDiscardEraseSize {
        /// The rejected value.
        value: u32,
        /// The configured logical block size.
        logical_block_size: u32,
    },

    /// The maximum number of outstanding requests is zero.
    #[error("invalid max_outstanding_reqs: must be positive")]
    InvalidMaxOutstandingReqs,
}
