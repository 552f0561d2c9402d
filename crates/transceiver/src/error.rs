// SPDX-License-Identifier: Apache-2.0

//! Errors for the transceiver crate.

use bdus_core::Interrupted;

/// Errors that can occur while receiving items or sending replies.
///
/// On any error the affected slot is returned to the state it was taken
/// from (via the inverter's abort operations), so the worker can retry or
/// unwind without losing the request.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The wait for the next item was interrupted; retryable.
    #[error(transparent)]
    Interrupted(#[from] Interrupted),

    /// The record index does not address a record of this region.
    #[error("record index {index} out of range")]
    InvalidRecordIndex {
        /// The rejected record index.
        index: u32,
    },

    /// The record selected a preallocated buffer this region does not have.
    #[error("preallocated buffer index {index} out of range")]
    InvalidBufferIndex {
        /// The rejected buffer index.
        index: u64,
    },

    /// The record selected worker-buffer mode but the caller supplied no
    /// buffer, or one too small for the payload.
    #[error("worker buffer missing or smaller than the {needed}-byte payload")]
    BadWorkerBuffer {
        /// The payload size the buffer must accommodate.
        needed: usize,
    },

    /// The reply's handle does not refer to a request awaiting completion.
    #[error("reply does not refer to a completable request")]
    InvalidReply,

    /// The worker reported the abort sentinel: the driver is unrecoverable.
    ///
    /// The device has been terminated, recoverable or not, and the
    /// affected request completed with `-EIO`; only destruction follows.
    #[error("driver aborted")]
    DriverAborted,
}
