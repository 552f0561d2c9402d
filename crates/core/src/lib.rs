// SPDX-License-Identifier: Apache-2.0

//! The BDUS core: the request inverter and the device lifecycle built
//! around it.
//!
//! The inverter turns the usual producer/consumer relationship around:
//! block-layer producers [`submit`](inverter::Inverter::submit_request)
//! requests into a fixed table of slots, and worker-side consumers *get*
//! them, process them out of band, and *complete* them. Each slot is
//! identified by a `(index, seqnum)` handle that survives cancellation: the
//! sequence number advances every time a slot returns to the free state, so
//! a late reply addressed to a recycled slot is recognized as stale and
//! dropped.
//!
//! A [`device::Device`] owns one inverter and gates it with a four-state
//! lifecycle (unavailable → active ⇄ inactive → terminated). Deactivating a
//! device parks its in-flight work; reactivating hands that work, identity
//! intact, to whichever worker attaches next. This is what makes a device
//! *recoverable*: its driver can die and be replaced without losing queued
//! requests.

pub mod device;
pub mod errno;
pub mod error;
pub mod inverter;
pub mod ioc;
pub mod request;
pub mod sync;

mod slots;

pub use device::{Device, DeviceState};
pub use error::{Interrupted, InvalidHandle, IoctlError, SubmitError};
pub use inverter::{Inverter, Item, RequestHandle, TimeoutDecision};
pub use request::{BlockOp, BlockRequest, FinishedRequest, ItemType, RequestPayload};
pub use sync::Interruptor;
