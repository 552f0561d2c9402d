// SPDX-License-Identifier: Apache-2.0

//! Device registry and worker sessions.
//!
//! A [`Control`] owns every live device. Creating a device attaches the
//! caller as its first worker [`Session`]; when a session goes away, what
//! happens next depends on how it went: a session that detached without
//! [`Session::mark_as_successful`] from a non-recoverable device takes the
//! device down with it, while recoverable devices (and orderly exits) leave
//! the device inactive, in-flight work preserved, ready for a replacement
//! driver to [`Control::attach_to_device`].
//!
//! Attachment to a device that still has a session performs a hand-over:
//! the current session is asked to flush and terminate, the attacher waits
//! for it to detach, and the device is then reactivated with a fresh
//! transceiver. The previously in-flight requests are the first items the
//! new session receives.

pub mod error;

mod control;
mod session;
mod version;

pub use control::Control;
pub use error::Error;
pub use session::Session;
pub use version::{Version, version};
