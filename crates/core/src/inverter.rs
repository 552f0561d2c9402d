// SPDX-License-Identifier: Apache-2.0

//! The request inverter.
//!
//! Producers (the block layer) submit requests; consumers (worker threads)
//! get them, process them out of band, and complete them. Both sides go
//! through begin/commit/abort pairs so that a payload transfer in progress
//! is never torn by a timeout or cancellation: a slot in `BeingGotten` or
//! `BeingCompleted` belongs to exactly one worker, and the only thing a
//! concurrent timeout may do to it is ask for the timer to be re-armed.
//!
//! Every operation takes the single per-inverter lock and is O(1) under it;
//! none of them blocks, with the sole exception of
//! [`Inverter::begin_item_get`], which waits on the inverter's wait object
//! until an item or a lifecycle notification is available.

use std::sync::Arc;

use bdus_config::DeviceConfig;
use parking_lot::Mutex;

use crate::errno::{
    EIO, ENODEV, ENOTTY, EOPNOTSUPP, ETIMEDOUT, NegErrno, coerce_ioctl_result, coerce_result,
};
use crate::error::{Interrupted, InvalidHandle, SubmitError};
use crate::request::{BlockRequest, ItemType};
use crate::slots::{SlotState, SlotTable};
use crate::sync::{Completion, Interruptor};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Flags: u32 {
        const DEACTIVATED             = 1 << 0;
        const DEACTIVATED_NOT_FLUSHED = 1 << 1;
        const TERMINATED              = 1 << 2;
        const SEND_DEVICE_AVAILABLE   = 1 << 3;

        const SUPPORTS_READ         = 1 << 4;
        const SUPPORTS_WRITE        = 1 << 5;
        const SUPPORTS_FLUSH        = 1 << 6;
        const SUPPORTS_IOCTL        = 1 << 7;
        const SUPPORTS_WRITE_SAME   = 1 << 8;
        const SUPPORTS_WRITE_ZEROS  = 1 << 9;
        const SUPPORTS_FUA_WRITE    = 1 << 10;
        const SUPPORTS_DISCARD      = 1 << 11;
        const SUPPORTS_SECURE_ERASE = 1 << 12;
    }
}

fn capability_flags(config: &DeviceConfig) -> Flags {
    let mut flags = Flags::empty();

    for (supported, flag) in [
        (config.supports_read, Flags::SUPPORTS_READ),
        (config.supports_write, Flags::SUPPORTS_WRITE),
        (config.supports_flush, Flags::SUPPORTS_FLUSH),
        (config.supports_ioctl, Flags::SUPPORTS_IOCTL),
        (config.supports_write_same, Flags::SUPPORTS_WRITE_SAME),
        (config.supports_write_zeros, Flags::SUPPORTS_WRITE_ZEROS),
        (config.supports_fua_write, Flags::SUPPORTS_FUA_WRITE),
        (config.supports_discard, Flags::SUPPORTS_DISCARD),
        (config.supports_secure_erase, Flags::SUPPORTS_SECURE_ERASE),
    ] {
        if supported {
            flags.insert(flag);
        }
    }

    flags
}

fn supports(flags: Flags, item_type: ItemType) -> bool {
    match item_type {
        ItemType::Read => flags.contains(Flags::SUPPORTS_READ),
        ItemType::Write => flags.contains(Flags::SUPPORTS_WRITE),
        ItemType::WriteSame => flags.contains(Flags::SUPPORTS_WRITE_SAME),
        ItemType::WriteZerosNoUnmap | ItemType::WriteZerosMayUnmap => {
            flags.contains(Flags::SUPPORTS_WRITE_ZEROS)
        }
        ItemType::FuaWrite => flags.contains(Flags::SUPPORTS_FUA_WRITE),
        ItemType::Flush => flags.contains(Flags::SUPPORTS_FLUSH),
        ItemType::Discard => flags.contains(Flags::SUPPORTS_DISCARD),
        ItemType::SecureErase => flags.contains(Flags::SUPPORTS_SECURE_ERASE),
        ItemType::Ioctl => flags.contains(Flags::SUPPORTS_IOCTL),
        ItemType::DeviceAvailable | ItemType::Terminate | ItemType::FlushAndTerminate => {
            debug_assert!(false, "synthetic item type cannot be submitted");
            false
        }
    }
}

/// The handle identifying one slot instance: its stable index plus the
/// sequence number current at submission.
///
/// The index alone identifies the slot; the seqnum identifies this
/// *occupancy* of the slot. After the slot is freed and recycled, the old
/// handle no longer resolves, which is what makes late replies harmless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHandle {
    /// Stable 1-based slot index.
    pub index: u16,
    /// Slot sequence number at submission time.
    pub seqnum: u64,
}

/// What the block layer should do with a request whose timer fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutDecision {
    /// The request has been dealt with (failed with `-ETIMEDOUT`, or it had
    /// already completed); the timer can be forgotten.
    Done,
    /// A worker is mid-transfer on this request; re-arm the timer.
    ResetTimer,
}

/// One unit handed to a consumer: a real request's snapshot, or a synthetic
/// lifecycle notification.
///
/// Synthetic items carry the null handle (index 0).
#[derive(Debug, Clone)]
pub struct Item {
    handle_index: u16,
    handle_seqnum: u64,
    item_type: ItemType,
    request: Option<Arc<BlockRequest>>,
}

impl Item {
    fn synthetic(item_type: ItemType) -> Self {
        Self {
            handle_index: 0,
            handle_seqnum: 0,
            item_type,
            request: None,
        }
    }

    /// The *index* portion of the item's handle; 0 for synthetic items.
    pub fn handle_index(&self) -> u16 {
        self.handle_index
    }

    /// The *seqnum* portion of the item's handle.
    pub fn handle_seqnum(&self) -> u64 {
        self.handle_seqnum
    }

    /// The item's type.
    pub fn item_type(&self) -> ItemType {
        self.item_type
    }

    /// The underlying block request; `None` for synthetic items.
    pub fn request(&self) -> Option<&Arc<BlockRequest>> {
        self.request.as_ref()
    }
}

struct InverterState {
    flags: Flags,
    table: SlotTable,
}

/// The request-lifecycle authority for one device.
pub struct Inverter {
    state: Mutex<InverterState>,
    item_ready: Completion,
}

impl Inverter {
    /// Creates an inverter sized and capability-gated by an adjusted device
    /// configuration.
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            state: Mutex::new(InverterState {
                flags: capability_flags(config),
                table: SlotTable::new(config.max_outstanding_reqs),
            }),
            item_ready: Completion::new(),
        }
    }

    /// The number of slots, equal to the device's queue depth.
    pub fn capacity(&self) -> u32 {
        self.state.lock().table.capacity()
    }

    /// Submits a block request, making it available to consumers.
    ///
    /// On failure the request is completed through its channel with the
    /// corresponding errno pair and no slot is consumed. A free slot always
    /// exists otherwise, because the block layer's queue depth equals the
    /// slot capacity.
    pub fn submit_request(&self, request: BlockRequest) -> Result<RequestHandle, SubmitError> {
        let item_type = request.item_type();
        let request = Arc::new(request);

        let mut state = self.state.lock();

        if state.flags.contains(Flags::TERMINATED) {
            drop(state);
            request.finish(-EIO, -ENODEV);
            return Err(SubmitError::Terminated);
        }

        if !supports(state.flags, item_type) {
            drop(state);
            request.finish(-EOPNOTSUPP, -ENOTTY);
            return Err(SubmitError::Unsupported);
        }

        let Some(position) = state.table.free_head() else {
            // Queue depth equals capacity, so this is unreachable; treat it
            // like termination rather than corrupting the table.
            debug_assert!(false, "no free slot at submission");
            drop(state);
            request.finish(-EIO, -ENODEV);
            return Err(SubmitError::Terminated);
        };

        state.table.install_request(position, request);
        state.table.to_awaiting_get(position);

        let slot = state.table.slot(position);
        let handle = RequestHandle {
            index: slot.index(),
            seqnum: slot.seqnum(),
        };

        self.item_ready.notify_one();

        Ok(handle)
    }

    /// Decides the fate of a request whose block-layer timer fired.
    pub fn timeout_request(&self, handle: RequestHandle) -> TimeoutDecision {
        let mut state = self.state.lock();

        let Some(position) = state.table.position_of_handle(handle.index) else {
            debug_assert!(false, "timeout with out-of-range handle");
            return TimeoutDecision::Done;
        };

        if state.table.slot(position).seqnum() != handle.seqnum {
            // Already completed, cancelled, or timed out.
            return TimeoutDecision::Done;
        }

        match state.table.slot(position).state() {
            SlotState::BeingGotten | SlotState::BeingCompleted => TimeoutDecision::ResetTimer,
            SlotState::AwaitingGet | SlotState::AwaitingCompletion => {
                free_slot(&mut state.table, position, -ETIMEDOUT, -ETIMEDOUT);
                TimeoutDecision::Done
            }
            SlotState::Free => {
                debug_assert!(false, "free slot with matching seqnum");
                TimeoutDecision::Done
            }
        }
    }

    /// Terminates the inverter. Idempotent.
    ///
    /// Every slot awaiting a get or a completion fails with `-EIO`
    /// (`-ENODEV` on the ioctl channel), every future submission fails the
    /// same way, and consumers observe an endless stream of
    /// [`ItemType::Terminate`] notifications.
    pub fn terminate(&self) {
        let mut state = self.state.lock();

        if state.flags.contains(Flags::TERMINATED) {
            return;
        }

        state.flags.insert(Flags::TERMINATED);

        for position in state.table.positions() {
            if matches!(
                state.table.slot(position).state(),
                SlotState::AwaitingGet | SlotState::AwaitingCompletion
            ) {
                free_slot(&mut state.table, position, -EIO, -ENODEV);
            }
        }

        self.item_ready.notify_all_sticky();

        tracing::debug!("inverter terminated");
    }

    /// Deactivates the inverter: consumers see termination notifications,
    /// while submitted requests are accepted and held.
    ///
    /// With `flush`, and if the device supports flushing, the next consumer
    /// additionally sees one [`ItemType::FlushAndTerminate`] first. Must
    /// not be called on a terminated inverter.
    pub fn deactivate(&self, flush: bool) {
        let mut state = self.state.lock();

        debug_assert!(!state.flags.contains(Flags::TERMINATED));

        if !state.flags.contains(Flags::DEACTIVATED) {
            state.flags.insert(Flags::DEACTIVATED);

            if flush && state.flags.contains(Flags::SUPPORTS_FLUSH) {
                state.flags.insert(Flags::DEACTIVATED_NOT_FLUSHED);
            }

            tracing::debug!(flush, "inverter deactivated");
        }

        self.item_ready.notify_all_sticky();
    }

    /// Reactivates a deactivated inverter.
    ///
    /// Requests the previous consumer had gotten but not completed return
    /// to the head of the queue, identity intact and in slot order, so the
    /// next consumer sees the in-flight work first. A pending
    /// device-available notification is re-asserted. Must not be called on
    /// a terminated inverter.
    pub fn activate(&self) {
        let mut state = self.state.lock();

        debug_assert!(!state.flags.contains(Flags::TERMINATED));

        if !state.flags.contains(Flags::DEACTIVATED) {
            return;
        }

        state
            .flags
            .remove(Flags::DEACTIVATED | Flags::DEACTIVATED_NOT_FLUSHED);

        self.item_ready.reset();

        // Walked in reverse so that re-queued slots, each prepended, end up
        // at the head of the queue in slot order.
        for position in state.table.positions().rev() {
            match state.table.slot(position).state() {
                SlotState::AwaitingGet => self.item_ready.notify_one(),
                SlotState::AwaitingCompletion => {
                    state.table.to_awaiting_get(position);
                    self.item_ready.notify_one();
                }
                SlotState::Free => {}
                other => {
                    debug_assert!(false, "slot in state {other:?} across reactivation");
                }
            }
        }

        if state.flags.contains(Flags::SEND_DEVICE_AVAILABLE) {
            self.item_ready.notify_one();
        }

        tracing::debug!("inverter activated");
    }

    /// Arranges for the next get to return one synthetic
    /// [`ItemType::DeviceAvailable`] item. Idempotent.
    pub fn submit_device_available_notification(&self) {
        let mut state = self.state.lock();

        if !state.flags.contains(Flags::SEND_DEVICE_AVAILABLE) {
            state.flags.insert(Flags::SEND_DEVICE_AVAILABLE);
            self.item_ready.notify_one();
        }
    }

    /// Blocks until an item is available and takes it, moving its slot to
    /// `BeingGotten`.
    ///
    /// Lifecycle notifications take priority over real requests, in this
    /// order: flush-and-terminate, terminate (returned indefinitely while
    /// the inverter is deactivated or terminated), device-available.
    ///
    /// Returns [`Interrupted`] if `interruptor` fires; the wait can be
    /// retried.
    pub fn begin_item_get(&self, interruptor: &Interruptor) -> Result<Item, Interrupted> {
        loop {
            self.item_ready.wait(interruptor)?;

            let mut state = self.state.lock();

            if state.flags.contains(Flags::DEACTIVATED_NOT_FLUSHED) {
                state.flags.remove(Flags::DEACTIVATED_NOT_FLUSHED);
                return Ok(Item::synthetic(ItemType::FlushAndTerminate));
            }

            if state
                .flags
                .intersects(Flags::DEACTIVATED | Flags::TERMINATED)
            {
                return Ok(Item::synthetic(ItemType::Terminate));
            }

            if state.flags.contains(Flags::SEND_DEVICE_AVAILABLE) {
                state.flags.remove(Flags::SEND_DEVICE_AVAILABLE);
                return Ok(Item::synthetic(ItemType::DeviceAvailable));
            }

            // The wakeup may be left over from a request that was cancelled
            // or timed out in the meantime; in that case, wait again.
            if let Some(position) = state.table.awaiting_head() {
                state.table.to_being_gotten(position);

                let slot = state.table.slot(position);
                let request = slot.request().map(Arc::clone);
                debug_assert!(request.is_some());

                return Ok(Item {
                    handle_index: slot.index(),
                    handle_seqnum: slot.seqnum(),
                    item_type: request
                        .as_deref()
                        .map(BlockRequest::item_type)
                        .unwrap_or(ItemType::Terminate),
                    request,
                });
            }
        }
    }

    /// Commits a get: the item was transferred to the worker and its slot
    /// now awaits completion. No-op for synthetic items.
    pub fn commit_item_get(&self, item: &Item) {
        if item.item_type.is_synthetic() {
            return;
        }

        let mut state = self.state.lock();
        let Some(position) = self.held_slot(&state, item, SlotState::BeingGotten) else {
            return;
        };

        if state.flags.contains(Flags::TERMINATED) {
            free_slot(&mut state.table, position, -EIO, -ENODEV);
        } else {
            state.table.to_awaiting_completion(position);
        }
    }

    /// Aborts a get: the transfer failed, and the item must become visible
    /// to consumers again.
    ///
    /// Aborted synthetic items re-arm the flag they were drawn from, so the
    /// notification is not lost.
    pub fn abort_item_get(&self, item: &Item) {
        match item.item_type {
            ItemType::DeviceAvailable => {
                self.submit_device_available_notification();
            }
            ItemType::Terminate => {}
            ItemType::FlushAndTerminate => {
                let mut state = self.state.lock();
                state.flags.insert(Flags::DEACTIVATED_NOT_FLUSHED);
            }
            _ => {
                let mut state = self.state.lock();
                let Some(position) = self.held_slot(&state, item, SlotState::BeingGotten) else {
                    return;
                };

                if state.flags.contains(Flags::TERMINATED) {
                    free_slot(&mut state.table, position, -EIO, -ENODEV);
                } else {
                    state.table.to_awaiting_get(position);
                    self.item_ready.notify_one();
                }
            }
        }
    }

    /// Begins completing the request identified by `(index, seqnum)`,
    /// moving its slot to `BeingCompleted`.
    ///
    /// Returns `Ok(None)` if the handle is stale (the request already
    /// completed, timed out, or was cancelled), which callers treat as
    /// silent success. Returns [`InvalidHandle`] for an out-of-range index
    /// or a slot that is not awaiting completion.
    pub fn begin_item_completion(
        &self,
        index: u16,
        seqnum: u64,
    ) -> Result<Option<Item>, InvalidHandle> {
        let mut state = self.state.lock();

        let Some(position) = state.table.position_of_handle(index) else {
            return Err(InvalidHandle { index });
        };

        if state.table.slot(position).seqnum() != seqnum {
            return Ok(None);
        }

        if state.table.slot(position).state() != SlotState::AwaitingCompletion {
            return Err(InvalidHandle { index });
        }

        state.table.to_being_completed(position);

        let slot = state.table.slot(position);
        let request = slot.request().map(Arc::clone);

        Ok(Some(Item {
            handle_index: slot.index(),
            handle_seqnum: slot.seqnum(),
            item_type: request
                .as_deref()
                .map(BlockRequest::item_type)
                .unwrap_or(ItemType::Terminate),
            request,
        }))
    }

    /// Commits a completion, freeing the slot and propagating the coerced
    /// result pair to the block layer.
    pub fn commit_item_completion(&self, item: &Item, neg_errno: NegErrno) {
        debug_assert!(!item.item_type.is_synthetic());

        let mut state = self.state.lock();
        let Some(position) = self.held_slot(&state, item, SlotState::BeingCompleted) else {
            return;
        };

        if state.flags.contains(Flags::TERMINATED) {
            free_slot(&mut state.table, position, -EIO, -ENODEV);
        } else {
            free_slot(
                &mut state.table,
                position,
                coerce_result(neg_errno),
                coerce_ioctl_result(neg_errno),
            );
        }
    }

    /// Aborts a completion: the reply transfer failed and the slot returns
    /// to `AwaitingCompletion` for a retry.
    pub fn abort_item_completion(&self, item: &Item) {
        debug_assert!(!item.item_type.is_synthetic());

        let mut state = self.state.lock();
        let Some(position) = self.held_slot(&state, item, SlotState::BeingCompleted) else {
            return;
        };

        if state.flags.contains(Flags::TERMINATED) {
            free_slot(&mut state.table, position, -EIO, -ENODEV);
        } else {
            state.table.to_awaiting_completion(position);
        }
    }

    // Resolves the slot a consumer holds through `item`. The slot cannot
    // have been recycled while held (timeouts re-arm on held states), so
    // the checks are debug assertions rather than runtime branches.
    fn held_slot(&self, state: &InverterState, item: &Item, expected: SlotState) -> Option<usize> {
        let position = state.table.position_of_handle(item.handle_index);
        debug_assert!(position.is_some(), "held item with invalid handle");

        let position = position?;
        let slot = state.table.slot(position);
        debug_assert_eq!(slot.seqnum(), item.handle_seqnum);
        debug_assert_eq!(slot.state(), expected);

        Some(position)
    }

    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        self.state.lock().table.check_invariants();
    }

    #[cfg(test)]
    pub(crate) fn free_len(&self) -> u32 {
        self.state.lock().table.free_len()
    }

    #[cfg(test)]
    pub(crate) fn awaiting_order(&self) -> Vec<u16> {
        self.state.lock().table.awaiting_order()
    }

    #[cfg(test)]
    pub(crate) fn slot_is_free(&self, index: u16) -> bool {
        let state = self.state.lock();
        let position = state
            .table
            .position_of_handle(index)
            .expect("valid handle index");
        state.table.slot(position).state() == SlotState::Free
    }
}

impl Drop for Inverter {
    fn drop(&mut self) {
        // The inverter may only be destroyed after termination, once every
        // slot has drained back to the free list.
        #[cfg(debug_assertions)]
        if !std::thread::panicking() {
            let state = self.state.get_mut();
            debug_assert!(state.flags.contains(Flags::TERMINATED));
            debug_assert!(
                state
                    .table
                    .positions()
                    .all(|p| state.table.slot(p).state() == SlotState::Free)
            );
        }
    }
}

// Must be called with the inverter lock held. Completes the slot's request
// with the given pair and recycles the slot; the channel send cannot block,
// so doing it under the lock is fine.
fn free_slot(table: &mut SlotTable, position: usize, error: NegErrno, error_ioctl: NegErrno) {
    if let Some(request) = table.to_free(position) {
        request.finish(error, error_ioctl);
    } else {
        debug_assert!(false, "occupied slot without request");
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use rand::RngExt;

    use super::*;
    use crate::errno::{ENOLINK, ENOSPC};
    use crate::request::FinishedRequest;

    fn test_config(capacity: u32) -> DeviceConfig {
        let mut config = DeviceConfig {
            size: 1 << 20,
            logical_block_size: 512,
            max_outstanding_reqs: capacity,
            supports_read: true,
            supports_write: true,
            supports_flush: true,
            ..DeviceConfig::default()
        };
        config.validate_and_adjust().expect("valid test config");
        config
    }

    fn submit_read(inverter: &Inverter) -> (RequestHandle, flume::Receiver<FinishedRequest>) {
        let (request, finished) = BlockRequest::read(0, 4096);
        let handle = inverter.submit_request(request).expect("submitted");
        (handle, finished)
    }

    // Gets the head item and commits the get, leaving the slot awaiting
    // completion.
    fn get_and_commit(inverter: &Inverter, interruptor: &Interruptor) -> Item {
        let item = inverter.begin_item_get(interruptor).expect("item");
        assert!(!item.item_type().is_synthetic());
        inverter.commit_item_get(&item);
        item
    }

    #[test]
    fn terminate_fails_pending_requests_with_eio() {
        let inverter = Inverter::new(&test_config(4));
        let (_, finished) = submit_read(&inverter);

        inverter.terminate();

        let outcome = finished.recv().expect("completed by terminate");
        assert_eq!(outcome.error, -EIO);
        assert_eq!(outcome.error_ioctl, -ENODEV);
        inverter.assert_invariants();
    }

    #[test]
    fn terminate_is_idempotent_and_definitive() {
        let inverter = Inverter::new(&test_config(2));
        inverter.terminate();
        inverter.terminate();

        let (request, finished) = BlockRequest::read(0, 4096);
        assert_eq!(
            inverter.submit_request(request),
            Err(SubmitError::Terminated)
        );
        assert_eq!(finished.recv().expect("failed request").error, -EIO);
    }

    #[test]
    fn stale_reply_after_terminate_is_a_no_op() {
        let inverter = Inverter::new(&test_config(4));
        let interruptor = Interruptor::new();

        let (handle, _finished) = submit_read(&inverter);
        let _item = get_and_commit(&inverter, &interruptor);

        inverter.terminate();
        inverter.assert_invariants();

        // The deferred reply carrying the old handle must not resolve.
        assert!(matches!(
            inverter.begin_item_completion(handle.index, handle.seqnum),
            Ok(None)
        ));
        assert!(inverter.slot_is_free(handle.index));
    }

    #[test]
    fn completion_with_out_of_range_index_is_invalid() {
        let inverter = Inverter::new(&test_config(4));

        assert!(matches!(
            inverter.begin_item_completion(0, 0),
            Err(InvalidHandle { index: 0 })
        ));
        assert!(matches!(
            inverter.begin_item_completion(5, 0),
            Err(InvalidHandle { index: 5 })
        ));

        inverter.terminate();
    }

    #[test]
    fn completion_of_slot_not_awaiting_completion_is_invalid() {
        let inverter = Inverter::new(&test_config(4));
        let (handle, _finished) = submit_read(&inverter);

        // Still awaiting get.
        assert!(matches!(
            inverter.begin_item_completion(handle.index, handle.seqnum),
            Err(InvalidHandle { index }) if index == handle.index
        ));

        inverter.terminate();
    }

    #[test]
    fn results_are_coerced_per_channel() {
        let inverter = Inverter::new(&test_config(4));
        let interruptor = Interruptor::new();

        for (reply, expected_block, expected_ioctl) in [
            (0, 0, 0),
            (-ENOLINK, -ENOLINK, -ENOLINK),
            (-ENOSPC, -ENOSPC, -ENOSPC),
            (-ETIMEDOUT, -ETIMEDOUT, -ETIMEDOUT),
            (-12345, -EIO, -EIO),
            (-crate::errno::ENOSYS, -EIO, -EIO),
            (-1, -EIO, -1),
        ] {
            let (_, finished) = submit_read(&inverter);
            let item = get_and_commit(&inverter, &interruptor);

            let begun = inverter
                .begin_item_completion(item.handle_index(), item.handle_seqnum())
                .expect("valid handle")
                .expect("not stale");
            inverter.commit_item_completion(&begun, reply);

            let outcome = finished.recv().expect("completed");
            assert_eq!(outcome.error, expected_block, "reply {reply}");
            assert_eq!(outcome.error_ioctl, expected_ioctl, "reply {reply}");
            inverter.assert_invariants();
        }

        inverter.terminate();
    }

    #[test]
    fn timeout_decisions_follow_slot_state() {
        let inverter = Inverter::new(&test_config(4));
        let interruptor = Interruptor::new();

        // Awaiting get: times out.
        let (handle, finished) = submit_read(&inverter);
        assert_eq!(inverter.timeout_request(handle), TimeoutDecision::Done);
        assert_eq!(finished.recv().expect("timed out").error, -ETIMEDOUT);

        // Stale handle: already dealt with.
        assert_eq!(inverter.timeout_request(handle), TimeoutDecision::Done);

        // Being gotten: the worker is mid-transfer.
        let (handle, _finished) = submit_read(&inverter);
        let item = inverter.begin_item_get(&interruptor).expect("item");
        assert_eq!(
            inverter.timeout_request(handle),
            TimeoutDecision::ResetTimer
        );

        // Awaiting completion: times out.
        inverter.commit_item_get(&item);
        assert_eq!(inverter.timeout_request(handle), TimeoutDecision::Done);

        // Being completed: mid-transfer again.
        let (handle, _finished) = submit_read(&inverter);
        let item = get_and_commit(&inverter, &interruptor);
        let begun = inverter
            .begin_item_completion(item.handle_index(), item.handle_seqnum())
            .expect("valid")
            .expect("not stale");
        assert_eq!(
            inverter.timeout_request(handle),
            TimeoutDecision::ResetTimer
        );

        inverter.commit_item_completion(&begun, 0);
        inverter.terminate();
    }

    #[test]
    fn timed_out_slot_is_reused_under_a_new_seqnum() {
        let inverter = Inverter::new(&test_config(1));
        let interruptor = Interruptor::new();

        let (first, _finished) = submit_read(&inverter);
        assert_eq!(first, RequestHandle { index: 1, seqnum: 0 });
        assert_eq!(inverter.timeout_request(first), TimeoutDecision::Done);

        let (second, _finished) = submit_read(&inverter);
        assert_eq!(second, RequestHandle { index: 1, seqnum: 1 });

        // The recycled slot serves the new request, not the old one.
        let item = inverter.begin_item_get(&interruptor).expect("item");
        assert_eq!(item.handle_seqnum(), 1);

        inverter.abort_item_get(&item);
        inverter.terminate();
    }

    #[test]
    fn aborted_get_is_seen_again_before_newer_requests() {
        let inverter = Inverter::new(&test_config(4));
        let interruptor = Interruptor::new();

        let (first, _f1) = submit_read(&inverter);
        let (_second, _f2) = submit_read(&inverter);

        let item = inverter.begin_item_get(&interruptor).expect("item");
        assert_eq!(item.handle_index(), first.index);
        inverter.abort_item_get(&item);

        assert_eq!(inverter.awaiting_order(), vec![1, 2]);

        inverter.terminate();
    }

    #[test]
    fn reactivation_requeues_in_flight_work_in_slot_order() {
        let inverter = Inverter::new(&test_config(4));
        let interruptor = Interruptor::new();

        let (_h1, _f1) = submit_read(&inverter);
        let (_h2, _f2) = submit_read(&inverter);
        let (_h3, _f3) = submit_read(&inverter);

        // Slots 1 and 2 are with the (dying) worker; slot 3 never got seen.
        let _ = get_and_commit(&inverter, &interruptor);
        let _ = get_and_commit(&inverter, &interruptor);

        inverter.deactivate(false);
        inverter.activate();
        inverter.assert_invariants();

        // In-flight work first, in slot order, then the never-seen request.
        assert_eq!(inverter.awaiting_order(), vec![1, 2, 3]);

        inverter.terminate();
    }

    #[test]
    fn deactivation_yields_terminate_items_and_holds_requests() {
        let inverter = Inverter::new(&test_config(4));
        let interruptor = Interruptor::new();

        inverter.deactivate(false);

        for _ in 0..3 {
            let item = inverter.begin_item_get(&interruptor).expect("item");
            assert_eq!(item.item_type(), ItemType::Terminate);
        }

        // Submissions during deactivation are accepted and held.
        let (handle, _finished) = submit_read(&inverter);
        let item = inverter.begin_item_get(&interruptor).expect("item");
        assert_eq!(item.item_type(), ItemType::Terminate);

        inverter.activate();

        // DEVICE_AVAILABLE is not pending, so the held request surfaces.
        let item = inverter.begin_item_get(&interruptor).expect("item");
        assert_eq!(item.handle_index(), handle.index);

        inverter.abort_item_get(&item);
        inverter.terminate();
    }

    #[test]
    fn flush_and_terminate_is_returned_exactly_once() {
        let inverter = Inverter::new(&test_config(2));
        let interruptor = Interruptor::new();

        inverter.deactivate(true);

        let item = inverter.begin_item_get(&interruptor).expect("item");
        assert_eq!(item.item_type(), ItemType::FlushAndTerminate);

        for _ in 0..3 {
            let item = inverter.begin_item_get(&interruptor).expect("item");
            assert_eq!(item.item_type(), ItemType::Terminate);
        }

        inverter.terminate();
    }

    #[test]
    fn flush_request_is_skipped_when_device_cannot_flush() {
        let mut config = DeviceConfig {
            size: 1 << 20,
            logical_block_size: 512,
            max_outstanding_reqs: 2,
            supports_read: true,
            ..DeviceConfig::default()
        };
        config.validate_and_adjust().expect("valid test config");

        let inverter = Inverter::new(&config);
        let interruptor = Interruptor::new();

        inverter.deactivate(true);

        let item = inverter.begin_item_get(&interruptor).expect("item");
        assert_eq!(item.item_type(), ItemType::Terminate);

        inverter.terminate();
    }

    #[test]
    fn aborted_flush_and_terminate_is_rearmed() {
        let inverter = Inverter::new(&test_config(2));
        let interruptor = Interruptor::new();

        inverter.deactivate(true);

        let item = inverter.begin_item_get(&interruptor).expect("item");
        assert_eq!(item.item_type(), ItemType::FlushAndTerminate);
        inverter.abort_item_get(&item);

        let item = inverter.begin_item_get(&interruptor).expect("item");
        assert_eq!(item.item_type(), ItemType::FlushAndTerminate);

        inverter.terminate();
    }

    #[test]
    fn aborted_device_available_is_rearmed() {
        let inverter = Inverter::new(&test_config(2));
        let interruptor = Interruptor::new();

        inverter.submit_device_available_notification();

        let item = inverter.begin_item_get(&interruptor).expect("item");
        assert_eq!(item.item_type(), ItemType::DeviceAvailable);
        inverter.abort_item_get(&item);

        let item = inverter.begin_item_get(&interruptor).expect("item");
        assert_eq!(item.item_type(), ItemType::DeviceAvailable);
        inverter.commit_item_get(&item);

        inverter.terminate();
    }

    #[test]
    fn device_available_survives_a_deactivation_cycle() {
        let inverter = Inverter::new(&test_config(2));
        let interruptor = Interruptor::new();

        inverter.submit_device_available_notification();
        inverter.deactivate(false);

        // While deactivated, only termination is visible.
        let item = inverter.begin_item_get(&interruptor).expect("item");
        assert_eq!(item.item_type(), ItemType::Terminate);

        inverter.activate();

        let item = inverter.begin_item_get(&interruptor).expect("item");
        assert_eq!(item.item_type(), ItemType::DeviceAvailable);

        inverter.terminate();
    }

    #[test]
    fn unsupported_request_consumes_no_slot() {
        let inverter = Inverter::new(&test_config(1));

        let (request, finished) = BlockRequest::discard(0, 4096);
        assert_eq!(
            inverter.submit_request(request),
            Err(SubmitError::Unsupported)
        );

        let outcome = finished.recv().expect("failed request");
        assert_eq!(outcome.error, -EOPNOTSUPP);
        assert_eq!(outcome.error_ioctl, -ENOTTY);

        // The only slot is still free.
        assert_eq!(inverter.free_len(), 1);

        inverter.terminate();
    }

    #[test]
    fn interrupt_cancels_a_blocked_get() {
        let inverter = Arc::new(Inverter::new(&test_config(1)));
        let interruptor = Interruptor::new();
        let waiter_interruptor = interruptor.clone();
        let waiter_inverter = Arc::clone(&inverter);

        let waiter =
            std::thread::spawn(move || waiter_inverter.begin_item_get(&waiter_interruptor));

        std::thread::sleep(std::time::Duration::from_millis(20));
        interruptor.interrupt();

        assert!(matches!(
            waiter.join().expect("waiter thread"),
            Err(Interrupted)
        ));

        inverter.terminate();
    }

    #[test]
    fn commit_get_after_terminate_cancels_the_slot() {
        let inverter = Inverter::new(&test_config(2));
        let interruptor = Interruptor::new();

        let (handle, finished) = submit_read(&inverter);
        let item = inverter.begin_item_get(&interruptor).expect("item");

        inverter.terminate();
        inverter.commit_item_get(&item);

        assert_eq!(finished.recv().expect("cancelled").error, -EIO);
        assert!(inverter.slot_is_free(handle.index));
        inverter.assert_invariants();
    }

    #[test]
    fn abort_get_after_terminate_cancels_the_slot() {
        let inverter = Inverter::new(&test_config(2));
        let interruptor = Interruptor::new();

        let (handle, finished) = submit_read(&inverter);
        let item = inverter.begin_item_get(&interruptor).expect("item");

        inverter.terminate();
        inverter.abort_item_get(&item);

        assert_eq!(finished.recv().expect("cancelled").error, -EIO);
        assert!(inverter.slot_is_free(handle.index));
        inverter.assert_invariants();
    }

    #[test]
    fn randomized_operation_sequences_preserve_invariants() {
        let mut rng = rand::rng();

        let capacity = 8;
        let inverter = Inverter::new(&test_config(capacity));
        let interruptor = Interruptor::new();

        let mut gotten: Vec<Item> = Vec::new();
        let mut completable: Vec<(u16, u64)> = Vec::new();
        let mut completing: Vec<Item> = Vec::new();
        let mut handles: Vec<RequestHandle> = Vec::new();
        let mut receivers = Vec::new();
        let mut deactivated = false;

        for _ in 0..4000 {
            match rng.random_range(0u32..12) {
                0..=2 => {
                    if inverter.free_len() > 0 {
                        let (request, finished) = match rng.random_range(0u32..3) {
                            0 => BlockRequest::read(0, 4096),
                            1 => BlockRequest::write(4096, Bytes::from_static(&[0xab; 512])),
                            _ => BlockRequest::flush(),
                        };
                        let handle = inverter.submit_request(request).expect("slot free");
                        handles.push(handle);
                        receivers.push(finished);
                    }
                }
                3..=4 => {
                    if !deactivated && !inverter.awaiting_order().is_empty() {
                        let item = inverter.begin_item_get(&interruptor).expect("item ready");
                        assert!(!item.item_type().is_synthetic());
                        gotten.push(item);
                    }
                }
                5 => {
                    if !gotten.is_empty() {
                        let item = gotten.swap_remove(rng.random_range(0..gotten.len()));
                        let handle = (item.handle_index(), item.handle_seqnum());
                        inverter.commit_item_get(&item);
                        completable.push(handle);
                    }
                }
                6 => {
                    if !gotten.is_empty() {
                        let item = gotten.swap_remove(rng.random_range(0..gotten.len()));
                        inverter.abort_item_get(&item);
                    }
                }
                7 => {
                    if !completable.is_empty() {
                        let (index, seqnum) =
                            completable.swap_remove(rng.random_range(0..completable.len()));
                        match inverter.begin_item_completion(index, seqnum) {
                            Ok(Some(item)) => completing.push(item),
                            Ok(None) => {} // stale: timed out in the meantime
                            Err(err) => panic!("unexpected invalid handle: {err}"),
                        }
                    }
                }
                8 => {
                    if !completing.is_empty() {
                        let item = completing.swap_remove(rng.random_range(0..completing.len()));
                        let replies = [0, 0, 0, -ENOLINK, -ENOSPC, -42, 7];
                        let reply = replies[rng.random_range(0..replies.len())];
                        inverter.commit_item_completion(&item, reply);
                    }
                }
                9 => {
                    if !completing.is_empty() {
                        let item = completing.swap_remove(rng.random_range(0..completing.len()));
                        let handle = (item.handle_index(), item.handle_seqnum());
                        inverter.abort_item_completion(&item);
                        completable.push(handle);
                    }
                }
                10 => {
                    if !handles.is_empty() {
                        // Possibly stale; the inverter must cope either way.
                        let handle = handles[rng.random_range(0..handles.len())];
                        let _ = inverter.timeout_request(handle);
                    }
                }
                _ => {
                    if !deactivated && gotten.is_empty() && completing.is_empty() {
                        inverter.deactivate(rng.random_range(0..2) == 0);
                        deactivated = true;
                    } else if deactivated {
                        inverter.activate();
                        deactivated = false;
                        // Formerly completable slots are back in the queue.
                        completable.clear();
                    }
                }
            }

            inverter.assert_invariants();
        }

        // Drain: cancel everything and check the table ends fully free.
        inverter.terminate();
        for item in gotten.drain(..) {
            inverter.abort_item_get(&item);
        }
        for item in completing.drain(..) {
            inverter.commit_item_completion(&item, 0);
        }
        inverter.assert_invariants();
        assert_eq!(inverter.free_len(), capacity);
    }
}
