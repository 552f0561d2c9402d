// SPDX-License-Identifier: Apache-2.0

//! The fixed 64-byte reply-or-item record.

use bytemuck::{Pod, Zeroable};

use bdus_core::ItemType;

/// One shared record, overlaying two views on the same bytes.
///
/// The *item* view (device → worker) and the *reply* view (worker →
/// device) share a common prefix: the buffer routing fields and the
/// `(seqnum, index)` handle. They differ only in how the bytes after the
/// prefix are read: the item view carries `{type, arg32, arg64}`, while
/// the reply view has a signed 32-bit errno where `arg32` sits.
///
/// Field order and widths are wire-stable; the struct is exactly 64 bytes
/// with no implicit padding, and fields are stored in the target's byte
/// order (little-endian on every supported target).
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ReplyOrItem {
    /// Worker-buffer address cookie or preallocated buffer index,
    /// depending on `use_preallocated_buffer`. The transceiver never
    /// dereferences this as a pointer; in worker-buffer mode the payload
    /// buffer is passed explicitly to each call.
    pub user_ptr_or_buffer_index: u64,

    /// The *seqnum* portion of the handle.
    pub handle_seqnum: u64,

    /// The *index* portion of the handle; 0 means "synthetic item" on the
    /// item path and "no reply" on the reply path.
    pub handle_index: u16,

    /// Nonzero to route the payload through a preallocated buffer.
    pub use_preallocated_buffer: u8,

    /// Item view: the item's type tag. Reply view: padding.
    type_or_padding: u8,

    /// Item view: the 32-bit argument. Reply view: the signed errno.
    arg32_or_error: u32,

    /// The 64-bit argument (item view only).
    pub arg64: u64,

    padding: [u8; 32],
}

const _: () = assert!(size_of::<ReplyOrItem>() == 64);
const _: () = assert!(std::mem::offset_of!(ReplyOrItem, handle_seqnum) == 8);
const _: () = assert!(std::mem::offset_of!(ReplyOrItem, handle_index) == 16);
const _: () = assert!(std::mem::offset_of!(ReplyOrItem, use_preallocated_buffer) == 18);
const _: () = assert!(std::mem::offset_of!(ReplyOrItem, type_or_padding) == 19);
const _: () = assert!(std::mem::offset_of!(ReplyOrItem, arg32_or_error) == 20);
const _: () = assert!(std::mem::offset_of!(ReplyOrItem, arg64) == 24);

impl ReplyOrItem {
    /// Item view: the raw type tag.
    pub fn item_type_tag(&self) -> u8 {
        self.type_or_padding
    }

    /// Item view: the type, if the tag is known.
    pub fn item_type(&self) -> Option<ItemType> {
        ItemType::try_from(self.type_or_padding).ok()
    }

    /// Item view: sets the type tag.
    pub fn set_item_type(&mut self, item_type: ItemType) {
        self.type_or_padding = item_type.into();
    }

    /// Item view: the 32-bit argument.
    pub fn arg32(&self) -> u32 {
        self.arg32_or_error
    }

    /// Item view: sets the 32-bit argument.
    pub fn set_arg32(&mut self, arg32: u32) {
        self.arg32_or_error = arg32;
    }

    /// Reply view: the errno value. 0 on success, a positive errno on
    /// failure, or the abort sentinel.
    pub fn error(&self) -> i32 {
        self.arg32_or_error as i32
    }

    /// Reply view: sets the errno value.
    pub fn set_error(&mut self, error: i32) {
        self.arg32_or_error = error as u32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_and_reply_views_share_storage() {
        let mut record = ReplyOrItem::zeroed();

        record.set_arg32(0x1234_5678);
        assert_eq!(record.error(), 0x1234_5678);

        record.set_error(-5);
        assert_eq!(record.arg32(), (-5i32) as u32);
    }

    #[test]
    fn type_tag_round_trips() {
        let mut record = ReplyOrItem::zeroed();

        record.set_item_type(ItemType::FuaWrite);
        assert_eq!(record.item_type_tag(), 8);
        assert_eq!(record.item_type(), Some(ItemType::FuaWrite));

        record.type_or_padding = 200;
        assert_eq!(record.item_type(), None);
    }
}
