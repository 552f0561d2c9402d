// SPDX-License-Identifier: Apache-2.0

//! Codec for ioctl command words in the Linux `_IOC` bit layout.
//!
//! A command packs, from the low bits up: an 8-bit command number, an 8-bit
//! type, a 14-bit argument size, and a 2-bit direction. The direction is
//! from the driver's point of view: a `READ` argument is input the driver
//! reads, a `WRITE` argument is output the driver produces for the caller.

/// No data transfer.
pub const NONE: u32 = 0;
/// The driver writes the argument; its contents flow back to the caller.
pub const WRITE: u32 = 1;
/// The driver reads the argument; the caller's contents flow to it.
pub const READ: u32 = 2;

const NR_BITS: u32 = 8;
const TYPE_BITS: u32 = 8;
const SIZE_BITS: u32 = 14;

const NR_SHIFT: u32 = 0;
const TYPE_SHIFT: u32 = NR_SHIFT + NR_BITS;
const SIZE_SHIFT: u32 = TYPE_SHIFT + TYPE_BITS;
const DIR_SHIFT: u32 = SIZE_SHIFT + SIZE_BITS;

/// Builds a command word from its parts.
pub const fn ioc(dir: u32, ty: u32, nr: u32, size: u32) -> u32 {
    (dir << DIR_SHIFT) | (ty << TYPE_SHIFT) | (nr << NR_SHIFT) | (size << SIZE_SHIFT)
}

/// Builds a command with no argument.
pub const fn io(ty: u32, nr: u32) -> u32 {
    ioc(NONE, ty, nr, 0)
}

/// Builds a command whose argument the driver reads.
pub const fn ior(ty: u32, nr: u32, size: u32) -> u32 {
    ioc(READ, ty, nr, size)
}

/// Builds a command whose argument the driver writes.
pub const fn iow(ty: u32, nr: u32, size: u32) -> u32 {
    ioc(WRITE, ty, nr, size)
}

/// Builds a command whose argument flows both ways.
pub const fn iowr(ty: u32, nr: u32, size: u32) -> u32 {
    ioc(READ | WRITE, ty, nr, size)
}

/// Extracts the direction bits of a command.
pub const fn dir(command: u32) -> u32 {
    (command >> DIR_SHIFT) & ((1 << 2) - 1)
}

/// Extracts the argument size of a command, in bytes.
pub const fn size(command: u32) -> u32 {
    (command >> SIZE_SHIFT) & ((1 << SIZE_BITS) - 1)
}

/// Extracts the type byte of a command.
pub const fn ty(command: u32) -> u32 {
    (command >> TYPE_SHIFT) & ((1 << TYPE_BITS) - 1)
}

/// Extracts the command number.
pub const fn nr(command: u32) -> u32 {
    (command >> NR_SHIFT) & ((1 << NR_BITS) - 1)
}

/// Returns whether a command is acceptable for a BDUS device: directionless
/// commands carry no argument, everything else carries an argument smaller
/// than 16 KiB.
pub const fn is_valid_command(command: u32) -> bool {
    let arg_size = size(command);

    match dir(command) {
        NONE => arg_size == 0,
        _ => arg_size > 0 && arg_size < (1 << SIZE_BITS),
    }
}
