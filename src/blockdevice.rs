//! Traits and types for the backing storage behind an emulated card.
//!
//! The card core never touches a medium directly - everything goes through
//! the [`BlockBackend`] collaborator, which is addressed in raw byte
//! offsets. A backend is typically a disk image file or a chunk of RAM.

/// All SD hardware blocks are a fixed length of 512 bytes. Standard-capacity
/// cards may configure shorter *transfer* block lengths (CMD16), but the
/// medium itself is always laid out in 512-byte units.
pub const BLOCK_LEN: usize = 512;

/// Sometimes we want `LEN` as a `u32` and the casts don't look nice.
pub const BLOCK_LEN_U32: u32 = 512;

/// Sometimes we want `LEN` as a `u64` and the casts don't look nice.
pub const BLOCK_LEN_U64: u64 = 512;

/// A backing store for an emulated SD card.
///
/// Reads and writes are synchronous and byte-addressed; the card core only
/// ever asks for runs that fit inside one 512-byte block. I/O failures are
/// *not* part of the card protocol - the core logs them and carries on with
/// whatever is in its buffer, which matches how the modelled hardware
/// behaves when the host-side medium misbehaves.
///
/// Presence and write-protection are sampled at reset and on
/// [`crate::Card::media_change`]; a backend representing a removable medium
/// should flip [`BlockBackend::is_present`] and have the host call
/// `media_change`.
pub trait BlockBackend {
    /// The error type returned by the backing store. Only ever logged.
    type Error: core::fmt::Debug;

    /// Fill `buffer` from the medium, starting at byte `offset`.
    fn read(&mut self, offset: u64, buffer: &mut [u8]) -> Result<(), Self::Error>;

    /// Write `buffer` to the medium, starting at byte `offset`.
    fn write(&mut self, offset: u64, buffer: &[u8]) -> Result<(), Self::Error>;

    /// Total size of the medium, in 512-byte sectors.
    ///
    /// Sampled once per reset; the card's CSD and write-protection bitmap
    /// are sized from it.
    fn num_sectors(&self) -> u64;

    /// Is the physical write-protect switch on?
    fn is_read_only(&self) -> bool;

    /// Is a medium present at all?
    ///
    /// While this returns `false` the card ignores every command and data
    /// byte.
    fn is_present(&self) -> bool;
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
