//! Saving and restoring the complete card state.
//!
//! The whole data model serialises into one flat, big-endian byte stream so
//! a card can be carried across a machine snapshot and resumed verbatim -
//! including a half-finished multi-block transfer.
//!
//! The OCR and the power-up delay travel in a conditional trailer that is
//! only written while the power-up sequence is still incomplete. A snapshot
//! taken after power-up (the overwhelmingly common case) omits it, and
//! restoring such a snapshot forces the power-up bit on, so a card never
//! comes back waiting for a timer nobody armed.
//!
//! Configuration that belongs to the *machine* rather than the card - the
//! framing mode, the medium geometry, the write-protect switch - is not in
//! the stream. Restore onto a card constructed over the same medium.

use alloc::vec::Vec;

use byteorder::{BigEndian, ByteOrder};

use crate::blockdevice::BlockBackend;
use crate::card::{Card, CardState};
use crate::registers::{WpGroups, OCR_POWER_UP};

/// Current snapshot stream version.
pub const SNAPSHOT_VERSION: u8 = 1;

/// Why a snapshot stream was rejected.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RestoreError {
    /// The stream ended before the state did
    Truncated,
    /// The stream was written by an incompatible version of this crate
    BadVersion(u8),
    /// The card-state code is not one of ours
    BadState(u8),
    /// A length field exceeds its register's bounds
    BadLength,
    /// Data left over after the state was read
    TrailingBytes,
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], RestoreError> {
        if self.buf.len() < len {
            return Err(RestoreError::Truncated);
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, RestoreError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, RestoreError> {
        Ok(BigEndian::read_u16(self.take(2)?))
    }

    fn u32(&mut self) -> Result<u32, RestoreError> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }

    fn u64(&mut self) -> Result<u64, RestoreError> {
        Ok(BigEndian::read_u64(self.take(8)?))
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], RestoreError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }
}

fn push_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn push_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn push_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_be_bytes());
}

impl<B> Card<B>
where
    B: BlockBackend,
{
    /// Serialise the card state.
    pub fn save_state(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(SNAPSHOT_VERSION);
        out.push(self.state.code());
        out.extend_from_slice(&self.cid);
        out.extend_from_slice(&self.csd);
        push_u16(&mut out, self.rca);
        push_u32(&mut out, self.card_status);
        out.extend_from_slice(&self.sd_status);
        push_u32(&mut out, self.vhs);

        push_u64(&mut out, self.wp_groups.len());
        for word in self.wp_groups.words() {
            push_u64(&mut out, *word);
        }

        push_u32(&mut out, self.blk_len);
        push_u32(&mut out, self.multi_blk_cnt);
        push_u32(&mut out, self.erase_start);
        push_u32(&mut out, self.erase_end);
        out.extend_from_slice(&self.pwd);
        push_u32(&mut out, self.pwd_len as u32);
        out.extend_from_slice(&self.function_group);
        out.push(self.current_cmd);
        out.push(self.expecting_acmd as u8);
        push_u32(&mut out, self.blk_written);
        push_u64(&mut out, self.data_start);
        push_u32(&mut out, self.data_offset as u32);
        out.extend_from_slice(&self.data);
        out.push(self.enable as u8);

        // The OCR trailer only exists while power-up is incomplete, so the
        // pending-delay semantics survive exactly when they matter
        if self.ocr & OCR_POWER_UP == 0 {
            out.push(1);
            push_u32(&mut out, self.ocr);
            out.push(self.power_up_pending as u8);
        } else {
            out.push(0);
        }
        out
    }

    /// Restore a state produced by [`Card::save_state`].
    ///
    /// On error the card is left in whatever half-restored shape it reached;
    /// callers should [`Card::reset`] it before carrying on.
    pub fn restore_state(&mut self, buf: &[u8]) -> Result<(), RestoreError> {
        let mut r = Reader { buf };

        let version = r.u8()?;
        if version != SNAPSHOT_VERSION {
            return Err(RestoreError::BadVersion(version));
        }
        let state_code = r.u8()?;
        self.state =
            CardState::from_code(state_code).ok_or(RestoreError::BadState(state_code))?;
        self.cid = r.array::<16>()?;
        self.csd = r.array::<16>()?;
        self.rca = r.u16()?;
        self.card_status = r.u32()?;
        self.sd_status = r.array::<64>()?;
        self.vhs = r.u32()?;

        let wp_bit_count = r.u64()?;
        let mut words = Vec::new();
        for _ in 0..wp_bit_count.div_ceil(64) {
            words.push(r.u64()?);
        }
        self.wp_groups =
            WpGroups::from_raw(wp_bit_count, words).ok_or(RestoreError::BadLength)?;

        self.blk_len = r.u32()?;
        self.multi_blk_cnt = r.u32()?;
        self.erase_start = r.u32()?;
        self.erase_end = r.u32()?;
        self.pwd = r.array::<16>()?;
        let pwd_len = r.u32()? as usize;
        if pwd_len > self.pwd.len() {
            return Err(RestoreError::BadLength);
        }
        self.pwd_len = pwd_len;
        self.function_group = r.array::<6>()?;
        self.current_cmd = r.u8()?;
        self.expecting_acmd = r.u8()? != 0;
        self.blk_written = r.u32()?;
        self.data_start = r.u64()?;
        let data_offset = r.u32()? as usize;
        if data_offset > self.data.len() {
            return Err(RestoreError::BadLength);
        }
        self.data_offset = data_offset;
        self.data = r.array::<512>()?;
        self.enable = r.u8()? != 0;

        if r.u8()? != 0 {
            // Power-up was incomplete when this snapshot was taken
            self.ocr = r.u32()?;
            self.power_up_pending = r.u8()? != 0;
        } else {
            // No trailer: the card had finished powering up
            self.ocr |= OCR_POWER_UP;
            self.power_up_pending = false;
        }

        if !r.buf.is_empty() {
            return Err(RestoreError::TrailingBytes);
        }
        Ok(())
    }
}
