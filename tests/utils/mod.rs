//! Useful library code for tests
#![allow(dead_code)]

use std::collections::HashMap;

use sdmmc_card::{BlockBackend, Card, Request, Response, BLOCK_LEN};

/// A RAM-backed medium with host-controllable presence and write-protect
/// switches.
pub struct MemDisk {
    pub bytes: Vec<u8>,
    pub read_only: bool,
    pub present: bool,
}

impl MemDisk {
    /// A medium filled with an offset-dependent pattern, so reads can be
    /// checked against the address they should have come from.
    pub fn patterned(len: usize) -> MemDisk {
        MemDisk {
            bytes: (0..len).map(pattern_byte).collect(),
            read_only: false,
            present: true,
        }
    }

    pub fn zeroed(len: usize) -> MemDisk {
        MemDisk {
            bytes: vec![0; len],
            read_only: false,
            present: true,
        }
    }
}

/// The fill byte `MemDisk::patterned` puts at `offset`.
pub fn pattern_byte(offset: usize) -> u8 {
    (offset % 251) as u8 ^ (offset / 251 % 256) as u8
}

#[derive(Debug)]
pub enum Error {
    /// Asked for bytes we don't have
    OutOfBounds,
}

impl BlockBackend for MemDisk {
    type Error = Error;

    fn read(&mut self, offset: u64, buffer: &mut [u8]) -> Result<(), Error> {
        let offset = offset as usize;
        let source = self
            .bytes
            .get(offset..offset + buffer.len())
            .ok_or(Error::OutOfBounds)?;
        buffer.copy_from_slice(source);
        Ok(())
    }

    fn write(&mut self, offset: u64, buffer: &[u8]) -> Result<(), Error> {
        let offset = offset as usize;
        let target = self
            .bytes
            .get_mut(offset..offset + buffer.len())
            .ok_or(Error::OutOfBounds)?;
        target.copy_from_slice(buffer);
        Ok(())
    }

    fn num_sectors(&self) -> u64 {
        (self.bytes.len() / BLOCK_LEN) as u64
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn is_present(&self) -> bool {
        self.present
    }
}

/// A medium big enough for high-capacity cards, held as a map of written
/// blocks over an implicit sea of zeroes.
pub struct SparseDisk {
    pub sectors: u64,
    pub blocks: HashMap<u64, [u8; BLOCK_LEN]>,
}

impl SparseDisk {
    pub fn gib(gib: u64) -> SparseDisk {
        SparseDisk {
            sectors: gib * 1024 * 1024 * 2,
            blocks: HashMap::new(),
        }
    }
}

impl BlockBackend for SparseDisk {
    type Error = Error;

    fn read(&mut self, offset: u64, buffer: &mut [u8]) -> Result<(), Error> {
        if offset + buffer.len() as u64 > self.sectors * BLOCK_LEN as u64 {
            return Err(Error::OutOfBounds);
        }
        for (i, byte) in buffer.iter_mut().enumerate() {
            let at = offset + i as u64;
            *byte = self
                .blocks
                .get(&(at / BLOCK_LEN as u64))
                .map(|block| block[(at % BLOCK_LEN as u64) as usize])
                .unwrap_or(0);
        }
        Ok(())
    }

    fn write(&mut self, offset: u64, buffer: &[u8]) -> Result<(), Error> {
        if offset + buffer.len() as u64 > self.sectors * BLOCK_LEN as u64 {
            return Err(Error::OutOfBounds);
        }
        for (i, &byte) in buffer.iter().enumerate() {
            let at = offset + i as u64;
            let block = self
                .blocks
                .entry(at / BLOCK_LEN as u64)
                .or_insert([0; BLOCK_LEN]);
            block[(at % BLOCK_LEN as u64) as usize] = byte;
        }
        Ok(())
    }

    fn num_sectors(&self) -> u64 {
        self.sectors
    }

    fn is_read_only(&self) -> bool {
        false
    }

    fn is_present(&self) -> bool {
        true
    }
}

/// A 64 MiB patterned card in native framing.
pub fn native_card() -> Card<MemDisk> {
    let _ = env_logger::builder().is_test(true).try_init();
    Card::new(MemDisk::patterned(64 * 1024 * 1024), false)
}

/// A 64 MiB patterned card in SPI framing.
pub fn spi_card() -> Card<MemDisk> {
    let _ = env_logger::builder().is_test(true).try_init();
    Card::new(MemDisk::patterned(64 * 1024 * 1024), true)
}

/// Pull the 32-bit card status out of an R1-class response.
pub fn status_of(response: &Response) -> u32 {
    assert_eq!(response.len(), 4, "not an R1-class response");
    u32::from_be_bytes([response[0], response[1], response[2], response[3]])
}

/// Identification dance up to `Transfer` state; returns the assigned RCA.
pub fn bring_to_transfer(card: &mut Card<MemDisk>) -> u16 {
    card.do_command(Request::new(0, 0));
    card.do_command(Request::new(8, 0x1aa));
    card.do_command(Request::new(55, 0));
    card.do_command(Request::new(41, 0x00ff_8000));
    card.do_command(Request::new(2, 0));
    let r6 = card.do_command(Request::new(3, 0));
    let rca = u16::from_be_bytes([r6[0], r6[1]]);
    card.do_command(Request::new(7, u32::from(rca) << 16));
    rca
}

/// Run a complete CMD42 data phase with the given control/payload bytes,
/// zero-padded to the current block length.
pub fn lock_data_phase(card: &mut Card<MemDisk>, blk_len: usize, payload: &[u8]) -> Response {
    let response = card.do_command(Request::new(42, 0));
    for i in 0..blk_len {
        card.write_data(payload.get(i).copied().unwrap_or(0));
    }
    response
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
