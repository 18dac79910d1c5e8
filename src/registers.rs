//! The card register model: OCR, CID, CSD, SCR and the write-protection
//! group bitmap.
//!
//! The fixed-format registers are generated once per reset from the medium
//! capacity. Each builder has matching bit-field readers (via
//! `define_field!`) so the byte-exact layouts can be verified in isolation
//! from the state machine.

use alloc::vec;
use alloc::vec::Vec;

use crate::proto::crc7;

// =============================================================================
// OCR - Operating Conditions Register
// =============================================================================

/// Power-up sequence complete.
pub const OCR_POWER_UP: u32 = 0x8000_0000;

/// Card Capacity Status: set for high-capacity (SDHC) cards.
pub const OCR_HIGH_CAPACITY: u32 = 0x4000_0000;

/// OCR value at reset: every voltage window advertised, power-up pending.
pub const OCR_DEFAULT: u32 = 0x00ff_ff00;

/// An ACMD41 with any of these argument bits set is a real operating
/// condition request; all-zero means the host is only enquiring.
pub const ACMD41_ENQUIRY_MASK: u32 = 0x00ff_ffff;

// =============================================================================
// Medium geometry
// =============================================================================

/// 512-byte hardware blocks.
pub const HWBLOCK_SHIFT: u32 = 9;
/// 32 blocks per erase sector (16 KiB).
const SECTOR_SHIFT: u32 = 5;
/// 128 sectors per write-protection group (2 MiB).
const WPGROUP_SHIFT: u32 = 7;
/// 512 blocks per capacity multiplier unit in the v1 CSD.
const CMULT_SHIFT: u32 = 9;

/// Size of one write-protection group in bytes (2 MiB).
pub const WPGROUP_SIZE: u64 = 1 << (HWBLOCK_SHIFT + SECTOR_SHIFT + WPGROUP_SHIFT);

/// Which write-protection group does this byte address fall into?
pub fn wp_group_of(addr: u64) -> u64 {
    addr >> (HWBLOCK_SHIFT + SECTOR_SHIFT + WPGROUP_SHIFT)
}

/// Capacities above this encode as SDHC (v2 CSD, block addressing).
pub const HIGH_CAPACITY_THRESHOLD: u64 = 0x4000_0000;

// =============================================================================
// CID - Card Identification register
// =============================================================================

// The identity this emulated card reports. Nothing interprets these beyond
// displaying them, but the layout around them is fixed.
const CID_MID: u8 = 0xaa;
const CID_OID: &[u8; 2] = b"XY";
const CID_PNM: &[u8; 5] = b"SDEMU";
const CID_PRV: u8 = 0x01;
const CID_PSN: u32 = 0xdead_beef;
const CID_MDT_YEAR: u16 = 2018;
const CID_MDT_MONTH: u8 = 12;

/// The 16-byte Card Identification register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cid {
    /// The 16 bytes of the CID
    pub data: [u8; 16],
}

impl Cid {
    /// Generate the CID this card reports, CRC-7 trailer included.
    pub fn build() -> Cid {
        let mut data = [0u8; 16];
        data[0] = CID_MID;
        data[1..3].copy_from_slice(CID_OID);
        data[3..8].copy_from_slice(CID_PNM);
        data[8] = CID_PRV;
        data[9..13].copy_from_slice(&CID_PSN.to_be_bytes());
        data[13] = ((CID_MDT_YEAR - 2000) / 10) as u8;
        data[14] = (((CID_MDT_YEAR % 10) as u8) << 4) | CID_MDT_MONTH;
        data[15] = crc7(&data[..15]);
        Cid { data }
    }

    define_field!(manufacturer_id, u8, 0, 0, 8);
    define_field!(product_revision, u8, 8, 0, 8);
    define_field!(crc, u8, 15, 0, 8);

    /// OEM/Application ID, two ASCII characters.
    pub fn oem_id(&self) -> &[u8] {
        &self.data[1..3]
    }

    /// Product name, five ASCII characters.
    pub fn product_name(&self) -> &[u8] {
        &self.data[3..8]
    }

    /// Product serial number.
    pub fn serial_number(&self) -> u32 {
        u32::from_be_bytes([self.data[9], self.data[10], self.data[11], self.data[12]])
    }
}

// =============================================================================
// CSD - Card Specific Data register
// =============================================================================

/// Bits of each CSD byte the host may program through CMD27. Everything
/// else is read-only and must match on a program attempt.
pub const CSD_RW_MASK: [u8; 16] = [
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xfc, 0xfe, //
];

/// Card Specific Data, version 1 (standard capacity)
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CsdV1 {
    /// The 16-bytes of data in this Card Specific Data block
    pub data: [u8; 16],
}

/// Card Specific Data, version 2 (high capacity)
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CsdV2 {
    /// The 16-bytes of data in this Card Specific Data block
    pub data: [u8; 16],
}

/// Card Specific Data
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Csd {
    /// A version 1 CSD
    V1(CsdV1),
    /// A version 2 CSD
    V2(CsdV2),
}

impl CsdV1 {
    /// Encode a standard-capacity CSD for a medium of `size` bytes.
    ///
    /// `size` must be a multiple of the 256 KiB capacity granule; the
    /// device-size field is derived by dividing it out.
    pub fn for_capacity(size: u64) -> CsdV1 {
        let csize = (size >> (CMULT_SHIFT + HWBLOCK_SHIFT)).wrapping_sub(1) as u32;
        let sectsize: u32 = (1 << (SECTOR_SHIFT + 1)) - 1;
        let wpsize: u32 = (1 << (WPGROUP_SHIFT + 1)) - 1;
        let mut data = [0u8; 16];
        data[0] = 0x00; // CSD structure
        data[1] = 0x26; // Data read access-time-1
        data[2] = 0x00; // Data read access-time-2
        data[3] = 0x5a; // Max. data transfer rate
        data[4] = 0x5f; // Card Command Classes
        data[5] = 0x50 | HWBLOCK_SHIFT as u8; // Max. read data block length
        data[6] = 0xe0 | ((csize >> 10) & 0x03) as u8; // Partial blocks for read allowed
        data[7] = ((csize >> 2) & 0xff) as u8; // Device size
        data[8] = 0x3f | ((csize << 6) & 0xc0) as u8; // Max. read current
        data[9] = 0xfc | ((CMULT_SHIFT - 2) >> 1) as u8; // Max. write current
        data[10] = 0x40 | (((CMULT_SHIFT - 2) << 7) & 0x80) as u8 | (sectsize >> 1) as u8; // Erase sector size
        data[11] = ((sectsize << 7) & 0x80) as u8 | wpsize as u8; // Write protect group size
        data[12] = 0x90 | (HWBLOCK_SHIFT >> 2) as u8; // Write speed factor
        data[13] = 0x20 | ((HWBLOCK_SHIFT << 6) & 0xc0) as u8; // Max. write data block length
        data[14] = 0x00; // File format group
        data[15] = crc7(&data[..15]);
        CsdV1 { data }
    }

    define_field!(csd_ver, u8, 0, 6, 2);
    define_field!(data_read_access_time1, u8, 1, 0, 8);
    define_field!(data_read_access_time2, u8, 2, 0, 8);
    define_field!(max_data_transfer_rate, u8, 3, 0, 8);
    define_field!(read_block_length, u8, 5, 0, 4);
    define_field!(read_partial_blocks, bool, 6, 7);
    define_field!(device_size, u32, [(6, 0, 2), (7, 0, 8), (8, 6, 2)]);
    define_field!(device_size_multiplier, u8, [(9, 0, 2), (10, 7, 1)]);
    define_field!(erase_single_block_enabled, bool, 10, 6);
    define_field!(erase_sector_size, u8, [(10, 0, 6), (11, 7, 1)]);
    define_field!(write_protect_group_size, u8, 11, 0, 7);
    define_field!(write_protect_group_enable, bool, 12, 7);
    define_field!(write_speed_factor, u8, 12, 2, 3);
    define_field!(max_write_data_length, u8, [(12, 0, 2), (13, 6, 2)]);
    define_field!(write_partial_blocks, bool, 13, 5);
    define_field!(temporary_write_protection, bool, 14, 4);
    define_field!(permanent_write_protection, bool, 14, 5);
    define_field!(copy_flag_set, bool, 14, 6);
    define_field!(file_format_group_set, bool, 14, 7);
    define_field!(crc, u8, 15, 0, 8);

    /// Returns the card capacity in bytes
    pub fn card_capacity_bytes(&self) -> u64 {
        let multiplier = self.device_size_multiplier() + self.read_block_length() + 2;
        (u64::from(self.device_size()) + 1) << multiplier
    }
}

impl CsdV2 {
    /// Encode a high-capacity CSD for a medium of `size` bytes.
    ///
    /// `size` must be a multiple of the 512 KiB SDHC capacity granule.
    pub fn for_capacity(size: u64) -> CsdV2 {
        let csize = (size / (512 * 1024)).wrapping_sub(1);
        let mut data = [0u8; 16];
        data[0] = 0x40; // CSD structure
        data[1] = 0x0e; // Data read access-time
        data[2] = 0x00;
        data[3] = 0x32; // Max. data transfer rate
        data[4] = 0x5b; // Card Command Classes
        data[5] = 0x59; // Max. read data block length (512), partial reads
        data[6] = 0x00;
        data[7] = ((csize >> 16) & 0xff) as u8; // Device size
        data[8] = ((csize >> 8) & 0xff) as u8;
        data[9] = (csize & 0xff) as u8;
        data[10] = 0x7f; // Erase sector size
        data[11] = 0x80;
        data[12] = 0x0a; // Write speed factor
        data[13] = 0x40; // Max. write data block length (512)
        data[14] = 0x00;
        data[15] = crc7(&data[..15]);
        CsdV2 { data }
    }

    define_field!(csd_ver, u8, 0, 6, 2);
    define_field!(data_read_access_time1, u8, 1, 0, 8);
    define_field!(max_data_transfer_rate, u8, 3, 0, 8);
    define_field!(read_block_length, u8, 5, 0, 4);
    define_field!(device_size, u32, [(7, 0, 6), (8, 0, 8), (9, 0, 8)]);
    define_field!(erase_single_block_enabled, bool, 10, 6);
    define_field!(erase_sector_size, u8, [(10, 0, 6), (11, 7, 1)]);
    define_field!(write_protect_group_size, u8, 11, 0, 7);
    define_field!(write_protect_group_enable, bool, 12, 7);
    define_field!(write_speed_factor, u8, 12, 2, 3);
    define_field!(max_write_data_length, u8, [(12, 0, 2), (13, 6, 2)]);
    define_field!(temporary_write_protection, bool, 14, 4);
    define_field!(permanent_write_protection, bool, 14, 5);
    define_field!(crc, u8, 15, 0, 8);

    /// Returns the card capacity in bytes
    pub fn card_capacity_bytes(&self) -> u64 {
        (u64::from(self.device_size()) + 1) * 512 * 1024
    }
}

impl Csd {
    /// Encode the CSD appropriate for a medium of `size` bytes: v1 up to
    /// 1 GiB, v2 (SDHC) above.
    pub fn for_capacity(size: u64) -> Csd {
        if size <= HIGH_CAPACITY_THRESHOLD {
            Csd::V1(CsdV1::for_capacity(size))
        } else {
            Csd::V2(CsdV2::for_capacity(size))
        }
    }

    /// The raw register bytes.
    pub fn bytes(&self) -> &[u8; 16] {
        match self {
            Csd::V1(csd) => &csd.data,
            Csd::V2(csd) => &csd.data,
        }
    }

    /// Does this CSD describe a high-capacity card?
    pub fn is_high_capacity(&self) -> bool {
        matches!(self, Csd::V2(_))
    }
}

// =============================================================================
// SCR - SD Configuration Register
// =============================================================================

/// The fixed 8-byte SCR: spec version 1.0, 1-bit and 4-bit bus widths,
/// security support as the modelled hardware reports it.
pub fn scr_default() -> [u8; 8] {
    [0x00, 0x2f, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
}

// =============================================================================
// Write-protection groups
// =============================================================================

/// One bit per 2 MiB write-protection group, sized from the medium capacity
/// at reset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WpGroups {
    nbits: u64,
    words: Vec<u64>,
}

impl WpGroups {
    /// A bitmap of `nbits` groups, all writable.
    pub fn new(nbits: u64) -> WpGroups {
        WpGroups {
            nbits,
            words: vec![0; nbits.div_ceil(64) as usize],
        }
    }

    /// Number of groups tracked.
    pub fn len(&self) -> u64 {
        self.nbits
    }

    /// True if no groups are tracked (a zero-sized medium).
    pub fn is_empty(&self) -> bool {
        self.nbits == 0
    }

    /// Is this group protected? Out-of-range groups read as writable.
    pub fn test(&self, group: u64) -> bool {
        if group >= self.nbits {
            return false;
        }
        self.words[(group / 64) as usize] & (1 << (group % 64)) != 0
    }

    /// Protect one group.
    pub fn set(&mut self, group: u64) {
        if group < self.nbits {
            self.words[(group / 64) as usize] |= 1 << (group % 64);
        }
    }

    /// Un-protect one group.
    pub fn clear(&mut self, group: u64) {
        if group < self.nbits {
            self.words[(group / 64) as usize] &= !(1 << (group % 64));
        }
    }

    /// Wipe every protection bit (CMD42 force-erase).
    pub fn zero_all(&mut self) {
        for word in self.words.iter_mut() {
            *word = 0;
        }
    }

    pub(crate) fn words(&self) -> &[u64] {
        &self.words
    }

    /// Rebuild a bitmap from its snapshot parts. `None` if the word count
    /// doesn't match the bit count.
    pub(crate) fn from_raw(nbits: u64, words: Vec<u64>) -> Option<WpGroups> {
        if words.len() as u64 != nbits.div_ceil(64) {
            return None;
        }
        Some(WpGroups { nbits, words })
    }
}
