//! The SD card command/response state machine.
//!
//! This is the heart of the emulation: one [`Card`] owns the register
//! model, classifies and executes host commands, and shuttles block data
//! between its 512-byte transfer buffer and the [`BlockBackend`].
//!
//! Dispatch is table-driven: [`proto::CMD_TYPE`] and [`proto::CMD_CLASS`]
//! classify every index as pure data, and two 64-entry handler tables (one
//! per command namespace) map an index to its behaviour. Each handler
//! checks its own state precondition and answers `Illegal` on a mismatch,
//! so the tables are the single place to audit which commands exist.
//!
//! This is currently optimised for readability and debugability, not
//! performance.

use crate::blockdevice::{BlockBackend, BLOCK_LEN, BLOCK_LEN_U32};
use crate::proto::{self, crc7};
use crate::registers::{
    self, wp_group_of, Cid, Csd, WpGroups, ACMD41_ENQUIRY_MASK, CSD_RW_MASK, HWBLOCK_SHIFT,
    OCR_DEFAULT, OCR_HIGH_CAPACITY, OCR_POWER_UP, WPGROUP_SIZE,
};

// =============================================================================
// Imports
// =============================================================================

use crate::{debug, trace, warn};

// =============================================================================
// Types and Implementations
// =============================================================================

/// One command frame as issued by the host controller.
///
/// `crc` is the trailing frame byte: CRC-7 over the five header bytes with
/// the end bit set. [`Request::new`] computes it for you; build the struct
/// directly to model a corrupted frame.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Request {
    /// Command index, 0..=63
    pub cmd: u8,
    /// 32-bit command argument
    pub arg: u32,
    /// The CRC-7 frame byte
    pub crc: u8,
}

impl Request {
    /// Build a correctly-framed request.
    pub fn new(cmd: u8, arg: u32) -> Request {
        let mut req = Request { cmd, arg, crc: 0 };
        req.crc = crc7(&req.frame());
        req
    }

    /// The five header bytes the frame CRC covers.
    pub fn frame(&self) -> [u8; 5] {
        [
            0x40 | self.cmd,
            (self.arg >> 24) as u8,
            (self.arg >> 16) as u8,
            (self.arg >> 8) as u8,
            self.arg as u8,
        ]
    }

    fn crc_valid(&self) -> bool {
        crc7(&self.frame()) == self.crc
    }
}

/// The bytes a command produced: empty for R0 and illegal commands, 4 bytes
/// for R1/R3/R6/R7, 16 bytes for R2.
pub type Response = heapless::Vec<u8, 16>;

/// Which of the fixed response formats a handler selected.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum RspType {
    /// No response
    R0,
    /// Normal response, card status
    R1,
    /// Normal response with busy signalling
    R1b,
    /// CID register
    R2Cid,
    /// CSD register
    R2Csd,
    /// OCR register
    R3,
    /// Published RCA response
    R6,
    /// Operating voltage echo
    R7,
    /// Command rejected; sets the illegal-command status bit
    Illegal,
}

/// Everything a command handler needs besides the card itself.
#[derive(Debug, Copy, Clone)]
struct Ctx {
    /// The raw 32-bit argument
    arg: u32,
    /// The argument as a byte address, scaled by 512 on high-capacity cards
    addr: u64,
    /// The RCA from the argument's upper halfword (addressed commands only)
    rca: u16,
}

/// The state machine of the card proper, straight out of the physical
/// layer specification's state diagrams.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CardState {
    /// Card no longer reacts to anything but power-off
    Inactive,
    /// Post-reset, negotiating operating conditions
    Idle,
    /// Operating conditions agreed, waiting for identification
    Ready,
    /// CID published, waiting for an address
    Identification,
    /// Addressed but not selected
    Standby,
    /// Selected and idle - the hub of data-transfer mode
    Transfer,
    /// Clocking data out to the host
    SendingData,
    /// Clocking data in from the host
    ReceivingData,
    /// Committing received data
    Programming,
    /// Deselected while programming
    Disconnect,
}

/// The three operating modes, each a grouping of [`CardState`]s.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CardMode {
    /// Not operating at all
    Inactive,
    /// Identification mode: Idle, Ready, Identification
    CardIdentification,
    /// Data-transfer mode: Standby through Disconnect
    DataTransfer,
}

impl CardState {
    /// The operating mode is a pure function of the state.
    pub fn mode(self) -> CardMode {
        match self {
            CardState::Inactive => CardMode::Inactive,
            CardState::Idle | CardState::Ready | CardState::Identification => {
                CardMode::CardIdentification
            }
            CardState::Standby
            | CardState::Transfer
            | CardState::SendingData
            | CardState::ReceivingData
            | CardState::Programming
            | CardState::Disconnect => CardMode::DataTransfer,
        }
    }

    /// The code this state carries in the card-status `CURRENT_STATE` field
    /// and in snapshots.
    pub(crate) fn code(self) -> u8 {
        match self {
            CardState::Idle => 0,
            CardState::Ready => 1,
            CardState::Identification => 2,
            CardState::Standby => 3,
            CardState::Transfer => 4,
            CardState::SendingData => 5,
            CardState::ReceivingData => 6,
            CardState::Programming => 7,
            CardState::Disconnect => 8,
            CardState::Inactive => 9,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<CardState> {
        Some(match code {
            0 => CardState::Idle,
            1 => CardState::Ready,
            2 => CardState::Identification,
            3 => CardState::Standby,
            4 => CardState::Transfer,
            5 => CardState::SendingData,
            6 => CardState::ReceivingData,
            7 => CardState::Programming,
            8 => CardState::Disconnect,
            9 => CardState::Inactive,
            _ => return None,
        })
    }
}

/// An emulated SD card over some backing storage.
///
/// The card is a single-threaded state machine: the host controller must
/// serialise [`Card::do_command`], [`Card::read_data`] and
/// [`Card::write_data`] against each other, which `&mut self` already
/// enforces. The one deferred event - the ACMD41 power-up delay - is
/// likewise delivered through `&mut self` via [`Card::complete_power_up`],
/// so it can never race a command in flight.
pub struct Card<B> {
    pub(crate) backend: B,
    /// SPI framing instead of native SD framing. Fixed at construction;
    /// changes command legality and a few response formats.
    pub(crate) spi: bool,
    pub(crate) enable: bool,

    pub(crate) state: CardState,
    pub(crate) ocr: u32,
    /// A power-up delay has been armed by ACMD41 and has not fired yet.
    pub(crate) power_up_pending: bool,
    pub(crate) cid: [u8; 16],
    pub(crate) csd: [u8; 16],
    pub(crate) scr: [u8; 8],
    pub(crate) rca: u16,
    pub(crate) card_status: u32,
    pub(crate) sd_status: [u8; 64],
    /// The argument CMD8 last accepted, echoed in R7.
    pub(crate) vhs: u32,
    pub(crate) wp_switch: bool,
    pub(crate) wp_groups: WpGroups,
    /// Medium capacity in bytes, sampled at reset.
    pub(crate) size: u64,
    pub(crate) blk_len: u32,
    pub(crate) multi_blk_cnt: u32,
    pub(crate) erase_start: u32,
    pub(crate) erase_end: u32,
    pub(crate) pwd: [u8; 16],
    pub(crate) pwd_len: usize,
    pub(crate) function_group: [u8; 6],

    /// The last successfully dispatched command; routes the byte-level data
    /// calls.
    pub(crate) current_cmd: u8,
    /// The next command will be looked up in the application table. Note
    /// that this does *not* track the APP_CMD status bit.
    pub(crate) expecting_acmd: bool,
    pub(crate) blk_written: u32,
    pub(crate) data_start: u64,
    pub(crate) data_offset: usize,
    pub(crate) data: [u8; BLOCK_LEN],
}

type Handler<B> = fn(&mut Card<B>, Ctx) -> RspType;

impl<B> Card<B>
where
    B: BlockBackend,
{
    /// Construct a card over `backend` and reset it.
    ///
    /// `spi` fixes the framing mode for the card's lifetime, the way a
    /// board wires the chip-select pin.
    pub fn new(backend: B, spi: bool) -> Card<B> {
        let mut card = Card {
            backend,
            spi,
            enable: true,
            state: CardState::Idle,
            ocr: 0,
            power_up_pending: false,
            cid: [0; 16],
            csd: [0; 16],
            scr: [0; 8],
            rca: 0,
            card_status: 0,
            sd_status: [0; 64],
            vhs: 0,
            wp_switch: false,
            wp_groups: WpGroups::new(0),
            size: 0,
            blk_len: 0,
            multi_blk_cnt: 0,
            erase_start: 0,
            erase_end: 0,
            pwd: [0; 16],
            pwd_len: 0,
            function_group: [0; 6],
            current_cmd: 0,
            expecting_acmd: false,
            blk_written: 0,
            data_start: 0,
            data_offset: 0,
            data: [0; BLOCK_LEN],
        };
        card.reset();
        card
    }

    /// Full card reset: re-sample the medium geometry, regenerate every
    /// derived register and drop all transient protocol state.
    ///
    /// Runs at construction, on GO_IDLE_STATE and on a media change. The
    /// write-protection bitmap is reallocated here because the capacity may
    /// have changed with the medium.
    pub fn reset(&mut self) {
        let size = self.backend.num_sectors() << HWBLOCK_SHIFT;
        let wp_group_count = wp_group_of(size) + 1;

        self.state = CardState::Idle;
        self.rca = 0x0000;
        self.ocr = OCR_DEFAULT;
        self.scr = registers::scr_default();
        self.cid = Cid::build().data;
        let csd = Csd::for_capacity(size);
        self.csd = *csd.bytes();
        if csd.is_high_capacity() {
            self.ocr |= OCR_HIGH_CAPACITY;
        }
        self.card_status = proto::CARD_STATUS_RESET;
        self.sd_status = [0; 64];

        self.wp_switch = self.backend.is_read_only();
        self.wp_groups = WpGroups::new(wp_group_count);
        self.function_group = [0; 6];
        self.erase_start = 0;
        self.erase_end = 0;
        self.size = size;
        self.blk_len = BLOCK_LEN_U32;
        self.pwd_len = 0;
        self.expecting_acmd = false;
        self.multi_blk_cnt = 0;
    }

    /// Current protocol state.
    pub fn state(&self) -> CardState {
        self.state
    }

    /// Does the card have data to clock out?
    pub fn data_ready(&self) -> bool {
        self.state == CardState::SendingData
    }

    /// Is a medium present?
    pub fn is_inserted(&self) -> bool {
        self.backend.is_present()
    }

    /// Is the medium write-protected (as sampled at the last reset)?
    pub fn is_read_only(&self) -> bool {
        self.wp_switch
    }

    /// Gate all command and data processing, the way a controller holds an
    /// unpowered slot.
    pub fn set_enabled(&mut self, enable: bool) {
        self.enable = enable;
    }

    /// The host noticed the medium changed. Resets the card if something is
    /// now present; the host should re-query [`Card::is_inserted`] and
    /// [`Card::is_read_only`] afterwards.
    pub fn media_change(&mut self) {
        if self.backend.is_present() {
            self.reset();
        }
    }

    /// Borrow the backing storage.
    pub fn backend(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Consume the card and get the backing storage back.
    pub fn free(self) -> B {
        self.backend
    }

    // =========================================================================
    // Power-up sequencer
    // =========================================================================

    /// Has ACMD41 armed a power-up delay that has not fired yet?
    ///
    /// When this becomes true the host environment should schedule a
    /// one-shot timer (the modelled hardware takes 0.5 ms) and call
    /// [`Card::complete_power_up`] when it fires.
    pub fn power_delay_pending(&self) -> bool {
        self.power_up_pending
    }

    /// Deliver the deferred power-up event.
    ///
    /// A no-op unless a delay is actually pending, so a host timer that
    /// fires after the card already powered up synchronously (or after a
    /// reset) is harmless.
    pub fn complete_power_up(&mut self) {
        if self.power_up_pending {
            self.power_up_pending = false;
            self.ocr_power_up();
        }
    }

    fn ocr_power_up(&mut self) {
        // The power-up bit must never be applied twice
        assert!(self.ocr & OCR_POWER_UP == 0);
        self.ocr |= OCR_POWER_UP;
    }

    // =========================================================================
    // Command dispatch
    // =========================================================================

    /// Process one command frame and produce its response bytes.
    ///
    /// An empty response means R0, an illegal command, or a card that is
    /// disabled or has no medium. Protocol errors never surface here - they
    /// are reported through status bits in the next R1-class response.
    pub fn do_command(&mut self, req: Request) -> Response {
        if !self.backend.is_present() || !self.enable {
            return Response::new();
        }

        let rsp = if !req.crc_valid() {
            self.card_status |= proto::COM_CRC_ERROR;
            warn!("CMD{} rejected: bad frame CRC", req.cmd);
            RspType::Illegal
        } else if self.card_status & proto::CARD_IS_LOCKED != 0 && !self.valid_while_locked(&req) {
            self.card_status |= proto::ILLEGAL_COMMAND;
            self.expecting_acmd = false;
            warn!("CMD{} rejected: card is locked", req.cmd);
            RspType::Illegal
        } else {
            self.dispatch(&req)
        };

        let response = self.encode_response(rsp);
        if rsp != RspType::Illegal {
            // The response is out of the door; the previous-command status
            // bits have been reported
            self.card_status &= !proto::CARD_STATUS_B;
        }
        trace!(
            "CMD{} -> {} response byte(s), state {:?}",
            req.cmd,
            response.len(),
            self.state
        );
        response
    }

    fn dispatch(&mut self, req: &Request) -> RspType {
        let last_state = self.state;

        let rsp = if self.expecting_acmd {
            self.expecting_acmd = false;
            self.app_command(req)
        } else {
            self.normal_command(req)
        };

        if rsp == RspType::Illegal {
            self.card_status |= proto::ILLEGAL_COMMAND;
        } else {
            // Valid command: record it for the data engine and publish the
            // state the card was in when the command arrived
            self.current_cmd = req.cmd;
            self.card_status &= !proto::CURRENT_STATE;
            self.card_status |=
                (u32::from(last_state.code()) << proto::CURRENT_STATE_SHIFT) & proto::CURRENT_STATE;
        }
        rsp
    }

    /// Commands a password-locked card will still answer: the basic and
    /// lock classes, CMD16, the ACMD prefix itself, and (as the pending
    /// ACMD) only ACMD41/ACMD42.
    fn valid_while_locked(&self, req: &Request) -> bool {
        if self.expecting_acmd {
            return req.cmd == 41 || req.cmd == 42;
        }
        if req.cmd == proto::CMD55 || req.cmd == proto::CMD16 {
            return true;
        }
        let class = proto::CMD_CLASS[usize::from(req.cmd & 0x3f)];
        class == 0 || class == 7
    }

    fn make_ctx(&self, req: &Request) -> Ctx {
        let idx = usize::from(req.cmd & 0x3f);
        let rca = match proto::CMD_TYPE[idx] {
            proto::CmdType::Ac | proto::CmdType::Adtc => (req.arg >> 16) as u16,
            _ => 0,
        };
        let addr = if self.ocr & OCR_HIGH_CAPACITY != 0 {
            u64::from(req.arg) << HWBLOCK_SHIFT
        } else {
            u64::from(req.arg)
        };
        Ctx {
            arg: req.arg,
            addr,
            rca,
        }
    }

    fn normal_command(&mut self, req: &Request) -> RspType {
        // Not interpreting this as an app command
        self.card_status &= !proto::APP_CMD;

        // SET_BLOCK_COUNT only binds an immediately following multi-block
        // transfer; anything else discards it
        if self.multi_blk_cnt != 0 && !(req.cmd == proto::CMD18 || req.cmd == proto::CMD25) {
            self.multi_blk_cnt = 0;
        }

        debug!("CMD{} arg {} state {:?}", req.cmd, req.arg, self.state);
        let ctx = self.make_ctx(req);
        let rsp = match Self::NORMAL_TABLE[usize::from(req.cmd & 0x3f)] {
            Some(handler) => handler(self, ctx),
            None => {
                warn!("Unknown CMD{}", req.cmd);
                RspType::Illegal
            }
        };
        if rsp == RspType::Illegal {
            debug!("CMD{} not accepted in state {:?}", req.cmd, self.state);
        }
        rsp
    }

    fn app_command(&mut self, req: &Request) -> RspType {
        debug!("ACMD{} arg {} state {:?}", req.cmd, req.arg, self.state);
        self.card_status |= proto::APP_CMD;
        let ctx = self.make_ctx(req);
        match Self::APP_TABLE[usize::from(req.cmd & 0x3f)] {
            Some(handler) => {
                let rsp = handler(self, ctx);
                if rsp == RspType::Illegal {
                    warn!("ACMD{} in a wrong state", req.cmd);
                }
                rsp
            }
            // Indices with no application meaning fall back to the normal
            // command set
            None => self.normal_command(req),
        }
    }

    // =========================================================================
    // Handler tables
    // =========================================================================

    const NORMAL_TABLE: [Option<Handler<B>>; 64] = [
        /* 0..7 */
        Some(Self::cmd0_go_idle_state),
        Some(Self::cmd1_send_op_cond),
        Some(Self::cmd2_all_send_cid),
        Some(Self::cmd3_send_relative_addr),
        Some(Self::cmd4_send_dsr),
        Some(Self::cmd5_reserved_sdio),
        Some(Self::cmd6_switch_function),
        Some(Self::cmd7_select_deselect),
        /* 8..15 */
        Some(Self::cmd8_send_if_cond),
        Some(Self::cmd9_send_csd),
        Some(Self::cmd10_send_cid),
        Some(Self::cmd11_read_until_stop),
        Some(Self::cmd12_stop_transmission),
        Some(Self::cmd13_send_status),
        None,
        Some(Self::cmd15_go_inactive),
        /* 16..23 */
        Some(Self::cmd16_set_blocklen),
        Some(Self::cmd17_read_single_block),
        Some(Self::cmd18_read_multiple_block),
        None,
        None,
        None,
        None,
        Some(Self::cmd23_set_block_count),
        /* 24..31 */
        Some(Self::cmd24_write_single_block),
        Some(Self::cmd25_write_multiple_block),
        Some(Self::cmd26_program_cid),
        Some(Self::cmd27_program_csd),
        Some(Self::cmd28_set_write_prot),
        Some(Self::cmd29_clr_write_prot),
        Some(Self::cmd30_send_write_prot),
        None,
        /* 32..39 */
        Some(Self::cmd32_erase_start),
        Some(Self::cmd33_erase_end),
        None,
        None,
        None,
        None,
        Some(Self::cmd38_erase),
        None,
        /* 40..47 */
        None,
        None,
        Some(Self::cmd42_lock_unlock),
        None,
        None,
        None,
        None,
        None,
        /* 48..55 */
        None,
        None,
        None,
        None,
        Some(Self::cmd52_reserved_sdio),
        Some(Self::cmd53_reserved_sdio),
        None,
        Some(Self::cmd55_app_cmd),
        /* 56..63 */
        Some(Self::cmd56_gen_cmd),
        None,
        None,
        None,
        None,
        None,
        None,
        None,
    ];

    const APP_TABLE: [Option<Handler<B>>; 64] = [
        /* 0..7 */
        None,
        None,
        None,
        None,
        None,
        None,
        Some(Self::acmd6_set_bus_width),
        None,
        /* 8..15 */
        None,
        None,
        None,
        None,
        None,
        Some(Self::acmd13_sd_status),
        None,
        None,
        /* 16..23 */
        None,
        None,
        None,
        None,
        None,
        None,
        Some(Self::acmd22_send_num_wr_blocks),
        Some(Self::acmd23_set_wr_blk_erase_count),
        /* 24..31 */
        None,
        None,
        None,
        None,
        None,
        None,
        None,
        None,
        /* 32..39 */
        None,
        None,
        None,
        None,
        None,
        None,
        None,
        None,
        /* 40..47 */
        None,
        Some(Self::acmd41_sd_app_op_cond),
        Some(Self::acmd42_set_clr_card_detect),
        None,
        None,
        None,
        None,
        None,
        /* 48..55 */
        None,
        None,
        None,
        Some(Self::acmd51_send_scr),
        None,
        None,
        None,
        None,
        /* 56..63 */
        None,
        None,
        None,
        None,
        None,
        None,
        None,
        None,
    ];

    // =========================================================================
    // Basic commands (class 0 and class 1)
    // =========================================================================

    fn cmd0_go_idle_state(&mut self, _ctx: Ctx) -> RspType {
        if self.state != CardState::Inactive {
            self.state = CardState::Idle;
            self.reset();
        }
        if self.spi {
            RspType::R1
        } else {
            RspType::R0
        }
    }

    fn cmd1_send_op_cond(&mut self, _ctx: Ctx) -> RspType {
        if !self.spi {
            warn!("CMD1 only exists in SPI framing");
            return RspType::Illegal;
        }
        self.state = CardState::Transfer;
        RspType::R1
    }

    fn cmd2_all_send_cid(&mut self, _ctx: Ctx) -> RspType {
        if self.spi || self.state != CardState::Ready {
            return RspType::Illegal;
        }
        self.state = CardState::Identification;
        RspType::R2Cid
    }

    fn cmd3_send_relative_addr(&mut self, _ctx: Ctx) -> RspType {
        if self.spi {
            return RspType::Illegal;
        }
        match self.state {
            CardState::Identification | CardState::Standby => {
                self.state = CardState::Standby;
                // Pseudo-random enough for a session-scoped identifier
                self.rca = self.rca.wrapping_add(0x4567);
                RspType::R6
            }
            _ => RspType::Illegal,
        }
    }

    fn cmd4_send_dsr(&mut self, _ctx: Ctx) -> RspType {
        // No driver stage register on this card
        RspType::Illegal
    }

    fn cmd5_reserved_sdio(&mut self, _ctx: Ctx) -> RspType {
        // Reserved for SDIO cards. Answer illegal without a diagnostic -
        // OSes probe with this to detect SDIO
        RspType::Illegal
    }

    fn cmd6_switch_function(&mut self, ctx: Ctx) -> RspType {
        if self.spi || self.state.mode() != CardMode::DataTransfer {
            return RspType::Illegal;
        }
        self.function_switch(ctx.arg);
        self.state = CardState::SendingData;
        self.data_start = 0;
        self.data_offset = 0;
        RspType::R1
    }

    fn cmd7_select_deselect(&mut self, ctx: Ctx) -> RspType {
        if self.spi {
            return RspType::Illegal;
        }
        match self.state {
            CardState::Standby => {
                if self.rca != ctx.rca {
                    return RspType::R0;
                }
                self.state = CardState::Transfer;
                RspType::R1b
            }
            CardState::Transfer | CardState::SendingData => {
                if self.rca == ctx.rca {
                    return RspType::Illegal;
                }
                self.state = CardState::Standby;
                RspType::R1b
            }
            CardState::Disconnect => {
                if self.rca != ctx.rca {
                    return RspType::R0;
                }
                self.state = CardState::Programming;
                RspType::R1b
            }
            CardState::Programming => {
                if self.rca == ctx.rca {
                    return RspType::Illegal;
                }
                self.state = CardState::Disconnect;
                RspType::R1b
            }
            _ => RspType::Illegal,
        }
    }

    fn cmd8_send_if_cond(&mut self, ctx: Ctx) -> RspType {
        if self.state != CardState::Idle {
            return RspType::Illegal;
        }
        self.vhs = 0;
        // No response unless exactly one voltage-supplied bit is set
        let vhs_pattern = ctx.arg >> 8;
        if vhs_pattern == 0 || !vhs_pattern.is_power_of_two() {
            return if self.spi { RspType::R7 } else { RspType::R0 };
        }
        // Accept
        self.vhs = ctx.arg;
        RspType::R7
    }

    fn cmd9_send_csd(&mut self, ctx: Ctx) -> RspType {
        match self.state {
            CardState::Standby => {
                if self.rca != ctx.rca {
                    return RspType::R0;
                }
                RspType::R2Csd
            }
            // SPI framing has no 16-byte response; the register goes out
            // through the data path instead
            CardState::Transfer if self.spi => {
                self.state = CardState::SendingData;
                self.data[..16].copy_from_slice(&self.csd);
                self.data_start = ctx.addr;
                self.data_offset = 0;
                RspType::R1
            }
            _ => RspType::Illegal,
        }
    }

    fn cmd10_send_cid(&mut self, ctx: Ctx) -> RspType {
        match self.state {
            CardState::Standby => {
                if self.rca != ctx.rca {
                    return RspType::R0;
                }
                RspType::R2Cid
            }
            CardState::Transfer if self.spi => {
                self.state = CardState::SendingData;
                self.data[..16].copy_from_slice(&self.cid);
                self.data_start = ctx.addr;
                self.data_offset = 0;
                RspType::R1
            }
            _ => RspType::Illegal,
        }
    }

    fn cmd11_read_until_stop(&mut self, ctx: Ctx) -> RspType {
        if self.spi || self.state != CardState::Transfer {
            return RspType::Illegal;
        }
        self.state = CardState::SendingData;
        self.data_start = u64::from(ctx.arg);
        self.data_offset = 0;
        if self.data_start + u64::from(self.blk_len) > self.size {
            self.card_status |= proto::ADDRESS_ERROR;
        }
        RspType::R0
    }

    fn cmd12_stop_transmission(&mut self, _ctx: Ctx) -> RspType {
        match self.state {
            CardState::SendingData => {
                self.state = CardState::Transfer;
                RspType::R1b
            }
            CardState::ReceivingData => {
                // Through Programming and straight out the other side -
                // the commit is instantaneous here
                self.state = CardState::Transfer;
                RspType::R1b
            }
            _ => RspType::Illegal,
        }
    }

    fn cmd13_send_status(&mut self, ctx: Ctx) -> RspType {
        if self.state.mode() != CardMode::DataTransfer {
            return RspType::Illegal;
        }
        if self.rca != ctx.rca {
            return RspType::R0;
        }
        RspType::R1
    }

    fn cmd15_go_inactive(&mut self, ctx: Ctx) -> RspType {
        if self.spi || self.state.mode() != CardMode::DataTransfer {
            return RspType::Illegal;
        }
        if self.rca != ctx.rca {
            return RspType::R0;
        }
        self.state = CardState::Inactive;
        RspType::R0
    }

    // =========================================================================
    // Block read commands (class 2)
    // =========================================================================

    fn cmd16_set_blocklen(&mut self, ctx: Ctx) -> RspType {
        if self.state != CardState::Transfer {
            return RspType::Illegal;
        }
        if ctx.arg > BLOCK_LEN_U32 {
            self.card_status |= proto::BLOCK_LEN_ERROR;
        } else {
            self.blk_len = ctx.arg;
        }
        RspType::R1
    }

    fn cmd17_read_single_block(&mut self, ctx: Ctx) -> RspType {
        if self.state != CardState::Transfer {
            return RspType::Illegal;
        }
        if ctx.addr + u64::from(self.blk_len) > self.size {
            self.card_status |= proto::ADDRESS_ERROR;
            return RspType::R1;
        }
        self.state = CardState::SendingData;
        self.data_start = ctx.addr;
        self.data_offset = 0;
        RspType::R1
    }

    fn cmd18_read_multiple_block(&mut self, ctx: Ctx) -> RspType {
        if self.state != CardState::Transfer {
            return RspType::Illegal;
        }
        if ctx.addr + u64::from(self.blk_len) > self.size {
            self.card_status |= proto::ADDRESS_ERROR;
            return RspType::R1;
        }
        self.state = CardState::SendingData;
        self.data_start = ctx.addr;
        self.data_offset = 0;
        RspType::R1
    }

    fn cmd23_set_block_count(&mut self, ctx: Ctx) -> RspType {
        if self.state != CardState::Transfer {
            return RspType::Illegal;
        }
        self.multi_blk_cnt = ctx.arg;
        RspType::R1
    }

    // =========================================================================
    // Block write commands (class 4)
    // =========================================================================

    fn cmd24_write_single_block(&mut self, ctx: Ctx) -> RspType {
        if self.spi {
            warn!("CMD24 not implemented in SPI framing");
            return RspType::Illegal;
        }
        self.start_block_write(ctx)
    }

    fn cmd25_write_multiple_block(&mut self, ctx: Ctx) -> RspType {
        if self.spi {
            warn!("CMD25 not implemented in SPI framing");
            return RspType::Illegal;
        }
        self.start_block_write(ctx)
    }

    fn start_block_write(&mut self, ctx: Ctx) -> RspType {
        if self.state != CardState::Transfer {
            return RspType::Illegal;
        }
        if ctx.addr + u64::from(self.blk_len) > self.size {
            self.card_status |= proto::ADDRESS_ERROR;
            return RspType::R1;
        }
        self.state = CardState::ReceivingData;
        self.data_start = ctx.addr;
        self.data_offset = 0;
        self.blk_written = 0;
        if self.write_protected(self.data_start) {
            self.card_status |= proto::WP_VIOLATION;
        }
        RspType::R1
    }

    fn cmd26_program_cid(&mut self, _ctx: Ctx) -> RspType {
        if self.spi || self.state != CardState::Transfer {
            return RspType::Illegal;
        }
        self.state = CardState::ReceivingData;
        self.data_start = 0;
        self.data_offset = 0;
        RspType::R1
    }

    fn cmd27_program_csd(&mut self, _ctx: Ctx) -> RspType {
        if self.spi {
            warn!("CMD27 not implemented in SPI framing");
            return RspType::Illegal;
        }
        if self.state != CardState::Transfer {
            return RspType::Illegal;
        }
        self.state = CardState::ReceivingData;
        self.data_start = 0;
        self.data_offset = 0;
        RspType::R1
    }

    // =========================================================================
    // Write protection (class 6)
    // =========================================================================

    fn cmd28_set_write_prot(&mut self, ctx: Ctx) -> RspType {
        if self.state != CardState::Transfer {
            return RspType::Illegal;
        }
        if ctx.addr >= self.size {
            self.card_status |= proto::ADDRESS_ERROR;
            return RspType::R1b;
        }
        // Programming is instantaneous here
        self.wp_groups.set(wp_group_of(ctx.addr));
        self.state = CardState::Transfer;
        RspType::R1b
    }

    fn cmd29_clr_write_prot(&mut self, ctx: Ctx) -> RspType {
        if self.state != CardState::Transfer {
            return RspType::Illegal;
        }
        if ctx.addr >= self.size {
            self.card_status |= proto::ADDRESS_ERROR;
            return RspType::R1b;
        }
        self.wp_groups.clear(wp_group_of(ctx.addr));
        self.state = CardState::Transfer;
        RspType::R1b
    }

    fn cmd30_send_write_prot(&mut self, ctx: Ctx) -> RspType {
        if self.state != CardState::Transfer {
            return RspType::Illegal;
        }
        self.state = CardState::SendingData;
        let bits = self.wp_bits(u64::from(ctx.arg));
        self.data[..4].copy_from_slice(&bits.to_le_bytes());
        self.data_start = ctx.addr;
        self.data_offset = 0;
        RspType::R1b
    }

    // =========================================================================
    // Erase commands (class 5)
    // =========================================================================

    fn cmd32_erase_start(&mut self, ctx: Ctx) -> RspType {
        if self.state != CardState::Transfer {
            return RspType::Illegal;
        }
        self.erase_start = ctx.arg;
        RspType::R1
    }

    fn cmd33_erase_end(&mut self, ctx: Ctx) -> RspType {
        if self.state != CardState::Transfer {
            return RspType::Illegal;
        }
        self.erase_end = ctx.arg;
        RspType::R1
    }

    fn cmd38_erase(&mut self, _ctx: Ctx) -> RspType {
        if self.state != CardState::Transfer {
            return RspType::Illegal;
        }
        if self.csd[14] & 0x30 != 0 {
            self.card_status |= proto::WP_VIOLATION;
            return RspType::R1b;
        }
        self.erase();
        self.state = CardState::Transfer;
        RspType::R1b
    }

    // =========================================================================
    // Lock card commands (class 7)
    // =========================================================================

    fn cmd42_lock_unlock(&mut self, _ctx: Ctx) -> RspType {
        if self.spi {
            warn!("CMD42 not implemented in SPI framing");
            return RspType::Illegal;
        }
        if self.state != CardState::Transfer {
            return RspType::Illegal;
        }
        self.state = CardState::ReceivingData;
        self.data_start = 0;
        self.data_offset = 0;
        RspType::R1
    }

    fn cmd52_reserved_sdio(&mut self, _ctx: Ctx) -> RspType {
        // Reserved for SDIO; answered quietly, like CMD5
        RspType::Illegal
    }

    fn cmd53_reserved_sdio(&mut self, _ctx: Ctx) -> RspType {
        RspType::Illegal
    }

    // =========================================================================
    // Application specific commands (class 8)
    // =========================================================================

    fn cmd55_app_cmd(&mut self, ctx: Ctx) -> RspType {
        if self.rca != ctx.rca {
            return RspType::R0;
        }
        self.expecting_acmd = true;
        self.card_status |= proto::APP_CMD;
        RspType::R1
    }

    fn cmd56_gen_cmd(&mut self, ctx: Ctx) -> RspType {
        debug!("GEN_CMD arg {}", ctx.arg);
        if self.state != CardState::Transfer {
            return RspType::Illegal;
        }
        self.data_offset = 0;
        self.state = if ctx.arg & 1 != 0 {
            CardState::SendingData
        } else {
            CardState::ReceivingData
        };
        RspType::R1
    }

    fn acmd6_set_bus_width(&mut self, ctx: Ctx) -> RspType {
        if self.state != CardState::Transfer {
            return RspType::Illegal;
        }
        self.sd_status[0] &= 0x3f;
        self.sd_status[0] |= ((ctx.arg & 0x03) << 6) as u8;
        RspType::R1
    }

    fn acmd13_sd_status(&mut self, _ctx: Ctx) -> RspType {
        if self.state != CardState::Transfer {
            return RspType::Illegal;
        }
        self.state = CardState::SendingData;
        self.data_start = 0;
        self.data_offset = 0;
        RspType::R1
    }

    fn acmd22_send_num_wr_blocks(&mut self, _ctx: Ctx) -> RspType {
        if self.state != CardState::Transfer {
            return RspType::Illegal;
        }
        self.data[..4].copy_from_slice(&self.blk_written.to_le_bytes());
        self.state = CardState::SendingData;
        self.data_start = 0;
        self.data_offset = 0;
        RspType::R1
    }

    fn acmd23_set_wr_blk_erase_count(&mut self, _ctx: Ctx) -> RspType {
        if self.state != CardState::Transfer {
            return RspType::Illegal;
        }
        // Pre-erase hints change nothing about an emulated medium
        RspType::R1
    }

    fn acmd41_sd_app_op_cond(&mut self, ctx: Ctx) -> RspType {
        if self.spi {
            // SEND_OP_COND
            self.state = CardState::Transfer;
            return RspType::R1;
        }
        if self.state != CardState::Idle {
            return RspType::Illegal;
        }

        // The first ACMD41 since reset decides how to power up. A real
        // operating-condition request powers up synchronously; an enquiry
        // arms the one-shot delay instead, because hosts that enquire first
        // poll the power-up bit before looking at anything else.
        if self.ocr & OCR_POWER_UP == 0 {
            if ctx.arg & ACMD41_ENQUIRY_MASK != 0 {
                self.power_up_pending = false;
                self.ocr_power_up();
            } else if !self.power_up_pending {
                self.power_up_pending = true;
            }
        }

        // We accept any voltage. 10000 V is nothing. Once powered up, a
        // real request advances the card to ready
        if ctx.arg & ACMD41_ENQUIRY_MASK != 0 {
            self.state = CardState::Ready;
        }
        RspType::R3
    }

    fn acmd42_set_clr_card_detect(&mut self, _ctx: Ctx) -> RspType {
        if self.state != CardState::Transfer {
            return RspType::Illegal;
        }
        // Bringing in the 50 kOhm pull-up resistor... done
        RspType::R1
    }

    fn acmd51_send_scr(&mut self, _ctx: Ctx) -> RspType {
        if self.state != CardState::Transfer {
            return RspType::Illegal;
        }
        self.state = CardState::SendingData;
        self.data_start = 0;
        self.data_offset = 0;
        RspType::R1
    }

    // =========================================================================
    // Register-model helpers
    // =========================================================================

    /// Is the group containing `addr` protected, either individually or by
    /// the CSD-level temporary/permanent bits?
    fn write_protected(&self, addr: u64) -> bool {
        self.wp_groups.test(wp_group_of(addr)) || self.csd[14] & 0x30 != 0
    }

    /// A 32-bit window of protection-group bits starting at `addr`, for
    /// SEND_WRITE_PROT.
    fn wp_bits(&self, addr: u64) -> u32 {
        let mut result = 0u32;
        let mut group = wp_group_of(addr);
        let mut a = addr;
        for bit in 0..32 {
            if a < self.size && self.wp_groups.test(group) {
                result |= 1 << bit;
            }
            group += 1;
            a += WPGROUP_SIZE;
        }
        result
    }

    /// Execute a pending erase range: flag protected groups, clear the
    /// range. The medium contents are left alone, like the hardware this
    /// models.
    fn erase(&mut self) {
        if self.erase_start == 0 || self.erase_end == 0 {
            self.card_status |= proto::ERASE_SEQ_ERROR;
            return;
        }
        let mut erase_start = u64::from(self.erase_start);
        let mut erase_end = u64::from(self.erase_end);
        if self.ocr & OCR_HIGH_CAPACITY != 0 {
            // High capacity: erase units are 512-byte blocks
            erase_start <<= HWBLOCK_SHIFT;
            erase_end <<= HWBLOCK_SHIFT;
        }
        self.erase_start = 0;
        self.erase_end = 0;
        self.csd[14] |= 0x40;
        for group in wp_group_of(erase_start)..=wp_group_of(erase_end) {
            if self.wp_groups.test(group) {
                self.card_status |= proto::WP_ERASE_SKIP;
            }
        }
    }

    /// Build the 64-byte SWITCH_FUNCTION status block and apply any group
    /// selections (set mode only, and only for selections other than 0xf).
    fn function_switch(&mut self, arg: u32) {
        let set_mode = arg & 0x8000_0000 != 0;
        // Maximum current consumption, then the supported-function words
        // for groups 6 down to 1
        self.data[..14].copy_from_slice(&[
            0x00, 0x01, 0x80, 0x01, 0x80, 0x01, 0x80, 0x01, 0x80, 0x01, 0x80, 0x43, 0x80, 0x03,
        ]);
        for group in 0..6 {
            let new_func = ((arg >> (group * 4)) & 0x0f) as u8;
            if set_mode && new_func != 0x0f {
                self.function_group[group] = new_func;
            }
            self.data[14 + (group >> 1)] = new_func << ((group * 4) & 4);
        }
        for byte in self.data[17..64].iter_mut() {
            *byte = 0;
        }
        let crc = proto::crc16(&self.data[..64]);
        self.data[65] = (crc >> 8) as u8;
        self.data[66] = crc as u8;
    }

    /// Apply a completed CMD42 data phase to the lock state.
    ///
    /// The buffer starts with the control flags byte, then (for password
    /// operations) the password length and up to 32 bytes of old-then-new
    /// password. Any precondition failure sets LOCK_UNLOCK_FAILED and
    /// leaves everything unchanged.
    fn lock_command(&mut self) {
        let flags = self.data[0];
        let erase = flags & 0x08 != 0;
        let lock = flags & 0x04 != 0;
        let clr_pwd = flags & 0x02 != 0;
        let set_pwd = flags & 0x01 != 0;
        let pwd_len = if self.blk_len > 1 {
            usize::from(self.data[1])
        } else {
            0
        };

        if erase {
            // The force-erase escape hatch: only valid on its own, on a
            // locked card with nothing else protected
            if self.card_status & proto::CARD_IS_LOCKED == 0
                || self.blk_len > 1
                || set_pwd
                || clr_pwd
                || lock
                || self.wp_switch
                || self.csd[14] & 0x20 != 0
            {
                self.card_status |= proto::LOCK_UNLOCK_FAILED;
                return;
            }
            self.wp_groups.zero_all();
            self.csd[14] &= !0x10;
            self.card_status &= !proto::CARD_IS_LOCKED;
            self.pwd_len = 0;
            warn!("Card force-erased by CMD42");
            return;
        }

        // The supplied length covers the stored password plus any new one
        if (self.blk_len as usize) < 2 + pwd_len
            || pwd_len <= self.pwd_len
            || pwd_len > self.pwd_len + 16
        {
            self.card_status |= proto::LOCK_UNLOCK_FAILED;
            return;
        }

        if self.pwd_len != 0 && self.pwd[..self.pwd_len] != self.data[2..2 + self.pwd_len] {
            self.card_status |= proto::LOCK_UNLOCK_FAILED;
            return;
        }

        let new_len = pwd_len - self.pwd_len;
        let locked = self.card_status & proto::CARD_IS_LOCKED != 0;
        if (new_len != 0 && !set_pwd)
            || (clr_pwd && (set_pwd || lock))
            || (lock && self.pwd_len == 0 && !set_pwd)
            || (!set_pwd && !clr_pwd && ((locked && lock) || (!locked && !lock)))
        {
            self.card_status |= proto::LOCK_UNLOCK_FAILED;
            return;
        }

        if set_pwd {
            let new_pwd_at = 2 + self.pwd_len;
            self.pwd[..new_len].copy_from_slice(&self.data[new_pwd_at..new_pwd_at + new_len]);
            self.pwd_len = new_len;
        }
        if clr_pwd {
            self.pwd_len = 0;
        }
        if lock {
            self.card_status |= proto::CARD_IS_LOCKED;
        } else {
            self.card_status &= !proto::CARD_IS_LOCKED;
        }
    }

    // =========================================================================
    // Response encoder
    // =========================================================================

    fn encode_response(&mut self, rsp: RspType) -> Response {
        let mut response = Response::new();
        match rsp {
            RspType::R1 | RspType::R1b => {
                let status = self.card_status;
                // Reporting these is what clears them
                self.card_status &= !proto::CARD_STATUS_C;
                response
                    .extend_from_slice(&status.to_be_bytes())
                    .expect("response fits");
            }
            RspType::R2Cid => {
                response
                    .extend_from_slice(&self.cid)
                    .expect("response fits");
            }
            RspType::R2Csd => {
                response
                    .extend_from_slice(&self.csd)
                    .expect("response fits");
            }
            RspType::R3 => {
                response
                    .extend_from_slice(&self.ocr.to_be_bytes())
                    .expect("response fits");
            }
            RspType::R6 => {
                // A 16-bit projection of the status word rides along with
                // the published RCA
                let status = (((self.card_status >> 8) & 0xc000)
                    | ((self.card_status >> 6) & 0x2000)
                    | (self.card_status & 0x1fff)) as u16;
                self.card_status &= !(proto::CARD_STATUS_C & 0x00c8_1fff);
                response
                    .extend_from_slice(&self.rca.to_be_bytes())
                    .expect("response fits");
                response
                    .extend_from_slice(&status.to_be_bytes())
                    .expect("response fits");
            }
            RspType::R7 => {
                response
                    .extend_from_slice(&self.vhs.to_be_bytes())
                    .expect("response fits");
            }
            RspType::R0 | RspType::Illegal => {}
        }
        response
    }

    // =========================================================================
    // Data transfer engine
    // =========================================================================

    /// Clock one byte of an active write transfer into the card.
    ///
    /// Ignored unless the card is in `ReceivingData`, and while an address
    /// or write-protection error is pending.
    pub fn write_data(&mut self, value: u8) {
        if !self.backend.is_present() || !self.enable {
            return;
        }
        if self.state != CardState::ReceivingData {
            warn!("write_data: not in Receiving-Data state");
            return;
        }
        if self.card_status & (proto::ADDRESS_ERROR | proto::WP_VIOLATION) != 0 {
            return;
        }

        match self.current_cmd {
            proto::CMD24 => {
                if self.data_offset == 0 && self.write_protected(self.data_start) {
                    self.card_status |= proto::WP_VIOLATION;
                    return;
                }
                self.data[self.data_offset] = value;
                self.data_offset += 1;
                if self.data_offset >= self.blk_len as usize {
                    self.blk_write(self.data_start, self.data_offset);
                    self.blk_written += 1;
                    self.csd[14] |= 0x40;
                    // Programming is instantaneous here
                    self.state = CardState::Transfer;
                }
            }
            proto::CMD25 => {
                if self.data_offset == 0 {
                    // Start of the block - re-validate the rolling address
                    if self.data_start + u64::from(self.blk_len) > self.size {
                        self.card_status |= proto::ADDRESS_ERROR;
                        return;
                    }
                    if self.write_protected(self.data_start) {
                        self.card_status |= proto::WP_VIOLATION;
                        return;
                    }
                }
                self.data[self.data_offset] = value;
                self.data_offset += 1;
                if self.data_offset >= self.blk_len as usize {
                    self.blk_write(self.data_start, self.data_offset);
                    self.blk_written += 1;
                    self.data_start += u64::from(self.blk_len);
                    self.data_offset = 0;
                    self.csd[14] |= 0x40;

                    if self.multi_blk_cnt != 0 {
                        self.multi_blk_cnt -= 1;
                        if self.multi_blk_cnt == 0 {
                            // Counted transfer complete
                            self.state = CardState::Transfer;
                        }
                    }
                }
            }
            proto::CMD26 => {
                self.data[self.data_offset] = value;
                self.data_offset += 1;
                if self.data_offset >= self.cid.len() {
                    // Every CID bit is one-time programmed already
                    if self.data[..16] != self.cid {
                        self.card_status |= proto::CID_CSD_OVERWRITE;
                    }
                    if self.card_status & proto::CID_CSD_OVERWRITE == 0 {
                        for i in 0..16 {
                            self.cid[i] &= self.data[i];
                        }
                    }
                    self.state = CardState::Transfer;
                }
            }
            proto::CMD27 => {
                self.data[self.data_offset] = value;
                self.data_offset += 1;
                if self.data_offset >= self.csd.len() {
                    for i in 0..16 {
                        if self.csd[i] | CSD_RW_MASK[i] != self.data[i] | CSD_RW_MASK[i] {
                            self.card_status |= proto::CID_CSD_OVERWRITE;
                        }
                    }
                    // Copy flag (OTP) and permanent write protect only set
                    if self.csd[14] & !self.data[14] & 0x60 != 0 {
                        self.card_status |= proto::CID_CSD_OVERWRITE;
                    }
                    if self.card_status & proto::CID_CSD_OVERWRITE == 0 {
                        for i in 0..16 {
                            self.csd[i] = (self.csd[i] | CSD_RW_MASK[i]) & self.data[i];
                        }
                    }
                    self.state = CardState::Transfer;
                }
            }
            proto::CMD42 => {
                self.data[self.data_offset] = value;
                self.data_offset += 1;
                if self.data_offset >= self.blk_len as usize {
                    self.lock_command();
                    self.state = CardState::Transfer;
                }
            }
            proto::CMD56 => {
                self.data[self.data_offset] = value;
                self.data_offset += 1;
                if self.data_offset >= self.blk_len as usize {
                    // Vendor data, accepted and discarded
                    self.state = CardState::Transfer;
                }
            }
            _ => {
                warn!("write_data: unknown command CMD{}", self.current_cmd);
            }
        }
    }

    /// Clock one byte of an active read transfer out of the card.
    ///
    /// Returns 0 unless the card is in `SendingData`, and while an address
    /// or write-protection error is pending.
    pub fn read_data(&mut self) -> u8 {
        if !self.backend.is_present() || !self.enable {
            return 0x00;
        }
        if self.state != CardState::SendingData {
            warn!("read_data: not in Sending-Data state");
            return 0x00;
        }
        if self.card_status & (proto::ADDRESS_ERROR | proto::WP_VIOLATION) != 0 {
            return 0x00;
        }

        // High-capacity cards always move whole hardware blocks
        let io_len = if self.ocr & OCR_HIGH_CAPACITY != 0 {
            BLOCK_LEN
        } else {
            self.blk_len as usize
        };

        match self.current_cmd {
            proto::CMD6 => self.drain_buffer(64),
            proto::CMD9 | proto::CMD10 => self.drain_buffer(16),
            proto::CMD11 => {
                if self.data_offset == 0 {
                    self.blk_read(self.data_start, io_len);
                }
                let value = self.data[self.data_offset];
                self.data_offset += 1;
                if self.data_offset >= io_len {
                    self.data_start += io_len as u64;
                    self.data_offset = 0;
                    if self.data_start + io_len as u64 > self.size {
                        self.card_status |= proto::ADDRESS_ERROR;
                    }
                }
                value
            }
            proto::ACMD13 => {
                let value = self.sd_status[self.data_offset];
                self.data_offset += 1;
                if self.data_offset >= self.sd_status.len() {
                    self.state = CardState::Transfer;
                }
                value
            }
            proto::CMD17 => {
                if self.data_offset == 0 {
                    self.blk_read(self.data_start, io_len);
                }
                let value = self.data[self.data_offset];
                self.data_offset += 1;
                if self.data_offset >= io_len {
                    self.state = CardState::Transfer;
                }
                value
            }
            proto::CMD18 => {
                if self.data_offset == 0 {
                    self.blk_read(self.data_start, io_len);
                }
                let value = self.data[self.data_offset];
                self.data_offset += 1;
                if self.data_offset >= io_len {
                    self.data_start += io_len as u64;
                    self.data_offset = 0;

                    if self.multi_blk_cnt != 0 {
                        self.multi_blk_cnt -= 1;
                        if self.multi_blk_cnt == 0 {
                            // Counted transfer complete
                            self.state = CardState::Transfer;
                            return value;
                        }
                    }

                    // The next block is only validated now that we reach it
                    if self.data_start + io_len as u64 > self.size {
                        self.card_status |= proto::ADDRESS_ERROR;
                    }
                }
                value
            }
            proto::ACMD22 => self.drain_buffer(4),
            proto::CMD30 => self.drain_buffer(4),
            proto::ACMD51 => {
                let value = self.scr[self.data_offset];
                self.data_offset += 1;
                if self.data_offset >= self.scr.len() {
                    self.state = CardState::Transfer;
                }
                value
            }
            proto::CMD56 => {
                if self.data_offset == 0 {
                    // Vendor data: a fixed fill pattern
                    for byte in self.data[..self.blk_len as usize].iter_mut() {
                        *byte = 0xec;
                    }
                }
                let value = self.data[self.data_offset];
                self.data_offset += 1;
                if self.data_offset >= self.blk_len as usize {
                    self.state = CardState::Transfer;
                }
                value
            }
            _ => {
                warn!("read_data: unknown command CMD{}", self.current_cmd);
                0x00
            }
        }
    }

    /// Serve one byte of a fixed-length register read out of the transfer
    /// buffer, returning to `Transfer` at the end.
    fn drain_buffer(&mut self, len: usize) -> u8 {
        let value = self.data[self.data_offset];
        self.data_offset += 1;
        if self.data_offset >= len {
            self.state = CardState::Transfer;
        }
        value
    }

    fn blk_read(&mut self, addr: u64, len: usize) {
        trace!("block read: addr {}, len {}", addr, len);
        if self.backend.read(addr, &mut self.data[..len]).is_err() {
            // An I/O failure is invisible to the protocol; the host sees
            // whatever was left in the buffer
            warn!("block read error on host side");
        }
    }

    fn blk_write(&mut self, addr: u64, len: usize) {
        trace!("block write: addr {}, len {}", addr, len);
        if self.backend.write(addr, &self.data[..len]).is_err() {
            warn!("block write error on host side");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// A RAM medium for unit tests. Integration tests carry their own
    /// richer version in `tests/utils`.
    struct TestDisk {
        bytes: Vec<u8>,
    }

    impl TestDisk {
        fn mib(mib: usize) -> TestDisk {
            // A recognisable, offset-dependent fill
            let bytes = (0..mib * 1024 * 1024).map(|i| (i % 251) as u8).collect();
            TestDisk { bytes }
        }
    }

    impl BlockBackend for TestDisk {
        type Error = &'static str;

        fn read(&mut self, offset: u64, buffer: &mut [u8]) -> Result<(), Self::Error> {
            let offset = offset as usize;
            let source = self.bytes.get(offset..offset + buffer.len()).ok_or("oob")?;
            buffer.copy_from_slice(source);
            Ok(())
        }

        fn write(&mut self, offset: u64, buffer: &[u8]) -> Result<(), Self::Error> {
            let offset = offset as usize;
            let target = self
                .bytes
                .get_mut(offset..offset + buffer.len())
                .ok_or("oob")?;
            target.copy_from_slice(buffer);
            Ok(())
        }

        fn num_sectors(&self) -> u64 {
            (self.bytes.len() / BLOCK_LEN) as u64
        }

        fn is_read_only(&self) -> bool {
            false
        }

        fn is_present(&self) -> bool {
            true
        }
    }

    fn native_card() -> Card<TestDisk> {
        Card::new(TestDisk::mib(64), false)
    }

    fn status_of(response: &Response) -> u32 {
        assert_eq!(response.len(), 4);
        u32::from_be_bytes([response[0], response[1], response[2], response[3]])
    }

    /// Run the identification dance up to Transfer state, returning the
    /// assigned RCA.
    fn bring_to_transfer(card: &mut Card<TestDisk>) -> u16 {
        card.do_command(Request::new(0, 0));
        card.do_command(Request::new(8, 0x1aa));
        card.do_command(Request::new(55, 0));
        card.do_command(Request::new(41, 0x00ff_8000));
        card.do_command(Request::new(2, 0));
        let r6 = card.do_command(Request::new(3, 0));
        let rca = u16::from_be_bytes([r6[0], r6[1]]);
        card.do_command(Request::new(7, u32::from(rca) << 16));
        assert_eq!(card.state(), CardState::Transfer);
        rca
    }

    #[test]
    fn bad_frame_crc_reports_in_next_response() {
        let mut card = native_card();
        let mut req = Request::new(8, 0x1aa);
        req.crc ^= 0xff;
        assert!(card.do_command(req).is_empty());
        assert_eq!(card.state(), CardState::Idle);
        // The next R1-class response (APP_CMD still answers in idle)
        // carries both error bits...
        let r1 = card.do_command(Request::new(55, 0));
        assert_ne!(status_of(&r1) & proto::COM_CRC_ERROR, 0);
        assert_ne!(status_of(&r1) & proto::ILLEGAL_COMMAND, 0);
        // ...and reporting them cleared them
        card.do_command(Request::new(41, 0x00ff_8000));
        let r1 = card.do_command(Request::new(55, 0));
        assert_eq!(status_of(&r1) & proto::COM_CRC_ERROR, 0);
        assert_eq!(status_of(&r1) & proto::ILLEGAL_COMMAND, 0);
    }

    #[test]
    fn cmd8_requires_single_voltage_bit() {
        let mut card = native_card();
        // Two bits set: no response in native framing
        assert!(card.do_command(Request::new(8, 0x3aa)).is_empty());
        // One bit set: argument echoed
        let r7 = card.do_command(Request::new(8, 0x1aa));
        assert_eq!(r7.as_slice(), &[0x00, 0x00, 0x01, 0xaa]);
    }

    #[test]
    fn acmd41_enquiry_defers_power_up() {
        let mut card = native_card();
        card.do_command(Request::new(55, 0));
        let r3 = card.do_command(Request::new(41, 0));
        // Not powered up yet, delay armed, still idle
        assert_eq!(r3[0] & 0x80, 0);
        assert!(card.power_delay_pending());
        assert_eq!(card.state(), CardState::Idle);

        card.complete_power_up();
        assert!(!card.power_delay_pending());
        card.do_command(Request::new(55, 0));
        let r3 = card.do_command(Request::new(41, 0x00ff_8000));
        assert_ne!(r3[0] & 0x80, 0);
        assert_eq!(card.state(), CardState::Ready);

        // A stale timer firing later must not double-apply
        card.complete_power_up();
    }

    #[test]
    fn acmd41_real_request_powers_up_synchronously() {
        let mut card = native_card();
        card.do_command(Request::new(55, 0));
        card.do_command(Request::new(41, 0));
        assert!(card.power_delay_pending());
        // A real request before the delay fires cancels it
        card.do_command(Request::new(55, 0));
        let r3 = card.do_command(Request::new(41, 0x00ff_8000));
        assert_ne!(r3[0] & 0x80, 0);
        assert!(!card.power_delay_pending());
        card.complete_power_up();
        assert_ne!(card.ocr & OCR_POWER_UP, 0);
    }

    #[test]
    fn transfer_commands_illegal_in_idle() {
        for cmd in [6u8, 7, 12, 13, 16, 17, 18, 23, 24, 25, 28, 32, 38, 42] {
            let mut card = native_card();
            let response = card.do_command(Request::new(cmd, 0));
            assert!(response.is_empty(), "CMD{} answered from idle", cmd);
            assert_eq!(card.state(), CardState::Idle, "CMD{} moved the state", cmd);
        }
    }

    #[test]
    fn go_idle_resets_from_any_state() {
        let mut card = native_card();
        bring_to_transfer(&mut card);
        card.do_command(Request::new(0, 0));
        assert_eq!(card.state(), CardState::Idle);
        assert_eq!(card.rca, 0);
        assert_eq!(card.ocr & OCR_POWER_UP, 0);
    }

    #[test]
    fn identification_handshake() {
        let mut card = native_card();
        card.do_command(Request::new(0, 0));
        card.do_command(Request::new(8, 0x1aa));
        card.do_command(Request::new(55, 0));
        card.do_command(Request::new(41, 0x00ff_8000));

        let cid = card.do_command(Request::new(2, 0));
        assert_eq!(cid.as_slice(), &Cid::build().data);
        assert_eq!(card.state(), CardState::Identification);

        let r6 = card.do_command(Request::new(3, 0));
        assert_eq!(u16::from_be_bytes([r6[0], r6[1]]), 0x4567);
        assert_eq!(card.state(), CardState::Standby);

        // Selecting some other RCA leaves us deselected and unanswered
        let response = card.do_command(Request::new(7, 0x9999_0000));
        assert!(response.is_empty());
        assert_eq!(card.state(), CardState::Standby);

        card.do_command(Request::new(7, 0x4567_0000));
        assert_eq!(card.state(), CardState::Transfer);
    }

    #[test]
    fn set_blocklen_clamps_to_hardware_block() {
        let mut card = native_card();
        bring_to_transfer(&mut card);
        let r1 = card.do_command(Request::new(16, 1024));
        assert_ne!(status_of(&r1) & proto::BLOCK_LEN_ERROR, 0);
        assert_eq!(card.blk_len, 512);

        let r1 = card.do_command(Request::new(16, 256));
        assert_eq!(status_of(&r1) & proto::BLOCK_LEN_ERROR, 0);
        assert_eq!(card.blk_len, 256);
    }

    #[test]
    fn read_past_capacity_flags_address_error() {
        let mut card = native_card();
        bring_to_transfer(&mut card);
        let end = 64 * 1024 * 1024 - 256;
        let r1 = card.do_command(Request::new(17, end as u32));
        assert_ne!(status_of(&r1) & proto::ADDRESS_ERROR, 0);
        // No transfer was started
        assert_eq!(card.state(), CardState::Transfer);
    }

    #[test]
    fn single_block_read_round_trip() {
        let mut card = native_card();
        bring_to_transfer(&mut card);
        card.do_command(Request::new(17, 512));
        assert!(card.data_ready());
        for i in 0..512usize {
            assert_eq!(card.read_data(), ((512 + i) % 251) as u8);
        }
        assert_eq!(card.state(), CardState::Transfer);
    }

    #[test]
    fn erase_without_range_is_a_sequence_error() {
        let mut card = native_card();
        bring_to_transfer(&mut card);
        let r1b = card.do_command(Request::new(38, 0));
        assert_ne!(status_of(&r1b) & proto::ERASE_SEQ_ERROR, 0);
    }

    #[test]
    fn erase_clears_pending_range() {
        let mut card = native_card();
        bring_to_transfer(&mut card);
        card.do_command(Request::new(32, 512));
        card.do_command(Request::new(33, 4096));
        card.do_command(Request::new(38, 0));
        assert_eq!(card.erase_start, 0);
        assert_eq!(card.erase_end, 0);
        // A second ERASE now fails the sequence check
        let r1b = card.do_command(Request::new(38, 0));
        assert_ne!(status_of(&r1b) & proto::ERASE_SEQ_ERROR, 0);
    }

    #[test]
    fn function_switch_reports_group_selection() {
        let mut card = native_card();
        bring_to_transfer(&mut card);
        // Check mode: the second group asks for function 2
        card.do_command(Request::new(6, 0x0000_0020));
        assert!(card.data_ready());
        let mut block = [0u8; 64];
        for byte in block.iter_mut() {
            *byte = card.read_data();
        }
        assert_eq!(card.state(), CardState::Transfer);
        assert_eq!(block[0], 0x00);
        assert_eq!(block[1], 0x01);
        // Per the modelled hardware, the odd group's nibble lands on top
        // of the even group's in each selection byte
        assert_eq!(block[14], 0x20);
        assert_eq!(block[15], 0x00);
        // Check mode must not have stored anything
        assert_eq!(card.function_group, [0; 6]);

        // Set mode commits the selections
        card.do_command(Request::new(6, 0x8000_0022));
        for _ in 0..64 {
            card.read_data();
        }
        assert_eq!(card.function_group[0], 2);
        assert_eq!(card.function_group[1], 2);
        assert_eq!(card.function_group[2], 0);
    }

    #[test]
    fn disabled_card_ignores_everything() {
        let mut card = native_card();
        card.set_enabled(false);
        assert!(card.do_command(Request::new(0, 0)).is_empty());
        assert_eq!(card.read_data(), 0);
        card.write_data(0xff);
        card.set_enabled(true);
        assert!(!card.do_command(Request::new(8, 0x1aa)).is_empty());
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
