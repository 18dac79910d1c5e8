//! # sdmmc-card
//!
//! > An SD Memory Card emulation written in Embedded Rust
//!
//! This crate implements the *card* side of the SD/MMC command protocol, as
//! defined in the SD Memory Card Physical Layer Specification v1.10 (plus
//! the early v2.0 additions needed for SDHC capacities). Point it at
//! something that implements the [`BlockBackend`] trait and it behaves like
//! an SD card wired to your bus: feed it command frames, clock data bytes in
//! and out, and it keeps the registers, status bits and state machine that a
//! real host driver expects, bit for bit.
//!
//! It is intended for use inside machine emulators and host-controller test
//! benches - anywhere you need a believable card on the other end of the
//! wire. It is `#![no_std]` (with `alloc` for the capacity-sized
//! write-protection bitmap) so it can also run inside firmware-level test
//! harnesses.
//!
//! ## Using the crate
//!
//! ```rust
//! use sdmmc_card::{BlockBackend, Card, Request};
//!
//! fn example<B: BlockBackend>(backend: B) {
//!     // `false` selects native SD framing; `true` selects SPI framing.
//!     let mut card = Card::new(backend, false);
//!     // Host sends GO_IDLE_STATE...
//!     let response = card.do_command(Request::new(0, 0));
//!     assert!(response.is_empty());
//!     // ...and carries on with the usual identification dance (CMD8,
//!     // ACMD41, CMD2, CMD3, CMD7) before moving data.
//! }
//! ```
//!
//! The host-facing contract is deliberately small:
//!
//! * [`Card::do_command`] - dispatch one command frame, get the response
//!   bytes (empty for R0/illegal).
//! * [`Card::read_data`] / [`Card::write_data`] - move one byte of an active
//!   data transfer.
//! * [`Card::data_ready`] - true while the card has data to clock out.
//! * [`Card::complete_power_up`] - the host's deferred timer callback for
//!   the ACMD41 power-up delay.
//! * [`Card::save_state`] / [`Card::restore_state`] - snapshot and restore
//!   the whole card, for migration-style use.
//!
//! All protocol-level errors are reported in-band through card-status bits,
//! exactly as on real hardware; nothing here panics at the host.
//!
//! ## Features
//!
//! * `log`: Enabled by default. Generates log messages using the `log`
//!   crate.
//! * `defmt-log`: By turning off the default features and enabling the
//!   `defmt-log` feature you can configure this crate to log messages over
//!   defmt instead.
//!
//! You cannot enable both the `log` feature and the `defmt-log` feature.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[cfg(test)]
#[macro_use]
extern crate hex_literal;

#[macro_use]
mod structure;

pub mod blockdevice;
pub mod card;
pub mod proto;
pub mod registers;
pub mod snapshot;

pub use blockdevice::{BlockBackend, BLOCK_LEN, BLOCK_LEN_U32, BLOCK_LEN_U64};
pub use card::{Card, CardMode, CardState, Request, Response};
pub use snapshot::RestoreError;

#[cfg(all(feature = "defmt-log", feature = "log"))]
compile_error!("Cannot enable both log and defmt-log");

#[cfg(feature = "log")]
use log::{debug, trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, trace, warn};

#[cfg(all(not(feature = "defmt-log"), not(feature = "log")))]
#[macro_export]
/// Like log::debug! but does nothing at all
macro_rules! debug {
    ($($arg:tt)+) => {};
}

#[cfg(all(not(feature = "defmt-log"), not(feature = "log")))]
#[macro_export]
/// Like log::trace! but does nothing at all
macro_rules! trace {
    ($($arg:tt)+) => {};
}

#[cfg(all(not(feature = "defmt-log"), not(feature = "log")))]
#[macro_export]
/// Like log::warn! but does nothing at all
macro_rules! warn {
    ($($arg:tt)+) => {};
}
