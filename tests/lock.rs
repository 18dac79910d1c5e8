//! The password lock subsystem, driven through CMD42 data phases.

mod utils;

use sdmmc_card::{proto, CardState, Request};
use utils::{bring_to_transfer, lock_data_phase, native_card, status_of};

/// Control flag bytes for the first byte of a CMD42 data block.
const SET_PWD: u8 = 0x01;
const CLR_PWD: u8 = 0x02;
const LOCK: u8 = 0x04;
const ERASE: u8 = 0x08;

#[test]
fn set_password_and_lock() {
    let mut card = native_card();
    let rca = bring_to_transfer(&mut card);
    let status_cmd = Request::new(13, u32::from(rca) << 16);

    // Set "secret" and lock in one operation
    card.do_command(Request::new(16, 8));
    lock_data_phase(&mut card, 8, &[SET_PWD | LOCK, 6, b's', b'e', b'c', b'r', b'e', b't']);
    assert_eq!(card.state(), CardState::Transfer);

    let r1 = card.do_command(status_cmd);
    assert_ne!(status_of(&r1) & proto::CARD_IS_LOCKED, 0);
    assert_eq!(status_of(&r1) & proto::LOCK_UNLOCK_FAILED, 0);

    // Data transfers are refused while locked
    assert!(card.do_command(Request::new(17, 0)).is_empty());
    let r1 = card.do_command(status_cmd);
    assert_ne!(status_of(&r1) & proto::ILLEGAL_COMMAND, 0);
    assert_ne!(status_of(&r1) & proto::CARD_IS_LOCKED, 0);
}

#[test]
fn locked_card_answers_only_the_whitelist() {
    let mut card = native_card();
    let rca = bring_to_transfer(&mut card);
    let acmd = u32::from(rca) << 16;

    card.do_command(Request::new(16, 8));
    lock_data_phase(&mut card, 8, &[SET_PWD | LOCK, 6, b's', b'e', b'c', b'r', b'e', b't']);

    // Class 0 and CMD16 still answer
    assert!(!card.do_command(Request::new(13, acmd)).is_empty());
    assert!(!card.do_command(Request::new(16, 512)).is_empty());
    // Class 2/4/5 do not
    assert!(card.do_command(Request::new(17, 0)).is_empty());
    assert!(card.do_command(Request::new(24, 0)).is_empty());
    assert!(card.do_command(Request::new(32, 512)).is_empty());
    // ACMD42 is reachable through the prefix, ACMD13 is not
    card.do_command(Request::new(55, acmd));
    assert!(!card.do_command(Request::new(42, 0)).is_empty());
    card.do_command(Request::new(55, acmd));
    assert!(card.do_command(Request::new(13, 0)).is_empty());
    assert_eq!(card.state(), CardState::Transfer);
}

#[test]
fn wrong_password_fails_and_changes_nothing() {
    let mut card = native_card();
    let rca = bring_to_transfer(&mut card);
    let status_cmd = Request::new(13, u32::from(rca) << 16);

    card.do_command(Request::new(16, 8));
    lock_data_phase(&mut card, 8, &[SET_PWD | LOCK, 6, b's', b'e', b'c', b'r', b'e', b't']);

    // Unlock attempt quoting the wrong current password
    card.do_command(Request::new(16, 14));
    let mut bad = vec![SET_PWD, 12];
    bad.extend_from_slice(b"wrongpw");
    bad.extend_from_slice(b"secre");
    lock_data_phase(&mut card, 14, &bad);

    let r1 = card.do_command(status_cmd);
    assert_ne!(status_of(&r1) & proto::LOCK_UNLOCK_FAILED, 0);
    assert_ne!(status_of(&r1) & proto::CARD_IS_LOCKED, 0);

    // The stored password still works, so it was left alone
    let mut good = vec![SET_PWD, 12];
    good.extend_from_slice(b"secret");
    good.extend_from_slice(b"secret");
    lock_data_phase(&mut card, 14, &good);
    let r1 = card.do_command(status_cmd);
    assert_eq!(status_of(&r1) & proto::LOCK_UNLOCK_FAILED, 0);
    assert_eq!(status_of(&r1) & proto::CARD_IS_LOCKED, 0);
}

#[test]
fn unlock_restores_data_access() {
    let mut card = native_card();
    bring_to_transfer(&mut card);

    card.do_command(Request::new(16, 8));
    lock_data_phase(&mut card, 8, &[SET_PWD | LOCK, 6, b's', b'e', b'c', b'r', b'e', b't']);

    // Re-quote the password (old then new) without the lock flag
    card.do_command(Request::new(16, 14));
    let mut unlock = vec![SET_PWD, 12];
    unlock.extend_from_slice(b"secret");
    unlock.extend_from_slice(b"secret");
    lock_data_phase(&mut card, 14, &unlock);

    card.do_command(Request::new(16, 512));
    card.do_command(Request::new(17, 0));
    assert_eq!(card.state(), CardState::SendingData);
}

#[test]
fn clearing_flags_without_an_operation_fails() {
    let mut card = native_card();
    let rca = bring_to_transfer(&mut card);

    // CLR_PWD combined with SET_PWD is contradictory
    card.do_command(Request::new(16, 14));
    let mut contradiction = vec![SET_PWD | CLR_PWD, 6];
    contradiction.extend_from_slice(b"secret");
    lock_data_phase(&mut card, 14, &contradiction);
    let r1 = card.do_command(Request::new(13, u32::from(rca) << 16));
    assert_ne!(status_of(&r1) & proto::LOCK_UNLOCK_FAILED, 0);
    assert_eq!(status_of(&r1) & proto::CARD_IS_LOCKED, 0);
}

#[test]
fn force_erase_unlocks_and_wipes_protection() {
    let mut card = native_card();
    let rca = bring_to_transfer(&mut card);
    let status_cmd = Request::new(13, u32::from(rca) << 16);

    // Protect a group, set a password, lock
    card.do_command(Request::new(28, 0));
    card.do_command(Request::new(16, 8));
    lock_data_phase(&mut card, 8, &[SET_PWD | LOCK, 6, b's', b'e', b'c', b'r', b'e', b't']);

    // The force-erase escape: a single-byte data phase with only the
    // erase flag
    card.do_command(Request::new(16, 1));
    lock_data_phase(&mut card, 1, &[ERASE]);

    let r1 = card.do_command(status_cmd);
    assert_eq!(status_of(&r1) & proto::LOCK_UNLOCK_FAILED, 0);
    assert_eq!(status_of(&r1) & proto::CARD_IS_LOCKED, 0);

    // The write-protection bitmap went too
    card.do_command(Request::new(16, 512));
    card.do_command(Request::new(30, 0));
    let mut wpbits = [0u8; 4];
    for byte in wpbits.iter_mut() {
        *byte = card.read_data();
    }
    assert_eq!(u32::from_le_bytes(wpbits), 0);
}

#[test]
fn force_erase_refused_when_not_locked() {
    let mut card = native_card();
    let rca = bring_to_transfer(&mut card);

    card.do_command(Request::new(16, 1));
    lock_data_phase(&mut card, 1, &[ERASE]);
    let r1 = card.do_command(Request::new(13, u32::from(rca) << 16));
    assert_ne!(status_of(&r1) & proto::LOCK_UNLOCK_FAILED, 0);
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
