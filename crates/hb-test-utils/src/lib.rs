// hb-test-utils: Shared test utilities for the HomeBrew master suite.
//
// Provides a mock repeater that speaks the real wire protocol over a real
// UDP socket, for integration testing of the master service.

pub mod mock_repeater;

pub use mock_repeater::MockRepeater;

use hb_protocol::{Dmrd, RepeaterId};

/// Build a raw `DMRD` datagram for tests.
#[allow(clippy::too_many_arguments)]
pub fn dmrd_frame(
    repeater: u32,
    rf_src: u32,
    dst_id: u32,
    stream_id: u32,
    slot2: bool,
    group: bool,
    terminator: bool,
    sequence: u8,
) -> Vec<u8> {
    let control = (u8::from(slot2) << 7)
        | (u8::from(group) << 6)
        | if terminator { 0x22 } else { 0x00 };
    Dmrd {
        sequence,
        rf_src,
        dst_id,
        repeater_id: RepeaterId(repeater),
        control,
        stream_id,
        payload: [0xA5; 33],
    }
    .to_bytes()
    .to_vec()
}
