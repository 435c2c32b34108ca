//! Autoresponder rules
//!
//! Every received frame is answered:
//!
//! - id [`TRIGGER_ID`] gets the scripted [`HANDSHAKE`] burst (five frames,
//!   fixed order),
//! - any other id gets one echo frame with the same id and 8 random bytes.
//!
//! Outgoing frames then pass through [`rewrite_address`] right before they
//! are written to the bus.

use canmon_core::CanFrame;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

/// Inbound id that triggers the handshake burst
pub const TRIGGER_ID: u32 = 0x0490_4000;

/// Scripted reply to [`TRIGGER_ID`], in transmit order
pub const HANDSHAKE: [(u32, [u8; 8]); 5] = [
    (0x1800_8040, [0x01, 0x40, 0x41, 0x4A, 0x0D, 0x17, 0xFF, 0xC0]),
    (0x1801_8040, [0x0A, 0x00, 0xFF, 0x00, 0x00, 0x00, 0x00, 0x00]),
    (0x1806_8040, [0x00; 8]),
    (0x1807_8040, [0x00; 8]),
    (0x1808_8040, [0x00; 8]),
];

/// Bits compared by the address rewrite
pub const REWRITE_MASK: u32 = 0x1FFF_00FF;
/// Masked value that selects a frame for rewriting (`18A2xxF6`)
pub const REWRITE_MATCH: u32 = 0x18A2_00F6;
/// Base id of rewritten frames; the low byte comes from bits 8-15 of the input id
pub const REWRITE_BASE: u32 = 0x18B0_F600;

/// Map `18A2xxF6` ids to `18B0F6xx`; everything else passes through
pub fn rewrite_address(id: u32) -> u32 {
    if id & REWRITE_MASK == REWRITE_MATCH {
        REWRITE_BASE | ((id & 0x0000_FF00) >> 8)
    } else {
        id
    }
}

/// [`rewrite_address`] applied to a frame, keeping payload and frame type
pub fn rewrite_frame(frame: CanFrame) -> CanFrame {
    let id = rewrite_address(frame.id());
    if id == frame.id() {
        frame
    } else {
        frame.with_id(id)
    }
}

/// Decides which frames to send in reply to a received frame
pub struct Responder<R = StdRng> {
    rng: R,
}

impl Responder<StdRng> {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }
}

impl Default for Responder<StdRng> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: RngCore> Responder<R> {
    pub fn with_rng(rng: R) -> Self {
        Self { rng }
    }

    /// Reply frames for `inbound`, before address rewriting
    pub fn respond(&mut self, inbound: &CanFrame) -> Vec<CanFrame> {
        let extended = inbound.is_extended();

        if inbound.id() == TRIGGER_ID {
            return HANDSHAKE
                .iter()
                .map(|(id, data)| CanFrame::with_payload(*id, extended, *data))
                .collect();
        }

        let mut data = [0u8; 8];
        self.rng.fill_bytes(&mut data);
        vec![CanFrame::with_payload(inbound.id(), extended, data)]
    }

    /// Reply frames for `inbound`, ready for transmission
    pub fn outgoing(&mut self, inbound: &CanFrame) -> Vec<CanFrame> {
        self.respond(inbound)
            .into_iter()
            .map(rewrite_frame)
            .collect()
    }
}
