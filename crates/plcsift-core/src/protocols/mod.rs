//! Wire-format extractors and fingerprint detectors.
//!
//! | Module   | Protocol          | Framing                          |
//! |----------|-------------------|----------------------------------|
//! | `enip`   | EtherNet/IP + CPF | 24-byte encapsulation header     |
//! | `modbus` | Modbus/TCP        | 7-byte MBAP header               |
//! | `pccc`   | PCCC              | heuristic, inside CIP data       |
//! | `dhplus` | DH+               | heuristic, 6-byte node header    |
//!
//! Length-prefixed protocols implement [`FrameExtractor`] and are driven by
//! the stream reassembler. Heuristic protocols are stateful detectors whose
//! confidence grows with consistent observations.

pub mod dhplus;
pub mod enip;
pub mod modbus;
pub mod pccc;

use serde::{Deserialize, Serialize};

use crate::models::{MessageContext, Protocol, ProtocolMessage};

// ---------------------------------------------------------------------------
// Frame extraction
// ---------------------------------------------------------------------------

/// Result of one attempt to parse a frame from the front of a buffer.
#[derive(Debug, Clone)]
pub enum Extraction {
    /// A complete frame occupying the first `consumed` bytes.
    Frame { message: ProtocolMessage, consumed: usize },
    /// The header is plausible but the declared frame is not fully buffered yet.
    Incomplete,
    /// The header fails a hard constraint; the caller skips one byte.
    Invalid,
}

pub trait FrameExtractor {
    fn protocol(&self) -> Protocol;

    /// Never fails: malformed input maps to `Invalid`, short input to `Incomplete`.
    fn extract(&self, buf: &[u8], ctx: &MessageContext) -> Extraction;
}

// ---------------------------------------------------------------------------
// Heuristic detection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum DetectionConfidence {
    #[default]
    None,
    Low,
    Medium,
    High,
}

pub(crate) const MEDIUM_OBSERVATIONS: u64 = 3;
pub(crate) const HIGH_OBSERVATIONS: u64 = 10;

/// Bit set on PCCC and DH+ command bytes in replies.
pub(crate) const REPLY_BIT: u8 = 0x40;

/// Command bytes shared by PCCC and DH+ (reply bit masked off).
const PCCC_COMMANDS: &[u8] = &[0x01, 0x02, 0x04, 0x05, 0x06, 0x07, 0x08, 0x0F];

pub(crate) fn is_known_command(cmd: u8) -> bool {
    cmd & 0x80 == 0 && PCCC_COMMANDS.contains(&(cmd & !REPLY_BIT))
}

/// Confidence tier for `valid` structurally valid observations.
pub(crate) fn tier(valid: u64, consistent: bool) -> DetectionConfidence {
    match valid {
        0 => DetectionConfidence::None,
        v if v >= HIGH_OBSERVATIONS && consistent => DetectionConfidence::High,
        v if v >= MEDIUM_OBSERVATIONS && consistent => DetectionConfidence::Medium,
        _ => DetectionConfidence::Low,
    }
}
