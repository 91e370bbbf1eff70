//! PCCC fingerprinting for payloads tunneled through CIP connected data.

use serde::{Deserialize, Serialize};

use crate::protocols::{is_known_command, tier, DetectionConfidence};

pub const PCCC_MIN_LEN: usize = 4;
const EXTENDED_COMMAND: u8 = 0x0F;
const EXTENDED_STATUS: u8 = 0xF0;
const MAX_PLAIN_STATUS: u8 = 0x1F;

const EXECUTE_PCCC_REQUEST: u8 = 0x4B;
const EXECUTE_PCCC_REPLY: u8 = 0xCB;

/// Function codes valid after the extended (0x0F) command.
const FUNCTION_CODES: &[u8] = &[
    0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x11, 0x12, 0x17, 0x18,
    0x26, 0x29, 0x3A, 0x41, 0x50, 0x52, 0x53, 0x55, 0x57, 0x5E, 0x67, 0x68, 0x79, 0x80, 0x81,
    0x82, 0x88, 0xA1, 0xA2, 0xA7, 0xA9, 0xAA, 0xAB, 0xAF,
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PcccHeader {
    pub command: u8,
    pub status: u8,
    pub tns: u16,
    pub function: Option<u8>,
}

impl PcccHeader {
    /// Histogram key: the function code for extended commands, else the command.
    pub fn opcode(&self) -> u8 {
        self.function.unwrap_or(self.command)
    }
}

/// Structural check of a single payload.
pub fn check(payload: &[u8]) -> Option<PcccHeader> {
    if payload.len() < PCCC_MIN_LEN {
        return None;
    }
    let command = payload[0];
    let status = payload[1];
    if !is_known_command(command) {
        return None;
    }
    if status > MAX_PLAIN_STATUS && status != EXTENDED_STATUS {
        return None;
    }

    let function = if command == EXTENDED_COMMAND {
        let fnc = *payload.get(4)?;
        if !FUNCTION_CODES.contains(&fnc) {
            return None;
        }
        Some(fnc)
    } else {
        None
    };

    Some(PcccHeader {
        command,
        status,
        tns: u16::from_le_bytes([payload[2], payload[3]]),
        function,
    })
}

/// Skip the CIP Execute PCCC envelope and requestor ID when present.
///
/// Returns `None` when `cip` is not an Execute PCCC request or reply, or when
/// the envelope is truncated.
pub fn unwrap_execute_pccc(cip: &[u8]) -> Option<&[u8]> {
    let service = *cip.first()?;
    let requestor_at = match service {
        EXECUTE_PCCC_REQUEST => {
            let path_words = *cip.get(1)? as usize;
            2 + path_words * 2
        }
        EXECUTE_PCCC_REPLY => {
            let ext_words = *cip.get(3)? as usize;
            4 + ext_words * 2
        }
        _ => return None,
    };
    let requestor_len = *cip.get(requestor_at)? as usize;
    if requestor_len == 0 {
        return None;
    }
    cip.get(requestor_at + requestor_len..)
}

/// Accumulates observations across packets of one connection.
#[derive(Debug, Clone, Default)]
pub struct PcccDetector {
    total: u64,
    valid: u64,
}

impl PcccDetector {
    pub fn new() -> Self { Self::default() }

    pub fn observe(&mut self, payload: &[u8]) -> Option<PcccHeader> {
        self.total += 1;
        let header = check(payload)?;
        self.valid += 1;
        Some(header)
    }

    pub fn total(&self) -> u64 { self.total }
    pub fn valid(&self) -> u64 { self.valid }

    pub fn confidence(&self) -> DetectionConfidence {
        tier(self.valid, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORD_RANGE_READ: [u8; 10] = [0x0F, 0x00, 0x34, 0x12, 0x01, 0x00, 0x00, 0x07, 0x00, 0x00];

    #[test]
    fn test_extended_command_with_known_function() {
        let header = check(&WORD_RANGE_READ).unwrap();
        assert_eq!(header.command, 0x0F);
        assert_eq!(header.tns, 0x1234);
        assert_eq!(header.function, Some(0x01));
        assert_eq!(header.opcode(), 0x01);
    }

    #[test]
    fn test_unknown_function_rejected() {
        let mut payload = WORD_RANGE_READ;
        payload[4] = 0x99;
        assert!(check(&payload).is_none());
    }

    #[test]
    fn test_reply_statuses() {
        assert!(check(&[0x4F, 0x00, 0x34, 0x12]).is_some());
        assert!(check(&[0x4F, 0x10, 0x34, 0x12]).is_some());
        assert!(check(&[0x4F, 0xF0, 0x34, 0x12, 0x05]).is_some());
        assert!(check(&[0x4F, 0x20, 0x34, 0x12]).is_none());
    }

    #[test]
    fn test_short_or_unknown_command() {
        assert!(check(&[0x0F, 0x00]).is_none());
        assert!(check(&[0x03, 0x00, 0x00, 0x00]).is_none());
    }

    #[test]
    fn test_unwrap_execute_pccc_request() {
        // service, 2-word path, requestor id (len 7), then PCCC
        let mut cip = vec![0x4B, 0x02, 0x20, 0x67, 0x24, 0x01, 0x07, 0x4D, 0x00, 1, 2, 3, 4];
        cip.extend_from_slice(&WORD_RANGE_READ);
        assert_eq!(unwrap_execute_pccc(&cip), Some(&WORD_RANGE_READ[..]));
    }

    #[test]
    fn test_unwrap_execute_pccc_reply() {
        let mut cip = vec![0xCB, 0x00, 0x00, 0x00, 0x07, 0x4D, 0x00, 1, 2, 3, 4];
        cip.extend_from_slice(&[0x4F, 0x00, 0x34, 0x12]);
        assert_eq!(unwrap_execute_pccc(&cip), Some(&[0x4F, 0x00, 0x34, 0x12][..]));
        assert_eq!(unwrap_execute_pccc(&[0x4C, 0x02]), None);
    }

    #[test]
    fn test_detector_escalation() {
        let mut detector = PcccDetector::new();
        detector.observe(&WORD_RANGE_READ);
        assert_eq!(detector.confidence(), DetectionConfidence::Low);
        for _ in 0..9 {
            detector.observe(&WORD_RANGE_READ);
        }
        assert_eq!(detector.confidence(), DetectionConfidence::High);
        detector.observe(&[0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!((detector.total(), detector.valid()), (11, 10));
    }
}
