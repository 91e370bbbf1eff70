//! DH+ fingerprinting.
//!
//! A single payload that passes the header check proves little: any six
//! random bytes with two small distinct values up front will do. Confidence
//! only grows when repeated observations keep reusing the same few nodes.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::protocols::{is_known_command, tier, DetectionConfidence, REPLY_BIT};

pub const DHPLUS_HEADER_LEN: usize = 6;
pub const MAX_NODE: u8 = 63;

const MAX_LOCAL_STATUS: u8 = 0x08;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DhPlusHeader {
    pub dst_node: u8,
    pub src_node: u8,
    pub command: u8,
    pub status: u8,
    pub tns: u16,
}

impl DhPlusHeader {
    pub fn is_reply(&self) -> bool {
        self.command & REPLY_BIT != 0
    }
}

/// Decoded DH+ hit as carried by a protocol message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DhPlusFrame {
    pub dst_node: u8,
    pub src_node: u8,
    pub command: u8,
    pub status: u8,
    pub tns: u16,
    pub data: Vec<u8>,
    pub confidence: DetectionConfidence,
}

impl DhPlusFrame {
    pub fn new(header: DhPlusHeader, payload: &[u8], confidence: DetectionConfidence) -> Self {
        Self {
            dst_node: header.dst_node,
            src_node: header.src_node,
            command: header.command,
            status: header.status,
            tns: header.tns,
            data: payload.get(DHPLUS_HEADER_LEN..).unwrap_or_default().to_vec(),
            confidence,
        }
    }

    pub fn describe(&self) -> String {
        format!(
            "DH+ node {} -> {} cmd=0x{:02X} sts=0x{:02X} tns={} ({:?})",
            self.src_node, self.dst_node, self.command, self.status, self.tns, self.confidence
        )
    }
}

fn is_known_status(status: u8) -> bool {
    status <= MAX_LOCAL_STATUS || status & 0x0F == 0
}

/// Structural check of a single payload.
pub fn check(payload: &[u8]) -> Option<DhPlusHeader> {
    if payload.len() < DHPLUS_HEADER_LEN {
        return None;
    }
    let header = DhPlusHeader {
        dst_node: payload[0],
        src_node: payload[1],
        command: payload[2],
        status: payload[3],
        tns: u16::from_le_bytes([payload[4], payload[5]]),
    };

    if header.dst_node > MAX_NODE || header.src_node > MAX_NODE {
        return None;
    }
    if header.dst_node == header.src_node {
        return None;
    }
    if !is_known_command(header.command) || !is_known_status(header.status) {
        return None;
    }
    Some(header)
}

/// Accumulates node and command observations across packets of one flow.
#[derive(Debug, Clone, Default)]
pub struct DhPlusDetector {
    total: u64,
    valid: u64,
    nodes: BTreeSet<u8>,
    commands: BTreeMap<u8, u64>,
}

impl DhPlusDetector {
    pub fn new() -> Self { Self::default() }

    pub fn observe(&mut self, payload: &[u8]) -> Option<DhPlusHeader> {
        self.total += 1;
        let header = check(payload)?;
        self.valid += 1;
        self.nodes.insert(header.dst_node);
        self.nodes.insert(header.src_node);
        *self.commands.entry(header.command).or_insert(0) += 1;
        Some(header)
    }

    pub fn total(&self) -> u64 { self.total }
    pub fn valid(&self) -> u64 { self.valid }
    pub fn nodes(&self) -> &BTreeSet<u8> { &self.nodes }
    pub fn commands(&self) -> &BTreeMap<u8, u64> { &self.commands }

    /// Node cardinality must stay small relative to the sample count.
    fn consistent(&self) -> bool {
        self.nodes.len() as u64 <= 2 + self.valid / 2
    }

    pub fn confidence(&self) -> DetectionConfidence {
        tier(self.valid, self.consistent())
    }
}
