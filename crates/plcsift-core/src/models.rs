use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::protocols::dhplus::DhPlusFrame;
use crate::protocols::enip::EnipFrame;
use crate::protocols::modbus::ModbusFrame;

// ---------------------------------------------------------------------------
// Network primitives
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Tcp,
    Udp,
}

/// One transport-layer payload as handed over by the capture layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedSegment {
    pub timestamp: DateTime<Utc>,
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub transport: Transport,
    pub payload: Vec<u8>,
}

impl CapturedSegment {
    pub fn new(
        timestamp: DateTime<Utc>,
        src: SocketAddr,
        dst: SocketAddr,
        transport: Transport,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self { timestamp, src, dst, transport, payload: payload.into() }
    }

    pub fn flow_key(&self) -> FlowKey {
        FlowKey {
            src_ip: self.src.ip(),
            dst_ip: self.dst.ip(),
            src_port: self.src.port(),
            dst_port: self.dst.port(),
            transport: self.transport,
        }
    }

    pub fn context(&self) -> MessageContext {
        MessageContext {
            timestamp: self.timestamp,
            src: self.src,
            dst: self.dst,
            transport: self.transport,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowKey {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub transport: Transport,
}

impl FlowKey {
    pub fn reversed(&self) -> Self {
        Self {
            src_ip: self.dst_ip,
            dst_ip: self.src_ip,
            src_port: self.dst_port,
            dst_port: self.src_port,
            transport: self.transport,
        }
    }

    /// Both directions of a conversation map to the same canonical key.
    pub fn canonical(&self) -> Self {
        if (self.src_ip, self.src_port) <= (self.dst_ip, self.dst_port) {
            *self
        } else {
            self.reversed()
        }
    }

    pub fn src(&self) -> SocketAddr { SocketAddr::new(self.src_ip, self.src_port) }
    pub fn dst(&self) -> SocketAddr { SocketAddr::new(self.dst_ip, self.dst_port) }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {} -> {}", self.transport, self.src(), self.dst())
    }
}

// ---------------------------------------------------------------------------
// Protocol messages: the unified output of every extractor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Enip,
    Modbus,
    DhPlus,
    Unknown,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Protocol::Enip => "ENIP",
            Protocol::Modbus => "Modbus",
            Protocol::DhPlus => "DH+",
            Protocol::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

/// Where and when the bytes of a message were observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageContext {
    pub timestamp: DateTime<Utc>,
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub transport: Transport,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "protocol", content = "frame", rename_all = "snake_case")]
pub enum MessagePayload {
    Enip(EnipFrame),
    Modbus(ModbusFrame),
    DhPlus(DhPlusFrame),
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProtocolMessage {
    pub timestamp: DateTime<Utc>,
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub transport: Transport,
    pub is_request: bool,
    pub description: String,
    pub raw: Vec<u8>,
    pub payload: MessagePayload,
}

impl ProtocolMessage {
    pub fn new(
        ctx: &MessageContext,
        is_request: bool,
        description: impl Into<String>,
        raw: &[u8],
        payload: MessagePayload,
    ) -> Self {
        Self {
            timestamp: ctx.timestamp,
            src: ctx.src,
            dst: ctx.dst,
            transport: ctx.transport,
            is_request,
            description: description.into(),
            raw: raw.to_vec(),
            payload,
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self.payload {
            MessagePayload::Enip(_) => Protocol::Enip,
            MessagePayload::Modbus(_) => Protocol::Modbus,
            MessagePayload::DhPlus(_) => Protocol::DhPlus,
            MessagePayload::Unknown => Protocol::Unknown,
        }
    }

    pub fn as_enip(&self) -> Option<&EnipFrame> {
        match &self.payload {
            MessagePayload::Enip(frame) => Some(frame),
            _ => None,
        }
    }

    pub fn as_modbus(&self) -> Option<&ModbusFrame> {
        match &self.payload {
            MessagePayload::Modbus(frame) => Some(frame),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Summary counters handed to reporting
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProtocolSummary {
    pub enip: u64,
    pub modbus: u64,
    pub dhplus: u64,
    pub unknown: u64,
    pub dropped_segments: u64,
    pub resync_bytes: u64,
    pub by_dst_port: BTreeMap<u16, u64>,
}

impl ProtocolSummary {
    pub fn record(&mut self, protocol: Protocol) {
        match protocol {
            Protocol::Enip => self.enip += 1,
            Protocol::Modbus => self.modbus += 1,
            Protocol::DhPlus => self.dhplus += 1,
            Protocol::Unknown => self.unknown += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.enip + self.modbus + self.dhplus + self.unknown
    }
}
