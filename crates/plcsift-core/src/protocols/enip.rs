//! EtherNet/IP encapsulation and Common Packet Format decoding.
//!
//! Devices in the field disagree on header byte order, so every header is
//! tried as little-endian first (the ODVA order) and big-endian second.

use serde::{Deserialize, Serialize};

use crate::models::{MessageContext, MessagePayload, Protocol, ProtocolMessage, Transport};
use crate::protocols::{Extraction, FrameExtractor};

pub const ENIP_HEADER_LEN: usize = 24;
/// Interface handle (4) + timeout (2) ahead of the CPF item count.
pub const CPF_PREFIX_LEN: usize = 6;

pub const ITEM_NULL_ADDRESS: u16 = 0x0000;
pub const ITEM_LIST_IDENTITY: u16 = 0x000C;
pub const ITEM_CONNECTED_ADDRESS: u16 = 0x00A1;
pub const ITEM_CONNECTED_DATA: u16 = 0x00B1;
pub const ITEM_UNCONNECTED_DATA: u16 = 0x00B2;
pub const ITEM_SEQUENCED_ADDRESS: u16 = 0x8002;

/// High bit of a CIP service code marks a reply.
const CIP_REPLY_BIT: u8 = 0x80;

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EnipCommand {
    Nop,
    ListServices,
    ListIdentity,
    ListInterfaces,
    RegisterSession,
    UnRegisterSession,
    SendRRData,
    SendUnitData,
    IndicateStatus,
    Cancel,
}

impl EnipCommand {
    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            0x0000 => EnipCommand::Nop,
            0x0004 => EnipCommand::ListServices,
            0x0063 => EnipCommand::ListIdentity,
            0x0064 => EnipCommand::ListInterfaces,
            0x0065 => EnipCommand::RegisterSession,
            0x0066 => EnipCommand::UnRegisterSession,
            0x006F => EnipCommand::SendRRData,
            0x0070 => EnipCommand::SendUnitData,
            0x0072 => EnipCommand::IndicateStatus,
            0x0073 => EnipCommand::Cancel,
            _ => return None,
        })
    }

    pub fn code(self) -> u16 {
        match self {
            EnipCommand::Nop => 0x0000,
            EnipCommand::ListServices => 0x0004,
            EnipCommand::ListIdentity => 0x0063,
            EnipCommand::ListInterfaces => 0x0064,
            EnipCommand::RegisterSession => 0x0065,
            EnipCommand::UnRegisterSession => 0x0066,
            EnipCommand::SendRRData => 0x006F,
            EnipCommand::SendUnitData => 0x0070,
            EnipCommand::IndicateStatus => 0x0072,
            EnipCommand::Cancel => 0x0073,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EnipCommand::Nop => "NOP",
            EnipCommand::ListServices => "ListServices",
            EnipCommand::ListIdentity => "ListIdentity",
            EnipCommand::ListInterfaces => "ListInterfaces",
            EnipCommand::RegisterSession => "RegisterSession",
            EnipCommand::UnRegisterSession => "UnRegisterSession",
            EnipCommand::SendRRData => "SendRRData",
            EnipCommand::SendUnitData => "SendUnitData",
            EnipCommand::IndicateStatus => "IndicateStatus",
            EnipCommand::Cancel => "Cancel",
        }
    }

    fn carries_cpf(self) -> bool {
        matches!(self, EnipCommand::SendRRData | EnipCommand::SendUnitData)
    }

    fn carries_item_list(self) -> bool {
        matches!(
            self,
            EnipCommand::ListIdentity | EnipCommand::ListServices | EnipCommand::ListInterfaces
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    fn u16(self, b: &[u8]) -> u16 {
        match self {
            ByteOrder::Little => u16::from_le_bytes([b[0], b[1]]),
            ByteOrder::Big => u16::from_be_bytes([b[0], b[1]]),
        }
    }

    fn u32(self, b: &[u8]) -> u32 {
        match self {
            ByteOrder::Little => u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            ByteOrder::Big => u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnipHeader {
    pub command: EnipCommand,
    pub length: u16,
    pub session_id: u32,
    pub status: u32,
    pub sender_context: [u8; 8],
    pub options: u32,
    pub byte_order: ByteOrder,
}

impl EnipHeader {
    pub fn frame_len(&self) -> usize {
        ENIP_HEADER_LEN + self.length as usize
    }

    fn read(buf: &[u8], command: EnipCommand, order: ByteOrder) -> Self {
        let mut sender_context = [0u8; 8];
        sender_context.copy_from_slice(&buf[12..20]);
        Self {
            command,
            length: order.u16(&buf[2..4]),
            session_id: order.u32(&buf[4..8]),
            status: order.u32(&buf[8..12]),
            sender_context,
            options: order.u32(&buf[20..24]),
            byte_order: order,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderDecode {
    Complete(EnipHeader),
    Incomplete,
    Invalid,
}

/// Decode the encapsulation header at the front of `buf`.
///
/// Little-endian keeps precedence whenever its command code is recognized:
/// on a stream a short little-endian frame is `Incomplete` rather than
/// falling through to big-endian, so split delivery decodes identically.
/// Datagrams cannot grow, so there an unsatisfiable little-endian length
/// lets the big-endian reading be tried.
pub fn decode_header(buf: &[u8], datagram: bool) -> HeaderDecode {
    if buf.len() < 2 {
        return HeaderDecode::Incomplete;
    }

    for order in [ByteOrder::Little, ByteOrder::Big] {
        let Some(command) = EnipCommand::from_code(order.u16(&buf[0..2])) else {
            continue;
        };
        if buf.len() < ENIP_HEADER_LEN {
            return HeaderDecode::Incomplete;
        }
        let header = EnipHeader::read(buf, command, order);
        if header.frame_len() <= buf.len() {
            return HeaderDecode::Complete(header);
        }
        if !datagram {
            if header.command == EnipCommand::Nop && header.length > 0 {
                tracing::debug!(
                    declared = header.length,
                    buffered = buf.len(),
                    "holding stream for NOP body"
                );
            }
            return HeaderDecode::Incomplete;
        }
    }
    HeaderDecode::Invalid
}

// ---------------------------------------------------------------------------
// Common Packet Format
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CpfItem {
    pub type_id: u16,
    pub length: u16,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CipPayloadKind {
    Connected,
    Unconnected,
    Raw,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EncapsulatedData {
    None,
    Cpf(Vec<CpfItem>),
    /// CPF did not parse; bytes after the interface handle and timeout.
    Raw(Vec<u8>),
}

/// Parse an item-count-prefixed list of (type, length, data) items.
pub fn parse_items(data: &[u8], order: ByteOrder) -> Option<Vec<CpfItem>> {
    if data.len() < 2 {
        return None;
    }
    let count = order.u16(&data[0..2]) as usize;
    if count * 4 > data.len() - 2 {
        return None;
    }

    let mut items = Vec::with_capacity(count);
    let mut offset = 2;
    for _ in 0..count {
        if offset + 4 > data.len() {
            return None;
        }
        let type_id = order.u16(&data[offset..offset + 2]);
        let length = order.u16(&data[offset + 2..offset + 4]);
        offset += 4;
        let end = offset + length as usize;
        if end > data.len() {
            return None;
        }
        items.push(CpfItem { type_id, length, data: data[offset..end].to_vec() });
        offset = end;
    }
    Some(items)
}

/// Decode the command-specific data of SendRRData / SendUnitData.
pub fn parse_cpf(data: &[u8], order: ByteOrder) -> EncapsulatedData {
    let body = &data[data.len().min(CPF_PREFIX_LEN)..];
    match parse_items(body, order) {
        Some(items) => EncapsulatedData::Cpf(items),
        None => EncapsulatedData::Raw(body.to_vec()),
    }
}

fn decode_encapsulated(command: EnipCommand, data: &[u8], order: ByteOrder) -> EncapsulatedData {
    if command.carries_cpf() {
        return parse_cpf(data, order);
    }
    if command.carries_item_list() && !data.is_empty() {
        return match parse_items(data, order) {
            Some(items) => EncapsulatedData::Cpf(items),
            None => EncapsulatedData::Raw(data.to_vec()),
        };
    }
    EncapsulatedData::None
}

// ---------------------------------------------------------------------------
// Decoded frame
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnipFrame {
    pub command: EnipCommand,
    pub length: u16,
    pub session_id: u32,
    pub status: u32,
    pub sender_context: [u8; 8],
    pub options: u32,
    pub byte_order: ByteOrder,
    pub data: Vec<u8>,
    pub encapsulated: EncapsulatedData,
}

impl EnipFrame {
    fn new(header: EnipHeader, data: &[u8]) -> Self {
        let encapsulated = decode_encapsulated(header.command, data, header.byte_order);
        Self {
            command: header.command,
            length: header.length,
            session_id: header.session_id,
            status: header.status,
            sender_context: header.sender_context,
            options: header.options,
            byte_order: header.byte_order,
            data: data.to_vec(),
            encapsulated,
        }
    }

    pub fn items(&self) -> &[CpfItem] {
        match &self.encapsulated {
            EncapsulatedData::Cpf(items) => items,
            _ => &[],
        }
    }

    fn item(&self, type_id: u16) -> Option<&CpfItem> {
        self.items().iter().find(|i| i.type_id == type_id)
    }

    /// Connection ID from the connected (or sequenced) address item.
    pub fn connection_id(&self) -> Option<u32> {
        self.item(ITEM_CONNECTED_ADDRESS)
            .or_else(|| self.item(ITEM_SEQUENCED_ADDRESS))
            .filter(|i| i.data.len() >= 4)
            .map(|i| self.byte_order.u32(&i.data[0..4]))
    }

    pub fn connected_data(&self) -> Option<&[u8]> {
        self.item(ITEM_CONNECTED_DATA).map(|i| i.data.as_slice())
    }

    pub fn unconnected_data(&self) -> Option<&[u8]> {
        self.item(ITEM_UNCONNECTED_DATA).map(|i| i.data.as_slice())
    }

    /// CIP payloads carried by this frame, tagged by how they were found.
    pub fn cip_payloads(&self) -> Vec<(CipPayloadKind, &[u8])> {
        match &self.encapsulated {
            EncapsulatedData::Cpf(items) => items
                .iter()
                .filter_map(|i| match i.type_id {
                    ITEM_CONNECTED_DATA => Some((CipPayloadKind::Connected, i.data.as_slice())),
                    ITEM_UNCONNECTED_DATA => Some((CipPayloadKind::Unconnected, i.data.as_slice())),
                    _ => None,
                })
                .collect(),
            EncapsulatedData::Raw(bytes) => vec![(CipPayloadKind::Raw, bytes.as_slice())],
            EncapsulatedData::None => Vec::new(),
        }
    }

    fn describe(&self) -> String {
        let mut out = format!(
            "{} session=0x{:08X} status=0x{:X} len={}",
            self.command.name(),
            self.session_id,
            self.status,
            self.length
        );
        if let Some(conn) = self.connection_id() {
            out.push_str(&format!(" conn=0x{:08X}", conn));
        }
        if let Some(cip) = self.unconnected_data().and_then(|d| d.first()) {
            out.push_str(&format!(" cip_service=0x{:02X}", cip));
        }
        if matches!(self.encapsulated, EncapsulatedData::Raw(_)) {
            out.push_str(" cpf=raw");
        }
        if self.byte_order == ByteOrder::Big {
            out.push_str(" [big-endian]");
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Extractor
// ---------------------------------------------------------------------------

pub struct EnipExtractor {
    ports: Vec<u16>,
}

impl EnipExtractor {
    pub fn new(ports: &[u16]) -> Self {
        Self { ports: ports.to_vec() }
    }

    /// Request/response rule. The CIP reply bit in an unconnected payload
    /// overrides the ENIP status heuristic; it is itself only a heuristic.
    fn is_request(&self, frame: &EnipFrame, ctx: &MessageContext) -> bool {
        match frame.command {
            EnipCommand::RegisterSession => frame.session_id == 0 && frame.status == 0,
            EnipCommand::ListIdentity => {
                let from_server = self.ports.contains(&ctx.src.port());
                let to_server = self.ports.contains(&ctx.dst.port());
                match (from_server, to_server) {
                    (true, false) => false,
                    (false, true) => true,
                    _ => frame.length == 0,
                }
            }
            EnipCommand::SendRRData | EnipCommand::SendUnitData => {
                let cip_reply = frame
                    .unconnected_data()
                    .and_then(|d| d.first())
                    .is_some_and(|b| b & CIP_REPLY_BIT != 0);
                !cip_reply && frame.status == 0
            }
            _ => frame.status == 0,
        }
    }
}

impl Default for EnipExtractor {
    fn default() -> Self {
        Self::new(&[crate::config::ENIP_TCP_PORT, crate::config::ENIP_IO_PORT])
    }
}

impl FrameExtractor for EnipExtractor {
    fn protocol(&self) -> Protocol { Protocol::Enip }

    fn extract(&self, buf: &[u8], ctx: &MessageContext) -> Extraction {
        let header = match decode_header(buf, ctx.transport == Transport::Udp) {
            HeaderDecode::Complete(h) => h,
            HeaderDecode::Incomplete => return Extraction::Incomplete,
            HeaderDecode::Invalid => return Extraction::Invalid,
        };

        let end = header.frame_len();
        let frame = EnipFrame::new(header, &buf[ENIP_HEADER_LEN..end]);
        let is_request = self.is_request(&frame, ctx);
        let description = frame.describe();

        Extraction::Frame {
            message: ProtocolMessage::new(
                ctx,
                is_request,
                description,
                &buf[..end],
                MessagePayload::Enip(frame),
            ),
            consumed: end,
        }
    }
}

// ---------------------------------------------------------------------------
// Frame construction helpers for tests across the crate
// ---------------------------------------------------------------------------
