//! Modbus/TCP: MBAP header followed by the PDU.

use serde::{Deserialize, Serialize};

use crate::models::{MessageContext, MessagePayload, Protocol, ProtocolMessage};
use crate::protocols::{Extraction, FrameExtractor};

pub const MBAP_HEADER_LEN: usize = 7;
pub const MAX_PDU_LEN: usize = 253;
/// Unit ID plus PDU.
const MIN_LENGTH: u16 = 2;
const MAX_LENGTH: u16 = MAX_PDU_LEN as u16 + 1;

const EXCEPTION_BIT: u8 = 0x80;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModbusFrame {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub length: u16,
    pub unit_id: u8,
    pub function_code: u8,
    pub data: Vec<u8>,
    pub is_exception: bool,
    pub exception_code: Option<u8>,
}

impl ModbusFrame {
    /// Function code with the exception bit cleared.
    pub fn function(&self) -> u8 {
        self.function_code & !EXCEPTION_BIT
    }

    fn describe(&self) -> String {
        let mut out = format!(
            "{} tid={} unit={}",
            function_name(self.function()),
            self.transaction_id,
            self.unit_id
        );
        if let Some(code) = self.exception_code {
            out.push_str(&format!(" exception={}", exception_name(code)));
        }
        out
    }
}

pub struct ModbusExtractor {
    ports: Vec<u16>,
}

impl ModbusExtractor {
    pub fn new(ports: &[u16]) -> Self {
        Self { ports: ports.to_vec() }
    }
}

impl Default for ModbusExtractor {
    fn default() -> Self {
        Self::new(&[crate::config::MODBUS_PORT])
    }
}

impl FrameExtractor for ModbusExtractor {
    fn protocol(&self) -> Protocol { Protocol::Modbus }

    fn extract(&self, buf: &[u8], ctx: &MessageContext) -> Extraction {
        if buf.len() < MBAP_HEADER_LEN {
            return Extraction::Incomplete;
        }

        let transaction_id = u16::from_be_bytes([buf[0], buf[1]]);
        let protocol_id = u16::from_be_bytes([buf[2], buf[3]]);
        let length = u16::from_be_bytes([buf[4], buf[5]]);
        let unit_id = buf[6];

        if protocol_id != 0 || !(MIN_LENGTH..=MAX_LENGTH).contains(&length) {
            return Extraction::Invalid;
        }

        // length counts the unit ID, which is already part of the header
        let end = MBAP_HEADER_LEN + length as usize - 1;
        if buf.len() < end {
            return Extraction::Incomplete;
        }

        let function_code = buf[MBAP_HEADER_LEN];
        let data = buf[MBAP_HEADER_LEN + 1..end].to_vec();
        let is_exception = function_code & EXCEPTION_BIT != 0;
        let exception_code = if is_exception { data.first().copied() } else { None };

        let frame = ModbusFrame {
            transaction_id,
            protocol_id,
            length,
            unit_id,
            function_code,
            data,
            is_exception,
            exception_code,
        };

        let is_request = self.ports.contains(&ctx.dst.port()) || !self.ports.contains(&ctx.src.port());
        let description = frame.describe();

        Extraction::Frame {
            message: ProtocolMessage::new(
                ctx,
                is_request,
                description,
                &buf[..end],
                MessagePayload::Modbus(frame),
            ),
            consumed: end,
        }
    }
}

pub fn function_name(code: u8) -> String {
    match code {
        0x01 => "Read Coils".into(),
        0x02 => "Read Discrete Inputs".into(),
        0x03 => "Read Holding Registers".into(),
        0x04 => "Read Input Registers".into(),
        0x05 => "Write Single Coil".into(),
        0x06 => "Write Single Register".into(),
        0x07 => "Read Exception Status".into(),
        0x08 => "Diagnostics".into(),
        0x0B => "Get Comm Event Counter".into(),
        0x0C => "Get Comm Event Log".into(),
        0x0F => "Write Multiple Coils".into(),
        0x10 => "Write Multiple Registers".into(),
        0x11 => "Report Server ID".into(),
        0x14 => "Read File Record".into(),
        0x15 => "Write File Record".into(),
        0x16 => "Mask Write Register".into(),
        0x17 => "Read/Write Multiple Registers".into(),
        0x18 => "Read FIFO Queue".into(),
        0x2B => "Encapsulated Interface Transport".into(),
        _ => format!("Function 0x{:02X}", code),
    }
}

fn exception_name(code: u8) -> String {
    match code {
        0x01 => "IllegalFunction".into(),
        0x02 => "IllegalDataAddress".into(),
        0x03 => "IllegalDataValue".into(),
        0x04 => "ServerDeviceFailure".into(),
        0x05 => "Acknowledge".into(),
        0x06 => "ServerDeviceBusy".into(),
        0x08 => "MemoryParityError".into(),
        0x0A => "GatewayPathUnavailable".into(),
        0x0B => "GatewayTargetFailedToRespond".into(),
        _ => format!("0x{:02X}", code),
    }
}
