use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::error::{EngineError, Result};
use crate::models::*;
use crate::protocols::{Extraction, FrameExtractor};

/// Per-flow byte accumulator in front of a length-prefixed extractor.
///
/// Each canonical flow keeps one buffer per direction so that request and
/// response bytes never interleave inside a frame.
pub struct StreamReassembler {
    flows: HashMap<FlowKey, FlowState>,
    max_buffer: usize,
    resync_bytes: u64,
}

struct FlowState {
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    segment_count: u64,
    forward: Vec<u8>,
    reverse: Vec<u8>,
}

/// Frames parsed from the front of a buffer.
#[derive(Debug, Default)]
pub struct Drained {
    pub messages: Vec<ProtocolMessage>,
    pub consumed: usize,
    pub skipped: u64,
}

/// Parse as many complete frames as possible from `buf`, skipping one byte
/// whenever a header is invalid and stopping at the first incomplete frame.
pub fn drain_frames(extractor: &dyn FrameExtractor, buf: &[u8], ctx: &MessageContext) -> Drained {
    let mut out = Drained::default();

    while out.consumed < buf.len() {
        match extractor.extract(&buf[out.consumed..], ctx) {
            Extraction::Frame { message, consumed } => {
                out.messages.push(message);
                out.consumed += consumed.max(1);
            }
            Extraction::Incomplete => break,
            Extraction::Invalid => {
                out.consumed += 1;
                out.skipped += 1;
            }
        }
    }

    if out.skipped > 0 {
        tracing::debug!(
            protocol = %extractor.protocol(),
            skipped = out.skipped,
            src = %ctx.src,
            dst = %ctx.dst,
            "resynchronized after invalid header"
        );
    }
    out
}

/// Datagrams are parsed independently; trailing bytes are discarded.
pub fn extract_datagram(extractor: &dyn FrameExtractor, segment: &CapturedSegment) -> Drained {
    drain_frames(extractor, &segment.payload, &segment.context())
}

impl StreamReassembler {
    pub fn new(max_buffer: usize) -> Self {
        Self { flows: HashMap::new(), max_buffer, resync_bytes: 0 }
    }

    /// Append a TCP segment to its flow and return every frame it completed,
    /// together with the bytes retained for the next segment.
    pub fn feed(
        &mut self,
        segment: &CapturedSegment,
        extractor: &dyn FrameExtractor,
    ) -> Result<(Vec<ProtocolMessage>, &[u8])> {
        if segment.transport != Transport::Tcp {
            return Err(EngineError::TransportMismatch {
                expected: Transport::Tcp,
                got: segment.transport,
            });
        }

        let key = segment.flow_key();
        let canonical = key.canonical();
        let is_fwd = key == canonical;

        let flow = self.flows.entry(canonical).or_insert_with(|| FlowState {
            first_seen: segment.timestamp,
            last_seen: segment.timestamp,
            segment_count: 0,
            forward: Vec::new(),
            reverse: Vec::new(),
        });
        flow.last_seen = segment.timestamp;
        flow.segment_count += 1;

        let buf = if is_fwd { &mut flow.forward } else { &mut flow.reverse };
        buf.extend_from_slice(&segment.payload);

        let drained = drain_frames(extractor, buf, &segment.context());
        buf.drain(..drained.consumed);
        self.resync_bytes += drained.skipped;

        if buf.len() > self.max_buffer {
            let excess = buf.len() - self.max_buffer;
            tracing::warn!(
                flow = %key,
                discarded = excess,
                limit = self.max_buffer,
                "reassembly buffer over limit, discarding oldest bytes"
            );
            buf.drain(..excess);
            self.resync_bytes += excess as u64;
        }

        Ok((drained.messages, buf.as_slice()))
    }

    /// Bytes retained for the direction described by `key`.
    pub fn leftover(&self, key: &FlowKey) -> Result<&[u8]> {
        let canonical = key.canonical();
        let flow = self.flows.get(&canonical).ok_or(EngineError::UnknownFlow(*key))?;
        Ok(if *key == canonical { &flow.forward } else { &flow.reverse })
    }

    /// First/last segment time and segment count of a flow.
    pub fn flow_activity(&self, key: &FlowKey) -> Result<(DateTime<Utc>, DateTime<Utc>, u64)> {
        let flow = self
            .flows
            .get(&key.canonical())
            .ok_or(EngineError::UnknownFlow(*key))?;
        Ok((flow.first_seen, flow.last_seen, flow.segment_count))
    }

    pub fn flow_count(&self) -> usize { self.flows.len() }
    pub fn resync_bytes(&self) -> u64 { self.resync_bytes }

    /// Total bytes still waiting for the rest of a frame.
    pub fn pending_bytes(&self) -> usize {
        self.flows.values().map(|f| f.forward.len() + f.reverse.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::enip::{build as enip, EnipExtractor};
    use crate::protocols::modbus::{build as modbus, ModbusExtractor};
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn segment(payload: &[u8]) -> CapturedSegment {
        CapturedSegment::new(
            ts(),
            "10.1.1.2:51000".parse().unwrap(),
            "10.1.1.1:44818".parse().unwrap(),
            Transport::Tcp,
            payload,
        )
    }

    fn enip_stream() -> Vec<u8> {
        let mut bytes = vec![0xDE, 0xAD, 0xBE];
        bytes.extend(enip::register_session(0));
        bytes.extend(enip::send_unit_data(0x01, 0xABCD, 1, &[0x4C, 0x00]));
        bytes.extend([0x99]);
        bytes.extend(enip::send_rr_data(0x01, 0, &[0xCC, 0x00, 0x00, 0x00]));
        bytes
    }

    fn feed_all(chunks: &[&[u8]]) -> Vec<ProtocolMessage> {
        let extractor = EnipExtractor::default();
        let mut reassembler = StreamReassembler::new(1 << 20);
        let mut out = Vec::new();
        for chunk in chunks {
            let (messages, _) = reassembler.feed(&segment(chunk), &extractor).unwrap();
            out.extend(messages);
        }
        out
    }

    #[test]
    fn test_single_segment_with_garbage() {
        let stream = enip_stream();
        let messages = feed_all(&[&stream]);
        assert_eq!(messages.len(), 3);
        assert!(messages[0].description.starts_with("RegisterSession"));
        assert!(messages[1].description.starts_with("SendUnitData"));
        assert!(messages[2].description.starts_with("SendRRData"));
    }

    #[test]
    fn test_split_anywhere_is_idempotent() {
        let stream = enip_stream();
        let whole = feed_all(&[&stream]);
        for cut in 1..stream.len() {
            let (a, b) = stream.split_at(cut);
            assert_eq!(feed_all(&[a, b]), whole, "split at {cut}");
        }
        let bytewise: Vec<&[u8]> = stream.chunks(1).collect();
        assert_eq!(feed_all(&bytewise), whole);
    }

    #[test]
    fn test_partial_frame_is_retained() {
        let extractor = EnipExtractor::default();
        let mut reassembler = StreamReassembler::new(1 << 20);
        let frame = enip::register_session(0);

        let seg = segment(&frame[..20]);
        let (messages, leftover) = reassembler.feed(&seg, &extractor).unwrap();
        assert!(messages.is_empty());
        assert_eq!(leftover.len(), 20);
        assert_eq!(reassembler.leftover(&seg.flow_key()).unwrap().len(), 20);

        let (messages, leftover) = reassembler.feed(&segment(&frame[20..]), &extractor).unwrap();
        assert_eq!(messages.len(), 1);
        assert!(leftover.is_empty());
        assert_eq!(messages[0].raw, frame);
    }

    #[test]
    fn test_directions_do_not_mix() {
        let extractor = ModbusExtractor::default();
        let mut reassembler = StreamReassembler::new(1 << 20);
        let request = modbus::frame(1, 1, &[0x03, 0x00, 0x00, 0x00, 0x02]);
        let response = modbus::frame(1, 1, &[0x03, 0x04, 0x00, 0x2A, 0x00, 0x2B]);

        let client: std::net::SocketAddr = "10.1.1.2:51000".parse().unwrap();
        let server: std::net::SocketAddr = "10.1.1.1:502".parse().unwrap();
        let to_server = |p: &[u8]| CapturedSegment::new(ts(), client, server, Transport::Tcp, p);
        let to_client = |p: &[u8]| CapturedSegment::new(ts(), server, client, Transport::Tcp, p);

        let (m, _) = reassembler.feed(&to_server(&request[..5]), &extractor).unwrap();
        assert!(m.is_empty());
        let (m, _) = reassembler.feed(&to_client(&response), &extractor).unwrap();
        assert_eq!(m.len(), 1);
        assert!(!m[0].is_request);
        let (m, _) = reassembler.feed(&to_server(&request[5..]), &extractor).unwrap();
        assert_eq!(m.len(), 1);
        assert!(m[0].is_request);
        assert_eq!(reassembler.flow_count(), 1);
    }

    #[test]
    fn test_resync_counts_skipped_bytes() {
        let extractor = ModbusExtractor::default();
        let mut reassembler = StreamReassembler::new(1 << 20);
        let mut bytes = vec![0xFF, 0xFF, 0xFF];
        bytes.extend(modbus::frame(7, 1, &[0x06, 0x00, 0x01, 0x00, 0x03]));
        let seg = CapturedSegment::new(
            ts(),
            "10.1.1.2:51000".parse().unwrap(),
            "10.1.1.1:502".parse().unwrap(),
            Transport::Tcp,
            bytes,
        );
        let (messages, leftover) = reassembler.feed(&seg, &extractor).unwrap();
        assert_eq!(messages.len(), 1);
        assert!(leftover.is_empty());
        assert_eq!(reassembler.resync_bytes(), 3);
    }

    #[test]
    fn test_buffer_limit_discards_oldest() {
        let extractor = EnipExtractor::default();
        let mut reassembler = StreamReassembler::new(16);
        // Recognized command declaring far more data than will arrive.
        let header = enip::header(0x0070, 1000, 1, 0);
        let (messages, leftover) = reassembler.feed(&segment(&header), &extractor).unwrap();
        assert!(messages.is_empty());
        assert_eq!(leftover.len(), 16);
        assert_eq!(reassembler.pending_bytes(), 16);
    }

    #[test]
    fn test_udp_segment_rejected() {
        let extractor = EnipExtractor::default();
        let mut reassembler = StreamReassembler::new(1024);
        let mut seg = segment(&enip::register_session(0));
        seg.transport = Transport::Udp;
        assert!(matches!(
            reassembler.feed(&seg, &extractor),
            Err(EngineError::TransportMismatch { .. })
        ));
    }

    #[test]
    fn test_unknown_flow_is_error() {
        let reassembler = StreamReassembler::new(1024);
        let key = segment(&[]).flow_key();
        assert!(matches!(reassembler.leftover(&key), Err(EngineError::UnknownFlow(_))));
        assert!(reassembler.flow_activity(&key).is_err());
    }

    #[test]
    fn test_datagram_drops_trailing_bytes() {
        let mut payload = enip::register_session(0);
        payload.extend_from_slice(&[0x65, 0x00, 0x04]);
        let mut seg = segment(&payload);
        seg.transport = Transport::Udp;
        let drained = extract_datagram(&EnipExtractor::default(), &seg);
        assert_eq!(drained.messages.len(), 1);
        assert_eq!(drained.consumed, 28);
    }
}
