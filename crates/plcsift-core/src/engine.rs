//! Single-capture analysis pipeline.
//!
//! ```text
//! CapturedSegment -> demux -> reassembly + extractors ─┐
//!                          -> DH+ heuristics ──────────┴-> timeline -> midstream
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::EngineConfig;
use crate::demux::{FrameDemultiplexer, Route};
use crate::error::Result;
use crate::midstream::{MidstreamEngine, MidstreamResult};
use crate::models::*;
use crate::protocols::dhplus::{DhPlusDetector, DhPlusFrame};
use crate::protocols::enip::EnipExtractor;
use crate::protocols::modbus::ModbusExtractor;
use crate::protocols::FrameExtractor;
use crate::reassembly::{extract_datagram, StreamReassembler};
use crate::timeline::{Timeline, TimelineBuilder};

/// Everything reconstructed from one capture.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Analysis {
    pub timeline: Timeline,
    pub midstream: MidstreamResult,
    pub summary: ProtocolSummary,
}

/// Owns every stateful component for one capture. Nothing is shared between
/// analyzers.
pub struct Analyzer {
    config: EngineConfig,
    demux: FrameDemultiplexer,
    enip: EnipExtractor,
    modbus: ModbusExtractor,
    reassembler: StreamReassembler,
    dhplus: HashMap<FlowKey, DhPlusDetector>,
    timeline: TimelineBuilder,
    datagram_skipped: u64,
}

impl Analyzer {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            demux: FrameDemultiplexer::new(&config.ports),
            enip: EnipExtractor::new(&config.ports.enip),
            modbus: ModbusExtractor::new(&config.ports.modbus),
            reassembler: StreamReassembler::new(config.reassembly.max_flow_buffer),
            dhplus: HashMap::new(),
            timeline: TimelineBuilder::new(),
            datagram_skipped: 0,
            config,
        })
    }

    /// Analyze a whole capture in capture order.
    pub fn analyze<I>(config: EngineConfig, segments: I) -> Result<Analysis>
    where
        I: IntoIterator<Item = CapturedSegment>,
    {
        let mut analyzer = Self::new(config)?;
        for segment in segments {
            analyzer.process(segment)?;
        }
        Ok(analyzer.finish())
    }

    /// Route one segment and return the number of messages it produced.
    pub fn process(&mut self, segment: CapturedSegment) -> Result<usize> {
        let messages = match self.demux.route(&segment) {
            Route::Drop => return Ok(0),
            Route::Enip => self.extract(&segment, Protocol::Enip)?,
            Route::Modbus => self.extract(&segment, Protocol::Modbus)?,
            Route::Heuristic => self.heuristic(&segment),
        };

        let count = messages.len();
        self.demux.record(&messages);
        self.timeline.push_batch(messages);
        Ok(count)
    }

    fn extract(&mut self, segment: &CapturedSegment, protocol: Protocol) -> Result<Vec<ProtocolMessage>> {
        let extractor: &dyn FrameExtractor = match protocol {
            Protocol::Modbus => &self.modbus,
            _ => &self.enip,
        };

        match segment.transport {
            Transport::Tcp => {
                let (messages, _) = self.reassembler.feed(segment, extractor)?;
                Ok(messages)
            }
            Transport::Udp => {
                let drained = extract_datagram(extractor, segment);
                self.datagram_skipped += drained.skipped;
                Ok(drained.messages)
            }
        }
    }

    fn heuristic(&mut self, segment: &CapturedSegment) -> Vec<ProtocolMessage> {
        let ctx = segment.context();

        if self.config.heuristics.detect_dhplus {
            let detector = self.dhplus.entry(segment.flow_key().canonical()).or_default();
            if let Some(header) = detector.observe(&segment.payload) {
                let frame = DhPlusFrame::new(header, &segment.payload, detector.confidence());
                tracing::debug!(
                    flow = %segment.flow_key(),
                    confidence = ?frame.confidence,
                    "DH+ payload"
                );
                return vec![ProtocolMessage::new(
                    &ctx,
                    !header.is_reply(),
                    frame.describe(),
                    &segment.payload,
                    MessagePayload::DhPlus(frame),
                )];
            }
        }

        if !self.config.heuristics.keep_unknown {
            self.demux.record_unknown();
            return Vec::new();
        }

        // Servers usually sit on the lower port.
        let is_request = segment.dst.port() < segment.src.port();
        vec![ProtocolMessage::new(
            &ctx,
            is_request,
            format!("unclassified payload, {} bytes", segment.payload.len()),
            &segment.payload,
            MessagePayload::Unknown,
        )]
    }

    pub fn summary(&self) -> &ProtocolSummary {
        self.demux.summary()
    }

    pub fn finish(mut self) -> Analysis {
        self.demux
            .add_resync_bytes(self.reassembler.resync_bytes() + self.datagram_skipped);

        let timeline = self.timeline.build();
        let midstream = MidstreamEngine::reconstruct(&timeline);
        let summary = self.demux.into_summary();

        tracing::info!(
            messages = timeline.len(),
            enip = summary.enip,
            modbus = summary.modbus,
            dhplus = summary.dhplus,
            unknown = summary.unknown,
            dropped = summary.dropped_segments,
            resync_bytes = summary.resync_bytes,
            flows = self.reassembler.flow_count(),
            pending_bytes = self.reassembler.pending_bytes(),
            "analysis complete"
        );

        Analysis { timeline, midstream, summary }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midstream::{SessionConfidence, TransportClass};
    use crate::protocols::enip::build as enip;
    use crate::protocols::modbus::build as modbus;
    use crate::protocols::DetectionConfidence;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::net::SocketAddr;

    const CLIENT: &str = "192.168.10.50:51515";
    const PLC: &str = "192.168.10.10:44818";

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 14, 7, 0, 0).unwrap() + Duration::milliseconds(ms)
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn tcp(ms: i64, src: &str, dst: &str, payload: Vec<u8>) -> CapturedSegment {
        CapturedSegment::new(at(ms), addr(src), addr(dst), Transport::Tcp, payload)
    }

    fn io_payload() -> Vec<u8> {
        vec![0x4C, 0x03, 0x91, 0x04, 0x54, 0x45, 0x53, 0x54, 0x01, 0x00]
    }

    #[test]
    fn test_register_then_cyclic_send_unit_data() {
        let mut segments = vec![
            tcp(0, CLIENT, PLC, enip::register_session(0)),
            tcp(1, PLC, CLIENT, enip::register_session(0x01)),
        ];
        for seq in 0..20u16 {
            let frame = enip::send_unit_data(0x01, 0xABCD, seq, &io_payload());
            segments.push(tcp(10 + seq as i64 * 10, CLIENT, PLC, frame));
        }

        let analysis = Analyzer::analyze(EngineConfig::default(), segments).unwrap();

        let session = analysis.midstream.session(0x01).unwrap();
        assert_eq!(session.confidence, SessionConfidence::Full);
        assert_eq!(session.client, Some(addr(CLIENT)));
        assert_eq!(session.server, Some(addr(PLC)));

        let conn = analysis.midstream.connection(0xABCD).unwrap();
        assert_eq!(conn.packet_count, 20);
        assert_eq!(conn.transport_class, TransportClass::Class3);
        let rpi = conn.estimated_rpi.unwrap();
        assert!(rpi >= std::time::Duration::from_millis(5));
        assert!(rpi <= std::time::Duration::from_millis(15));
        assert_eq!(conn.estimated_data_size, io_payload().len() + 2);
        assert_eq!(conn.session_id, 0x01);
        assert!(conn.confidence > 0.0 && conn.confidence <= 1.0);

        assert_eq!(analysis.timeline.len(), 22);
        assert_eq!(analysis.summary.enip, 22);
        assert_eq!(analysis.midstream.total_packets, 22);
    }

    #[test]
    fn test_midstream_only_capture() {
        let segments = (0..5u16).map(|seq| {
            tcp(seq as i64 * 20, CLIENT, PLC, enip::send_unit_data(0x42, 0x10, seq, &io_payload()))
        });
        let analysis = Analyzer::analyze(EngineConfig::default(), segments).unwrap();
        let session = analysis.midstream.session(0x42).unwrap();
        assert_eq!(session.confidence, SessionConfidence::Midstream);
        assert_eq!(session.packet_count, 5);
    }

    #[test]
    fn test_split_frame_takes_completing_timestamp() {
        let frame = enip::register_session(0x07);
        let mut analyzer = Analyzer::new(EngineConfig::default()).unwrap();
        assert_eq!(analyzer.process(tcp(0, PLC, CLIENT, frame[..10].to_vec())).unwrap(), 0);
        assert_eq!(analyzer.process(tcp(5, PLC, CLIENT, frame[10..].to_vec())).unwrap(), 1);
        let analysis = analyzer.finish();
        assert_eq!(analysis.timeline.messages()[0].timestamp, at(5));
        assert_eq!(analysis.timeline.messages()[0].raw, frame);
    }

    #[test]
    fn test_flows_interleave_by_time() {
        let segments = vec![
            tcp(30, CLIENT, PLC, enip::register_session(0x09)),
            tcp(10, "10.0.0.5:40000", "10.0.0.6:502", modbus::frame(1, 1, &[0x03, 0, 0, 0, 1])),
            tcp(20, "10.0.0.6:502", "10.0.0.5:40000", modbus::frame(1, 1, &[0x03, 2, 0, 7])),
        ];
        let analysis = Analyzer::analyze(EngineConfig::default(), segments).unwrap();
        let order: Vec<Protocol> = analysis.timeline.iter().map(|m| m.protocol()).collect();
        assert_eq!(order, vec![Protocol::Modbus, Protocol::Modbus, Protocol::Enip]);
        assert_eq!(analysis.summary.modbus, 2);
        assert_eq!(analysis.summary.by_dst_port.get(&502), Some(&1));
        assert_eq!(analysis.summary.by_dst_port.get(&40000), Some(&1));
    }

    #[test]
    fn test_dhplus_heuristic_path() {
        let payload = vec![0x05, 0x01, 0x0F, 0x00, 0x10, 0x00, 0xA2, 0x02];
        let segments: Vec<_> = (0..3)
            .map(|i| tcp(i * 100, "172.16.0.2:2001", "172.16.0.3:2002", payload.clone()))
            .chain(std::iter::once(tcp(400, "172.16.0.2:2001", "172.16.0.3:2002", vec![0xFF; 8])))
            .collect();
        let analysis = Analyzer::analyze(EngineConfig::default(), segments).unwrap();

        assert_eq!(analysis.summary.dhplus, 3);
        assert_eq!(analysis.summary.unknown, 1);
        assert_eq!(analysis.timeline.len(), 3);
        let confidences: Vec<DetectionConfidence> = analysis
            .timeline
            .filter(Protocol::DhPlus)
            .filter_map(|m| match &m.payload {
                MessagePayload::DhPlus(frame) => Some(frame.confidence),
                _ => None,
            })
            .collect();
        assert_eq!(
            confidences,
            vec![DetectionConfidence::Low, DetectionConfidence::Low, DetectionConfidence::Medium]
        );
    }

    #[test]
    fn test_keep_unknown_emits_messages() {
        let mut config = EngineConfig::default();
        config.heuristics.keep_unknown = true;
        config.heuristics.detect_dhplus = false;
        let segments = vec![tcp(0, "10.9.9.9:55000", "10.9.9.8:80", b"GET /".to_vec())];
        let analysis = Analyzer::analyze(config, segments).unwrap();
        assert_eq!(analysis.timeline.len(), 1);
        let message = &analysis.timeline.messages()[0];
        assert_eq!(message.protocol(), Protocol::Unknown);
        assert!(message.is_request);
        assert_eq!(analysis.summary.unknown, 1);
    }

    #[test]
    fn test_udp_datagrams_are_independent() {
        let mut first = enip::register_session(0x03);
        first.truncate(26);
        let segments = vec![
            CapturedSegment::new(at(0), addr(CLIENT), addr("192.168.10.10:2222"), Transport::Udp, first),
            CapturedSegment::new(
                at(1),
                addr(CLIENT),
                addr("192.168.10.10:2222"),
                Transport::Udp,
                enip::register_session(0x03),
            ),
        ];
        let analysis = Analyzer::analyze(EngineConfig::default(), segments).unwrap();
        assert_eq!(analysis.summary.enip, 1);
        assert_eq!(analysis.timeline.messages()[0].timestamp, at(1));
    }

    #[test]
    fn test_empty_segments_dropped() {
        let segments = vec![tcp(0, CLIENT, PLC, Vec::new())];
        let analysis = Analyzer::analyze(EngineConfig::default(), segments).unwrap();
        assert!(analysis.timeline.is_empty());
        assert_eq!(analysis.summary.dropped_segments, 1);
    }

    #[test]
    fn test_resync_bytes_reported() {
        let mut bytes = vec![0x00, 0x11, 0x22];
        bytes.extend(modbus::frame(4, 1, &[0x06, 0x00, 0x01, 0x00, 0x03]));
        let segments = vec![tcp(0, "10.0.0.5:40000", "10.0.0.6:502", bytes)];
        let analysis = Analyzer::analyze(EngineConfig::default(), segments).unwrap();
        assert_eq!(analysis.summary.modbus, 1);
        assert_eq!(analysis.summary.resync_bytes, 3);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = EngineConfig::default();
        config.reassembly.max_flow_buffer = 0;
        assert!(Analyzer::new(config).is_err());
    }

    #[test]
    fn test_analysis_serializes() {
        let segments = vec![
            tcp(0, PLC, CLIENT, enip::register_session(0x01)),
            tcp(10, CLIENT, PLC, enip::send_unit_data(0x01, 0xABCD, 1, &io_payload())),
        ];
        let analysis = Analyzer::analyze(EngineConfig::default(), segments).unwrap();
        let json = serde_json::to_string(&analysis).unwrap();
        assert!(json.contains("\"session_id\":1"));
        assert!(json.contains("\"protocol\":\"enip\""));
        let back: Analysis = serde_json::from_str(&json).unwrap();
        assert_eq!(back.timeline.len(), 2);
    }
}
