use crate::config::PortConfig;
use crate::models::*;

/// Where a captured segment goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Enip,
    Modbus,
    /// No well-known port on either side; fingerprint detectors decide.
    Heuristic,
    /// Nothing to decode.
    Drop,
}

/// Port-based classifier in front of the extractors.
///
/// Also owns the capture-wide [`ProtocolSummary`] since every segment and
/// every emitted message passes through it.
pub struct FrameDemultiplexer {
    enip_ports: Vec<u16>,
    modbus_ports: Vec<u16>,
    summary: ProtocolSummary,
}

impl FrameDemultiplexer {
    pub fn new(ports: &PortConfig) -> Self {
        Self {
            enip_ports: ports.enip.clone(),
            modbus_ports: ports.modbus.clone(),
            summary: ProtocolSummary::default(),
        }
    }

    fn classify(&self, port: u16) -> Option<Route> {
        if self.enip_ports.contains(&port) {
            Some(Route::Enip)
        } else if self.modbus_ports.contains(&port) {
            Some(Route::Modbus)
        } else {
            None
        }
    }

    /// Destination port first, then source port.
    pub fn route(&mut self, segment: &CapturedSegment) -> Route {
        if segment.payload.is_empty() {
            self.summary.dropped_segments += 1;
            return Route::Drop;
        }

        *self.summary.by_dst_port.entry(segment.dst.port()).or_insert(0) += 1;

        self.classify(segment.dst.port())
            .or_else(|| self.classify(segment.src.port()))
            .unwrap_or(Route::Heuristic)
    }

    /// Count messages produced downstream of this demultiplexer.
    pub fn record(&mut self, messages: &[ProtocolMessage]) {
        for message in messages {
            self.summary.record(message.protocol());
        }
    }

    pub fn record_unknown(&mut self) {
        self.summary.unknown += 1;
    }

    pub fn add_resync_bytes(&mut self, bytes: u64) {
        self.summary.resync_bytes += bytes;
    }

    pub fn summary(&self) -> &ProtocolSummary { &self.summary }
    pub fn into_summary(self) -> ProtocolSummary { self.summary }
}
